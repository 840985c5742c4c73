//! Cluster Control Packets
//!
//! Wire codec for the control packets brokers exchange. Every packet is a
//! fixed 36-byte big-endian header followed by a property block and an
//! opaque body:
//!
//! ```text
//! magic:u32 | version:u16 | type:u16 | props_len:u32 | body_len:u32 |
//! timestamp:i64 | xid:u64 | flags:u32
//! ```
//!
//! Properties are string-keyed scalars stored in a BTreeMap, so a packet
//! always encodes to the same bytes regardless of insertion order. A packet
//! with an unknown type tag but consistent lengths decodes successfully;
//! rejecting it is the dispatcher's call, not the codec's.

use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::collections::BTreeMap;

/// Packet magic, "WMQP"
pub const MAGIC: u32 = 0x574D_5150;

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 36;

/// Upper bound on a whole encoded packet
pub const MAX_PACKET_SIZE: usize = 4 * 1024 * 1024;

/// Flag bit: sender expects a reply
pub const FLAG_REPLY_REQUESTED: u32 = 0x1;

const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_STR: u8 = 4;

/// Control packet type registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Announce,
    Goodbye,
    TakeoverRequest,
    TakeoverGrant,
    TakeoverComplete,
    TakeoverAbort,
    /// Forward compatibility: a type tag this build does not know
    Unknown(u16),
}

impl PacketType {
    /// Wire code for this type
    pub fn code(&self) -> u16 {
        match self {
            PacketType::Announce => 1,
            PacketType::Goodbye => 2,
            PacketType::TakeoverRequest => 10,
            PacketType::TakeoverGrant => 11,
            PacketType::TakeoverComplete => 12,
            PacketType::TakeoverAbort => 13,
            PacketType::Unknown(code) => *code,
        }
    }

    /// Map a wire code to a type, preserving unknown codes
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => PacketType::Announce,
            2 => PacketType::Goodbye,
            10 => PacketType::TakeoverRequest,
            11 => PacketType::TakeoverGrant,
            12 => PacketType::TakeoverComplete,
            13 => PacketType::TakeoverAbort,
            other => PacketType::Unknown(other),
        }
    }

    /// The takeover family is only valid while HA is enabled
    pub fn is_takeover(&self) -> bool {
        matches!(
            self,
            PacketType::TakeoverRequest
                | PacketType::TakeoverGrant
                | PacketType::TakeoverComplete
                | PacketType::TakeoverAbort
        )
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketType::Announce => write!(f, "ANNOUNCE"),
            PacketType::Goodbye => write!(f, "GOODBYE"),
            PacketType::TakeoverRequest => write!(f, "TAKEOVER_REQUEST"),
            PacketType::TakeoverGrant => write!(f, "TAKEOVER_GRANT"),
            PacketType::TakeoverComplete => write!(f, "TAKEOVER_COMPLETE"),
            PacketType::TakeoverAbort => write!(f, "TAKEOVER_ABORT"),
            PacketType::Unknown(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// A property value: string-keyed scalar carried in the property block
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Str(String),
}

/// A decoded control packet
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPacket {
    pub packet_type: PacketType,
    /// Correlation id linking replies and retries to the originating exchange
    pub xid: u64,
    /// Sender clock, milliseconds since the UNIX epoch
    pub timestamp: i64,
    pub flags: u32,
    pub properties: BTreeMap<String, PropValue>,
    pub body: Vec<u8>,
}

impl ControlPacket {
    /// Create an empty packet of the given type
    pub fn new(packet_type: PacketType, xid: u64) -> Self {
        Self {
            packet_type,
            xid,
            timestamp: chrono::Utc::now().timestamp_millis(),
            flags: 0,
            properties: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn put_bool(&mut self, key: &str, value: bool) {
        self.properties.insert(key.to_string(), PropValue::Bool(value));
    }

    pub fn put_int(&mut self, key: &str, value: i32) {
        self.properties.insert(key.to_string(), PropValue::Int(value));
    }

    pub fn put_long(&mut self, key: &str, value: i64) {
        self.properties.insert(key.to_string(), PropValue::Long(value));
    }

    pub fn put_str(&mut self, key: &str, value: impl Into<String>) {
        self.properties
            .insert(key.to_string(), PropValue::Str(value.into()));
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.properties.get(key) {
            Some(PropValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.properties.get(key) {
            Some(PropValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.properties.get(key) {
            Some(PropValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Whether the sender asked for a reply
    pub fn reply_requested(&self) -> bool {
        self.flags & FLAG_REPLY_REQUESTED != 0
    }

    /// Encode to canonical wire bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let props = self.encode_properties()?;
        let total = HEADER_LEN + props.len() + self.body.len();
        if total > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(total));
        }

        let mut buf = Vec::with_capacity(total);
        buf.write_u32::<BigEndian>(MAGIC)?;
        buf.write_u16::<BigEndian>(PROTOCOL_VERSION)?;
        buf.write_u16::<BigEndian>(self.packet_type.code())?;
        buf.write_u32::<BigEndian>(props.len() as u32)?;
        buf.write_u32::<BigEndian>(self.body.len() as u32)?;
        buf.write_i64::<BigEndian>(self.timestamp)?;
        buf.write_u64::<BigEndian>(self.xid)?;
        buf.write_u32::<BigEndian>(self.flags)?;
        buf.extend_from_slice(&props);
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Decode from wire bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::PacketTruncated {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }

        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }

        let version = BigEndian::read_u16(&buf[4..6]);
        if version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let packet_type = PacketType::from_code(BigEndian::read_u16(&buf[6..8]));
        let props_len = BigEndian::read_u32(&buf[8..12]) as usize;
        let body_len = BigEndian::read_u32(&buf[12..16]) as usize;
        let timestamp = BigEndian::read_i64(&buf[16..24]);
        let xid = BigEndian::read_u64(&buf[24..32]);
        let flags = BigEndian::read_u32(&buf[32..36]);

        let total = HEADER_LEN + props_len + body_len;
        if total > MAX_PACKET_SIZE {
            return Err(Error::PacketTooLarge(total));
        }
        if buf.len() < total {
            return Err(Error::PacketTruncated {
                needed: total,
                available: buf.len(),
            });
        }
        if buf.len() > total {
            return Err(Error::Packet(format!(
                "{} trailing bytes after declared lengths",
                buf.len() - total
            )));
        }

        let properties = Self::decode_properties(&buf[HEADER_LEN..HEADER_LEN + props_len])?;
        let body = buf[HEADER_LEN + props_len..].to_vec();

        Ok(Self {
            packet_type,
            xid,
            timestamp,
            flags,
            properties,
            body,
        })
    }

    fn encode_properties(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for (key, value) in &self.properties {
            if key.len() > u16::MAX as usize {
                return Err(Error::Packet(format!(
                    "property key too long: {} bytes",
                    key.len()
                )));
            }
            buf.write_u16::<BigEndian>(key.len() as u16)?;
            buf.extend_from_slice(key.as_bytes());
            match value {
                PropValue::Bool(v) => {
                    buf.write_u8(TAG_BOOL)?;
                    buf.write_u8(*v as u8)?;
                }
                PropValue::Int(v) => {
                    buf.write_u8(TAG_INT)?;
                    buf.write_i32::<BigEndian>(*v)?;
                }
                PropValue::Long(v) => {
                    buf.write_u8(TAG_LONG)?;
                    buf.write_i64::<BigEndian>(*v)?;
                }
                PropValue::Str(v) => {
                    if v.len() > u32::MAX as usize {
                        return Err(Error::Packet(format!(
                            "property value too long: {} bytes",
                            v.len()
                        )));
                    }
                    buf.write_u8(TAG_STR)?;
                    buf.write_u32::<BigEndian>(v.len() as u32)?;
                    buf.extend_from_slice(v.as_bytes());
                }
            }
        }
        Ok(buf)
    }

    fn decode_properties(block: &[u8]) -> Result<BTreeMap<String, PropValue>> {
        let mut props = BTreeMap::new();
        let mut pos = 0usize;

        while pos < block.len() {
            take(block, pos, 2)?;
            let key_len = BigEndian::read_u16(&block[pos..pos + 2]) as usize;
            pos += 2;

            take(block, pos, key_len)?;
            let key = std::str::from_utf8(&block[pos..pos + key_len])
                .map_err(|_| Error::PropertyCorrupted("key is not valid utf-8".into()))?
                .to_string();
            pos += key_len;

            take(block, pos, 1)?;
            let tag = block[pos];
            pos += 1;

            let value = match tag {
                TAG_BOOL => {
                    take(block, pos, 1)?;
                    let v = block[pos] != 0;
                    pos += 1;
                    PropValue::Bool(v)
                }
                TAG_INT => {
                    take(block, pos, 4)?;
                    let v = BigEndian::read_i32(&block[pos..pos + 4]);
                    pos += 4;
                    PropValue::Int(v)
                }
                TAG_LONG => {
                    take(block, pos, 8)?;
                    let v = BigEndian::read_i64(&block[pos..pos + 8]);
                    pos += 8;
                    PropValue::Long(v)
                }
                TAG_STR => {
                    take(block, pos, 4)?;
                    let len = BigEndian::read_u32(&block[pos..pos + 4]) as usize;
                    pos += 4;
                    take(block, pos, len)?;
                    let v = std::str::from_utf8(&block[pos..pos + len])
                        .map_err(|_| {
                            Error::PropertyCorrupted("string value is not valid utf-8".into())
                        })?
                        .to_string();
                    pos += len;
                    PropValue::Str(v)
                }
                other => {
                    return Err(Error::PropertyCorrupted(format!(
                        "unknown value tag {} at offset {}",
                        other, pos
                    )));
                }
            };

            props.insert(key, value);
        }

        Ok(props)
    }
}

/// Bounds check inside the property block
fn take(block: &[u8], pos: usize, n: usize) -> Result<()> {
    if pos + n > block.len() {
        return Err(Error::PropertyCorrupted(format!(
            "field at offset {} runs past the property block",
            pos
        )));
    }
    Ok(())
}
