//! HTTP API Module
//!
//! Read-only HTTP surface for operators: health, node status, cluster
//! membership, and takeover attempts.

mod http;

pub use http::HttpServer;
