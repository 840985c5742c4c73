//! Takeover Coordination
//!
//! Arbitration of which surviving broker takes over a failed peer's store:
//! the attempt state machine, the per-target record arena, and the liveness
//! monitor that starts attempts automatically.

pub mod coordinator;
pub mod monitor;
pub mod record;

pub use coordinator::{AttemptSnapshot, TakeoverCoordinator};
pub use monitor::{HeartbeatProbe, LivenessProbe, LivenessVerdict, TakeoverMonitor};
pub use record::{TakeoverOutcome, TakeoverPhase, TakeoverRecord};
