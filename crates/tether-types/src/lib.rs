pub mod id;
pub mod message;
pub mod project;
pub mod provider;
pub mod request;
pub mod session;
pub mod snapshot;

pub use message::*;
pub use project::*;
pub use provider::*;
pub use request::*;
pub use session::*;
pub use snapshot::*;

/// Milliseconds since the Unix epoch, the unit every server timestamp uses.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
