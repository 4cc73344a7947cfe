pub mod envelope;
pub mod event;
pub mod sse;

pub use envelope::*;
pub use event::*;
pub use sse::*;
