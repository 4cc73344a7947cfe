//! Client-side sync engine for a multi-directory agent server.
//!
//! A [`GlobalStore`] tracks server-wide data, a [`DirectoryRegistry`] owns one
//! [`DirectoryStore`] per working directory, and an [`EventRouter`] applies
//! the server's event feed to both.

pub mod api;
pub mod change_bus;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod feed;
pub mod global;
pub mod http;
pub mod notify;
pub mod path;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod router;
pub mod session_sync;
pub mod sessions;

#[cfg(test)]
mod test_support;

pub use api::*;
pub use change_bus::*;
pub use config::*;
pub use directory::{DirectoryState, DirectoryStatus, DirectoryStore};
pub use engine::*;
pub use error::*;
pub use feed::*;
pub use global::*;
pub use http::*;
pub use notify::*;
pub use registry::*;
pub use retry::*;
pub use router::*;
pub use session_sync::*;
pub use sessions::*;
