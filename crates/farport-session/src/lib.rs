//! Relay session primitive
//!
//! A [`RelaySession`] makes one far service reachable on a local port: it
//! owns a local TCP listener and, for every accepted connection, opens a
//! stream to the relay, proves access with the service's secret key, and
//! pumps bytes both ways. Sessions run on their own task under a
//! cancellation token owned by the caller.

pub mod config;
pub mod error;
pub mod session;

pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use session::RelaySession;
