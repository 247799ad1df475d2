//! Tunnel session orchestration
//!
//! The manager owns every active relay session. Commands arrive over a
//! bounded queue and resolve strictly in order on one dispatcher task;
//! each command answers through a single-use reply slot, and session
//! state changes go out on a best-effort status feed. The cloneable
//! [`ManagerHandle`] is the only public entry point.

pub mod config;
pub mod error;
pub mod handle;
pub mod manager;
pub mod model;
pub mod registry;
pub mod status;

pub use config::ManagerConfig;
pub use error::{ManagerError, ManagerResult};
pub use handle::{ManagerHandle, CONNECT_TIMEOUT, DISCONNECT_TIMEOUT, ENQUEUE_TIMEOUT};
pub use manager::{SessionManager, CHANNEL_CAPACITY};
pub use model::{CommandAction, SessionCommand, SessionState, StatusEvent};
pub use registry::{SessionHandle, SessionRegistry};
pub use status::{StatusPublisher, STATUS_PUSH_DEADLINE};
