//! Real-time chat synchronization engine: keeps a local message cache
//! consistent with a remote chat service across a streaming transport with a
//! request/response fallback.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod fallback;
pub mod read_state;
pub mod socket;
pub mod store;
pub mod transport;
pub mod types;

mod keepalive;

pub use config::EngineConfig;
pub use connection::{ConnectionHandle, ConnectionState};
pub use coordinator::{SendError, SyncEngine};
pub use error::ErrorClass;
pub use fallback::{AuthProvider, FallbackApi, FallbackError, HttpFallback};
pub use store::MessageStore;
pub use types::message::{Message, ProvisionalMessage, SendStatus};
