//! Network Layer
//!
//! Control-channel plumbing: wire framing and message payloads, the
//! per-connection transport state (role, identity slot, directional
//! encryption), and the async TCP server front end.

pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::{Connection, ConnectionRole, ControlLink};
pub use protocol::{msg_type, ProtocolError};
pub use server::{AuthServer, EngineFactory, ServerConfig, ServerError, ServiceFactory};
