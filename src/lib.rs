//! # Warden Authentication Server
//!
//! Network authentication gate for multiplayer game connections: multi-phase
//! login verification, an opportunistic encryption handshake, and anti-cheat
//! enrollment, all in front of the game engine's own message handling.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WARDEN SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  auth/            - Authentication gate                      │
//! │  ├── phase.rs     - Generic phase queue machinery            │
//! │  ├── code.rs      - Failure code taxonomy                    │
//! │  ├── context.rs   - Per-family phase run state               │
//! │  ├── encryption.rs- Automatic encryption handshake           │
//! │  ├── verify.rs    - Identity verification phases             │
//! │  ├── anticheat.rs - Anti-cheat login phases                  │
//! │  ├── queued.rs    - Held-back login/beacon replay            │
//! │  └── dispatcher.rs- Per-connection control router            │
//! │                                                              │
//! │  network/         - Control-channel plumbing                 │
//! │  ├── protocol.rs  - Wire framing and payloads                │
//! │  ├── connection.rs- Connection state and ciphers             │
//! │  └── server.rs    - Async TCP front end                      │
//! │                                                              │
//! │  config.rs        - Settings and capability negotiation      │
//! │  identity.rs      - Stable 128-bit player identity           │
//! │  services.rs      - Identity/sanction/anti-cheat seams       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Gate Contract
//!
//! Login and beacon-join requests are held back, never dropped: each one
//! rides a verification run for its identity and is replayed into the engine
//! only when every phase succeeds. Any failure produces exactly one
//! sanitized notice to the client followed by a close. One verification run
//! serves all requests from the same identity on the connection.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod identity;
pub mod network;
pub mod services;

// Re-export commonly used types
pub use auth::{AuthFailure, ControlDispatcher, EngineSink, VerificationStatus};
pub use config::{AuthCapabilities, AuthMode, AuthSettings};
pub use identity::Identity;
pub use network::{AuthServer, Connection, ConnectionRole, ServerConfig};
pub use services::{AntiCheatService, IdentityProvider, SanctionService, Services};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
