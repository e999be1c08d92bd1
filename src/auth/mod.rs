//! Authentication Layer
//!
//! Multi-phase authentication gate for control-channel connections: the
//! generic phase machinery, the concrete connection / verification / login
//! phase families, and the per-connection dispatcher that owns all of it.

pub mod anticheat;
pub mod code;
pub mod context;
pub mod dispatcher;
pub mod encryption;
pub mod phase;
pub mod queued;
pub mod verify;

pub use anticheat::{AntiCheatIntegrityPhase, AntiCheatProofPhase, LoginPhase};
pub use code::{AuthFailure, PhaseResult};
pub use context::{
    AuthKey, BeaconContext, ConnectionContext, LoginContext, VerificationContext,
    VerificationStatus,
};
pub use dispatcher::{AuthRequest, ControlDispatcher, EngineSink, RouteTarget};
pub use encryption::{AutomaticEncryptionPhase, ConnectionPhase};
pub use phase::{AuthEnv, PhaseOutcome, PhaseQueue, PhaseStep, QueueProgress};
pub use queued::{QueuedBeacon, QueuedLogin};
pub use verify::{
    IdTokenPhase, IdentityCheckPhase, LegacyCredentialPhase, P2pAddressPhase, SanctionCheckPhase,
    VerificationPhase,
};
