//! Phase Contexts
//!
//! Family-specific state for one authentication attempt. The dispatcher owns
//! every context in a map keyed by identity (or connection), for exactly the
//! duration of the run; completion removes or seals the context. Contexts
//! never keep themselves alive.

use std::time::Instant;

use crate::auth::code::AuthFailure;
use crate::auth::phase::PhaseQueue;
use crate::identity::Identity;
use crate::network::protocol::HelloPayload;

use super::anticheat::LoginPhase;
use super::encryption::ConnectionPhase;
use super::verify::VerificationPhase;

// =============================================================================
// VERIFICATION STATUS
// =============================================================================

/// Per-identity verification progress. Moves strictly forward in the defined
/// order, terminating in exactly one of `Verified` or `Failed`; `Failed` is
/// reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    /// No verification attempt yet.
    NotStarted,
    /// Listen-server path: checking the account against the local cache.
    CheckingAccountExistsFromListenServer,
    /// Dedicated-server path: checking the account with the provider.
    CheckingAccountExistsFromDedicatedServer,
    /// Querying the sanctions service.
    CheckingSanctions,
    /// Waiting for the client's anti-cheat nonce proof.
    EstablishingAntiCheatProof,
    /// Waiting for the anti-cheat service's remote auth callback.
    WaitingForAntiCheatIntegrity,
    /// Terminal: identity verified and permitted.
    Verified,
    /// Terminal: verification failed.
    Failed,
}

impl VerificationStatus {
    fn rank(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::CheckingAccountExistsFromListenServer
            | Self::CheckingAccountExistsFromDedicatedServer => 1,
            Self::CheckingSanctions => 2,
            Self::EstablishingAntiCheatProof => 3,
            Self::WaitingForAntiCheatIntegrity => 4,
            Self::Verified => 5,
            Self::Failed => 6,
        }
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }

    /// Advance to `next`. Forward-only: regressions other than to `Failed`
    /// are programming errors, as is any transition out of a terminal state.
    pub fn advance_to(&mut self, next: Self) {
        if *self == next {
            return;
        }
        debug_assert!(!self.is_terminal(), "status transition out of terminal state");
        debug_assert!(
            next == Self::Failed || next.rank() >= self.rank(),
            "status regression: {:?} -> {:?}",
            self,
            next
        );
        *self = next;
    }
}

// =============================================================================
// PENDING AUTH KEYS
// =============================================================================

/// Key of a queued login or beacon entry waiting on a verification run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthKey {
    /// A player login, keyed by identity.
    Login(Identity),
    /// A beacon join, keyed by identity and beacon name.
    Beacon(Identity, String),
}

// =============================================================================
// FAMILY CONTEXTS
// =============================================================================

/// Connection-family context: the once-per-connection handshake run, plus the
/// buffered hello parameters replayed when the run completes.
pub struct ConnectionContext {
    /// The connection-level phase queue.
    pub queue: PhaseQueue<ConnectionPhase>,
    /// Original hello parameters, forwarded on success.
    pub hello: HelloPayload,
    /// Deadline for the active phase.
    pub deadline: Option<Instant>,
}

impl ConnectionContext {
    /// New context buffering the given hello.
    pub fn new(hello: HelloPayload) -> Self {
        Self {
            queue: PhaseQueue::new(),
            hello,
            deadline: None,
        }
    }
}

/// Verification-family context: one per (connection, identity), reused by
/// later login/beacon attempts from the same identity so verification never
/// repeats.
pub struct VerificationContext {
    /// The identity under verification.
    pub identity: Identity,
    /// The verification phase queue.
    pub queue: PhaseQueue<VerificationPhase>,
    /// Monotonic verification progress.
    pub status: VerificationStatus,
    /// The failure that terminated the run, once status is `Failed`.
    pub failure: Option<AuthFailure>,
    /// Entries whose completion is attached to this run.
    pub waiters: Vec<AuthKey>,
    /// Deadline for the active phase.
    pub deadline: Option<Instant>,
}

impl VerificationContext {
    /// New context for an identity, before any phase has run.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            queue: PhaseQueue::new(),
            status: VerificationStatus::NotStarted,
            failure: None,
            waiters: Vec::new(),
            deadline: None,
        }
    }
}

/// Login-family context: the per-login phase run after verification.
pub struct LoginContext {
    /// The identity logging in.
    pub identity: Identity,
    /// Phases planned for this run; consumed when the queue starts.
    pub planned: Vec<LoginPhase>,
    /// The login phase queue.
    pub queue: PhaseQueue<LoginPhase>,
    /// Deadline for the active phase.
    pub deadline: Option<Instant>,
}

impl LoginContext {
    /// New context with a planned phase list.
    pub fn new(identity: Identity, planned: Vec<LoginPhase>) -> Self {
        Self {
            identity,
            planned,
            queue: PhaseQueue::new(),
            deadline: None,
        }
    }
}

/// Beacon-family phases. No beacon-specific steps exist today; the family is
/// the seam where they would go, downstream of the shared verification gate.
pub enum BeaconPhase {}

impl<E> crate::auth::phase::PhaseStep<E> for BeaconPhase {
    fn name(&self) -> &'static str {
        match *self {}
    }

    fn start(&mut self, _env: &mut E) -> crate::auth::phase::PhaseOutcome {
        match *self {}
    }
}

/// Beacon-family context, keyed by (identity, beacon name).
pub struct BeaconContext {
    /// The identity joining.
    pub identity: Identity,
    /// The beacon being joined.
    pub beacon_name: String,
    /// The beacon phase queue (currently always empty).
    pub queue: PhaseQueue<BeaconPhase>,
    /// Deadline for the active phase.
    pub deadline: Option<Instant>,
}

impl BeaconContext {
    /// New context for an identity and beacon name.
    pub fn new(identity: Identity, beacon_name: String) -> Self {
        Self {
            identity,
            beacon_name,
            queue: PhaseQueue::new(),
            deadline: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward() {
        let mut status = VerificationStatus::NotStarted;
        status.advance_to(VerificationStatus::CheckingAccountExistsFromDedicatedServer);
        status.advance_to(VerificationStatus::CheckingSanctions);
        status.advance_to(VerificationStatus::Verified);
        assert!(status.is_terminal());
    }

    #[test]
    fn test_status_failure_reachable_from_any_state() {
        let mut status = VerificationStatus::CheckingSanctions;
        status.advance_to(VerificationStatus::Failed);
        assert_eq!(status, VerificationStatus::Failed);

        let mut status = VerificationStatus::NotStarted;
        status.advance_to(VerificationStatus::Failed);
        assert_eq!(status, VerificationStatus::Failed);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "status regression")]
    fn test_status_regression_panics() {
        let mut status = VerificationStatus::CheckingSanctions;
        status.advance_to(VerificationStatus::CheckingAccountExistsFromDedicatedServer);
    }

    #[test]
    fn test_same_rank_paths_allowed() {
        // Listen-server and dedicated-server existence checks share a rank;
        // re-asserting the same state is a no-op either way.
        let mut status = VerificationStatus::CheckingAccountExistsFromListenServer;
        status.advance_to(VerificationStatus::CheckingAccountExistsFromListenServer);
        assert_eq!(
            status,
            VerificationStatus::CheckingAccountExistsFromListenServer
        );
    }
}
