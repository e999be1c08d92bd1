//! Identity Verification Phases
//!
//! Verification-family phases prove that a claimed identity is real and
//! permitted to play. Which phases run depends on the configured
//! authentication mode and the server's role: dedicated servers challenge the
//! client for a token, listen servers check the local identity cache, and the
//! sanction check runs wherever it is enabled.
//!
//! All phases here run on the authenticating server; the client-side handlers
//! only answer challenges.

use tracing::{debug, warn};

use crate::auth::code::{AuthFailure, PhaseResult};
use crate::auth::context::VerificationStatus;
use crate::auth::phase::{AuthEnv, PhaseOutcome, PhaseStep};
use crate::identity::Identity;
use crate::network::protocol::{
    self, msg_type, DeliverClientToken, DeliverIdToken, RequestClientToken, RequestIdToken,
};
use crate::services::{ExternalCredential, SanctionQueryError};

// =============================================================================
// ID TOKEN
// =============================================================================

/// Challenge the client for a short-lived ID token and verify it against the
/// identity provider. The dedicated-server path for mode `IdToken`.
pub struct IdTokenPhase {
    identity: Identity,
}

impl IdTokenPhase {
    /// Phase for the given claimed identity.
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    /// Message types this phase claims on the route table.
    pub fn routed_types() -> [u8; 2] {
        [msg_type::REQUEST_ID_TOKEN, msg_type::DELIVER_ID_TOKEN]
    }

    fn begin(&mut self, env: &mut AuthEnv<'_>) -> PhaseOutcome {
        // Token material crosses the wire only once the handshake, when
        // configured, has actually encrypted the channel.
        if env.caps.automatic_encryption && !env.conn.fully_encrypted() {
            warn!(identity = %self.identity.short(), "id token challenge on unencrypted connection");
            return PhaseOutcome::Finished(Err(AuthFailure::EncryptionRequired));
        }
        let frame = protocol::encode(
            msg_type::REQUEST_ID_TOKEN,
            &RequestIdToken {
                identity: self.identity,
            },
        )
        .expect("verification payloads always encode");
        env.conn.send(frame);
        debug!(identity = %self.identity.short(), "requested id token");
        PhaseOutcome::Pending
    }

    /// Client: produce a token for the requested identity and return it.
    pub fn handle_request(
        &mut self,
        msg: RequestIdToken,
        env: &mut AuthEnv<'_>,
    ) -> Result<(), AuthFailure> {
        if !env.conn.role().is_client() {
            return Err(AuthFailure::WrongRole);
        }
        let token = env
            .services
            .identity
            .issue_id_token(&msg.identity)
            .map_err(|err| {
                warn!(%err, "id token issuance failed");
                AuthFailure::TokenRequestFailed
            })?;

        let frame = protocol::encode(
            msg_type::DELIVER_ID_TOKEN,
            &DeliverIdToken {
                identity: msg.identity,
                token,
            },
        )
        .expect("verification payloads always encode");
        env.conn.send(frame);
        Ok(())
    }

    /// Server: verify the delivered token proves exactly the claimed identity.
    pub fn handle_deliver(&mut self, msg: DeliverIdToken, env: &mut AuthEnv<'_>) -> PhaseResult {
        if !env.conn.role().is_server() {
            return Err(AuthFailure::WrongRole);
        }
        if msg.identity != self.identity {
            return Err(AuthFailure::IdentityMismatch);
        }
        let verified = env
            .services
            .identity
            .verify_id_token(&msg.token)
            .map_err(|err| {
                warn!(identity = %self.identity.short(), %err, "id token rejected");
                AuthFailure::TokenVerificationFailed
            })?;
        if verified != self.identity {
            return Err(AuthFailure::IdentityMismatch);
        }
        env.conn.set_player_identity(self.identity);
        debug!(identity = %self.identity.short(), "id token verified");
        Ok(())
    }
}

// =============================================================================
// EXTERNAL CREDENTIAL
// =============================================================================

/// Challenge the client for its cached external credential and replay it
/// through the identity provider. The dedicated-server path for mode
/// `UserCredentials`.
pub struct LegacyCredentialPhase {
    identity: Identity,
}

impl LegacyCredentialPhase {
    /// Phase for the given claimed identity.
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    /// Message types this phase claims on the route table.
    pub fn routed_types() -> [u8; 2] {
        [msg_type::REQUEST_CLIENT_TOKEN, msg_type::DELIVER_CLIENT_TOKEN]
    }

    fn begin(&mut self, env: &mut AuthEnv<'_>) -> PhaseOutcome {
        // The replayed credential is a live secret: only trusted servers may
        // ask for it, and never over a channel the handshake left in the
        // clear.
        if !env.settings.trusted_server {
            warn!(identity = %self.identity.short(), "credential challenge without trusted-server mode");
            return PhaseOutcome::Finished(Err(AuthFailure::EncryptionRequired));
        }
        if env.caps.automatic_encryption && !env.conn.fully_encrypted() {
            warn!(identity = %self.identity.short(), "credential challenge on unencrypted connection");
            return PhaseOutcome::Finished(Err(AuthFailure::EncryptionRequired));
        }
        let frame = protocol::encode(
            msg_type::REQUEST_CLIENT_TOKEN,
            &RequestClientToken {
                identity: self.identity,
            },
        )
        .expect("verification payloads always encode");
        env.conn.send(frame);
        debug!(identity = %self.identity.short(), "requested client credential");
        PhaseOutcome::Pending
    }

    /// Client: return the cached credential for the identity. Anonymous
    /// accounts have none, and a trusted dedicated server does not accept
    /// them, so the absence fails the login here on the client.
    pub fn handle_request(
        &mut self,
        msg: RequestClientToken,
        env: &mut AuthEnv<'_>,
    ) -> Result<(), AuthFailure> {
        if !env.conn.role().is_client() {
            return Err(AuthFailure::WrongRole);
        }
        let Some(credential) = env.services.identity.cached_credential(&msg.identity) else {
            warn!(identity = %msg.identity.short(), "no cached credential");
            return Err(AuthFailure::NoCachedCredential);
        };

        let frame = protocol::encode(
            msg_type::DELIVER_CLIENT_TOKEN,
            &DeliverClientToken {
                identity: msg.identity,
                token_type: credential.token_type,
                display_name: credential.display_name,
                token: credential.token,
            },
        )
        .expect("verification payloads always encode");
        env.conn.send(frame);
        Ok(())
    }

    /// Server: replay the delivered credential through an external login and
    /// require it to resolve to the claimed identity.
    pub fn handle_deliver(
        &mut self,
        msg: DeliverClientToken,
        env: &mut AuthEnv<'_>,
    ) -> PhaseResult {
        if !env.conn.role().is_server() {
            return Err(AuthFailure::WrongRole);
        }
        if msg.identity != self.identity {
            return Err(AuthFailure::IdentityMismatch);
        }
        let credential = ExternalCredential {
            token_type: msg.token_type,
            display_name: msg.display_name,
            token: msg.token,
        };
        let resolved = env
            .services
            .identity
            .external_login(&credential)
            .map_err(|err| {
                warn!(identity = %self.identity.short(), %err, "external login failed");
                AuthFailure::ExternalLoginFailed
            })?;
        if resolved != self.identity {
            return Err(AuthFailure::IdentityMismatch);
        }
        env.conn.set_player_identity(self.identity);
        debug!(identity = %self.identity.short(), "external credential accepted");
        Ok(())
    }
}

// =============================================================================
// LOCAL IDENTITY CHECK
// =============================================================================

/// Listen-server path: check the identity against the local identity cache,
/// with no wire exchange.
pub struct IdentityCheckPhase {
    identity: Identity,
}

impl IdentityCheckPhase {
    /// Phase for the given claimed identity.
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    fn begin(&mut self, env: &mut AuthEnv<'_>) -> PhaseOutcome {
        if env.services.identity.knows_identity(&self.identity) {
            env.conn.set_player_identity(self.identity);
            debug!(identity = %self.identity.short(), "identity known locally");
            PhaseOutcome::Finished(Ok(()))
        } else {
            warn!(identity = %self.identity.short(), "identity unknown locally");
            PhaseOutcome::Finished(Err(AuthFailure::UnknownIdentity))
        }
    }
}

// =============================================================================
// SANCTIONS
// =============================================================================

/// Query the sanctions service and deny play on an active access-denying
/// sanction. A missing query permission degrades to success with a warning;
/// an unavailable service fails the verification.
pub struct SanctionCheckPhase {
    identity: Identity,
}

impl SanctionCheckPhase {
    /// Phase for the given claimed identity.
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }

    fn begin(&mut self, env: &mut AuthEnv<'_>) -> PhaseOutcome {
        match env.services.sanctions.active_sanctions(&self.identity) {
            Ok(sanctions) => {
                if let Some(sanction) = sanctions.iter().find(|s| s.denies_access()) {
                    warn!(
                        identity = %self.identity.short(),
                        action = %sanction.action,
                        "active sanction denies access"
                    );
                    PhaseOutcome::Finished(Err(AuthFailure::SanctionBan))
                } else {
                    debug!(identity = %self.identity.short(), "no blocking sanction");
                    PhaseOutcome::Finished(Ok(()))
                }
            }
            Err(SanctionQueryError::NoPermission) => {
                warn!(
                    identity = %self.identity.short(),
                    "no permission to query sanctions, continuing"
                );
                PhaseOutcome::Finished(Ok(()))
            }
            Err(SanctionQueryError::Unavailable(reason)) => {
                warn!(identity = %self.identity.short(), %reason, "sanctions query failed");
                PhaseOutcome::Finished(Err(AuthFailure::SanctionQueryFailed))
            }
        }
    }
}

// =============================================================================
// P2P ADDRESS
// =============================================================================

/// Peer-to-peer address registration slot. Nothing needs registering on a
/// client-server topology, so the phase completes immediately.
pub struct P2pAddressPhase;

impl P2pAddressPhase {
    fn begin(&mut self, _env: &mut AuthEnv<'_>) -> PhaseOutcome {
        debug!("no p2p address registration needed");
        PhaseOutcome::Finished(Ok(()))
    }
}

// =============================================================================
// VERIFICATION PHASE FAMILY
// =============================================================================

/// Verification-family phase variants.
pub enum VerificationPhase {
    /// ID token challenge (dedicated server, mode `IdToken`).
    IdToken(IdTokenPhase),
    /// External credential replay (dedicated server, mode `UserCredentials`).
    LegacyCredential(LegacyCredentialPhase),
    /// Local identity-cache check (listen server).
    IdentityCheck(IdentityCheckPhase),
    /// Sanctions query.
    SanctionCheck(SanctionCheckPhase),
    /// P2P address registration slot.
    P2pAddress(P2pAddressPhase),
}

impl VerificationPhase {
    /// Typed accessor for the ID token variant.
    pub fn as_id_token_mut(&mut self) -> Option<&mut IdTokenPhase> {
        match self {
            Self::IdToken(phase) => Some(phase),
            _ => None,
        }
    }

    /// Typed accessor for the external credential variant.
    pub fn as_legacy_credential_mut(&mut self) -> Option<&mut LegacyCredentialPhase> {
        match self {
            Self::LegacyCredential(phase) => Some(phase),
            _ => None,
        }
    }

    /// The verification status to report while this phase is active.
    pub fn status(&self) -> Option<VerificationStatus> {
        match self {
            Self::IdToken(_) | Self::LegacyCredential(_) => {
                Some(VerificationStatus::CheckingAccountExistsFromDedicatedServer)
            }
            Self::IdentityCheck(_) => {
                Some(VerificationStatus::CheckingAccountExistsFromListenServer)
            }
            Self::SanctionCheck(_) => Some(VerificationStatus::CheckingSanctions),
            Self::P2pAddress(_) => None,
        }
    }
}

impl<'a> PhaseStep<AuthEnv<'a>> for VerificationPhase {
    fn name(&self) -> &'static str {
        match self {
            Self::IdToken(_) => "id_token",
            Self::LegacyCredential(_) => "legacy_credential",
            Self::IdentityCheck(_) => "identity_check",
            Self::SanctionCheck(_) => "sanction_check",
            Self::P2pAddress(_) => "p2p_address",
        }
    }

    fn start(&mut self, env: &mut AuthEnv<'a>) -> PhaseOutcome {
        match self {
            Self::IdToken(phase) => phase.begin(env),
            Self::LegacyCredential(phase) => phase.begin(env),
            Self::IdentityCheck(phase) => phase.begin(env),
            Self::SanctionCheck(phase) => phase.begin(env),
            Self::P2pAddress(phase) => phase.begin(env),
        }
    }
}
