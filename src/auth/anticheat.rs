//! Anti-Cheat Login Phases
//!
//! Login-family phases that run after verification, for real player logins
//! only (never beacons). The proof phase classifies the client and registers
//! it with the external anti-cheat service; the integrity phase then holds
//! the login open until the service's remote auth callback confirms the
//! registration.
//!
//! Clients that cannot run the protected build (consoles) are allowed through
//! by signing a server-issued nonce with a platform key the server can
//! verify. A client that sends no proof is taken to be a protected-build
//! client and must pass the integrity wait.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};

use crate::auth::code::{AuthFailure, PhaseResult};
use crate::auth::context::VerificationStatus;
use crate::auth::phase::{AuthEnv, PhaseOutcome, PhaseStep};
use crate::identity::Identity;
use crate::network::protocol::{
    self, msg_type, DeliverTrustedClientProof, RequestTrustedClientProof,
};
use crate::services::AntiCheatClientType;

/// Domain-separation tag for the trusted-client nonce proof.
const TRUSTED_CLIENT_PROOF_TAG: &[u8] = b"warden-trusted-client-proof-v1";

fn proof_message(nonce: &[u8; 32]) -> Vec<u8> {
    let mut message = Vec::with_capacity(TRUSTED_CLIENT_PROOF_TAG.len() + 32);
    message.extend_from_slice(TRUSTED_CLIENT_PROOF_TAG);
    message.extend_from_slice(nonce);
    message
}

// =============================================================================
// PROOF PHASE
// =============================================================================

/// Classify the client and register it with the anti-cheat service.
pub struct AntiCheatProofPhase {
    identity: Identity,
    nonce: Option<[u8; 32]>,
}

impl AntiCheatProofPhase {
    /// Phase for the given identity.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            nonce: None,
        }
    }

    /// Message types this phase claims on the route table.
    pub fn routed_types() -> [u8; 2] {
        [
            msg_type::REQUEST_TRUSTED_CLIENT_PROOF,
            msg_type::DELIVER_TRUSTED_CLIENT_PROOF,
        ]
    }

    fn register(
        &self,
        env: &mut AuthEnv<'_>,
        client_type: AntiCheatClientType,
        platform: &str,
    ) -> PhaseResult {
        env.services
            .anticheat
            .register_player(&self.identity, client_type, platform)
            .map_err(|reason| {
                warn!(identity = %self.identity.short(), %reason, "anti-cheat registration failed");
                AuthFailure::AntiCheatRegistrationFailed
            })?;
        debug!(
            identity = %self.identity.short(),
            ?client_type,
            platform,
            "registered with anti-cheat service"
        );
        Ok(())
    }

    /// Server: challenge the client, or register immediately when no
    /// trusted-client key is configured (no client could ever prove anything).
    fn begin(&mut self, env: &mut AuthEnv<'_>) -> PhaseOutcome {
        if env.settings.trusted_client_public_key.is_none() {
            debug!("no trusted-client key configured, registering without proof");
            let platform = env.settings.client_platform.clone();
            return PhaseOutcome::Finished(self.register(
                env,
                AntiCheatClientType::CannotProvideProof,
                &platform,
            ));
        }

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        self.nonce = Some(nonce);

        let frame = protocol::encode(
            msg_type::REQUEST_TRUSTED_CLIENT_PROOF,
            &RequestTrustedClientProof {
                identity: self.identity,
                nonce,
            },
        )
        .expect("anti-cheat payloads always encode");
        env.conn.send(frame);
        debug!(identity = %self.identity.short(), "requested trusted-client proof");
        PhaseOutcome::Pending
    }

    /// Client: sign the nonce with the platform key if one exists, otherwise
    /// declare that no proof is available.
    pub fn handle_request(
        &mut self,
        msg: RequestTrustedClientProof,
        env: &mut AuthEnv<'_>,
    ) -> Result<(), AuthFailure> {
        if !env.conn.role().is_client() {
            return Err(AuthFailure::WrongRole);
        }

        let reply = match env.settings.platform_signing_key {
            Some(seed) => {
                let signing_key = SigningKey::from_bytes(&seed);
                let signature = signing_key.sign(&proof_message(&msg.nonce));
                DeliverTrustedClientProof {
                    identity: msg.identity,
                    has_proof: true,
                    signature: signature.to_bytes().to_vec(),
                    platform: env.settings.client_platform.clone(),
                }
            }
            None => DeliverTrustedClientProof {
                identity: msg.identity,
                has_proof: false,
                signature: Vec::new(),
                platform: env.settings.client_platform.clone(),
            },
        };

        let frame = protocol::encode(msg_type::DELIVER_TRUSTED_CLIENT_PROOF, &reply)
            .expect("anti-cheat payloads always encode");
        env.conn.send(frame);
        Ok(())
    }

    /// Server: verify the proof and register the classified client.
    ///
    /// The configured trusted-client key is decoded here, and an absent,
    /// undecodable, or wrong-length key fails the login closed.
    pub fn handle_deliver(
        &mut self,
        msg: DeliverTrustedClientProof,
        env: &mut AuthEnv<'_>,
    ) -> PhaseResult {
        if !env.conn.role().is_server() {
            return Err(AuthFailure::WrongRole);
        }
        if msg.identity != self.identity {
            return Err(AuthFailure::IdentityMismatch);
        }
        let nonce = self.nonce.ok_or(AuthFailure::UnexpectedMessage)?;

        if !msg.has_proof {
            // Protected-build client: the integrity wait will confirm it.
            debug!(identity = %self.identity.short(), "no platform proof, protected client");
            return self.register(env, AntiCheatClientType::ProtectedClient, &msg.platform);
        }

        let raw_key = env
            .settings
            .trusted_client_public_key
            .as_deref()
            .ok_or(AuthFailure::TrustedClientKeyInvalid)?;
        let key_bytes: [u8; 32] = raw_key
            .try_into()
            .map_err(|_| AuthFailure::TrustedClientKeyInvalid)?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| AuthFailure::TrustedClientKeyInvalid)?;

        let signature =
            Signature::from_slice(&msg.signature).map_err(|_| AuthFailure::AntiCheatProofInvalid)?;
        verifying_key
            .verify(&proof_message(&nonce), &signature)
            .map_err(|_| {
                warn!(identity = %self.identity.short(), "trusted-client proof rejected");
                AuthFailure::AntiCheatProofInvalid
            })?;

        debug!(
            identity = %self.identity.short(),
            platform = %msg.platform,
            "trusted-client proof verified"
        );
        self.register(env, AntiCheatClientType::UnprotectedTrusted, &msg.platform)
    }
}

// =============================================================================
// INTEGRITY PHASE
// =============================================================================

/// Hold the login until the anti-cheat service's remote auth callback
/// confirms the player. The callback may land before the phase starts; the
/// `started`/`verified` pair makes that ordering race-free.
pub struct AntiCheatIntegrityPhase {
    identity: Identity,
    started: bool,
    verified: bool,
}

impl AntiCheatIntegrityPhase {
    /// Phase for the given identity. `already_verified` seeds the phase when
    /// the callback for this identity was observed before the login began.
    pub fn new(identity: Identity, already_verified: bool) -> Self {
        Self {
            identity,
            started: false,
            verified: already_verified,
        }
    }

    fn begin(&mut self, _env: &mut AuthEnv<'_>) -> PhaseOutcome {
        self.started = true;
        if self.verified {
            debug!(identity = %self.identity.short(), "integrity already confirmed");
            PhaseOutcome::Finished(Ok(()))
        } else {
            debug!(identity = %self.identity.short(), "waiting for integrity confirmation");
            PhaseOutcome::Pending
        }
    }

    /// Record the remote auth callback. Returns true when the phase was
    /// already started and is now waiting to be finished by its owner.
    pub fn notify_remote_auth_complete(&mut self) -> bool {
        self.verified = true;
        self.started
    }
}

// =============================================================================
// LOGIN PHASE FAMILY
// =============================================================================

/// Login-family phase variants.
pub enum LoginPhase {
    /// Trusted-client proof and anti-cheat registration.
    AntiCheatProof(AntiCheatProofPhase),
    /// Wait for the anti-cheat remote auth confirmation.
    AntiCheatIntegrity(AntiCheatIntegrityPhase),
}

impl LoginPhase {
    /// Typed accessor for the proof variant.
    pub fn as_proof_mut(&mut self) -> Option<&mut AntiCheatProofPhase> {
        match self {
            Self::AntiCheatProof(phase) => Some(phase),
            _ => None,
        }
    }

    /// Typed accessor for the integrity variant.
    pub fn as_integrity_mut(&mut self) -> Option<&mut AntiCheatIntegrityPhase> {
        match self {
            Self::AntiCheatIntegrity(phase) => Some(phase),
            _ => None,
        }
    }

    /// The verification status to report while this phase is active.
    pub fn status(&self) -> VerificationStatus {
        match self {
            Self::AntiCheatProof(_) => VerificationStatus::EstablishingAntiCheatProof,
            Self::AntiCheatIntegrity(_) => VerificationStatus::WaitingForAntiCheatIntegrity,
        }
    }
}

impl<'a> PhaseStep<AuthEnv<'a>> for LoginPhase {
    fn name(&self) -> &'static str {
        match self {
            Self::AntiCheatProof(_) => "anticheat_proof",
            Self::AntiCheatIntegrity(_) => "anticheat_integrity",
        }
    }

    fn start(&mut self, env: &mut AuthEnv<'a>) -> PhaseOutcome {
        match self {
            Self::AntiCheatProof(phase) => phase.begin(env),
            Self::AntiCheatIntegrity(phase) => phase.begin(env),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthSettings;
    use crate::network::connection::testing::MemoryLink;
    use crate::network::connection::{Connection, ConnectionRole};
    use crate::services::{
        AntiCheatRecord, InMemorySanctions, JwtIdentityProvider, RecordingAntiCheat, Services,
    };
    use std::sync::{Arc, Mutex};

    struct End {
        conn: Connection,
        services: Services,
        settings: AuthSettings,
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        anticheat: Arc<Mutex<AntiCheatRecord>>,
    }

    impl End {
        fn new(role: ConnectionRole, settings: AuthSettings) -> Self {
            let (link, frames, _closed) = MemoryLink::new();
            let recorder = RecordingAntiCheat::new();
            let anticheat = recorder.record();
            let services = Services {
                identity: Box::new(JwtIdentityProvider::unconfigured()),
                sanctions: Box::new(InMemorySanctions::new()),
                anticheat: Box::new(recorder),
            };
            Self {
                conn: Connection::new(role, Box::new(link)),
                services,
                settings,
                frames,
                anticheat,
            }
        }

        fn with_env<R>(&mut self, f: impl FnOnce(&mut AuthEnv<'_>) -> R) -> R {
            let caps = self.settings.capabilities();
            let mut env = AuthEnv {
                conn: &mut self.conn,
                services: &mut self.services,
                settings: &self.settings,
                caps: &caps,
            };
            f(&mut env)
        }

        fn take_frame(&self) -> Vec<u8> {
            self.frames.lock().unwrap().remove(0)
        }
    }

    fn platform_keypair() -> ([u8; 32], Vec<u8>) {
        let signing = SigningKey::generate(&mut OsRng);
        (
            signing.to_bytes(),
            signing.verifying_key().to_bytes().to_vec(),
        )
    }

    #[test]
    fn test_no_trusted_key_registers_without_proof() {
        let identity = Identity::from_subject("user123");
        let mut server = End::new(ConnectionRole::DedicatedServer, AuthSettings::default());
        let mut phase = AntiCheatProofPhase::new(identity);

        let outcome = server.with_env(|env| phase.begin(env));
        assert!(matches!(outcome, PhaseOutcome::Finished(Ok(()))));
        assert!(server.frames.lock().unwrap().is_empty());
        assert_eq!(
            server.anticheat.lock().unwrap().registered,
            vec![(identity, AntiCheatClientType::CannotProvideProof, "pc".to_string())]
        );
    }

    #[test]
    fn test_platform_proof_classifies_unprotected_trusted() {
        let identity = Identity::from_subject("user123");
        let (seed, public) = platform_keypair();

        let server_settings = AuthSettings {
            trusted_client_public_key: Some(public),
            ..Default::default()
        };
        let client_settings = AuthSettings {
            platform_signing_key: Some(seed),
            client_platform: "console".into(),
            ..Default::default()
        };
        let mut server = End::new(ConnectionRole::DedicatedServer, server_settings);
        let mut client = End::new(ConnectionRole::ClientToDedicated, client_settings);

        let mut server_phase = AntiCheatProofPhase::new(identity);
        let mut client_phase = AntiCheatProofPhase::new(identity);

        let outcome = server.with_env(|env| server_phase.begin(env));
        assert!(matches!(outcome, PhaseOutcome::Pending));
        let frame = server.take_frame();
        let (t, body) = protocol::split_frame(&frame).unwrap();
        assert_eq!(t, msg_type::REQUEST_TRUSTED_CLIENT_PROOF);
        let request: RequestTrustedClientProof = protocol::decode(body).unwrap();

        client
            .with_env(|env| client_phase.handle_request(request, env))
            .unwrap();
        let frame = client.take_frame();
        let (_, body) = protocol::split_frame(&frame).unwrap();
        let deliver: DeliverTrustedClientProof = protocol::decode(body).unwrap();
        assert!(deliver.has_proof);

        let result = server.with_env(|env| server_phase.handle_deliver(deliver, env));
        assert_eq!(result, Ok(()));
        assert_eq!(
            server.anticheat.lock().unwrap().registered,
            vec![(
                identity,
                AntiCheatClientType::UnprotectedTrusted,
                "console".to_string()
            )]
        );
    }

    #[test]
    fn test_absent_platform_key_classifies_protected() {
        let identity = Identity::from_subject("user123");
        let (_, public) = platform_keypair();

        let server_settings = AuthSettings {
            trusted_client_public_key: Some(public),
            ..Default::default()
        };
        let mut server = End::new(ConnectionRole::DedicatedServer, server_settings);
        let mut client = End::new(ConnectionRole::ClientToDedicated, AuthSettings::default());

        let mut server_phase = AntiCheatProofPhase::new(identity);
        let mut client_phase = AntiCheatProofPhase::new(identity);

        server.with_env(|env| server_phase.begin(env));
        let frame = server.take_frame();
        let (_, body) = protocol::split_frame(&frame).unwrap();
        let request: RequestTrustedClientProof = protocol::decode(body).unwrap();

        client
            .with_env(|env| client_phase.handle_request(request, env))
            .unwrap();
        let frame = client.take_frame();
        let (_, body) = protocol::split_frame(&frame).unwrap();
        let deliver: DeliverTrustedClientProof = protocol::decode(body).unwrap();
        assert!(!deliver.has_proof);

        let result = server.with_env(|env| server_phase.handle_deliver(deliver, env));
        assert_eq!(result, Ok(()));
        assert_eq!(
            server.anticheat.lock().unwrap().registered[0].1,
            AntiCheatClientType::ProtectedClient
        );
    }

    #[test]
    fn test_forged_proof_rejected() {
        let identity = Identity::from_subject("user123");
        let (_, public) = platform_keypair();
        let (other_seed, _) = platform_keypair();

        let server_settings = AuthSettings {
            trusted_client_public_key: Some(public),
            ..Default::default()
        };
        let client_settings = AuthSettings {
            platform_signing_key: Some(other_seed),
            ..Default::default()
        };
        let mut server = End::new(ConnectionRole::DedicatedServer, server_settings);
        let mut client = End::new(ConnectionRole::ClientToDedicated, client_settings);

        let mut server_phase = AntiCheatProofPhase::new(identity);
        let mut client_phase = AntiCheatProofPhase::new(identity);

        server.with_env(|env| server_phase.begin(env));
        let frame = server.take_frame();
        let (_, body) = protocol::split_frame(&frame).unwrap();
        let request: RequestTrustedClientProof = protocol::decode(body).unwrap();

        client
            .with_env(|env| client_phase.handle_request(request, env))
            .unwrap();
        let frame = client.take_frame();
        let (_, body) = protocol::split_frame(&frame).unwrap();
        let deliver: DeliverTrustedClientProof = protocol::decode(body).unwrap();

        let result = server.with_env(|env| server_phase.handle_deliver(deliver, env));
        assert_eq!(result, Err(AuthFailure::AntiCheatProofInvalid));
        assert!(server.anticheat.lock().unwrap().registered.is_empty());
    }

    #[test]
    fn test_undecodable_trusted_key_fails_closed() {
        let identity = Identity::from_subject("user123");
        let (seed, _) = platform_keypair();

        // Wrong-length configured key.
        let server_settings = AuthSettings {
            trusted_client_public_key: Some(vec![1, 2, 3]),
            ..Default::default()
        };
        let client_settings = AuthSettings {
            platform_signing_key: Some(seed),
            ..Default::default()
        };
        let mut server = End::new(ConnectionRole::DedicatedServer, server_settings);
        let mut client = End::new(ConnectionRole::ClientToDedicated, client_settings);

        let mut server_phase = AntiCheatProofPhase::new(identity);
        let mut client_phase = AntiCheatProofPhase::new(identity);

        server.with_env(|env| server_phase.begin(env));
        let frame = server.take_frame();
        let (_, body) = protocol::split_frame(&frame).unwrap();
        let request: RequestTrustedClientProof = protocol::decode(body).unwrap();

        client
            .with_env(|env| client_phase.handle_request(request, env))
            .unwrap();
        let frame = client.take_frame();
        let (_, body) = protocol::split_frame(&frame).unwrap();
        let deliver: DeliverTrustedClientProof = protocol::decode(body).unwrap();

        let result = server.with_env(|env| server_phase.handle_deliver(deliver, env));
        assert_eq!(result, Err(AuthFailure::TrustedClientKeyInvalid));
    }

    #[test]
    fn test_integrity_waits_for_callback() {
        let identity = Identity::from_subject("user123");
        let mut server = End::new(ConnectionRole::DedicatedServer, AuthSettings::default());
        let mut phase = AntiCheatIntegrityPhase::new(identity, false);

        let outcome = server.with_env(|env| phase.begin(env));
        assert!(matches!(outcome, PhaseOutcome::Pending));

        // Callback after start: the owner must now finish the phase.
        assert!(phase.notify_remote_auth_complete());
    }

    #[test]
    fn test_integrity_callback_before_start_finishes_immediately() {
        let identity = Identity::from_subject("user123");
        let mut server = End::new(ConnectionRole::DedicatedServer, AuthSettings::default());
        let mut phase = AntiCheatIntegrityPhase::new(identity, false);

        // Callback lands before the phase starts: not yet waiting.
        assert!(!phase.notify_remote_auth_complete());

        let outcome = server.with_env(|env| phase.begin(env));
        assert!(matches!(outcome, PhaseOutcome::Finished(Ok(()))));
    }

    #[test]
    fn test_integrity_preseeded_verified() {
        let identity = Identity::from_subject("user123");
        let mut server = End::new(ConnectionRole::DedicatedServer, AuthSettings::default());
        let mut phase = AntiCheatIntegrityPhase::new(identity, true);

        let outcome = server.with_env(|env| phase.begin(env));
        assert!(matches!(outcome, PhaseOutcome::Finished(Ok(()))));
    }
}
