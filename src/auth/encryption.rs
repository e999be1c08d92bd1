//! Automatic Encryption Phase
//!
//! Connection-family phase that opportunistically upgrades a
//! dedicated-server connection to an authenticated, encrypted transport
//! before any identity data is exchanged.
//!
//! The handshake binds a fresh per-connection X25519 key to the server's
//! long-term ed25519 identity, one-way authenticated: the client verifies
//! the server, the server does not yet verify the client.
//!
//! ```text
//! server                                   client
//!   | RequestClientEphemeralKey(pub, sig)  -> |  verify sig, mark trusted
//!   | <-  DeliverClientEphemeralKey(pub)      |  derive session keys
//!   | SymmetricKeyExchange(sealed sym key) -> |  unseal, enable both dirs
//!   |   (server decrypts inbound only)        |
//!   | <-         EnableEncryption             |  (already encrypted)
//!   |   enable outbound, finish Success       |
//! ```
//!
//! Every handler fails closed: wrong role, encryption not configured, or any
//! decode/length/verification error terminates the connection.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::auth::code::{AuthFailure, PhaseResult};
use crate::auth::phase::{AuthEnv, PhaseOutcome, PhaseStep};
use crate::network::protocol::{
    self, msg_type, DeliverClientEphemeralKey, EnableEncryption, RequestClientEphemeralKey,
    SymmetricKeyExchange,
};

/// Domain-separation tag for the ephemeral-key signature.
const EPHEMERAL_KEY_SIGN_TAG: &[u8] = b"warden-connection-ephemeral-key-v1";
/// Domain-separation tag (AAD) for the sealed symmetric key.
const SYMMETRIC_KEY_SEAL_TAG: &[u8] = b"warden-symmetric-key-v1";

const SEAL_NONCE_LEN: usize = 12;
const SYMMETRIC_KEY_LEN: usize = 32;

// =============================================================================
// SESSION KEY DERIVATION
// =============================================================================

/// Directional session keys derived from the one-way key exchange.
pub struct SessionKeys {
    /// Server transmit / client receive key.
    pub server_to_client: [u8; 32],
    /// Client transmit / server receive key.
    pub client_to_server: [u8; 32],
}

/// HKDF-SHA256 over the shared secret, salted with both ephemeral public
/// keys so each side derives the same pair of directional keys.
fn derive_session_keys(
    shared: &[u8; 32],
    server_public: &[u8; 32],
    client_public: &[u8; 32],
) -> SessionKeys {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(server_public);
    salt[32..].copy_from_slice(client_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut server_to_client = [0u8; 32];
    let mut client_to_server = [0u8; 32];
    hk.expand(b"warden-s2c", &mut server_to_client)
        .expect("hkdf expand with fixed-size output");
    hk.expand(b"warden-c2s", &mut client_to_server)
        .expect("hkdf expand with fixed-size output");

    SessionKeys {
        server_to_client,
        client_to_server,
    }
}

fn seal_symmetric_key(symmetric_key: &[u8; 32], session_key: &[u8; 32]) -> Vec<u8> {
    let mut nonce = [0u8; SEAL_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(session_key));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: symmetric_key,
                aad: SYMMETRIC_KEY_SEAL_TAG,
            },
        )
        .expect("sealing a fixed-size key cannot fail");

    let mut sealed = Vec::with_capacity(SEAL_NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    sealed
}

fn open_symmetric_key(sealed: &[u8], session_key: &[u8; 32]) -> Option<[u8; 32]> {
    if sealed.len() <= SEAL_NONCE_LEN {
        return None;
    }
    let (nonce, ciphertext) = sealed.split_at(SEAL_NONCE_LEN);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(session_key));
    let plain = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: SYMMETRIC_KEY_SEAL_TAG,
            },
        )
        .ok()?;

    if plain.len() != SYMMETRIC_KEY_LEN {
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&plain);
    Some(key)
}

fn signed_ephemeral_message(public_key: &[u8; 32]) -> Vec<u8> {
    let mut message = Vec::with_capacity(EPHEMERAL_KEY_SIGN_TAG.len() + 32);
    message.extend_from_slice(EPHEMERAL_KEY_SIGN_TAG);
    message.extend_from_slice(public_key);
    message
}

// =============================================================================
// PHASE
// =============================================================================

/// State for one run of the automatic encryption handshake, on either end.
pub struct AutomaticEncryptionPhase {
    // Server side: ephemeral exchange keypair, consumed on the client's reply.
    server_ephemeral: Option<EphemeralSecret>,
    server_ephemeral_public: Option<[u8; 32]>,
    // Both sides: derived directional keys.
    session: Option<SessionKeys>,
    // Server side: the generated transport key, installed outbound last.
    symmetric_key: Option<[u8; 32]>,
}

impl AutomaticEncryptionPhase {
    /// Fresh phase state.
    pub fn new() -> Self {
        Self {
            server_ephemeral: None,
            server_ephemeral_public: None,
            session: None,
            symmetric_key: None,
        }
    }

    /// Message types this phase claims on the dispatcher's route table.
    pub fn routed_types() -> [u8; 4] {
        [
            msg_type::REQUEST_CLIENT_EPHEMERAL_KEY,
            msg_type::DELIVER_CLIENT_EPHEMERAL_KEY,
            msg_type::SYMMETRIC_KEY_EXCHANGE,
            msg_type::ENABLE_ENCRYPTION,
        ]
    }

    /// Server: begin the handshake by sending the signed ephemeral key.
    /// Completes as a no-op success when no signing keypair is configured.
    fn begin(&mut self, env: &mut AuthEnv<'_>) -> PhaseOutcome {
        if !env.caps.automatic_encryption {
            warn!("automatic encryption not configured, skipping handshake");
            return PhaseOutcome::Finished(Ok(()));
        }
        let Some(seed) = env.settings.server_signing_key else {
            warn!("trusted server mode without a signing key, skipping handshake");
            return PhaseOutcome::Finished(Ok(()));
        };

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&ephemeral);
        let public_bytes = *public.as_bytes();

        let signing_key = SigningKey::from_bytes(&seed);
        let signature = signing_key.sign(&signed_ephemeral_message(&public_bytes));

        self.server_ephemeral = Some(ephemeral);
        self.server_ephemeral_public = Some(public_bytes);

        let frame = protocol::encode(
            msg_type::REQUEST_CLIENT_EPHEMERAL_KEY,
            &RequestClientEphemeralKey {
                public_key: public_bytes,
                signature: signature.to_bytes().to_vec(),
            },
        )
        .expect("handshake payloads always encode");
        env.conn.send(frame);

        debug!("sent signed ephemeral key");
        PhaseOutcome::Pending
    }

    /// Client: verify the server's signed ephemeral key, derive session keys
    /// and reply with our own ephemeral public key.
    pub fn handle_request_client_key(
        &mut self,
        msg: RequestClientEphemeralKey,
        env: &mut AuthEnv<'_>,
    ) -> Result<(), AuthFailure> {
        if !env.conn.role().is_client() {
            return Err(AuthFailure::WrongRole);
        }
        let Some(pinned) = env.settings.server_public_key else {
            return Err(AuthFailure::EncryptionNotEnabled);
        };

        let verifying_key =
            VerifyingKey::from_bytes(&pinned).map_err(|_| AuthFailure::BadKeyLength)?;
        let signature =
            Signature::from_slice(&msg.signature).map_err(|_| AuthFailure::MalformedMessage)?;
        verifying_key
            .verify(&signed_ephemeral_message(&msg.public_key), &signature)
            .map_err(|_| AuthFailure::UntrustedServer)?;

        // The server proved control of the pinned long-term key.
        env.conn.set_trusted();

        let client_ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let client_public = X25519PublicKey::from(&client_ephemeral);
        let server_public = X25519PublicKey::from(msg.public_key);

        let shared = client_ephemeral.diffie_hellman(&server_public);
        if !shared.was_contributory() {
            return Err(AuthFailure::KeyExchangeFailed);
        }
        self.session = Some(derive_session_keys(
            shared.as_bytes(),
            &msg.public_key,
            client_public.as_bytes(),
        ));

        let frame = protocol::encode(
            msg_type::DELIVER_CLIENT_EPHEMERAL_KEY,
            &DeliverClientEphemeralKey {
                public_key: *client_public.as_bytes(),
            },
        )
        .expect("handshake payloads always encode");
        env.conn.send(frame);

        debug!("server trusted, delivered client ephemeral key");
        Ok(())
    }

    /// Server: complete the exchange, seal a fresh symmetric transport key
    /// under the derived transmit key, and start decrypting inbound traffic.
    /// Outbound stays unencrypted until the client confirms, so
    /// retransmissions of this very message are never re-encrypted.
    pub fn handle_deliver_client_key(
        &mut self,
        msg: DeliverClientEphemeralKey,
        env: &mut AuthEnv<'_>,
    ) -> Result<(), AuthFailure> {
        if !env.conn.role().is_server() {
            return Err(AuthFailure::WrongRole);
        }
        if !env.caps.automatic_encryption {
            return Err(AuthFailure::EncryptionNotEnabled);
        }
        let ephemeral = self
            .server_ephemeral
            .take()
            .ok_or(AuthFailure::UnexpectedMessage)?;
        let server_public = self
            .server_ephemeral_public
            .ok_or(AuthFailure::UnexpectedMessage)?;

        let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(msg.public_key));
        if !shared.was_contributory() {
            return Err(AuthFailure::KeyExchangeFailed);
        }
        let session = derive_session_keys(shared.as_bytes(), &server_public, &msg.public_key);

        let mut symmetric_key = [0u8; 32];
        OsRng.fill_bytes(&mut symmetric_key);

        let frame = protocol::encode(
            msg_type::SYMMETRIC_KEY_EXCHANGE,
            &SymmetricKeyExchange {
                sealed_key: seal_symmetric_key(&symmetric_key, &session.server_to_client),
            },
        )
        .expect("handshake payloads always encode");
        env.conn.send(frame);

        env.conn.enable_recv_encryption(&symmetric_key);
        self.session = Some(session);
        self.symmetric_key = Some(symmetric_key);

        debug!("sealed symmetric key sent, inbound decryption enabled");
        Ok(())
    }

    /// Client: unseal the symmetric key, enable encryption in both
    /// directions, and confirm over the now-encrypted channel.
    pub fn handle_symmetric_key(
        &mut self,
        msg: SymmetricKeyExchange,
        env: &mut AuthEnv<'_>,
    ) -> Result<(), AuthFailure> {
        if !env.conn.role().is_client() {
            return Err(AuthFailure::WrongRole);
        }
        let session = self.session.as_ref().ok_or(AuthFailure::UnexpectedMessage)?;

        let symmetric_key = open_symmetric_key(&msg.sealed_key, &session.server_to_client)
            .ok_or(AuthFailure::SymmetricKeyDecrypt)?;

        env.conn.enable_recv_encryption(&symmetric_key);
        env.conn.enable_send_encryption(&symmetric_key);
        env.conn.set_trusted();

        let frame = protocol::encode(msg_type::ENABLE_ENCRYPTION, &EnableEncryption)
            .expect("handshake payloads always encode");
        env.conn.send(frame);

        debug!("bidirectional encryption enabled");
        Ok(())
    }

    /// Server: the client confirmed; enable outbound encryption and finish.
    pub fn handle_enable_encryption(&mut self, env: &mut AuthEnv<'_>) -> PhaseResult {
        if !env.conn.role().is_server() {
            return Err(AuthFailure::WrongRole);
        }
        let symmetric_key = self
            .symmetric_key
            .ok_or(AuthFailure::UnexpectedMessage)?;

        env.conn.enable_send_encryption(&symmetric_key);
        debug!("handshake complete, outbound encryption enabled");
        Ok(())
    }
}

impl Default for AutomaticEncryptionPhase {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// CONNECTION PHASE FAMILY
// =============================================================================

/// Connection-family phase variants.
pub enum ConnectionPhase {
    /// The automatic encryption handshake.
    AutomaticEncryption(AutomaticEncryptionPhase),
}

impl ConnectionPhase {
    /// Typed accessor for the encryption phase variant.
    pub fn as_encryption_mut(&mut self) -> Option<&mut AutomaticEncryptionPhase> {
        match self {
            Self::AutomaticEncryption(phase) => Some(phase),
        }
    }
}

impl<'a> PhaseStep<AuthEnv<'a>> for ConnectionPhase {
    fn name(&self) -> &'static str {
        match self {
            Self::AutomaticEncryption(_) => "automatic_encryption",
        }
    }

    fn start(&mut self, env: &mut AuthEnv<'a>) -> PhaseOutcome {
        match self {
            Self::AutomaticEncryption(phase) => phase.begin(env),
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
        InMemorySanctions, JwtIdentityProvider, RecordingAntiCheat, Services,
    };
    use std::sync::{Arc, Mutex};

    fn services() -> Services {
        Services {
            identity: Box::new(JwtIdentityProvider::unconfigured()),
            sanctions: Box::new(InMemorySanctions::new()),
            anticheat: Box::new(RecordingAntiCheat::new()),
        }
    }

    struct End {
        conn: Connection,
        services: Services,
        settings: AuthSettings,
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl End {
        fn new(role: ConnectionRole, settings: AuthSettings) -> Self {
            let (link, frames, _closed) = MemoryLink::new();
            Self {
                conn: Connection::new(role, Box::new(link)),
                services: services(),
                settings,
                frames,
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

        /// Pop the oldest outbound frame and decode it through the
        /// connection's inbound path of `other`.
        fn take_frame(&self) -> Vec<u8> {
            self.frames.lock().unwrap().remove(0)
        }
    }

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let signing = SigningKey::generate(&mut OsRng);
        (
            signing.to_bytes(),
            signing.verifying_key().to_bytes(),
        )
    }

    fn server_settings(seed: [u8; 32]) -> AuthSettings {
        AuthSettings {
            trusted_server: true,
            server_signing_key: Some(seed),
            ..Default::default()
        }
    }

    fn client_settings(public: [u8; 32]) -> AuthSettings {
        AuthSettings {
            server_public_key: Some(public),
            ..Default::default()
        }
    }

    #[test]
    fn test_session_key_derivation_matches() {
        let a = derive_session_keys(&[1; 32], &[2; 32], &[3; 32]);
        let b = derive_session_keys(&[1; 32], &[2; 32], &[3; 32]);
        assert_eq!(a.server_to_client, b.server_to_client);
        assert_eq!(a.client_to_server, b.client_to_server);
        assert_ne!(a.server_to_client, a.client_to_server);
    }

    #[test]
    fn test_symmetric_key_seal_round_trip() {
        let key = [7u8; 32];
        let session_key = [9u8; 32];
        let sealed = seal_symmetric_key(&key, &session_key);
        assert_eq!(open_symmetric_key(&sealed, &session_key), Some(key));
        assert_eq!(open_symmetric_key(&sealed, &[8u8; 32]), None);
        assert_eq!(open_symmetric_key(&sealed[..4], &session_key), None);
    }

    #[test]
    fn test_no_keypair_is_noop_success() {
        let mut server = End::new(
            ConnectionRole::DedicatedServer,
            AuthSettings::default(),
        );
        let mut phase = AutomaticEncryptionPhase::new();
        let outcome = server.with_env(|env| phase.begin(env));
        assert!(matches!(outcome, PhaseOutcome::Finished(Ok(()))));
        assert!(server.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_full_handshake_establishes_shared_key() {
        let (seed, public) = keypair();
        let mut server = End::new(ConnectionRole::DedicatedServer, server_settings(seed));
        let mut client = End::new(ConnectionRole::ClientToDedicated, client_settings(public));

        let mut server_phase = AutomaticEncryptionPhase::new();
        let mut client_phase = AutomaticEncryptionPhase::new();

        // 1. server -> client
        let outcome = server.with_env(|env| server_phase.begin(env));
        assert!(matches!(outcome, PhaseOutcome::Pending));
        let frame = server.take_frame();
        let (t, body) = protocol::split_frame(&frame).unwrap();
        assert_eq!(t, msg_type::REQUEST_CLIENT_EPHEMERAL_KEY);
        let request: RequestClientEphemeralKey = protocol::decode(body).unwrap();

        // 2. client -> server
        client
            .with_env(|env| client_phase.handle_request_client_key(request, env))
            .unwrap();
        assert!(client.conn.is_trusted());
        let frame = client.take_frame();
        let (t, body) = protocol::split_frame(&frame).unwrap();
        assert_eq!(t, msg_type::DELIVER_CLIENT_EPHEMERAL_KEY);
        let deliver: DeliverClientEphemeralKey = protocol::decode(body).unwrap();

        // 3. server -> client
        server
            .with_env(|env| server_phase.handle_deliver_client_key(deliver, env))
            .unwrap();
        assert!(server.conn.recv_encrypted());
        assert!(!server.conn.send_encrypted());
        let frame = server.take_frame();
        let (t, body) = protocol::split_frame(&frame).unwrap();
        assert_eq!(t, msg_type::SYMMETRIC_KEY_EXCHANGE);
        let exchange: SymmetricKeyExchange = protocol::decode(body).unwrap();

        // 4. client enables both directions and confirms, encrypted.
        client
            .with_env(|env| client_phase.handle_symmetric_key(exchange, env))
            .unwrap();
        assert!(client.conn.fully_encrypted());
        let sealed_confirm = client.take_frame();

        // The confirmation is sealed: the server must decrypt it.
        let plain = server.conn.open_inbound(&sealed_confirm).unwrap();
        let (t, _) = protocol::split_frame(&plain).unwrap();
        assert_eq!(t, msg_type::ENABLE_ENCRYPTION);

        // 5. server finishes.
        server
            .with_env(|env| server_phase.handle_enable_encryption(env))
            .unwrap();
        assert!(server.conn.fully_encrypted());

        // Round trip over the established channel, both directions.
        server.conn.send(vec![0xCC; 8]);
        let wire = server.take_frame();
        assert_eq!(client.conn.open_inbound(&wire).unwrap(), vec![0xCC; 8]);
    }

    #[test]
    fn test_tampered_signature_is_untrusted_server() {
        let (seed, public) = keypair();
        let mut server = End::new(ConnectionRole::DedicatedServer, server_settings(seed));
        let mut client = End::new(ConnectionRole::ClientToDedicated, client_settings(public));

        let mut server_phase = AutomaticEncryptionPhase::new();
        let mut client_phase = AutomaticEncryptionPhase::new();

        server.with_env(|env| server_phase.begin(env));
        let frame = server.take_frame();
        let (_, body) = protocol::split_frame(&frame).unwrap();
        let mut request: RequestClientEphemeralKey = protocol::decode(body).unwrap();
        request.signature[0] ^= 0xFF;

        let result =
            client.with_env(|env| client_phase.handle_request_client_key(request, env));
        assert_eq!(result, Err(AuthFailure::UntrustedServer));
        assert!(!client.conn.is_trusted());
        // No ephemeral key was ever delivered.
        assert!(client.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_wrong_role_fails_closed() {
        let (seed, public) = keypair();
        // A server receiving the server-originated message must refuse it.
        let mut server = End::new(ConnectionRole::DedicatedServer, server_settings(seed));
        let mut phase = AutomaticEncryptionPhase::new();
        let request = RequestClientEphemeralKey {
            public_key: public,
            signature: vec![0; 64],
        };
        let result = server.with_env(|env| phase.handle_request_client_key(request, env));
        assert_eq!(result, Err(AuthFailure::WrongRole));
    }

    #[test]
    fn test_unsolicited_deliver_fails() {
        let (seed, _) = keypair();
        let mut server = End::new(ConnectionRole::DedicatedServer, server_settings(seed));
        let mut phase = AutomaticEncryptionPhase::new();
        // No begin() ran: there is no stored ephemeral key.
        let result = server.with_env(|env| {
            phase.handle_deliver_client_key(
                DeliverClientEphemeralKey { public_key: [1; 32] },
                env,
            )
        });
        assert_eq!(result, Err(AuthFailure::UnexpectedMessage));
    }
}
