//! Connection State
//!
//! Per-connection state the authentication layer owns at the networking
//! boundary: the connection's role, the player-identity slot that
//! verification fills in, and the symmetric encryption state with
//! independently enabled inbound and outbound directions (the handshake
//! installs the inbound direction first).

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use tracing::debug;

use crate::identity::Identity;

/// Role of a control-channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Server end of a dedicated-server connection.
    DedicatedServer,
    /// Server end of a listen-server connection.
    ListenServer,
    /// Client connected to a dedicated server.
    ClientToDedicated,
    /// Client connected to a listen server.
    ClientToListen,
}

impl ConnectionRole {
    /// Whether this endpoint drives authentication.
    pub fn is_server(self) -> bool {
        matches!(self, Self::DedicatedServer | Self::ListenServer)
    }

    /// Whether this endpoint only reacts to server-initiated messages.
    pub fn is_client(self) -> bool {
        !self.is_server()
    }
}

/// Transport hooks the connection delivers frames through.
pub trait ControlLink: Send {
    /// Queue an outbound frame (already sealed if encryption is on).
    fn deliver(&mut self, frame: Vec<u8>);
    /// Flush queued frames to the wire.
    fn flush(&mut self);
    /// Close the transport.
    fn close(&mut self, reason: &str);
    /// Whether the transport has been closed.
    fn is_closed(&self) -> bool;
}

/// Per-direction AEAD state: one cipher, one monotonically increasing nonce.
struct DirectionCipher {
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

const FRAME_AAD: &[u8] = b"warden-frame-v1";

impl DirectionCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            nonce: 0,
        }
    }

    /// 12-byte nonce with the counter in the trailing 8 bytes.
    fn next_nonce(&mut self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce = self.nonce.wrapping_add(1);
        bytes
    }

    fn seal(&mut self, plain: &[u8]) -> Vec<u8> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plain,
                    aad: FRAME_AAD,
                },
            )
            .expect("frame sealing cannot fail for in-memory buffers")
    }

    fn open(&mut self, sealed: &[u8]) -> Option<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: sealed,
                    aad: FRAME_AAD,
                },
            )
            .ok()
    }
}

/// One control-channel connection as the authentication layer sees it.
pub struct Connection {
    role: ConnectionRole,
    player_identity: Option<Identity>,
    send_cipher: Option<DirectionCipher>,
    recv_cipher: Option<DirectionCipher>,
    trusted: bool,
    closed: bool,
    link: Box<dyn ControlLink>,
}

impl Connection {
    /// Wrap a transport link with a role.
    pub fn new(role: ConnectionRole, link: Box<dyn ControlLink>) -> Self {
        Self {
            role,
            player_identity: None,
            send_cipher: None,
            recv_cipher: None,
            trusted: false,
            closed: false,
            link,
        }
    }

    /// This endpoint's role.
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// The verified player identity, once a verification chain has set it.
    pub fn player_identity(&self) -> Option<Identity> {
        self.player_identity
    }

    /// Assign the verified player identity.
    pub fn set_player_identity(&mut self, identity: Identity) {
        self.player_identity = Some(identity);
    }

    /// Whether the client has verified the server's long-term key.
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// Mark the server as trusted (client side, after signature verification).
    pub fn set_trusted(&mut self) {
        self.trusted = true;
    }

    /// Whether outbound traffic is encrypted.
    pub fn send_encrypted(&self) -> bool {
        self.send_cipher.is_some()
    }

    /// Whether inbound traffic is decrypted.
    pub fn recv_encrypted(&self) -> bool {
        self.recv_cipher.is_some()
    }

    /// Whether the transport is fully encrypted in both directions.
    pub fn fully_encrypted(&self) -> bool {
        self.send_encrypted() && self.recv_encrypted()
    }

    /// Start decrypting inbound frames with the symmetric key.
    pub fn enable_recv_encryption(&mut self, key: &[u8; 32]) {
        self.recv_cipher = Some(DirectionCipher::new(key));
    }

    /// Start encrypting outbound frames with the symmetric key.
    pub fn enable_send_encryption(&mut self, key: &[u8; 32]) {
        self.send_cipher = Some(DirectionCipher::new(key));
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed || self.link.is_closed()
    }

    /// Send a frame, sealing it first when outbound encryption is on.
    pub fn send(&mut self, frame: Vec<u8>) {
        if self.closed {
            return;
        }
        let wire = match &mut self.send_cipher {
            Some(cipher) => cipher.seal(&frame),
            None => frame,
        };
        self.link.deliver(wire);
    }

    /// Unwrap an inbound frame, decrypting when inbound encryption is on.
    /// Returns `None` when decryption fails; the caller must close.
    pub fn open_inbound(&mut self, wire: &[u8]) -> Option<Vec<u8>> {
        match &mut self.recv_cipher {
            Some(cipher) => cipher.open(wire),
            None => Some(wire.to_vec()),
        }
    }

    /// Flush the transport.
    pub fn flush(&mut self) {
        self.link.flush();
    }

    /// Force-close the transport.
    pub fn close(&mut self, reason: &str) {
        if !self.closed {
            debug!(role = ?self.role, reason, "closing connection");
            self.closed = true;
            self.link.close(reason);
        }
    }
}

/// Test doubles for the transport link, shared by tests across the crate.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Link fake that records delivered frames and the close reason.
    pub struct MemoryLink {
        /// Frames delivered so far, in order.
        pub frames: Arc<Mutex<Vec<Vec<u8>>>>,
        /// Close reason, once closed.
        pub closed: Arc<Mutex<Option<String>>>,
    }

    impl MemoryLink {
        /// A fresh link plus handles to its recorded state.
        #[allow(clippy::type_complexity)]
        pub fn new() -> (Self, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<Option<String>>>) {
            let frames = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(Mutex::new(None));
            (
                Self {
                    frames: frames.clone(),
                    closed: closed.clone(),
                },
                frames,
                closed,
            )
        }
    }

    impl ControlLink for MemoryLink {
        fn deliver(&mut self, frame: Vec<u8>) {
            self.frames.lock().unwrap().push(frame);
        }
        fn flush(&mut self) {}
        fn close(&mut self, reason: &str) {
            *self.closed.lock().unwrap() = Some(reason.to_string());
        }
        fn is_closed(&self) -> bool {
            self.closed.lock().unwrap().is_some()
        }
    }
}
