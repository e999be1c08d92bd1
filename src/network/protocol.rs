//! Control Channel Messages
//!
//! Wire format for connection-setup messages: one leading message-type byte
//! followed by a bincode-encoded payload struct. Authentication messages live
//! in a reserved sub-range so they are unambiguous against the engine's
//! built-in control messages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Identity;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// Message-type byte values.
pub mod msg_type {
    /// Connection hello (engine message, intercepted by the dispatcher).
    pub const HELLO: u8 = 0x01;
    /// Player login request (engine message, intercepted).
    pub const LOGIN: u8 = 0x02;
    /// Beacon join request (engine message, intercepted).
    pub const BEACON_JOIN: u8 = 0x03;
    /// Stat write (engine message, intercepted and gated, not handled here).
    pub const WRITE_STAT: u8 = 0x04;
    /// Authentication failure notice sent before a forced close.
    pub const FAILURE_NOTICE: u8 = 0x05;

    /// First byte of the reserved authentication range.
    pub const AUTH_RANGE_START: u8 = 0xE0;
    /// Last byte of the reserved authentication range.
    pub const AUTH_RANGE_END: u8 = 0xEF;

    /// Opaque anti-cheat payload relay.
    pub const ANTICHEAT_RELAY: u8 = 0xE0;
    /// Encryption handshake 1: server's signed ephemeral key.
    pub const REQUEST_CLIENT_EPHEMERAL_KEY: u8 = 0xE1;
    /// Encryption handshake 2: client's ephemeral key response.
    pub const DELIVER_CLIENT_EPHEMERAL_KEY: u8 = 0xE2;
    /// Encryption handshake 3: sealed symmetric transport key.
    pub const SYMMETRIC_KEY_EXCHANGE: u8 = 0xE3;
    /// Encryption handshake 4: client enables bidirectional encryption.
    pub const ENABLE_ENCRYPTION: u8 = 0xE4;
    /// Encryption acknowledgement. Defined but intentionally not processed.
    pub const ENCRYPTION_ACK: u8 = 0xE5;
    /// Server asks the client for a short-lived ID token.
    pub const REQUEST_ID_TOKEN: u8 = 0xE6;
    /// Client delivers its ID token.
    pub const DELIVER_ID_TOKEN: u8 = 0xE7;
    /// Server asks the client for its cached external credential.
    pub const REQUEST_CLIENT_TOKEN: u8 = 0xE8;
    /// Client delivers its external credential.
    pub const DELIVER_CLIENT_TOKEN: u8 = 0xE9;
    /// Server asks the client for a signed nonce proof.
    pub const REQUEST_TRUSTED_CLIENT_PROOF: u8 = 0xEA;
    /// Client delivers its nonce proof.
    pub const DELIVER_TRUSTED_CLIENT_PROOF: u8 = 0xEB;

    /// Whether a message type lies in the reserved authentication range.
    pub fn in_auth_range(value: u8) -> bool {
        (AUTH_RANGE_START..=AUTH_RANGE_END).contains(&value)
    }
}

/// Protocol encode/decode errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload failed to encode or decode.
    #[error("codec failed: {0}")]
    Codec(#[from] bincode::Error),
    /// Frame was empty or truncated.
    #[error("frame truncated")]
    Truncated,
}

// =============================================================================
// ENGINE PAYLOADS (intercepted)
// =============================================================================

/// Connection hello parameters, replayed into the engine after the
/// connection-level phase queue completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Client build version string.
    pub client_version: String,
    /// Network protocol version.
    pub network_version: u32,
}

/// Player login request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginPayload {
    /// Claimed identity. Absent for anonymous connections.
    pub identity: Option<Identity>,
    /// Requested display name.
    pub nickname: String,
    /// Online platform the client reports.
    pub online_platform: String,
}

/// Beacon join request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconJoinPayload {
    /// Claimed identity. Absent for anonymous connections.
    pub identity: Option<Identity>,
    /// Name of the beacon being joined.
    pub beacon_name: String,
}

/// Stat write request. Gated by configuration; the stat pipeline itself is
/// outside this subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteStatPayload {
    /// Identity whose stat is written.
    pub identity: Identity,
    /// Stat name.
    pub stat: String,
    /// New value.
    pub value: i64,
}

/// Sanitized authentication failure notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNotice {
    /// User-facing reason string.
    pub reason: String,
}

/// Opaque anti-cheat payload relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiCheatRelayPayload {
    /// Player the payload concerns, when known.
    pub identity: Option<Identity>,
    /// Opaque service payload.
    pub blob: Vec<u8>,
}

// =============================================================================
// ENCRYPTION HANDSHAKE PAYLOADS
// =============================================================================

/// Handshake 1 (server -> client): fresh per-connection X25519 public key,
/// signed with the server's long-term ed25519 key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestClientEphemeralKey {
    /// Server's ephemeral key-exchange public key.
    pub public_key: [u8; 32],
    /// ed25519 signature over the domain tag and the public key. Length is
    /// validated on receipt; a wrong length fails the handshake closed.
    pub signature: Vec<u8>,
}

/// Handshake 2 (client -> server): the client's ephemeral public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverClientEphemeralKey {
    /// Client's ephemeral key-exchange public key.
    pub public_key: [u8; 32],
}

/// Handshake 3 (server -> client): symmetric transport key sealed under the
/// derived server-to-client session key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymmetricKeyExchange {
    /// Nonce-prefixed AEAD ciphertext of the 32-byte symmetric key.
    pub sealed_key: Vec<u8>,
}

/// Handshake 4 (client -> server): sent over the now-encrypted channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableEncryption;

// =============================================================================
// VERIFICATION PAYLOADS
// =============================================================================

/// Server asks the client to produce a short-lived ID token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestIdToken {
    /// The identity the token must prove.
    pub identity: Identity,
}

/// Client returns its ID token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverIdToken {
    /// The identity the token claims to prove.
    pub identity: Identity,
    /// The token.
    pub token: String,
}

/// Server asks the client for its cached external credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestClientToken {
    /// The identity whose credential is requested.
    pub identity: Identity,
}

/// Client returns its cached external credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverClientToken {
    /// The identity the credential belongs to.
    pub identity: Identity,
    /// Token type.
    pub token_type: String,
    /// Display name.
    pub display_name: String,
    /// The credential token.
    pub token: String,
}

// =============================================================================
// ANTI-CHEAT PROOF PAYLOADS
// =============================================================================

/// Server asks the client to sign a nonce with its platform key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTrustedClientProof {
    /// The identity being proven.
    pub identity: Identity,
    /// Random nonce to sign.
    pub nonce: [u8; 32],
}

/// Client returns its nonce proof (or declares it has none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverTrustedClientProof {
    /// The identity being proven.
    pub identity: Identity,
    /// Whether a signature is attached.
    pub has_proof: bool,
    /// ed25519 signature over the nonce, empty when `has_proof` is false.
    pub signature: Vec<u8>,
    /// Platform the client reports.
    pub platform: String,
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// Encode a message as a frame: type byte followed by the bincode payload.
pub fn encode<T: Serialize>(msg_type: u8, payload: &T) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(payload)?;
    let mut frame = Vec::with_capacity(1 + body.len());
    frame.push(msg_type);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a payload from the bytes following the type byte.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(payload).map_err(ProtocolError::Codec)
}

/// Split a raw frame into its type byte and payload bytes.
pub fn split_frame(frame: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    match frame.split_first() {
        Some((&msg_type, payload)) => Ok((msg_type, payload)),
        None => Err(ProtocolError::Truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let payload = LoginPayload {
            identity: Some(Identity::from_subject("user123")),
            nickname: "Sparks".into(),
            online_platform: "pc".into(),
        };
        let frame = encode(msg_type::LOGIN, &payload).unwrap();

        let (t, body) = split_frame(&frame).unwrap();
        assert_eq!(t, msg_type::LOGIN);
        let decoded: LoginPayload = decode(body).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_empty_frame_is_truncated() {
        assert!(matches!(split_frame(&[]), Err(ProtocolError::Truncated)));
    }

    #[test]
    fn test_garbage_payload_fails_decode() {
        let result: Result<HelloPayload, _> = decode(&[0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn test_auth_range_bounds() {
        assert!(msg_type::in_auth_range(msg_type::ANTICHEAT_RELAY));
        assert!(msg_type::in_auth_range(msg_type::DELIVER_TRUSTED_CLIENT_PROOF));
        assert!(msg_type::in_auth_range(0xEF));
        assert!(!msg_type::in_auth_range(msg_type::HELLO));
        assert!(!msg_type::in_auth_range(0xDF));
        assert!(!msg_type::in_auth_range(0xF0));
    }
}
