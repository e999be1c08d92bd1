//! Authentication Failure Codes
//!
//! A single closed taxonomy of fine-grained failure codes. Each variant names
//! the exact message or phase and the exact violated precondition. Failures
//! never propagate as panics: every phase reports its outcome as a
//! [`PhaseResult`], where `Ok(())` is the sole success value.

use thiserror::Error;

/// Outcome of one authentication phase (or a whole phase run).
pub type PhaseResult = Result<(), AuthFailure>;

/// Closed enumeration of authentication failure codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    /// A control frame failed to decode.
    #[error("malformed control message")]
    MalformedMessage,

    /// A message arrived on a connection whose role must not send or receive it.
    #[error("wrong connection role for this message")]
    WrongRole,

    /// A message in the reserved auth range reached the dispatcher unconsumed.
    #[error("unexpected authentication message")]
    UnexpectedMessage,

    /// An encryption handshake message arrived but automatic encryption is not enabled.
    #[error("automatic encryption is not enabled")]
    EncryptionNotEnabled,

    /// This phase requires an already-encrypted connection.
    #[error("phase requires an encrypted connection")]
    EncryptionRequired,

    /// The server's ephemeral-key signature did not verify: do not trust this server.
    #[error("server signature verification failed, untrusted server")]
    UntrustedServer,

    /// A key in a handshake message had the wrong length.
    #[error("handshake key has invalid length")]
    BadKeyLength,

    /// The one-way authenticated key exchange failed to complete.
    #[error("key exchange failed")]
    KeyExchangeFailed,

    /// The symmetric transport key could not be decrypted with the session key.
    #[error("symmetric key decryption failed")]
    SymmetricKeyDecrypt,

    /// A login or beacon request carried no usable identity.
    #[error("missing player identity")]
    MissingIdentity,

    /// The verified identity does not match the claimed one.
    #[error("token is for a different account")]
    IdentityMismatch,

    /// The identity provider rejected the presented ID token.
    #[error("identity token verification failed")]
    TokenVerificationFailed,

    /// The client could not produce an ID token for the claimed identity.
    #[error("could not obtain an identity token")]
    TokenRequestFailed,

    /// The client holds no cached externally-issued credential for the claimed
    /// identity. Expected for anonymous and device-id logins, which are
    /// unsupported on trusted dedicated servers.
    #[error("no cached login credential for this account")]
    NoCachedCredential,

    /// The external-identity login call failed.
    #[error("external login failed")]
    ExternalLoginFailed,

    /// The claimed identity is unknown to the local identity service.
    #[error("unknown account")]
    UnknownIdentity,

    /// The account has an active ban or access-restriction sanction.
    #[error("account has an active ban sanction")]
    SanctionBan,

    /// The sanctions service failed for a reason other than missing permission.
    #[error("sanction lookup failed")]
    SanctionQueryFailed,

    /// The configured trusted-client public key could not be decoded.
    #[error("trusted client key is invalid")]
    TrustedClientKeyInvalid,

    /// The client's signed nonce-proof did not verify.
    #[error("client proof verification failed")]
    AntiCheatProofInvalid,

    /// Registering the player with the anti-cheat service failed.
    #[error("anti-cheat registration failed")]
    AntiCheatRegistrationFailed,

    /// The anti-cheat service demanded the player be removed.
    #[error("removed by anti-cheat")]
    AntiCheatViolation,

    /// The active phase exceeded its deadline without finishing.
    #[error("authentication timed out")]
    PhaseTimeout,
}

impl AuthFailure {
    /// Sanitized, user-facing reason string: trailing periods stripped,
    /// generic suffix appended. This is the only form ever sent to clients.
    pub fn user_notice(&self) -> String {
        let reason = self.to_string();
        let trimmed = reason.trim_end_matches('.');
        format!("{trimmed}. Please reconnect and try again.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_notice_appends_suffix() {
        let notice = AuthFailure::SanctionBan.user_notice();
        assert_eq!(
            notice,
            "account has an active ban sanction. Please reconnect and try again."
        );
    }

    #[test]
    fn test_user_notice_strips_trailing_periods() {
        // No variant message carries a trailing period today; the sanitizer
        // still has to hold if one ever does.
        let raw = "something went wrong...";
        let trimmed = raw.trim_end_matches('.');
        assert_eq!(trimmed, "something went wrong");
    }

    #[test]
    fn test_success_is_ok() {
        let result: PhaseResult = Ok(());
        assert!(result.is_ok());
    }
}
