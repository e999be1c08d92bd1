//! Authentication Configuration
//!
//! Env-driven settings for the authentication gate, plus the startup
//! capability negotiation that turns raw settings into the concrete set of
//! phases a connection will run. Capability resolution happens once, up
//! front, so phase selection never branches on build-time SDK flags.

use std::time::Duration;

/// How connecting identities are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No verification: logins succeed without an identity.
    Off,
    /// Short-lived ID tokens checked against the identity provider.
    IdToken,
    /// Externally-issued login credentials replayed through the provider.
    UserCredentials,
}

impl AuthMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(Self::Off),
            "id_token" => Some(Self::IdToken),
            "user_credentials" => Some(Self::UserCredentials),
            _ => None,
        }
    }
}

/// Authentication settings for one process (server or client side).
#[derive(Clone, Debug)]
pub struct AuthSettings {
    /// Configured authentication mode.
    pub mode: AuthMode,
    /// Trusted-dedicated-server mode: the server holds a long-term signing
    /// key clients can verify before any identity data is exchanged.
    pub trusted_server: bool,
    /// Long-term ed25519 signing seed (server side). Absent means the
    /// automatic encryption phase completes as a no-op.
    pub server_signing_key: Option<[u8; 32]>,
    /// The server's long-term ed25519 public key (client side pin).
    pub server_public_key: Option<[u8; 32]>,
    /// Trusted-client public key for anti-cheat nonce proofs (server side).
    /// Kept raw: decoding is deferred to the proof phase, which fails closed
    /// on an undecodable or wrong-length key.
    pub trusted_client_public_key: Option<Vec<u8>>,
    /// Platform signing key the client uses to answer nonce proofs, if any.
    pub platform_signing_key: Option<[u8; 32]>,
    /// Platform name the client reports with its proof.
    pub client_platform: String,
    /// Whether login-time anti-cheat phases run at all.
    pub anticheat_enabled: bool,
    /// Whether verification includes the sanction check.
    pub sanction_check: bool,
    /// Whether listen servers verify identities against the local cache.
    pub identity_check_on_listen_server: bool,
    /// Whether stat-write messages are accepted on this connection.
    pub accept_stat_writes: bool,
    /// Editor/dev bypass: identity-less logins succeed even outside mode Off.
    pub editor_bypass: bool,
    /// Deadline for any single phase before it fails with a timeout.
    pub phase_timeout: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            mode: AuthMode::IdToken,
            trusted_server: false,
            server_signing_key: None,
            server_public_key: None,
            trusted_client_public_key: None,
            platform_signing_key: None,
            client_platform: "pc".to_string(),
            anticheat_enabled: false,
            sanction_check: false,
            identity_check_on_listen_server: true,
            accept_stat_writes: false,
            editor_bypass: false,
            phase_timeout: Duration::from_secs(30),
        }
    }
}

impl AuthSettings {
    /// Create settings from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            mode: std::env::var("WARDEN_AUTH_MODE")
                .ok()
                .and_then(|v| AuthMode::parse(&v))
                .unwrap_or(defaults.mode),
            trusted_server: env_flag("WARDEN_TRUSTED_SERVER"),
            server_signing_key: env_key32("WARDEN_SERVER_SIGNING_KEY"),
            server_public_key: env_key32("WARDEN_SERVER_PUBLIC_KEY"),
            trusted_client_public_key: std::env::var("WARDEN_TRUSTED_CLIENT_KEY")
                .ok()
                .and_then(|v| hex::decode(v).ok()),
            platform_signing_key: env_key32("WARDEN_PLATFORM_SIGNING_KEY"),
            client_platform: std::env::var("WARDEN_CLIENT_PLATFORM")
                .unwrap_or(defaults.client_platform),
            anticheat_enabled: env_flag("WARDEN_ANTICHEAT"),
            sanction_check: env_flag("WARDEN_SANCTION_CHECK"),
            identity_check_on_listen_server: std::env::var("WARDEN_LISTEN_IDENTITY_CHECK")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.identity_check_on_listen_server),
            accept_stat_writes: env_flag("WARDEN_ACCEPT_STAT_WRITES"),
            editor_bypass: env_flag("WARDEN_EDITOR_BYPASS"),
            phase_timeout: std::env::var("WARDEN_PHASE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.phase_timeout),
        }
    }

    /// Resolve settings into the concrete capabilities a connection runs with.
    pub fn capabilities(&self) -> AuthCapabilities {
        AuthCapabilities {
            automatic_encryption: self.trusted_server && self.server_signing_key.is_some(),
            anticheat: self.anticheat_enabled,
            sanctions: self.sanction_check,
        }
    }
}

/// Concrete, version-agnostic capability set resolved at startup.
#[derive(Debug, Clone, Copy)]
pub struct AuthCapabilities {
    /// The automatic encryption handshake will run on dedicated-server
    /// connections.
    pub automatic_encryption: bool,
    /// Login-time anti-cheat phases will run for player connections.
    pub anticheat: bool,
    /// Verification includes the sanction check.
    pub sanctions: bool,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn env_key32(name: &str) -> Option<[u8; 32]> {
    let raw = std::env::var(name).ok()?;
    let bytes = hex::decode(raw).ok()?;
    let arr: [u8; 32] = bytes.try_into().ok()?;
    Some(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AuthSettings::default();
        assert_eq!(settings.mode, AuthMode::IdToken);
        assert!(!settings.trusted_server);
        assert!(settings.identity_check_on_listen_server);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(AuthMode::parse("off"), Some(AuthMode::Off));
        assert_eq!(AuthMode::parse("id_token"), Some(AuthMode::IdToken));
        assert_eq!(
            AuthMode::parse("user_credentials"),
            Some(AuthMode::UserCredentials)
        );
        assert_eq!(AuthMode::parse("bogus"), None);
    }

    #[test]
    fn test_encryption_capability_needs_key_and_mode() {
        let mut settings = AuthSettings {
            trusted_server: true,
            ..Default::default()
        };
        assert!(!settings.capabilities().automatic_encryption);

        settings.server_signing_key = Some([7u8; 32]);
        assert!(settings.capabilities().automatic_encryption);

        settings.trusted_server = false;
        assert!(!settings.capabilities().automatic_encryption);
    }
}
