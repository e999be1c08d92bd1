//! External Service Collaborators
//!
//! Traits for the identity provider, sanctions service, and anti-cheat
//! service the authentication phases call into, plus concrete
//! implementations: a JWT-backed identity provider for real deployments and
//! in-memory fakes for tests and the demo binary.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::identity::Identity;

// =============================================================================
// TYPES
// =============================================================================

/// Externally-issued login credential cached on the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalCredential {
    /// Token type reported by the external identity system.
    pub token_type: String,
    /// Display name bound to the credential.
    pub display_name: String,
    /// The opaque credential token itself.
    pub token: String,
}

/// One sanction record returned by the sanctions service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sanction {
    /// Action code, e.g. `"BAN"` or `"RESTRICT_GAME_ACCESS"`.
    pub action: String,
    /// When the sanction was issued.
    pub issued_at: Option<DateTime<Utc>>,
    /// When the sanction expires, if ever.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Sanction {
    /// Action codes that deny play outright.
    pub fn denies_access(&self) -> bool {
        self.action == "BAN" || self.action == "RESTRICT_GAME_ACCESS"
    }
}

/// Classification the anti-cheat service registers a player under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntiCheatClientType {
    /// Client proved it runs the protected anti-cheat build.
    ProtectedClient,
    /// Client proved trust via a platform signature without the protected build.
    UnprotectedTrusted,
    /// Client could not provide any proof.
    CannotProvideProof,
}

/// Identity provider errors.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Provider has no key material configured.
    #[error("identity provider not configured")]
    NotConfigured,
    /// Token did not validate.
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// No such identity is known to the provider.
    #[error("unknown identity")]
    UnknownIdentity,
    /// The external login call was rejected.
    #[error("login rejected: {0}")]
    LoginRejected(String),
}

/// Sanctions service errors.
#[derive(Debug, Clone, Error)]
pub enum SanctionQueryError {
    /// The querying account lacks permission to read sanctions. Treated as
    /// success-with-warning by the sanction check phase.
    #[error("no permission to query sanctions")]
    NoPermission,
    /// The service was unreachable or failed.
    #[error("sanctions service unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// SERVICE TRAITS
// =============================================================================

/// Identity provider boundary: token issuance and verification, cached
/// external credentials, and the local identity-info cache.
pub trait IdentityProvider: Send {
    /// Client side: produce a short-lived ID token for the given identity.
    fn issue_id_token(&self, identity: &Identity) -> Result<String, ProviderError>;

    /// Server side: verify an ID token and return the identity it proves.
    fn verify_id_token(&self, token: &str) -> Result<Identity, ProviderError>;

    /// Client side: look up the cached externally-issued credential for the
    /// identity. `None` is the expected outcome for anonymous/device-id
    /// logins, which trusted dedicated servers do not accept.
    fn cached_credential(&self, identity: &Identity) -> Option<ExternalCredential>;

    /// Server side: perform an external-identity login with a replayed
    /// credential and return the identity it resolves to.
    fn external_login(&self, credential: &ExternalCredential) -> Result<Identity, ProviderError>;

    /// Whether the local identity-info cache knows this identity.
    fn knows_identity(&self, identity: &Identity) -> bool;
}

/// Sanctions service boundary.
pub trait SanctionService: Send {
    /// Query active sanctions against an identity.
    fn active_sanctions(&self, identity: &Identity) -> Result<Vec<Sanction>, SanctionQueryError>;
}

/// Anti-cheat service boundary.
pub trait AntiCheatService: Send {
    /// Register a player under the determined client type and platform.
    fn register_player(
        &mut self,
        identity: &Identity,
        client_type: AntiCheatClientType,
        platform: &str,
    ) -> Result<(), String>;

    /// Unregister a previously registered player.
    fn unregister_player(&mut self, identity: &Identity);

    /// Deliver an opaque relayed anti-cheat payload.
    fn receive_message(&mut self, identity: Option<&Identity>, payload: &[u8]);
}

/// The full set of collaborators one dispatcher talks to.
pub struct Services {
    /// Identity provider.
    pub identity: Box<dyn IdentityProvider>,
    /// Sanctions service.
    pub sanctions: Box<dyn SanctionService>,
    /// Anti-cheat service.
    pub anticheat: Box<dyn AntiCheatService>,
}

// =============================================================================
// JWT IDENTITY PROVIDER
// =============================================================================

/// Claims carried by warden ID tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the account the token proves.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// Derive the identity this token proves.
    pub fn identity(&self) -> Identity {
        Identity::from_subject(&self.sub)
    }
}

/// HS256 JWT identity provider.
///
/// Holds the shared token secret, a set of identities the local cache knows,
/// the subject registered for each identity, and (client side) cached
/// external credentials.
pub struct JwtIdentityProvider {
    secret: Option<String>,
    issuer: Option<String>,
    known: HashMap<Identity, String>,
    credentials: HashMap<Identity, ExternalCredential>,
    token_ttl_secs: u64,
}

impl JwtIdentityProvider {
    /// Create a provider with the given token secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            issuer: None,
            known: HashMap::new(),
            credentials: HashMap::new(),
            token_ttl_secs: 300,
        }
    }

    /// Create an unconfigured provider (every token operation fails).
    pub fn unconfigured() -> Self {
        Self {
            secret: None,
            issuer: None,
            known: HashMap::new(),
            credentials: HashMap::new(),
            token_ttl_secs: 300,
        }
    }

    /// Set the expected issuer claim.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Register an account subject, making its identity known locally.
    /// Returns the derived identity.
    pub fn register_subject(&mut self, subject: &str) -> Identity {
        let identity = Identity::from_subject(subject);
        self.known.insert(identity, subject.to_string());
        identity
    }

    /// Cache an external credential for an identity (client side).
    pub fn cache_credential(&mut self, identity: Identity, credential: ExternalCredential) {
        self.credentials.insert(identity, credential);
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn validate(&self, token: &str) -> Result<TokenClaims, ProviderError> {
        let secret = self.secret.as_ref().ok_or(ProviderError::NotConfigured)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = std::collections::HashSet::new();
        validation.validate_aud = false;
        if let Some(ref issuer) = self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let key = DecodingKey::from_secret(secret.as_bytes());
        let token_data: TokenData<TokenClaims> = decode(token, &key, &validation)
            .map_err(|e| ProviderError::InvalidToken(e.to_string()))?;

        let claims = token_data.claims;
        if claims.sub.is_empty() {
            return Err(ProviderError::InvalidToken("missing sub claim".into()));
        }
        if claims.exp > 0 && Self::now_secs() > claims.exp {
            return Err(ProviderError::InvalidToken("token expired".into()));
        }

        Ok(claims)
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn issue_id_token(&self, identity: &Identity) -> Result<String, ProviderError> {
        let secret = self.secret.as_ref().ok_or(ProviderError::NotConfigured)?;
        let subject = self
            .known
            .get(identity)
            .ok_or(ProviderError::UnknownIdentity)?;

        let now = Self::now_secs();
        let claims = TokenClaims {
            sub: subject.clone(),
            exp: now + self.token_ttl_secs,
            iat: now,
            iss: self.issuer.clone(),
            aud: None,
        };

        let key = EncodingKey::from_secret(secret.as_bytes());
        encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|e| ProviderError::InvalidToken(e.to_string()))
    }

    fn verify_id_token(&self, token: &str) -> Result<Identity, ProviderError> {
        self.validate(token).map(|claims| claims.identity())
    }

    fn cached_credential(&self, identity: &Identity) -> Option<ExternalCredential> {
        self.credentials.get(identity).cloned()
    }

    fn external_login(&self, credential: &ExternalCredential) -> Result<Identity, ProviderError> {
        // The credential token doubles as an ID token in this provider; a
        // full deployment would call the external identity system here.
        let claims = self.validate(&credential.token)?;
        let identity = claims.identity();
        if !self.known.contains_key(&identity) {
            return Err(ProviderError::LoginRejected("unregistered account".into()));
        }
        Ok(identity)
    }

    fn knows_identity(&self, identity: &Identity) -> bool {
        self.known.contains_key(identity)
    }
}

// =============================================================================
// IN-MEMORY FAKES
// =============================================================================

/// In-memory sanctions list.
pub struct InMemorySanctions {
    records: HashMap<Identity, Vec<Sanction>>,
    permitted: bool,
}

impl InMemorySanctions {
    /// Empty, permitted sanctions list.
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            permitted: true,
        }
    }

    /// A list the caller has no permission to query.
    pub fn without_permission() -> Self {
        Self {
            records: HashMap::new(),
            permitted: false,
        }
    }

    /// Record a sanction against an identity.
    pub fn add(&mut self, identity: Identity, sanction: Sanction) {
        self.records.entry(identity).or_default().push(sanction);
    }
}

impl Default for InMemorySanctions {
    fn default() -> Self {
        Self::new()
    }
}

impl SanctionService for InMemorySanctions {
    fn active_sanctions(&self, identity: &Identity) -> Result<Vec<Sanction>, SanctionQueryError> {
        if !self.permitted {
            return Err(SanctionQueryError::NoPermission);
        }
        Ok(self.records.get(identity).cloned().unwrap_or_default())
    }
}

/// What a [`RecordingAntiCheat`] has observed so far.
#[derive(Debug, Default)]
pub struct AntiCheatRecord {
    /// Players registered so far, with their classification and platform.
    pub registered: Vec<(Identity, AntiCheatClientType, String)>,
    /// Players currently unregistered.
    pub unregistered: HashSet<Identity>,
    /// Relayed payload sizes seen.
    pub relayed: Vec<usize>,
}

/// Anti-cheat fake that records every call. The record is shared so callers
/// keep a handle after the fake moves into a [`Services`] bundle.
pub struct RecordingAntiCheat {
    record: Arc<Mutex<AntiCheatRecord>>,
    fail_registration: Option<String>,
}

impl RecordingAntiCheat {
    /// Empty recorder.
    pub fn new() -> Self {
        Self {
            record: Arc::new(Mutex::new(AntiCheatRecord::default())),
            fail_registration: None,
        }
    }

    /// A recorder whose registration calls fail with the given reason.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            record: Arc::new(Mutex::new(AntiCheatRecord::default())),
            fail_registration: Some(reason.into()),
        }
    }

    /// Shared handle to the observed calls.
    pub fn record(&self) -> Arc<Mutex<AntiCheatRecord>> {
        self.record.clone()
    }
}

impl Default for RecordingAntiCheat {
    fn default() -> Self {
        Self::new()
    }
}

impl AntiCheatService for RecordingAntiCheat {
    fn register_player(
        &mut self,
        identity: &Identity,
        client_type: AntiCheatClientType,
        platform: &str,
    ) -> Result<(), String> {
        if let Some(reason) = &self.fail_registration {
            return Err(reason.clone());
        }
        self.record
            .lock()
            .unwrap()
            .registered
            .push((*identity, client_type, platform.to_string()));
        Ok(())
    }

    fn unregister_player(&mut self, identity: &Identity) {
        self.record.lock().unwrap().unregistered.insert(*identity);
    }

    fn receive_message(&mut self, identity: Option<&Identity>, payload: &[u8]) {
        debug!(
            identity = ?identity.map(Identity::short),
            len = payload.len(),
            "anti-cheat relay payload"
        );
        self.record.lock().unwrap().relayed.push(payload.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with(subject: &str) -> (JwtIdentityProvider, Identity) {
        let mut provider = JwtIdentityProvider::new("test-secret-key-256-bits-long!!");
        let identity = provider.register_subject(subject);
        (provider, identity)
    }

    #[test]
    fn test_issue_then_verify_round_trip() {
        let (provider, identity) = provider_with("user123");
        let token = provider.issue_id_token(&identity).unwrap();
        let verified = provider.verify_id_token(&token).unwrap();
        assert_eq!(verified, identity);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (provider, identity) = provider_with("user123");
        let token = provider.issue_id_token(&identity).unwrap();

        let other = JwtIdentityProvider::new("a-completely-different-secret!!");
        assert!(matches!(
            other.verify_id_token(&token),
            Err(ProviderError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_unconfigured_provider_fails() {
        let provider = JwtIdentityProvider::unconfigured();
        assert!(matches!(
            provider.verify_id_token("x.y.z"),
            Err(ProviderError::NotConfigured)
        ));
    }

    #[test]
    fn test_issue_for_unknown_identity_fails() {
        let provider = JwtIdentityProvider::new("test-secret-key-256-bits-long!!");
        let unknown = Identity::from_subject("nobody");
        assert!(matches!(
            provider.issue_id_token(&unknown),
            Err(ProviderError::UnknownIdentity)
        ));
    }

    #[test]
    fn test_external_login_resolves_registered_account() {
        let (mut provider, identity) = provider_with("user123");
        let token = provider.issue_id_token(&identity).unwrap();
        let credential = ExternalCredential {
            token_type: "external".into(),
            display_name: "User".into(),
            token,
        };
        provider.cache_credential(identity, credential.clone());

        assert_eq!(provider.external_login(&credential).unwrap(), identity);
        assert_eq!(
            provider.cached_credential(&identity).unwrap().display_name,
            "User"
        );
    }

    #[test]
    fn test_sanction_denies_access() {
        let ban = Sanction {
            action: "BAN".into(),
            issued_at: None,
            expires_at: None,
        };
        let warning = Sanction {
            action: "WARNING".into(),
            issued_at: None,
            expires_at: None,
        };
        assert!(ban.denies_access());
        assert!(!warning.denies_access());
    }

    #[test]
    fn test_sanctions_permission_gate() {
        let identity = Identity::from_subject("user123");
        let service = InMemorySanctions::without_permission();
        assert!(matches!(
            service.active_sanctions(&identity),
            Err(SanctionQueryError::NoPermission)
        ));
    }
}
