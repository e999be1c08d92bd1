//! Control Channel Dispatcher
//!
//! Per-connection message router and owner of all per-connection
//! authentication state: at most one connection context, a map of
//! verification contexts keyed by identity, and replay queues of pending
//! logins and beacon joins. Inbound control frames are routed in strict
//! priority order: intercepted engine messages first, then the phase route
//! table, then the reserved-range violation check, then the engine's own
//! generic control handling.
//!
//! The dispatcher is strictly single-threaded per connection: phases suspend
//! by returning `Pending` and are resumed here when the matching message or
//! service callback arrives. All completion decisions (replay, failure
//! notice, close) are made here, never inside a phase.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::auth::anticheat::{AntiCheatIntegrityPhase, AntiCheatProofPhase, LoginPhase};
use crate::auth::code::{AuthFailure, PhaseResult};
use crate::auth::context::{
    AuthKey, BeaconContext, ConnectionContext, LoginContext, VerificationContext,
    VerificationStatus,
};
use crate::auth::encryption::{AutomaticEncryptionPhase, ConnectionPhase};
use crate::auth::phase::{AuthEnv, PhaseQueue, QueueProgress};
use crate::auth::queued::{send_failure_and_close, QueuedBeacon, QueuedLogin};
use crate::auth::verify::{
    IdTokenPhase, IdentityCheckPhase, LegacyCredentialPhase, SanctionCheckPhase,
    VerificationPhase,
};
use crate::config::{AuthCapabilities, AuthMode, AuthSettings};
use crate::identity::Identity;
use crate::network::connection::{Connection, ConnectionRole};
use crate::network::protocol::{
    self, msg_type, AntiCheatRelayPayload, BeaconJoinPayload, DeliverClientEphemeralKey,
    DeliverClientToken, DeliverIdToken, DeliverTrustedClientProof, FailureNotice, HelloPayload,
    LoginPayload, RequestClientEphemeralKey, RequestClientToken, RequestIdToken,
    RequestTrustedClientProof, SymmetricKeyExchange, WriteStatPayload,
};
use crate::services::Services;

/// Everything past the authentication gate lands in the engine.
pub trait EngineSink: Send {
    /// A hello cleared the connection-level phases.
    fn accept_hello(&mut self, hello: HelloPayload);
    /// A login authenticated and is being replayed.
    fn accept_login(&mut self, login: LoginPayload);
    /// A beacon join authenticated and is being replayed.
    fn accept_beacon_join(&mut self, join: BeaconJoinPayload);
    /// A gated stat write passed its checks.
    fn accept_stat_write(&mut self, write: WriteStatPayload);
    /// Generic engine control handling for message types the authentication
    /// layer does not own. Returns true when the message was consumed.
    fn handle_control(&mut self, msg_type: u8, payload: &[u8]) -> bool;
}

/// Which phase family owns a routed message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// Connection-family (encryption handshake) messages.
    Encryption,
    /// Verification-family messages.
    Verification,
    /// Login-family (anti-cheat) messages.
    Login,
}

/// A request entering the authentication gate.
pub enum AuthRequest {
    /// A player login.
    Login(LoginPayload),
    /// A beacon join.
    Beacon(BeaconJoinPayload),
}

enum LoginStep {
    Start,
    Advance(PhaseResult),
}

/// Client-side verification routing context: holds every challenge phase the
/// server might pick, purely for message routing.
fn client_verification_context(identity: Identity) -> VerificationContext {
    let mut ctx = VerificationContext::new(identity);
    ctx.queue.register_for_routing(vec![
        VerificationPhase::IdToken(IdTokenPhase::new(identity)),
        VerificationPhase::LegacyCredential(LegacyCredentialPhase::new(identity)),
    ]);
    ctx
}

/// Builds an [`AuthEnv`] from the dispatcher's fields without borrowing the
/// context maps, so a context can be driven while the env is live.
macro_rules! auth_env {
    ($d:expr) => {
        AuthEnv {
            conn: &mut $d.conn,
            services: &mut $d.services,
            settings: &$d.settings,
            caps: &$d.caps,
        }
    };
}

/// Per-connection authentication router.
pub struct ControlDispatcher {
    conn: Connection,
    services: Services,
    settings: AuthSettings,
    caps: AuthCapabilities,
    engine: Box<dyn EngineSink>,
    routes: HashMap<u8, RouteTarget>,

    // Server-side state.
    connection_ctx: Option<ConnectionContext>,
    verifications: HashMap<Identity, VerificationContext>,
    queued_logins: HashMap<Identity, QueuedLogin>,
    queued_beacons: HashMap<(Identity, String), QueuedBeacon>,
    anticheat_verified: HashSet<Identity>,

    // Client-side routing contexts, created lazily on first use.
    client_connection: Option<PhaseQueue<ConnectionPhase>>,
    client_logins: HashMap<Identity, PhaseQueue<LoginPhase>>,
}

impl ControlDispatcher {
    /// Dispatcher for one connection. Clients pre-register routes for every
    /// server-initiated challenge they may receive; servers register routes
    /// as phases are planned.
    pub fn new(
        conn: Connection,
        services: Services,
        settings: AuthSettings,
        engine: Box<dyn EngineSink>,
    ) -> Self {
        let caps = settings.capabilities();
        let mut dispatcher = Self {
            conn,
            services,
            settings,
            caps,
            engine,
            routes: HashMap::new(),
            connection_ctx: None,
            verifications: HashMap::new(),
            queued_logins: HashMap::new(),
            queued_beacons: HashMap::new(),
            anticheat_verified: HashSet::new(),
            client_connection: None,
            client_logins: HashMap::new(),
        };
        if dispatcher.conn.role().is_client() {
            dispatcher.add_route(
                msg_type::REQUEST_CLIENT_EPHEMERAL_KEY,
                RouteTarget::Encryption,
            );
            dispatcher.add_route(msg_type::SYMMETRIC_KEY_EXCHANGE, RouteTarget::Encryption);
            dispatcher.add_route(msg_type::REQUEST_ID_TOKEN, RouteTarget::Verification);
            dispatcher.add_route(msg_type::REQUEST_CLIENT_TOKEN, RouteTarget::Verification);
            dispatcher.add_route(msg_type::REQUEST_TRUSTED_CLIENT_PROOF, RouteTarget::Login);
        }
        dispatcher
    }

    /// Claim a message type for a phase family.
    pub fn add_route(&mut self, msg_type: u8, target: RouteTarget) {
        self.routes.insert(msg_type, target);
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access to the underlying connection.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Verification progress for an identity, if a run exists.
    pub fn verification_status(&self, identity: &Identity) -> Option<VerificationStatus> {
        self.verifications.get(identity).map(|ctx| ctx.status)
    }

    // =========================================================================
    // INBOUND FRAMES
    // =========================================================================

    /// Entry point for one inbound wire frame: decrypt (once inbound
    /// encryption is on), split, and dispatch.
    pub fn received_frame(&mut self, wire: &[u8]) {
        if self.conn.is_closed() {
            return;
        }
        let Some(plain) = self.conn.open_inbound(wire) else {
            warn!("inbound frame failed to decrypt");
            self.conn.close("frame decryption failed");
            return;
        };
        match protocol::split_frame(&plain) {
            Ok((t, payload)) => self.received_message(t, payload),
            Err(_) => {
                self.conn.close("truncated control frame");
            }
        }
    }

    /// Dispatch one decoded frame in priority order.
    pub fn received_message(&mut self, t: u8, payload: &[u8]) {
        match t {
            // 1. Intercepted engine messages.
            msg_type::HELLO => self.handle_hello(payload),
            msg_type::LOGIN => self.handle_login(payload),
            msg_type::BEACON_JOIN => self.handle_beacon_join(payload),
            msg_type::WRITE_STAT => self.handle_write_stat(payload),
            msg_type::ANTICHEAT_RELAY => self.handle_anticheat_relay(payload),
            // Benign by definition: never escalates to the range check below.
            msg_type::ENCRYPTION_ACK => {
                debug!("encryption ack received, ignored");
            }
            msg_type::FAILURE_NOTICE if self.conn.role().is_client() => {
                if let Ok(notice) = protocol::decode::<FailureNotice>(payload) {
                    warn!(reason = %notice.reason, "server refused authentication");
                }
            }
            _ => {
                // 2. Routed phase messages, dispatched to the owning family.
                if let Some(&target) = self.routes.get(&t) {
                    self.dispatch_route(target, t, payload);
                    return;
                }
                // 3. Reserved-range frames nobody claimed: contract violation.
                if msg_type::in_auth_range(t) {
                    warn!(msg_type = t, "unclaimed message in reserved auth range");
                    self.conn.close("unexpected authentication message");
                    return;
                }
                // 4. Engine fallthrough; unconsumed known types close.
                if !self.engine.handle_control(t, payload) {
                    warn!(msg_type = t, "control message not consumed");
                    self.conn.close("unhandled control message");
                }
            }
        }
    }

    fn close_malformed(&mut self) {
        warn!("control payload failed to decode");
        self.conn
            .close(&AuthFailure::MalformedMessage.to_string());
    }

    // =========================================================================
    // CONNECTION FAMILY (HELLO + ENCRYPTION)
    // =========================================================================

    fn handle_hello(&mut self, payload: &[u8]) {
        let Ok(hello) = protocol::decode::<HelloPayload>(payload) else {
            self.close_malformed();
            return;
        };
        if !self.conn.role().is_server() {
            self.conn.close(&AuthFailure::WrongRole.to_string());
            return;
        }
        if self.connection_ctx.is_some() {
            debug!("duplicate hello ignored, connection phases already ran");
            return;
        }

        let mut phases = Vec::new();
        if self.conn.role() == ConnectionRole::DedicatedServer && self.caps.automatic_encryption {
            for t in AutomaticEncryptionPhase::routed_types() {
                self.add_route(t, RouteTarget::Encryption);
            }
            phases.push(ConnectionPhase::AutomaticEncryption(
                AutomaticEncryptionPhase::new(),
            ));
        }

        let mut ctx = ConnectionContext::new(hello);
        let progress = {
            let mut env = auth_env!(self);
            ctx.queue.start(phases, &mut env)
        };
        match progress {
            QueueProgress::Running => {
                ctx.deadline = Some(Instant::now() + self.settings.phase_timeout);
                self.connection_ctx = Some(ctx);
            }
            QueueProgress::Complete(result) => {
                self.connection_ctx = Some(ctx);
                self.complete_connection(result);
            }
        }
    }

    /// Forward the buffered hello on success; discard the context on failure
    /// so a reconnecting client can retry cleanly.
    fn complete_connection(&mut self, result: PhaseResult) {
        match result {
            Ok(()) => {
                if let Some(ctx) = &mut self.connection_ctx {
                    ctx.deadline = None;
                    let hello = ctx.hello.clone();
                    info!("connection phases complete, forwarding hello");
                    self.engine.accept_hello(hello);
                }
            }
            Err(failure) => {
                self.connection_ctx = None;
                warn!(%failure, "connection phases failed");
                send_failure_and_close(&mut self.conn, &failure);
            }
        }
    }

    // =========================================================================
    // AUTHENTICATION ENTRY POINT
    // =========================================================================

    fn handle_login(&mut self, payload: &[u8]) {
        let Ok(login) = protocol::decode::<LoginPayload>(payload) else {
            self.close_malformed();
            return;
        };
        let identity = login.identity;
        self.start_authentication(identity, AuthRequest::Login(login));
    }

    fn handle_beacon_join(&mut self, payload: &[u8]) {
        let Ok(join) = protocol::decode::<BeaconJoinPayload>(payload) else {
            self.close_malformed();
            return;
        };
        let identity = join.identity;
        self.start_authentication(identity, AuthRequest::Beacon(join));
    }

    /// Single server-side entry point: queue the request and attach it to a
    /// new or in-flight verification run for its identity.
    pub fn start_authentication(&mut self, identity: Option<Identity>, request: AuthRequest) {
        if !self.conn.role().is_server() {
            warn!("authentication request on a client connection");
            self.conn.close(&AuthFailure::WrongRole.to_string());
            return;
        }

        let Some(identity) = identity else {
            if self.settings.mode == AuthMode::Off || self.settings.editor_bypass {
                debug!("identity-less request accepted without verification");
                match request {
                    AuthRequest::Login(login) => self.engine.accept_login(login),
                    AuthRequest::Beacon(join) => self.engine.accept_beacon_join(join),
                }
            } else {
                send_failure_and_close(&mut self.conn, &AuthFailure::MissingIdentity);
            }
            return;
        };

        let waiter = match request {
            AuthRequest::Login(login) => {
                if self.queued_logins.contains_key(&identity) {
                    debug!(identity = %identity.short(), "duplicate login request dropped");
                    return;
                }
                let planned = self.plan_login_phases(identity);
                self.queued_logins.insert(
                    identity,
                    QueuedLogin {
                        request: login,
                        context: LoginContext::new(identity, planned),
                    },
                );
                AuthKey::Login(identity)
            }
            AuthRequest::Beacon(join) => {
                let key = (identity, join.beacon_name.clone());
                if self.queued_beacons.contains_key(&key) {
                    debug!(identity = %identity.short(), "duplicate beacon request dropped");
                    return;
                }
                let name = join.beacon_name.clone();
                self.queued_beacons.insert(
                    key,
                    QueuedBeacon {
                        request: join,
                        context: BeaconContext::new(identity, name.clone()),
                    },
                );
                AuthKey::Beacon(identity, name)
            }
        };

        self.ensure_verification(identity, waiter);
    }

    /// Anti-cheat phases run only for real player logins.
    fn plan_login_phases(&mut self, identity: Identity) -> Vec<LoginPhase> {
        if !self.caps.anticheat {
            return Vec::new();
        }
        for t in AntiCheatProofPhase::routed_types() {
            self.add_route(t, RouteTarget::Login);
        }
        vec![
            LoginPhase::AntiCheatProof(AntiCheatProofPhase::new(identity)),
            LoginPhase::AntiCheatIntegrity(AntiCheatIntegrityPhase::new(
                identity,
                self.anticheat_verified.contains(&identity),
            )),
        ]
    }

    /// Verification phase list for the configured mode and this role.
    fn plan_verification_phases(&mut self, identity: Identity) -> Vec<VerificationPhase> {
        let mut phases = Vec::new();
        match (self.settings.mode, self.conn.role()) {
            (AuthMode::Off, _) => {}
            (_, ConnectionRole::ListenServer) => {
                if self.settings.identity_check_on_listen_server {
                    phases.push(VerificationPhase::IdentityCheck(IdentityCheckPhase::new(
                        identity,
                    )));
                }
            }
            (AuthMode::IdToken, _) => {
                for t in IdTokenPhase::routed_types() {
                    self.add_route(t, RouteTarget::Verification);
                }
                phases.push(VerificationPhase::IdToken(IdTokenPhase::new(identity)));
            }
            (AuthMode::UserCredentials, _) => {
                for t in LegacyCredentialPhase::routed_types() {
                    self.add_route(t, RouteTarget::Verification);
                }
                phases.push(VerificationPhase::LegacyCredential(
                    LegacyCredentialPhase::new(identity),
                ));
            }
        }
        if self.caps.sanctions {
            phases.push(VerificationPhase::SanctionCheck(SanctionCheckPhase::new(
                identity,
            )));
        }
        phases
    }

    /// Attach a waiter to the identity's verification run, creating and
    /// starting the run on first use. A completed run releases the waiter
    /// immediately with its sealed result; only an in-flight run may hold it,
    /// since drained waiter lists are never revisited.
    fn ensure_verification(&mut self, identity: Identity, waiter: AuthKey) {
        if let Some(ctx) = self.verifications.get_mut(&identity) {
            if ctx.queue.is_done() || ctx.status.is_terminal() {
                let result = match ctx.failure.clone() {
                    Some(failure) => Err(failure),
                    None => Ok(()),
                };
                self.release_waiter(waiter, result);
            } else {
                ctx.waiters.push(waiter);
            }
            return;
        }

        let phases = self.plan_verification_phases(identity);
        if phases.is_empty() {
            // Nothing verifies the identity under this configuration; the
            // connection still needs its identity slot filled.
            self.conn.set_player_identity(identity);
        }

        let mut ctx = VerificationContext::new(identity);
        ctx.waiters.push(waiter);
        let progress = {
            let mut env = auth_env!(self);
            ctx.queue.start(phases, &mut env)
        };
        match progress {
            QueueProgress::Running => {
                if let Some(status) = ctx.queue.active_mut().and_then(|p| p.status()) {
                    ctx.status.advance_to(status);
                }
                ctx.deadline = Some(Instant::now() + self.settings.phase_timeout);
                self.verifications.insert(identity, ctx);
            }
            QueueProgress::Complete(result) => {
                self.verifications.insert(identity, ctx);
                self.on_verification_complete(identity, result);
            }
        }
    }

    /// Resume a suspended verification run with the active phase's result.
    fn drive_verification(&mut self, identity: Identity, result: PhaseResult) {
        let progress = {
            let Some(ctx) = self.verifications.get_mut(&identity) else {
                return;
            };
            let progress = {
                let mut env = auth_env!(self);
                ctx.queue.advance(result, &mut env)
            };
            if progress.is_running() {
                if let Some(status) = ctx.queue.active_mut().and_then(|p| p.status()) {
                    ctx.status.advance_to(status);
                }
                ctx.deadline = Some(Instant::now() + self.settings.phase_timeout);
            }
            progress
        };
        if let QueueProgress::Complete(result) = progress {
            self.on_verification_complete(identity, result);
        }
    }

    /// Seal the verification run and release every attached waiter. The
    /// terminal `Verified` status is only reached after the waiters' own
    /// login/beacon phases also complete.
    fn on_verification_complete(&mut self, identity: Identity, result: PhaseResult) {
        let waiters = {
            let Some(ctx) = self.verifications.get_mut(&identity) else {
                return;
            };
            ctx.deadline = None;
            if let Err(failure) = &result {
                ctx.status.advance_to(VerificationStatus::Failed);
                ctx.failure = Some(failure.clone());
            } else {
                debug_assert!(
                    self.conn.player_identity().is_some(),
                    "verification success must assign a player identity"
                );
            }
            std::mem::take(&mut ctx.waiters)
        };
        for waiter in waiters {
            self.release_waiter(waiter, result.clone());
        }
    }

    fn release_waiter(&mut self, waiter: AuthKey, result: PhaseResult) {
        match waiter {
            AuthKey::Login(identity) => match result {
                Ok(()) => self.drive_login(identity, LoginStep::Start),
                Err(failure) => self.finish_login(identity, Err(failure)),
            },
            AuthKey::Beacon(identity, name) => match result {
                Ok(()) => self.start_beacon_phases(identity, name),
                Err(failure) => self.finish_beacon(identity, name, Err(failure)),
            },
        }
    }

    // =========================================================================
    // LOGIN FAMILY
    // =========================================================================

    fn drive_login(&mut self, identity: Identity, step: LoginStep) {
        let (progress, active_status) = {
            let Some(entry) = self.queued_logins.get_mut(&identity) else {
                return;
            };
            let progress = {
                let mut env = auth_env!(self);
                match step {
                    LoginStep::Start => {
                        let planned = std::mem::take(&mut entry.context.planned);
                        entry.context.queue.start(planned, &mut env)
                    }
                    LoginStep::Advance(result) => entry.context.queue.advance(result, &mut env),
                }
            };
            let status = entry.context.queue.active_mut().map(|p| p.status());
            if progress.is_running() {
                entry.context.deadline = Some(Instant::now() + self.settings.phase_timeout);
            }
            (progress, status)
        };
        if let Some(status) = active_status {
            if let Some(ctx) = self.verifications.get_mut(&identity) {
                ctx.status.advance_to(status);
            }
        }
        if let QueueProgress::Complete(result) = progress {
            self.finish_login(identity, result);
        }
    }

    /// Replay or refuse the queued login, sealing the identity's status.
    /// An already-terminal status stays sealed; it is never re-advanced.
    fn finish_login(&mut self, identity: Identity, result: PhaseResult) {
        let Some(entry) = self.queued_logins.remove(&identity) else {
            return;
        };
        match result {
            Ok(()) => {
                if let Some(ctx) = self.verifications.get_mut(&identity) {
                    if !ctx.status.is_terminal() {
                        ctx.status.advance_to(VerificationStatus::Verified);
                    }
                }
                info!(identity = %identity.short(), "login authenticated, replaying request");
                self.engine.accept_login(entry.request);
            }
            Err(failure) => {
                if let Some(ctx) = self.verifications.get_mut(&identity) {
                    if !ctx.status.is_terminal() {
                        ctx.status.advance_to(VerificationStatus::Failed);
                        ctx.failure = Some(failure.clone());
                    }
                }
                send_failure_and_close(&mut self.conn, &failure);
            }
        }
    }

    // =========================================================================
    // BEACON FAMILY
    // =========================================================================

    fn start_beacon_phases(&mut self, identity: Identity, name: String) {
        let progress = {
            let Some(entry) = self.queued_beacons.get_mut(&(identity, name.clone())) else {
                return;
            };
            let mut env = auth_env!(self);
            entry.context.queue.start(Vec::new(), &mut env)
        };
        if let QueueProgress::Complete(result) = progress {
            self.finish_beacon(identity, name, result);
        }
    }

    fn finish_beacon(&mut self, identity: Identity, name: String, result: PhaseResult) {
        let Some(entry) = self.queued_beacons.remove(&(identity, name)) else {
            return;
        };
        match result {
            Ok(()) => {
                // A sibling login sharing the run may have failed and closed
                // the connection first; nothing joins a closed connection.
                if self.conn.is_closed() {
                    debug!(identity = %identity.short(), "beacon join dropped, connection closed");
                    return;
                }
                if let Some(ctx) = self.verifications.get_mut(&identity) {
                    if !ctx.status.is_terminal() {
                        ctx.status.advance_to(VerificationStatus::Verified);
                    }
                }
                info!(identity = %identity.short(), "beacon join authenticated, replaying request");
                self.engine.accept_beacon_join(entry.request);
            }
            Err(failure) => {
                if let Some(ctx) = self.verifications.get_mut(&identity) {
                    if !ctx.status.is_terminal() {
                        ctx.status.advance_to(VerificationStatus::Failed);
                        ctx.failure = Some(failure.clone());
                    }
                }
                send_failure_and_close(&mut self.conn, &failure);
            }
        }
    }

    // =========================================================================
    // ROUTED PHASE MESSAGES
    // =========================================================================

    /// Hand a routed message to the phase family that claimed its type. A
    /// type arriving under the wrong family is a contract violation and
    /// closes the connection.
    fn dispatch_route(&mut self, target: RouteTarget, t: u8, payload: &[u8]) {
        match (target, t) {
            // Client side: server-initiated challenges.
            (RouteTarget::Encryption, msg_type::REQUEST_CLIENT_EPHEMERAL_KEY) => {
                let Ok(msg) = protocol::decode::<RequestClientEphemeralKey>(payload) else {
                    self.close_malformed();
                    return;
                };
                let result = {
                    let queue = self.client_connection.get_or_insert_with(|| {
                        let mut queue = PhaseQueue::new();
                        queue.register_for_routing(vec![ConnectionPhase::AutomaticEncryption(
                            AutomaticEncryptionPhase::new(),
                        )]);
                        queue
                    });
                    let mut env = auth_env!(self);
                    match queue.find_mut(ConnectionPhase::as_encryption_mut) {
                        Some(phase) => phase.handle_request_client_key(msg, &mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    }
                };
                if let Err(failure) = result {
                    self.conn.close(&failure.to_string());
                }
            }
            (RouteTarget::Encryption, msg_type::SYMMETRIC_KEY_EXCHANGE) => {
                let Ok(msg) = protocol::decode::<SymmetricKeyExchange>(payload) else {
                    self.close_malformed();
                    return;
                };
                let result = {
                    let Some(queue) = self.client_connection.as_mut() else {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    };
                    let mut env = auth_env!(self);
                    match queue.find_mut(ConnectionPhase::as_encryption_mut) {
                        Some(phase) => phase.handle_symmetric_key(msg, &mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    }
                };
                if let Err(failure) = result {
                    self.conn.close(&failure.to_string());
                }
            }
            (RouteTarget::Verification, msg_type::REQUEST_ID_TOKEN) => {
                let Ok(msg) = protocol::decode::<RequestIdToken>(payload) else {
                    self.close_malformed();
                    return;
                };
                let identity = msg.identity;
                let result = {
                    let ctx = self
                        .verifications
                        .entry(identity)
                        .or_insert_with(|| client_verification_context(identity));
                    let mut env = auth_env!(self);
                    match ctx.queue.find_mut(VerificationPhase::as_id_token_mut) {
                        Some(phase) => phase.handle_request(msg, &mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    }
                };
                if let Err(failure) = result {
                    self.conn.close(&failure.to_string());
                }
            }
            (RouteTarget::Verification, msg_type::REQUEST_CLIENT_TOKEN) => {
                let Ok(msg) = protocol::decode::<RequestClientToken>(payload) else {
                    self.close_malformed();
                    return;
                };
                let identity = msg.identity;
                let result = {
                    let ctx = self
                        .verifications
                        .entry(identity)
                        .or_insert_with(|| client_verification_context(identity));
                    let mut env = auth_env!(self);
                    match ctx.queue.find_mut(VerificationPhase::as_legacy_credential_mut) {
                        Some(phase) => phase.handle_request(msg, &mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    }
                };
                if let Err(failure) = result {
                    self.conn.close(&failure.to_string());
                }
            }
            (RouteTarget::Login, msg_type::REQUEST_TRUSTED_CLIENT_PROOF) => {
                let Ok(msg) = protocol::decode::<RequestTrustedClientProof>(payload) else {
                    self.close_malformed();
                    return;
                };
                let identity = msg.identity;
                let result = {
                    let queue = self.client_logins.entry(identity).or_insert_with(|| {
                        let mut queue = PhaseQueue::new();
                        queue.register_for_routing(vec![LoginPhase::AntiCheatProof(
                            AntiCheatProofPhase::new(identity),
                        )]);
                        queue
                    });
                    let mut env = auth_env!(self);
                    match queue.find_mut(LoginPhase::as_proof_mut) {
                        Some(phase) => phase.handle_request(msg, &mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    }
                };
                if let Err(failure) = result {
                    self.conn.close(&failure.to_string());
                }
            }

            // Server side: client replies resume the suspended phase.
            (RouteTarget::Encryption, msg_type::DELIVER_CLIENT_EPHEMERAL_KEY) => {
                let Ok(msg) = protocol::decode::<DeliverClientEphemeralKey>(payload) else {
                    self.close_malformed();
                    return;
                };
                let progress = {
                    let Some(ctx) = self.connection_ctx.as_mut() else {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    };
                    if !ctx.queue.is_running() {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    }
                    let mut env = auth_env!(self);
                    let result = match ctx
                        .queue
                        .active_mut()
                        .and_then(ConnectionPhase::as_encryption_mut)
                    {
                        Some(phase) => phase.handle_deliver_client_key(msg, &mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    };
                    match result {
                        Ok(()) => {
                            // The phase stays pending until EnableEncryption.
                            ctx.deadline = Some(Instant::now() + self.settings.phase_timeout);
                            None
                        }
                        Err(failure) => Some(ctx.queue.advance(Err(failure), &mut env)),
                    }
                };
                if let Some(QueueProgress::Complete(result)) = progress {
                    self.complete_connection(result);
                }
            }
            (RouteTarget::Encryption, msg_type::ENABLE_ENCRYPTION) => {
                let progress = {
                    let Some(ctx) = self.connection_ctx.as_mut() else {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    };
                    if !ctx.queue.is_running() {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    }
                    let mut env = auth_env!(self);
                    let result = match ctx
                        .queue
                        .active_mut()
                        .and_then(ConnectionPhase::as_encryption_mut)
                    {
                        Some(phase) => phase.handle_enable_encryption(&mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    };
                    ctx.queue.advance(result, &mut env)
                };
                if let QueueProgress::Complete(result) = progress {
                    self.complete_connection(result);
                }
            }
            (RouteTarget::Verification, msg_type::DELIVER_ID_TOKEN) => {
                let Ok(msg) = protocol::decode::<DeliverIdToken>(payload) else {
                    self.close_malformed();
                    return;
                };
                let identity = msg.identity;
                let result = {
                    let Some(ctx) = self.verifications.get_mut(&identity) else {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    };
                    if !ctx.queue.is_running() {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    }
                    let mut env = auth_env!(self);
                    match ctx.queue.active_mut().and_then(VerificationPhase::as_id_token_mut) {
                        Some(phase) => phase.handle_deliver(msg, &mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    }
                };
                self.drive_verification(identity, result);
            }
            (RouteTarget::Verification, msg_type::DELIVER_CLIENT_TOKEN) => {
                let Ok(msg) = protocol::decode::<DeliverClientToken>(payload) else {
                    self.close_malformed();
                    return;
                };
                let identity = msg.identity;
                let result = {
                    let Some(ctx) = self.verifications.get_mut(&identity) else {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    };
                    if !ctx.queue.is_running() {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    }
                    let mut env = auth_env!(self);
                    match ctx
                        .queue
                        .active_mut()
                        .and_then(VerificationPhase::as_legacy_credential_mut)
                    {
                        Some(phase) => phase.handle_deliver(msg, &mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    }
                };
                self.drive_verification(identity, result);
            }
            (RouteTarget::Login, msg_type::DELIVER_TRUSTED_CLIENT_PROOF) => {
                let Ok(msg) = protocol::decode::<DeliverTrustedClientProof>(payload) else {
                    self.close_malformed();
                    return;
                };
                let identity = msg.identity;
                let result = {
                    let Some(entry) = self.queued_logins.get_mut(&identity) else {
                        self.conn
                            .close(&AuthFailure::UnexpectedMessage.to_string());
                        return;
                    };
                    let mut env = auth_env!(self);
                    match entry
                        .context
                        .queue
                        .active_mut()
                        .and_then(LoginPhase::as_proof_mut)
                    {
                        Some(phase) => phase.handle_deliver(msg, &mut env),
                        None => Err(AuthFailure::UnexpectedMessage),
                    }
                };
                self.drive_login(identity, LoginStep::Advance(result));
            }
            _ => {
                warn!(msg_type = t, ?target, "message routed to the wrong phase family");
                self.conn.close("unexpected authentication message");
            }
        }
    }

    // =========================================================================
    // GATED ENGINE MESSAGES
    // =========================================================================

    /// Stat writes are refused unless enabled and bound to the connection's
    /// verified player identity.
    fn handle_write_stat(&mut self, payload: &[u8]) {
        let Ok(write) = protocol::decode::<WriteStatPayload>(payload) else {
            self.close_malformed();
            return;
        };
        if !self.settings.accept_stat_writes {
            warn!("stat write refused, not accepted on this connection");
            self.conn.close("stat writes not accepted");
            return;
        }
        if self.conn.player_identity() != Some(write.identity) {
            warn!("stat write for a different identity");
            self.conn.close("stat write identity mismatch");
            return;
        }
        self.engine.accept_stat_write(write);
    }

    fn handle_anticheat_relay(&mut self, payload: &[u8]) {
        let Ok(relay) = protocol::decode::<AntiCheatRelayPayload>(payload) else {
            self.close_malformed();
            return;
        };
        self.services
            .anticheat
            .receive_message(relay.identity.as_ref(), &relay.blob);
    }

    // =========================================================================
    // ANTI-CHEAT SERVICE CALLBACKS
    // =========================================================================

    /// The anti-cheat service confirmed the player's remote auth. Resumes a
    /// waiting integrity phase; arriving before the phase starts is fine, the
    /// result is cached for it.
    pub fn notify_anticheat_auth_complete(&mut self, identity: Identity) {
        self.anticheat_verified.insert(identity);
        let resume = {
            let Some(entry) = self.queued_logins.get_mut(&identity) else {
                return;
            };
            // The integrity phase may be active, queued behind the proof
            // phase, or still in the planned list; reach it wherever it is.
            match entry.context.queue.find_mut(LoginPhase::as_integrity_mut) {
                Some(phase) => phase.notify_remote_auth_complete(),
                None => {
                    for phase in &mut entry.context.planned {
                        if let Some(integrity) = phase.as_integrity_mut() {
                            integrity.notify_remote_auth_complete();
                        }
                    }
                    false
                }
            }
        };
        if resume {
            debug!(identity = %identity.short(), "anti-cheat integrity confirmed");
            self.drive_login(identity, LoginStep::Advance(Ok(())));
        }
    }

    /// The anti-cheat service demanded the player's removal. Applies at any
    /// time, in or out of a login run.
    pub fn notify_anticheat_action_required(&mut self, identity: Identity) {
        warn!(identity = %identity.short(), "anti-cheat action required, removing player");
        self.anticheat_verified.remove(&identity);
        self.services.anticheat.unregister_player(&identity);

        if self.queued_logins.contains_key(&identity) {
            self.finish_login(identity, Err(AuthFailure::AntiCheatViolation));
        } else if self.conn.player_identity() == Some(identity) {
            send_failure_and_close(&mut self.conn, &AuthFailure::AntiCheatViolation);
        }
    }

    // =========================================================================
    // DEADLINES
    // =========================================================================

    /// Fail any phase that outlived its deadline. Driven by the owner's
    /// periodic timer.
    pub fn tick(&mut self, now: Instant) {
        let progress = match self.connection_ctx.as_mut() {
            Some(ctx) if ctx.queue.is_running() && ctx.deadline.is_some_and(|d| now >= d) => {
                warn!("connection phase deadline exceeded");
                let mut env = auth_env!(self);
                Some(ctx.queue.advance(Err(AuthFailure::PhaseTimeout), &mut env))
            }
            _ => None,
        };
        if let Some(QueueProgress::Complete(result)) = progress {
            self.complete_connection(result);
        }

        let expired: Vec<Identity> = self
            .verifications
            .iter()
            .filter(|(_, ctx)| {
                ctx.queue.is_running() && ctx.deadline.is_some_and(|d| now >= d)
            })
            .map(|(identity, _)| *identity)
            .collect();
        for identity in expired {
            warn!(identity = %identity.short(), "verification phase deadline exceeded");
            self.drive_verification(identity, Err(AuthFailure::PhaseTimeout));
        }

        let expired: Vec<Identity> = self
            .queued_logins
            .iter()
            .filter(|(_, entry)| {
                entry.context.queue.is_running()
                    && entry.context.deadline.is_some_and(|d| now >= d)
            })
            .map(|(identity, _)| *identity)
            .collect();
        for identity in expired {
            warn!(identity = %identity.short(), "login phase deadline exceeded");
            self.drive_login(identity, LoginStep::Advance(Err(AuthFailure::PhaseTimeout)));
        }
    }
}
