//! Warden Authentication Server
//!
//! Demo binary: runs a server-side and a client-side dispatcher over an
//! in-process link and drives a full session through the encryption
//! handshake and an ID-token login.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ed25519_dalek::SigningKey;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use warden::auth::dispatcher::{ControlDispatcher, EngineSink};
use warden::network::connection::ControlLink;
use warden::network::protocol::{self, msg_type, HelloPayload, LoginPayload};
use warden::services::{InMemorySanctions, JwtIdentityProvider, RecordingAntiCheat};
use warden::{AuthMode, AuthSettings, Connection, ConnectionRole, Identity, Services, VERSION};

const DEMO_SECRET: &str = "warden-demo-shared-token-secret";
const DEMO_SUBJECT: &str = "demo-player";

fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Warden Auth Server v{}", VERSION);

    demo_login();
    Ok(())
}

/// In-process link: outbound frames pile up in a queue the demo pumps into
/// the peer dispatcher.
struct ChannelLink {
    outbound: Arc<Mutex<VecDeque<Vec<u8>>>>,
    closed: Arc<Mutex<Option<String>>>,
}

impl ChannelLink {
    fn new() -> (Self, Arc<Mutex<VecDeque<Vec<u8>>>>, Arc<Mutex<Option<String>>>) {
        let outbound = Arc::new(Mutex::new(VecDeque::new()));
        let closed = Arc::new(Mutex::new(None));
        (
            Self {
                outbound: outbound.clone(),
                closed: closed.clone(),
            },
            outbound,
            closed,
        )
    }
}

impl ControlLink for ChannelLink {
    fn deliver(&mut self, frame: Vec<u8>) {
        self.outbound.lock().unwrap().push_back(frame);
    }
    fn flush(&mut self) {}
    fn close(&mut self, reason: &str) {
        *self.closed.lock().unwrap() = Some(reason.to_string());
    }
    fn is_closed(&self) -> bool {
        self.closed.lock().unwrap().is_some()
    }
}

/// Engine sink that just narrates what got through the gate.
struct DemoEngine {
    side: &'static str,
}

impl EngineSink for DemoEngine {
    fn accept_hello(&mut self, hello: HelloPayload) {
        info!(side = self.side, version = %hello.client_version, "hello accepted");
    }
    fn accept_login(&mut self, login: LoginPayload) {
        info!(side = self.side, nickname = %login.nickname, "login accepted");
    }
    fn accept_beacon_join(&mut self, join: warden::network::protocol::BeaconJoinPayload) {
        info!(side = self.side, beacon = %join.beacon_name, "beacon join accepted");
    }
    fn accept_stat_write(&mut self, write: warden::network::protocol::WriteStatPayload) {
        info!(side = self.side, stat = %write.stat, "stat write accepted");
    }
    fn handle_control(&mut self, msg_type: u8, _payload: &[u8]) -> bool {
        info!(side = self.side, msg_type, "engine control message");
        true
    }
}

fn demo_services() -> Services {
    let mut provider = JwtIdentityProvider::new(DEMO_SECRET);
    provider.register_subject(DEMO_SUBJECT);
    Services {
        identity: Box::new(provider),
        sanctions: Box::new(InMemorySanctions::new()),
        anticheat: Box::new(RecordingAntiCheat::new()),
    }
}

/// Deliver every queued frame to the opposite dispatcher until both sides
/// go quiet.
fn pump(
    server: &mut ControlDispatcher,
    server_out: &Arc<Mutex<VecDeque<Vec<u8>>>>,
    client: &mut ControlDispatcher,
    client_out: &Arc<Mutex<VecDeque<Vec<u8>>>>,
) {
    loop {
        let to_server: Vec<Vec<u8>> = client_out.lock().unwrap().drain(..).collect();
        let to_client: Vec<Vec<u8>> = server_out.lock().unwrap().drain(..).collect();
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        for frame in to_server {
            server.received_frame(&frame);
        }
        for frame in to_client {
            client.received_frame(&frame);
        }
    }
}

fn demo_login() {
    info!("=== Starting Demo Login ===");

    let signing_seed: [u8; 32] = rand::random();
    let server_public = SigningKey::from_bytes(&signing_seed)
        .verifying_key()
        .to_bytes();

    let server_settings = AuthSettings {
        mode: AuthMode::IdToken,
        trusted_server: true,
        server_signing_key: Some(signing_seed),
        ..Default::default()
    };
    let client_settings = AuthSettings {
        mode: AuthMode::IdToken,
        server_public_key: Some(server_public),
        ..Default::default()
    };

    let (server_link, server_out, server_closed) = ChannelLink::new();
    let (client_link, client_out, client_closed) = ChannelLink::new();

    let mut server = ControlDispatcher::new(
        Connection::new(ConnectionRole::DedicatedServer, Box::new(server_link)),
        demo_services(),
        server_settings,
        Box::new(DemoEngine { side: "server" }),
    );
    let mut client = ControlDispatcher::new(
        Connection::new(ConnectionRole::ClientToDedicated, Box::new(client_link)),
        demo_services(),
        client_settings,
        Box::new(DemoEngine { side: "client" }),
    );

    // Hello first: the encryption handshake runs to completion before any
    // identity data crosses the wire.
    let hello = protocol::encode(
        msg_type::HELLO,
        &HelloPayload {
            client_version: VERSION.to_string(),
            network_version: 1,
        },
    )
    .expect("encode hello");
    client.connection_mut().send(hello);
    pump(&mut server, &server_out, &mut client, &client_out);

    info!(
        encrypted = server.connection().fully_encrypted(),
        trusted = client.connection().is_trusted(),
        "handshake complete"
    );

    // Login over the now-encrypted channel.
    let identity = Identity::from_subject(DEMO_SUBJECT);
    let login = protocol::encode(
        msg_type::LOGIN,
        &LoginPayload {
            identity: Some(identity),
            nickname: "Sparks".to_string(),
            online_platform: "pc".to_string(),
        },
    )
    .expect("encode login");
    client.connection_mut().send(login);
    pump(&mut server, &server_out, &mut client, &client_out);

    info!(
        identity = %identity.short(),
        status = ?server.verification_status(&identity),
        "=== Demo Login Complete ==="
    );

    let server_reason = server_closed.lock().unwrap();
    if let Some(reason) = server_reason.as_ref() {
        info!(reason, "server connection closed");
    }
    let client_reason = client_closed.lock().unwrap();
    if let Some(reason) = client_reason.as_ref() {
        info!(reason, "client connection closed");
    }
}
