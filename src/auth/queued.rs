//! Queued Requests
//!
//! Replay buffers for login and beacon-join requests held back while
//! authentication runs. On overall success the original request is replayed
//! into the engine pipeline; on failure the client gets a sanitized notice
//! and the connection is closed. The dispatcher tracks entries per identity
//! (and beacon name) so duplicate requests are dropped while one is in
//! flight.

use tracing::warn;

use crate::auth::code::AuthFailure;
use crate::auth::context::{BeaconContext, LoginContext};
use crate::network::connection::Connection;
use crate::network::protocol::{self, msg_type, BeaconJoinPayload, FailureNotice, LoginPayload};

/// A login request waiting for authentication, with its login-family phases.
pub struct QueuedLogin {
    /// The original login request, replayed on success.
    pub request: LoginPayload,
    /// The login-family phase run for this entry.
    pub context: LoginContext,
}

/// A beacon-join request waiting for authentication.
pub struct QueuedBeacon {
    /// The original join request, replayed on success.
    pub request: BeaconJoinPayload,
    /// The beacon-family phase run for this entry.
    pub context: BeaconContext,
}

/// Send the sanitized failure notice for a failed entry, then flush and
/// force-close the connection.
pub fn send_failure_and_close(conn: &mut Connection, failure: &AuthFailure) {
    warn!(%failure, "authentication failed, notifying client and closing");
    if let Ok(frame) = protocol::encode(
        msg_type::FAILURE_NOTICE,
        &FailureNotice {
            reason: failure.user_notice(),
        },
    ) {
        conn.send(frame);
    }
    conn.flush();
    conn.close(&failure.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::testing::MemoryLink;
    use crate::network::connection::ConnectionRole;

    #[test]
    fn test_failure_notice_sent_before_close() {
        let (link, frames, closed) = MemoryLink::new();
        let mut conn = Connection::new(ConnectionRole::DedicatedServer, Box::new(link));

        send_failure_and_close(&mut conn, &AuthFailure::SanctionBan);

        let frame = frames.lock().unwrap()[0].clone();
        let (t, body) = protocol::split_frame(&frame).unwrap();
        assert_eq!(t, msg_type::FAILURE_NOTICE);
        let notice: FailureNotice = protocol::decode(body).unwrap();
        assert!(notice.reason.ends_with("Please reconnect and try again."));

        assert!(conn.is_closed());
        assert!(closed.lock().unwrap().is_some());
    }
}
