//! Black-box scenario tests (spec.md §8 S1-S6), run only against the
//! public API plus an in-memory duplex pipe standing in for a socket --
//! the same technique `examples/Protryon-klickhouse/klickhouse/tests/main.rs`
//! aggregates real per-scenario test files under, but here the "server" is
//! the test itself rather than a live database instance, since this crate's
//! wire peer is never available in CI.

pub mod scenarios;

use bytes::Bytes;
use rtdb_client::codec::message::{IdentityTokenMessage, ServerMessage};
use rtdb_client::codec::{self};
use rtdb_client::compression::{self, CompressionMethod};
use rtdb_client::identity::{ConnectionId, Identity};
use rtdb_client::transport::{FramedTransport, Transport};
use rtdb_client::{ClientConfig, Connection};

/// Dials a [`Connection`] against one end of an in-memory duplex pipe,
/// handing back the other end as a raw framed transport the test drives
/// as the "server".
pub async fn connect_pair() -> (Connection, FramedTransport<tokio::io::DuplexStream>) {
    let (client_io, server_io) = tokio::io::duplex(65536);
    let client_transport = FramedTransport::new(client_io);
    let config = ClientConfig::builder("ws://localhost:3000", "scenario_test").build().unwrap();
    let conn = Connection::from_transport(config, Box::new(client_transport)).await.unwrap();
    (conn, FramedTransport::new(server_io))
}

/// Sends a server frame, applying the no-compression envelope every
/// scenario test here uses (compression negotiation itself is covered by
/// `compression.rs`'s own unit tests).
pub async fn send_server_message(
    server: &mut FramedTransport<tokio::io::DuplexStream>,
    message: ServerMessage,
) {
    let encoded = codec::encode_server_message_to_vec(&message).unwrap();
    let framed = compression::wrap_frame(CompressionMethod::None, encoded);
    server.send_frame(Bytes::from(framed)).await.unwrap();
}

/// Performs the S1 identity handshake on `server`, handing the connection
/// a distinct identity/connection-id pair.
pub async fn handshake(server: &mut FramedTransport<tokio::io::DuplexStream>) -> (Identity, ConnectionId) {
    let identity = Identity::from_public_key(b"scenario-test-identity");
    let connection_id = ConnectionId::generate();
    send_server_message(
        server,
        ServerMessage::IdentityToken(IdentityTokenMessage {
            identity,
            token: "tok_abc".into(),
            connection_id,
        }),
    )
    .await;
    (identity, connection_id)
}

/// Polls `poll` until it returns `true` or `attempts * delay_ms` elapses,
/// the standard shape for asserting on state mutated by the connection's
/// background dispatch task.
pub async fn wait_until(mut poll: impl FnMut() -> bool, attempts: u32, delay_ms: u64) -> bool {
    for _ in 0..attempts {
        if poll() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
    }
    poll()
}

/// Drains client frames until one decodes to a `Subscribe` message,
/// discarding anything sent ahead of it on the same write queue (e.g. the
/// best-effort `client_connected` reducer call fired on identity receipt).
pub async fn drain_until_subscribe(
    server: &mut FramedTransport<tokio::io::DuplexStream>,
) -> rtdb_client::codec::message::Subscribe {
    loop {
        let frame = server.recv_frame().await.unwrap().expect("transport closed while awaiting Subscribe");
        let (method, body) = compression::unwrap_frame(&frame).unwrap();
        let raw = compression::decompress(method, body, codec::io::DEFAULT_MAX_PAYLOAD).unwrap();
        let mut buf = Bytes::from(raw);
        if let Ok(rtdb_client::codec::ClientMessage::Subscribe(sub)) = codec::decode_client_message(&mut buf) {
            return sub;
        }
    }
}
