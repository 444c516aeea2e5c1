//! End-to-end scenario tests from spec.md §8 (S1-S6), driven only through
//! the public API against the in-memory duplex harness in `main.rs`. Unit
//! tests inside each module already cover the same mechanics in isolation
//! (codec round-trips, breaker transitions, delta classification); these
//! exercise the same properties wired together the way an embedding
//! application actually observes them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rtdb_client::codec::message::{
    EnergyQuanta, ReducerCallInfo, ReducerId, ServerMessage, SubscribeApplied, TableUpdate, TransactionUpdate,
    UpdateStatus,
};
use rtdb_client::codec::{AlgebraicType, AlgebraicValue, ProductField};
use rtdb_client::identity::{ConnectionId, Identity};
use rtdb_client::ids::RequestId;
use rtdb_client::pool::{ConnectionFactory, ConnectionPool};
use rtdb_client::subscription::SubscriptionStrategy;
use rtdb_client::table::TableSchema;
use rtdb_client::transport::{FramedTransport, Transport};
use rtdb_client::{ClientConfig, Connection};

use crate::{connect_pair, drain_until_subscribe, handshake, send_server_message, wait_until};

fn message_row_type() -> AlgebraicType {
    AlgebraicType::Product(vec![
        ProductField { name: "id".into(), ty: AlgebraicType::I32 },
        ProductField { name: "text".into(), ty: AlgebraicType::String },
    ])
}

fn user_row_type() -> AlgebraicType {
    AlgebraicType::Product(vec![
        ProductField { name: "id".into(), ty: AlgebraicType::I32 },
        ProductField { name: "name".into(), ty: AlgebraicType::String },
    ])
}

fn encode_row(ty: &AlgebraicType, value: AlgebraicValue) -> rtdb_client::codec::message::Row {
    let bytes =
        rtdb_client::codec::encode_to_vec(ty, &value, &rtdb_client::codec::TypeRegistry::new()).unwrap();
    bytes.into()
}

/// S1. Identity handshake: opening a connection and receiving an
/// `IdentityToken` marks the connection connected with the identity stored.
#[tokio::test]
async fn s1_identity_handshake() {
    let (conn, mut server) = connect_pair().await;
    let (identity, connection_id) = handshake(&mut server).await;

    assert!(wait_until(|| conn.is_connected(), 50, 10).await);
    let token = conn.identity().expect("identity token stored");
    assert_eq!(token.identity, identity);
    assert_eq!(token.connection_id, connection_id);
    assert_eq!(token.token, "tok_abc");

    conn.close().await.unwrap();
}

/// S2. Subscribe-apply-insert: `SubscribeApplied` with one row populates the
/// table cache and fires the registered `on_insert` callback exactly once.
#[tokio::test]
async fn s2_subscribe_apply_insert() {
    let (conn, mut server) = connect_pair().await;
    handshake(&mut server).await;
    assert!(wait_until(|| conn.is_connected(), 50, 10).await);

    let table = conn.register_table(
        "messages",
        TableSchema { primary_key_index: Some(0), unique_indexes: vec![], row_type: Some(message_row_type()) },
    );
    let insert_count = Arc::new(AtomicU32::new(0));
    let counter = insert_count.clone();
    table.on_insert(move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let query_id = conn.subscribe(vec!["SELECT * FROM messages".into()], SubscriptionStrategy::Single).await.unwrap();

    // Drain frames up to and including the `Subscribe` request (the
    // best-effort `client_connected` reducer call may be queued ahead of it).
    let _ = drain_until_subscribe(&mut server).await;

    let row = encode_row(&message_row_type(), AlgebraicValue::Product(vec![
        AlgebraicValue::I32(1),
        AlgebraicValue::String("a".into()),
    ]));
    send_server_message(
        &mut server,
        ServerMessage::SubscribeApplied(SubscribeApplied {
            request_id: RequestId(1),
            query_id,
            rows: TableUpdate { table_id: 1, table_name: "messages".into(), deletes: vec![], inserts: vec![row] },
        }),
    )
    .await;

    assert!(wait_until(|| table.count() == 1, 50, 10).await);
    let rows = table.iter();
    assert_eq!(rows.len(), 1);
    assert_eq!(insert_count.load(Ordering::SeqCst), 1);

    conn.close().await.unwrap();
}

/// S3. PK update detection: a transaction deleting and inserting the same
/// primary key fires exactly one `on_update`, no `on_insert`/`on_delete`.
#[tokio::test]
async fn s3_pk_update_detection() {
    let (conn, mut server) = connect_pair().await;
    let (caller_identity, caller_connection_id) = handshake(&mut server).await;
    assert!(wait_until(|| conn.is_connected(), 50, 10).await);

    let table = conn.register_table(
        "users",
        TableSchema { primary_key_index: Some(0), unique_indexes: vec![], row_type: Some(user_row_type()) },
    );
    // Seed row id=7 so the update has something to replace.
    let seed_ctx = rtdb_client::table::EventContext::new(None, rtdb_client::time::Timestamp::now());
    table.apply_insert(
        AlgebraicValue::Product(vec![AlgebraicValue::I32(7), AlgebraicValue::String("old".into())]),
        &seed_ctx,
    );

    let inserts = Arc::new(AtomicU32::new(0));
    let deletes = Arc::new(AtomicU32::new(0));
    let updates = Arc::new(AtomicU32::new(0));
    {
        let c = inserts.clone();
        table.on_insert(move |_| { c.fetch_add(1, Ordering::SeqCst); });
    }
    {
        let c = deletes.clone();
        table.on_delete(move |_| { c.fetch_add(1, Ordering::SeqCst); });
    }
    {
        let c = updates.clone();
        table.on_update(move |_, _, _| { c.fetch_add(1, Ordering::SeqCst); }).unwrap();
    }

    let old_row = encode_row(&user_row_type(), AlgebraicValue::Product(vec![
        AlgebraicValue::I32(7),
        AlgebraicValue::String("old".into()),
    ]));
    let new_row = encode_row(&user_row_type(), AlgebraicValue::Product(vec![
        AlgebraicValue::I32(7),
        AlgebraicValue::String("new".into()),
    ]));

    send_server_message(
        &mut server,
        ServerMessage::TransactionUpdate(TransactionUpdate {
            status: UpdateStatus::Committed(
                vec![TableUpdate {
                    table_id: 1,
                    table_name: "users".into(),
                    deletes: vec![old_row],
                    inserts: vec![new_row],
                }]
                .into_iter()
                .collect(),
            ),
            timestamp: rtdb_client::time::Timestamp::now(),
            caller_identity,
            caller_connection_id,
            reducer_call: ReducerCallInfo {
                reducer_name: "rename_user".into(),
                reducer_id: 0,
                args: Bytes::new(),
                request_id: RequestId(42),
            },
            energy_quanta_used: EnergyQuanta(10),
            host_execution_duration_micros: 500,
        }),
    )
    .await;

    assert!(wait_until(|| updates.load(Ordering::SeqCst) == 1, 50, 10).await);
    assert_eq!(inserts.load(Ordering::SeqCst), 0);
    assert_eq!(deletes.load(Ordering::SeqCst), 0);
    assert_eq!(table.count(), 1);
    let row = table.find_by_unique("id", &AlgebraicValue::I32(7)).or_else(|| table.iter().into_iter().next());
    assert!(row.is_some());

    conn.close().await.unwrap();
}

/// A factory whose connections come pre-wired to an in-memory duplex pipe
/// and an immediate handshake, so the pool can be built deterministically
/// without a real server.
struct DuplexFactory {
    config: ClientConfig,
}

#[async_trait]
impl ConnectionFactory for DuplexFactory {
    async fn create(&self) -> rtdb_client::Result<Connection> {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let client_transport = FramedTransport::new(client_io);
        let conn = Connection::from_transport(self.config.clone(), Box::new(client_transport)).await?;
        let mut server = FramedTransport::new(server_io);
        tokio::spawn(async move {
            let identity_msg = ServerMessage::IdentityToken(rtdb_client::codec::message::IdentityTokenMessage {
                identity: Identity::from_public_key(b"pool-scenario"),
                token: "tok".into(),
                connection_id: ConnectionId::generate(),
            });
            let encoded = rtdb_client::codec::encode_server_message_to_vec(&identity_msg).unwrap();
            let framed = rtdb_client::compression::wrap_frame(rtdb_client::compression::CompressionMethod::None, encoded);
            let _ = server.send_frame(Bytes::from(framed)).await;
            std::future::pending::<()>().await;
        });
        Ok(conn)
    }
}

/// S4. Circuit breaker trip: repeated failed operations on the pool's one
/// connection open its breaker; a subsequent acquire finds no eligible
/// connection left.
#[tokio::test]
async fn s4_circuit_breaker_trip() {
    let mut config = ClientConfig::builder("ws://localhost:3000", "scenario_test").build().unwrap();
    config.pool.min = 1;
    config.pool.max = 1;
    let factory = Box::new(DuplexFactory { config: config.clone() });
    let pool = ConnectionPool::new(config, factory).await.unwrap();

    // The hardcoded per-connection breaker opens after 5 consecutive
    // failures (pool/mod.rs's `Slot::new`); this crate's config surface
    // (spec §6) does not expose breaker thresholds, only pool sizing.
    for _ in 0..5 {
        let guard = pool.acquire().await.unwrap();
        guard.release(Err(())).await;
    }

    let result = pool.acquire().await;
    assert!(result.is_err(), "pool should report no eligible connection once the breaker opens");

    pool.shutdown(false, 0).await.unwrap();
}

/// S5. Retry with jitter: delays for attempts 0..3 stay within the
/// documented bounds relative to the nominal (unjittered) exponential
/// delay. `pool::retry::retry_delay`'s own unit tests cover the formula in
/// isolation; this re-checks the bound spec.md §8 states in its own terms.
#[tokio::test]
async fn s5_retry_jitter_bounds() {
    use rtdb_client::config::RetryConfig;
    use rtdb_client::pool::retry_delay;
    use rtdb_client::time::Duration;

    let config = RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        exponential_base: 2.0,
        jitter: true,
    };
    let expected_bounds = [(0.75, 1.25), (1.5, 2.5), (3.0, 5.0), (6.0, 10.0)];
    for (attempt, (low, high)) in expected_bounds.iter().enumerate() {
        let delay = retry_delay(&config, attempt as u32).as_secs_f64();
        assert!(delay >= *low - 1e-9 && delay <= *high + 1e-9, "attempt {attempt}: {delay} not in [{low}, {high}]");
    }
}

/// S6. Scheduler interval: an `Every` schedule fires repeatedly at its
/// interval, and cancelling it suppresses the next would-be invocation.
/// Run at real wall-clock time (not `tokio::time::pause`) because
/// [`rtdb_client::time::Timestamp::now`] reads `chrono::Utc::now`, which a
/// paused tokio clock does not affect; the interval is kept just above the
/// connection's fixed 1s maintenance tick (spec §4.8's default) so the
/// test still runs in a couple of seconds.
#[tokio::test]
async fn s6_scheduler_interval_and_cancel() {
    let (conn, mut server) = connect_pair().await;
    handshake(&mut server).await;
    assert!(wait_until(|| conn.is_connected(), 50, 10).await);

    let tick_count = Arc::new(AtomicU32::new(0));

    // Drain each CallReducer frame the actor sends as ticks fire, counting
    // them; discards the best-effort `client_connected` call too.
    let counter = tick_count.clone();
    tokio::spawn(async move {
        loop {
            match server.recv_frame().await {
                Ok(Some(frame)) => {
                    let (method, body) = rtdb_client::compression::unwrap_frame(&frame).unwrap();
                    let raw = rtdb_client::compression::decompress(
                        method,
                        body,
                        rtdb_client::codec::io::DEFAULT_MAX_PAYLOAD,
                    )
                    .unwrap();
                    let mut buf = Bytes::from(raw);
                    if let Ok(rtdb_client::codec::ClientMessage::CallReducer(call)) =
                        rtdb_client::codec::decode_client_message(&mut buf)
                    {
                        if matches!(call.reducer, ReducerId::Name(ref name) if name == "tick") {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                _ => break,
            }
        }
    });

    let id = conn
        .schedule_every("tick", Bytes::new(), rtdb_client::time::Duration::from_secs(1))
        .unwrap();

    assert!(wait_until(|| tick_count.load(Ordering::SeqCst) >= 2, 80, 50).await, "expected at least two ticks");

    conn.cancel_schedule(id).unwrap();
    let count_after_cancel = tick_count.load(Ordering::SeqCst);

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    assert_eq!(tick_count.load(Ordering::SeqCst), count_after_cancel, "cancelled schedule must not fire again");

    conn.close().await.unwrap();
}
