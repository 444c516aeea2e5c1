//! Connection runtime: owns the transport, request tracker, subscription
//! engine, table cache, event bus, scheduler and energy budget for one live
//! connection, spec §3/§4.5.
//!
//! The actor shape — a single task owning the transport exclusively,
//! `select!`ing an inbound write-queue against the transport's decode
//! future — follows `InnerClient::run_inner` in
//! `examples/Protryon-klickhouse/klickhouse/src/client.rs`, generalized
//! from "one query in flight" to the concurrent request/subscription/event
//! fan-out spec §4.5 and §4.6 require.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::message::{
    CallReducer, CallReducerFlags, OneOffQuery, ReducerId, Row, Subscribe, SubscribeMulti, Unsubscribe,
    UnsubscribeMulti,
};
use crate::codec::{self, AlgebraicValue, ClientMessage, ServerMessage};
use crate::compression::{self, AdaptiveCompressor, CompressionMethod};
use crate::config::{ClientConfig, Protocol};
use crate::energy::EnergyBudget;
use crate::error::{ConnectionError, Result, SubscriptionError as SubErr, TransportError};
use crate::events::{ConnectionEvent, EventBus};
use crate::identity::{ConnectionId, Identity, IdentityToken};
use crate::ids::{IdAllocator, QueryId, RequestId};
use crate::pool::retry::retry_delay;
use crate::request_tracker::RequestTracker;
use crate::scheduler::{ReducerInvoker, ScheduleId, Scheduler};
use crate::subscription::{
    classify, RowDelta, SubscriptionEngine, SubscriptionKind, SubscriptionState, SubscriptionStrategy,
};
use crate::table::{EventContext, ReducerEventInfo, TableCache, TableRegistry, TableSchema};
use crate::time::{Duration, ScheduleAt, Timestamp};
use crate::transport::{Transport, WebSocketTransport};

/// Name of the best-effort server-side lifecycle hook invoked once an
/// `IdentityToken` is received, spec §4.5 / §9 open question #3.
const CLIENT_CONNECTED_REDUCER: &str = "client_connected";

/// A future yielding a freshly dialed transport, used to re-establish the
/// socket after a disconnect when `auto_reconnect` is enabled. Only
/// [`Connection::connect`] supplies one; connections built from an
/// externally owned transport ([`Connection::from_transport`], used by
/// tests) never reconnect automatically.
type TransportFuture = Pin<Box<dyn std::future::Future<Output = Result<Box<dyn Transport>>> + Send>>;
type Reconnector = Arc<dyn Fn() -> TransportFuture + Send + Sync>;

/// Subprotocol names offered during the WebSocket handshake, spec §4.3's
/// "binary or text framing modes".
const BIN_SUBPROTOCOL: &str = "v1.bin.rtdb";
const TEXT_SUBPROTOCOL: &str = "v1.text.rtdb";

const MAINTENANCE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);
const SHUTDOWN_JOIN_DEADLINE: std::time::Duration = std::time::Duration::from_secs(3);

struct Inner {
    config: ClientConfig,
    ids: IdAllocator,
    tracker: StdMutex<RequestTracker>,
    subscriptions: SubscriptionEngine,
    tables: TableRegistry,
    events: EventBus,
    energy: EnergyBudget,
    scheduler: Scheduler,
    compressor: AdaptiveCompressor,
    identity: StdRwLock<Option<IdentityToken>>,
    connected: AtomicBool,
    write_tx: mpsc::Sender<ClientMessage>,
    shutdown: watch::Sender<bool>,
    reconnector: Option<Reconnector>,
}

/// Dispatches scheduled reducer calls (spec §4.8) onto the same write queue
/// `call_reducer` uses, fire-and-forget -- the scheduler does not await a
/// matching `TransactionUpdate`.
struct SchedulerInvoker {
    inner: Arc<Inner>,
}

#[async_trait]
impl ReducerInvoker for SchedulerInvoker {
    async fn call_reducer(&self, reducer_name: &str, args: &Bytes) -> Result<()> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected.into());
        }
        let request_id = self.inner.ids.next_request_id();
        self.inner
            .write_tx
            .send(ClientMessage::CallReducer(CallReducer {
                reducer: ReducerId::Name(reducer_name.to_string()),
                args: args.clone(),
                request_id,
                flags: CallReducerFlags::default(),
            }))
            .await
            .map_err(|_| TransportError::Closed.into())
    }
}

impl Inner {
    /// Stores the identity/token and, if `auto_trigger_lifecycle` is
    /// enabled, fires the best-effort `client_connected` reducer hook, spec
    /// §4.5: "failure must not terminate the connection". A full
    /// request/response channel doesn't exist to distinguish "reducer does
    /// not exist" from "reducer exists but failed" (spec §9 open question
    /// #3), so both are logged identically at `warn`.
    fn mark_connected(&self, identity: IdentityToken) {
        *self.identity.write().unwrap() = Some(identity.clone());
        self.connected.store(true, Ordering::SeqCst);
        self.events.publish(ConnectionEvent::Connected {
            identity: identity.identity,
            connection_id: identity.connection_id,
            at: Timestamp::now(),
        });
        if self.config.auto_trigger_lifecycle {
            let request_id = self.ids.next_request_id();
            let msg = ClientMessage::CallReducer(CallReducer {
                reducer: ReducerId::Name(CLIENT_CONNECTED_REDUCER.to_string()),
                args: Bytes::new(),
                request_id,
                flags: CallReducerFlags::NO_SUCCESS_NOTIFY,
            });
            if let Err(e) = self.write_tx.try_send(msg) {
                log::warn!("best-effort {CLIENT_CONNECTED_REDUCER} invocation failed to enqueue: {e}");
            }
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.events.publish(ConnectionEvent::Disconnected { at: Timestamp::now() });
        self.tracker.lock().unwrap().clear();
    }
}

/// A cloneable handle to one live connection, spec §3 "connection runtime".
/// Every clone shares the same background actor, request tracker,
/// subscription engine, and table registry.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    actor: Arc<StdMutex<Option<JoinHandle<()>>>>,
    maintenance: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl Connection {
    /// Opens a transport connection per `config` and spawns the receive
    /// actor. Blocks until the transport itself is open; the `IdentityToken`
    /// handshake completes asynchronously once the actor starts running.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let subprotocol = match config.protocol {
            Protocol::Binary => BIN_SUBPROTOCOL,
            Protocol::Text => TEXT_SUBPROTOCOL,
        };
        let uri = config.uri.clone();
        let transport = WebSocketTransport::connect(&uri, subprotocol).await?;
        let reconnector: Reconnector = Arc::new(move || {
            let uri = uri.clone();
            Box::pin(async move {
                let transport = WebSocketTransport::connect(&uri, subprotocol).await?;
                Ok(Box::new(transport) as Box<dyn Transport>)
            }) as TransportFuture
        });
        Self::build(config, Box::new(transport), Some(reconnector)).await
    }

    /// Wires an already-open transport into a new connection actor. Used
    /// directly by tests supplying an in-memory duplex transport (spec §8's
    /// scenario harness). Connections built this way never auto-reconnect:
    /// there is no way to re-dial an externally supplied transport.
    pub async fn from_transport(config: ClientConfig, transport: Box<dyn Transport>) -> Result<Self> {
        Self::build(config, transport, None).await
    }

    async fn build(config: ClientConfig, transport: Box<dyn Transport>, reconnector: Option<Reconnector>) -> Result<Self> {
        let (write_tx, write_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let now = Timestamp::now();

        let inner = Arc::new(Inner {
            energy: EnergyBudget::new(config.max_energy, Duration::from_secs(60), now),
            scheduler: Scheduler::new(config.scheduler.max_concurrent_executions),
            compressor: AdaptiveCompressor::new(
                config.compression.offered_methods().into_iter().next().unwrap_or(CompressionMethod::None),
            ),
            config,
            ids: IdAllocator::new(),
            tracker: StdMutex::new(RequestTracker::new()),
            subscriptions: SubscriptionEngine::new(Default::default()),
            tables: TableRegistry::new(),
            events: EventBus::new(),
            identity: StdRwLock::new(None),
            connected: AtomicBool::new(false),
            write_tx,
            shutdown: shutdown_tx,
            reconnector,
        });

        let events_for_budget = inner.events.clone();
        inner.energy.set_listener(move |event| {
            let evt = match event {
                crate::energy::BudgetEvent::Low => ConnectionEvent::BudgetLow,
                crate::energy::BudgetEvent::Exhausted => ConnectionEvent::BudgetExhausted,
                crate::energy::BudgetEvent::Refilled => ConnectionEvent::BudgetRefilled,
            };
            events_for_budget.publish(evt);
        });

        inner.events.publish(ConnectionEvent::Connecting);

        let actor_inner = inner.clone();
        let actor = tokio::spawn(supervise(transport, actor_inner, write_rx, shutdown_rx));

        let maintenance_inner = inner.clone();
        let mut maintenance_shutdown = inner.shutdown.subscribe();
        let maintenance = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {
                        let now = Timestamp::now();
                        let timed_out = maintenance_inner.tracker.lock().unwrap().poll_timeouts(now);
                        for id in timed_out {
                            maintenance_inner.energy.release(id.get() as u64);
                        }
                        if maintenance_inner.config.scheduler.auto_start {
                            let invoker = SchedulerInvoker { inner: maintenance_inner.clone() };
                            let _ = maintenance_inner.scheduler.run_ready(now, &invoker).await;
                        }
                    }
                    _ = maintenance_shutdown.changed() => {
                        if *maintenance_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            inner,
            actor: Arc::new(StdMutex::new(Some(actor))),
            maintenance: Arc::new(StdMutex::new(Some(maintenance))),
        })
    }

    /// Schedules a one-shot reducer invocation at `at`, spec §4.8.
    pub fn schedule_at(&self, reducer_name: impl Into<String>, args: Bytes, at: Timestamp) -> ScheduleId {
        self.inner.scheduler.schedule(reducer_name, args, ScheduleAt::At(at), HashMap::new(), Timestamp::now())
    }

    /// Schedules a recurring reducer invocation every `interval`, spec §4.8.
    pub fn schedule_every(&self, reducer_name: impl Into<String>, args: Bytes, interval: Duration) -> Result<ScheduleId> {
        let schedule = ScheduleAt::every(interval)?;
        Ok(self.inner.scheduler.schedule(reducer_name, args, schedule, HashMap::new(), Timestamp::now()))
    }

    /// Cancels a scheduled reducer invocation, spec §4.8.
    pub fn cancel_schedule(&self, id: ScheduleId) -> Result<()> {
        self.inner.scheduler.cancel(id)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> Option<IdentityToken> {
        self.inner.identity.read().unwrap().clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn register_table(&self, name: impl Into<String>, schema: TableSchema) -> Arc<TableCache> {
        self.inner.tables.register(name, schema)
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableCache>> {
        self.inner.tables.table(name)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn energy(&self) -> &EnergyBudget {
        &self.inner.energy
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.inner
            .write_tx
            .send(msg)
            .await
            .map_err(|_| TransportError::Closed.into())
    }

    /// Sends `CallReducer` without waiting for the matching
    /// `TransactionUpdate`, reserving its estimated energy cost up front.
    pub async fn call_reducer(&self, reducer_name: impl Into<String>, args: Bytes) -> Result<RequestId> {
        self.call_reducer_with_flags(reducer_name, args, CallReducerFlags::default(), false).await
    }

    /// Sends `CallReducer` with `force=true` energy accounting, bypassing
    /// the capacity check for emergency operations (spec §4.9).
    pub async fn call_reducer_forced(&self, reducer_name: impl Into<String>, args: Bytes) -> Result<RequestId> {
        self.call_reducer_with_flags(reducer_name, args, CallReducerFlags::default(), true).await
    }

    /// Sends `CallReducer` with explicit request `flags` (spec §6:
    /// `FULL_UPDATE`/`NO_SUCCESS_NOTIFY`), optionally bypassing the energy
    /// budget check via `force`.
    pub async fn call_reducer_with_flags(
        &self,
        reducer_name: impl Into<String>,
        args: Bytes,
        flags: CallReducerFlags,
        force: bool,
    ) -> Result<RequestId> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }
        let reducer_name = reducer_name.into();
        let request_id = self.inner.ids.next_request_id();
        let cost = self.inner.energy.estimate_cost(args.len());
        let reservation = self.inner.energy.reserve(request_id.get() as u64, cost.amount, force)?;
        // The reservation's bookkeeping lives in `EnergyBudget` keyed by
        // `op_id`; dropping the guard here is a no-op (it holds no Drop
        // impl), and the maintenance loop releases stale reservations for
        // requests that never get acked.
        drop(reservation);
        self.send(ClientMessage::CallReducer(CallReducer {
            reducer: ReducerId::Name(reducer_name),
            args,
            request_id,
            flags,
        }))
        .await?;
        Ok(request_id)
    }

    /// Registers and sends a subscription, resolving single vs multi per
    /// `strategy`, spec §4.6.
    pub async fn subscribe(&self, queries: Vec<String>, strategy: SubscriptionStrategy) -> Result<QueryId> {
        if queries.is_empty() {
            return Err(SubErr::Rejected { reason: "subscribe requires at least one query".into() }.into());
        }
        let kind = strategy.resolve(queries.len());
        let query_id = self.inner.ids.next_query_id();
        let request_id = self.inner.ids.next_request_id();
        let now = Timestamp::now();
        self.inner.subscriptions.begin(query_id, kind, queries.clone(), now);

        let msg = match kind {
            SubscriptionKind::Single => {
                ClientMessage::Subscribe(Subscribe { query_strings: queries, request_id, query_id })
            }
            SubscriptionKind::Multi => {
                ClientMessage::SubscribeMulti(SubscribeMulti { query_strings: queries, request_id, query_id })
            }
        };
        self.send(msg).await?;
        Ok(query_id)
    }

    /// Cancels a subscription, choosing `Unsubscribe`/`UnsubscribeMulti` by
    /// the subscription's recorded kind.
    pub async fn unsubscribe(&self, query_id: QueryId) -> Result<()> {
        let kind = self
            .inner
            .subscriptions
            .get(query_id)
            .map(|s| s.kind)
            .ok_or(SubErr::Rejected { reason: "unknown query id".into() })?;
        let request_id = self.inner.ids.next_request_id();
        let msg = match kind {
            SubscriptionKind::Single => ClientMessage::Unsubscribe(Unsubscribe { request_id, query_id }),
            SubscriptionKind::Multi => ClientMessage::UnsubscribeMulti(UnsubscribeMulti { request_id, query_id }),
        };
        self.send(msg).await
    }

    /// Sends a one-off SQL query and awaits its response, using a
    /// request-id-derived message id so the response can flow back through
    /// the same [`RequestTracker`] as every other request/response pair.
    pub async fn one_off_query(&self, query_string: impl Into<String>) -> Result<ServerMessage> {
        let request_id = self.inner.ids.next_request_id();
        let message_id = request_id.get().to_le_bytes().to_vec();
        let now = Timestamp::now();
        let rx = self.inner.tracker.lock().unwrap().track(request_id, now);
        self.send(ClientMessage::OneOffQuery(OneOffQuery { message_id, query_string: query_string.into() }))
            .await?;
        rx.await.map_err(|_| ConnectionError::Cancelled.into())
    }

    /// Closes the connection: signals the background actor and maintenance
    /// loop to stop and joins both within [`SHUTDOWN_JOIN_DEADLINE`].
    pub async fn close(&self) -> Result<()> {
        let _ = self.inner.shutdown.send(true);
        let actor = self.actor.lock().unwrap().take();
        let maintenance = self.maintenance.lock().unwrap().take();
        if let Some(handle) = actor {
            let _ = tokio::time::timeout(SHUTDOWN_JOIN_DEADLINE, handle).await;
        }
        if let Some(handle) = maintenance {
            let _ = tokio::time::timeout(SHUTDOWN_JOIN_DEADLINE, handle).await;
        }
        self.inner.mark_disconnected();
        Ok(())
    }
}

/// Owns the connection's transport across its whole lifetime, including
/// reconnects: runs one session via [`run_actor`] to completion, then -- if
/// the session ended by disconnect (not by `close()`) and a [`Reconnector`]
/// was supplied -- retries with jittered backoff up to
/// `max_reconnect_attempts` before giving up, spec §4.5's
/// `Reconnecting`/`Failed` transitions.
async fn supervise(
    mut transport: Box<dyn Transport>,
    inner: Arc<Inner>,
    mut write_rx: mpsc::Receiver<ClientMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let shutdown_requested = run_actor(transport.as_mut(), &inner, &mut write_rx, &mut shutdown_rx).await;
        let _ = transport.close().await;
        if shutdown_requested {
            break;
        }
        let Some(reconnector) = inner.reconnector.clone() else { break };
        if !inner.config.auto_reconnect {
            break;
        }
        match reconnect_with_backoff(&inner, reconnector.as_ref(), &mut shutdown_rx).await {
            Some(new_transport) => {
                transport = new_transport;
                resubscribe_active(&inner).await;
            }
            None => {
                if *shutdown_rx.borrow() {
                    break;
                }
                inner.events.publish(ConnectionEvent::ReconnectFailed { at: Timestamp::now() });
                inner.mark_disconnected();
                break;
            }
        }
    }
}

/// Retries `reconnector` with jittered exponential backoff (reusing the
/// pool's retry-delay formula, spec §4.10/§8 S5) up to
/// `config.max_reconnect_attempts` times, or until `shutdown_rx` fires.
/// Returns `None` once attempts are exhausted or shutdown wins the race.
async fn reconnect_with_backoff(
    inner: &Arc<Inner>,
    reconnector: &(dyn Fn() -> TransportFuture + Send + Sync),
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<Box<dyn Transport>> {
    for attempt in 0..inner.config.max_reconnect_attempts {
        inner.events.publish(ConnectionEvent::Reconnecting { attempt, at: Timestamp::now() });
        let delay = retry_delay(&inner.config.retry, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay.to_std()) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return None;
                }
            }
        }
        match reconnector().await {
            Ok(transport) => return Some(transport),
            Err(e) => log::warn!("reconnect attempt {attempt} failed: {e}"),
        }
    }
    None
}

/// Re-sends `Subscribe`/`SubscribeMulti` for every subscription that was
/// active before the disconnect, so the new connection's server-side state
/// matches what the caller still believes is subscribed.
async fn resubscribe_active(inner: &Arc<Inner>) {
    for query_id in inner.subscriptions.active_query_ids() {
        let Some(sub) = inner.subscriptions.get(query_id) else { continue };
        let now = Timestamp::now();
        inner.subscriptions.begin(query_id, sub.kind, sub.queries.clone(), now);
        let request_id = inner.ids.next_request_id();
        let msg = match sub.kind {
            SubscriptionKind::Single => {
                ClientMessage::Subscribe(Subscribe { query_strings: sub.queries, request_id, query_id })
            }
            SubscriptionKind::Multi => {
                ClientMessage::SubscribeMulti(SubscribeMulti { query_strings: sub.queries, request_id, query_id })
            }
        };
        let _ = inner.write_tx.send(msg).await;
    }
}

/// Resends `Subscribe`/`SubscribeMulti` for one subscription after a
/// retry-policy backoff delay, spec §4.6's `Retrying` state. A no-op if the
/// subscription was cancelled or re-applied in the meantime.
async fn resend_subscription(inner: &Arc<Inner>, query_id: QueryId) {
    let Some(sub) = inner.subscriptions.get(query_id) else { return };
    if sub.state != SubscriptionState::Retrying {
        return;
    }
    let request_id = inner.ids.next_request_id();
    let msg = match sub.kind {
        SubscriptionKind::Single => {
            ClientMessage::Subscribe(Subscribe { query_strings: sub.queries, request_id, query_id })
        }
        SubscriptionKind::Multi => {
            ClientMessage::SubscribeMulti(SubscribeMulti { query_strings: sub.queries, request_id, query_id })
        }
    };
    let _ = inner.write_tx.send(msg).await;
}

/// Runs one transport session to completion: serializes outbound writes
/// against the write queue and dispatches inbound frames, spec §4.5 "routed
/// on a single-threaded receive path". Returns `true` if it exited because
/// `close()` was called (no reconnect should follow), `false` if it exited
/// because the transport disconnected or errored.
async fn run_actor(
    transport: &mut dyn Transport,
    inner: &Arc<Inner>,
    write_rx: &mut mpsc::Receiver<ClientMessage>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return true;
                }
            }
            outbound = write_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = send_client_message(transport, inner, msg).await {
                            log::error!("failed to send client message: {e}");
                            inner.events.publish(ConnectionEvent::Error(Arc::new(e)));
                        }
                    }
                    None => return true,
                }
            }
            frame = transport.recv_frame() => {
                match frame {
                    Ok(Some(bytes)) => {
                        if let Err(e) = handle_frame(&bytes, inner) {
                            log::error!("failed to handle server frame: {e}");
                            inner.events.publish(ConnectionEvent::Error(Arc::new(e)));
                        }
                    }
                    Ok(None) => {
                        inner.mark_disconnected();
                        return false;
                    }
                    Err(e) => {
                        inner.events.publish(ConnectionEvent::Error(Arc::new(e)));
                        inner.mark_disconnected();
                        return false;
                    }
                }
            }
        }
    }
}

async fn send_client_message(transport: &mut dyn Transport, inner: &Inner, msg: ClientMessage) -> Result<()> {
    let encoded = codec::encode_client_message_to_vec(&msg)?;
    let (method, body) = inner.compressor.maybe_compress(&encoded)?;
    let framed = compression::wrap_frame(method, body);
    transport.send_frame(Bytes::from(framed)).await
}

fn handle_frame(frame: &Bytes, inner: &Arc<Inner>) -> Result<()> {
    let (method, body) = compression::unwrap_frame(frame)?;
    let raw = compression::decompress(method, body, crate::codec::io::DEFAULT_MAX_PAYLOAD)?;
    inner.compressor.record_received(raw.len());
    let mut buf = Bytes::from(raw);
    let message = codec::decode_server_message(&mut buf)?;
    dispatch_server_message(message, inner)
}

fn dispatch_server_message(message: ServerMessage, inner: &Arc<Inner>) -> Result<()> {
    let now = Timestamp::now();
    match message {
        ServerMessage::IdentityToken(t) => {
            let token = IdentityToken::new(t.identity, t.token, t.connection_id, now, None)?;
            inner.mark_connected(token);
            Ok(())
        }
        ServerMessage::InitialSubscription(sub) => {
            for table_update in sub.database_update.tables {
                apply_table_update(inner, &table_update, None);
            }
            let mut tracker = inner.tracker.lock().unwrap();
            tracker.resolve(sub.request_id, ServerMessage::OneOffQueryResponse(crate::codec::message::OneOffQueryResponse {
                message_id: Vec::new(),
                error: None,
                tables: Vec::new(),
                total_host_execution_duration_micros: sub.total_host_execution_duration_micros,
            }));
            Ok(())
        }
        ServerMessage::TransactionUpdate(update) => {
            let reducer_event = ReducerEventInfo {
                reducer_name: update.reducer_call.reducer_name.clone(),
                caller_identity: update.caller_identity,
                request_id: Some(update.reducer_call.request_id.get()),
            };
            inner.energy.consume(
                update.reducer_call.request_id.get() as u64,
                &update.reducer_call.reducer_name,
                update.energy_quanta_used.0,
            );
            if let crate::codec::message::UpdateStatus::Committed(db_update) = &update.status {
                for table_update in &db_update.tables {
                    apply_table_update(inner, table_update, Some(reducer_event.clone()));
                }
            }
            let resolved = inner.tracker.lock().unwrap().resolve(
                update.reducer_call.request_id,
                ServerMessage::TransactionUpdate(update),
            );
            let _ = resolved;
            Ok(())
        }
        ServerMessage::TransactionUpdateLight(light) => {
            for table_update in light.update.tables {
                apply_table_update(inner, &table_update, None);
            }
            Ok(())
        }
        ServerMessage::SubscribeApplied(applied) => {
            inner.subscriptions.mark_applied(applied.query_id, now)?;
            apply_table_update(inner, &applied.rows, None);
            inner.tracker.lock().unwrap().resolve(applied.request_id, ServerMessage::SubscribeApplied(applied.clone()));
            inner.events.publish(ConnectionEvent::SubscriptionApplied { query_id: applied.query_id });
            Ok(())
        }
        ServerMessage::UnsubscribeApplied(applied) => {
            inner.subscriptions.cancel(applied.query_id);
            inner
                .tracker
                .lock()
                .unwrap()
                .resolve(applied.request_id, ServerMessage::UnsubscribeApplied(applied));
            Ok(())
        }
        ServerMessage::SubscriptionError(err) => {
            if let Some(query_id) = err.query_id {
                if let Some(delay) = inner.subscriptions.mark_error(query_id, err.error.clone(), now) {
                    log::warn!("subscription {query_id:?} failed, retrying in {:.2}s: {}", delay.as_secs_f64(), err.error);
                    let retry_inner = inner.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay.to_std()).await;
                        resend_subscription(&retry_inner, query_id).await;
                    });
                } else {
                    inner.events.publish(ConnectionEvent::SubscriptionError {
                        query_id: Some(query_id),
                        message: err.error.clone(),
                    });
                }
            } else {
                inner.events.publish(ConnectionEvent::SubscriptionError { query_id: None, message: err.error.clone() });
            }
            if let Some(request_id) = err.request_id {
                inner.tracker.lock().unwrap().resolve(request_id, ServerMessage::SubscriptionError(err));
            }
            Ok(())
        }
        ServerMessage::OneOffQueryResponse(resp) => {
            if resp.message_id.len() == 4 {
                let bytes: [u8; 4] = resp.message_id.clone().try_into().unwrap();
                let request_id = RequestId(u32::from_le_bytes(bytes));
                inner.tracker.lock().unwrap().resolve(request_id, ServerMessage::OneOffQueryResponse(resp));
            }
            Ok(())
        }
    }
}

/// Decodes a table update's opaque rows against the table's declared type
/// (if registered) and applies deletes/updates/inserts in server-declared
/// order, spec §4.6.
fn apply_table_update(
    inner: &Inner,
    table_update: &crate::codec::message::TableUpdate,
    reducer_event: Option<ReducerEventInfo>,
) {
    let Some(table) = inner.tables.table(&table_update.table_name) else {
        log::debug!("received update for unregistered table {}", table_update.table_name);
        return;
    };
    let Some(row_type) = inner.row_type_for(&table_update.table_name) else {
        log::debug!("table {} has no declared row type, skipping decode", table_update.table_name);
        return;
    };
    let registry = crate::codec::TypeRegistry::new();
    let decode_row = |row: &Row| -> Option<AlgebraicValue> {
        let mut buf = row.0.clone();
        codec::decode(&mut buf, &row_type, &registry).ok()
    };
    let deletes: Vec<AlgebraicValue> = table_update.deletes.iter().filter_map(decode_row).collect();
    let inserts: Vec<AlgebraicValue> = table_update.inserts.iter().filter_map(decode_row).collect();

    let pk_index = table.primary_key_index();
    let ctx = EventContext::new(reducer_event, Timestamp::now());
    for delta in classify(&deletes, &inserts, pk_index) {
        match delta {
            RowDelta::Insert(row) => table.apply_insert(row, &ctx),
            RowDelta::Delete(row) => table.apply_delete(&row, &ctx),
            RowDelta::Update { old, new } => table.apply_update(old, new, &ctx),
        }
    }
}

impl Inner {
    fn row_type_for(&self, table_name: &str) -> Option<crate::codec::AlgebraicType> {
        self.tables.table(table_name).and_then(|t| t.row_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AlgebraicType, ProductField};
    use crate::transport::FramedTransport;

    fn message_row_type() -> AlgebraicType {
        AlgebraicType::Product(vec![
            ProductField { name: "id".into(), ty: AlgebraicType::I32 },
            ProductField { name: "text".into(), ty: AlgebraicType::String },
        ])
    }

    fn test_config() -> ClientConfig {
        ClientConfig::builder("ws://localhost:3000", "test_module").build().unwrap()
    }

    #[tokio::test]
    async fn identity_token_frame_marks_connected_and_stores_identity() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let client_transport = FramedTransport::new(client_io);
        let conn = Connection::from_transport(test_config(), Box::new(client_transport)).await.unwrap();

        let mut server = FramedTransport::new(server_io);
        let identity_msg = ServerMessage::IdentityToken(crate::codec::message::IdentityTokenMessage {
            identity: Identity::from_public_key(b"test"),
            token: "tok".into(),
            connection_id: ConnectionId::generate(),
        });
        let encoded = codec::encode_server_message_to_vec(&identity_msg).unwrap();
        let framed = compression::wrap_frame(CompressionMethod::None, encoded);
        server.send_frame(Bytes::from(framed)).await.unwrap();

        for _ in 0..50 {
            if conn.is_connected() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(conn.is_connected());
        assert!(conn.identity().is_some());
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_applied_populates_table_cache() {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let client_transport = FramedTransport::new(client_io);
        let conn = Connection::from_transport(test_config(), Box::new(client_transport)).await.unwrap();
        conn.register_table(
            "messages",
            TableSchema { primary_key_index: Some(0), unique_indexes: vec![], row_type: Some(message_row_type()) },
        );

        let mut server = FramedTransport::new(server_io);
        let query_id = conn.subscribe(vec!["SELECT * FROM messages".into()], SubscriptionStrategy::Adaptive).await.unwrap();

        // Drain the Subscribe request the actor just sent.
        let _ = server.recv_frame().await.unwrap();

        let row = codec::encode_to_vec(
            &message_row_type(),
            &AlgebraicValue::Product(vec![AlgebraicValue::I32(1), AlgebraicValue::String("hi".into())]),
            &crate::codec::TypeRegistry::new(),
        )
        .unwrap();
        let applied = ServerMessage::SubscribeApplied(crate::codec::message::SubscribeApplied {
            request_id: RequestId(1),
            query_id,
            rows: crate::codec::message::TableUpdate {
                table_id: 1,
                table_name: "messages".into(),
                deletes: vec![],
                inserts: vec![Row(row.into())],
            },
        });
        let encoded = codec::encode_server_message_to_vec(&applied).unwrap();
        server.send_frame(Bytes::from(compression::wrap_frame(CompressionMethod::None, encoded))).await.unwrap();

        let table = conn.table("messages").unwrap();
        for _ in 0..50 {
            if table.count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(table.count(), 1);
        conn.close().await.unwrap();
    }
}
