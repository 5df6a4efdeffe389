//! # Persistent Subscriptions
//!
//! Durable, ack-based delivery of events to consumers, one long-lived worker
//! task per active subscription.
//!
//! ## The Catch-Up + Live Pattern
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      Subscription Timeline                            │
//! │                                                                       │
//! │  checkpoint = 100                        head = 500                   │
//! │       │                                     │                         │
//! │       ▼                                     ▼                         │
//! │  ┌──────────────────────────────┐  ┌───────────────────────────────┐ │
//! │  │    Phase 1: catching up      │  │    Phase 2: subscribed        │ │
//! │  │    page 101..500 from the    │  │    woken by the notification  │ │
//! │  │    log, ignore the bus       │  │    bus, read 501+ from the    │ │
//! │  │                              │  │    log, poll as a fallback    │ │
//! │  └──────────────────────────────┘  └───────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Notifications are hints, never content: in both phases every delivered
//! event comes from the log, so a lost notification costs latency (until the
//! next poll) and never correctness. The control inbox is drained before the
//! catch-up → live flip so acks cannot be reordered around the transition.
//!
//! ## State machine
//!
//! ```text
//!  initial → catching_up → subscribed ⇄ disconnected
//!                                   ↘ paused
//! ```
//!
//! ## Exactly-once per subscription
//!
//! Deliveries carry tokens; the in-flight window tracks delivered-but-unacked
//! positions, bounded by `max_in_flight`. Acks may arrive out of order; the
//! checkpoint (`last_seen`) only ever advances over the *contiguous* acked
//! prefix, so a consumer promoted after failover re-receives exactly the
//! unacknowledged tail. Consumers must be idempotent.
//!
//! ## Single-active failover
//!
//! At most one consumer per subscription is active; later consumers queue in
//! FIFO order and are promoted when the active one disconnects, is dropped,
//! or misses heartbeats for `consumer_timeout`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SubscriptionOptions;
use crate::error::{Error, Result};
use crate::notifications::{NotificationBus, NotificationKind, StoreNotification};
use crate::reader;
use crate::storage::Storage;
use crate::types::{
    DeliveryToken, NackAction, Position, RecordedEvent, StartFrom, StreamUuid, SubscriptionState,
};

/// Bound on consumers queued behind the active one.
const MAX_PENDING_CONSUMERS: usize = 16;

/// Control inbox depth per subscription.
const CONTROL_CHANNEL_SIZE: usize = 64;

/// Floor for the worker's housekeeping tick.
const MIN_HOUSEKEEPING_TICK: Duration = Duration::from_millis(100);

// =============================================================================
// Deliveries and Control Messages
// =============================================================================

/// One event handed to one consumer, identified by its token.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Token to pass back in `ack`/`nack`.
    pub token: DeliveryToken,
    /// The delivered event.
    pub event: RecordedEvent,
}

/// Messages a consumer (or the store) sends to a subscription worker.
#[derive(Debug)]
pub(crate) enum ControlMessage {
    Ack(DeliveryToken),
    Nack(DeliveryToken, NackAction),
    Pause,
    Resume,
    Disconnect,
    Heartbeat,
    ReplayParked,
}

// =============================================================================
// In-Flight Window
// =============================================================================

#[derive(Debug)]
struct InFlightEntry {
    token: u64,
    attempts: u32,
    delivered_at: Instant,
    acked: bool,
    event: RecordedEvent,
}

/// Tracks delivered-but-unacked positions and derives checkpoint advances.
///
/// Entries are kept in position order. Acking out of order buffers the ack;
/// the window pops (and reports) only the contiguous acked prefix, which is
/// exactly how far `last_seen` may move.
#[derive(Debug)]
pub(crate) struct InFlightWindow {
    max: usize,
    entries: BTreeMap<u64, InFlightEntry>,
    tokens: HashMap<u64, u64>,
    unacked: usize,
}

impl InFlightWindow {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            entries: BTreeMap::new(),
            tokens: HashMap::new(),
            unacked: 0,
        }
    }

    /// Deliveries the window can still accept.
    pub(crate) fn capacity(&self) -> usize {
        self.max.saturating_sub(self.unacked)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a delivery at the event's position.
    pub(crate) fn insert(&mut self, token: u64, event: RecordedEvent) {
        let position = event.position.as_raw();
        self.tokens.insert(token, position);
        self.entries.insert(
            position,
            InFlightEntry {
                token,
                attempts: 1,
                delivered_at: Instant::now(),
                acked: false,
                event,
            },
        );
        self.unacked += 1;
    }

    /// Pops the contiguous acked prefix, returning the highest popped
    /// position.
    fn pop_acked_prefix(&mut self) -> Option<u64> {
        let mut advanced_to = None;
        while let Some(entry) = self.entries.first_entry() {
            if !entry.get().acked {
                break;
            }
            let (position, _) = entry.remove_entry();
            advanced_to = Some(position);
        }
        advanced_to
    }

    fn mark_acked(&mut self, token: u64) -> Option<u64> {
        let position = self.tokens.remove(&token)?;
        let entry = self.entries.get_mut(&position)?;
        entry.acked = true;
        self.unacked -= 1;
        Some(position)
    }

    /// Acknowledges a delivery. Returns the new contiguous high-water
    /// position if the checkpoint may advance. Unknown or stale tokens are
    /// ignored.
    pub(crate) fn ack(&mut self, token: u64) -> Option<u64> {
        self.mark_acked(token)?;
        self.pop_acked_prefix()
    }

    /// Settles a delivery without acknowledgement semantics for the
    /// consumer (skip and park): the window advances exactly as for an ack.
    /// Returns `(position, advanced_to)`.
    pub(crate) fn settle(&mut self, token: u64) -> Option<(u64, Option<u64>)> {
        let position = self.mark_acked(token)?;
        Some((position, self.pop_acked_prefix()))
    }

    /// Deliveries attempted so far for the entry behind `token`.
    pub(crate) fn attempts(&self, token: u64) -> Option<u32> {
        let position = self.tokens.get(&token)?;
        self.entries.get(position).map(|e| e.attempts)
    }

    /// Rebinds an entry to a fresh token for redelivery, bumping its attempt
    /// counter. Returns the event to resend.
    pub(crate) fn begin_retry(&mut self, token: u64, new_token: u64) -> Option<RecordedEvent> {
        let position = self.tokens.remove(&token)?;
        let entry = self.entries.get_mut(&position)?;
        entry.token = new_token;
        entry.attempts += 1;
        entry.delivered_at = Instant::now();
        self.tokens.insert(new_token, position);
        Some(entry.event.clone())
    }

    /// Tokens of unacked entries older than `timeout`.
    pub(crate) fn expired(&self, now: Instant, timeout: Duration) -> Vec<u64> {
        self.entries
            .values()
            .filter(|e| !e.acked && now.duration_since(e.delivered_at) >= timeout)
            .map(|e| e.token)
            .collect()
    }

    /// Drops every in-flight delivery originating from `stream_uuid` (hard
    /// delete reconciliation). Returns the checkpoint advance, if any.
    pub(crate) fn drop_stream(&mut self, stream_uuid: &str) -> Option<u64> {
        let tokens: Vec<u64> = self
            .entries
            .values()
            .filter(|e| !e.acked && e.event.stream_uuid.as_str() == stream_uuid)
            .map(|e| e.token)
            .collect();
        for token in tokens {
            self.mark_acked(token);
        }
        self.pop_acked_prefix()
    }
}

// =============================================================================
// Single-Active Consumer Registry
// =============================================================================

type SlotKey = (String, String);

struct ActiveConsumer {
    consumer_id: u64,
    // Weak: the registry must not keep a dead consumer's inbox open. The
    // channel closes when the handle and its heartbeat task are gone, and a
    // closed inbox is how the worker notices a dropped consumer immediately.
    control: Option<mpsc::WeakSender<ControlMessage>>,
}

struct PendingConsumer {
    consumer_id: u64,
    promote: oneshot::Sender<()>,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveConsumer>,
    pending: VecDeque<PendingConsumer>,
}

/// Arbitrates the single-active-consumer rule per `(stream, name)`.
///
/// One consumer holds the slot; later consumers queue FIFO and are promoted
/// on release. The registry holds no durable data — it is rebuilt empty on
/// restart and the database checkpoint carries the resume position.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    slots: Mutex<HashMap<SlotKey, Slot>>,
    next_consumer_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_consumer_id(&self) -> u64 {
        self.next_consumer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Claims the slot. `None` means the caller is active now; otherwise the
    /// returned receiver resolves when the caller is promoted.
    fn acquire(&self, key: &SlotKey, consumer_id: u64) -> Result<Option<oneshot::Receiver<()>>> {
        let mut slots = self.slots.lock().expect("registry mutex poisoned");
        let slot = slots.entry(key.clone()).or_default();

        if slot.active.is_none() {
            slot.active = Some(ActiveConsumer {
                consumer_id,
                control: None,
            });
            return Ok(None);
        }

        if slot.pending.len() >= MAX_PENDING_CONSUMERS {
            return Err(Error::SubscriptionConflict {
                stream_uuid: key.0.clone(),
                name: key.1.clone(),
            });
        }

        let (promote, promoted) = oneshot::channel();
        slot.pending.push_back(PendingConsumer {
            consumer_id,
            promote,
        });
        Ok(Some(promoted))
    }

    /// Records the active worker's control inbox, for replay routing.
    fn set_active_control(
        &self,
        key: &SlotKey,
        consumer_id: u64,
        tx: mpsc::WeakSender<ControlMessage>,
    ) {
        let mut slots = self.slots.lock().expect("registry mutex poisoned");
        if let Some(slot) = slots.get_mut(key) {
            if let Some(active) = &mut slot.active {
                if active.consumer_id == consumer_id {
                    active.control = Some(tx);
                }
            }
        }
    }

    /// The active worker's control inbox, if a consumer is attached.
    pub(crate) fn active_control(&self, key: &SlotKey) -> Option<mpsc::Sender<ControlMessage>> {
        let slots = self.slots.lock().expect("registry mutex poisoned");
        slots
            .get(key)
            .and_then(|s| s.active.as_ref())
            .and_then(|a| a.control.as_ref())
            .and_then(|weak| weak.upgrade())
    }

    /// Releases the slot or abandons a pending place, promoting the next
    /// pending consumer in FIFO order.
    fn release(&self, key: &SlotKey, consumer_id: u64) {
        let mut slots = self.slots.lock().expect("registry mutex poisoned");
        let Some(slot) = slots.get_mut(key) else {
            return;
        };

        if slot.active.as_ref().is_some_and(|a| a.consumer_id == consumer_id) {
            slot.active = None;
            while let Some(next) = slot.pending.pop_front() {
                let id = next.consumer_id;
                if next.promote.send(()).is_ok() {
                    slot.active = Some(ActiveConsumer {
                        consumer_id: id,
                        control: None,
                    });
                    break;
                }
            }
        } else {
            slot.pending.retain(|p| p.consumer_id != consumer_id);
        }

        if slot.active.is_none() && slot.pending.is_empty() {
            slots.remove(key);
        }
    }
}

// =============================================================================
// The Subscription Handle
// =============================================================================

/// A consumer's handle to a persistent subscription.
///
/// Receive with [`next`](Self::next), then [`ack`](Self::ack) or
/// [`nack`](Self::nack) each delivery by token. Dropping the handle
/// disconnects the consumer without persisting partial acks; the next pending
/// consumer (or a later `subscribe`) resumes from the stored checkpoint.
pub struct Subscription {
    stream_uuid: StreamUuid,
    name: String,
    events_rx: mpsc::Receiver<Delivery>,
    control_tx: mpsc::Sender<ControlMessage>,
    heartbeat_task: JoinHandle<()>,
}

impl Subscription {
    /// The subscribed stream (possibly `$all`).
    pub fn stream_uuid(&self) -> &StreamUuid {
        &self.stream_uuid
    }

    /// The subscription's durable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next delivery. `None` means the worker has stopped
    /// (disconnect, failover loss, or store shutdown).
    pub async fn next(&mut self) -> Option<Delivery> {
        self.events_rx.recv().await
    }

    async fn send(&self, message: ControlMessage) -> Result<()> {
        self.control_tx
            .send(message)
            .await
            .map_err(|_| Error::SubscriptionClosed)
    }

    /// Acknowledges a delivery. Idempotent: stale tokens are ignored.
    pub async fn ack(&self, token: DeliveryToken) -> Result<()> {
        self.send(ControlMessage::Ack(token)).await
    }

    /// Rejects a delivery with the chosen [`NackAction`].
    pub async fn nack(&self, token: DeliveryToken, action: NackAction) -> Result<()> {
        self.send(ControlMessage::Nack(token, action)).await
    }

    /// Administratively halts delivery; in-flight acks are still processed.
    pub async fn pause(&self) -> Result<()> {
        self.send(ControlMessage::Pause).await
    }

    /// Resumes a paused subscription (re-enters catch-up).
    pub async fn resume(&self) -> Result<()> {
        self.send(ControlMessage::Resume).await
    }

    /// Detaches this consumer. The subscription row and checkpoint survive;
    /// unacknowledged in-flight deliveries will be redelivered to the next
    /// consumer.
    pub async fn unsubscribe(self) -> Result<()> {
        self.send(ControlMessage::Disconnect).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Ends the liveness signal; the worker notices the closed inbox (or
        // the missing heartbeats) and disconnects.
        self.heartbeat_task.abort();
    }
}

// =============================================================================
// Consumer Capability
// =============================================================================

/// Verdict-returning consumer callback for [`run_handler`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one delivered event. `Ok(())` acks; `Err(action)` nacks with
    /// that action.
    async fn handle(&self, event: &RecordedEvent) -> std::result::Result<(), NackAction>;
}

/// Drives a subscription with a handler until the subscription ends.
///
/// Handler rejections become nacks; the engine never unwinds past a
/// delivery callback.
pub async fn run_handler(mut subscription: Subscription, handler: &dyn EventHandler) -> Result<()> {
    while let Some(delivery) = subscription.next().await {
        match handler.handle(&delivery.event).await {
            Ok(()) => subscription.ack(delivery.token).await?,
            Err(action) => subscription.nack(delivery.token, action).await?,
        }
    }
    Ok(())
}

// =============================================================================
// Worker Spawn
// =============================================================================

/// Creates (or resumes) a persistent subscription and spawns its worker.
pub(crate) async fn spawn_subscription(
    storage: Storage,
    bus: &NotificationBus,
    registry: Arc<SubscriptionRegistry>,
    stream_uuid: StreamUuid,
    name: String,
    options: SubscriptionOptions,
    store_batch_size: usize,
) -> Result<Subscription> {
    if stream_uuid.as_str().is_empty()
        || (stream_uuid.as_str().starts_with('$') && !stream_uuid.is_all())
    {
        return Err(Error::InvalidStreamUuid {
            stream_uuid: stream_uuid.as_str().to_string(),
            reason: "subscriptions accept concrete streams or $all",
        });
    }

    // start_from only matters the first time this (stream, name) is seen;
    // an existing row resumes from its checkpoint.
    let initial_last_seen = match options.start_from {
        StartFrom::Origin => 0,
        StartFrom::Position(p) => p.as_raw(),
        StartFrom::Current => {
            if stream_uuid.is_all() {
                storage.all_head().await?
            } else {
                storage
                    .fetch_stream_state(&stream_uuid)
                    .await?
                    .current_version()
            }
        }
    };

    let row = storage
        .ensure_subscription(&stream_uuid, &name, initial_last_seen)
        .await?;

    let key: SlotKey = (stream_uuid.as_str().to_string(), name.clone());
    let consumer_id = registry.next_consumer_id();
    let activation = registry.acquire(&key, consumer_id)?;

    let (events_tx, events_rx) = mpsc::channel(options.max_in_flight + 16);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);

    let heartbeat_tx = control_tx.clone();
    let heartbeat_interval = options.heartbeat_interval;
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            // A full inbox still proves the consumer process is alive on the
            // next drain; losing a single heartbeat is harmless.
            match heartbeat_tx.try_send(ControlMessage::Heartbeat) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });

    let batch_size = options.read_batch_size.unwrap_or(store_batch_size);
    let window = InFlightWindow::new(options.max_in_flight);
    let worker = SubscriptionWorker {
        storage,
        registry: Arc::clone(&registry),
        key: key.clone(),
        consumer_id,
        stream_uuid: stream_uuid.clone(),
        subscription_id: row.subscription_id,
        options,
        batch_size,
        events_tx,
        control: control_tx.downgrade(),
        control_rx,
        notifications: bus.subscribe(),
        activation,
        cursor: row.last_seen,
        last_seen: row.last_seen,
        unpersisted_acks: 0,
        dirty: false,
        window,
        replaying: HashMap::new(),
        next_token: 0,
        last_heartbeat: Instant::now(),
    };

    tokio::spawn(async move {
        let key = worker.key.clone();
        let consumer_id = worker.consumer_id;
        let registry = Arc::clone(&worker.registry);
        worker.run().await;
        registry.release(&key, consumer_id);
    });

    Ok(Subscription {
        stream_uuid,
        name,
        events_rx,
        control_tx,
        heartbeat_task,
    })
}

// =============================================================================
// The Worker
// =============================================================================

/// Where the state machine goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    CatchUp,
    Live,
    Paused,
    Stop,
}

#[derive(Debug, Clone)]
struct ReplayEntry {
    position: u64,
    attempts: u32,
}

struct SubscriptionWorker {
    storage: Storage,
    registry: Arc<SubscriptionRegistry>,
    key: SlotKey,
    consumer_id: u64,
    stream_uuid: StreamUuid,
    subscription_id: i64,
    options: SubscriptionOptions,
    batch_size: usize,
    events_tx: mpsc::Sender<Delivery>,
    /// Weak handle to the own inbox, registered for replay routing.
    control: mpsc::WeakSender<ControlMessage>,
    control_rx: mpsc::Receiver<ControlMessage>,
    notifications: broadcast::Receiver<StoreNotification>,
    activation: Option<oneshot::Receiver<()>>,
    /// Highest position delivered (internal cursor; may run ahead of acks).
    cursor: u64,
    /// Highest contiguous acked position (the durable checkpoint's value).
    last_seen: u64,
    unpersisted_acks: u64,
    dirty: bool,
    window: InFlightWindow,
    /// Parked deliveries re-issued by a replay request, keyed by token.
    replaying: HashMap<u64, ReplayEntry>,
    next_token: u64,
    last_heartbeat: Instant,
}

impl SubscriptionWorker {
    async fn run(mut self) {
        if !self.await_activation().await {
            debug!(stream = %self.stream_uuid, name = %self.key.1, "pending consumer left before promotion");
            return;
        }
        self.registry
            .set_active_control(&self.key, self.consumer_id, self.control.clone());

        // Resume from the checkpoint as persisted *now*: a consumer promoted
        // after waiting in the pending queue must not fall back to the value
        // snapshotted when it subscribed.
        match self
            .storage
            .find_subscription(&self.stream_uuid, &self.key.1)
            .await
        {
            Ok(Some(row)) => {
                self.subscription_id = row.subscription_id;
                self.cursor = row.last_seen;
                self.last_seen = row.last_seen;
            }
            Ok(None) => {}
            Err(error) => {
                warn!(
                    stream = %self.stream_uuid,
                    name = %self.key.1,
                    %error,
                    "failed to refresh checkpoint on attach"
                );
            }
        }

        self.last_heartbeat = Instant::now();
        info!(stream = %self.stream_uuid, name = %self.key.1, "consumer attached");

        let mut next = Next::CatchUp;
        loop {
            next = match next {
                Next::CatchUp => self.catch_up().await,
                Next::Live => self.live().await,
                Next::Paused => self.paused().await,
                Next::Stop => break,
            };
        }

        self.flush_checkpoint().await;
        self.persist_state(SubscriptionState::Disconnected).await;
        info!(stream = %self.stream_uuid, name = %self.key.1, "consumer disconnected");
    }

    /// Waits for promotion when another consumer holds the slot.
    async fn await_activation(&mut self) -> bool {
        let Some(mut promoted) = self.activation.take() else {
            return true;
        };
        // The row keeps reflecting the *active* consumer's state while this
        // one waits; nothing is persisted here.
        loop {
            tokio::select! {
                result = &mut promoted => return result.is_ok(),
                message = self.control_rx.recv() => match message {
                    Some(ControlMessage::Heartbeat) => {}
                    Some(ControlMessage::Disconnect) | None => return false,
                    // Acks and friends are meaningless before any delivery.
                    Some(_) => {}
                }
            }
        }
    }

    // =========================================================================
    // Phases
    // =========================================================================

    /// Pages events from the log until the head is reached. Ignores the
    /// notification bus entirely.
    async fn catch_up(&mut self) -> Next {
        self.persist_state(SubscriptionState::CatchingUp).await;
        debug!(stream = %self.stream_uuid, name = %self.key.1, from = self.cursor, "catching up");

        loop {
            while let Ok(message) = self.control_rx.try_recv() {
                if let Some(next) = self.handle_control(message).await {
                    return next;
                }
            }
            if self.heartbeat_expired() {
                return Next::Stop;
            }
            if let Some(next) = self.redeliver_expired().await {
                return next;
            }
            self.flush_checkpoint_if_due().await;

            let capacity = self.capacity();
            if capacity == 0 {
                // Window full: block on the inbox until acks free capacity.
                let tick = self.housekeeping_tick();
                tokio::select! {
                    message = self.control_rx.recv() => match message {
                        Some(message) => {
                            if let Some(next) = self.handle_control(message).await {
                                return next;
                            }
                        }
                        None => return Next::Stop,
                    },
                    _ = tokio::time::sleep(tick) => {}
                }
                continue;
            }

            let from = Position::from_raw(self.cursor).next();
            let limit = capacity.min(self.batch_size);
            match self.read_page(from, limit).await {
                Ok(page) if page.is_empty() => {
                    // Head reached. Drain the inbox completely before the
                    // mode flip so no ack is reordered around it.
                    while let Ok(message) = self.control_rx.try_recv() {
                        if let Some(next) = self.handle_control(message).await {
                            return next;
                        }
                    }
                    return Next::Live;
                }
                Ok(page) => {
                    for event in page {
                        if !self.deliver(event).await {
                            return Next::Stop;
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        stream = %self.stream_uuid,
                        name = %self.key.1,
                        %error,
                        "catch-up read failed, disconnecting"
                    );
                    return Next::Stop;
                }
            }
        }
    }

    /// At the head: woken by the bus, reads new events from the log, polls
    /// as a fallback.
    async fn live(&mut self) -> Next {
        self.persist_state(SubscriptionState::Subscribed).await;
        debug!(stream = %self.stream_uuid, name = %self.key.1, at = self.cursor, "live");

        // Fresh receiver: catch-up already covered the backlog, and anything
        // committed between the last page and here is picked up by the
        // initial read below.
        self.notifications = self.notifications.resubscribe();
        if let Some(next) = self.deliver_new().await {
            return next;
        }

        let mut poll = tokio::time::interval(self.options.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        poll.reset();
        let mut housekeeping = tokio::time::interval(self.housekeeping_tick());
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = self.control_rx.recv() => match message {
                    Some(message) => {
                        if let Some(next) = self.handle_control(message).await {
                            return next;
                        }
                    }
                    None => return Next::Stop,
                },
                notification = self.notifications.recv() => match notification {
                    Ok(notification) if notification.concerns(&self.stream_uuid) => {
                        if let Some(next) = self.handle_notification(notification).await {
                            return next;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The bus outran us; the log has the truth.
                        debug!(
                            stream = %self.stream_uuid,
                            name = %self.key.1,
                            missed,
                            "notification bus lagged, reconciling from the log"
                        );
                        return Next::CatchUp;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Bus torn down (store shutdown in progress); the
                        // poll tick keeps delivery alive meanwhile.
                    }
                },
                _ = poll.tick() => {
                    if let Some(next) = self.deliver_new().await {
                        return next;
                    }
                }
                _ = housekeeping.tick() => {
                    if self.heartbeat_expired() {
                        return Next::Stop;
                    }
                    if let Some(next) = self.redeliver_expired().await {
                        return next;
                    }
                    self.flush_checkpoint_if_due().await;
                }
            }
        }
    }

    /// Administrative halt: acks and nacks are still honored, no new events
    /// are delivered.
    async fn paused(&mut self) -> Next {
        self.persist_state(SubscriptionState::Paused).await;
        info!(stream = %self.stream_uuid, name = %self.key.1, "paused");

        let mut housekeeping = tokio::time::interval(self.housekeeping_tick());
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                message = self.control_rx.recv() => match message {
                    Some(ControlMessage::Resume) => {
                        info!(stream = %self.stream_uuid, name = %self.key.1, "resumed");
                        return Next::CatchUp;
                    }
                    Some(ControlMessage::Pause) => {}
                    Some(message) => {
                        if let Some(next) = self.handle_control(message).await {
                            return next;
                        }
                    }
                    None => return Next::Stop,
                },
                _ = housekeeping.tick() => {
                    if self.heartbeat_expired() {
                        return Next::Stop;
                    }
                    self.flush_checkpoint_if_due().await;
                }
            }
        }
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    fn capacity(&self) -> usize {
        self.window.capacity().saturating_sub(self.replaying.len())
    }

    fn housekeeping_tick(&self) -> Duration {
        (self.options.ack_timeout / 4)
            .min(self.options.checkpoint_interval)
            .max(MIN_HOUSEKEEPING_TICK)
    }

    fn mint_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Reads a page of the subscribed stream past the cursor.
    ///
    /// A stream that does not exist yet — or is currently deleted — simply
    /// has nothing to deliver; the subscription stays attached and resumes
    /// if the stream (re)appears.
    async fn read_page(&self, from: Position, limit: usize) -> Result<Vec<RecordedEvent>> {
        match reader::read_forward(&self.storage, &self.stream_uuid, from, limit).await {
            Ok(page) => Ok(page),
            Err(Error::StreamNotFound { .. }) | Err(Error::StreamDeleted { .. }) => Ok(Vec::new()),
            Err(error) => Err(error),
        }
    }

    /// Sends one event to the consumer and records it in the window.
    /// Returns false when the consumer side is gone.
    async fn deliver(&mut self, event: RecordedEvent) -> bool {
        let token = self.mint_token();
        let position = event.position.as_raw();
        self.window.insert(token, event.clone());
        self.cursor = self.cursor.max(position);
        self.events_tx
            .send(Delivery {
                token: DeliveryToken::from_raw(token),
                event,
            })
            .await
            .is_ok()
    }

    /// Reads and delivers everything committed past the cursor, page by
    /// page, bounded by window capacity.
    async fn deliver_new(&mut self) -> Option<Next> {
        loop {
            let capacity = self.capacity();
            if capacity == 0 {
                return None;
            }
            let from = Position::from_raw(self.cursor).next();
            let limit = capacity.min(self.batch_size);
            match self.read_page(from, limit).await {
                Ok(page) if page.is_empty() => return None,
                Ok(page) => {
                    for event in page {
                        if !self.deliver(event).await {
                            return Some(Next::Stop);
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        stream = %self.stream_uuid,
                        name = %self.key.1,
                        %error,
                        "live read failed, disconnecting"
                    );
                    return Some(Next::Stop);
                }
            }
        }
    }

    /// Reacts to one bus notification while live.
    async fn handle_notification(&mut self, notification: StoreNotification) -> Option<Next> {
        match notification.kind {
            NotificationKind::HardDeleted => {
                // Drop in-flight deliveries from the removed stream; their
                // events no longer exist to be retried or replayed.
                let advanced = self.window.drop_stream(&notification.stream_uuid);
                self.note_advance(advanced, 0).await;
                None
            }
            NotificationKind::SoftDeleted => None,
            NotificationKind::Appended | NotificationKind::Linked => {
                let announced_from = if self.stream_uuid.is_all() {
                    notification.from_sequence
                } else {
                    notification.from_version
                };
                if announced_from > self.cursor + 1 {
                    // The bus reported a range beyond what we have seen:
                    // something was missed, reconcile from the log.
                    return Some(Next::CatchUp);
                }
                self.deliver_new().await
            }
        }
    }

    // =========================================================================
    // Acks, Nacks, Redelivery
    // =========================================================================

    async fn handle_control(&mut self, message: ControlMessage) -> Option<Next> {
        match message {
            ControlMessage::Heartbeat => {
                self.last_heartbeat = Instant::now();
                None
            }
            ControlMessage::Disconnect => Some(Next::Stop),
            ControlMessage::Pause => Some(Next::Paused),
            ControlMessage::Resume => None,
            ControlMessage::Ack(token) => {
                self.handle_ack(token.as_raw()).await;
                None
            }
            ControlMessage::Nack(token, action) => self.handle_nack(token.as_raw(), action).await,
            ControlMessage::ReplayParked => self.replay_parked().await,
        }
    }

    async fn handle_ack(&mut self, token: u64) {
        if let Some(replay) = self.replaying.remove(&token) {
            // Successful manual replay: the parked row is done.
            if let Err(error) = self
                .storage
                .unpark(self.subscription_id, Position::from_raw(replay.position))
                .await
            {
                error!(
                    stream = %self.stream_uuid,
                    name = %self.key.1,
                    position = replay.position,
                    %error,
                    "failed to clear parked event"
                );
            }
            return;
        }

        let advanced = self.window.ack(token);
        self.note_advance(advanced, 1).await;
    }

    async fn handle_nack(&mut self, token: u64, action: NackAction) -> Option<Next> {
        if let Some(replay) = self.replaying.get(&token).cloned() {
            return self.handle_replay_nack(token, replay, action).await;
        }

        match action {
            NackAction::Skip => {
                if let Some((_, advanced)) = self.window.settle(token) {
                    self.note_advance(advanced, 1).await;
                }
                None
            }
            NackAction::Park => {
                self.park_token(token, "parked by consumer").await;
                None
            }
            NackAction::Retry => {
                let Some(attempts) = self.window.attempts(token) else {
                    return None; // stale token
                };
                // `attempts` counts deliveries; retries used = attempts - 1.
                if attempts - 1 >= self.options.max_retries {
                    self.park_token(token, "max retries exceeded").await;
                    return None;
                }
                let new_token = self.mint_token();
                if let Some(event) = self.window.begin_retry(token, new_token) {
                    let sent = self
                        .events_tx
                        .send(Delivery {
                            token: DeliveryToken::from_raw(new_token),
                            event,
                        })
                        .await
                        .is_ok();
                    if !sent {
                        return Some(Next::Stop);
                    }
                }
                None
            }
        }
    }

    /// Parks the delivery behind `token` and advances the window past it.
    async fn park_token(&mut self, token: u64, reason: &str) {
        let Some((position, advanced)) = self.window.settle(token) else {
            return;
        };
        warn!(
            stream = %self.stream_uuid,
            name = %self.key.1,
            position,
            reason,
            "delivery parked"
        );
        if let Err(error) = self
            .storage
            .park(self.subscription_id, Position::from_raw(position), Some(reason))
            .await
        {
            error!(
                stream = %self.stream_uuid,
                name = %self.key.1,
                position,
                %error,
                "failed to record parked event"
            );
        }
        self.note_advance(advanced, 1).await;
    }

    async fn handle_replay_nack(
        &mut self,
        token: u64,
        replay: ReplayEntry,
        action: NackAction,
    ) -> Option<Next> {
        match action {
            NackAction::Park => {
                // Already parked; just stop replaying it.
                self.replaying.remove(&token);
                None
            }
            NackAction::Skip => {
                self.replaying.remove(&token);
                if let Err(error) = self
                    .storage
                    .unpark(self.subscription_id, Position::from_raw(replay.position))
                    .await
                {
                    error!(position = replay.position, %error, "failed to clear parked event");
                }
                None
            }
            NackAction::Retry => {
                self.replaying.remove(&token);
                if replay.attempts >= self.options.max_retries.max(1) {
                    // Stays parked for another manual replay.
                    return None;
                }
                match self.read_at(replay.position).await {
                    Ok(Some(event)) => {
                        let new_token = self.mint_token();
                        self.replaying.insert(
                            new_token,
                            ReplayEntry {
                                position: replay.position,
                                attempts: replay.attempts + 1,
                            },
                        );
                        let sent = self
                            .events_tx
                            .send(Delivery {
                                token: DeliveryToken::from_raw(new_token),
                                event,
                            })
                            .await
                            .is_ok();
                        if !sent {
                            return Some(Next::Stop);
                        }
                        None
                    }
                    Ok(None) => None, // event gone (hard deleted since parking)
                    Err(_) => None,
                }
            }
        }
    }

    /// Redelivers unacked deliveries older than `ack_timeout`, parking those
    /// out of retry budget.
    async fn redeliver_expired(&mut self) -> Option<Next> {
        let expired = self
            .window
            .expired(Instant::now(), self.options.ack_timeout);
        for token in expired {
            if let Some(next) = self.handle_nack(token, NackAction::Retry).await {
                return Some(next);
            }
        }
        None
    }

    /// Re-delivers every parked position to the consumer.
    async fn replay_parked(&mut self) -> Option<Next> {
        let parked = match self.storage.parked(self.subscription_id).await {
            Ok(parked) => parked,
            Err(error) => {
                error!(
                    stream = %self.stream_uuid,
                    name = %self.key.1,
                    %error,
                    "failed to load parked events"
                );
                return None;
            }
        };

        info!(
            stream = %self.stream_uuid,
            name = %self.key.1,
            count = parked.len(),
            "replaying parked events"
        );
        for row in parked {
            match self.read_at(row.position).await {
                Ok(Some(event)) => {
                    let token = self.mint_token();
                    self.replaying.insert(
                        token,
                        ReplayEntry {
                            position: row.position,
                            attempts: 1,
                        },
                    );
                    let sent = self
                        .events_tx
                        .send(Delivery {
                            token: DeliveryToken::from_raw(token),
                            event,
                        })
                        .await
                        .is_ok();
                    if !sent {
                        return Some(Next::Stop);
                    }
                }
                Ok(None) => {
                    // The event was hard deleted since parking; the parked
                    // row is no longer replayable.
                    let _ = self
                        .storage
                        .unpark(self.subscription_id, Position::from_raw(row.position))
                        .await;
                }
                Err(error) => {
                    warn!(position = row.position, %error, "parked replay read failed");
                }
            }
        }
        None
    }

    /// Reads the event at an exact position in the subscribed stream.
    ///
    /// Used only for replay and retry of positions the subscription has
    /// already delivered, so deleted-state read policy does not apply here:
    /// a missing row simply means the event is gone.
    async fn read_at(&self, position: u64) -> Result<Option<RecordedEvent>> {
        if self.stream_uuid.is_all() {
            self.storage.all_event_at(Position::from_raw(position)).await
        } else {
            let state = self.storage.fetch_stream_state(&self.stream_uuid).await?;
            match state.row {
                Some(row) => {
                    self.storage
                        .stream_event_at(row.stream_id, Position::from_raw(position))
                        .await
                }
                None => Ok(None),
            }
        }
    }

    // =========================================================================
    // Checkpointing and Liveness
    // =========================================================================

    /// Applies a window advance to the durable checkpoint accounting.
    async fn note_advance(&mut self, advanced_to: Option<u64>, acks: u64) {
        self.unpersisted_acks += acks;
        if let Some(position) = advanced_to {
            if position > self.last_seen {
                self.last_seen = position;
                self.dirty = true;
            }
        }
        if self.dirty && self.unpersisted_acks >= self.options.checkpoint_after {
            self.flush_checkpoint().await;
        }
    }

    async fn flush_checkpoint_if_due(&mut self) {
        if self.dirty {
            self.flush_checkpoint().await;
        }
    }

    async fn flush_checkpoint(&mut self) {
        if !self.dirty {
            self.unpersisted_acks = 0;
            return;
        }
        match self
            .storage
            .checkpoint(self.subscription_id, Position::from_raw(self.last_seen))
            .await
        {
            Ok(()) => {
                self.dirty = false;
                self.unpersisted_acks = 0;
            }
            Err(error) => {
                // Keep the dirty flag: the next flush retries. Checkpoints
                // are idempotent and monotonic, so retrying is always safe.
                error!(
                    stream = %self.stream_uuid,
                    name = %self.key.1,
                    last_seen = self.last_seen,
                    %error,
                    "checkpoint write failed"
                );
            }
        }
    }

    async fn persist_state(&self, state: SubscriptionState) {
        if let Err(error) = self
            .storage
            .set_subscription_state(self.subscription_id, state)
            .await
        {
            warn!(
                stream = %self.stream_uuid,
                name = %self.key.1,
                %state,
                %error,
                "failed to persist subscription state"
            );
        }
    }

    fn heartbeat_expired(&self) -> bool {
        let expired = self.last_heartbeat.elapsed() >= self.options.consumer_timeout;
        if expired {
            warn!(
                stream = %self.stream_uuid,
                name = %self.key.1,
                "consumer missed heartbeats, disconnecting"
            );
        }
        expired
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventId, GlobalSequence, StreamVersion};
    use chrono::Utc;

    fn event(position: u64, stream: &str) -> RecordedEvent {
        RecordedEvent {
            event_id: EventId::generate(),
            event_number: StreamVersion::from_raw(position),
            stream_uuid: StreamUuid::new(stream),
            event_type: "Test".to_string(),
            data: b"{}".to_vec(),
            metadata: None,
            causation_id: None,
            correlation_id: None,
            created_at: Utc::now(),
            global_sequence: GlobalSequence::from_raw(position),
            position: Position::from_raw(position),
        }
    }

    #[test]
    fn window_enforces_capacity() {
        let mut window = InFlightWindow::new(2);
        assert_eq!(window.capacity(), 2);
        window.insert(1, event(1, "s"));
        window.insert(2, event(2, "s"));
        assert_eq!(window.capacity(), 0);

        window.ack(1);
        assert_eq!(window.capacity(), 1);
    }

    #[test]
    fn in_order_acks_advance_contiguously() {
        let mut window = InFlightWindow::new(10);
        window.insert(1, event(1, "s"));
        window.insert(2, event(2, "s"));
        window.insert(3, event(3, "s"));

        assert_eq!(window.ack(1), Some(1));
        assert_eq!(window.ack(2), Some(2));
        assert_eq!(window.ack(3), Some(3));
        assert!(window.is_empty());
    }

    #[test]
    fn out_of_order_acks_are_buffered() {
        let mut window = InFlightWindow::new(10);
        window.insert(1, event(1, "s"));
        window.insert(2, event(2, "s"));
        window.insert(3, event(3, "s"));

        // Acking 3 then 2 must not advance past the unacked 1.
        assert_eq!(window.ack(3), None);
        assert_eq!(window.ack(2), None);
        // Acking 1 releases the whole contiguous prefix.
        assert_eq!(window.ack(1), Some(3));
        assert!(window.is_empty());
    }

    #[test]
    fn stale_tokens_are_ignored() {
        let mut window = InFlightWindow::new(10);
        window.insert(1, event(1, "s"));
        assert_eq!(window.ack(99), None);
        assert_eq!(window.ack(1), Some(1));
        // Double-ack of a settled token is a no-op.
        assert_eq!(window.ack(1), None);
    }

    #[test]
    fn positions_with_gaps_still_advance() {
        // $all positions have gaps after hard deletes; contiguity is over
        // the delivered set, not the integers.
        let mut window = InFlightWindow::new(10);
        window.insert(1, event(10, "s"));
        window.insert(2, event(17, "s"));
        assert_eq!(window.ack(1), Some(10));
        assert_eq!(window.ack(2), Some(17));
    }

    #[test]
    fn settle_advances_like_ack() {
        let mut window = InFlightWindow::new(10);
        window.insert(1, event(1, "s"));
        window.insert(2, event(2, "s"));

        let (position, advanced) = window.settle(1).unwrap();
        assert_eq!(position, 1);
        assert_eq!(advanced, Some(1));
        assert_eq!(window.ack(2), Some(2));
    }

    #[test]
    fn retry_bumps_attempts_and_swaps_tokens() {
        let mut window = InFlightWindow::new(10);
        window.insert(1, event(1, "s"));
        assert_eq!(window.attempts(1), Some(1));

        let retried = window.begin_retry(1, 2).unwrap();
        assert_eq!(retried.position.as_raw(), 1);
        assert_eq!(window.attempts(2), Some(2));
        // The superseded token no longer resolves.
        assert_eq!(window.attempts(1), None);
        assert_eq!(window.ack(1), None);
        assert_eq!(window.ack(2), Some(1));
    }

    #[test]
    fn expired_reports_only_unacked_entries() {
        let mut window = InFlightWindow::new(10);
        window.insert(1, event(1, "s"));
        window.insert(2, event(2, "s"));
        window.ack(2); // buffered ack; entry 2 is settled but retained

        let later = Instant::now() + Duration::from_secs(60);
        let expired = window.expired(later, Duration::from_secs(30));
        assert_eq!(expired, vec![1]);
    }

    #[test]
    fn drop_stream_settles_a_hard_deleted_streams_deliveries() {
        let mut window = InFlightWindow::new(10);
        window.insert(1, event(5, "doomed"));
        window.insert(2, event(6, "survivor"));
        window.insert(3, event(7, "doomed"));

        // Only the contiguous prefix (position 5) advances; 7 is settled but
        // blocked behind the still-unacked 6.
        assert_eq!(window.drop_stream("doomed"), Some(5));
        assert_eq!(window.ack(2), Some(7));
        assert!(window.is_empty());
    }

    #[test]
    fn registry_grants_first_consumer_and_queues_the_rest() {
        let registry = SubscriptionRegistry::new();
        let key = ("s".to_string(), "sub".to_string());

        let first = registry.next_consumer_id();
        let second = registry.next_consumer_id();

        assert!(registry.acquire(&key, first).unwrap().is_none());
        let mut waiting = registry.acquire(&key, second).unwrap().unwrap();
        assert!(waiting.try_recv().is_err());

        // Releasing the active consumer promotes the pending one FIFO.
        registry.release(&key, first);
        assert!(waiting.try_recv().is_ok());
    }

    #[test]
    fn registry_skips_abandoned_pending_consumers() {
        let registry = SubscriptionRegistry::new();
        let key = ("s".to_string(), "sub".to_string());

        let a = registry.next_consumer_id();
        let b = registry.next_consumer_id();
        let c = registry.next_consumer_id();

        assert!(registry.acquire(&key, a).unwrap().is_none());
        let waiting_b = registry.acquire(&key, b).unwrap().unwrap();
        let mut waiting_c = registry.acquire(&key, c).unwrap().unwrap();

        // b gives up before promotion.
        drop(waiting_b);
        registry.release(&key, b);

        registry.release(&key, a);
        assert!(waiting_c.try_recv().is_ok());
    }

    #[test]
    fn registry_bounds_the_pending_queue() {
        let registry = SubscriptionRegistry::new();
        let key = ("s".to_string(), "sub".to_string());

        let active = registry.next_consumer_id();
        assert!(registry.acquire(&key, active).unwrap().is_none());

        let mut receivers = Vec::new();
        for _ in 0..MAX_PENDING_CONSUMERS {
            let id = registry.next_consumer_id();
            receivers.push(registry.acquire(&key, id).unwrap().unwrap());
        }

        let overflow = registry.next_consumer_id();
        assert!(matches!(
            registry.acquire(&key, overflow),
            Err(Error::SubscriptionConflict { .. })
        ));
    }
}
