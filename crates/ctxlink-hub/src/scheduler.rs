use crate::server::ConnectionServer;
use ctxlink_core::config::BridgeConfig;
use ctxlink_core::protocol::METHOD_AT_MENTIONED;
use ctxlink_core::Mention;
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

/// Where flushed mentions go. Implemented by the connection server.
pub trait MentionSink: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    fn broadcast(&self, method: &str, params: Value) -> bool;
}

impl MentionSink for ConnectionServer {
    fn is_connected(&self) -> bool {
        ConnectionServer::is_connected(self)
    }

    fn broadcast(&self, method: &str, params: Value) -> bool {
        ConnectionServer::broadcast(self, method, params)
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub debounce_window: Duration,
    pub send_pacing: Duration,
    pub connection_wait_delay: Duration,
    pub connection_timeout: Duration,
    pub queue_timeout: Duration,
    pub post_connect_poll: Duration,
}

impl From<&BridgeConfig> for SchedulerConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            debounce_window: config.debounce_window,
            send_pacing: config.send_pacing,
            connection_wait_delay: config.connection_wait_delay,
            connection_timeout: config.connection_timeout,
            queue_timeout: config.queue_timeout,
            post_connect_poll: config.post_connect_poll,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueuedMention {
    pub mention: Mention,
    pub enqueued_at: Instant,
}

/// Which timers are currently armed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArmedTimers {
    pub debounce: bool,
    pub connection_wait: bool,
    pub post_connect: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub flushes: u64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub timed_out: u64,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    timed_out: AtomicU64,
}

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl TimerSlot {
    fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    fn next_generation(&mut self) -> u64 {
        self.cancel();
        self.generation += 1;
        self.generation
    }

    fn set(&mut self, handle: JoinHandle<()>) {
        self.handle = Some(handle);
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Claimed by the firing timer itself; stale generations lose.
    fn claim(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<QueuedMention>,
    debounce: TimerSlot,
    connection_wait: TimerSlot,
    post_connect: TimerSlot,
    epoch: u64,
    // Dispatched to the sender task but not yet sent, expired or failed.
    in_flight: usize,
}

struct Batch {
    epoch: u64,
    items: Vec<QueuedMention>,
    initial_delay: Duration,
}

type DropNotifier = Box<dyn Fn(usize) + Send + Sync>;

struct Inner {
    config: SchedulerConfig,
    sink: Arc<dyn MentionSink>,
    state: Mutex<SchedulerState>,
    batches: mpsc::UnboundedSender<Batch>,
    counters: Counters,
    on_dropped: Mutex<Option<DropNotifier>>,
}

/// Queues mentions while no agent is ready and delivers them in order once one is.
pub struct MentionScheduler {
    inner: Arc<Inner>,
    sender_task: JoinHandle<()>,
}

impl MentionScheduler {
    /// Must be called inside a tokio runtime.
    pub fn new(config: SchedulerConfig, sink: Arc<dyn MentionSink>) -> Self {
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            sink,
            state: Mutex::new(SchedulerState::default()),
            batches: batches_tx,
            counters: Counters::default(),
            on_dropped: Mutex::new(None),
        });
        let sender_task = tokio::spawn(run_sender(inner.clone(), batches_rx));
        Self { inner, sender_task }
    }

    /// Called with the number of mentions discarded when no agent connected in time.
    pub fn with_drop_notifier<F>(self, notifier: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_dropped
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(notifier));
        self
    }

    pub fn enqueue(&self, mention: Mention) {
        self.inner.enqueue(mention);
    }

    /// Deliver everything queued. `is_post_connect` waits for a ready agent
    /// and then the settle delay before the first send.
    pub fn flush(&self, is_post_connect: bool) {
        self.inner.flush(is_post_connect);
    }

    /// A connection appeared; start the post-connect path if anything is waiting.
    pub fn on_client_connected(&self) {
        if self.pending() > 0 {
            self.inner.flush(true);
        }
    }

    /// Drop the queue and cancel every timer and in-flight send.
    pub fn reset(&self) {
        self.inner.reset();
    }

    pub fn pending(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Queued plus dispatched-but-unsent mentions. Anything sent while this
    /// is non-zero must go through the queue to keep FIFO order.
    pub fn backlog(&self) -> usize {
        let state = self.inner.state();
        state.queue.len() + state.in_flight
    }

    pub fn timers(&self) -> ArmedTimers {
        let state = self.inner.state();
        ArmedTimers {
            debounce: state.debounce.is_armed(),
            connection_wait: state.connection_wait.is_armed(),
            post_connect: state.post_connect.is_armed(),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.inner.counters;
        SchedulerStats {
            flushes: counters.flushes.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            expired: counters.expired.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MentionScheduler {
    fn drop(&mut self) {
        self.inner.reset();
        self.sender_task.abort();
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(self: &Arc<Self>, mention: Mention) {
        let mut state = self.state();
        debug!(
            event = "mention_enqueued",
            file_path = mention.file_path(),
            pending = state.queue.len() + 1
        );
        state.queue.push_back(QueuedMention {
            mention,
            enqueued_at: Instant::now(),
        });
        let connected = self.sink.is_connected();
        if connected && state.post_connect.is_armed() {
            // The post-connect dispatch takes the whole queue.
            return;
        }
        if connected {
            state.connection_wait.cancel();
            self.arm_debounce(&mut state);
        } else {
            state.debounce.cancel();
            self.ensure_connection_wait(&mut state);
        }
    }

    fn arm_debounce(self: &Arc<Self>, state: &mut SchedulerState) {
        let generation = state.debounce.next_generation();
        let inner = self.clone();
        let window = self.config.debounce_window;
        state.debounce.set(tokio::spawn(async move {
            sleep(window).await;
            inner.on_debounce_fire(generation);
        }));
    }

    /// Armed once per waiting period; later enqueues do not extend it.
    fn ensure_connection_wait(self: &Arc<Self>, state: &mut SchedulerState) {
        if state.connection_wait.is_armed() || state.queue.is_empty() {
            return;
        }
        let generation = state.connection_wait.next_generation();
        let inner = self.clone();
        let timeout = self.config.connection_timeout;
        state.connection_wait.set(tokio::spawn(async move {
            sleep(timeout).await;
            inner.on_connection_wait_timeout(generation);
        }));
    }

    fn arm_post_connect(self: &Arc<Self>, state: &mut SchedulerState) {
        let generation = state.post_connect.next_generation();
        let inner = self.clone();
        let poll = self.config.post_connect_poll;
        let deadline = Instant::now() + self.config.connection_timeout;
        state.post_connect.set(tokio::spawn(async move {
            let connected = loop {
                if inner.sink.is_connected() {
                    break true;
                }
                if Instant::now() >= deadline {
                    break false;
                }
                sleep(poll).await;
            };
            inner.on_post_connect_poll_done(generation, connected);
        }));
    }

    fn on_debounce_fire(self: &Arc<Self>, generation: u64) {
        if !self.state().debounce.claim(generation) {
            return;
        }
        self.flush(false);
    }

    fn on_post_connect_poll_done(self: &Arc<Self>, generation: u64, connected: bool) {
        if !self.state().post_connect.claim(generation) {
            return;
        }
        if connected {
            self.dispatch(true);
        } else {
            warn!(event = "post_connect_gave_up", pending = self.state().queue.len());
        }
    }

    fn on_connection_wait_timeout(self: &Arc<Self>, generation: u64) {
        let mut state = self.state();
        if !state.connection_wait.claim(generation) || state.queue.is_empty() {
            return;
        }
        if self.sink.is_connected() {
            drop(state);
            self.dispatch(false);
            return;
        }

        let dropped = state.queue.len();
        state.queue.clear();
        state.debounce.cancel();
        state.post_connect.cancel();
        drop(state);

        self.counters
            .timed_out
            .fetch_add(dropped as u64, Ordering::Relaxed);
        error!(
            event = "mention_queue_timeout",
            dropped = dropped,
            timeout_ms = self.config.connection_timeout.as_millis() as u64
        );
        if let Some(notify) = self
            .on_dropped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            notify(dropped);
        }
    }

    fn flush(self: &Arc<Self>, is_post_connect: bool) {
        if is_post_connect {
            let mut state = self.state();
            if state.queue.is_empty() {
                return;
            }
            self.arm_post_connect(&mut state);
            return;
        }
        if !self.sink.is_connected() {
            debug!(event = "flush_skipped_disconnected");
            let mut state = self.state();
            self.ensure_connection_wait(&mut state);
            return;
        }
        self.dispatch(false);
    }

    /// Snapshot and clear the queue, cancel timers, and hand the batch to the sender.
    fn dispatch(&self, is_post_connect: bool) {
        let mut state = self.state();
        state.debounce.cancel();
        state.connection_wait.cancel();
        state.post_connect.cancel();
        if state.queue.is_empty() {
            return;
        }
        let items = state.queue.drain(..).collect::<Vec<_>>();
        let epoch = state.epoch;
        state.in_flight += items.len();
        drop(state);

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        info!(
            event = "mention_flush",
            count = items.len(),
            post_connect = is_post_connect
        );
        let initial_delay = if is_post_connect {
            self.config.connection_wait_delay
        } else {
            Duration::ZERO
        };
        if let Err(mpsc::error::SendError(batch)) = self.batches.send(Batch {
            epoch,
            items,
            initial_delay,
        }) {
            warn!(event = "mention_sender_closed", lost = batch.items.len());
            for _ in &batch.items {
                self.settle_one(epoch);
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state();
        state.debounce.cancel();
        state.connection_wait.cancel();
        state.post_connect.cancel();
        let discarded = state.queue.len();
        state.queue.clear();
        state.in_flight = 0;
        state.epoch += 1;
        if discarded > 0 {
            debug!(event = "mention_queue_reset", discarded = discarded);
        }
    }

    fn current_epoch(&self) -> u64 {
        self.state().epoch
    }

    /// One dispatched item is done. Counts from before a reset are ignored.
    fn settle_one(&self, epoch: u64) {
        let mut state = self.state();
        if state.epoch == epoch {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }

    fn send_one(&self, item: &QueuedMention) {
        let file_path = item.mention.file_path();
        let params = match serde_json::to_value(item.mention.to_params()) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "mention_encode_error", file_path = file_path, error = %err);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if self.sink.broadcast(METHOD_AT_MENTIONED, params) {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(event = "mention_sent", file_path = file_path);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(event = "mention_delivery_failed", file_path = file_path);
        }
    }
}

/// Sends batches one at a time so FIFO order holds across consecutive flushes.
async fn run_sender(inner: Arc<Inner>, mut batches: mpsc::UnboundedReceiver<Batch>) {
    while let Some(batch) = batches.recv().await {
        if batch.epoch != inner.current_epoch() {
            continue;
        }
        if !batch.initial_delay.is_zero() {
            sleep(batch.initial_delay).await;
        }

        let mut last_send: Option<Instant> = None;
        for item in batch.items {
            if let Some(at) = last_send {
                sleep_until(at + inner.config.send_pacing).await;
            }
            if batch.epoch != inner.current_epoch() {
                debug!(event = "mention_batch_abandoned");
                break;
            }
            let age = Instant::now().saturating_duration_since(item.enqueued_at);
            if age > inner.config.queue_timeout {
                inner.counters.expired.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event = "mention_expired",
                    file_path = item.mention.file_path(),
                    age_ms = age.as_millis() as u64
                );
                inner.settle_one(batch.epoch);
                continue;
            }
            inner.send_one(&item);
            inner.settle_one(batch.epoch);
            last_send = Some(Instant::now());
        }
    }
}
