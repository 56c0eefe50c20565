//! Coalescing lookup batcher.
//!
//! Turns many concurrent, possibly duplicate per-key lookups into as few
//! batch calls as possible. Keys queued within one debounce window share a
//! single network call, in-flight keys are never requested twice, and
//! successful results are memoized for the lifetime of the batcher.
//!
//! Every [`PendingLookup`] handed out resolves. When a batch fails its keys
//! resolve to the source's fallback payload instead.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::config::{BatchingConfig, ENDPOINT_MAX_BATCH_SIZE};
use crate::error::LookupError;
use crate::key::LookupKey;
use crate::protocol::LookupStatus;
use crate::scheduler::Scheduler;
use crate::source::BatchSource;

/// Tunables for one [`Batcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatcherOptions {
    /// Debounce window between the first queued key and the flush.
    pub flush_delay: Duration,
    /// Chunk size used by [`Batcher::prefetch_missing`].
    pub prefetch_chunk_size: usize,
    /// Upper bound on keys per network call.
    pub max_batch_size: usize,
    /// How long a failed key serves its fallback without retrying.
    /// `Duration::ZERO` retries on the next lookup.
    pub failure_ttl: Duration,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self::from(&BatchingConfig::default())
    }
}

impl From<&BatchingConfig> for BatcherOptions {
    fn from(config: &BatchingConfig) -> Self {
        let max_batch_size = config.max_batch_size.max(1);
        Self {
            flush_delay: config.flush_delay(),
            prefetch_chunk_size: config.prefetch_chunk_size.clamp(1, max_batch_size),
            max_batch_size,
            failure_ttl: config.failure_ttl(),
        }
    }
}

type Resolver<P> = oneshot::Sender<Arc<P>>;

/// Callers waiting on one normalized key, plus the raw form sent upstream.
struct Waiters<P> {
    raw_key: String,
    resolvers: Vec<Resolver<P>>,
}

struct FailedEntry<P> {
    payload: Arc<P>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOrigin {
    Flush,
    Prefetch,
}

impl BatchOrigin {
    fn label(self) -> &'static str {
        match self {
            Self::Flush => "flush",
            Self::Prefetch => "prefetch",
        }
    }
}

struct BatcherState<P> {
    cache: HashMap<String, Arc<P>>,
    failed: HashMap<String, FailedEntry<P>>,
    pending: HashMap<String, Waiters<P>>,
    pending_order: Vec<String>,
    in_flight: HashMap<String, Waiters<P>>,
    flush_timer: Option<u64>,
    next_timer_id: u64,
}

impl<P> BatcherState<P> {
    fn new() -> Self {
        Self {
            cache: HashMap::new(),
            failed: HashMap::new(),
            pending: HashMap::new(),
            pending_order: Vec::new(),
            in_flight: HashMap::new(),
            flush_timer: None,
            next_timer_id: 0,
        }
    }

    /// Negative-cached fallback for `normalized`, dropping it once expired.
    fn unexpired_failure(&mut self, normalized: &str, now: Instant) -> Option<Arc<P>> {
        let entry = self.failed.get(normalized)?;
        if entry.expires_at > now {
            return Some(Arc::clone(&entry.payload));
        }
        self.failed.remove(normalized);
        None
    }

    fn prune_expired_failures(&mut self, now: Instant) {
        self.failed.retain(|_, entry| entry.expires_at > now);
    }

    fn is_known(&mut self, normalized: &str, now: Instant) -> bool {
        self.cache.contains_key(normalized)
            || self.pending.contains_key(normalized)
            || self.in_flight.contains_key(normalized)
            || self.unexpired_failure(normalized, now).is_some()
    }

    fn take_pending(&mut self) -> Vec<LookupKey> {
        let order = std::mem::take(&mut self.pending_order);
        let mut keys = Vec::with_capacity(order.len());
        for normalized in order {
            let Some(waiters) = self.pending.remove(&normalized) else {
                continue;
            };
            keys.push(LookupKey {
                raw: waiters.raw_key.clone(),
                normalized: normalized.clone(),
            });
            self.in_flight.insert(normalized, waiters);
        }
        keys
    }
}

struct Shared<S: BatchSource> {
    source: S,
    scheduler: Arc<dyn Scheduler>,
    options: BatcherOptions,
    state: Mutex<BatcherState<S::Payload>>,
}

/// Debounced, deduplicating, memoizing front end over a [`BatchSource`].
///
/// Cloning is cheap and yields a handle to the same cache and queue.
pub struct Batcher<S: BatchSource> {
    shared: Arc<Shared<S>>,
}

impl<S: BatchSource> Clone for Batcher<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: BatchSource> Batcher<S> {
    pub fn new(source: S, scheduler: Arc<dyn Scheduler>, options: BatcherOptions) -> Self {
        let max_batch_size = options.max_batch_size.clamp(1, ENDPOINT_MAX_BATCH_SIZE);
        let options = BatcherOptions {
            max_batch_size,
            prefetch_chunk_size: options.prefetch_chunk_size.clamp(1, max_batch_size),
            ..options
        };
        Self {
            shared: Arc::new(Shared {
                source,
                scheduler,
                options,
                state: Mutex::new(BatcherState::new()),
            }),
        }
    }

    /// Effective options after clamping.
    pub fn options(&self) -> BatcherOptions {
        self.shared.options
    }

    pub fn source(&self) -> &S {
        &self.shared.source
    }

    /// Requests the payload for `raw_key`.
    ///
    /// Resolves immediately on a cache hit or an empty key. Otherwise the key
    /// joins the pending queue (or the in-flight request already carrying an
    /// equivalent key) and resolves once that batch completes.
    pub fn queue(&self, raw_key: &str) -> PendingLookup<S::Payload> {
        let key = LookupKey::new(raw_key);
        if key.is_empty() {
            return PendingLookup::ready(Arc::new(
                self.shared.source.fallback("", LookupStatus::Empty),
            ));
        }

        let (resolver, receiver) = oneshot::channel();
        let armed_timer = {
            let mut state = self.shared.lock_state();
            if let Some(cached) = state.cache.get(&key.normalized) {
                return PendingLookup::ready(Arc::clone(cached));
            }
            if let Some(failed) = state.unexpired_failure(&key.normalized, Instant::now()) {
                return PendingLookup::ready(failed);
            }

            if let Some(waiters) = state.pending.get_mut(&key.normalized) {
                waiters.resolvers.push(resolver);
            } else if let Some(waiters) = state.in_flight.get_mut(&key.normalized) {
                debug!("Batch: joining in-flight request for {}", waiters.raw_key);
                waiters.resolvers.push(resolver);
            } else {
                state.pending_order.push(key.normalized.clone());
                state.pending.insert(
                    key.normalized.clone(),
                    Waiters {
                        raw_key: key.raw.clone(),
                        resolvers: vec![resolver],
                    },
                );
            }

            if state.flush_timer.is_none() && !state.pending.is_empty() {
                let timer_id = state.next_timer_id;
                state.next_timer_id = state.next_timer_id.wrapping_add(1);
                state.flush_timer = Some(timer_id);
                Some(timer_id)
            } else {
                None
            }
        };

        if let Some(timer_id) = armed_timer {
            let timer = FlushTimerTask {
                shared: Arc::clone(&self.shared),
                timer_id,
                fired: false,
            };
            self.shared.scheduler.schedule(
                self.shared.options.flush_delay,
                Box::new(move || timer.fire()),
            );
        }

        let fallback = Arc::new(self.shared.source.fallback(&key.raw, LookupStatus::Error));
        PendingLookup::waiting(receiver, fallback)
    }

    /// Warms the cache for `raw_keys` without waiting on the results.
    ///
    /// Keys are deduplicated by normalized form; keys already cached, queued,
    /// in flight, or negative-cached are skipped. The rest go out immediately
    /// as independent batches of at most `chunk_size` keys, bypassing the
    /// debounce window.
    pub fn prefetch_many<I, K>(&self, raw_keys: I, chunk_size: usize)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let chunk_size = chunk_size.clamp(1, self.shared.options.max_batch_size);
        let mut seen = HashSet::new();
        let missing = {
            let mut state = self.shared.lock_state();
            let now = Instant::now();
            state.prune_expired_failures(now);
            let mut missing = Vec::new();
            for raw_key in raw_keys {
                let key = LookupKey::new(raw_key.as_ref());
                if key.is_empty() || !seen.insert(key.normalized.clone()) {
                    continue;
                }
                if state.is_known(&key.normalized, now) {
                    continue;
                }
                state.in_flight.insert(
                    key.normalized.clone(),
                    Waiters {
                        raw_key: key.raw.clone(),
                        resolvers: Vec::new(),
                    },
                );
                missing.push(key);
            }
            missing
        };
        if missing.is_empty() {
            return;
        }

        info!(
            "Batch[{}]: prefetching {} keys in chunks of {}",
            self.shared.source.label(),
            missing.len(),
            chunk_size
        );
        for chunk in missing.chunks(chunk_size) {
            let task = PrefetchTask {
                shared: Arc::clone(&self.shared),
                keys: chunk.to_vec(),
                ran: false,
            };
            self.shared.scheduler.spawn(Box::new(move || task.run()));
        }
    }

    /// [`Batcher::prefetch_many`] with the configured prefetch chunk size.
    pub fn prefetch_missing<I, K>(&self, raw_keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        self.prefetch_many(raw_keys, self.shared.options.prefetch_chunk_size);
    }

    /// Flushes the pending queue on the calling thread, disarming the timer.
    ///
    /// Blocks for the duration of the network call.
    pub fn flush_now(&self) {
        self.shared.lock_state().flush_timer = None;
        self.shared.flush_pending();
    }

    /// Cached payload for `raw_key`, if a batch has resolved it successfully.
    pub fn cached(&self, raw_key: &str) -> Option<Arc<S::Payload>> {
        let key = LookupKey::new(raw_key);
        self.shared.lock_state().cache.get(&key.normalized).cloned()
    }

    /// Stores `payload` for `raw_key` unless a payload is already cached.
    /// Returns `true` when the payload was stored.
    pub fn seed_cache(&self, raw_key: &str, payload: S::Payload) -> bool {
        let key = LookupKey::new(raw_key);
        if key.is_empty() {
            return false;
        }
        let mut state = self.shared.lock_state();
        if state.cache.contains_key(&key.normalized) {
            return false;
        }
        state.failed.remove(&key.normalized);
        state.cache.insert(key.normalized, Arc::new(payload));
        true
    }

    pub fn cache_len(&self) -> usize {
        self.shared.lock_state().cache.len()
    }

    /// Number of distinct keys waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.shared.lock_state().pending.len()
    }

    /// Number of distinct keys currently carried by a network call.
    pub fn in_flight_len(&self) -> usize {
        self.shared.lock_state().in_flight.len()
    }

    pub fn flush_armed(&self) -> bool {
        self.shared.lock_state().flush_timer.is_some()
    }
}

impl<S: BatchSource> Shared<S> {
    fn lock_state(&self) -> MutexGuard<'_, BatcherState<S::Payload>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_flush_timer(&self, timer_id: u64) {
        {
            let mut state = self.lock_state();
            if state.flush_timer != Some(timer_id) {
                debug!("Batch: ignoring stale flush timer {}", timer_id);
                return;
            }
            state.flush_timer = None;
        }
        self.flush_pending();
    }

    fn flush_pending(&self) {
        let keys = self.lock_state().take_pending();
        if keys.is_empty() {
            return;
        }
        debug!(
            "Batch[{}]: flushing {} queued keys",
            self.source.label(),
            keys.len()
        );
        for chunk in keys.chunks(self.options.max_batch_size) {
            self.run_batch(chunk, BatchOrigin::Flush);
        }
    }

    fn fetch(&self, raw_keys: &[String]) -> Result<HashMap<String, S::Payload>, LookupError> {
        match catch_unwind(AssertUnwindSafe(|| self.source.fetch_batch(raw_keys))) {
            Ok(result) => result,
            Err(panic) => Err(LookupError::Panicked(panic_payload_to_string(panic.as_ref()))),
        }
    }

    /// Issues one network call for `keys` and settles every waiter attached
    /// to them. Each key must already be registered as in flight.
    fn run_batch(&self, keys: &[LookupKey], origin: BatchOrigin) {
        let raw_keys: Vec<String> = keys.iter().map(|key| key.raw.clone()).collect();
        let result = self.fetch(&raw_keys);

        let mut deliveries = Vec::with_capacity(keys.len());
        {
            let mut state = self.lock_state();
            state.prune_expired_failures(Instant::now());
            match result {
                Ok(mut found) => {
                    for key in keys {
                        let payload = match found.remove(&key.raw) {
                            Some(payload) => Arc::new(payload),
                            None => Arc::new(self.source.fallback(&key.raw, LookupStatus::NotFound)),
                        };
                        let stored = Arc::clone(
                            state
                                .cache
                                .entry(key.normalized.clone())
                                .or_insert(payload),
                        );
                        state.failed.remove(&key.normalized);
                        if let Some(waiters) = state.in_flight.remove(&key.normalized) {
                            deliveries.push((waiters.resolvers, stored));
                        }
                    }
                }
                Err(error) => {
                    warn!(
                        "Batch[{}]: {} request for {} keys failed: {}",
                        self.source.label(),
                        origin.label(),
                        keys.len(),
                        error
                    );
                    let expires_at = Instant::now() + self.options.failure_ttl;
                    for key in keys {
                        let Some(waiters) = state.in_flight.remove(&key.normalized) else {
                            continue;
                        };
                        let payload =
                            Arc::new(self.source.fallback(&waiters.raw_key, LookupStatus::Error));
                        if !self.options.failure_ttl.is_zero()
                            && !state.cache.contains_key(&key.normalized)
                        {
                            state.failed.insert(
                                key.normalized.clone(),
                                FailedEntry {
                                    payload: Arc::clone(&payload),
                                    expires_at,
                                },
                            );
                        }
                        deliveries.push((waiters.resolvers, payload));
                    }
                }
            }
        }

        for (resolvers, payload) in deliveries {
            for resolver in resolvers {
                let _ = resolver.send(Arc::clone(&payload));
            }
        }
    }

    /// Settles a dropped flush timer: its queued keys resolve to fallbacks
    /// and a later `queue` call may arm a new timer.
    fn abandon_flush_timer(&self, timer_id: u64) {
        let waiters = {
            let mut state = self.lock_state();
            if state.flush_timer != Some(timer_id) {
                return;
            }
            state.flush_timer = None;
            let order = std::mem::take(&mut state.pending_order);
            let waiters: Vec<_> = order
                .into_iter()
                .filter_map(|normalized| state.pending.remove(&normalized))
                .collect();
            waiters
        };
        if !waiters.is_empty() {
            warn!(
                "Batch[{}]: flush timer dropped before firing, settling {} keys with fallbacks",
                self.source.label(),
                waiters.len()
            );
        }
        self.settle_with_fallbacks(waiters);
    }

    /// Settles in-flight keys of a prefetch chunk that was dropped unrun.
    fn abandon_in_flight(&self, keys: &[LookupKey]) {
        let waiters = {
            let mut state = self.lock_state();
            let waiters: Vec<_> = keys
                .iter()
                .filter_map(|key| state.in_flight.remove(&key.normalized))
                .collect();
            waiters
        };
        if !waiters.is_empty() {
            warn!(
                "Batch[{}]: prefetch task dropped before running, releasing {} keys",
                self.source.label(),
                waiters.len()
            );
        }
        self.settle_with_fallbacks(waiters);
    }

    fn settle_with_fallbacks(&self, waiters: Vec<Waiters<S::Payload>>) {
        for entry in waiters {
            let payload = Arc::new(self.source.fallback(&entry.raw_key, LookupStatus::Error));
            for resolver in entry.resolvers {
                let _ = resolver.send(Arc::clone(&payload));
            }
        }
    }
}

/// Armed debounce timer. Dropping it unfired settles its keys instead of
/// leaving them queued.
struct FlushTimerTask<S: BatchSource> {
    shared: Arc<Shared<S>>,
    timer_id: u64,
    fired: bool,
}

impl<S: BatchSource> FlushTimerTask<S> {
    fn fire(mut self) {
        self.fired = true;
        self.shared.on_flush_timer(self.timer_id);
    }
}

impl<S: BatchSource> Drop for FlushTimerTask<S> {
    fn drop(&mut self) {
        if !self.fired {
            self.shared.abandon_flush_timer(self.timer_id);
        }
    }
}

/// One prefetch chunk. Dropping it unrun releases its in-flight keys.
struct PrefetchTask<S: BatchSource> {
    shared: Arc<Shared<S>>,
    keys: Vec<LookupKey>,
    ran: bool,
}

impl<S: BatchSource> PrefetchTask<S> {
    fn run(mut self) {
        self.ran = true;
        self.shared.run_batch(&self.keys, BatchOrigin::Prefetch);
    }
}

impl<S: BatchSource> Drop for PrefetchTask<S> {
    fn drop(&mut self) {
        if !self.ran {
            self.shared.abandon_in_flight(&self.keys);
        }
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}

enum LookupState<P> {
    Ready(Arc<P>),
    Waiting {
        receiver: oneshot::Receiver<Arc<P>>,
        fallback: Arc<P>,
    },
}

/// Result handle returned by [`Batcher::queue`].
///
/// Await it from async code or call [`PendingLookup::blocking_wait`] from a
/// plain thread. It always yields a payload: if the batch task is dropped
/// before settling, the caller gets the fallback.
pub struct PendingLookup<P> {
    state: LookupState<P>,
}

impl<P> PendingLookup<P> {
    fn ready(payload: Arc<P>) -> Self {
        Self {
            state: LookupState::Ready(payload),
        }
    }

    fn waiting(receiver: oneshot::Receiver<Arc<P>>, fallback: Arc<P>) -> Self {
        Self {
            state: LookupState::Waiting { receiver, fallback },
        }
    }

    /// Returns the payload if it is already available, without blocking.
    pub fn try_take(&mut self) -> Option<Arc<P>> {
        let settled = match &mut self.state {
            LookupState::Ready(payload) => return Some(Arc::clone(payload)),
            LookupState::Waiting { receiver, fallback } => match receiver.try_recv() {
                Ok(payload) => payload,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => Arc::clone(fallback),
            },
        };
        self.state = LookupState::Ready(Arc::clone(&settled));
        Some(settled)
    }

    /// Blocks the current thread until the payload is available.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_wait(self) -> Arc<P> {
        match self.state {
            LookupState::Ready(payload) => payload,
            LookupState::Waiting { receiver, fallback } => {
                receiver.blocking_recv().unwrap_or(fallback)
            }
        }
    }
}

impl<P> Future for PendingLookup<P> {
    type Output = Arc<P>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            LookupState::Ready(payload) => Poll::Ready(Arc::clone(payload)),
            LookupState::Waiting { receiver, fallback } => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(payload)) => Poll::Ready(payload),
                Poll::Ready(Err(_)) => Poll::Ready(Arc::clone(fallback)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
