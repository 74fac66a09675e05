//! Cached query engine.
//!
//! A mounted query wraps a one-shot fetch closure with stale-while-revalidate
//! caching and keeps its result current from the change bus.
//!
//! # Lifecycle
//!
//! 1. **Mount** reads the persisted [`CacheEntry`] for the query's cache key.
//!    A missing entry, or one older than the staleness window, starts a
//!    foreground fetch (`loading = true`, no data painted). A fresh entry is
//!    served immediately and revalidated by a background fetch.
//! 2. **Bus signals** go through the query's [`CacheStrategy`]. Applied deltas
//!    replace the in-memory data and are written back to the cache; a
//!    `Refetch` outcome starts a silent background fetch.
//! 3. **Fetch failures** set `error` and clear `loading` but keep the last
//!    good data.
//! 4. **Drop** aborts the query task. In-flight fetch results are discarded.
//!
//! # Known hazard
//!
//! Fetch results carry no version. A background fetch that started before a
//! delta and finishes after it replaces the delta-patched data with the
//! older server snapshot. The next signal or staleness check repairs it.

pub mod delta;
pub mod fetch;
pub mod strategy;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bus::{ChangeBus, ChangeReceiver, DataChange};
use crate::cache::{CacheEntry, PersistentCache, read_entry, write_entry};
use crate::clock::Clock;
use crate::config::{DEFAULT_STALE_WINDOW_SECS, TimestampPolicy};
use crate::error::SyncError;

pub use fetch::{collection_fetcher, singleton_fetcher};
pub use strategy::{CacheKind, CacheStrategy, CollectionCache, DeltaOutcome, SingletonCache};

pub type FetchFuture<D> = BoxFuture<'static, Result<D, SyncError>>;

/// One-shot fetch, called with the query's current dependencies.
pub type Fetcher<D> = Arc<dyn Fn(&[String]) -> FetchFuture<D> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub cache_key: String,
    pub dependencies: Vec<String>,
    pub stale_window: Duration,
}

impl QueryOptions {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            dependencies: Vec::new(),
            stale_window: Duration::from_secs(DEFAULT_STALE_WINDOW_SECS),
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    #[must_use]
    pub const fn with_stale_window(mut self, stale_window: Duration) -> Self {
        self.stale_window = stale_window;
        self
    }
}

/// Shared services a query needs, passed in at mount.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub bus: Arc<ChangeBus>,
    pub cache: Arc<dyn PersistentCache>,
    pub clock: Arc<dyn Clock>,
    pub timestamp_policy: TimestampPolicy,
}

/// What a consumer sees of a mounted query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<D> {
    pub data: D,
    pub loading: bool,
    pub error: Option<SyncError>,
}

impl<D> QueryState<D> {
    const fn idle(data: D) -> Self {
        Self {
            data,
            loading: false,
            error: None,
        }
    }

    const fn loading(data: D) -> Self {
        Self {
            data,
            loading: true,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    Foreground,
    Background,
}

#[derive(Debug)]
enum Command {
    Refetch,
    SetDependencies(Vec<String>),
}

struct Completion<D> {
    mode: FetchMode,
    generation: u64,
    result: Result<D, SyncError>,
}

/// State shared by a handle, its task and any controllers.
///
/// `generation` only changes under the state channel's write lock, so a
/// commit checked against it cannot interleave with a reset.
struct Shared<S: CacheStrategy> {
    state: watch::Sender<QueryState<S::Data>>,
    generation: AtomicU64,
    active: AtomicBool,
}

impl<S: CacheStrategy> Shared<S> {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate in-flight fetches without touching visible state.
    fn bump_generation(&self) {
        self.state.send_if_modified(|_| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            false
        });
    }

    fn commit(&self, generation: u64, update: impl FnOnce(&mut QueryState<S::Data>)) -> bool {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            update(state);
            true
        })
    }
}

trait ResetQuery: Send + Sync {
    fn reset(&self);
}

impl<S: CacheStrategy> ResetQuery for Shared<S> {
    fn reset(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.state.send_modify(|state| {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *state = QueryState::idle(S::empty());
        });
    }
}

/// Type-erased reset handle for a mounted query of any strategy.
#[derive(Clone)]
pub struct QueryController {
    cache_key: String,
    target: Weak<dyn ResetQuery>,
}

impl QueryController {
    #[must_use]
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.target.strong_count() > 0
    }

    /// Clear the query to empty. Returns `false` if it is no longer mounted.
    pub fn reset(&self) -> bool {
        self.target.upgrade().is_some_and(|target| {
            target.reset();
            true
        })
    }
}

impl fmt::Debug for QueryController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryController")
            .field("cache_key", &self.cache_key)
            .field("mounted", &self.is_mounted())
            .finish()
    }
}

struct Engine<S: CacheStrategy> {
    shared: Arc<Shared<S>>,
    fetcher: Fetcher<S::Data>,
    ctx: QueryContext,
    cache_key: String,
    dependencies: Vec<String>,
    /// Timestamp of the data last obtained from a fetch (or the cache).
    fetched_at: Option<i64>,
    /// Generation whose data came from a fetch or the cache. Deltas only
    /// patch loaded data.
    loaded: Option<u64>,
    /// Outstanding foreground fetches, counted for one generation.
    foreground: (u64, usize),
    in_flight: FuturesUnordered<BoxFuture<'static, Completion<S::Data>>>,
}

impl<S: CacheStrategy> Engine<S> {
    async fn run(
        mut self,
        mut changes: ChangeReceiver,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut bus_open = true;
        loop {
            tokio::select! {
                change = changes.changed(), if bus_open => match change {
                    Some(change) => self.on_change(&change),
                    None => bus_open = false,
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(done) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_fetched(done);
                }
            }
        }
        tracing::trace!(cache_key = %self.cache_key, "query task finished");
    }

    fn start_fetch(&mut self, mode: FetchMode) {
        let generation = self.shared.generation();
        if mode == FetchMode::Foreground {
            if self.foreground.0 != generation {
                self.foreground = (generation, 0);
            }
            self.foreground.1 += 1;
            self.shared.commit(generation, |state| state.loading = true);
        }

        tracing::debug!(cache_key = %self.cache_key, ?mode, generation, "query fetch started");
        let fetch = (self.fetcher)(&self.dependencies);
        self.in_flight.push(
            async move {
                Completion {
                    mode,
                    generation,
                    result: fetch.await,
                }
            }
            .boxed(),
        );
    }

    fn on_fetched(&mut self, done: Completion<S::Data>) {
        if done.mode == FetchMode::Foreground && self.foreground.0 == done.generation {
            self.foreground.1 = self.foreground.1.saturating_sub(1);
        }
        let loading = self.foreground.0 == done.generation && self.foreground.1 > 0;

        match done.result {
            Ok(data) => {
                let now = self.ctx.clock.now_millis();
                let committed = self.shared.commit(done.generation, |state| {
                    state.data = data.clone();
                    state.loading = loading;
                    state.error = None;
                });
                if !committed {
                    tracing::debug!(
                        cache_key = %self.cache_key,
                        generation = done.generation,
                        "discarding fetch result from a previous generation"
                    );
                    return;
                }
                self.fetched_at = Some(now);
                self.loaded = Some(done.generation);
                write_entry(
                    self.ctx.cache.as_ref(),
                    &self.cache_key,
                    &CacheEntry::new(data, now),
                );
            }
            Err(error) => {
                tracing::warn!(
                    cache_key = %self.cache_key,
                    code = %error.code(),
                    mode = ?done.mode,
                    "query fetch failed, keeping last data: {error}"
                );
                self.shared.commit(done.generation, |state| {
                    state.loading = loading;
                    state.error = Some(error);
                });
            }
        }
    }

    fn on_change(&mut self, change: &DataChange) {
        if !self.shared.active.load(Ordering::SeqCst) {
            tracing::trace!(cache_key = %self.cache_key, seq = change.seq, "query inactive, signal ignored");
            return;
        }

        let generation = self.shared.generation();
        let outcome = S::apply(&self.shared.state.borrow().data, change);
        let outcome = match outcome {
            DeltaOutcome::Applied(_) if self.loaded != Some(generation) => {
                tracing::debug!(
                    cache_key = %self.cache_key,
                    seq = change.seq,
                    "no data loaded yet, refetching instead of patching"
                );
                DeltaOutcome::Refetch
            }
            outcome => outcome,
        };
        match outcome {
            DeltaOutcome::Applied(data) => {
                let now = self.ctx.clock.now_millis();
                let timestamp = match self.ctx.timestamp_policy {
                    TimestampPolicy::RestampOnDelta => now,
                    TimestampPolicy::FetchOnly => self.fetched_at.unwrap_or(now),
                };
                let committed = self
                    .shared
                    .commit(generation, |state| state.data = data.clone());
                if committed {
                    write_entry(
                        self.ctx.cache.as_ref(),
                        &self.cache_key,
                        &CacheEntry::new(data, timestamp),
                    );
                    tracing::debug!(
                        cache_key = %self.cache_key,
                        kind = %change.kind(),
                        seq = change.seq,
                        "delta applied"
                    );
                }
            }
            DeltaOutcome::Ignored => {}
            DeltaOutcome::Refetch => {
                tracing::debug!(
                    cache_key = %self.cache_key,
                    kind = %change.kind(),
                    seq = change.seq,
                    "signal requires refetch"
                );
                self.start_fetch(FetchMode::Background);
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Refetch => {
                self.shared.active.store(true, Ordering::SeqCst);
                self.start_fetch(FetchMode::Foreground);
            }
            Command::SetDependencies(dependencies) => {
                if dependencies == self.dependencies {
                    return;
                }
                tracing::debug!(cache_key = %self.cache_key, ?dependencies, "query dependencies changed");
                self.dependencies = dependencies;
                self.shared.bump_generation();
                self.shared.active.store(true, Ordering::SeqCst);
                self.start_fetch(FetchMode::Foreground);
            }
        }
    }
}

/// A mounted query. Dropping it unmounts the query.
pub struct QueryHandle<S: CacheStrategy> {
    cache_key: String,
    shared: Arc<Shared<S>>,
    state: watch::Receiver<QueryState<S::Data>>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl<S: CacheStrategy> QueryHandle<S> {
    /// Mount a query and start its initial load.
    ///
    /// Must be called from within a tokio runtime. The cache lookup happens
    /// before this returns, so [`state`](Self::state) already tells whether
    /// cached data is being served or a foreground fetch is pending.
    pub fn mount(options: QueryOptions, fetcher: Fetcher<S::Data>, ctx: QueryContext) -> Self {
        let QueryOptions {
            cache_key,
            dependencies,
            stale_window,
        } = options;
        let now = ctx.clock.now_millis();
        let window_millis = i64::try_from(stale_window.as_millis()).unwrap_or(i64::MAX);

        let (initial, mode, fetched_at) =
            match read_entry::<S::Data>(ctx.cache.as_ref(), &cache_key) {
                Some(entry) if !entry.is_stale(now, window_millis) => {
                    tracing::debug!(
                        cache_key = %cache_key,
                        age_ms = entry.age_millis(now),
                        "serving cached data, revalidating in background"
                    );
                    let fetched_at = entry.timestamp;
                    (QueryState::idle(entry.data), FetchMode::Background, Some(fetched_at))
                }
                Some(entry) => {
                    tracing::debug!(
                        cache_key = %cache_key,
                        age_ms = entry.age_millis(now),
                        "cached data is stale"
                    );
                    (QueryState::loading(S::empty()), FetchMode::Foreground, None)
                }
                None => (QueryState::loading(S::empty()), FetchMode::Foreground, None),
            };

        let (state_tx, state_rx) = watch::channel(initial);
        let shared = Arc::new(Shared::<S> {
            state: state_tx,
            generation: AtomicU64::new(0),
            active: AtomicBool::new(true),
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let changes = ctx.bus.subscribe();

        let mut engine = Engine {
            shared: Arc::clone(&shared),
            fetcher,
            ctx,
            cache_key: cache_key.clone(),
            dependencies,
            loaded: fetched_at.map(|_| 0),
            fetched_at,
            foreground: (0, 0),
            in_flight: FuturesUnordered::new(),
        };
        engine.start_fetch(mode);
        let task = tokio::spawn(engine.run(changes, commands_rx));

        Self {
            cache_key,
            shared,
            state: state_rx,
            commands: commands_tx,
            task,
        }
    }

    #[must_use]
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    #[must_use]
    pub const fn kind(&self) -> CacheKind {
        S::KIND
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> QueryState<S::Data> {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn data(&self) -> S::Data {
        self.state.borrow().data.clone()
    }

    /// A receiver notified on every state change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<QueryState<S::Data>> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate` and return it.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&QueryState<S::Data>) -> bool,
    ) -> QueryState<S::Data> {
        let mut rx = self.state.clone();
        let result = rx.wait_for(predicate).await.map(|state| state.clone());
        result.unwrap_or_else(|_| self.state())
    }

    /// Foreground re-fetch. Also re-activates a query cleared by [`reset`](Self::reset).
    pub fn refetch(&self) {
        if self.commands.send(Command::Refetch).is_err() {
            tracing::warn!(cache_key = %self.cache_key, "refetch on a stopped query");
        }
    }

    /// Replace the dependencies handed to the fetcher; a change re-fetches.
    pub fn set_dependencies(&self, dependencies: Vec<String>) {
        if self
            .commands
            .send(Command::SetDependencies(dependencies))
            .is_err()
        {
            tracing::warn!(cache_key = %self.cache_key, "dependency change on a stopped query");
        }
    }

    /// Clear data to empty and ignore bus signals until the next refetch.
    ///
    /// Takes effect before this returns; pending fetch results are discarded.
    pub fn reset(&self) {
        self.shared.reset();
    }

    #[must_use]
    pub fn controller(&self) -> QueryController {
        let target: Arc<dyn ResetQuery> = self.shared.clone();
        QueryController {
            cache_key: self.cache_key.clone(),
            target: Arc::downgrade(&target),
        }
    }
}

impl<S: CacheStrategy> fmt::Debug for QueryHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("cache_key", &self.cache_key)
            .field("kind", &S::KIND)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: CacheStrategy> Drop for QueryHandle<S> {
    fn drop(&mut self) {
        self.task.abort();
        tracing::debug!(cache_key = %self.cache_key, "query unmounted");
    }
}
