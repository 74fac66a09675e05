//! Client façade.
//!
//! [`SyncClient`] owns one of each component and wires them together:
//! sign-in opens realtime channels, queries are mounted against the shared
//! bus and cache, and sign-out clears every mounted query before the
//! session flips back to anonymous.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::bus::{ChangeBus, ChangePayload, DataChange, emit_data_change};
use crate::cache::{PersistentCache, SqliteCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{EffectiveConfig, Settings, SyncConfig, resolve_config};
use crate::error::SyncError;
use crate::model::{CollectionName, Notification, Profile, Project, Record, RecordId, Task};
use crate::mutation::{Mutator, Optimism};
use crate::query::{
    CacheStrategy, CollectionCache, Fetcher, QueryContext, QueryController, QueryHandle,
    QueryOptions, SingletonCache, collection_fetcher, singleton_fetcher,
};
use crate::realtime::{RealtimeManager, subscription_filter};
use crate::service::DataService;
use crate::session::{Identity, SessionGate};

pub struct SyncClient {
    service: Arc<dyn DataService>,
    bus: Arc<ChangeBus>,
    cache: Arc<dyn PersistentCache>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    settings: Settings,
    session: Arc<SessionGate>,
    realtime: Arc<RealtimeManager>,
    queries: Mutex<Vec<QueryController>>,
    profile_listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncClient {
    #[must_use]
    pub fn new(
        service: Arc<dyn DataService>,
        cache: Arc<dyn PersistentCache>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
        settings: Settings,
    ) -> Self {
        let bus = Arc::new(ChangeBus::new(Arc::clone(&clock)));
        let realtime = Arc::new(RealtimeManager::new(
            Arc::clone(&service),
            Arc::clone(&bus),
            config.realtime.clone(),
        ));
        Self {
            service,
            bus,
            cache,
            clock,
            config,
            settings,
            session: Arc::new(SessionGate::new()),
            realtime,
            queries: Mutex::new(Vec::new()),
            profile_listener: Mutex::new(None),
        }
    }

    /// Build a client from `<project_root>/.taskboard/config.toml`, the user
    /// settings file and a `SQLite` cache at the configured path.
    pub fn open(project_root: &Path, service: Arc<dyn DataService>) -> anyhow::Result<Self> {
        let EffectiveConfig { sync, settings } = resolve_config(project_root)?;
        let cache = SqliteCache::open(&sync.cache.path)
            .with_context(|| format!("open cache at {}", sync.cache.path.display()))?;
        Ok(Self::new(
            service,
            Arc::new(cache),
            Arc::new(SystemClock),
            sync,
            settings,
        ))
    }

    #[must_use]
    pub fn session(&self) -> &SessionGate {
        &self.session
    }

    #[must_use]
    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub const fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    #[must_use]
    pub fn realtime(&self) -> &RealtimeManager {
        &self.realtime
    }

    #[must_use]
    pub fn cache(&self) -> &dyn PersistentCache {
        self.cache.as_ref()
    }

    /// Sign in as `user_id`, then open realtime channels.
    ///
    /// Signing in as the current user is a no-op; signing in as someone else
    /// signs the current user out first.
    pub async fn sign_in(&self, user_id: &str) -> Result<Arc<Identity>, SyncError> {
        if let Some(current) = self.session.identity() {
            if current.user_id == user_id {
                return Ok(current);
            }
            self.sign_out();
        }

        let identity = self.session.sign_in(self.service.as_ref(), user_id).await?;
        self.realtime.open(&identity);
        self.start_profile_listener();
        Ok(identity)
    }

    /// Tear down realtime channels, clear every mounted query, and return to
    /// anonymous.
    pub fn sign_out(&self) {
        if let Some(listener) = self.profile_listener.lock().take() {
            listener.abort();
        }
        self.realtime.close();

        let cleared = {
            let mut queries = self.queries.lock();
            queries.retain(QueryController::reset);
            queries.len()
        };
        if self.session.sign_out() {
            tracing::info!(queries = cleared, "session closed");
        }
    }

    /// Tasks visible to the signed-in user.
    pub fn tasks_query(&self) -> Result<QueryHandle<CollectionCache<Task>>, SyncError> {
        self.collection_query::<Task>()
    }

    pub fn notifications_query(
        &self,
    ) -> Result<QueryHandle<CollectionCache<Notification>>, SyncError> {
        self.collection_query::<Notification>()
    }

    pub fn projects_query(&self) -> Result<QueryHandle<CollectionCache<Project>>, SyncError> {
        self.collection_query::<Project>()
    }

    /// The signed-in user's own profile.
    pub fn profile_query(&self) -> Result<QueryHandle<SingletonCache<Profile>>, SyncError> {
        let identity = self.session.require_identity()?;
        let fetcher = singleton_fetcher::<Profile>(
            Arc::clone(&self.service),
            RecordId::from(identity.user_id.as_str()),
        );
        Ok(self.mount(
            format!("profile:{}", identity.user_id),
            fetcher,
            vec![identity.user_id.clone()],
        ))
    }

    #[must_use]
    pub fn mutator(&self, optimism: Optimism) -> Mutator {
        Mutator::new(Arc::clone(&self.service), Arc::clone(&self.bus), optimism)
    }

    /// Announce a change ahead of its realtime echo.
    pub fn emit_data_change(&self, payload: ChangePayload) -> Arc<DataChange> {
        emit_data_change(&self.bus, payload)
    }

    /// Queries mounted through this client that are still alive.
    #[must_use]
    pub fn mounted_queries(&self) -> usize {
        let mut queries = self.queries.lock();
        queries.retain(QueryController::is_mounted);
        queries.len()
    }

    fn collection_query<T: Record>(&self) -> Result<QueryHandle<CollectionCache<T>>, SyncError> {
        let identity = self.session.require_identity()?;
        let filter = subscription_filter(T::COLLECTION, &identity);
        let fetcher = collection_fetcher::<T>(Arc::clone(&self.service), filter);
        Ok(self.mount(
            cache_key(T::COLLECTION, &identity),
            fetcher,
            vec![identity.user_id.clone()],
        ))
    }

    fn mount<S: CacheStrategy>(
        &self,
        cache_key: String,
        fetcher: Fetcher<S::Data>,
        dependencies: Vec<String>,
    ) -> QueryHandle<S> {
        let options = QueryOptions::new(cache_key)
            .with_dependencies(dependencies)
            .with_stale_window(self.config.cache.stale_window());
        let ctx = QueryContext {
            bus: Arc::clone(&self.bus),
            cache: Arc::clone(&self.cache),
            clock: Arc::clone(&self.clock),
            timestamp_policy: self.config.cache.timestamp_policy,
        };
        let handle = QueryHandle::mount(options, fetcher, ctx);

        {
            let mut queries = self.queries.lock();
            queries.retain(QueryController::is_mounted);
            queries.push(handle.controller());
        }
        handle
    }

    /// Follow the signed-in user's profile. A role change re-opens realtime
    /// so the subscription filters match what the new role may see.
    fn start_profile_listener(&self) {
        let mut changes = self.bus.subscribe();
        let session = Arc::clone(&self.session);
        let realtime = Arc::clone(&self.realtime);
        let listener = tokio::spawn(async move {
            while let Some(change) = changes.changed().await {
                let ChangePayload::ProfileChange(profile) = &change.payload else {
                    continue;
                };
                let previous_role = session.identity().map(|identity| identity.role());
                if !session.apply_profile_change(profile) {
                    continue;
                }
                tracing::debug!(user_id = %profile.id, seq = change.seq, "identity profile replaced");

                match session.identity() {
                    Some(identity) if previous_role != Some(identity.role()) => {
                        tracing::info!(
                            user_id = %identity.user_id,
                            role = %identity.role(),
                            "role changed, re-opening realtime channels"
                        );
                        realtime.open(&identity);
                    }
                    _ => {}
                }
            }
        });
        if let Some(previous) = self.profile_listener.lock().replace(listener) {
            previous.abort();
        }
    }
}

/// Cache keys are scoped by user so one device can hold several accounts.
fn cache_key(collection: CollectionName, identity: &Identity) -> String {
    format!("{collection}:{}", identity.user_id)
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("session", &self.session.state())
            .field("realtime", &self.realtime)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(listener) = self.profile_listener.get_mut().take() {
            listener.abort();
        }
    }
}
