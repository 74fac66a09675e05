use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use taskboard_core::SyncClient;
use taskboard_core::cache::MemoryCache;
use taskboard_core::clock::Clock;
use taskboard_core::config::{Settings, SyncConfig};
use taskboard_core::model::{AnyRecord, CollectionName, Task};
use taskboard_core::mutation::{Mutator, Optimism};
use taskboard_core::query::{CollectionCache, QueryHandle};
use taskboard_core::realtime::{ChannelState, subscription_filter};
use taskboard_core::service::MemoryBackend;
use taskboard_core::session::Identity;

/// One signed-in user with a mounted tasks query.
pub struct SimulatedSession {
    identity: Arc<Identity>,
    client: SyncClient,
    tasks: QueryHandle<CollectionCache<Task>>,
}

impl SimulatedSession {
    pub async fn start(
        backend: &Arc<MemoryBackend>,
        user_id: &str,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = SyncClient::new(
            Arc::new(backend.connect(user_id)),
            Arc::new(MemoryCache::new()),
            clock,
            config,
            Settings::default(),
        );
        let identity = client
            .sign_in(user_id)
            .await
            .with_context(|| format!("sign in {user_id}"))?;
        let tasks = client.tasks_query().context("mount tasks query")?;
        Ok(Self {
            identity,
            client,
            tasks,
        })
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    #[must_use]
    pub const fn client(&self) -> &SyncClient {
        &self.client
    }

    #[must_use]
    pub fn mutator(&self, optimism: Optimism) -> Mutator {
        self.client.mutator(optimism)
    }

    /// The session's tasks, ordered by id.
    #[must_use]
    pub fn view(&self) -> Vec<Task> {
        let mut tasks = self.tasks.data();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// The server rows this session is entitled to see, ordered by id.
    #[must_use]
    pub fn expected_view(&self, backend: &MemoryBackend) -> Vec<Task> {
        let filter = subscription_filter(CollectionName::Tasks, &self.identity);
        let mut tasks: Vec<Task> = backend
            .rows(CollectionName::Tasks)
            .into_iter()
            .filter(|row| filter.matches(row))
            .filter_map(|row| match row {
                AnyRecord::Tasks(task) => Some(task),
                _ => None,
            })
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub async fn wait_ready(&self, limit: Duration) -> Result<()> {
        tokio::time::timeout(limit, async {
            self.tasks.wait_for(|s| !s.loading).await;
            for collection in self.client.realtime().collections() {
                if let Some(mut state) = self.client.realtime().watch_state(collection) {
                    let _ = state.wait_for(|s| *s == ChannelState::Subscribed).await;
                }
            }
        })
        .await
        .with_context(|| format!("session {} not ready after {limit:?}", self.user_id()))
    }

    /// Wait until the view matches `expected` or `limit` passes. Returns
    /// whether it matched.
    pub async fn wait_for_view(&self, expected: &[Task], limit: Duration) -> bool {
        let matched = tokio::time::timeout(
            limit,
            self.tasks.wait_for(|s| {
                let mut observed = s.data.clone();
                observed.sort_by_key(|t| t.id);
                observed == expected
            }),
        )
        .await;
        matched.is_ok()
    }

    /// Foreground re-fetch, waiting for it to land.
    pub async fn refresh(&self, limit: Duration) -> Result<()> {
        let mut state = self.tasks.watch();
        state.borrow_and_update();
        self.tasks.refetch();
        tokio::time::timeout(limit, async {
            let _ = state.changed().await;
            let _ = state.wait_for(|s| !s.loading).await;
        })
        .await
        .with_context(|| format!("refresh of {} timed out", self.user_id()))
    }
}

impl std::fmt::Debug for SimulatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSession")
            .field("user_id", &self.identity.user_id)
            .field("role", &self.identity.role())
            .finish_non_exhaustive()
    }
}
