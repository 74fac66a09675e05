//! Realtime subscription manager.
//!
//! One task per watched collection drives a small state machine:
//!
//! ```text
//! Closed ──open──▶ Opening ──ack──▶ Subscribed
//!    ▲                │                 │
//!    │             rejected        disconnected
//!    │                ▼                 ▼
//!    └──backoff──── Error            Closed ──backoff──▶ Opening
//! ```
//!
//! Push events carry only a record id, so inserts and updates are resolved
//! to the full record (relations included) before anything is emitted on
//! the bus. Missed events are never replayed; queries catch up through
//! their own staleness checks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{ChangeBus, ChangePayload};
use crate::config::RealtimeConfig;
use crate::model::{AnyRecord, CollectionName, RecordId};
use crate::service::{DataService, Filter, PushEvent, PushEventType, Subscription, fetch_one};
use crate::session::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Closed,
    Opening,
    Subscribed,
    Error,
}

impl ChannelState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Subscribed => "subscribed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side filter for `collection` as seen by `identity`.
///
/// Employees only hear about their own tasks and notifications; managers
/// and admins watch every task.
#[must_use]
pub fn subscription_filter(collection: CollectionName, identity: &Identity) -> Filter {
    match collection {
        CollectionName::Tasks if identity.role().sees_all_tasks() => Filter::all(),
        CollectionName::Tasks | CollectionName::Notifications => {
            Filter::eq("user_id", identity.user_id.as_str())
        }
        CollectionName::Profiles => Filter::by_id(&RecordId::from(identity.user_id.as_str())),
        CollectionName::Projects => Filter::all(),
    }
}

/// Exponential reconnect delay, doubling from `initial` up to `max`.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    const fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    const fn reset(&mut self) {
        self.current = self.initial;
    }
}

struct Channel {
    state: Arc<watch::Sender<ChannelState>>,
    task: Option<JoinHandle<()>>,
}

pub struct RealtimeManager {
    service: Arc<dyn DataService>,
    bus: Arc<ChangeBus>,
    config: RealtimeConfig,
    channels: Mutex<BTreeMap<CollectionName, Channel>>,
}

impl RealtimeManager {
    #[must_use]
    pub fn new(service: Arc<dyn DataService>, bus: Arc<ChangeBus>, config: RealtimeConfig) -> Self {
        let channels = config
            .collections
            .iter()
            .map(|&collection| {
                (
                    collection,
                    Channel {
                        state: Arc::new(watch::Sender::new(ChannelState::Closed)),
                        task: None,
                    },
                )
            })
            .collect();
        Self {
            service,
            bus,
            config,
            channels: Mutex::new(channels),
        }
    }

    /// Watched collections in a stable order.
    #[must_use]
    pub fn collections(&self) -> Vec<CollectionName> {
        self.channels.lock().keys().copied().collect()
    }

    /// Start one subscription task per watched collection for `identity`.
    ///
    /// Any previously open channels are torn down first.
    pub fn open(&self, identity: &Identity) {
        self.close();
        let identity = Arc::new(identity.clone());
        let mut channels = self.channels.lock();
        for (&collection, channel) in channels.iter_mut() {
            let worker = ChannelWorker {
                collection,
                filter: subscription_filter(collection, &identity),
                identity: Arc::clone(&identity),
                service: Arc::clone(&self.service),
                bus: Arc::clone(&self.bus),
                state: Arc::clone(&channel.state),
                backoff: Backoff::new(
                    self.config.reconnect_initial_delay(),
                    self.config.reconnect_max_delay(),
                ),
            };
            channel.task = Some(tokio::spawn(worker.run()));
        }
        tracing::info!(
            user_id = %identity.user_id,
            channels = channels.len(),
            "realtime channels opening"
        );
    }

    /// Tear every channel down and release its server-side subscription.
    pub fn close(&self) {
        let mut channels = self.channels.lock();
        let mut closed = 0_usize;
        for (collection, channel) in channels.iter_mut() {
            if let Some(task) = channel.task.take() {
                task.abort();
                closed += 1;
                tracing::debug!(%collection, "realtime channel closed");
            }
            channel.state.send_replace(ChannelState::Closed);
        }
        if closed > 0 {
            tracing::info!(channels = closed, "realtime channels closed");
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channels.lock().values().any(|c| c.task.is_some())
    }

    /// Current state of `collection`'s channel; unwatched collections read `Closed`.
    #[must_use]
    pub fn state(&self, collection: CollectionName) -> ChannelState {
        self.channels
            .lock()
            .get(&collection)
            .map_or(ChannelState::Closed, |c| *c.state.borrow())
    }

    #[must_use]
    pub fn watch_state(&self, collection: CollectionName) -> Option<watch::Receiver<ChannelState>> {
        self.channels
            .lock()
            .get(&collection)
            .map(|c| c.state.subscribe())
    }
}

impl fmt::Debug for RealtimeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: BTreeMap<CollectionName, ChannelState> = self
            .channels
            .lock()
            .iter()
            .map(|(collection, c)| (*collection, *c.state.borrow()))
            .collect();
        f.debug_struct("RealtimeManager")
            .field("channels", &states)
            .finish_non_exhaustive()
    }
}

impl Drop for RealtimeManager {
    fn drop(&mut self) {
        for channel in self.channels.get_mut().values_mut() {
            if let Some(task) = channel.task.take() {
                task.abort();
            }
        }
    }
}

/// Why a subscribed channel stopped.
enum Interruption {
    Disconnected(String),
    StreamEnded,
}

struct ChannelWorker {
    collection: CollectionName,
    filter: Filter,
    identity: Arc<Identity>,
    service: Arc<dyn DataService>,
    bus: Arc<ChangeBus>,
    state: Arc<watch::Sender<ChannelState>>,
    backoff: Backoff,
}

impl ChannelWorker {
    async fn run(mut self) {
        loop {
            self.state.send_replace(ChannelState::Opening);
            match self.service.subscribe(self.collection, self.filter.clone()) {
                Ok(subscription) => self.drive(subscription).await,
                Err(e) => {
                    tracing::warn!(collection = %self.collection, "realtime subscribe rejected: {e}");
                    self.state.send_replace(ChannelState::Error);
                }
            }

            let delay = self.backoff.next_delay();
            tracing::debug!(
                collection = %self.collection,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "realtime reconnect scheduled"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Wait for the acknowledgement, then pump events until the stream stops.
    async fn drive(&mut self, mut subscription: Subscription) {
        match subscription.next_event().await {
            Some(PushEvent::Acknowledged) => {}
            Some(PushEvent::Disconnected { reason }) => {
                tracing::warn!(collection = %self.collection, %reason, "realtime subscribe failed before ack");
                self.state.send_replace(ChannelState::Error);
                return;
            }
            Some(PushEvent::Change { .. }) => {
                tracing::warn!(collection = %self.collection, "realtime event before ack");
                self.state.send_replace(ChannelState::Error);
                return;
            }
            None => {
                self.state.send_replace(ChannelState::Error);
                return;
            }
        }

        self.state.send_replace(ChannelState::Subscribed);
        self.backoff.reset();
        tracing::info!(collection = %self.collection, "realtime channel subscribed");

        let interruption = loop {
            match subscription.next_event().await {
                Some(PushEvent::Change {
                    event_type,
                    record_id,
                }) => self.forward(event_type, record_id).await,
                Some(PushEvent::Acknowledged) => {}
                Some(PushEvent::Disconnected { reason }) => {
                    break Interruption::Disconnected(reason);
                }
                None => break Interruption::StreamEnded,
            }
        };
        drop(subscription);

        self.state.send_replace(ChannelState::Closed);
        match interruption {
            Interruption::Disconnected(reason) => {
                tracing::warn!(collection = %self.collection, %reason, "realtime channel disconnected");
            }
            Interruption::StreamEnded => {
                tracing::warn!(collection = %self.collection, "realtime stream ended");
            }
        }
    }

    /// Turn one push event into one bus write.
    async fn forward(&self, event_type: PushEventType, record_id: RecordId) {
        let payload = match event_type {
            PushEventType::Delete => ChangePayload::Delete {
                table: self.collection,
                id: record_id,
            },
            PushEventType::Insert | PushEventType::Update => {
                let record =
                    match fetch_one(self.service.as_ref(), self.collection, &record_id).await {
                        Ok(record) => record,
                        Err(e) => {
                            tracing::warn!(
                                collection = %self.collection,
                                record_id = %record_id,
                                ?event_type,
                                "dropping push event, record fetch failed: {e}"
                            );
                            return;
                        }
                    };
                if let Err(e) = record.validate() {
                    tracing::warn!(
                        collection = %self.collection,
                        record_id = %record_id,
                        ?event_type,
                        "dropping push event, invalid record: {e}"
                    );
                    return;
                }
                match record {
                    AnyRecord::Profiles(profile) if profile.id == self.identity.user_id => {
                        ChangePayload::ProfileChange(profile)
                    }
                    record if event_type == PushEventType::Insert => ChangePayload::Add(record),
                    record => ChangePayload::Update(record),
                }
            }
        };
        let change = self.bus.emit(payload);
        tracing::debug!(
            collection = %self.collection,
            kind = %change.kind(),
            seq = change.seq,
            "push event forwarded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{Backoff, ChannelState, RealtimeManager, subscription_filter};
    use crate::bus::{ChangeBus, ChangePayload};
    use crate::clock::ManualClock;
    use crate::config::RealtimeConfig;
    use crate::model::task::tests::sample_task;
    use crate::model::{AnyRecord, CollectionName, Profile, Record, RecordId, Role, Status};
    use crate::service::{DataService, Filter, MemoryBackend, MutationRequest};
    use crate::session::Identity;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn identity(user_id: &str, role: Role) -> Identity {
        Identity {
            user_id: user_id.into(),
            profile: Profile {
                id: user_id.into(),
                full_name: user_id.to_uppercase(),
                email: format!("{user_id}@example.com"),
                role,
                avatar_url: None,
                updated_at: Utc::now(),
            },
        }
    }

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            collections: vec![CollectionName::Tasks],
            reconnect_initial_ms: 100,
            reconnect_max_ms: 400,
        }
    }

    fn manager_for(backend: &Arc<MemoryBackend>, user: &str) -> (RealtimeManager, Arc<ChangeBus>) {
        let bus = Arc::new(ChangeBus::new(Arc::new(ManualClock::new(0))));
        let service: Arc<dyn DataService> = Arc::new(backend.connect(user));
        (
            RealtimeManager::new(service, Arc::clone(&bus), config()),
            bus,
        )
    }

    async fn wait_state(manager: &RealtimeManager, want: ChannelState) {
        let mut rx = manager
            .watch_state(CollectionName::Tasks)
            .expect("tasks watched");
        rx.wait_for(|s| *s == want).await.expect("channel alive");
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<u128> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn filters_follow_role() {
        let employee = identity("user-a", Role::Employee);
        assert_eq!(
            subscription_filter(CollectionName::Tasks, &employee),
            Filter::eq("user_id", "user-a")
        );
        assert!(subscription_filter(CollectionName::Tasks, &identity("boss", Role::Admin)).is_all());
        assert_eq!(
            subscription_filter(CollectionName::Profiles, &employee),
            Filter::by_id(&RecordId::from("user-a"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn push_events_become_full_records_on_bus() {
        let backend = MemoryBackend::new();
        let mut task = sample_task(42);
        task.comments.push(crate::model::Comment {
            id: 1,
            author_id: "user-b".into(),
            body: "please pick this up".into(),
            created_at: Utc::now(),
        });
        backend.seed(task.clone().into_any());

        let (manager, bus) = manager_for(&backend, "user-a");
        let mut changes = bus.subscribe();
        manager.open(&identity("user-a", Role::Employee));
        wait_state(&manager, ChannelState::Subscribed).await;
        assert_eq!(backend.active_subscriptions_for(CollectionName::Tasks), 1);

        task.status = Status::InProgress;
        backend
            .connect("user-b")
            .mutate(MutationRequest::update(task.clone().into_any()))
            .await
            .expect("update");

        let change = changes.changed().await.expect("forwarded");
        let ChangePayload::Update(AnyRecord::Tasks(seen)) = &change.payload else {
            panic!("expected task update, got {:?}", change.payload);
        };
        assert_eq!(seen.status, Status::InProgress);
        assert_eq!(seen.comments.len(), 1);

        backend
            .connect("user-b")
            .mutate(MutationRequest::delete(CollectionName::Tasks, RecordId::Int(42)))
            .await
            .expect("creator deletes");
        let change = changes.changed().await.expect("forwarded");
        assert_eq!(
            change.payload,
            ChangePayload::Delete {
                table: CollectionName::Tasks,
                id: RecordId::Int(42),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_record_fetch_drops_event() {
        let backend = MemoryBackend::new();
        let (manager, bus) = manager_for(&backend, "user-a");
        let mut changes = bus.subscribe();
        manager.open(&identity("user-a", Role::Employee));
        wait_state(&manager, ChannelState::Subscribed).await;

        backend.fail_next_queries(1);
        let writer = backend.connect("user-b");
        writer
            .mutate(MutationRequest::insert(sample_task(1).into_any()))
            .await
            .expect("insert");
        writer
            .mutate(MutationRequest::insert(sample_task(2).into_any()))
            .await
            .expect("insert");

        let change = changes.changed().await.expect("second insert forwarded");
        let ChangePayload::Add(record) = &change.payload else {
            panic!("expected add");
        };
        assert_eq!(record.id(), RecordId::Int(2));
        assert_eq!(change.seq, 1);
        assert_eq!(manager.state(CollectionName::Tasks), ChannelState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_pushed_record_is_dropped() {
        let backend = MemoryBackend::new();
        let (manager, bus) = manager_for(&backend, "user-a");
        let mut changes = bus.subscribe();
        manager.open(&identity("user-a", Role::Employee));
        wait_state(&manager, ChannelState::Subscribed).await;

        let mut backdated = sample_task(1);
        backdated.updated_at = backdated.created_at - chrono::Duration::days(1);
        backdated.title = String::new();
        let writer = backend.connect("user-b");
        writer
            .mutate(MutationRequest::insert(backdated.into_any()))
            .await
            .expect("insert");
        writer
            .mutate(MutationRequest::insert(sample_task(2).into_any()))
            .await
            .expect("insert");

        let change = changes.changed().await.expect("valid insert forwarded");
        let ChangePayload::Add(record) = &change.payload else {
            panic!("expected add");
        };
        assert_eq!(record.id(), RecordId::Int(2));
        assert_eq!(change.seq, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_disconnect() {
        let backend = MemoryBackend::new();
        let (manager, _bus) = manager_for(&backend, "user-a");
        manager.open(&identity("user-a", Role::Employee));
        wait_state(&manager, ChannelState::Subscribed).await;

        backend.disconnect_all("network lost");
        wait_state(&manager, ChannelState::Closed).await;
        assert!(manager.is_open());

        wait_state(&manager, ChannelState::Subscribed).await;
        assert_eq!(backend.active_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_subscribe_retries_with_backoff() {
        let backend = MemoryBackend::new();
        backend.set_reject_subscriptions(true);
        let (manager, _bus) = manager_for(&backend, "user-a");
        manager.open(&identity("user-a", Role::Employee));
        wait_state(&manager, ChannelState::Error).await;
        assert_eq!(backend.active_subscriptions(), 0);

        backend.set_reject_subscriptions(false);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.state(CollectionName::Tasks), ChannelState::Subscribed);
        assert_eq!(backend.active_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_server_subscriptions() {
        let backend = MemoryBackend::new();
        let (manager, bus) = manager_for(&backend, "user-a");
        let mut changes = bus.subscribe();
        manager.open(&identity("user-a", Role::Employee));
        wait_state(&manager, ChannelState::Subscribed).await;

        manager.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(CollectionName::Tasks), ChannelState::Closed);
        assert_eq!(backend.active_subscriptions(), 0);
        assert!(!manager.is_open());

        backend
            .connect("user-b")
            .mutate(MutationRequest::insert(sample_task(7).into_any()))
            .await
            .expect("insert");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(bus.latest().is_none());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), changes.changed())
                .await
                .is_err()
        );
    }
}
