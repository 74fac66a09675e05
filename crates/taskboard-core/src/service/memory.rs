//! In-memory implementation of the data service.
//!
//! # Purpose
//! A [`MemoryBackend`] holds every collection in a `Vec` guarded by a
//! `parking_lot::Mutex` and fans mutations out to realtime subscribers. Each
//! signed-in user talks to it through a [`MemoryDataService`] connection that
//! carries the acting user id, so permission rules (only the creator or a
//! manager may delete a task) behave like the hosted service.
//!
//! # Fault injection
//! Tests and the simulator can take the backend offline, fail the next N
//! queries, add query latency, reject subscriptions, or drop every live
//! connection to exercise reconnect paths.
//!
//! # Consistency
//! Not durable. Push events are emitted after the table lock is released and
//! in mutation order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    DataService, Filter, MutationOp, MutationPayload, MutationRequest, Projection, PushEvent,
    PushEventType, QueryRequest, ServiceError, ServiceResult, Subscription,
};
use crate::model::{AnyRecord, CollectionName, Profile, RecordId, Role};

#[derive(Debug)]
struct Subscriber {
    id: u64,
    collection: CollectionName,
    filter: Filter,
    tx: mpsc::UnboundedSender<PushEvent>,
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    failing_queries: u32,
    reject_subscriptions: bool,
    query_latency: Option<Duration>,
}

/// Shared server state behind every [`MemoryDataService`] connection.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: Mutex<BTreeMap<CollectionName, Vec<AnyRecord>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    faults: Mutex<Faults>,
    next_subscriber_id: AtomicU64,
    queries_served: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace a row without emitting push events.
    pub fn seed(&self, record: AnyRecord) {
        let mut tables = self.tables.lock();
        let rows = tables.entry(record.collection()).or_default();
        let id = record.id();
        if let Some(slot) = rows.iter_mut().find(|r| r.id() == id) {
            *slot = record;
        } else {
            rows.push(record);
        }
    }

    #[must_use]
    pub fn rows(&self, collection: CollectionName) -> Vec<AnyRecord> {
        self.tables
            .lock()
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Open a connection acting as `user_id`.
    #[must_use]
    pub fn connect(self: &Arc<Self>, user_id: &str) -> MemoryDataService {
        MemoryDataService {
            backend: Arc::clone(self),
            actor: user_id.to_string(),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    pub fn fail_next_queries(&self, count: u32) {
        self.faults.lock().failing_queries = count;
    }

    pub fn set_reject_subscriptions(&self, reject: bool) {
        self.faults.lock().reject_subscriptions = reject;
    }

    pub fn set_query_latency(&self, latency: Option<Duration>) {
        self.faults.lock().query_latency = latency;
    }

    /// Drop every live subscription, telling each one why.
    pub fn disconnect_all(&self, reason: &str) {
        let dropped: Vec<Subscriber> = self.subscribers.lock().drain(..).collect();
        for sub in dropped {
            let _ = sub.tx.send(PushEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
        tracing::debug!(reason, "memory backend dropped all subscriptions");
    }

    /// Number of subscriptions currently registered server-side.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.subscribers.lock().len()
    }

    #[must_use]
    pub fn active_subscriptions_for(&self, collection: CollectionName) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|s| s.collection == collection)
            .count()
    }

    /// Total queries answered (successful or not) since creation.
    #[must_use]
    pub fn queries_served(&self) -> u64 {
        self.queries_served.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> ServiceResult<()> {
        if self.faults.lock().offline {
            return Err(ServiceError::Unavailable("backend offline".into()));
        }
        Ok(())
    }

    fn role_of(&self, user_id: &str) -> Role {
        self.tables
            .lock()
            .get(&CollectionName::Profiles)
            .and_then(|rows| {
                rows.iter().find_map(|row| match row {
                    AnyRecord::Profiles(Profile { id, role, .. }) if id == user_id => Some(*role),
                    _ => None,
                })
            })
            .unwrap_or_default()
    }

    fn authorize(
        &self,
        actor: &str,
        op: MutationOp,
        existing: Option<&AnyRecord>,
    ) -> ServiceResult<()> {
        let Some(AnyRecord::Tasks(task)) = existing else {
            return Ok(());
        };
        let elevated = self.role_of(actor).sees_all_tasks();
        let allowed = match op {
            MutationOp::Insert => true,
            MutationOp::Update => elevated || task.created_by == actor || task.user_id == actor,
            MutationOp::Delete => elevated || task.created_by == actor,
        };
        if allowed {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(format!(
                "{actor} may not {op:?} task {}",
                task.id
            )))
        }
    }

    fn notify(&self, record: &AnyRecord, event_type: PushEventType) {
        let collection = record.collection();
        let record_id = record.id();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            if sub.collection != collection || !sub.filter.matches(record) {
                return true;
            }
            sub.tx
                .send(PushEvent::Change {
                    event_type,
                    record_id: record_id.clone(),
                })
                .is_ok()
        });
    }

    fn find(&self, collection: CollectionName, id: &RecordId) -> Option<AnyRecord> {
        self.tables
            .lock()
            .get(&collection)
            .and_then(|rows| find_row(rows, id))
    }

    fn apply(&self, actor: &str, request: MutationRequest) -> ServiceResult<Option<AnyRecord>> {
        let collection = request.collection;
        let (stored, pushed, event_type) = match (request.operation, request.payload) {
            (MutationOp::Insert, MutationPayload::Record(record)) => {
                let mut tables = self.tables.lock();
                let rows = tables.entry(collection).or_default();
                let id = record.id();
                if rows.iter().any(|r| r.id() == id) {
                    return Err(ServiceError::Malformed(format!(
                        "duplicate {collection} id {id}"
                    )));
                }
                rows.push(record.clone());
                (Some(record.clone()), record, PushEventType::Insert)
            }
            (MutationOp::Update, MutationPayload::Record(record)) => {
                let id = record.id();
                let existing = self
                    .find(collection, &id)
                    .ok_or_else(|| ServiceError::NotFound {
                        collection,
                        id: id.clone(),
                    })?;
                self.authorize(actor, MutationOp::Update, Some(&existing))?;
                let mut tables = self.tables.lock();
                if let Some(slot) = tables
                    .entry(collection)
                    .or_default()
                    .iter_mut()
                    .find(|r| r.id() == id)
                {
                    *slot = record.clone();
                }
                (Some(record.clone()), record, PushEventType::Update)
            }
            (MutationOp::Delete, MutationPayload::Id(id)) => {
                let existing = self
                    .find(collection, &id)
                    .ok_or_else(|| ServiceError::NotFound {
                        collection,
                        id: id.clone(),
                    })?;
                self.authorize(actor, MutationOp::Delete, Some(&existing))?;
                self.tables
                    .lock()
                    .entry(collection)
                    .or_default()
                    .retain(|r| r.id() != id);
                (None, existing, PushEventType::Delete)
            }
            (op, _) => {
                return Err(ServiceError::Malformed(format!(
                    "payload does not fit {op:?} on {collection}"
                )));
            }
        };
        self.notify(&pushed, event_type);
        Ok(stored)
    }
}

fn strip_relations(record: AnyRecord) -> AnyRecord {
    match record {
        AnyRecord::Tasks(mut task) => {
            task.attachments.clear();
            task.time_logs.clear();
            task.comments.clear();
            AnyRecord::Tasks(task)
        }
        other => other,
    }
}

/// A connection to a [`MemoryBackend`] acting as one user.
#[derive(Debug, Clone)]
pub struct MemoryDataService {
    backend: Arc<MemoryBackend>,
    actor: String,
}

impl MemoryDataService {
    #[must_use]
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn query(&self, request: QueryRequest) -> ServiceResult<Vec<AnyRecord>> {
        self.backend.queries_served.fetch_add(1, Ordering::SeqCst);
        let latency = self.backend.faults.lock().query_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.backend.check_online()?;
        {
            let mut faults = self.backend.faults.lock();
            if faults.failing_queries > 0 {
                faults.failing_queries -= 1;
                return Err(ServiceError::Unavailable("injected query failure".into()));
            }
        }

        let rows = self.backend.rows(request.collection);
        let out = rows
            .into_iter()
            .filter(|row| request.filter.matches(row))
            .map(|row| match request.projection {
                Projection::Flat => strip_relations(row),
                Projection::WithRelations => row,
            })
            .collect();
        Ok(out)
    }

    async fn mutate(&self, request: MutationRequest) -> ServiceResult<Option<AnyRecord>> {
        self.backend.check_online()?;
        self.backend.apply(&self.actor, request)
    }

    fn subscribe(
        &self,
        collection: CollectionName,
        filter: Filter,
    ) -> ServiceResult<Subscription> {
        self.backend.check_online()?;
        if self.backend.faults.lock().reject_subscriptions {
            return Err(ServiceError::Unavailable("subscription rejected".into()));
        }

        let id = self.backend.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(PushEvent::Acknowledged);
        self.backend.subscribers.lock().push(Subscriber {
            id,
            collection,
            filter,
            tx,
        });

        let backend = Arc::downgrade(&self.backend);
        Ok(Subscription::new(rx, move || {
            if let Some(backend) = backend.upgrade() {
                backend.subscribers.lock().retain(|s| s.id != id);
            }
        }))
    }
}

/// Id lookup helper used by tests and the simulator.
#[must_use]
pub fn find_row(rows: &[AnyRecord], id: &RecordId) -> Option<AnyRecord> {
    rows.iter().find(|r| &r.id() == id).cloned()
}
