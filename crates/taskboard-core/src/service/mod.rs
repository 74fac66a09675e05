//! The remote data service, seen from the client.
//!
//! The sync core never talks to a wire protocol directly. Everything goes
//! through [`DataService`]: one-shot reads, mutations, and realtime
//! subscriptions whose push events carry only a record id.
//!
//! [`memory::MemoryDataService`] implements the trait in-process for tests
//! and the simulation harness.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::model::{AnyRecord, CollectionName, RecordId};

pub use memory::{MemoryBackend, MemoryDataService};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("data service unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{collection} record {id} not found")]
    NotFound {
        collection: CollectionName,
        id: RecordId,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// One equality condition on a top-level record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub value: Value,
}

/// Conjunction of equality conditions. The empty filter matches everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    #[must_use]
    pub const fn all() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    #[must_use]
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::all().and_eq(field, value)
    }

    #[must_use]
    pub fn and_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    /// Filter selecting a single record by id.
    #[must_use]
    pub fn by_id(id: &RecordId) -> Self {
        let value = match id {
            RecordId::Int(v) => Value::from(*v),
            RecordId::Str(v) => Value::from(v.as_str()),
        };
        Self::eq("id", value)
    }

    #[must_use]
    pub fn is_all(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate the filter against a record's JSON form.
    #[must_use]
    pub fn matches(&self, record: &AnyRecord) -> bool {
        if self.is_all() {
            return true;
        }
        let Ok(json) = serde_json::to_value(record) else {
            return false;
        };
        let row = &json["record"];
        self.conditions
            .iter()
            .all(|cond| row.get(&cond.field) == Some(&cond.value))
    }
}

/// How much of the relation graph a read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Projection {
    /// Row columns only.
    Flat,
    /// Row plus nested relations (attachments, time logs, comments).
    #[default]
    WithRelations,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub collection: CollectionName,
    pub filter: Filter,
    pub projection: Projection,
}

impl QueryRequest {
    #[must_use]
    pub const fn new(collection: CollectionName, filter: Filter) -> Self {
        Self {
            collection,
            filter,
            projection: Projection::WithRelations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationPayload {
    Record(AnyRecord),
    Id(RecordId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationRequest {
    pub collection: CollectionName,
    pub operation: MutationOp,
    pub payload: MutationPayload,
}

impl MutationRequest {
    #[must_use]
    pub fn insert(record: AnyRecord) -> Self {
        Self {
            collection: record.collection(),
            operation: MutationOp::Insert,
            payload: MutationPayload::Record(record),
        }
    }

    #[must_use]
    pub fn update(record: AnyRecord) -> Self {
        Self {
            collection: record.collection(),
            operation: MutationOp::Update,
            payload: MutationPayload::Record(record),
        }
    }

    #[must_use]
    pub const fn delete(collection: CollectionName, id: RecordId) -> Self {
        Self {
            collection,
            operation: MutationOp::Delete,
            payload: MutationPayload::Id(id),
        }
    }
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushEventType {
    Insert,
    Update,
    Delete,
}

/// Message delivered on a realtime subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// The server accepted the subscription.
    Acknowledged,
    /// A row matching the subscription filter changed. No relations attached.
    Change {
        event_type: PushEventType,
        record_id: RecordId,
    },
    /// The connection dropped; no further events will arrive.
    Disconnected { reason: String },
}

/// A live server-side subscription.
///
/// Dropping it releases the server-side listener.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<PushEvent>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<PushEvent>,
        on_release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            on_release: Some(Box::new(on_release)),
        }
    }

    /// Next push event, or `None` once the server side has gone away.
    pub async fn next_event(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("released", &self.on_release.is_none())
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

// ---------------------------------------------------------------------------
// Service trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DataService: Send + Sync {
    /// One-shot read.
    async fn query(&self, request: QueryRequest) -> ServiceResult<Vec<AnyRecord>>;

    /// Insert, update or delete a record. Returns the stored row when the
    /// service echoes one.
    async fn mutate(&self, request: MutationRequest) -> ServiceResult<Option<AnyRecord>>;

    /// Open a realtime subscription. Acknowledgement arrives as the first
    /// [`PushEvent::Acknowledged`].
    fn subscribe(&self, collection: CollectionName, filter: Filter)
    -> ServiceResult<Subscription>;
}

/// Fetch a single record with its full relation graph.
pub async fn fetch_one(
    service: &dyn DataService,
    collection: CollectionName,
    id: &RecordId,
) -> ServiceResult<AnyRecord> {
    let rows = service
        .query(QueryRequest::new(collection, Filter::by_id(id)))
        .await?;
    rows.into_iter()
        .next()
        .ok_or_else(|| ServiceError::NotFound {
            collection,
            id: id.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::{Filter, PushEvent, Subscription};
    use crate::model::task::tests::sample_task;
    use crate::model::{Record, RecordId};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[test]
    fn empty_filter_matches_everything() {
        assert!(Filter::all().matches(&sample_task(1).into_any()));
    }

    #[test]
    fn equality_filter_checks_fields() {
        let task = sample_task(1).into_any();
        assert!(Filter::eq("user_id", "user-a").matches(&task));
        assert!(!Filter::eq("user_id", "user-z").matches(&task));
        assert!(
            Filter::eq("user_id", "user-a")
                .and_eq("status", "todo")
                .matches(&task)
        );
        assert!(Filter::by_id(&RecordId::Int(1)).matches(&task));
        assert!(!Filter::by_id(&RecordId::Int(2)).matches(&task));
    }

    #[tokio::test]
    async fn dropping_subscription_releases_listener() {
        let released = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();
        let flag = Arc::clone(&released);
        let mut sub = Subscription::new(rx, move || flag.store(true, Ordering::SeqCst));

        tx.send(PushEvent::Acknowledged).expect("send ack");
        assert_eq!(sub.next_event().await, Some(PushEvent::Acknowledged));
        assert!(!released.load(Ordering::SeqCst));

        drop(sub);
        assert!(released.load(Ordering::SeqCst));
    }
}
