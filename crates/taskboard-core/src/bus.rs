//! Change notification bus.
//!
//! A single slot holding the most recent [`DataChange`], written by mutation
//! call-sites and the realtime manager and observed by every mounted query.
//!
//! There is no queue. A receiver that falls behind only sees the newest
//! change, so consumers re-derive from their current collection on each
//! signal instead of diffing against the previous bus value. Every emitted
//! change gets a fresh timestamp and sequence number, so two changes with
//! identical payloads are still distinct signals.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::model::{AnyRecord, CollectionName, Profile, RecordId};

/// Discriminant of a [`ChangePayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
    DeleteMany,
    BatchUpdate,
    ProfileChange,
}

impl ChangeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::DeleteMany => "delete_many",
            Self::BatchUpdate => "batch_update",
            Self::ProfileChange => "profile_change",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangePayload {
    /// Insert the record unless its id is already present.
    Add(AnyRecord),
    /// Replace the record with the same id, or append it.
    Update(AnyRecord),
    Delete {
        table: CollectionName,
        id: RecordId,
    },
    DeleteMany {
        table: CollectionName,
        ids: Vec<RecordId>,
    },
    /// Too much changed to describe; consumers re-fetch.
    BatchUpdate {
        reason: String,
        table: Option<CollectionName>,
    },
    /// The signed-in user's profile was replaced.
    ProfileChange(Profile),
}

impl ChangePayload {
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Add(_) => ChangeKind::Add,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
            Self::DeleteMany { .. } => ChangeKind::DeleteMany,
            Self::BatchUpdate { .. } => ChangeKind::BatchUpdate,
            Self::ProfileChange(_) => ChangeKind::ProfileChange,
        }
    }

    /// The collection this change targets; `None` means every collection.
    #[must_use]
    pub const fn table(&self) -> Option<CollectionName> {
        match self {
            Self::Add(record) | Self::Update(record) => Some(record.collection()),
            Self::Delete { table, .. } | Self::DeleteMany { table, .. } => Some(*table),
            Self::BatchUpdate { table, .. } => *table,
            Self::ProfileChange(_) => Some(CollectionName::Profiles),
        }
    }
}

/// One immutable change signal.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChange {
    pub payload: ChangePayload,
    /// Epoch millis at emission.
    pub timestamp: i64,
    /// Bus-local emission counter.
    pub seq: u64,
}

impl DataChange {
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        self.payload.kind()
    }

    #[must_use]
    pub const fn table(&self) -> Option<CollectionName> {
        self.payload.table()
    }

    /// Whether a consumer of `collection` should look at this change.
    #[must_use]
    pub fn concerns(&self, collection: CollectionName) -> bool {
        self.table().is_none_or(|t| t == collection)
    }
}

type Slot = Option<Arc<DataChange>>;

/// Single-slot, multi-reader change signal.
#[derive(Debug)]
pub struct ChangeBus {
    tx: watch::Sender<Slot>,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl ChangeBus {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            seq: AtomicU64::new(0),
            clock,
        }
    }

    /// Stamp `payload` and make it the live change.
    pub fn emit(&self, payload: ChangePayload) -> Arc<DataChange> {
        let change = Arc::new(DataChange {
            payload,
            timestamp: self.clock.now_millis(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
        });
        tracing::trace!(
            kind = %change.kind(),
            seq = change.seq,
            table = ?change.table(),
            "bus emit"
        );
        self.tx.send_replace(Some(Arc::clone(&change)));
        change
    }

    /// A receiver that fires on changes emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> ChangeReceiver {
        ChangeReceiver {
            rx: self.tx.subscribe(),
        }
    }

    #[must_use]
    pub fn latest(&self) -> Option<Arc<DataChange>> {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Observer side of a [`ChangeBus`].
#[derive(Debug, Clone)]
pub struct ChangeReceiver {
    rx: watch::Receiver<Slot>,
}

impl ChangeReceiver {
    /// Wait for the next unseen change. `None` once the bus is gone.
    pub async fn changed(&mut self) -> Option<Arc<DataChange>> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(change) = self.rx.borrow_and_update().clone() {
                return Some(change);
            }
        }
    }

    #[must_use]
    pub fn latest(&self) -> Option<Arc<DataChange>> {
        self.rx.borrow().clone()
    }
}

/// Announce a change from a mutation call-site ahead of the realtime echo.
pub fn emit_data_change(bus: &ChangeBus, payload: ChangePayload) -> Arc<DataChange> {
    bus.emit(payload)
}
