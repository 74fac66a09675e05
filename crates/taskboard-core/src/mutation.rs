//! User-initiated writes.
//!
//! Every write goes straight to the data service. The authoritative change
//! comes back through the realtime channel. A call-site that wants to render
//! ahead of that echo uses [`Optimism::Optimistic`]: the change is announced
//! on the bus first and, if the service refuses it, the inverse change is
//! announced so every mounted query rolls back.

use std::sync::Arc;

use crate::bus::{ChangeBus, ChangePayload};
use crate::error::SyncError;
use crate::model::{AnyRecord, CollectionName, RecordId};
use crate::service::{DataService, MutationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Optimism {
    /// Announce on the bus before the service call; roll back on failure.
    Optimistic,
    /// Emit nothing; wait for the realtime echo.
    #[default]
    AwaitEcho,
}

pub struct Mutator {
    service: Arc<dyn DataService>,
    bus: Arc<ChangeBus>,
    optimism: Optimism,
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("optimism", &self.optimism)
            .finish_non_exhaustive()
    }
}

impl Mutator {
    #[must_use]
    pub fn new(service: Arc<dyn DataService>, bus: Arc<ChangeBus>, optimism: Optimism) -> Self {
        Self {
            service,
            bus,
            optimism,
        }
    }

    #[must_use]
    pub const fn optimism(&self) -> Optimism {
        self.optimism
    }

    pub async fn insert(&self, record: AnyRecord) -> Result<Option<AnyRecord>, SyncError> {
        let collection = record.collection();
        let id = record.id();
        let rollback = ChangePayload::Delete {
            table: collection,
            id: id.clone(),
        };
        self.run(
            MutationRequest::insert(record.clone()),
            ChangePayload::Add(record),
            rollback,
            collection,
            &id,
        )
        .await
    }

    /// Update `record`. `previous` is what the caller currently shows and is
    /// restored on rollback; without it, rollback asks queries to re-fetch.
    pub async fn update(
        &self,
        record: AnyRecord,
        previous: Option<AnyRecord>,
    ) -> Result<Option<AnyRecord>, SyncError> {
        let collection = record.collection();
        let id = record.id();
        let rollback = previous.map_or_else(
            || refetch(collection, "update rolled back"),
            ChangePayload::Update,
        );
        self.run(
            MutationRequest::update(record.clone()),
            ChangePayload::Update(record),
            rollback,
            collection,
            &id,
        )
        .await
    }

    /// Delete `id`. `previous` is re-added on rollback when given.
    pub async fn delete(
        &self,
        collection: CollectionName,
        id: RecordId,
        previous: Option<AnyRecord>,
    ) -> Result<(), SyncError> {
        let rollback = previous.map_or_else(
            || refetch(collection, "delete rolled back"),
            ChangePayload::Add,
        );
        self.run(
            MutationRequest::delete(collection, id.clone()),
            ChangePayload::Delete {
                table: collection,
                id: id.clone(),
            },
            rollback,
            collection,
            &id,
        )
        .await
        .map(|_| ())
    }

    async fn run(
        &self,
        request: MutationRequest,
        optimistic: ChangePayload,
        rollback: ChangePayload,
        collection: CollectionName,
        id: &RecordId,
    ) -> Result<Option<AnyRecord>, SyncError> {
        let operation = request.operation;
        if self.optimism == Optimism::Optimistic {
            self.bus.emit(optimistic);
        }

        match self.service.mutate(request).await {
            Ok(stored) => {
                tracing::debug!(%collection, %id, ?operation, "mutation accepted");
                Ok(stored)
            }
            Err(e) => {
                let error = SyncError::from(e);
                if self.optimism == Optimism::Optimistic {
                    self.bus.emit(rollback);
                    tracing::warn!(
                        %collection,
                        %id,
                        ?operation,
                        code = %error.code(),
                        "mutation rejected, optimistic change rolled back: {error}"
                    );
                } else {
                    tracing::warn!(
                        %collection,
                        %id,
                        ?operation,
                        code = %error.code(),
                        "mutation rejected: {error}"
                    );
                }
                Err(error)
            }
        }
    }
}

fn refetch(collection: CollectionName, reason: &str) -> ChangePayload {
    ChangePayload::BatchUpdate {
        reason: reason.to_string(),
        table: Some(collection),
    }
}
