//! Fetch closures over a [`DataService`] for the common query shapes.

use std::sync::Arc;

use futures::FutureExt;

use super::Fetcher;
use crate::error::SyncError;
use crate::model::{Record, RecordId};
use crate::service::{DataService, Filter, QueryRequest, ServiceError, fetch_one};

/// Fetch every `T` matching `filter`, relations included.
pub fn collection_fetcher<T: Record>(service: Arc<dyn DataService>, filter: Filter) -> Fetcher<Vec<T>> {
    Arc::new(move |_dependencies: &[String]| {
        let service = Arc::clone(&service);
        let request = QueryRequest::new(T::COLLECTION, filter.clone());
        async move {
            let rows = service.query(request).await?;
            Ok::<_, SyncError>(
                rows.iter()
                    .filter_map(T::extract)
                    .filter(|record| valid(*record))
                    .cloned()
                    .collect::<Vec<T>>(),
            )
        }
        .boxed()
    })
}

/// Malformed rows are dropped so projections never see them.
fn valid<T: Record>(record: &T) -> bool {
    match record.validate() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(collection = %T::COLLECTION, "dropping invalid record: {e}");
            false
        }
    }
}

/// Fetch the single `T` with `id`. A missing record resolves to `None`.
pub fn singleton_fetcher<T: Record>(service: Arc<dyn DataService>, id: RecordId) -> Fetcher<Option<T>> {
    Arc::new(move |_dependencies: &[String]| {
        let service = Arc::clone(&service);
        let id = id.clone();
        async move {
            match fetch_one(service.as_ref(), T::COLLECTION, &id).await {
                Ok(record) => Ok(T::extract(&record).cloned()),
                Err(ServiceError::NotFound { .. }) => Ok(None),
                Err(e) => Err(SyncError::from(e)),
            }
        }
        .boxed()
    })
}
