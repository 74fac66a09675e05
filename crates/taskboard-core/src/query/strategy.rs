//! Per-query cache strategies.
//!
//! The strategy is chosen where the query is mounted: a
//! [`CollectionCache`] patches its `Vec` in place from bus deltas, a
//! [`SingletonCache`] re-fetches on every signal.

use std::fmt::Debug;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::delta::{apply_add, apply_delete, apply_delete_many, apply_update};
use crate::bus::{ChangePayload, DataChange};
use crate::model::{AnyRecord, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Collection,
    Singleton,
}

/// What a strategy wants done with a bus signal.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome<D> {
    /// Replace the held data with this value.
    Applied(D),
    /// Nothing to do.
    Ignored,
    /// Re-fetch in the background without a loading indicator.
    Refetch,
}

pub trait CacheStrategy: Send + Sync + 'static {
    type Data: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    const KIND: CacheKind;

    /// Value held before the first fetch and after a reset.
    fn empty() -> Self::Data;

    fn apply(data: &Self::Data, change: &DataChange) -> DeltaOutcome<Self::Data>;
}

/// Ordered collection of `T`, kept current by delta application.
#[derive(Debug)]
pub struct CollectionCache<T>(PhantomData<fn() -> T>);

impl<T: Record> CacheStrategy for CollectionCache<T> {
    type Data = Vec<T>;

    const KIND: CacheKind = CacheKind::Collection;

    fn empty() -> Self::Data {
        Vec::new()
    }

    fn apply(data: &Self::Data, change: &DataChange) -> DeltaOutcome<Self::Data> {
        if !change.concerns(T::COLLECTION) {
            return DeltaOutcome::Ignored;
        }

        match &change.payload {
            ChangePayload::Add(record) => match T::extract(record) {
                Some(item) if data.iter().any(|held| held.id() == item.id()) => {
                    DeltaOutcome::Ignored
                }
                Some(item) => DeltaOutcome::Applied(apply_add(data, item.clone())),
                None => DeltaOutcome::Ignored,
            },
            ChangePayload::Update(record) => T::extract(record).map_or(DeltaOutcome::Ignored, |item| {
                DeltaOutcome::Applied(apply_update(data, item.clone()))
            }),
            ChangePayload::ProfileChange(profile) => {
                let record = AnyRecord::Profiles(profile.clone());
                T::extract(&record).map_or(DeltaOutcome::Ignored, |item| {
                    DeltaOutcome::Applied(apply_update(data, item.clone()))
                })
            }
            ChangePayload::Delete { id, .. } => removal(data, apply_delete(data, id)),
            ChangePayload::DeleteMany { ids, .. } => removal(data, apply_delete_many(data, ids)),
            ChangePayload::BatchUpdate { .. } => DeltaOutcome::Refetch,
        }
    }
}

/// A delete that matched nothing leaves the data (and its cache entry) alone.
fn removal<T>(before: &[T], after: Vec<T>) -> DeltaOutcome<Vec<T>> {
    if after.len() == before.len() {
        DeltaOutcome::Ignored
    } else {
        DeltaOutcome::Applied(after)
    }
}

/// A single resource such as the signed-in user's profile.
#[derive(Debug)]
pub struct SingletonCache<T>(PhantomData<fn() -> T>);

impl<T: Record> CacheStrategy for SingletonCache<T> {
    type Data = Option<T>;

    const KIND: CacheKind = CacheKind::Singleton;

    fn empty() -> Self::Data {
        None
    }

    fn apply(_data: &Self::Data, _change: &DataChange) -> DeltaOutcome<Self::Data> {
        DeltaOutcome::Refetch
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheKind, CacheStrategy, CollectionCache, DeltaOutcome, SingletonCache};
    use crate::bus::{ChangePayload, DataChange};
    use crate::model::task::tests::sample_task;
    use crate::model::{CollectionName, Notification, Profile, Record, RecordId, Task};

    fn change(payload: ChangePayload) -> DataChange {
        DataChange {
            payload,
            timestamp: 0,
            seq: 1,
        }
    }

    #[test]
    fn collection_ignores_other_tables() {
        let data = vec![sample_task(1)];
        let outcome = <CollectionCache<Notification>>::apply(
            &Vec::new(),
            &change(ChangePayload::Add(sample_task(2).into_any())),
        );
        assert_eq!(outcome, DeltaOutcome::Ignored);

        let outcome = <CollectionCache<Task>>::apply(
            &data,
            &change(ChangePayload::Delete {
                table: CollectionName::Notifications,
                id: RecordId::Int(1),
            }),
        );
        assert_eq!(outcome, DeltaOutcome::Ignored);
    }

    #[test]
    fn duplicate_add_is_ignored() {
        let data = vec![sample_task(1)];
        let outcome =
            <CollectionCache<Task>>::apply(&data, &change(ChangePayload::Add(sample_task(1).into_any())));
        assert_eq!(outcome, DeltaOutcome::Ignored);
    }

    #[test]
    fn batch_update_refetches_for_own_or_any_table() {
        let data = vec![sample_task(1)];
        for table in [Some(CollectionName::Tasks), None] {
            let outcome = <CollectionCache<Task>>::apply(
                &data,
                &change(ChangePayload::BatchUpdate {
                    reason: "import".into(),
                    table,
                }),
            );
            assert_eq!(outcome, DeltaOutcome::Refetch);
        }
    }

    #[test]
    fn delete_applies_against_given_data() {
        let data = vec![sample_task(1), sample_task(2)];
        let outcome = <CollectionCache<Task>>::apply(
            &data,
            &change(ChangePayload::Delete {
                table: CollectionName::Tasks,
                id: RecordId::Int(1),
            }),
        );
        assert_eq!(outcome, DeltaOutcome::Applied(vec![sample_task(2)]));
    }

    #[test]
    fn delete_of_unknown_ids_is_ignored() {
        let data = vec![sample_task(1), sample_task(2)];
        let outcome = <CollectionCache<Task>>::apply(
            &data,
            &change(ChangePayload::Delete {
                table: CollectionName::Tasks,
                id: RecordId::Int(7),
            }),
        );
        assert_eq!(outcome, DeltaOutcome::Ignored);

        let outcome = <CollectionCache<Task>>::apply(
            &data,
            &change(ChangePayload::DeleteMany {
                table: CollectionName::Tasks,
                ids: vec![RecordId::Int(7), RecordId::Int(8)],
            }),
        );
        assert_eq!(outcome, DeltaOutcome::Ignored);

        let outcome = <CollectionCache<Task>>::apply(
            &data,
            &change(ChangePayload::DeleteMany {
                table: CollectionName::Tasks,
                ids: vec![RecordId::Int(2), RecordId::Int(8)],
            }),
        );
        assert_eq!(outcome, DeltaOutcome::Applied(vec![sample_task(1)]));
    }

    #[test]
    fn singleton_always_refetches() {
        assert_eq!(<SingletonCache<Profile>>::KIND, CacheKind::Singleton);
        assert_eq!(<SingletonCache<Profile>>::empty(), None);
        let outcome = <SingletonCache<Profile>>::apply(
            &None,
            &change(ChangePayload::Delete {
                table: CollectionName::Tasks,
                id: RecordId::Int(1),
            }),
        );
        assert_eq!(outcome, DeltaOutcome::Refetch);
    }
}
