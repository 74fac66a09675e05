//! Pure collection transforms applied for bus deltas.
//!
//! Every function takes the current collection by reference and returns a
//! new one; the input is never touched. Relative order of untouched
//! records is always preserved.

use std::collections::HashSet;

use crate::model::{Record, RecordId};

/// Append `record` unless a record with the same id is already present.
#[must_use]
pub fn apply_add<T: Record>(items: &[T], record: T) -> Vec<T> {
    let id = record.id();
    let mut out = items.to_vec();
    if !items.iter().any(|item| item.id() == id) {
        out.push(record);
    }
    out
}

/// Replace the record with the same id in place, or append it if absent.
#[must_use]
pub fn apply_update<T: Record>(items: &[T], record: T) -> Vec<T> {
    let id = record.id();
    let mut out = items.to_vec();
    match out.iter_mut().find(|item| item.id() == id) {
        Some(slot) => *slot = record,
        None => out.push(record),
    }
    out
}

/// Remove the record with `id`.
#[must_use]
pub fn apply_delete<T: Record>(items: &[T], id: &RecordId) -> Vec<T> {
    items
        .iter()
        .filter(|item| &item.id() != id)
        .cloned()
        .collect()
}

/// Remove every record whose id is in `ids`.
#[must_use]
pub fn apply_delete_many<T: Record>(items: &[T], ids: &[RecordId]) -> Vec<T> {
    let doomed: HashSet<&RecordId> = ids.iter().collect();
    items
        .iter()
        .filter(|item| !doomed.contains(&item.id()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{apply_add, apply_delete, apply_delete_many, apply_update};
    use crate::model::task::tests::sample_task;
    use crate::model::{RecordId, Status, Task};

    fn ids(tasks: &[Task]) -> Vec<i64> {
        tasks.iter().map(|t| t.id).collect()
    }

    #[test]
    fn add_is_idempotent_by_id() {
        let tasks = vec![sample_task(1), sample_task(2)];
        let mut dup = sample_task(2);
        dup.title = "different".into();

        let out = apply_add(&tasks, dup);
        assert_eq!(out, tasks);
        assert_eq!(ids(&apply_add(&tasks, sample_task(3))), vec![1, 2, 3]);
    }

    #[test]
    fn update_replaces_in_place_or_appends() {
        let tasks = vec![sample_task(1), sample_task(2), sample_task(3)];
        let mut moved = sample_task(2);
        moved.status = Status::InProgress;

        let out = apply_update(&tasks, moved.clone());
        assert_eq!(ids(&out), vec![1, 2, 3]);
        assert_eq!(out[1], moved);
        assert_eq!(out[0], tasks[0]);

        // Reassigned into view: not present yet, so it lands at the end.
        let out = apply_update(&tasks, sample_task(9));
        assert_eq!(ids(&out), vec![1, 2, 3, 9]);
    }

    #[test]
    fn delete_many_keeps_remaining_order() {
        let tasks: Vec<Task> = (1..=10).map(sample_task).collect();
        let doomed = [RecordId::Int(2), RecordId::Int(5), RecordId::Int(9)];

        let out = apply_delete_many(&tasks, &doomed);
        assert_eq!(ids(&out), vec![1, 3, 4, 6, 7, 8, 10]);
        assert_eq!(tasks.len(), 10);
    }

    #[test]
    fn delete_of_absent_id_is_noop() {
        let tasks = vec![sample_task(1)];
        assert_eq!(apply_delete(&tasks, &RecordId::Int(7)), tasks);
        assert!(apply_delete(&tasks, &RecordId::Int(1)).is_empty());
        // String ids never match integer-keyed records.
        assert_eq!(apply_delete(&tasks, &RecordId::from("1")), tasks);
    }
}
