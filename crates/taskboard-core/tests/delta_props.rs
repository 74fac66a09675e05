use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use taskboard_core::model::{Priority, Record, RecordId, Status, Task};
use taskboard_core::query::delta::{apply_add, apply_delete_many, apply_update};

fn task(id: i64, status: Status) -> Task {
    let created = Utc
        .with_ymd_and_hms(2024, 1, 15, 12, 0, 0)
        .single()
        .expect("valid timestamp");
    Task {
        id,
        title: format!("Task {id}"),
        description: None,
        user_id: "user-a".into(),
        created_by: "user-b".into(),
        project_id: None,
        status,
        priority: Priority::Low,
        due_date: None,
        created_at: created,
        updated_at: created,
        attachments: vec![],
        time_logs: vec![],
        comments: vec![],
    }
}

fn arb_status() -> impl Strategy<Value = Status> {
    prop::sample::select(Status::ALL.to_vec())
}

/// A collection with unique ids, in arbitrary order.
fn arb_tasks() -> impl Strategy<Value = Vec<Task>> {
    prop::collection::btree_set(0_i64..64, 0..24)
        .prop_flat_map(|ids| {
            let ids: Vec<i64> = ids.into_iter().collect();
            let len = ids.len();
            (
                Just(ids).prop_shuffle(),
                prop::collection::vec(arb_status(), len),
            )
        })
        .prop_map(|(ids, statuses)| {
            ids.into_iter()
                .zip(statuses)
                .map(|(id, status)| task(id, status))
                .collect()
        })
}

fn ids(tasks: &[Task]) -> Vec<i64> {
    tasks.iter().map(|t| t.id).collect()
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(512))]

    #[test]
    fn add_is_idempotent(items in arb_tasks(), id in 0_i64..80, status in arb_status()) {
        let once = apply_add(&items, task(id, status));
        let twice = apply_add(&once, task(id, status));
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once.iter().filter(|t| t.id == id).count(), 1);
    }

    #[test]
    fn update_replaces_in_place_or_appends(
        items in arb_tasks(),
        id in 0_i64..80,
        status in arb_status(),
    ) {
        let existed = items.iter().position(|t| t.id == id);
        let updated = apply_update(&items, task(id, status));

        match existed {
            Some(index) => {
                prop_assert_eq!(updated.len(), items.len());
                prop_assert_eq!(updated[index].status, status);
                prop_assert_eq!(ids(&updated), ids(&items));
            }
            None => {
                prop_assert_eq!(updated.len(), items.len() + 1);
                prop_assert_eq!(updated.last().map(|t| t.id), Some(id));
            }
        }
    }

    #[test]
    fn delete_many_removes_exactly_the_listed_ids(
        items in arb_tasks(),
        doomed in prop::collection::btree_set(0_i64..64, 0..16),
    ) {
        let listed: Vec<RecordId> = doomed.iter().map(|&id| RecordId::Int(id)).collect();
        let remaining = apply_delete_many(&items, &listed);

        let expected: Vec<i64> = ids(&items)
            .into_iter()
            .filter(|id| !doomed.contains(id))
            .collect();
        prop_assert_eq!(ids(&remaining), expected);

        let left: BTreeSet<RecordId> = remaining.iter().map(Record::id).collect();
        prop_assert!(listed.iter().all(|id| !left.contains(id)));
    }
}
