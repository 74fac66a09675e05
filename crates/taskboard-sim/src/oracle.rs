use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use taskboard_core::model::{Status, Task};

/// When a view was compared against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPhase {
    /// Before any re-fetch: the view was kept current by realtime deltas alone.
    Realtime,
    /// After a foreground re-fetch.
    Refetch,
}

/// One difference between a session's view and the rows it should see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Divergence {
    /// A visible server row is absent from the view.
    Missing {
        user_id: String,
        task_id: i64,
        phase: CheckPhase,
    },
    /// The view holds a task the server does not show this user.
    Unexpected {
        user_id: String,
        task_id: i64,
        phase: CheckPhase,
    },
    /// Both hold the task but the contents differ.
    Stale {
        user_id: String,
        task_id: i64,
        phase: CheckPhase,
        expected_status: Status,
        observed_status: Status,
    },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing {
                user_id,
                task_id,
                phase,
            } => write!(f, "{phase:?}: {user_id} is missing task {task_id}"),
            Self::Unexpected {
                user_id,
                task_id,
                phase,
            } => write!(f, "{phase:?}: {user_id} still shows task {task_id}"),
            Self::Stale {
                user_id,
                task_id,
                phase,
                expected_status,
                observed_status,
            } => write!(
                f,
                "{phase:?}: {user_id} shows stale task {task_id} \
                 (status {observed_status}, server {expected_status})"
            ),
        }
    }
}

/// Compare `observed` against `expected` by task id.
#[must_use]
pub fn compare_views(
    user_id: &str,
    phase: CheckPhase,
    expected: &[Task],
    observed: &[Task],
) -> Vec<Divergence> {
    let expected: BTreeMap<i64, &Task> = expected.iter().map(|t| (t.id, t)).collect();
    let observed: BTreeMap<i64, &Task> = observed.iter().map(|t| (t.id, t)).collect();
    let mut out = Vec::new();

    for (&task_id, &want) in &expected {
        match observed.get(&task_id) {
            None => out.push(Divergence::Missing {
                user_id: user_id.to_string(),
                task_id,
                phase,
            }),
            Some(&got) if got != want => out.push(Divergence::Stale {
                user_id: user_id.to_string(),
                task_id,
                phase,
                expected_status: want.status,
                observed_status: got.status,
            }),
            Some(_) => {}
        }
    }
    out.extend(
        observed
            .keys()
            .filter(|id| !expected.contains_key(id))
            .map(|&task_id| Divergence::Unexpected {
                user_id: user_id.to_string(),
                task_id,
                phase,
            }),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::{CheckPhase, Divergence, compare_views};
    use chrono::{TimeZone, Utc};
    use taskboard_core::model::{Priority, Status, Task};

    fn task(id: i64, status: Status) -> Task {
        let at = Utc
            .with_ymd_and_hms(2024, 2, 1, 10, 0, 0)
            .single()
            .expect("valid timestamp");
        Task {
            id,
            title: format!("Task {id}"),
            description: None,
            user_id: "employee".into(),
            created_by: "manager".into(),
            project_id: None,
            status,
            priority: Priority::Medium,
            due_date: None,
            created_at: at,
            updated_at: at,
            attachments: vec![],
            time_logs: vec![],
            comments: vec![],
        }
    }

    #[test]
    fn identical_views_agree() {
        let rows = vec![task(1, Status::Todo), task(2, Status::Done)];
        assert!(compare_views("employee", CheckPhase::Realtime, &rows, &rows).is_empty());
    }

    #[test]
    fn reports_each_kind_of_difference() {
        let expected = vec![task(1, Status::Todo), task(2, Status::InProgress)];
        let observed = vec![task(2, Status::Todo), task(3, Status::Todo)];
        let found = compare_views("employee", CheckPhase::Refetch, &expected, &observed);

        assert_eq!(found.len(), 3);
        assert!(matches!(found[0], Divergence::Missing { task_id: 1, .. }));
        assert!(matches!(
            found[1],
            Divergence::Stale {
                task_id: 2,
                expected_status: Status::InProgress,
                observed_status: Status::Todo,
                ..
            }
        ));
        assert!(matches!(found[2], Divergence::Unexpected { task_id: 3, .. }));
        assert_eq!(
            found[1].to_string(),
            "Refetch: employee shows stale task 2 (status todo, server inprogress)"
        );
    }
}
