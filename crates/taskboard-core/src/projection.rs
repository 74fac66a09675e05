//! Derived views over a task collection.
//!
//! Everything here is a pure function of its inputs: no I/O, no errors, and
//! the input slice is never modified. Views recompute from scratch on every
//! change; collections are small enough that incremental maintenance is not
//! worth it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::{Notification, Priority, Status, Task};

/// Board filter. `None` fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilters {
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub created_by: Option<String>,
    pub project_id: Option<i64>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Title,
    Status,
    Priority,
    DueDate,
    #[default]
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SortConfig {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortConfig {
    #[must_use]
    pub const fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }
}

/// How a search term is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SearchTerm {
    Id(i64),
    Text(String),
}

impl SearchTerm {
    fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let numeric = trimmed.chars().all(|c| c.is_ascii_digit());
        match trimmed.parse::<i64>() {
            Ok(id) if numeric => Some(Self::Id(id)),
            _ => Some(Self::Text(trimmed.to_lowercase())),
        }
    }

    fn matches(&self, task: &Task) -> bool {
        match self {
            Self::Id(id) => task.id == *id,
            Self::Text(needle) => {
                task.title.to_lowercase().contains(needle)
                    || task
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(needle))
                    || task
                        .comments
                        .iter()
                        .any(|c| c.body.to_lowercase().contains(needle))
            }
        }
    }
}

#[must_use]
pub fn filter_tasks(tasks: &[Task], filters: &TaskFilters) -> Vec<Task> {
    let search = filters.search.as_deref().and_then(SearchTerm::parse);
    tasks
        .iter()
        .filter(|task| filters.status.is_none_or(|s| task.status == s))
        .filter(|task| filters.priority.is_none_or(|p| task.priority == p))
        .filter(|task| {
            filters
                .assignee
                .as_deref()
                .is_none_or(|a| task.user_id == a)
        })
        .filter(|task| {
            filters
                .created_by
                .as_deref()
                .is_none_or(|c| task.created_by == c)
        })
        .filter(|task| {
            filters
                .project_id
                .is_none_or(|p| task.project_id == Some(p))
        })
        .filter(|task| search.as_ref().is_none_or(|term| term.matches(task)))
        .cloned()
        .collect()
}

fn date_millis(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map_or(0, |dt| dt.and_utc().timestamp_millis())
}

/// Compare optional keys so that missing values sit at the end of the
/// current direction: last when ascending, first when descending.
fn compare_nullable<K: Ord>(a: Option<K>, b: Option<K>, direction: SortDirection) -> Ordering {
    match (a, b, direction) {
        (Some(a), Some(b), SortDirection::Asc) => a.cmp(&b),
        (Some(a), Some(b), SortDirection::Desc) => b.cmp(&a),
        (None, None, _) => Ordering::Equal,
        (None, Some(_), SortDirection::Asc) | (Some(_), None, SortDirection::Desc) => {
            Ordering::Greater
        }
        (None, Some(_), SortDirection::Desc) | (Some(_), None, SortDirection::Asc) => {
            Ordering::Less
        }
    }
}

fn directed(ordering: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Asc => ordering,
        SortDirection::Desc => ordering.reverse(),
    }
}

/// Stable sort by `config`.
#[must_use]
pub fn sort_tasks(tasks: &[Task], config: &SortConfig) -> Vec<Task> {
    let mut sorted = tasks.to_vec();
    let direction = config.direction;
    sorted.sort_by(|a, b| match config.field {
        SortField::Title => directed(a.title.to_lowercase().cmp(&b.title.to_lowercase()), direction),
        SortField::Status => directed(a.status.cmp(&b.status), direction),
        SortField::Priority => directed(a.priority.ordinal().cmp(&b.priority.ordinal()), direction),
        SortField::DueDate => compare_nullable(
            a.due_date.map(date_millis),
            b.due_date.map(date_millis),
            direction,
        ),
        SortField::CreatedAt => directed(
            a.created_at.timestamp_millis().cmp(&b.created_at.timestamp_millis()),
            direction,
        ),
        SortField::UpdatedAt => directed(
            a.updated_at.timestamp_millis().cmp(&b.updated_at.timestamp_millis()),
            direction,
        ),
    });
    sorted
}

/// Board columns. Every status has an entry, possibly empty.
#[must_use]
pub fn group_by_status(tasks: &[Task]) -> BTreeMap<Status, Vec<Task>> {
    let mut groups: BTreeMap<Status, Vec<Task>> =
        Status::ALL.iter().map(|&s| (s, Vec::new())).collect();
    for task in tasks {
        groups.entry(task.status).or_default().push(task.clone());
    }
    groups
}

/// Calendar buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueDateGroups {
    pub dated: BTreeMap<NaiveDate, Vec<Task>>,
    pub undated: Vec<Task>,
}

#[must_use]
pub fn group_by_due_date(tasks: &[Task]) -> DueDateGroups {
    let mut groups = DueDateGroups::default();
    for task in tasks {
        match task.due_date {
            Some(date) => groups.dated.entry(date).or_default().push(task.clone()),
            None => groups.undated.push(task.clone()),
        }
    }
    groups
}

/// Dashboard counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub total: usize,
    pub by_status: BTreeMap<Status, usize>,
    pub overdue: usize,
    pub high_priority_open: usize,
    pub logged_minutes: u64,
}

#[must_use]
pub fn summarize(tasks: &[Task], today: NaiveDate) -> TaskSummary {
    let mut summary = TaskSummary {
        total: tasks.len(),
        by_status: Status::ALL.iter().map(|&s| (s, 0)).collect(),
        ..TaskSummary::default()
    };
    for task in tasks {
        *summary.by_status.entry(task.status).or_default() += 1;
        if task.is_overdue(today) {
            summary.overdue += 1;
        }
        if task.priority == Priority::High && !task.status.is_closed() {
            summary.high_priority_open += 1;
        }
        summary.logged_minutes += task.logged_minutes();
    }
    summary
}

#[must_use]
pub fn unread_count(notifications: &[Notification]) -> usize {
    notifications.iter().filter(|n| !n.read).count()
}
