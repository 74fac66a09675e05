use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use super::{ParseEnumError, normalize};

/// The four board columns a task moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Todo,
    InProgress,
    Done,
    Cancelled,
}

impl Status {
    /// All statuses in board order.
    pub const ALL: [Self; 4] = [Self::Todo, Self::InProgress, Self::Done, Self::Cancelled];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "inprogress",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the task no longer needs work (done or cancelled).
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// Task priority, ordered low < medium < high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Sort ordinal: `low = 1`, `medium = 2`, `high = 3`.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

/// A file attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub file_name: String,
    pub url: String,
    pub uploaded_by: String,
    pub created_at: DateTime<Utc>,
}

/// Time spent on a task by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLog {
    pub id: i64,
    pub user_id: String,
    pub minutes: u32,
    #[serde(default)]
    pub note: Option<String>,
    pub logged_at: DateTime<Utc>,
}

/// A comment in a task's discussion thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub author_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A task row together with its relation graph.
///
/// Realtime pushes only carry the id; the full shape (attachments, time
/// logs, comments) comes from a follow-up query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Assignee.
    pub user_id: String,
    pub created_by: String,
    #[serde(default)]
    pub project_id: Option<i64>,
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub time_logs: Vec<TimeLog>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// Error returned when a record violates a model invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRecord {
    #[error("task {id}: updated_at precedes created_at")]
    TimestampOrder { id: i64 },
    #[error("task {id}: title is empty")]
    EmptyTitle { id: i64 },
}

impl Task {
    /// Total minutes logged against this task.
    #[must_use]
    pub fn logged_minutes(&self) -> u64 {
        self.time_logs.iter().map(|log| u64::from(log.minutes)).sum()
    }

    /// Whether the due date has passed while the task is still open.
    #[must_use]
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        !self.status.is_closed() && self.due_date.is_some_and(|due| due < today)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize(s);
        match normalized.as_str() {
            "todo" => Ok(Self::Todo),
            "inprogress" | "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseEnumError {
                expected: "status",
                got: s.to_string(),
            }),
        }
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize(s);
        match normalized.as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(ParseEnumError {
                expected: "priority",
                got: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{InvalidRecord, Priority, Status, Task};
    use crate::model::Record;
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use std::str::FromStr;

    pub(crate) fn sample_task(id: i64) -> Task {
        let created = Utc
            .with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp");
        Task {
            id,
            title: format!("Task {id}"),
            description: None,
            user_id: "user-a".into(),
            created_by: "user-b".into(),
            project_id: None,
            status: Status::Todo,
            priority: Priority::Medium,
            due_date: None,
            created_at: created,
            updated_at: created,
            attachments: vec![],
            time_logs: vec![],
            comments: vec![],
        }
    }

    #[test]
    fn enum_json_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&Status::InProgress).expect("serialize"),
            "\"inprogress\""
        );
        assert_eq!(
            serde_json::from_str::<Status>("\"cancelled\"").expect("deserialize"),
            Status::Cancelled
        );
        assert_eq!(
            serde_json::to_string(&Priority::High).expect("serialize"),
            "\"high\""
        );
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!(Status::from_str(" InProgress ").expect("parse"), Status::InProgress);
        assert_eq!(Status::from_str("in_progress").expect("parse"), Status::InProgress);
        assert_eq!(Priority::from_str("HIGH").expect("parse"), Priority::High);

        let err = Status::from_str("blocked").expect_err("unknown status");
        assert_eq!(err.to_string(), "invalid status: 'blocked'");
    }

    #[test]
    fn priority_ordinals() {
        assert_eq!(Priority::Low.ordinal(), 1);
        assert_eq!(Priority::Medium.ordinal(), 2);
        assert_eq!(Priority::High.ordinal(), 3);
    }

    #[test]
    fn missing_relations_default_to_empty() {
        let json = r#"{
            "id": 9, "title": "t", "user_id": "a", "created_by": "b",
            "status": "todo", "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(json).expect("deserialize");
        assert!(task.comments.is_empty());
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.due_date, None);
    }

    #[test]
    fn validate_rejects_time_travel() {
        let mut task = sample_task(1);
        assert!(task.validate().is_ok());

        task.updated_at = task.created_at - Duration::seconds(1);
        assert_eq!(
            task.validate(),
            Err(InvalidRecord::TimestampOrder { id: 1 })
        );

        let mut untitled = sample_task(2);
        untitled.title = "   ".into();
        assert_eq!(untitled.validate(), Err(InvalidRecord::EmptyTitle { id: 2 }));
    }

    #[test]
    fn overdue_only_for_open_tasks() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).expect("date");
        let mut task = sample_task(1);
        task.due_date = NaiveDate::from_ymd_opt(2024, 5, 31);
        assert!(task.is_overdue(today));

        task.status = Status::Done;
        assert!(!task.is_overdue(today));

        task.status = Status::Todo;
        task.due_date = Some(today);
        assert!(!task.is_overdue(today));
    }
}
