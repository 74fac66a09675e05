use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{InvalidRecord, Notification, ParseEnumError, Profile, Project, Task};

/// Identity of a record within its collection.
///
/// The data service keys tasks, notifications and projects by integer and
/// profiles by string (the auth user id), so both shapes are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Str(String),
}

impl RecordId {
    /// Integer form of the id, if it has one.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Str(_) => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// The server-held collections mirrored by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionName {
    Tasks,
    Notifications,
    Profiles,
    Projects,
}

impl CollectionName {
    /// All collections in a stable order.
    pub const ALL: [Self; 4] = [
        Self::Tasks,
        Self::Notifications,
        Self::Profiles,
        Self::Projects,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tasks => "tasks",
            Self::Notifications => "notifications",
            Self::Profiles => "profiles",
            Self::Projects => "projects",
        }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionName {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tasks" => Ok(Self::Tasks),
            "notifications" => Ok(Self::Notifications),
            "profiles" => Ok(Self::Profiles),
            "projects" => Ok(Self::Projects),
            _ => Err(ParseEnumError {
                expected: "collection",
                got: s.to_string(),
            }),
        }
    }
}

/// A record of any mirrored collection.
///
/// This is what crosses the data service boundary and what rides on the
/// change bus; typed consumers pull their own kind out with
/// [`Record::extract`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "record", rename_all = "lowercase")]
pub enum AnyRecord {
    Tasks(Task),
    Notifications(Notification),
    Profiles(Profile),
    Projects(Project),
}

impl AnyRecord {
    #[must_use]
    pub const fn collection(&self) -> CollectionName {
        match self {
            Self::Tasks(_) => CollectionName::Tasks,
            Self::Notifications(_) => CollectionName::Notifications,
            Self::Profiles(_) => CollectionName::Profiles,
            Self::Projects(_) => CollectionName::Projects,
        }
    }

    #[must_use]
    pub fn id(&self) -> RecordId {
        match self {
            Self::Tasks(r) => r.id(),
            Self::Notifications(r) => r.id(),
            Self::Profiles(r) => r.id(),
            Self::Projects(r) => r.id(),
        }
    }

    pub fn validate(&self) -> Result<(), InvalidRecord> {
        match self {
            Self::Tasks(r) => r.validate(),
            Self::Notifications(r) => r.validate(),
            Self::Profiles(r) => r.validate(),
            Self::Projects(r) => r.validate(),
        }
    }
}

/// A typed row of one mirrored collection.
pub trait Record:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The collection this record type lives in.
    const COLLECTION: CollectionName;

    /// Unique id within [`Self::COLLECTION`].
    fn id(&self) -> RecordId;

    /// Borrow `Self` out of an [`AnyRecord`] of the matching collection.
    fn extract(record: &AnyRecord) -> Option<&Self>;

    fn into_any(self) -> AnyRecord;

    /// Check the invariants the data service is expected to uphold.
    fn validate(&self) -> Result<(), InvalidRecord> {
        Ok(())
    }
}

impl Record for Task {
    const COLLECTION: CollectionName = CollectionName::Tasks;

    fn id(&self) -> RecordId {
        RecordId::Int(self.id)
    }

    fn extract(record: &AnyRecord) -> Option<&Self> {
        match record {
            AnyRecord::Tasks(task) => Some(task),
            _ => None,
        }
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Tasks(self)
    }

    fn validate(&self) -> Result<(), InvalidRecord> {
        if self.title.trim().is_empty() {
            return Err(InvalidRecord::EmptyTitle { id: self.id });
        }
        if self.updated_at < self.created_at {
            return Err(InvalidRecord::TimestampOrder { id: self.id });
        }
        Ok(())
    }
}

impl Record for Notification {
    const COLLECTION: CollectionName = CollectionName::Notifications;

    fn id(&self) -> RecordId {
        RecordId::Int(self.id)
    }

    fn extract(record: &AnyRecord) -> Option<&Self> {
        match record {
            AnyRecord::Notifications(n) => Some(n),
            _ => None,
        }
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Notifications(self)
    }
}

impl Record for Profile {
    const COLLECTION: CollectionName = CollectionName::Profiles;

    fn id(&self) -> RecordId {
        RecordId::Str(self.id.clone())
    }

    fn extract(record: &AnyRecord) -> Option<&Self> {
        match record {
            AnyRecord::Profiles(p) => Some(p),
            _ => None,
        }
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Profiles(self)
    }
}

impl Record for Project {
    const COLLECTION: CollectionName = CollectionName::Projects;

    fn id(&self) -> RecordId {
        RecordId::Int(self.id)
    }

    fn extract(record: &AnyRecord) -> Option<&Self> {
        match record {
            AnyRecord::Projects(p) => Some(p),
            _ => None,
        }
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Projects(self)
    }
}
