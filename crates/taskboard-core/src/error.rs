use std::fmt;

use crate::model::{CollectionName, RecordId};
use crate::service::ServiceError;

/// Machine-readable error codes for logs and UI error surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotAuthenticated,
    ConfigParseError,
    RecordNotFound,
    PermissionDenied,
    InvalidEnumValue,
    MissingRelation,
    TransientNetwork,
    SubscriptionRejected,
    CacheSerialization,
    CacheStorage,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotAuthenticated => "E1001",
            Self::ConfigParseError => "E1002",
            Self::RecordNotFound => "E2001",
            Self::PermissionDenied => "E2002",
            Self::InvalidEnumValue => "E2003",
            Self::MissingRelation => "E3001",
            Self::TransientNetwork => "E4001",
            Self::SubscriptionRejected => "E4002",
            Self::CacheSerialization => "E5001",
            Self::CacheStorage => "E5002",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and error banners.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotAuthenticated => "Not signed in",
            Self::ConfigParseError => "Config file parse error",
            Self::RecordNotFound => "Record not found",
            Self::PermissionDenied => "Permission denied",
            Self::InvalidEnumValue => "Invalid status/priority/role value",
            Self::MissingRelation => "Record relations could not be loaded",
            Self::TransientNetwork => "Network request failed",
            Self::SubscriptionRejected => "Realtime subscription rejected",
            Self::CacheSerialization => "Cache entry could not be (de)serialized",
            Self::CacheStorage => "Local cache storage failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to the user.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotAuthenticated => Some("Sign in before loading board data."),
            Self::ConfigParseError => Some("Fix syntax in .taskboard/config.toml and retry."),
            Self::RecordNotFound => None,
            Self::PermissionDenied => {
                Some("Only the task creator or a manager can perform this action.")
            }
            Self::InvalidEnumValue => Some("Use one of the documented status/priority values."),
            Self::MissingRelation | Self::TransientNetwork => {
                Some("Data will refresh automatically once the connection recovers.")
            }
            Self::SubscriptionRejected => Some("Live updates will retry in the background."),
            Self::CacheSerialization | Self::CacheStorage => {
                Some("The local cache is bypassed; data is loaded from the server.")
            }
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by the sync core to its consumers.
///
/// Cloneable so the last error can sit inside a shared query state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("{collection} record {id} not found")]
    NotFound {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("relations for {collection} record {id} could not be loaded")]
    MissingRelation {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("cache storage failed: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transient(_) => ErrorCode::TransientNetwork,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::NotFound { .. } => ErrorCode::RecordNotFound,
            Self::MissingRelation { .. } => ErrorCode::MissingRelation,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::Serialization(_) => ErrorCode::CacheSerialization,
            Self::Storage(_) => ErrorCode::CacheStorage,
            Self::Config(_) => ErrorCode::ConfigParseError,
        }
    }

    /// Whether retrying later (next staleness check, resubscribe) can help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::MissingRelation { .. })
    }
}

impl From<ServiceError> for SyncError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(msg) | ServiceError::Malformed(msg) => Self::Transient(msg),
            ServiceError::PermissionDenied(msg) => Self::PermissionDenied(msg),
            ServiceError::NotFound { collection, id } => Self::NotFound { collection, id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, SyncError};
    use crate::model::{CollectionName, RecordId};
    use crate::service::ServiceError;
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::NotAuthenticated,
            ErrorCode::ConfigParseError,
            ErrorCode::RecordNotFound,
            ErrorCode::PermissionDenied,
            ErrorCode::InvalidEnumValue,
            ErrorCode::MissingRelation,
            ErrorCode::TransientNetwork,
            ErrorCode::SubscriptionRejected,
            ErrorCode::CacheSerialization,
            ErrorCode::CacheStorage,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::PermissionDenied.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn service_errors_map_to_taxonomy() {
        let denied: SyncError = ServiceError::PermissionDenied("not owner".into()).into();
        assert_eq!(denied.code(), ErrorCode::PermissionDenied);
        assert!(!denied.is_transient());

        let offline: SyncError = ServiceError::Unavailable("timeout".into()).into();
        assert!(offline.is_transient());

        let missing: SyncError = ServiceError::NotFound {
            collection: CollectionName::Tasks,
            id: RecordId::Int(4),
        }
        .into();
        assert_eq!(missing.to_string(), "tasks record 4 not found");
    }
}
