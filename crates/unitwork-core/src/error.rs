//! Error types for unit-of-work operations.

use std::fmt;

use crate::executor::LockMode;
use crate::key::EntityKey;
use crate::value::Value;

/// Kind of work that failed, attached to execution errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    EntityInsert,
    EntityUpdate,
    EntityDelete,
    CollectionRecreate,
    CollectionUpdate,
    CollectionRemove,
    /// Explicit locking read.
    Lock,
    /// Row read for find, refresh or lazy association loading.
    Load,
}

impl ActionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ActionKind::EntityInsert => "insert",
            ActionKind::EntityUpdate => "update",
            ActionKind::EntityDelete => "delete",
            ActionKind::CollectionRecreate => "collection recreate",
            ActionKind::CollectionUpdate => "collection update",
            ActionKind::CollectionRemove => "collection remove",
            ActionKind::Lock => "lock",
            ActionKind::Load => "load",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor-neutral classification of a failed statement.
///
/// The SQL-execution facade classifies; the engine never inspects vendor
/// codes itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlErrorKind {
    /// Unique, foreign key, NOT NULL or check constraint
    ConstraintViolation,
    /// Statement rejected by the parser or planner
    Grammar,
    /// Connection lost or refused
    Connection,
    /// Statement timeout
    Timeout,
    /// Lock wait exceeded its timeout
    LockTimeout,
    /// Lock could not be acquired (NOWAIT, deadlock victim)
    LockUnavailable,
    /// Anything else
    Other,
}

/// Error reported by the SQL-execution facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub kind: SqlErrorKind,
    pub message: String,
    pub sqlstate: Option<String>,
}

impl SqlError {
    pub fn new(kind: SqlErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sqlstate: None,
        }
    }

    #[must_use]
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sqlstate {
            Some(state) => write!(f, "{:?} (SQLSTATE {}): {}", self.kind, state, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for SqlError {}

/// The primary error type for unit-of-work operations.
#[derive(Debug)]
pub enum Error {
    /// A different instance is already managed under this key
    IdentityConflict { key: EntityKey },
    /// An association points at a transient instance that will not be saved
    TransientPropertyViolation {
        entity_type: &'static str,
        property: &'static str,
        target_type: &'static str,
    },
    /// NULL in a non-nullable property
    NullProperty {
        entity_type: &'static str,
        property: &'static str,
    },
    /// The action graph has a cycle no deferred update can break
    CircularDependency { cycle: Vec<String> },
    /// An update or delete matched no row
    StaleState {
        entity_type: &'static str,
        id: Value,
        action: ActionKind,
    },
    /// Statement failure wrapped with the failing action's target
    SqlExecution {
        action: ActionKind,
        entity_type: &'static str,
        id: Option<Value>,
        source: SqlError,
    },
    /// Lock wait timed out
    LockTimeout {
        entity_type: &'static str,
        id: Value,
        mode: LockMode,
    },
    /// Lock could not be acquired
    LockAcquisition {
        entity_type: &'static str,
        id: Value,
        mode: LockMode,
        message: String,
    },
    /// Operation on an instance this context does not track
    NotManaged { entity_type: &'static str },
    /// Persist of an unmanaged instance that already has a generated id
    DetachedInstance { entity_type: &'static str, id: Value },
    /// The row or instance has been deleted
    ObjectDeleted { entity_type: &'static str, id: Value },
    /// Entity type is not registered
    UnknownEntityType(String),
    /// Entity type has no such property
    UnknownProperty {
        entity_type: &'static str,
        property: String,
    },
    /// Assigned identifier missing at persist time
    NullIdentifier { entity_type: &'static str },
    /// Metadata is inconsistent
    InvalidMetadata(String),
    /// Serialization/deserialization errors
    Serde(String),
    /// Second-level cache failure
    Cache(String),
    /// The persistence context has been closed
    ContextClosed,
}

impl Error {
    /// Whether retrying the whole unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StaleState { .. } | Error::LockTimeout { .. } => true,
            Error::SqlExecution { source, .. } => matches!(
                source.kind,
                SqlErrorKind::Timeout
                    | SqlErrorKind::Connection
                    | SqlErrorKind::LockTimeout
                    | SqlErrorKind::LockUnavailable
            ),
            Error::LockAcquisition { .. } => true,
            _ => false,
        }
    }

    /// Entity type the error concerns, if known.
    pub fn entity_type(&self) -> Option<&'static str> {
        match self {
            Error::IdentityConflict { key } => Some(key.entity_type()),
            Error::TransientPropertyViolation { entity_type, .. }
            | Error::NullProperty { entity_type, .. }
            | Error::StaleState { entity_type, .. }
            | Error::SqlExecution { entity_type, .. }
            | Error::LockTimeout { entity_type, .. }
            | Error::LockAcquisition { entity_type, .. }
            | Error::NotManaged { entity_type }
            | Error::DetachedInstance { entity_type, .. }
            | Error::ObjectDeleted { entity_type, .. }
            | Error::UnknownProperty { entity_type, .. }
            | Error::NullIdentifier { entity_type } => Some(entity_type),
            _ => None,
        }
    }

    /// Identifier of the row the error concerns, if known.
    pub fn id(&self) -> Option<&Value> {
        match self {
            Error::IdentityConflict { key } => Some(key.id()),
            Error::StaleState { id, .. }
            | Error::LockTimeout { id, .. }
            | Error::LockAcquisition { id, .. }
            | Error::DetachedInstance { id, .. }
            | Error::ObjectDeleted { id, .. } => Some(id),
            Error::SqlExecution { id, .. } => id.as_ref(),
            _ => None,
        }
    }

    /// Failing action kind for execution errors.
    pub fn action_kind(&self) -> Option<ActionKind> {
        match self {
            Error::StaleState { action, .. } | Error::SqlExecution { action, .. } => Some(*action),
            Error::LockTimeout { .. } | Error::LockAcquisition { .. } => Some(ActionKind::Lock),
            _ => None,
        }
    }

    /// Wrap a facade error with the failing action's target.
    pub fn from_sql(
        action: ActionKind,
        entity_type: &'static str,
        id: Option<Value>,
        source: SqlError,
    ) -> Self {
        Error::SqlExecution {
            action,
            entity_type,
            id,
            source,
        }
    }

    /// Map a failed locking read; lock classifications become lock errors.
    pub fn from_lock_failure(
        entity_type: &'static str,
        id: Value,
        mode: LockMode,
        source: SqlError,
    ) -> Self {
        match source.kind {
            SqlErrorKind::LockTimeout => Error::LockTimeout {
                entity_type,
                id,
                mode,
            },
            SqlErrorKind::LockUnavailable => Error::LockAcquisition {
                entity_type,
                id,
                mode,
                message: source.message,
            },
            _ => Error::from_sql(ActionKind::Lock, entity_type, Some(id), source),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IdentityConflict { key } => {
                write!(f, "Identity conflict: another instance is already managed as {key}")
            }
            Error::TransientPropertyViolation {
                entity_type,
                property,
                target_type,
            } => write!(
                f,
                "{entity_type}.{property} references an unsaved transient {target_type}; persist it or cascade persist"
            ),
            Error::NullProperty {
                entity_type,
                property,
            } => write!(f, "{entity_type}.{property} must not be null"),
            Error::CircularDependency { cycle } => {
                write!(f, "Unresolvable circular dependency: {}", cycle.join(" -> "))
            }
            Error::StaleState {
                entity_type,
                id,
                action,
            } => write!(
                f,
                "Stale state: {action} of {entity_type}#{id} affected no rows (modified or deleted concurrently)"
            ),
            Error::SqlExecution {
                action,
                entity_type,
                id,
                source,
            } => match id {
                Some(id) => write!(f, "SQL error during {action} of {entity_type}#{id}: {source}"),
                None => write!(f, "SQL error during {action} of {entity_type}: {source}"),
            },
            Error::LockTimeout {
                entity_type,
                id,
                mode,
            } => write!(f, "Timed out acquiring {mode:?} lock on {entity_type}#{id}"),
            Error::LockAcquisition {
                entity_type,
                id,
                mode,
                message,
            } => write!(f, "Could not acquire {mode:?} lock on {entity_type}#{id}: {message}"),
            Error::NotManaged { entity_type } => {
                write!(f, "{entity_type} instance is not managed by this context")
            }
            Error::DetachedInstance { entity_type, id } => {
                write!(f, "Detached {entity_type}#{id} passed to persist; use merge")
            }
            Error::ObjectDeleted { entity_type, id } => {
                write!(f, "{entity_type}#{id} has been deleted")
            }
            Error::UnknownEntityType(name) => write!(f, "Unknown entity type '{name}'"),
            Error::UnknownProperty {
                entity_type,
                property,
            } => write!(f, "Entity type {entity_type} has no property '{property}'"),
            Error::NullIdentifier { entity_type } => {
                write!(f, "{entity_type} uses assigned identifiers but its id is null")
            }
            Error::InvalidMetadata(msg) => write!(f, "Invalid metadata: {msg}"),
            Error::Serde(msg) => write!(f, "Serialization error: {msg}"),
            Error::Cache(msg) => write!(f, "Cache error: {msg}"),
            Error::ContextClosed => write!(f, "Persistence context is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SqlExecution { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for unit-of-work operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::StaleState {
            entity_type: "Person",
            id: Value::BigInt(1),
            action: ActionKind::EntityUpdate,
        };
        assert_eq!(
            err.to_string(),
            "Stale state: update of Person#1 affected no rows (modified or deleted concurrently)"
        );

        let err = Error::CircularDependency {
            cycle: vec!["insert A@1".into(), "insert B@2".into()],
        };
        assert!(err.to_string().contains("insert A@1 -> insert B@2"));
    }

    #[test]
    fn test_sql_execution_context_and_source() {
        let err = Error::from_sql(
            ActionKind::EntityInsert,
            "Child",
            None,
            SqlError::new(SqlErrorKind::ConstraintViolation, "NOT NULL child.parent_id")
                .with_sqlstate("23502"),
        );
        assert_eq!(err.entity_type(), Some("Child"));
        assert_eq!(err.action_kind(), Some(ActionKind::EntityInsert));
        assert!(err.id().is_none());
        assert!(!err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("SQLSTATE 23502"));
    }

    #[test]
    fn test_is_retryable() {
        let stale = Error::StaleState {
            entity_type: "Person",
            id: Value::BigInt(1),
            action: ActionKind::EntityDelete,
        };
        assert!(stale.is_retryable());

        let timeout = Error::from_sql(
            ActionKind::EntityUpdate,
            "Person",
            Some(Value::BigInt(1)),
            SqlError::new(SqlErrorKind::Timeout, "statement timeout"),
        );
        assert!(timeout.is_retryable());
        assert_eq!(timeout.id(), Some(&Value::BigInt(1)));

        assert!(!Error::ContextClosed.is_retryable());
        assert!(!Error::NullIdentifier { entity_type: "Tag" }.is_retryable());
    }

    #[test]
    fn test_lock_errors_report_lock_action() {
        let err = Error::LockTimeout {
            entity_type: "Account",
            id: Value::BigInt(3),
            mode: LockMode::PessimisticWrite,
        };
        assert_eq!(err.action_kind(), Some(ActionKind::Lock));
        assert_eq!(err.entity_type(), Some("Account"));

        let err = Error::from_lock_failure(
            "Account",
            Value::BigInt(3),
            LockMode::PessimisticWrite,
            SqlError::new(SqlErrorKind::LockUnavailable, "row locked"),
        );
        assert!(matches!(err, Error::LockAcquisition { ref message, .. } if message == "row locked"));

        let err = Error::from_lock_failure(
            "Account",
            Value::BigInt(3),
            LockMode::PessimisticRead,
            SqlError::new(SqlErrorKind::Connection, "reset"),
        );
        assert!(matches!(
            err,
            Error::SqlExecution {
                action: ActionKind::Lock,
                ..
            }
        ));
    }
}
