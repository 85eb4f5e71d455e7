use thiserror::Error;

pub type Result<T> = std::result::Result<T, RustAclError>;

#[derive(Error, Debug)]
pub enum RustAclError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("No consumer registered for entity type {0}")]
    UnregisteredEntityType(String),

    #[error("Unexpected entity: expected {expected}, found {found}")]
    UnexpectedEntity {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Fan-out task failed for role assignment {assignment_id}: {source}")]
    TaskFailed {
        assignment_id: String,
        #[source]
        source: Box<RustAclError>,
    },

    #[error("Fan-out task aborted: {0}")]
    TaskAborted(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl RustAclError {
    /// Duplicate key and duplicate field failures mean the idempotent write
    /// already landed.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            RustAclError::DuplicateKey(_) => true,
            RustAclError::TaskFailed { source, .. } => source.is_duplicate_key(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_key_classification() {
        assert!(RustAclError::DuplicateKey("E11000".to_string()).is_duplicate_key());
        assert!(!RustAclError::Store("timeout".to_string()).is_duplicate_key());

        let wrapped = RustAclError::TaskFailed {
            assignment_id: "ra-1".to_string(),
            source: Box::new(RustAclError::DuplicateKey("dup".to_string())),
        };
        assert!(wrapped.is_duplicate_key());
    }

    #[test]
    fn test_task_failure_message_names_assignment() {
        let err = RustAclError::TaskFailed {
            assignment_id: "ra-7".to_string(),
            source: Box::new(RustAclError::Store("write rejected".to_string())),
        };
        let message = err.to_string();
        assert!(message.contains("ra-7"));
        assert!(message.contains("write rejected"));
    }
}
