//! Error types for service lifecycle operations

/// Errors surfaced by the service controller and the manager gateways
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The service manager refused the connection, usually because the
    /// process is not elevated
    #[error("Permission denied: the service manager requires administrator privileges")]
    PermissionDenied,

    #[error("Service {0} already exists")]
    AlreadyExists(String),

    #[error("Service {0} is not installed")]
    NotInstalled(String),

    /// The manager does not accept the control in the current state
    /// (already stopping, or the process was not started by the manager)
    #[error("Control request rejected: {0}")]
    ControlRejected(String),

    /// Error returned by the workload's start or stop callback
    #[error(transparent)]
    Workload(anyhow::Error),

    /// Log source registration failed and the new entry was rolled back
    #[error("Event log source registration failed for {name}: {reason}")]
    LogSourceRegistration { name: String, reason: String },

    /// Log source registration failed and deleting the new entry failed too
    #[error("Event log source registration failed for {name}: {reason}; rollback of the service entry also failed: {rollback}")]
    RollbackFailed {
        name: String,
        reason: String,
        rollback: String,
    },

    /// The service entry was deleted but its log source could not be removed
    #[error("Event log source removal failed for {name}: {reason}")]
    LogSourceRemoval { name: String, reason: String },

    #[error("Process not found: {0}")]
    ProcessNotFound(u32),

    #[error("Service dispatcher failed: {0}")]
    Dispatch(String),

    #[error("Unsupported operation on this platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Service manager error: {0}")]
    Manager(String),
}

impl ServiceError {
    /// True for the rejection that the stop protocol recovers from by
    /// terminating the process
    pub fn is_control_rejection(&self) -> bool {
        matches!(self, ServiceError::ControlRejected(_))
    }
}

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_error_is_verbatim() {
        let err = ServiceError::Workload(anyhow::anyhow!("listener bind failed"));
        assert_eq!(err.to_string(), "listener bind failed");
    }

    #[test]
    fn test_rollback_message_names_both_failures() {
        let err = ServiceError::RollbackFailed {
            name: "svcA".to_string(),
            reason: "registry key already exists".to_string(),
            rollback: "marked for deletion".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("registry key already exists"));
        assert!(message.contains("marked for deletion"));
    }

    #[test]
    fn test_control_rejection_classification() {
        assert!(ServiceError::ControlRejected("stop pending".into()).is_control_rejection());
        assert!(!ServiceError::NotInstalled("svcA".into()).is_control_rejection());
    }
}
