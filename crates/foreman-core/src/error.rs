use thiserror::Error;

/// A convenience `Result` alias using [`ForemanError`].
pub type ForemanResult<T> = Result<T, ForemanError>;

/// Top-level error type for the foreman dispatcher.
///
/// Variants follow the dispatch taxonomy: transient claim conflicts, caller
/// errors (unknown ids, illegal transitions), creation-time graph errors, and
/// storage failures.
#[derive(Debug, Error)]
pub enum ForemanError {
    /// The task was claimed by another caller between selection and assignment.
    #[error("Assignment conflict: task {task_id} is no longer claimable")]
    AssignmentConflict {
        /// The task that could not be claimed.
        task_id: String,
    },

    /// No task exists with the given id.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// No agent exists with the given id.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// The requested state change is not legal from the entity's current state.
    #[error("Invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        /// Entity kind (`task` or `agent`).
        entity: &'static str,
        /// Entity id.
        id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// An entity with this id is already stored.
    #[error("Duplicate id: {0}")]
    Duplicate(String),

    /// Creating the task would introduce a dependency cycle.
    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// The persistence layer failed or is unreachable.
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from the orchestrator loop itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),
}

impl ForemanError {
    /// Builds an [`ForemanError::InvalidTransition`] from displayable states.
    pub fn invalid_transition(
        entity: &'static str,
        id: impl ToString,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        ForemanError::InvalidTransition {
            entity,
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Conflicts are resolved locally by re-selecting; they never reach callers of the loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, ForemanError::AssignmentConflict { .. })
    }

    /// True for storage failures, which the loop answers with backoff.
    pub fn is_persistence(&self) -> bool {
        matches!(self, ForemanError::PersistenceUnavailable(_))
    }

    /// True for errors caused by the caller (unknown ids, illegal transitions).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ForemanError::TaskNotFound(_)
                | ForemanError::AgentNotFound(_)
                | ForemanError::InvalidTransition { .. }
                | ForemanError::DependencyCycle(_)
                | ForemanError::Duplicate(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let conflict = ForemanError::AssignmentConflict {
            task_id: "t1".into(),
        };
        assert!(conflict.is_transient());
        assert!(!conflict.is_caller_error());

        let missing = ForemanError::TaskNotFound("t2".into());
        assert!(missing.is_caller_error());
        assert!(!missing.is_persistence());

        let storage = ForemanError::PersistenceUnavailable("disk I/O".into());
        assert!(storage.is_persistence());
        assert!(!storage.is_transient());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = ForemanError::invalid_transition("task", "abc", "COMPLETED", "RUNNING");
        assert_eq!(
            err.to_string(),
            "Invalid transition for task abc: COMPLETED -> RUNNING"
        );
    }

    #[test]
    fn test_cycle_message_joins_path() {
        let err = ForemanError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }
}
