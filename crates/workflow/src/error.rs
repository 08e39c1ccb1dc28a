use thiserror::Error;

/// Configuration errors: fail fast, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("Unknown workflow key: {0}")]
    UnknownWorkflow(String),

    #[error("Unknown step key: {0}")]
    UnknownStep(String),

    #[error("Invalid job_config: {0}")]
    InvalidJobConfig(String),

    #[error("Invalid config for step '{step_id}': {message}")]
    InvalidStepConfig { step_id: String, message: String },
}

/// Failure reported by an external collaborator (search, LLM, messaging, …).
///
/// The message is inspected by the executor's transient-error heuristic, so
/// implementations should keep upstream status text (e.g. "429 rate limited").
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl ServiceError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Error escaping a step body; the executor turns it into a FAILURE result.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Config(#[from] WorkflowError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
