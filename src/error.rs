use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatFlowError>;

#[derive(Debug, Error)]
pub enum ChatFlowError {
    #[error("flow `{0}` not registered")]
    FlowNotRegistered(String),
    #[error("unknown step `{step}` in flow `{flow}`")]
    UnknownStep { flow: String, step: String },
    #[error("invalid flow `{flow}`: {reason}")]
    InvalidFlow { flow: String, reason: String },
    #[error("action `{0}` not registered")]
    ActionNotRegistered(String),
    #[error("action `{action}` failed: {message}")]
    Action { action: String, message: String },
    #[error("template error: {0}")]
    Template(String),
    #[error("state store error: {0}")]
    Store(String),
    #[error("timed out waiting for lock on contact `{0}`")]
    LockTimeout(String),
    #[error("step budget of {0} exceeded")]
    StepBudgetExceeded(u32),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatFlowError {
    pub fn invalid_flow(flow: impl Into<String>, reason: impl Into<String>) -> Self {
        ChatFlowError::InvalidFlow {
            flow: flow.into(),
            reason: reason.into(),
        }
    }

    pub fn action(action: impl Into<String>, message: impl Into<String>) -> Self {
        ChatFlowError::Action {
            action: action.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for ChatFlowError {
    fn from(err: serde_json::Error) -> Self {
        ChatFlowError::Serialization(err.to_string())
    }
}

impl From<minijinja::Error> for ChatFlowError {
    fn from(err: minijinja::Error) -> Self {
        ChatFlowError::Template(err.to_string())
    }
}
