use thiserror::Error;

use crate::task::TaskState;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskState, to: TaskState },
    #[error("transport send failure: {0}")]
    TransportSendFailure(String),
    #[error("agent {identity} does not advertise capability {capability}")]
    CapabilityUnsupported {
        identity: String,
        capability: String,
    },
    #[error("no live connection for {0}")]
    OfflineTarget(String),
}

impl ControlError {
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ControlError::NotFound(_)
                | ControlError::InvalidStateTransition { .. }
                | ControlError::CapabilityUnsupported { .. }
        )
    }
}
