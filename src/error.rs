use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::Priority;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid target {input:?}: {reason}")]
    InvalidTarget { input: String, reason: String },

    #[error("Job queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {0} was cancelled before dispatch")]
    JobCancelled(Uuid),

    #[error("Agent {agent_id} unavailable: {reason}")]
    AgentUnavailable { agent_id: u64, reason: String },

    #[error("No handlers available")]
    NoHandlersAvailable,

    #[error("No eligible handler for {priority} job")]
    NoEligibleHandler { priority: Priority },

    #[error("Agent {0} is busy")]
    HandlerBusy(u64),

    #[error("Job priority {priority} is below agent {agent_id} floor {floor}")]
    PriorityBelowFloor {
        agent_id: u64,
        priority: Priority,
        floor: Priority,
    },

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    pub(crate) fn invalid_target(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
