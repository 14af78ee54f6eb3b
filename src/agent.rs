use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::Priority;

/// A remote scanning agent as recorded by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: u64,
    /// `host:port` of the agent's gRPC endpoint
    pub host: String,
    pub min_priority: Priority,
    pub active: bool,
}

impl Agent {
    pub fn new(id: u64, host: impl Into<String>, min_priority: Priority) -> Self {
        Self {
            id,
            host: host.into(),
            min_priority,
            active: true,
        }
    }

    /// Whether a job of the given priority clears this agent's floor
    pub fn accepts(&self, priority: Priority) -> bool {
        priority >= self.min_priority
    }
}

/// Source of the agents the scheduler should dial at start-up.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<Agent>>;
}

/// Registry backed by the agents listed in the node configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    agents: Vec<Agent>,
}

impl StaticRegistry {
    pub fn new(agents: Vec<Agent>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl AgentRegistry for StaticRegistry {
    async fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.clone())
    }
}
