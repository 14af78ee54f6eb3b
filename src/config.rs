use std::path::PathBuf;
use std::time::Duration;

use crate::agent::Agent;
use crate::error::{DispatchError, Result};
use crate::scheduler::Priority;

/// Tuning for the scheduler loop and the per-job ingestion pipeline.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduler looks at the head of the queue
    pub poll_interval_ms: u64,
    /// Maximum number of jobs waiting for dispatch
    pub queue_capacity: usize,
    /// Channel depth of each ingestion worker
    pub pipeline_buffer: usize,
    /// Upper bound on establishing an agent connection
    pub connect_timeout_ms: u64,
    /// Upper bound on an agent answering `RunJob` with its report stream
    pub open_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            queue_capacity: 256,
            pipeline_buffer: 64,
            connect_timeout_ms: 5000,
            open_timeout_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// TLS configuration for the channels opened to agents.
///
/// A CA certificate turns TLS on. The client certificate and key are only
/// needed for agents that verify their callers.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format) that signed the agents' certificates.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to the scheduler's client certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to the scheduler's private key (PEM format).
    pub key_path: Option<PathBuf>,

    /// Name the agents' certificates are issued for.
    pub domain_name: Option<String>,

    /// Fall back to plaintext when TLS is requested but cannot be loaded.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is enabled and has the CA it needs.
    pub fn is_complete(&self) -> bool {
        self.enabled && self.ca_cert_path.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub scheduler: SchedulerConfig,
    pub agents: Vec<Agent>,
    pub tls: TlsConfig,
}

impl NodeConfig {
    pub fn new(scheduler: SchedulerConfig) -> Self {
        Self {
            scheduler,
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }
}

/// Parse a comma-separated agent list.
///
/// Each entry is `id:host:port` or `id:host:port:min_priority`; the floor
/// defaults to `low`.
pub fn parse_agents(agents: &str) -> Result<Vec<Agent>> {
    agents
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_agent)
        .collect()
}

fn parse_agent(entry: &str) -> Result<Agent> {
    let parts: Vec<&str> = entry.split(':').collect();
    let (id, host, port, floor) = match parts.as_slice() {
        [id, host, port] => (id, host, port, None),
        [id, host, port, floor] => (id, host, port, Some(floor)),
        _ => {
            return Err(DispatchError::Config(format!(
                "invalid agent {entry:?}, expected id:host:port[:min_priority]"
            )))
        }
    };

    let id: u64 = id
        .parse()
        .map_err(|_| DispatchError::Config(format!("invalid agent id in {entry:?}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| DispatchError::Config(format!("invalid agent port in {entry:?}")))?;
    let min_priority = match floor {
        Some(floor) => floor.parse::<Priority>()?,
        None => Priority::Low,
    };

    Ok(Agent::new(id, format!("{}:{}", host, port), min_priority))
}
