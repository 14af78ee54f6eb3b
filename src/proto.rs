//! Wire types and client for the `recon.agent.v1.AgentService` contract,
//! generated from `proto/agent.proto`.

tonic::include_proto!("recon.agent.v1");

impl ScanReport {
    /// A report with no target or no outcome carries nothing to persist and
    /// is treated as a protocol violation by the dialer.
    pub fn is_empty(&self) -> bool {
        self.outcome.is_none() || self.target.as_ref().map_or(true, |t| t.host.is_empty())
    }
}
