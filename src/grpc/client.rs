use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use crate::agent::Agent;
use crate::error::{DispatchError, Result};
use crate::proto::agent_service_client::AgentServiceClient;
use crate::proto::{JobRequest, ScanReport};
use crate::tls::TlsIdentity;

/// Reports streamed back by an agent for one job.
pub type ReportStream =
    Pin<Box<dyn Stream<Item = std::result::Result<ScanReport, Status>> + Send>>;

/// The one RPC the dialer needs from an agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn run_job(&self, request: JobRequest) -> std::result::Result<ReportStream, Status>;
}

/// Builds an [`AgentClient`] for a registered agent.
pub trait AgentConnector: Send + Sync {
    fn connect(&self, agent: &Agent) -> Result<Arc<dyn AgentClient>>;
}

/// [`AgentClient`] over a tonic channel
#[derive(Debug, Clone)]
pub struct GrpcAgentClient {
    client: AgentServiceClient<Channel>,
}

impl GrpcAgentClient {
    pub fn new(client: AgentServiceClient<Channel>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentClient for GrpcAgentClient {
    async fn run_job(&self, request: JobRequest) -> std::result::Result<ReportStream, Status> {
        let mut client = self.client.clone();
        let stream = client.run_job(request).await?.into_inner();
        Ok(Box::pin(stream))
    }
}

/// Opens lazy gRPC channels to agents, with TLS when an identity is loaded.
///
/// No connection is made here; an unreachable agent shows up as an error on
/// the first `RunJob` call.
#[derive(Clone)]
pub struct GrpcConnector {
    tls_identity: Option<TlsIdentity>,
    connect_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(tls_identity: Option<TlsIdentity>, connect_timeout: Duration) -> Self {
        Self {
            tls_identity,
            connect_timeout,
        }
    }
}

impl AgentConnector for GrpcConnector {
    fn connect(&self, agent: &Agent) -> Result<Arc<dyn AgentClient>> {
        let unavailable = |reason: String| DispatchError::AgentUnavailable {
            agent_id: agent.id,
            reason,
        };

        let uri = if self.tls_identity.is_some() {
            format!("https://{}", agent.host)
        } else {
            format!("http://{}", agent.host)
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| unavailable(format!("Invalid endpoint: {}", e)))?
            .connect_timeout(self.connect_timeout);

        if let Some(ref tls_identity) = self.tls_identity {
            endpoint = endpoint
                .tls_config(tls_identity.client_tls_config())
                .map_err(|e| unavailable(format!("TLS config error: {}", e)))?;
        }

        let channel = endpoint.connect_lazy();
        tracing::debug!(agent_id = agent.id, host = %agent.host, "Agent channel created");
        Ok(Arc::new(GrpcAgentClient::new(AgentServiceClient::new(channel))))
    }
}
