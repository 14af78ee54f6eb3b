pub mod client;
pub mod convert;

pub use client::{AgentClient, AgentConnector, GrpcAgentClient, GrpcConnector, ReportStream};
