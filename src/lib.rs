pub mod agent;
pub mod config;
pub mod dialer;
pub mod error;
pub mod grpc;
pub mod node;
pub mod proto;
pub mod scan;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod tls;
