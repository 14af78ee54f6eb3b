//! TLS utilities for the scheduler's outbound agent channels.
//!
//! Agents are dialed over HTTPS when a CA certificate is configured. A client
//! certificate and key may be added for agents that require mutual TLS.

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};

use crate::config::TlsConfig;

const DEFAULT_DOMAIN_NAME: &str = "recon-agent";

/// Error type for TLS configuration issues.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Client certificate and key must be configured together")]
    IncompleteIdentity,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Client certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Loaded TLS materials ready for use with tonic.
#[derive(Clone)]
pub struct TlsIdentity {
    /// CA certificate used to verify agents
    ca_cert: Certificate,
    /// Client identity presented to agents that require mTLS
    identity: Option<Identity>,
    domain_name: String,
}

impl TlsIdentity {
    /// Load TLS materials from the paths in the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA path is missing, if only one of the
    /// certificate/key pair is set, or if any configured file cannot be read.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_cert_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;
        if !ca_cert_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_cert_path.clone()));
        }
        let ca_cert = Certificate::from_pem(fs::read(ca_cert_path).await?);

        let identity = match (&config.cert_path, &config.key_path) {
            (Some(cert_path), Some(key_path)) => {
                if !cert_path.exists() {
                    return Err(TlsError::CertNotFound(cert_path.clone()));
                }
                if !key_path.exists() {
                    return Err(TlsError::KeyNotFound(key_path.clone()));
                }
                let cert_pem = fs::read(cert_path).await?;
                let key_pem = fs::read(key_path).await?;
                Some(Identity::from_pem(cert_pem, key_pem))
            }
            (None, None) => None,
            _ => return Err(TlsError::IncompleteIdentity),
        };

        Ok(Self {
            ca_cert,
            identity,
            domain_name: config
                .domain_name
                .clone()
                .unwrap_or_else(|| DEFAULT_DOMAIN_NAME.to_string()),
        })
    }

    pub fn has_client_identity(&self) -> bool {
        self.identity.is_some()
    }

    /// Client TLS config for dialing agents.
    ///
    /// Agents are usually addressed by IP, so the certificate is checked
    /// against a fixed domain name rather than the dialed host.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        let config = ClientTlsConfig::new()
            .domain_name(self.domain_name.clone())
            .ca_certificate(self.ca_cert.clone());
        match self.identity {
            Some(ref identity) => config.identity(identity.clone()),
            None => config,
        }
    }
}
