//! Listening side of one mapping

use socksbridge_config::MappingConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::session::Session;

/// Pause after a failed accept so a persistent error (e.g. fd exhaustion)
/// does not spin the loop.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Mapping '{name}': failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different listen_addr or listen_port")]
    BindError {
        name: String,
        address: String,
        port: u16,
        reason: String,
    },
}

/// Per-endpoint session ids for log correlation
#[derive(Clone)]
pub struct SessionIdGenerator {
    next_session_id: Arc<AtomicU64>,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn generate(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts connections for one mapping and runs a session for each
pub struct ProxyEndpoint {
    mapping: Arc<MappingConfig>,
    listener: TcpListener,
    session_ids: SessionIdGenerator,
}

impl ProxyEndpoint {
    /// Bind the mapping's listen address
    pub async fn bind(mapping: MappingConfig) -> Result<Self, EndpointError> {
        let address = mapping.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| EndpointError::BindError {
                name: mapping.name.clone(),
                address: address.clone(),
                port: mapping.listen_port,
                reason: e.to_string(),
            })?;

        Ok(Self {
            mapping: Arc::new(mapping),
            listener,
            session_ids: SessionIdGenerator::new(),
        })
    }

    /// Bind and serve forever. Only returns on bind failure.
    pub async fn start(mapping: MappingConfig) -> Result<(), EndpointError> {
        Self::bind(mapping).await?.run().await
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EndpointError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn mapping(&self) -> &MappingConfig {
        &self.mapping
    }

    /// Accept loop. Each connection gets its own task; a failed session or
    /// accept never stops the loop.
    pub async fn run(self) -> Result<(), EndpointError> {
        let local_addr = self.local_addr()?;

        info!(
            "Endpoint {} listening on {} (upstream {}, target {})",
            self.mapping.name,
            local_addr,
            self.mapping.upstream_address(),
            self.mapping.target()
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let session_id = self.session_ids.generate();
                    debug!(
                        session = session_id,
                        mapping = %self.mapping.name,
                        "Accepted connection {} -> {}",
                        peer_addr,
                        local_addr
                    );

                    let mut session = Session::new(session_id, peer_addr, self.mapping.clone());
                    tokio::spawn(async move {
                        // Outcome is logged by the session itself
                        let _ = session.run(stream).await;
                    });
                }
                Err(e) => {
                    error!(
                        mapping = %self.mapping.name,
                        "Failed to accept connection: {}",
                        e
                    );
                    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                }
            }
        }
    }
}
