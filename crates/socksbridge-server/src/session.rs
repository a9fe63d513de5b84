//! One accepted connection, from upstream dial to close

use socksbridge_config::MappingConfig;
use socksbridge_relay::{relay, PumpConfig, RelayReport};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::handshake::{HandshakeEngine, HandshakeError};

/// Session progress. Ordered; a session only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    UpstreamDialed,
    GreetingSent,
    GreetingAcked,
    ConnectRequestSent,
    ConnectAcked,
    Relaying,
    Closed,
}

impl Stage {
    /// Move to `next`. Requests to go backwards are ignored.
    pub fn advance(&mut self, next: Stage) {
        if next > *self {
            *self = next;
        }
    }
}

pub struct Session {
    id: u64,
    peer_addr: SocketAddr,
    mapping: Arc<MappingConfig>,
    stage: Stage,
}

impl Session {
    pub fn new(id: u64, peer_addr: SocketAddr, mapping: Arc<MappingConfig>) -> Self {
        Self {
            id,
            peer_addr,
            mapping,
            stage: Stage::Init,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Run the session to completion. Both sockets are closed when this
    /// returns, whether the handshake failed or the relay finished.
    pub async fn run(&mut self, local: TcpStream) -> Result<RelayReport, HandshakeError> {
        let result = self.drive(local).await;
        self.stage.advance(Stage::Closed);

        match &result {
            Ok(report) => info!(
                session = self.id,
                mapping = %self.mapping.name,
                peer = %self.peer_addr,
                bytes_to_upstream = report.local_to_upstream.bytes,
                bytes_to_local = report.upstream_to_local.bytes,
                "Session closed"
            ),
            Err(e) => warn!(
                session = self.id,
                mapping = %self.mapping.name,
                peer = %self.peer_addr,
                "Session aborted: {}",
                e
            ),
        }

        result
    }

    async fn drive(&mut self, mut local: TcpStream) -> Result<RelayReport, HandshakeError> {
        let upstream_address = self.mapping.upstream_address();
        let mut engine = HandshakeEngine::new(self.id, self.mapping.target(), &mut self.stage);

        let mut upstream = engine.dial(&upstream_address).await?;
        engine.negotiate(&mut upstream, &mut local).await?;

        self.stage.advance(Stage::Relaying);
        debug!(
            session = self.id,
            "CONNECT to {} via {} established, relaying",
            self.mapping.target(),
            upstream_address
        );

        let config = PumpConfig {
            poll_interval: self.mapping.poll_interval,
            buffer_size: self.mapping.buffer_size,
        };

        Ok(relay(local, upstream, self.id, config).await)
    }
}
