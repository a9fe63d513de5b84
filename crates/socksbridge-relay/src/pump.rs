//! One-directional pump and the two-pump relay built from it

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace};

use crate::flag::{SetOnDrop, TerminationFlag};

/// Pump tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    /// Read deadline; also the longest a pump keeps running after its peer exits
    pub poll_interval: Duration,
    pub buffer_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            buffer_size: 1024,
        }
    }
}

/// Why a pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Source reached end-of-stream
    SourceClosed,
    /// Read deadline expired after the peer pump had already exited
    PeerFinished,
    ReadFailed(io::ErrorKind),
    WriteFailed(io::ErrorKind),
    /// The pump task panicked or was cancelled
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub exit: PumpExit,
    pub bytes: u64,
}

/// Both directions of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub local_to_upstream: PumpReport,
    pub upstream_to_local: PumpReport,
}

/// Copies bytes from one stream to another until either end finishes
#[derive(Debug, Clone)]
pub struct RelayPump {
    direction: &'static str,
    session_id: u64,
    config: PumpConfig,
}

impl RelayPump {
    pub fn new(direction: &'static str, config: PumpConfig) -> Self {
        Self {
            direction,
            session_id: 0,
            config,
        }
    }

    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = session_id;
        self
    }

    /// Run until the source closes, an I/O error occurs, or the read deadline
    /// expires while `flag` is set. `flag` is set on every exit path.
    pub async fn run<R, W>(
        &self,
        mut source: R,
        mut destination: W,
        flag: TerminationFlag,
    ) -> PumpReport
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let _signal_peer = SetOnDrop(flag.clone());
        let mut buffer = vec![0u8; self.config.buffer_size];
        let mut bytes = 0u64;

        let exit = loop {
            match tokio::time::timeout(self.config.poll_interval, source.read(&mut buffer)).await {
                Err(_) => {
                    if flag.is_set() {
                        break PumpExit::PeerFinished;
                    }
                    trace!(
                        session = self.session_id,
                        direction = self.direction,
                        "Read deadline expired, peer still running"
                    );
                }
                Ok(Ok(0)) => break PumpExit::SourceClosed,
                Ok(Ok(n)) => {
                    trace!(
                        session = self.session_id,
                        direction = self.direction,
                        "Forwarding {} bytes",
                        n
                    );
                    if let Err(e) = forward(&mut destination, &buffer[..n]).await {
                        error!(
                            session = self.session_id,
                            direction = self.direction,
                            "Failed to write relayed data: {}",
                            e
                        );
                        break PumpExit::WriteFailed(e.kind());
                    }
                    bytes += n as u64;
                }
                Ok(Err(e)) => {
                    error!(
                        session = self.session_id,
                        direction = self.direction,
                        "Failed to read relayed data: {}",
                        e
                    );
                    break PumpExit::ReadFailed(e.kind());
                }
            }
        };

        flag.set();

        debug!(
            session = self.session_id,
            direction = self.direction,
            bytes = bytes,
            "Pump stopped: {:?}",
            exit
        );

        PumpReport { exit, bytes }
    }
}

async fn forward<W: AsyncWrite + Unpin>(destination: &mut W, data: &[u8]) -> io::Result<()> {
    destination.write_all(data).await?;
    destination.flush().await
}

/// Relay between `local` and `upstream` with one pump task per direction.
///
/// Returns once both pumps have exited. Each stream is dropped, and so
/// closed, only after both of its halves are released, i.e. after both pumps
/// are done.
pub async fn relay<L, U>(
    local: L,
    upstream: U,
    session_id: u64,
    config: PumpConfig,
) -> RelayReport
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let flag = TerminationFlag::new();

    let outbound = {
        let pump = RelayPump::new("local->upstream", config).with_session(session_id);
        let flag = flag.clone();
        tokio::spawn(async move { pump.run(local_read, upstream_write, flag).await })
    };

    let inbound = {
        let pump = RelayPump::new("upstream->local", config).with_session(session_id);
        let flag = flag.clone();
        tokio::spawn(async move { pump.run(upstream_read, local_write, flag).await })
    };

    let (outbound, inbound) = tokio::join!(outbound, inbound);

    let aborted = |e: tokio::task::JoinError| {
        error!(session = session_id, "Relay pump task failed: {}", e);
        PumpReport {
            exit: PumpExit::Aborted,
            bytes: 0,
        }
    };

    RelayReport {
        local_to_upstream: outbound.unwrap_or_else(aborted),
        upstream_to_local: inbound.unwrap_or_else(aborted),
    }
}
