//! SOCKS5 client handshake against the upstream proxy

use socksbridge_proto::{
    check_method_selection, parse_connect_reply, ConnectRequest, ProtoError,
    CONNECT_REPLY_BUFFER_SIZE, GREETING, METHOD_SELECTION_LEN,
};
use std::io;
use std::net::SocketAddrV4;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::session::Stage;

/// Handshake failures. Every variant ends the session; nothing is retried.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Failed to connect to upstream {address}: {source}")]
    Dial { address: String, source: io::Error },

    #[error("I/O error while {step}: {source}")]
    Io {
        step: &'static str,
        source: io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtoError),

    #[error("Failed to deliver early target data to local peer: {0}")]
    EarlyData(io::Error),
}

impl HandshakeError {
    fn io(step: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { step, source }
    }
}

/// Drives one session's stage marker from `Init` to `ConnectAcked`
pub struct HandshakeEngine<'s> {
    session_id: u64,
    target: SocketAddrV4,
    stage: &'s mut Stage,
}

impl<'s> HandshakeEngine<'s> {
    pub fn new(session_id: u64, target: SocketAddrV4, stage: &'s mut Stage) -> Self {
        Self {
            session_id,
            target,
            stage,
        }
    }

    pub fn stage(&self) -> Stage {
        *self.stage
    }

    fn advance(&mut self, next: Stage) {
        self.stage.advance(next);
        debug!(session = self.session_id, "Handshake stage: {:?}", next);
    }

    /// Open the TCP connection to the upstream proxy
    pub async fn dial(&mut self, address: &str) -> Result<TcpStream, HandshakeError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| HandshakeError::Dial {
                address: address.to_string(),
                source,
            })?;

        self.advance(Stage::UpstreamDialed);
        Ok(stream)
    }

    /// Greeting, method selection, CONNECT request and reply.
    ///
    /// Target bytes that arrive in the same read as the CONNECT reply are
    /// written to `local` before this returns.
    pub async fn negotiate<U, L>(
        &mut self,
        upstream: &mut U,
        local: &mut L,
    ) -> Result<(), HandshakeError>
    where
        U: AsyncRead + AsyncWrite + Unpin,
        L: AsyncWrite + Unpin,
    {
        upstream
            .write_all(&GREETING)
            .await
            .map_err(HandshakeError::io("sending greeting"))?;
        self.advance(Stage::GreetingSent);

        let mut selection = [0u8; METHOD_SELECTION_LEN];
        upstream
            .read_exact(&mut selection)
            .await
            .map_err(HandshakeError::io("reading method selection"))?;
        check_method_selection(selection)?;
        self.advance(Stage::GreetingAcked);

        let request = ConnectRequest::new(*self.target.ip(), self.target.port());
        upstream
            .write_all(&request.encode())
            .await
            .map_err(HandshakeError::io("sending CONNECT request"))?;
        self.advance(Stage::ConnectRequestSent);

        let mut reply = vec![0u8; CONNECT_REPLY_BUFFER_SIZE];
        let n = upstream
            .read(&mut reply)
            .await
            .map_err(HandshakeError::io("reading CONNECT reply"))?;
        let reply = parse_connect_reply(&reply[..n])?;

        if !reply.early_data.is_empty() {
            debug!(
                session = self.session_id,
                "Forwarding {} bytes received with CONNECT reply",
                reply.early_data.len()
            );
            local
                .write_all(reply.early_data)
                .await
                .map_err(HandshakeError::EarlyData)?;
        }
        self.advance(Stage::ConnectAcked);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    const TARGET: &str = "203.0.113.5:8080";
    const OK_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38];

    /// Scripted upstream: answers the greeting and the CONNECT request with
    /// the given bytes and hands back what the client sent.
    fn fake_upstream(
        mut server: DuplexStream,
        selection: [u8; 2],
        connect_reply: Vec<u8>,
    ) -> tokio::task::JoinHandle<(Vec<u8>, Option<Vec<u8>>)> {
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&selection).await.unwrap();

            let mut request = [0u8; 10];
            let request = match server.read_exact(&mut request).await {
                Ok(_) => Some(request.to_vec()),
                Err(_) => None,
            };
            if request.is_some() {
                server.write_all(&connect_reply).await.unwrap();
            }

            (greeting.to_vec(), request)
        })
    }

    #[tokio::test]
    async fn test_successful_handshake() {
        let (mut client, server) = duplex(2048);
        let (mut local, mut local_peer) = duplex(2048);
        let upstream = fake_upstream(server, [0x05, 0x00], OK_REPLY.to_vec());

        let mut stage = Stage::UpstreamDialed;
        let mut engine = HandshakeEngine::new(1, TARGET.parse().unwrap(), &mut stage);
        engine.negotiate(&mut client, &mut local).await.unwrap();
        assert_eq!(engine.stage(), Stage::ConnectAcked);

        let (greeting, request) = upstream.await.unwrap();
        assert_eq!(greeting, vec![0x05, 0x01, 0x00]);
        assert_eq!(
            request.unwrap(),
            vec![0x05, 0x01, 0x00, 0x01, 0xCB, 0x00, 0x71, 0x05, 0x1F, 0x90]
        );

        // Nothing pre-forwarded for a plain 10-byte reply
        drop(local);
        let mut forwarded = Vec::new();
        local_peer.read_to_end(&mut forwarded).await.unwrap();
        assert!(forwarded.is_empty());
    }

    #[tokio::test]
    async fn test_early_data_is_forwarded() {
        let (mut client, server) = duplex(2048);
        let (mut local, mut local_peer) = duplex(2048);
        let mut reply = OK_REPLY.to_vec();
        reply.extend_from_slice(b"HELLO");
        let upstream = fake_upstream(server, [0x05, 0x00], reply);

        let mut stage = Stage::UpstreamDialed;
        HandshakeEngine::new(2, TARGET.parse().unwrap(), &mut stage)
            .negotiate(&mut client, &mut local)
            .await
            .unwrap();
        upstream.await.unwrap();

        drop(local);
        let mut forwarded = Vec::new();
        local_peer.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(forwarded, b"HELLO");
    }

    #[tokio::test]
    async fn test_rejected_greeting_aborts_before_connect() {
        let (mut client, server) = duplex(2048);
        let (mut local, _local_peer) = duplex(2048);
        let upstream = fake_upstream(server, [0x05, 0xFF], OK_REPLY.to_vec());

        let mut stage = Stage::UpstreamDialed;
        let mut engine = HandshakeEngine::new(3, TARGET.parse().unwrap(), &mut stage);
        let err = engine.negotiate(&mut client, &mut local).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Protocol(ProtoError::MethodRejected { method: 0xFF, .. })
        ));
        assert_eq!(engine.stage(), Stage::GreetingSent);

        // The upstream never sees a CONNECT request
        drop(client);
        let (_, request) = upstream.await.unwrap();
        assert!(request.is_none());
    }

    #[tokio::test]
    async fn test_upstream_closing_during_greeting() {
        let (mut client, mut server) = duplex(2048);
        let (mut local, _local_peer) = duplex(2048);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[0x05]).await.unwrap();
        });

        let mut stage = Stage::UpstreamDialed;
        let err = HandshakeEngine::new(4, TARGET.parse().unwrap(), &mut stage)
            .negotiate(&mut client, &mut local)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Io { source, .. } if source.kind() == io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_rejected_connect() {
        let (mut client, server) = duplex(2048);
        let (mut local, mut local_peer) = duplex(2048);
        let mut reply = vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        reply.extend_from_slice(b"should not arrive");
        let upstream = fake_upstream(server, [0x05, 0x00], reply);

        let mut stage = Stage::UpstreamDialed;
        let mut engine = HandshakeEngine::new(5, TARGET.parse().unwrap(), &mut stage);
        let err = engine.negotiate(&mut client, &mut local).await.unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Protocol(ProtoError::ConnectRejected { reply: 0x05, .. })
        ));
        assert_eq!(engine.stage(), Stage::ConnectRequestSent);
        upstream.await.unwrap();

        drop(local);
        let mut forwarded = Vec::new();
        local_peer.read_to_end(&mut forwarded).await.unwrap();
        assert!(forwarded.is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure() {
        // Grab a free port and release it so nothing is listening there
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut stage = Stage::Init;
        let mut engine = HandshakeEngine::new(6, TARGET.parse().unwrap(), &mut stage);
        let err = engine.dial(&address).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Dial { .. }));
        assert_eq!(engine.stage(), Stage::Init);
    }
}
