//! Client endpoint trait (mirrors the teacher's `GenericEndpoint` split
//! between connection management and request/reply plumbing) plus the
//! one concrete TCP implementation `relaychat` needs.

use async_trait::async_trait;
use tokio::net::TcpStream;

use relaychat::{ClientCommand, RelayError, ServerFrame};

/// One candidate peer to dial, refreshed in place on `redirect`.
#[derive(Debug, Clone)]
pub struct PeerTarget {
    pub server_id: String,
    pub host: String,
    pub port: u16,
}

/// Connection management + request/reply plumbing for one client
/// session against the replicated chat service (spec §4.7).
#[async_trait]
pub trait ClientEndpoint {
    /// Establishes a TCP connection to a live peer, looping through
    /// `peers` until one accepts (spec §4.7(b): the client follows
    /// `redirect` by reconnecting).
    async fn connect(&mut self) -> Result<(), RelayError>;

    /// Sends one command frame to the server.
    async fn send_command(&mut self, cmd: &ClientCommand) -> Result<(), RelayError>;

    /// Reads one frame from the server, or `None` on a clean EOF.
    async fn recv_frame(&mut self) -> Result<Option<ServerFrame>, RelayError>;

    /// Drops the underlying connection, if any, without touching the
    /// peer list.
    fn disconnect(&mut self);
}

pub struct TcpClientEndpoint {
    pub peers: Vec<PeerTarget>,
    pub current_index: usize,
    stream: Option<TcpStream>,
}

impl TcpClientEndpoint {
    pub fn new(peers: Vec<PeerTarget>) -> Self {
        TcpClientEndpoint {
            peers,
            current_index: 0,
            stream: None,
        }
    }

    /// Replaces the peer list with a single target, as the original
    /// client does on receiving `redirect` (spec §4.7(b)).
    pub fn redirect_to(&mut self, server_id: String, host: String, port: u16) {
        self.peers = vec![PeerTarget {
            server_id,
            host,
            port,
        }];
        self.current_index = 0;
    }

    fn advance(&mut self) {
        self.current_index = (self.current_index + 1) % self.peers.len().max(1);
    }
}

#[async_trait]
impl ClientEndpoint for TcpClientEndpoint {
    async fn connect(&mut self) -> Result<(), RelayError> {
        if self.peers.is_empty() {
            return Err(RelayError::new("no candidate peers configured"));
        }
        let target = self.peers[self.current_index].clone();
        let addr = format!("{}:{}", target.host, target.port);
        match tokio::time::timeout(
            std::time::Duration::from_secs(3),
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                Ok(())
            }
            Ok(Err(e)) => {
                self.advance();
                Err(RelayError::new(format!("connect to {} failed: {}", addr, e)))
            }
            Err(_elapsed) => {
                self.advance();
                Err(RelayError::new(format!("connect to {} timed out", addr)))
            }
        }
    }

    async fn send_command(&mut self, cmd: &ClientCommand) -> Result<(), RelayError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RelayError::new("not connected"))?;
        relaychat::safe_tcp_write(stream, cmd).await
    }

    async fn recv_frame(&mut self) -> Result<Option<ServerFrame>, RelayError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RelayError::new("not connected"))?;
        relaychat::safe_tcp_read(stream).await
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}
