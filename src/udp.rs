//! Datagram transport: one command per datagram, best-effort data.
//!
//! There is no retransmission. A lost data datagram shows up as a lower
//! measured rate, or as a stalled block when no I/O timeout is configured.

use crate::client::SpeedTestSession;
use crate::config::Config;
use crate::estimator::BlockTransfer;
use crate::net::{local_addr_for, resolve, with_deadline};
use crate::payload::Payload;
use crate::protocol::{
    decode_datagram, is_ok, Command, Direction, ProtocolError, REPLY_GOOD_BYE, REPLY_OK,
    REPLY_UNSUPPORTED_VERSION,
};
use crate::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

/// Largest payload an IPv4 UDP datagram can carry.
pub const MAX_UDP_PAYLOAD: usize = 65507;

/// Receive buffer large enough for any datagram.
pub const RECV_BUFFER_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy)]
struct PendingReceive {
    remaining: u64,
    expires_at: Instant,
}

/// Outstanding `Recv` byte counts, one per peer address.
///
/// An entry is removed when its count is satisfied or when it has not been
/// completed within the configured time to live.
#[derive(Debug)]
pub struct PendingReceives {
    entries: HashMap<SocketAddr, PendingReceive>,
    ttl: Duration,
}

impl PendingReceives {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Starts counting `bytes` for `peer`, replacing any previous count.
    pub fn begin(&mut self, peer: SocketAddr, bytes: u64, now: Instant) {
        self.entries.insert(
            peer,
            PendingReceive {
                remaining: bytes,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Counts `len` received bytes against `peer`.
    ///
    /// Returns `None` when the peer has no pending receive, `Some(true)` when
    /// this datagram completed it.
    pub fn consume(&mut self, peer: &SocketAddr, len: usize) -> Option<bool> {
        let entry = self.entries.get_mut(peer)?;
        entry.remaining = entry.remaining.saturating_sub(len as u64);
        if entry.remaining == 0 {
            self.entries.remove(peer);
            Some(true)
        } else {
            Some(false)
        }
    }

    pub fn remaining(&self, peer: &SocketAddr) -> Option<u64> {
        self.entries.get(peer).map(|e| e.remaining)
    }

    /// Drops expired entries and returns how many were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|peer, entry| {
            let keep = entry.expires_at > now;
            if !keep {
                warn!(
                    "Dropping unfinished receive from {} ({} bytes missing)",
                    peer, entry.remaining
                );
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Answers datagrams arriving on the server socket, one at a time.
pub struct UdpServerHandler {
    socket: Arc<UdpSocket>,
    payload: Payload,
    datagram_size: usize,
    pending: PendingReceives,
}

impl UdpServerHandler {
    pub fn new(socket: Arc<UdpSocket>, payload: Payload, config: &Config) -> Self {
        let datagram_size = payload.len().min(MAX_UDP_PAYLOAD);
        Self {
            socket,
            payload,
            datagram_size,
            pending: PendingReceives::new(config.pending_ttl),
        }
    }

    pub fn pending(&self) -> &PendingReceives {
        &self.pending
    }

    /// Handles one inbound datagram from `peer`.
    pub async fn handle_datagram(&mut self, data: &[u8], peer: SocketAddr) -> Result<()> {
        self.pending.prune(Instant::now());

        if let Some(done) = self.pending.consume(&peer, data.len()) {
            debug!(
                "Recv data {} bytes from {}, waiting for {}",
                data.len(),
                peer,
                self.pending.remaining(&peer).unwrap_or(0)
            );
            if done {
                self.reply(peer, REPLY_OK).await?;
                debug!("Recv from {} finished.", peer);
            }
            return Ok(());
        }

        let msg = match decode_datagram(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Invalid command from {} ({} bytes): {}", peer, data.len(), e);
                return Ok(());
            }
        };
        debug!("from {} recv {}", peer, msg);

        match Command::decode(&msg) {
            Ok(cmd @ Command::Hello { .. }) => {
                let reply = if cmd.is_supported_hello() {
                    REPLY_OK
                } else {
                    REPLY_UNSUPPORTED_VERSION
                };
                self.reply(peer, reply).await
            }
            Ok(Command::Transfer {
                direction: Direction::ServerSends,
                bytes,
            }) => self.send_test_block(peer, bytes).await,
            Ok(Command::Transfer {
                direction: Direction::ClientSends,
                bytes,
            }) => {
                self.reply(peer, REPLY_OK).await?;
                if bytes == 0 {
                    self.reply(peer, REPLY_OK).await
                } else {
                    self.pending.begin(peer, bytes, Instant::now());
                    Ok(())
                }
            }
            Ok(Command::Bye) => self.reply(peer, REPLY_GOOD_BYE).await,
            Err(e) => self.reply(peer, &e.reply()).await,
        }
    }

    async fn reply(&self, peer: SocketAddr, text: &str) -> Result<()> {
        if text != REPLY_OK {
            info!("Send message to {}: {}", peer, text);
        }
        self.socket.send_to(text.as_bytes(), peer).await?;
        Ok(())
    }

    async fn send_test_block(&self, peer: SocketAddr, count: u64) -> Result<()> {
        for slice in self.payload.chunks(count, self.datagram_size) {
            self.socket.send_to(slice, peer).await?;
        }
        debug!("Send {} K data finished.", count / 1024);
        Ok(())
    }
}

/// Client end of a UDP speed test.
pub struct UdpClient {
    socket: UdpSocket,
    payload: Payload,
    datagram_size: usize,
    io_timeout: Option<Duration>,
    buf: Vec<u8>,
}

impl UdpClient {
    /// Binds an ephemeral socket and fixes the server as its only peer.
    pub async fn connect(host: &str, port: u16, config: &Config) -> Result<Self> {
        let server = resolve(host, port).await?;
        let socket = UdpSocket::bind(local_addr_for(&server)).await?;
        socket.connect(server).await?;
        info!("UDP address: {}", server);
        Ok(Self::new(socket, Payload::random(config.block_size), config.io_timeout))
    }

    /// Wraps an already connected socket.
    pub fn new(socket: UdpSocket, payload: Payload, io_timeout: Option<Duration>) -> Self {
        let datagram_size = payload.len().min(MAX_UDP_PAYLOAD);
        Self {
            socket,
            payload,
            datagram_size,
            io_timeout,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    async fn send_datagram(&self, data: &[u8]) -> Result<()> {
        with_deadline(self.io_timeout, self.socket.send(data)).await?;
        Ok(())
    }

    async fn recv_datagram(&mut self) -> Result<usize> {
        with_deadline(self.io_timeout, self.socket.recv(&mut self.buf)).await
    }

    async fn recv_reply(&mut self) -> Result<String> {
        let n = self.recv_datagram().await?;
        Ok(String::from_utf8_lossy(&self.buf[..n]).trim().to_string())
    }

    /// Sends one command datagram and waits for one reply datagram.
    pub async fn send_command(&mut self, cmd: &Command) -> Result<String> {
        debug!("Send command: {}", cmd);
        self.send_datagram(cmd.encode().as_bytes()).await?;
        self.recv_reply().await
    }

    async fn expect_ok(&mut self) -> Result<()> {
        let reply = self.recv_reply().await?;
        if is_ok(&reply) {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedReply(reply).into())
        }
    }

    /// `Send <n>`: count incoming datagrams until `n` bytes arrived.
    pub async fn recv_test_block(&mut self, count: u64) -> Result<()> {
        let cmd = Command::transfer(Direction::ServerSends, count);
        debug!("Send command: {}", cmd);
        self.send_datagram(cmd.encode().as_bytes()).await?;

        let mut received = 0u64;
        while received < count {
            received += self.recv_datagram().await? as u64;
        }
        Ok(())
    }

    /// `Recv <n>`: announce, send `n` bytes, wait for the counting ack.
    pub async fn send_test_block(&mut self, count: u64) -> Result<()> {
        self.announce_upload(count).await?;
        self.push_upload(count).await
    }

    /// Sends `Recv <n>` and waits for the server to start counting.
    pub async fn announce_upload(&mut self, count: u64) -> Result<()> {
        let reply = self
            .send_command(&Command::transfer(Direction::ClientSends, count))
            .await?;
        if !is_ok(&reply) {
            return Err(ProtocolError::UnexpectedReply(reply).into());
        }
        Ok(())
    }

    /// Sends `n` bytes as datagrams and waits for the counting ack.
    pub async fn push_upload(&mut self, count: u64) -> Result<()> {
        for slice in self.payload.chunks(count, self.datagram_size) {
            self.send_datagram(slice).await?;
        }
        debug!("Send {} K data finished. waiting for acknowledge.", count / 1024);

        self.expect_ok().await
    }
}

#[async_trait]
impl BlockTransfer for UdpClient {
    async fn prepare_block(&mut self, direction: Direction, bytes: u64) -> Result<()> {
        match direction {
            Direction::ServerSends => Ok(()),
            Direction::ClientSends => self.announce_upload(bytes).await,
        }
    }

    async fn transfer_block(&mut self, direction: Direction, bytes: u64) -> Result<()> {
        match direction {
            Direction::ServerSends => self.recv_test_block(bytes).await,
            Direction::ClientSends => self.push_upload(bytes).await,
        }
    }
}

#[async_trait]
impl SpeedTestSession for UdpClient {
    async fn say_hello(&mut self) -> Result<String> {
        self.send_command(&Command::hello()).await
    }

    async fn say_bye(&mut self) -> Result<String> {
        let reply = self.send_command(&Command::Bye).await?;
        info!("Say bye return: {}", reply);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_pending_counts_down_to_one_completion() {
        let now = Instant::now();
        let mut pending = PendingReceives::new(Duration::from_secs(30));
        pending.begin(peer(1), 10_000, now);

        assert_eq!(pending.consume(&peer(1), 4096), Some(false));
        assert_eq!(pending.consume(&peer(1), 4096), Some(false));
        assert_eq!(pending.remaining(&peer(1)), Some(1808));
        assert_eq!(pending.consume(&peer(1), 4096), Some(true));
        assert!(pending.is_empty());
        assert_eq!(pending.consume(&peer(1), 4096), None);
    }

    #[test]
    fn test_pending_is_per_peer() {
        let now = Instant::now();
        let mut pending = PendingReceives::new(Duration::from_secs(30));
        pending.begin(peer(1), 100, now);
        pending.begin(peer(2), 50, now);

        assert_eq!(pending.consume(&peer(2), 50), Some(true));
        assert_eq!(pending.remaining(&peer(1)), Some(100));
        assert_eq!(pending.consume(&peer(3), 10), None);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_pending_expires() {
        let now = Instant::now();
        let mut pending = PendingReceives::new(Duration::from_secs(5));
        pending.begin(peer(1), 100, now);
        pending.begin(peer(2), 100, now + Duration::from_secs(3));

        assert_eq!(pending.prune(now + Duration::from_secs(4)), 0);
        assert_eq!(pending.prune(now + Duration::from_secs(6)), 1);
        assert_eq!(pending.remaining(&peer(1)), None);
        assert_eq!(pending.remaining(&peer(2)), Some(100));
    }

    #[test]
    fn test_restart_replaces_count() {
        let now = Instant::now();
        let mut pending = PendingReceives::new(Duration::from_secs(5));
        pending.begin(peer(1), 100, now);
        pending.consume(&peer(1), 60);
        pending.begin(peer(1), 20, now);
        assert_eq!(pending.remaining(&peer(1)), Some(20));
    }

    async fn handler_and_peer() -> (UdpServerHandler, UdpSocket, SocketAddr) {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let handler = UdpServerHandler::new(server, Payload::random(1000), &Config::server(0));
        (handler, client, client_addr)
    }

    async fn recv_text(socket: &UdpSocket) -> String {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let n = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .expect("no reply")
            .unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    async fn nothing_pending(socket: &UdpSocket) -> bool {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        tokio::time::timeout(Duration::from_millis(100), socket.recv(&mut buf))
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_counting_ack_sent_once() {
        let (mut handler, client, client_addr) = handler_and_peer().await;

        handler.handle_datagram(b"Recv 3000", client_addr).await.unwrap();
        assert_eq!(recv_text(&client).await, "OK");

        handler.handle_datagram(&[b'x'; 1000], client_addr).await.unwrap();
        handler.handle_datagram(&[b'x'; 1500], client_addr).await.unwrap();
        assert!(nothing_pending(&client).await);

        handler.handle_datagram(&[b'x'; 500], client_addr).await.unwrap();
        assert_eq!(recv_text(&client).await, "OK");
        assert!(nothing_pending(&client).await);
        assert!(handler.pending().is_empty());
    }

    #[tokio::test]
    async fn test_recv_zero_acks_immediately() {
        let (mut handler, client, client_addr) = handler_and_peer().await;

        handler.handle_datagram(b"recv 0", client_addr).await.unwrap();
        assert_eq!(recv_text(&client).await, "OK");
        assert_eq!(recv_text(&client).await, "OK");
        assert!(handler.pending().is_empty());
    }

    #[tokio::test]
    async fn test_send_streams_datagrams() {
        let (mut handler, client, client_addr) = handler_and_peer().await;

        handler.handle_datagram(b"Send 2500", client_addr).await.unwrap();

        let mut sizes = Vec::new();
        let mut total = 0;
        while total < 2500 {
            let n = recv_text(&client).await.len();
            sizes.push(n);
            total += n;
        }
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[tokio::test]
    async fn test_control_replies() {
        let (mut handler, client, client_addr) = handler_and_peer().await;

        for (input, expected) in [
            ("SpeedTest V1", "OK"),
            ("SPEEDTEST V9", "Unsupported protocol version."),
            ("Recv", "Not size parameter."),
            ("Dance", "Unknown command: Dance"),
            ("Bye", "Good bye."),
        ] {
            handler.handle_datagram(input.as_bytes(), client_addr).await.unwrap();
            assert_eq!(recv_text(&client).await, expected);
        }
    }

    #[tokio::test]
    async fn test_oversized_datagram_is_ignored() {
        let (mut handler, client, client_addr) = handler_and_peer().await;

        handler.handle_datagram(&[b'a'; 2048], client_addr).await.unwrap();
        assert!(nothing_pending(&client).await);
    }

    #[tokio::test]
    async fn test_interleaved_peers_do_not_mix() {
        let (mut handler, first, first_addr) = handler_and_peer().await;
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second_addr = second.local_addr().unwrap();

        handler.handle_datagram(b"Recv 2000", first_addr).await.unwrap();
        handler.handle_datagram(b"Recv 100", second_addr).await.unwrap();
        assert_eq!(recv_text(&first).await, "OK");
        assert_eq!(recv_text(&second).await, "OK");

        handler.handle_datagram(&[b'x'; 1000], first_addr).await.unwrap();
        handler.handle_datagram(&[b'y'; 100], second_addr).await.unwrap();
        assert_eq!(recv_text(&second).await, "OK");
        assert!(nothing_pending(&first).await);

        handler.handle_datagram(&[b'x'; 1000], first_addr).await.unwrap();
        assert_eq!(recv_text(&first).await, "OK");
    }
}
