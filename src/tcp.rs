//! Stream transport: control lines and data blocks share one connection.
//!
//! Every control line, commands and replies alike, ends in `\r\n`. Peers
//! that send bare replies such as `OK` without a line terminator are not
//! wire-compatible: the reply is never complete and the read only ends at a
//! configured I/O timeout or when the peer closes.

use crate::client::SpeedTestSession;
use crate::config::Config;
use crate::estimator::BlockTransfer;
use crate::net::with_deadline;
use crate::payload::Payload;
use crate::protocol::{
    is_ok, read_line, write_line, Command, Direction, ProtocolError, REPLY_GOOD_BYE, REPLY_OK,
    REPLY_UNSUPPORTED_VERSION,
};
use crate::{Error, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Size of the scratch buffer used to drain incoming blocks.
const RECV_CHUNK: usize = 8192;

/// Server-side session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitCommand,
    Sending,
    Receiving,
    Closed,
}

/// Reads and discards exactly `count` bytes, never reading past them.
async fn drain_exact<R: AsyncRead + Unpin>(
    reader: &mut R,
    count: u64,
    scratch: &mut [u8],
    deadline: Option<Duration>,
) -> Result<()> {
    let mut remaining = count;
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        let n = with_deadline(deadline, reader.read(&mut scratch[..want])).await?;
        if n == 0 {
            return Err(Error::Connection(format!(
                "peer closed after {} of {} bytes",
                count - remaining,
                count
            )));
        }
        remaining -= n as u64;
    }
    Ok(())
}

/// Writes exactly `count` payload bytes in chunks of at most `chunk` bytes.
async fn write_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &Payload,
    count: u64,
    chunk: usize,
    deadline: Option<Duration>,
) -> Result<()> {
    for slice in payload.chunks(count, chunk) {
        with_deadline(deadline, writer.write_all(slice)).await?;
    }
    with_deadline(deadline, writer.flush()).await?;
    Ok(())
}

/// One accepted connection on the server.
///
/// Generic over the stream so it can be driven by a `TcpStream` or an
/// in-memory pipe.
pub struct TcpServerSession<S> {
    stream: BufReader<S>,
    peer: String,
    payload: Payload,
    io_timeout: Option<Duration>,
    state: SessionState,
    scratch: Vec<u8>,
}

impl<S> TcpServerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>, payload: Payload, config: &Config) -> Self {
        Self {
            stream: BufReader::new(stream),
            peer: peer.into(),
            payload,
            io_timeout: config.io_timeout,
            state: SessionState::AwaitCommand,
            scratch: vec![0u8; RECV_CHUNK],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serves commands until `Bye`, a rejected command or the peer leaves.
    pub async fn run(mut self) -> Result<()> {
        info!("{} linked.", self.peer);

        while self.state != SessionState::Closed {
            let line = match with_deadline(self.io_timeout, read_line(&mut self.stream)).await {
                Ok(line) => line,
                Err(Error::Connection(_)) => {
                    info!("{} disconnected", self.peer);
                    self.state = SessionState::Closed;
                    break;
                }
                Err(e) => return Err(e),
            };
            self.handle_line(&line).await?;
        }

        Ok(())
    }

    /// Executes one command line and updates the state.
    pub async fn handle_line(&mut self, line: &str) -> Result<SessionState> {
        debug!("Recv command: {}", line);

        match Command::decode(line) {
            Ok(cmd @ Command::Hello { .. }) => {
                if cmd.is_supported_hello() {
                    self.reply(REPLY_OK).await?;
                } else {
                    self.reply(REPLY_UNSUPPORTED_VERSION).await?;
                    self.state = SessionState::Closed;
                }
            }
            Ok(Command::Bye) => {
                self.reply(REPLY_GOOD_BYE).await?;
                self.state = SessionState::Closed;
            }
            Ok(Command::Transfer {
                direction: Direction::ServerSends,
                bytes,
            }) => {
                self.state = SessionState::Sending;
                write_payload(
                    &mut self.stream,
                    &self.payload,
                    bytes,
                    self.payload.len(),
                    self.io_timeout,
                )
                .await?;
                debug!("Send {} KB data finished.", bytes / 1024);
                self.state = SessionState::AwaitCommand;
            }
            Ok(Command::Transfer {
                direction: Direction::ClientSends,
                bytes,
            }) => {
                self.reply(REPLY_OK).await?;
                self.state = SessionState::Receiving;
                drain_exact(&mut self.stream, bytes, &mut self.scratch, self.io_timeout).await?;
                self.reply(REPLY_OK).await?;
                debug!("Recv {} KB data finished.", bytes / 1024);
                self.state = SessionState::AwaitCommand;
            }
            Err(e) => {
                warn!("{} sent a bad command: {}", self.peer, e);
                self.reply(&e.reply()).await?;
                self.state = SessionState::Closed;
            }
        }

        Ok(self.state)
    }

    async fn reply(&mut self, text: &str) -> Result<()> {
        if text != REPLY_OK {
            info!("send acknowledge: {}", text);
        }
        with_deadline(self.io_timeout, write_line(self.stream.get_mut(), text)).await
    }
}

/// Client end of a TCP speed test.
pub struct TcpClient<S = TcpStream> {
    stream: BufReader<S>,
    payload: Payload,
    io_timeout: Option<Duration>,
    scratch: Vec<u8>,
}

impl TcpClient<TcpStream> {
    /// Connects to `addr` (`host:port`).
    pub async fn connect(addr: &str, config: &Config) -> Result<Self> {
        debug!("Begin connect to {}", addr);
        let stream = with_deadline(config.io_timeout, TcpStream::connect(addr)).await?;
        stream.set_nodelay(true)?;
        info!("Connected {}.", addr);
        Ok(Self::new(stream, Payload::random(config.block_size), config.io_timeout))
    }
}

impl<S> TcpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, payload: Payload, io_timeout: Option<Duration>) -> Self {
        Self {
            stream: BufReader::new(stream),
            payload,
            io_timeout,
            scratch: vec![0u8; RECV_CHUNK],
        }
    }

    async fn write_command(&mut self, cmd: &Command) -> Result<()> {
        debug!("Send command: {}", cmd);
        with_deadline(
            self.io_timeout,
            write_line(self.stream.get_mut(), &cmd.encode()),
        )
        .await
    }

    async fn read_reply(&mut self) -> Result<String> {
        with_deadline(self.io_timeout, read_line(&mut self.stream)).await
    }

    /// Sends one command and returns the reply line.
    pub async fn send_command(&mut self, cmd: &Command) -> Result<String> {
        self.write_command(cmd).await?;
        self.read_reply().await
    }

    async fn expect_ok(&mut self) -> Result<()> {
        let reply = self.read_reply().await?;
        if is_ok(&reply) {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedReply(reply).into())
        }
    }

    /// `Send <n>`: the server streams `n` bytes, read until all arrived.
    pub async fn recv_test_block(&mut self, count: u64) -> Result<()> {
        self.write_command(&Command::transfer(Direction::ServerSends, count))
            .await?;
        drain_exact(&mut self.stream, count, &mut self.scratch, self.io_timeout).await
    }

    /// `Recv <n>`: announce, stream `n` bytes, wait for the acknowledgement.
    pub async fn send_test_block(&mut self, count: u64) -> Result<()> {
        self.announce_upload(count).await?;
        self.push_upload(count).await
    }

    /// Sends `Recv <n>` and waits for the server to accept it.
    pub async fn announce_upload(&mut self, count: u64) -> Result<()> {
        self.write_command(&Command::transfer(Direction::ClientSends, count))
            .await?;
        self.expect_ok().await
    }

    /// Streams `n` bytes of an accepted upload and waits for the final `OK`.
    pub async fn push_upload(&mut self, count: u64) -> Result<()> {
        write_payload(
            self.stream.get_mut(),
            &self.payload,
            count,
            self.payload.len(),
            self.io_timeout,
        )
        .await?;
        self.expect_ok().await
    }
}

#[async_trait]
impl<S> BlockTransfer for TcpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
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
impl<S> SpeedTestSession for TcpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn say_hello(&mut self) -> Result<String> {
        self.send_command(&Command::hello()).await
    }

    async fn say_bye(&mut self) -> Result<String> {
        let reply = self.send_command(&Command::Bye).await?;
        info!("Response: {}", reply);
        Ok(reply)
    }
}
