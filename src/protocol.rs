//! Text control protocol shared by the TCP and UDP sessions.
//!
//! Commands are `<Verb> [arg]` with a case-insensitive verb:
//!
//! | Command | Meaning |
//! |---|---|
//! | `SpeedTest V1` | handshake |
//! | `Send <bytes>` | server sends `<bytes>` to the client |
//! | `Recv <bytes>` | server receives `<bytes>` from the client |
//! | `Bye` | end of session |
//!
//! `Send`/`Recv` are named from the server's point of view. Outside this
//! module the direction is carried by [`Direction`] instead of the verb.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Only protocol version spoken by this crate.
pub const PROTOCOL_VERSION: &str = "V1";

/// Longest accepted control line or control datagram.
pub const MAX_CONTROL_LEN: usize = 1024;

pub const REPLY_OK: &str = "OK";
pub const REPLY_UNSUPPORTED_VERSION: &str = "Unsupported protocol version.";
pub const REPLY_GOOD_BYE: &str = "Good bye.";
pub const REPLY_NO_SIZE: &str = "Not size parameter.";
pub const REPLY_TOO_LONG: &str = "Command too long.";
pub const REPLY_NOT_TEXT: &str = "Command is not text.";
pub const REPLY_UNEXPECTED: &str = "Unexpected reply.";

/// Which peer writes the bytes of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Server writes, client reads (wire verb `Send`, a download)
    ServerSends,
    /// Client writes, server reads (wire verb `Recv`, an upload)
    ClientSends,
}

impl Direction {
    fn verb(self) -> &'static str {
        match self {
            Direction::ServerSends => "Send",
            Direction::ClientSends => "Recv",
        }
    }

    /// Name of the measurement phase from the client's point of view.
    pub fn phase(self) -> &'static str {
        match self {
            Direction::ServerSends => "download",
            Direction::ClientSends => "upload",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.phase())
    }
}

/// A decoded control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Handshake; only [`PROTOCOL_VERSION`] is supported
    Hello { version: String },
    /// Move exactly `bytes` bytes in `direction`
    Transfer { direction: Direction, bytes: u64 },
    /// Terminate the session
    Bye,
}

impl Command {
    /// Handshake for the supported protocol version.
    pub fn hello() -> Self {
        Command::Hello {
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn transfer(direction: Direction, bytes: u64) -> Self {
        Command::Transfer { direction, bytes }
    }

    /// Wire text without any line terminator.
    ///
    /// ```
    /// use speedtest::protocol::{Command, Direction};
    ///
    /// assert_eq!(Command::hello().encode(), "SpeedTest V1");
    /// assert_eq!(Command::transfer(Direction::ServerSends, 4096).encode(), "Send 4096");
    /// assert_eq!(Command::transfer(Direction::ClientSends, 8192).encode(), "Recv 8192");
    /// ```
    pub fn encode(&self) -> String {
        match self {
            Command::Hello { version } => format!("SpeedTest {}", version),
            Command::Transfer { direction, bytes } => format!("{} {}", direction.verb(), bytes),
            Command::Bye => "Bye".to_string(),
        }
    }

    /// Parses one control line.
    ///
    /// Surrounding whitespace is ignored, the verb is case-insensitive and the
    /// argument is the text after the first single space. A missing or
    /// non-numeric size is reported as [`ProtocolError::MissingSize`].
    ///
    /// ```
    /// use speedtest::protocol::{Command, Direction, ProtocolError};
    ///
    /// assert_eq!(
    ///     Command::decode("RECV 100\r\n"),
    ///     Ok(Command::transfer(Direction::ClientSends, 100))
    /// );
    /// assert_eq!(Command::decode("send"), Err(ProtocolError::MissingSize));
    /// ```
    pub fn decode(line: &str) -> std::result::Result<Self, ProtocolError> {
        let text = line.trim();
        let mut parts = text.split(' ');
        let verb = parts.next().unwrap_or_default().to_lowercase();
        let arg = parts.next();

        match verb.as_str() {
            "speedtest" => Ok(Command::Hello {
                version: arg.unwrap_or_default().to_string(),
            }),
            "send" => parse_size(arg).map(|bytes| Command::transfer(Direction::ServerSends, bytes)),
            "recv" => parse_size(arg).map(|bytes| Command::transfer(Direction::ClientSends, bytes)),
            "bye" => Ok(Command::Bye),
            _ => Err(ProtocolError::Unknown(text.to_string())),
        }
    }

    /// True for a handshake this crate can serve.
    pub fn is_supported_hello(&self) -> bool {
        matches!(self, Command::Hello { version } if version.eq_ignore_ascii_case(PROTOCOL_VERSION))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn parse_size(arg: Option<&str>) -> std::result::Result<u64, ProtocolError> {
    arg.and_then(|a| a.parse::<u64>().ok())
        .ok_or(ProtocolError::MissingSize)
}

/// Malformed, unsupported or unexpected control traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing or invalid size parameter")]
    MissingSize,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("control message exceeds 1024 bytes")]
    Oversized,

    #[error("control message is not valid UTF-8")]
    NotText,

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl ProtocolError {
    /// Acknowledgement text sent back to the peer that caused the error.
    pub fn reply(&self) -> String {
        match self {
            ProtocolError::MissingSize => REPLY_NO_SIZE.to_string(),
            ProtocolError::UnsupportedVersion(_) => REPLY_UNSUPPORTED_VERSION.to_string(),
            ProtocolError::Unknown(text) => format!("Unknown command: {}", text),
            ProtocolError::Oversized => REPLY_TOO_LONG.to_string(),
            ProtocolError::NotText => REPLY_NOT_TEXT.to_string(),
            ProtocolError::UnexpectedReply(_) => REPLY_UNEXPECTED.to_string(),
        }
    }
}

/// True when a reply is the positive acknowledgement (any case).
pub fn is_ok(reply: &str) -> bool {
    reply.trim().eq_ignore_ascii_case(REPLY_OK)
}

/// Decodes a control datagram, enforcing the size bound.
pub fn decode_datagram(data: &[u8]) -> std::result::Result<String, ProtocolError> {
    if data.len() > MAX_CONTROL_LEN {
        return Err(ProtocolError::Oversized);
    }
    std::str::from_utf8(data)
        .map(|s| s.trim().to_string())
        .map_err(|_| ProtocolError::NotText)
}

/// Writes `text` followed by `\r\n` and flushes.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<()> {
    let mut line = Vec::with_capacity(text.len() + 2);
    line.extend_from_slice(text.as_bytes());
    line.extend_from_slice(b"\r\n");
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one control line of at most [`MAX_CONTROL_LEN`] bytes.
///
/// The returned text is trimmed. End of stream before any byte is an
/// [`Error::Connection`]; end of stream after a partial line returns the
/// partial line.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let bytes = reader.fill_buf().await?;
        if bytes.is_empty() {
            if line.is_empty() {
                return Err(Error::Connection("connection closed by peer".to_string()));
            }
            break;
        }

        if let Some(newline_pos) = bytes.iter().position(|&b| b == b'\n') {
            let to_read = newline_pos + 1;
            if line.len() + to_read > MAX_CONTROL_LEN {
                return Err(ProtocolError::Oversized.into());
            }
            line.extend_from_slice(&bytes[..to_read]);
            reader.consume(to_read);
            break;
        }

        let len = bytes.len();
        if line.len() + len > MAX_CONTROL_LEN {
            return Err(ProtocolError::Oversized.into());
        }
        line.extend_from_slice(bytes);
        reader.consume(len);
    }

    String::from_utf8(line)
        .map(|s| s.trim().to_string())
        .map_err(|_| ProtocolError::NotText.into())
}
