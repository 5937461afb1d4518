use crate::payload::{SERVER_BLOCK_SIZE, TCP_BLOCK_SIZE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Default port used by both sides when nothing else is configured.
pub const DEFAULT_PORT: u16 = 5201;

/// Upper bound for a single measurement block (256 MiB).
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 256 * 1024 * 1024;

/// Transport used for both the control commands and the measured data.
///
/// # Examples
///
/// ```
/// use speedtest::{Config, Protocol};
///
/// let config = Config::client("127.0.0.1".to_string(), 5201)
///     .with_protocol(Protocol::Udp);
/// assert_eq!(config.protocol, Protocol::Udp);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Stream transport; commands and replies are `\r\n` terminated lines
    #[serde(rename = "TCP", alias = "tcp", alias = "Tcp")]
    Tcp,
    /// Datagram transport; one command or reply per datagram, no retransmission
    #[serde(rename = "UDP", alias = "udp", alias = "Udp")]
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Test mode: client or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - answers commands until the process is terminated
    Server,
    /// Client mode - handshake, download, upload, bye
    Client,
}

/// Configuration for a speed test client or server.
///
/// Use [`Config::client`] or [`Config::server`] and the `with_*` builder
/// methods to customize it.
///
/// # Examples
///
/// ```
/// use speedtest::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_period(Duration::from_secs(5))
///     .with_io_timeout(Duration::from_secs(2));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Protocol to use (TCP or UDP)
    pub protocol: Protocol,

    /// Port number to use
    pub port: u16,

    /// Server address (for client mode)
    pub server_addr: Option<String>,

    /// Bind address (for server mode); `0.0.0.0` when unset
    pub bind_addr: Option<IpAddr>,

    /// Time budget for each of the download and upload phases
    pub period: Duration,

    /// First block size of the geometric ramp, also the client payload length
    pub block_size: usize,

    /// Block sizes stop doubling once they reach this value
    pub max_block_size: u64,

    /// Payload length the server transmits from
    pub server_block_size: usize,

    /// Deadline for every blocking network call; `None` waits forever
    pub io_timeout: Option<Duration>,

    /// How long a UDP peer may keep an unfinished `Recv` open
    pub pending_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            protocol: Protocol::Tcp,
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: None,
            period: Duration::from_secs(3),
            block_size: TCP_BLOCK_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            server_block_size: SERVER_BLOCK_SIZE,
            io_timeout: None,
            pending_ttl: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    ///
    /// ```
    /// use speedtest::Config;
    ///
    /// let config = Config::new();
    /// assert_eq!(config.port, 5201);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a server configuration listening on `port`.
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a client configuration targeting `server_addr:port`.
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the time budget of each measurement phase.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Sets the first block size of the ramp (default: 4096 bytes).
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Caps the geometric growth of block sizes.
    pub fn with_max_block_size(mut self, size: u64) -> Self {
        self.max_block_size = size;
        self
    }

    pub fn with_server_block_size(mut self, size: usize) -> Self {
        self.server_block_size = size;
        self
    }

    /// Bounds every blocking send and receive.
    ///
    /// Without a timeout a stalled peer stalls the session indefinitely.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Rejects configurations that could never produce a measurement.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Client && self.server_addr.is_none() {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(Error::Config("Block size must be positive".to_string()));
        }
        if self.server_block_size == 0 {
            return Err(Error::Config(
                "Server block size must be positive".to_string(),
            ));
        }
        if self.max_block_size < self.block_size as u64 {
            return Err(Error::Config(format!(
                "Maximum block size {} is smaller than block size {}",
                self.max_block_size, self.block_size
            )));
        }
        if self.mode == Mode::Client && self.period.is_zero() {
            return Err(Error::Config("Test period must be positive".to_string()));
        }
        Ok(())
    }
}

/// `log` section of the JSON configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write log lines to this file; stdout always gets them
    #[serde(default)]
    pub file_name: Option<String>,

    /// Size at which the log file is rotated
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    /// Rotated files kept next to the current one
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_name: None,
            max_bytes: default_max_bytes(),
            backup_count: default_backup_count(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_backup_count() -> usize {
    3
}

fn default_model() -> Protocol {
    Protocol::Tcp
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_period() -> f64 {
    3.0
}

/// `server` section of the JSON configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_model")]
    pub model: Protocol,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            port: default_port(),
        }
    }
}

/// `client` section of the JSON configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_model")]
    pub model: Protocol,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds spent on each of the download and upload phases
    #[serde(default = "default_period")]
    pub period: f64,
    #[serde(default)]
    pub io_timeout: Option<f64>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            host: default_host(),
            port: default_port(),
            period: default_period(),
            io_timeout: None,
        }
    }
}

/// Contents of the JSON configuration file.
///
/// Every section is optional.
///
/// ```
/// use speedtest::config::FileConfig;
/// use speedtest::Protocol;
///
/// let file = FileConfig::from_json_str(r#"{"client": {"model": "UDP", "period": 0.5}}"#).unwrap();
/// assert_eq!(file.client.model, Protocol::Udp);
/// assert_eq!(file.log.level, "info");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
}

impl FileConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn server_config(&self) -> Config {
        Config::server(self.server.port).with_protocol(self.server.model)
    }

    pub fn client_config(&self) -> Result<Config> {
        let client = &self.client;
        let period = Duration::try_from_secs_f64(client.period)
            .map_err(|e| Error::Config(format!("Invalid period {}: {}", client.period, e)))?;

        let mut config = Config::client(client.host.clone(), client.port)
            .with_protocol(client.model)
            .with_period(period);

        if let Some(secs) = client.io_timeout {
            let timeout = Duration::try_from_secs_f64(secs)
                .map_err(|e| Error::Config(format!("Invalid io_timeout {}: {}", secs, e)))?;
            config = config.with_io_timeout(timeout);
        }

        Ok(config)
    }
}
