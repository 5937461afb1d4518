use crate::config::{Config, Protocol};
use crate::estimator::{BlockTransfer, Estimator};
use crate::measurements::{format_rate, Iteration, MeasurementRun, MeasurementsCollector};
use crate::protocol::{is_ok, Direction, ProtocolError, REPLY_UNSUPPORTED_VERSION};
use crate::tcp::TcpClient;
use crate::udp::UdpClient;
use crate::{Error, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Progress event types reported during a test.
///
/// # Examples
///
/// ```no_run
/// use speedtest::{Client, Config, ProgressEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5201);
///
/// let client = Client::new(config)?
///     .with_callback(|event: ProgressEvent| {
///         if let ProgressEvent::RunCompleted { direction, peak_bytes_per_second } = event {
///             println!("{}: {:.0} B/s", direction, peak_bytes_per_second);
///         }
///     });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The server accepted the handshake.
    HandshakeCompleted,
    /// One block finished.
    IterationCompleted {
        direction: Direction,
        block_size: u64,
        duration: Duration,
        bytes_per_second: f64,
    },
    /// A download or upload phase used up its time budget.
    RunCompleted {
        direction: Direction,
        peak_bytes_per_second: f64,
    },
    /// The test stopped with an error.
    Error(String),
}

/// Receives [`ProgressEvent`]s while a test runs.
///
/// Implemented for every `Fn(ProgressEvent) + Send + Sync`.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

type CallbackRef = Arc<dyn ProgressCallback>;

/// Client side of a speed test session, independent of transport.
#[async_trait]
pub trait SpeedTestSession: BlockTransfer {
    /// Sends the handshake and returns the server's reply.
    async fn say_hello(&mut self) -> Result<String>;

    /// Sends `Bye` and returns the server's reply.
    async fn say_bye(&mut self) -> Result<String>;

    /// Measures server-to-client throughput for `period`.
    async fn download(&mut self, estimator: &Estimator, period: Duration) -> Result<MeasurementRun> {
        estimator
            .run(self, Direction::ServerSends, period, &|_: &Iteration| {})
            .await
    }

    /// Measures client-to-server throughput for `period`.
    async fn upload(&mut self, estimator: &Estimator, period: Duration) -> Result<MeasurementRun> {
        estimator
            .run(self, Direction::ClientSends, period, &|_: &Iteration| {})
            .await
    }
}

/// Handshake, download, upload, bye.
///
/// A rejected handshake is logged and reported as a protocol error without
/// transferring any data.
pub async fn start<S>(
    session: &mut S,
    estimator: &Estimator,
    period: Duration,
    on_event: &(dyn Fn(ProgressEvent) + Sync),
) -> Result<Vec<MeasurementRun>>
where
    S: SpeedTestSession + ?Sized,
{
    let reply = session.say_hello().await?;
    if !is_ok(&reply) {
        warn!("Login error: {}", reply);
        let err = if reply.trim() == REPLY_UNSUPPORTED_VERSION {
            ProtocolError::UnsupportedVersion(reply)
        } else {
            ProtocolError::UnexpectedReply(reply)
        };
        return Err(err.into());
    }
    on_event(ProgressEvent::HandshakeCompleted);

    let mut runs = Vec::with_capacity(2);
    for direction in [Direction::ServerSends, Direction::ClientSends] {
        let observer = |it: &Iteration| {
            on_event(ProgressEvent::IterationCompleted {
                direction,
                block_size: it.block_size,
                duration: it.duration,
                bytes_per_second: it.bytes_per_second,
            })
        };
        let run = estimator.run(session, direction, period, &observer).await?;
        on_event(ProgressEvent::RunCompleted {
            direction,
            peak_bytes_per_second: run.peak_bytes_per_second,
        });
        runs.push(run);
    }

    session.say_bye().await?;
    Ok(runs)
}

/// Speed test client.
///
/// # Examples
///
/// ```no_run
/// use speedtest::{Client, Config, Protocol};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_protocol(Protocol::Tcp)
///     .with_period(Duration::from_secs(3));
///
/// let client = Client::new(config)?;
/// client.run().await?;
///
/// if let Some(peak) = client.get_measurements().peak_download() {
///     println!("Peak download: {:.0} B/s", peak);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    measurements: MeasurementsCollector,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
}

impl Client {
    /// Creates a client; fails if the configuration cannot produce a test.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            measurements: MeasurementsCollector::new(),
            callback: None,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Attaches a progress callback.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    /// Token that stops the running measurement after the current block.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Connects, runs download then upload, and says goodbye.
    pub async fn run(&self) -> Result<()> {
        let host = self
            .config
            .server_addr
            .as_deref()
            .ok_or_else(|| Error::Config("Server address not set".to_string()))?;

        info!(
            "Begin {} speed test against {}:{}",
            self.config.protocol, host, self.config.port
        );

        let result = match self.config.protocol {
            Protocol::Tcp => {
                let addr = format!("{}:{}", host, self.config.port);
                match TcpClient::connect(&addr, &self.config).await {
                    Ok(mut session) => self.run_session(&mut session).await,
                    Err(e) => Err(e),
                }
            }
            Protocol::Udp => match UdpClient::connect(host, self.config.port, &self.config).await {
                Ok(mut session) => self.run_session(&mut session).await,
                Err(e) => Err(e),
            },
        };

        if let Err(e) = &result {
            self.notify(ProgressEvent::Error(e.to_string()));
        }
        result
    }

    async fn run_session<S: SpeedTestSession>(&self, session: &mut S) -> Result<()> {
        let estimator =
            Estimator::from_config(&self.config).with_cancellation(self.cancellation_token.clone());
        let notify = |event: ProgressEvent| self.notify(event);

        let runs = start(session, &estimator, self.config.period, &notify).await?;
        for run in runs {
            info!(
                "{} peak {} over {} iterations",
                run.direction,
                format_rate(run.peak_bytes_per_second),
                run.iterations.len()
            );
            self.measurements.push(run);
        }
        Ok(())
    }

    /// Every run completed so far.
    pub fn get_measurements(&self) -> crate::Measurements {
        self.measurements.get()
    }
}
