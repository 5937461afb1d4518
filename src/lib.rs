//! speedtest - peak throughput measurement over TCP or UDP
//!
//! A client and a server exchange a small text protocol (`SpeedTest V1`,
//! `Send <n>`, `Recv <n>`, `Bye`) and move blocks of geometrically growing
//! size in each direction until a time budget is used up. The best
//! single-block rate is reported as the peak speed.
//!
//! # Features
//!
//! - TCP sessions with exact-count block transfers
//! - UDP sessions with counting acknowledgements, tracked per peer
//! - Optional deadline on every blocking network call
//! - Asynchronous I/O using tokio

pub mod protocol;
pub mod server;
pub mod client;
pub mod config;
pub mod measurements;
pub mod error;
pub mod estimator;
pub mod logging;
pub mod net;
pub mod payload;
pub mod tcp;
pub mod udp;

pub use error::{Error, Result};
pub use config::{Config, Protocol};
pub use measurements::Measurements;
pub use client::{Client, ProgressCallback, ProgressEvent};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
