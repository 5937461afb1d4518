//! Peak throughput estimation by geometric block ramping.
//!
//! A run transfers a block of `base` bytes, then `2·base`, `4·base`, ...
//! (never more than the configured cap) until the summed transfer time
//! reaches the time budget. The reported figure is the best single
//! iteration, not the average.

use crate::config::Config;
use crate::measurements::{format_rate, Iteration, MeasurementRun};
use crate::protocol::Direction;
use crate::Result;
use async_trait::async_trait;
use log::{debug, info};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Moves one block of exactly `bytes` bytes in `direction` and returns once
/// the block is complete from the caller's point of view.
#[async_trait]
pub trait BlockTransfer: Send {
    /// Control exchange that must finish before the block is timed, such as
    /// announcing an upload and waiting for the peer to accept it.
    async fn prepare_block(&mut self, _direction: Direction, _bytes: u64) -> Result<()> {
        Ok(())
    }

    async fn transfer_block(&mut self, direction: Direction, bytes: u64) -> Result<()>;
}

/// Drives a [`BlockTransfer`] until a time budget is used up.
#[derive(Debug, Clone)]
pub struct Estimator {
    base_block_size: u64,
    max_block_size: u64,
    cancel: CancellationToken,
}

impl Estimator {
    pub fn new(base_block_size: u64, max_block_size: u64) -> Self {
        Self {
            base_block_size,
            max_block_size: max_block_size.max(base_block_size),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.block_size as u64, config.max_block_size)
    }

    /// Stops future runs between iterations once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Block size that follows `current` in the ramp.
    pub fn next_block_size(&self, current: u64) -> u64 {
        current.saturating_mul(2).min(self.max_block_size)
    }

    /// Measures one direction for `period`.
    ///
    /// Any transfer error aborts the whole run. `on_iteration` sees every
    /// completed iteration.
    pub async fn run<T>(
        &self,
        transfer: &mut T,
        direction: Direction,
        period: Duration,
        on_iteration: &(dyn Fn(&Iteration) + Sync),
    ) -> Result<MeasurementRun>
    where
        T: BlockTransfer + ?Sized,
    {
        let mut run = MeasurementRun::new(direction, period);
        let mut block_size = self.base_block_size;

        while !run.is_exhausted() {
            if self.cancel.is_cancelled() {
                info!("{} cancelled after {} iterations", direction, run.iterations.len());
                break;
            }

            transfer.prepare_block(direction, block_size).await?;
            let start = Instant::now();
            transfer.transfer_block(direction, block_size).await?;
            let iteration = Iteration::new(block_size, start.elapsed());

            info!(
                "{} time: {:.6}s. size {} K. speed: {:.2} KB/S",
                direction,
                iteration.duration.as_secs_f64(),
                block_size / 1024,
                iteration.bytes_per_second / 1024.0
            );
            on_iteration(&iteration);
            run.record(iteration);

            block_size = self.next_block_size(block_size);
        }

        debug!(
            "{} finished: {} iterations, {} bytes in {:.3}s",
            direction,
            run.iterations.len(),
            run.total_bytes(),
            run.elapsed.as_secs_f64()
        );
        info!(
            "Max {} speed: {}",
            direction,
            format_rate(run.peak_bytes_per_second)
        );

        Ok(run)
    }
}
