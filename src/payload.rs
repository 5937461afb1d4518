//! Shared transfer payload
//!
//! Every byte written during a measurement comes from one block of
//! pseudo-random printable bytes generated at startup. The block is never
//! mutated, so it is shared between tasks without locking.

use rand::Rng;
use std::sync::Arc;

/// Default client payload length and first block size of the ramp.
pub const TCP_BLOCK_SIZE: usize = 4096;

/// Default server payload length.
pub const SERVER_BLOCK_SIZE: usize = 65536;

/// Immutable block of pseudo-random bytes reused for all transfers.
#[derive(Clone, Debug)]
pub struct Payload {
    data: Arc<[u8]>,
}

impl Payload {
    /// Generates a payload of `len` printable ASCII bytes (at least one).
    pub fn random(len: usize) -> Self {
        let mut rng = rand::thread_rng();
        let data: Vec<u8> = (0..len.max(1)).map(|_| rng.gen_range(b'!'..=b'~')).collect();
        Self { data: data.into() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Slices that together add up to exactly `total` bytes.
    ///
    /// Each slice starts at the beginning of the payload and is at most
    /// `max_chunk` bytes long (and never longer than the payload itself).
    ///
    /// ```
    /// use speedtest::payload::Payload;
    ///
    /// let payload = Payload::random(4096);
    /// let sizes: Vec<usize> = payload.chunks(10_000, 4096).map(|c| c.len()).collect();
    /// assert_eq!(sizes, vec![4096, 4096, 1808]);
    /// ```
    pub fn chunks(&self, total: u64, max_chunk: usize) -> Chunks<'_> {
        let chunk = max_chunk.clamp(1, self.data.len());
        Chunks {
            data: &self.data[..chunk],
            remaining: total,
        }
    }
}

/// Iterator returned by [`Payload::chunks`].
pub struct Chunks<'a> {
    data: &'a [u8],
    remaining: u64,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let n = self.remaining.min(self.data.len() as u64) as usize;
        self.remaining -= n as u64;
        Some(&self.data[..n])
    }
}
