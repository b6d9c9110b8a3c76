use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use shared::types::Work;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{meets_difficulty, puzzle_hash, puzzle_prefix};

/// Nonces tested between cancellation checks. Sized so a slow CPU still
/// reacts to cancellation well inside 100ms.
const BATCH: u64 = 16_384;

#[derive(Error, Debug)]
pub enum HasherError {
    #[error("bad miner address {0:?}")]
    BadAddress(String),
    #[error("device failure: {0}")]
    Device(String),
}

#[derive(Debug, Default)]
pub struct RangeOutcome {
    /// The winning nonce, or `None` when the range exhausted.
    pub nonce: Option<String>,
    /// Hashes actually performed.
    pub hashes: u64,
}

/// One compute device testing contiguous nonce ranges against the puzzle.
/// GPU kernels implement this trait and own their device context for the
/// lifetime of the hasher.
pub trait Hasher: Send + Sync {
    fn name(&self) -> &str;

    /// Last measured rate in hashes per second.
    fn hash_rate(&self) -> f64;

    /// Tests `[start, start+n)`. Returns early with a nonce when the
    /// predicate holds, or when `cancel` fires between internal batches.
    fn check_range(
        &self,
        work: &Work,
        start: u64,
        n: u64,
        cancel: &CancellationToken,
    ) -> Result<RangeOutcome, HasherError>;
}

pub struct CpuHasher {
    name: String,
    core: Option<core_affinity::CoreId>,
    rate_bits: AtomicU64,
}

impl CpuHasher {
    pub fn new(index: usize) -> Self {
        let core = core_affinity::get_core_ids()
            .unwrap_or_default()
            .into_iter()
            .nth(index);
        CpuHasher {
            name: format!("CPU {index}"),
            core,
            rate_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn record_rate(&self, hashes: u64, elapsed: std::time::Duration) {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 && hashes > 0 {
            self.rate_bits.store((hashes as f64 / secs).to_bits(), Ordering::Relaxed);
        }
    }
}

impl Hasher for CpuHasher {
    fn name(&self) -> &str {
        &self.name
    }

    fn hash_rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Relaxed))
    }

    fn check_range(
        &self,
        work: &Work,
        start: u64,
        n: u64,
        cancel: &CancellationToken,
    ) -> Result<RangeOutcome, HasherError> {
        if let Some(core) = self.core {
            core_affinity::set_for_current(core);
        }

        let prefix = puzzle_prefix(work)?;
        let difficulty = work.challenge.difficulty;
        let end = start.saturating_add(n);
        let timer = Instant::now();
        let mut input = prefix.clone();
        let mut hashes = 0u64;
        let mut nonce = start;

        while nonce < end {
            let batch_end = end.min(nonce.saturating_add(BATCH));
            while nonce < batch_end {
                let text = nonce.to_string();
                input.truncate(prefix.len());
                input.extend_from_slice(text.as_bytes());
                hashes += 1;
                if meets_difficulty(puzzle_hash(&input), difficulty) {
                    self.record_rate(hashes, timer.elapsed());
                    debug!("{} found nonce {text} after {hashes} hashes", self.name);
                    return Ok(RangeOutcome { nonce: Some(text), hashes });
                }
                nonce += 1;
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        self.record_rate(hashes, timer.elapsed());
        Ok(RangeOutcome { nonce: None, hashes })
    }
}
