use std::sync::Arc;
use std::time::{Duration, Instant};

use shared::types::{MineResult, Work};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::hasher::Hasher;

/// Smoothing for realized per-round hashrates.
const EMA_FACTOR: f64 = 0.1;
const SUMMARY_EVERY: Duration = Duration::from_secs(30);
/// Target wall-clock per dispatch round, so shares rebalance on live rates.
const ROUND_TARGET_SECS: f64 = 5.0;
/// Round size before any rate has been measured.
const MIN_ROUND: u64 = 1 << 20;

struct Slot {
    hasher: Arc<dyn Hasher>,
    /// Fraction of each dispatched nonce range this hasher receives.
    share: f64,
    /// Smoothed realized hashrate, hashes per second.
    rate: f64,
}

/// Dispatches challenge work across heterogeneous hashers and reports the
/// winning nonce. Protocol: reads `Option<Work>` from the input channel,
/// writes `Option<MineResult>` to the output channel. `None` in means
/// graceful shutdown; the group drains in-flight hashers, emits a single
/// terminal `None` and closes.
pub struct MiningGroup {
    slots: Vec<Slot>,
    last_summary: Instant,
}

enum RoundEnd {
    Solved(MineResult),
    Exhausted,
    Preempted(Work),
    Shutdown,
}

impl MiningGroup {
    pub fn new(hashers: Vec<Arc<dyn Hasher>>) -> Self {
        let share = 1.0 / hashers.len().max(1) as f64;
        MiningGroup {
            slots: hashers
                .into_iter()
                .map(|hasher| Slot { hasher, share, rate: 0.0 })
                .collect(),
            last_summary: Instant::now(),
        }
    }

    pub async fn mine(
        mut self,
        mut input: mpsc::Receiver<Option<Work>>,
        output: mpsc::Sender<Option<MineResult>>,
    ) {
        'idle: loop {
            let mut work = match input.recv().await {
                Some(Some(work)) => work,
                Some(None) | None => break 'idle,
            };

            let mut round_start = work.start;
            loop {
                let round_n = self.round_size(work.n);
                match self.run_round(&work, round_start, round_n, &mut input).await {
                    RoundEnd::Solved(result) => {
                        if output.send(Some(result)).await.is_err() {
                            return;
                        }
                        continue 'idle;
                    }
                    RoundEnd::Exhausted => {
                        self.rebalance();
                        self.maybe_log_summary();
                        round_start = round_start.wrapping_add(round_n);
                    }
                    RoundEnd::Preempted(new_work) => {
                        debug!("work preempted by a new challenge");
                        work = new_work;
                        round_start = work.start;
                    }
                    RoundEnd::Shutdown => break 'idle,
                }
            }
        }

        self.log_summary();
        let _ = output.send(None).await;
    }

    /// How many nonces the next round should cover, given current rates.
    fn round_size(&self, work_n: u64) -> u64 {
        let total_rate: f64 = self.slots.iter().map(|s| s.rate).sum();
        if total_rate <= 0.0 {
            return MIN_ROUND.min(work_n);
        }
        ((total_rate * ROUND_TARGET_SECS) as u64).max(MIN_ROUND).min(work_n)
    }

    /// Dispatches one `[start, start+n)` round across all hashers and waits
    /// for a winner, exhaustion, preemption or shutdown. Always drains every
    /// spawned hasher before returning.
    async fn run_round(
        &mut self,
        work: &Work,
        start: u64,
        n: u64,
        input: &mut mpsc::Receiver<Option<Work>>,
    ) -> RoundEnd {
        let cancel = CancellationToken::new();
        let (done_tx, mut done_rx) = mpsc::channel(self.slots.len().max(1));

        let count = self.slots.len();
        let mut offset = start;
        let mut remaining = n;
        let mut spawned = 0usize;
        for (idx, slot) in self.slots.iter().enumerate() {
            let size = if idx == count - 1 {
                remaining
            } else {
                (((n as f64) * slot.share) as u64).min(remaining)
            };
            remaining -= size;

            let hasher = slot.hasher.clone();
            let work = work.clone();
            let child = cancel.clone();
            let done = done_tx.clone();
            let sub_start = offset;
            offset = offset.wrapping_add(size);
            spawned += 1;
            tokio::task::spawn_blocking(move || {
                let timer = Instant::now();
                let outcome = hasher.check_range(&work, sub_start, size, &child);
                let _ = done.blocking_send((idx, outcome, timer.elapsed()));
            });
        }
        drop(done_tx);

        let mut solved: Option<MineResult> = None;
        let mut interrupt: Option<Option<Work>> = None;
        let mut failures = 0usize;
        let mut finished = 0usize;
        while finished < spawned {
            tokio::select! {
                msg = input.recv(), if !matches!(interrupt, Some(None)) => {
                    // A new work preempts the round; nil means shutdown.
                    interrupt = Some(msg.unwrap_or(None));
                    cancel.cancel();
                }
                res = done_rx.recv() => {
                    let Some((idx, outcome, elapsed)) = res else { break };
                    finished += 1;
                    match outcome {
                        Ok(range) => {
                            self.update_rate(idx, range.hashes, elapsed);
                            if let Some(nonce) = range.nonce {
                                if solved.is_none() && interrupt.is_none() {
                                    solved = Some(MineResult { work: work.clone(), nonce });
                                    cancel.cancel();
                                }
                            }
                        }
                        Err(err) => {
                            failures += 1;
                            error!("{} failed: {err}", self.slots[idx].hasher.name());
                        }
                    }
                }
            }
        }

        match interrupt {
            Some(Some(work)) => RoundEnd::Preempted(work),
            Some(None) => RoundEnd::Shutdown,
            None => match solved {
                Some(result) => RoundEnd::Solved(result),
                None if failures == spawned && spawned > 0 => {
                    error!("every hasher failed, stopping the mining group");
                    RoundEnd::Shutdown
                }
                None => RoundEnd::Exhausted,
            },
        }
    }

    fn update_rate(&mut self, idx: usize, hashes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || hashes == 0 {
            return;
        }
        let realized = hashes as f64 / secs;
        let slot = &mut self.slots[idx];
        slot.rate = if slot.rate == 0.0 {
            realized
        } else {
            slot.rate * (1.0 - EMA_FACTOR) + realized * EMA_FACTOR
        };
    }

    fn rebalance(&mut self) {
        let total: f64 = self.slots.iter().map(|s| s.rate.max(1.0)).sum();
        if total <= 0.0 {
            return;
        }
        for slot in &mut self.slots {
            slot.share = slot.rate.max(1.0) / total;
        }
    }

    fn maybe_log_summary(&mut self) {
        if self.last_summary.elapsed() >= SUMMARY_EVERY {
            self.log_summary();
            self.last_summary = Instant::now();
        }
    }

    fn log_summary(&self) {
        let total: f64 = self.slots.iter().map(|s| s.rate).sum();
        info!("hashrate {:.0} H/s", total);
        for slot in &self.slots {
            debug!(
                "  {} {:.0} H/s share {:.2}",
                slot.hasher.name(),
                slot.rate,
                slot.share
            );
        }
    }
}
