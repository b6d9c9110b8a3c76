use std::sync::Arc;

use alloy_primitives::B256;
use anyhow::Context;
use shared::db::{self, Store};
use shared::errors::SubmitAbort;
use shared::types::{Challenge, MineResult, Work};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::eth::Contract;
use crate::ops::tips::TipRequester;
use crate::pow::solution::SolutionHandler;

/// Nonce range per dispatch; large enough that exhaustion effectively never
/// happens before the challenge rotates.
const WORK_SIZE: u64 = i64::MAX as u64;

/// The mining coordinator: feeds challenge work to the mining group,
/// routes winning nonces to the solution handler, and owns the shutdown
/// ordering for the mining half of the process.
pub struct MiningMgr {
    store: Store,
    contract: Arc<dyn Contract>,
    handler: Arc<SolutionHandler>,
    group_input: mpsc::Sender<Option<Work>>,
    group_output: mpsc::Receiver<Option<MineResult>>,
    challenge_rx: mpsc::Receiver<()>,
    /// Tips untipped rounds when `requestTips` is configured.
    tipper: Option<Arc<TipRequester>>,
    /// Miner address as lowercase hex without 0x, the form the puzzle hashes.
    public_addr: String,
}

impl MiningMgr {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        contract: Arc<dyn Contract>,
        handler: Arc<SolutionHandler>,
        group_input: mpsc::Sender<Option<Work>>,
        group_output: mpsc::Receiver<Option<MineResult>>,
        challenge_rx: mpsc::Receiver<()>,
        tipper: Option<Arc<TipRequester>>,
        public_addr: String,
    ) -> Self {
        MiningMgr {
            store,
            contract,
            handler,
            group_input,
            group_output,
            challenge_rx,
            tipper,
            public_addr,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let miner = format!("0x{}", self.public_addr)
            .parse()
            .context("bad miner address")?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.drain_group().await;
                    return Ok(());
                }
                notice = self.challenge_rx.recv() => {
                    if notice.is_none() {
                        self.drain_group().await;
                        anyhow::bail!("challenge tracker stopped");
                    }
                    let Some(challenge) = self.current_challenge()? else {
                        warn!("challenge notification without stored variables");
                        continue;
                    };
                    self.spawn_tip(&challenge, &shutdown);
                    match self.contract.did_mine(challenge.hash, miner).await {
                        Ok(true) => {
                            debug!("already answered challenge {:#x}", challenge.hash);
                            continue;
                        }
                        Ok(false) => {}
                        Err(err) => warn!("did-mine check failed, mining anyway: {err}"),
                    }
                    self.push_work(challenge).await;
                }
                result = self.group_output.recv() => {
                    match result {
                        Some(Some(result)) => self.spawn_submission(result, &shutdown),
                        Some(None) | None => {
                            self.drain_group().await;
                            anyhow::bail!("mining group closed unexpectedly");
                        }
                    }
                }
            }
        }
    }

    async fn push_work(&self, challenge: Challenge) {
        let work = Work {
            challenge,
            start: rand::random::<u64>() >> 1,
            n: WORK_SIZE,
            public_addr: self.public_addr.clone(),
        };
        if self.group_input.send(Some(work)).await.is_err() {
            warn!("mining group input closed");
        }
    }

    fn spawn_tip(&self, challenge: &Challenge, shutdown: &CancellationToken) {
        let Some(tipper) = self.tipper.clone() else { return };
        let challenge = challenge.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(err) = tipper.maybe_tip(&cancel, &challenge).await {
                warn!("tipping the round failed: {err:#}");
            }
        });
    }

    fn spawn_submission(&self, result: MineResult, shutdown: &CancellationToken) {
        info!(
            "solution found for challenge {:#x}, nonce {}",
            result.work.challenge.hash, result.nonce
        );
        let handler = self.handler.clone();
        let cancel = shutdown.child_token();
        // Mining continues while the submission runs; the handler serializes
        // submissions per address itself.
        tokio::spawn(async move {
            match handler.submit(&cancel, &result).await {
                Ok(_) => {}
                Err(SubmitAbort::TooSoon { since_last }) => {
                    debug!("skipping submission, {since_last}s since the last one")
                }
                Err(SubmitAbort::ChallengeSuperseded) => {
                    debug!("dropping a result for a superseded challenge")
                }
                Err(SubmitAbort::AlreadyMined) => {
                    debug!("dropping a result for an already answered challenge")
                }
                Err(err) => warn!("submission aborted: {err:#}"),
            }
        });
    }

    /// Graceful shutdown of the mining half: close the group's input and
    /// wait for its terminal nil, dropping any late results.
    async fn drain_group(&mut self) {
        let _ = self.group_input.send(None).await;
        loop {
            match self.group_output.recv().await {
                Some(Some(late)) => {
                    debug!(
                        "dropping late result for challenge {:#x}",
                        late.work.challenge.hash
                    )
                }
                Some(None) | None => return,
            }
        }
    }

    fn current_challenge(&self) -> anyhow::Result<Option<Challenge>> {
        let Some(hash) = self.store.get(db::CHALLENGE_KEY)? else {
            return Ok(None);
        };
        if hash.len() != 32 {
            anyhow::bail!("corrupt challenge hash in the store ({} bytes)", hash.len());
        }
        let Some(difficulty_raw) = self.store.get(db::DIFFICULTY_KEY)? else {
            return Ok(None);
        };
        let difficulty = db::decode_big(&difficulty_raw)?;

        let mut request_ids = [0u64; 5];
        for (i, id) in request_ids.iter_mut().enumerate() {
            let raw = self
                .store
                .get(&format!("{}{}", db::REQUEST_ID_PREFIX, i))?
                .unwrap_or_default();
            *id = u64::try_from(db::decode_big(&raw)?)
                .map_err(|_| anyhow::anyhow!("request id {i} out of range"))?;
        }
        let tip = match self.store.get(db::TIP_KEY)? {
            Some(raw) => db::decode_big(&raw)?,
            None => alloy_primitives::U256::ZERO,
        };

        Ok(Some(Challenge { hash: B256::from_slice(&hash), difficulty, request_ids, tip }))
    }
}
