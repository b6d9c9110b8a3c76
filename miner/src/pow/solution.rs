use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use chrono::Utc;
use colored::Colorize;
use shared::db::{self, Store};
use shared::errors::{ClientError, SubmitAbort};
use shared::types::MineResult;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::eth::submitter::{BuildTx, SubmissionRequest, TxSubmitter};
use crate::eth::{Contract, Transaction, TxOpts};
use crate::psr::{format_value_check, save_dispute_artifact, Psrs};

/// Request IDs at or below this are legacy and expected to have oracle
/// values at all times.
pub const LEGACY_REQUEST_ID_MAX: u64 = 53;

const SUBMIT_COOLDOWN_SECS: i64 = 15 * 60;

/// Assembles the submission payload for a winning nonce and hands it to the
/// transaction submitter, or rejects it: too soon after the previous submit,
/// missing values, a stale challenge, or one the miner already answered.
pub struct SolutionHandler {
    store: Store,
    contract: Arc<dyn Contract>,
    submitter: Arc<TxSubmitter>,
    psrs: Arc<Psrs>,
    address: Address,
    manual_data: HashMap<u64, U256>,
    submit_zero_legacy: bool,
    dispute_dir: PathBuf,
    /// Preflight and submission run as one unit per miner address, so a
    /// result arriving mid-submit sees the previous submit's timestamp.
    gate: tokio::sync::Mutex<()>,
}

struct SubmitSolutionTx {
    contract: Arc<dyn Contract>,
    nonce: String,
    request_ids: [u64; 5],
    values: [U256; 5],
}

#[async_trait]
impl BuildTx for SubmitSolutionTx {
    async fn build(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        self.contract
            .submit_solution(opts, &self.nonce, self.request_ids, self.values)
            .await
    }
}

impl SolutionHandler {
    pub fn new(
        store: Store,
        contract: Arc<dyn Contract>,
        submitter: Arc<TxSubmitter>,
        psrs: Arc<Psrs>,
        address: Address,
        manual_data: HashMap<u64, U256>,
        submit_zero_legacy: bool,
    ) -> Self {
        SolutionHandler {
            store,
            contract,
            submitter,
            psrs,
            address,
            manual_data,
            submit_zero_legacy,
            dispute_dir: PathBuf::from("."),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_dispute_dir(mut self, dir: PathBuf) -> Self {
        self.dispute_dir = dir;
        self
    }

    pub async fn submit(
        &self,
        cancel: &CancellationToken,
        result: &MineResult,
    ) -> Result<Transaction, SubmitAbort> {
        let _serialized = self.gate.lock().await;
        let challenge = &result.work.challenge;

        // A result for a superseded challenge is worthless, drop it.
        let current = self.store.get(db::CHALLENGE_KEY)?;
        if current.as_deref() != Some(challenge.hash.as_slice()) {
            return Err(SubmitAbort::ChallengeSuperseded);
        }
        if self.contract.did_mine(challenge.hash, self.address).await? {
            return Err(SubmitAbort::AlreadyMined);
        }

        let now = Utc::now().timestamp();
        let since_last = now - self.last_submit_at()?;
        if since_last < SUBMIT_COOLDOWN_SECS {
            return Err(SubmitAbort::TooSoon { since_last: since_last.max(0) as u64 });
        }

        let values = self.gather_values(&challenge.request_ids)?;
        self.dispute_guard(&challenge.request_ids, &values, now * 1000)?;

        let request = SubmissionRequest {
            ctx_name: "submitSolution",
            builder: SubmitSolutionTx {
                contract: self.contract.clone(),
                nonce: result.nonce.clone(),
                request_ids: challenge.request_ids,
                values,
            },
        };
        let tx = self.submitter.submit(cancel, &request).await?;

        // Record locally right away; the timeout tracker refreshes the
        // authoritative on-chain value on its next tick.
        self.store.put(
            &self.time_out_key(),
            &db::encode_big(&U256::from(now.max(0) as u64)),
        )?;
        info!(
            "{} solution submitted for challenge {:#x} tx {:#x}",
            "OK".bold().green(),
            challenge.hash,
            tx.hash
        );
        Ok(tx)
    }

    fn time_out_key(&self) -> String {
        format!("{:#x}-{}", self.address, db::TIME_OUT_KEY)
    }

    fn last_submit_at(&self) -> Result<i64, SubmitAbort> {
        let raw = self.store.get(&self.time_out_key())?;
        Ok(match raw {
            Some(bytes) if !bytes.is_empty() => {
                let last = db::decode_big(&bytes)?;
                i64::try_from(last).unwrap_or(0)
            }
            _ => 0,
        })
    }

    /// The freshest value per request ID: tracker output first, then the
    /// manual overlay, then the legacy zero workaround.
    fn gather_values(&self, request_ids: &[u64; 5]) -> Result<[U256; 5], SubmitAbort> {
        let mut values = [U256::ZERO; 5];
        for (i, id) in request_ids.iter().enumerate() {
            let key = format!("{}{}", db::QUERIED_VALUE_PREFIX, id);
            let stored = match self.store.get(&key)? {
                Some(raw) if !raw.is_empty() => Some(db::decode_big(&raw)?),
                _ => None,
            };
            values[i] = match stored.or_else(|| self.manual_data.get(id).copied()) {
                Some(value) => value,
                None if *id <= LEGACY_REQUEST_ID_MAX && self.submit_zero_legacy => {
                    warn!(
                        "no oracle value for legacy request id {id}, \
                         submitting zero because of a faulty upstream API"
                    );
                    U256::ZERO
                }
                None => return Err(SubmitAbort::NoValue(*id)),
            };
        }
        Ok(values)
    }

    /// The miner reports on itself: an out-of-band value is logged loudly
    /// and archived, but still submitted. Only a complete lack of confident
    /// neighbor samples aborts.
    fn dispute_guard(
        &self,
        request_ids: &[u64; 5],
        values: &[U256; 5],
        at_ms: i64,
    ) -> Result<(), SubmitAbort> {
        for (id, value) in request_ids.iter().zip(values) {
            // Manual-only ids have no recipe to check against.
            if self.psrs.get(*id).is_none() {
                continue;
            }
            match self.psrs.check_value_at_time(*id, *value, at_ms)? {
                None => return Err(SubmitAbort::NoConfidentSamples),
                Some(check) if !check.within_range => {
                    let body = format_value_check(*id, at_ms, value, &check);
                    error!("{body}");
                    match save_dispute_artifact(&self.dispute_dir, at_ms, &body) {
                        Ok(path) => warn!("dispute candidate saved to {}", path.display()),
                        Err(err) => error!("failed to save dispute candidate: {err}"),
                    }
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}
