use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::Tracker;
use crate::eth::{Contract, EthClient};
use crate::psr::{format_value_check, save_dispute_artifact, Psrs};

/// Blocks to lag behind the head so reorgs settle before values are judged.
const BLOCK_DELAY: u64 = 100;

/// Watches everyone's submitted values (including our own) against the
/// confidence band of neighbor samples and archives candidates for a
/// dispute.
pub struct DisputeChecker {
    client: Arc<dyn EthClient>,
    contract: Arc<dyn Contract>,
    psrs: Arc<Psrs>,
    last_checked: Mutex<u64>,
    artifact_dir: PathBuf,
}

impl DisputeChecker {
    pub fn new(client: Arc<dyn EthClient>, contract: Arc<dyn Contract>, psrs: Arc<Psrs>) -> Self {
        DisputeChecker {
            client,
            contract,
            psrs,
            last_checked: Mutex::new(0),
            artifact_dir: PathBuf::from("."),
        }
    }

    pub fn with_artifact_dir(mut self, dir: PathBuf) -> Self {
        self.artifact_dir = dir;
        self
    }
}

#[async_trait]
impl Tracker for DisputeChecker {
    fn name(&self) -> &'static str {
        "disputeChecker"
    }

    async fn exec(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let head = self.client.header_by_number(None).await?;

        let from = {
            let mut last = self.last_checked.lock().unwrap();
            if *last == 0 {
                *last = head.number;
                return Ok(());
            }
            if head.number.saturating_sub(*last) < BLOCK_DELAY {
                return Ok(());
            }
            *last
        };
        let until = head.number - BLOCK_DELAY;

        let events = self.contract.nonce_submitted_logs(from, until, None).await?;
        let mut block_times: HashMap<u64, i64> = HashMap::new();
        for event in events {
            let at_ms = match block_times.get(&event.block_number) {
                Some(t) => *t,
                None => {
                    let header = self.client.header_by_number(Some(event.block_number)).await?;
                    let t = header.timestamp as i64 * 1000;
                    block_times.insert(event.block_number, t);
                    t
                }
            };

            for (id, value) in event.request_ids.iter().zip(&event.values) {
                match self.psrs.check_value_at_time(*id, *value, at_ms)? {
                    None => {
                        warn!("no value data for request id {id} at block {}", event.block_number)
                    }
                    Some(check) if !check.within_range => {
                        let mut body = format_value_check(*id, at_ms, value, &check);
                        body.push_str(&format!(
                            "value submitted by miner with address {:#x}",
                            event.miner
                        ));
                        error!("{body}");
                        if let Err(err) = save_dispute_artifact(&self.artifact_dir, at_ms, &body) {
                            error!("failed to save dispute data: {err}");
                        }
                    }
                    Some(_) => info!(
                        "value for request id {id} from {:#x} within the expected range",
                        event.miner
                    ),
                }
            }
        }

        *self.last_checked.lock().unwrap() = until;
        Ok(())
    }
}
