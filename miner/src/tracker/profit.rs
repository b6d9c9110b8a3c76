use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Tracker;
use crate::eth::{Contract, EthClient, Receipt};
use crate::psr::{Psrs, REQUEST_ID_TRB_ETH};

const WEI: u128 = 1_000_000_000_000_000_000;
const MINED_WAIT: Duration = Duration::from_secs(10 * 60);
const RECEIPT_POLL: Duration = Duration::from_secs(1);

/// Accumulates what submissions cost and what they earned, so an operator
/// can see whether mining is worth the gas. Rewards arrive in TRB and are
/// converted through the TRB/ETH registry entry.
pub struct ProfitTracker {
    client: Arc<dyn EthClient>,
    contract: Arc<dyn Contract>,
    psrs: Arc<Psrs>,
    addrs: Vec<Address>,
    last_block: Mutex<u64>,
    cost_wei: Mutex<f64>,
    earned_wei: Mutex<f64>,
}

impl ProfitTracker {
    pub fn new(
        client: Arc<dyn EthClient>,
        contract: Arc<dyn Contract>,
        psrs: Arc<Psrs>,
        addrs: Vec<Address>,
    ) -> Self {
        ProfitTracker {
            client,
            contract,
            psrs,
            addrs,
            last_block: Mutex::new(0),
            cost_wei: Mutex::new(0.0),
            earned_wei: Mutex::new(0.0),
        }
    }

    pub fn totals(&self) -> (f64, f64) {
        (*self.cost_wei.lock().unwrap(), *self.earned_wei.lock().unwrap())
    }

    /// Receipt polling with the global transaction-mined cap. Even a failed
    /// receipt costs gas, so it still counts.
    async fn wait_mined(
        &self,
        tx_hash: B256,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Receipt> {
        let deadline = tokio::time::Instant::now() + MINED_WAIT;
        loop {
            match self.client.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => debug!("transaction {tx_hash:#x} not yet mined"),
                Err(err) => warn!("receipt retrieval failed: {err}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("canceled"),
                _ = tokio::time::sleep_until(deadline) => {
                    anyhow::bail!("transaction {tx_hash:#x} not mined within the wait cap")
                }
                _ = tokio::time::sleep(RECEIPT_POLL) => {}
            }
        }
    }

    /// TRB amount in wei-scale converted to ETH wei through the registry.
    fn trb_to_eth(&self, trb: U256) -> anyhow::Result<U256> {
        let now = Utc::now().timestamp_millis();
        let (price, confidence) = self
            .psrs
            .value_for_time(REQUEST_ID_TRB_ETH, now)?
            .ok_or_else(|| anyhow::anyhow!("no TRB/ETH price in the store"))?;
        if confidence < self.psrs.min_confidence() {
            anyhow::bail!("TRB/ETH price confidence {confidence:.2} too low");
        }
        let granularity = self
            .psrs
            .get(REQUEST_ID_TRB_ETH)
            .map(|p| p.granularity)
            .unwrap_or(1_000_000);
        let upscale = U256::from(WEI / granularity as u128);
        Ok(price * upscale * trb / U256::from(WEI))
    }
}

#[async_trait]
impl Tracker for ProfitTracker {
    fn name(&self) -> &'static str {
        "profit"
    }

    async fn exec(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let head = self.client.header_by_number(None).await?;
        let from = {
            let mut last = self.last_block.lock().unwrap();
            if *last == 0 {
                *last = head.number;
                return Ok(());
            }
            if head.number <= *last {
                return Ok(());
            }
            *last + 1
        };

        let submits = self
            .contract
            .nonce_submitted_logs(from, head.number, Some(&self.addrs))
            .await?;
        for event in submits {
            match self.wait_mined(event.tx_hash, cancel).await {
                Ok(receipt) => {
                    let cost = receipt.gas_used * receipt.effective_gas_price;
                    let cost_eth = wei_to_f64(cost);
                    *self.cost_wei.lock().unwrap() += cost_eth;
                    info!(
                        "submit by {:#x} cost {:.6} ETH (gas used {})",
                        event.miner,
                        cost_eth / WEI as f64,
                        receipt.gas_used
                    );
                }
                Err(err) => warn!("wait for submit confirmation: {err:#}"),
            }
        }

        let rewards = self
            .contract
            .transferred_logs(from, head.number, &self.addrs)
            .await?;
        for event in rewards {
            match self.wait_mined(event.tx_hash, cancel).await {
                Ok(receipt) if receipt.status => match self.trb_to_eth(event.value) {
                    Ok(eth) => {
                        let earned = wei_to_f64(eth);
                        *self.earned_wei.lock().unwrap() += earned;
                        info!(
                            "reward to {:#x} worth {:.6} ETH",
                            event.to,
                            earned / WEI as f64
                        );
                    }
                    Err(err) => warn!("convert reward to ETH: {err:#}"),
                },
                Ok(_) => debug!("reward transfer {:#x} reverted", event.tx_hash),
                Err(err) => warn!("wait for reward confirmation: {err:#}"),
            }
        }

        *self.last_block.lock().unwrap() = head.number;
        Ok(())
    }
}

fn wei_to_f64(value: U256) -> f64 {
    value.to_string().parse().unwrap_or(f64::MAX)
}
