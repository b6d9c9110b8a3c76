use std::sync::Arc;

use alloy_primitives::Address;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::db::{self, Store};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Tracker;
use crate::eth::{staker_slot_key, Contract};

/// Mirrors the miner's (and each whitelisted peer's) last-submit timestamp
/// from the contract into the store. The solution handler reads it to honor
/// the fifteen minute window.
pub struct TimeOutTracker {
    contract: Arc<dyn Contract>,
    store: Store,
    address: Address,
    whitelist: Vec<Address>,
}

impl TimeOutTracker {
    pub fn new(
        contract: Arc<dyn Contract>,
        store: Store,
        address: Address,
        whitelist: Vec<Address>,
    ) -> Self {
        TimeOutTracker { contract, store, address, whitelist }
    }
}

#[async_trait]
impl Tracker for TimeOutTracker {
    fn name(&self) -> &'static str {
        "timeOut"
    }

    async fn exec(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let own = self.contract.get_uint_var(staker_slot_key(self.address)).await?;
        self.store.put(db::TIME_OUT_KEY, &db::encode_big(&own))?;
        self.store
            .put(&format!("{:#x}-{}", self.address, db::TIME_OUT_KEY), &db::encode_big(&own))?;

        // Whitelisted peers come asking for their own timeout status.
        for addr in &self.whitelist {
            match self.contract.get_uint_var(staker_slot_key(*addr)).await {
                Ok(status) => {
                    if let Ok(secs) = i64::try_from(status) {
                        if secs > 0 {
                            info!(
                                "whitelisted miner {addr:#x} last mined {}",
                                Utc.timestamp_opt(secs, 0)
                                    .single()
                                    .map(|t| t.to_rfc3339())
                                    .unwrap_or_else(|| secs.to_string())
                            );
                        }
                    }
                    self.store.put(
                        &format!("{addr:#x}-{}", db::TIME_OUT_KEY),
                        &db::encode_big(&status),
                    )?;
                }
                Err(err) => warn!("getting timeout status for {addr:#x}: {err}"),
            }
        }
        Ok(())
    }
}

/// Mirrors staker dispute status the same way.
pub struct DisputeStatusTracker {
    contract: Arc<dyn Contract>,
    store: Store,
    address: Address,
    whitelist: Vec<Address>,
}

impl DisputeStatusTracker {
    pub fn new(
        contract: Arc<dyn Contract>,
        store: Store,
        address: Address,
        whitelist: Vec<Address>,
    ) -> Self {
        DisputeStatusTracker { contract, store, address, whitelist }
    }
}

#[async_trait]
impl Tracker for DisputeStatusTracker {
    fn name(&self) -> &'static str {
        "disputeStatus"
    }

    async fn exec(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let (status, _start_date) = self.contract.get_staker_info(self.address).await?;
        self.store.put(db::DISPUTE_STATUS_KEY, &db::encode_big(&status))?;

        for addr in &self.whitelist {
            match self.contract.get_staker_info(*addr).await {
                Ok((status, _)) => {
                    self.store.put(
                        &format!("{addr:#x}-{}", db::DISPUTE_STATUS_KEY),
                        &db::encode_big(&status),
                    )?;
                }
                Err(err) => warn!("getting staker info for {addr:#x}: {err}"),
            }
        }
        Ok(())
    }
}
