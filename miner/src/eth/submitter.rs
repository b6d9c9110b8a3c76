use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use shared::db::{self, Store};
use shared::errors::{ClientError, SubmitError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{classify, Account, EthClient, Transaction, TxErrorKind, TxOpts};

pub const GAS_LIMIT: u64 = 3_000_000;
pub const GWEI: u64 = 1_000_000_000;

const MAX_ATTEMPTS: usize = 6;
const RETRY_DELAY: Duration = Duration::from_secs(15);
const DEFAULT_GAS_MAX_GWEI: u64 = 100;

/// Builds the actual signed call once the submitter has settled nonce and
/// gas for an attempt.
#[async_trait]
pub trait BuildTx: Send + Sync {
    async fn build(&self, opts: &TxOpts) -> Result<Transaction, ClientError>;
}

/// Everything the submitter needs for one logical submission.
pub struct SubmissionRequest<B: BuildTx> {
    pub ctx_name: &'static str,
    pub builder: B,
}

/// Serializes signed contract calls for one miner address under nonce and
/// gas discipline.
pub struct TxSubmitter {
    client: Arc<dyn EthClient>,
    store: Store,
    account: Account,
    gas_multiplier: f64,
    gas_max_gwei: u64,
    retry_delay: Duration,
    submit_lock: tokio::sync::Mutex<()>,
}

impl TxSubmitter {
    pub fn new(
        client: Arc<dyn EthClient>,
        store: Store,
        account: Account,
        gas_multiplier: f64,
        gas_max_gwei: u64,
    ) -> Self {
        TxSubmitter {
            client,
            store,
            account,
            gas_multiplier,
            gas_max_gwei: if gas_max_gwei > 0 { gas_max_gwei } else { DEFAULT_GAS_MAX_GWEI },
            retry_delay: RETRY_DELAY,
            submit_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn address(&self) -> alloy_primitives::Address {
        self.account.address
    }

    pub async fn submit<B: BuildTx>(
        &self,
        cancel: &CancellationToken,
        request: &SubmissionRequest<B>,
    ) -> Result<Transaction, SubmitError> {
        // One in-flight submission per miner address.
        let _serialized = self.submit_lock.lock().await;

        // Keep the same nonce across attempts so a stuck transaction gets
        // replaced instead of queued behind itself.
        let mut nonce_sticky = self
            .client
            .nonce_at(self.account.address)
            .await
            .map_err(SubmitError::Nonce)?;

        let mut final_error: Option<ClientError> = None;
        for i in 0..MAX_ATTEMPTS {
            let balance = match self.client.balance_at(self.account.address).await {
                Ok(b) => b,
                Err(err) => {
                    final_error = Some(err);
                    continue;
                }
            };

            let gas_price = self.gas_price_for_attempt(i).await;
            let cost = gas_price * U256::from(GAS_LIMIT);
            if balance < cost {
                return Err(SubmitError::InsufficientFunds {
                    balance: balance.to_string(),
                    cost: cost.to_string(),
                });
            }

            let opts = TxOpts {
                from: self.account.address,
                nonce: nonce_sticky,
                value: U256::ZERO,
                gas_limit: GAS_LIMIT,
                gas_price,
            };

            match request.builder.build(&opts).await {
                Ok(tx) => {
                    info!(
                        "sent {} tx {:#x} nonce {} gas price {}",
                        request.ctx_name, tx.hash, opts.nonce, opts.gas_price
                    );
                    return Ok(tx);
                }
                Err(err) => match classify(&err) {
                    TxErrorKind::NonceStale => {
                        debug!("last transaction confirmed, bumping the nonce and resending");
                        nonce_sticky += 1;
                    }
                    TxErrorKind::Underpriced => {
                        debug!("last transaction is stuck, raising the gas price and resending");
                        final_error = Some(err);
                    }
                    TxErrorKind::Other => {
                        warn!("{} attempt {i} failed: {err}", request.ctx_name);
                        final_error = Some(err);
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(SubmitError::Canceled),
                            _ = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                },
            }
        }

        Err(SubmitError::Exhausted {
            attempts: MAX_ATTEMPTS,
            ctx_name: request.ctx_name,
            last: final_error.unwrap_or_else(|| ClientError::new("no attempt completed")),
        })
    }

    /// Gas for attempt `i`: the tracker's latest price (client suggestion as
    /// fallback), times the configured multiplier, bumped when replacing a
    /// stuck transaction, clamped to the configured maximum.
    async fn gas_price_for_attempt(&self, i: usize) -> U256 {
        let tracked = self
            .store
            .get(db::GAS_KEY)
            .ok()
            .flatten()
            .and_then(|raw| db::decode_big(&raw).ok())
            .filter(|p| !p.is_zero());

        let base = match tracked {
            Some(price) => price,
            None => {
                warn!("no gas price from the store, falling back to the client suggestion");
                self.client.suggest_gas_price().await.unwrap_or(U256::ZERO)
            }
        };

        let mut price = if self.gas_multiplier > 0.0 {
            let hundredths = (self.gas_multiplier * 100.0).round() as u64;
            base * U256::from(hundredths) / U256::from(100u64)
        } else {
            base
        };
        if price.is_zero() {
            price = U256::from(100u64);
        }
        if i >= 2 {
            price = price * U256::from(100 + 11 * i as u64) / U256::from(100u64);
        }

        let max = U256::from(self.gas_max_gwei) * U256::from(GWEI);
        if price > max {
            info!("gas price {price} over the maximum, defaulting to {max}");
            price = max;
        }
        price
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::eth::mock::MockClient;

    struct ScriptedBuilder {
        // One entry per expected attempt; None means succeed.
        script: Mutex<Vec<Option<&'static str>>>,
        seen: Mutex<Vec<TxOpts>>,
    }

    impl ScriptedBuilder {
        fn new(script: Vec<Option<&'static str>>) -> Self {
            ScriptedBuilder { script: Mutex::new(script), seen: Mutex::new(Vec::new()) }
        }

        fn opts(&self) -> Vec<TxOpts> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BuildTx for &ScriptedBuilder {
        async fn build(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
            self.seen.lock().unwrap().push(*opts);
            let mut script = self.script.lock().unwrap();
            match script.remove(0) {
                Some(msg) => Err(ClientError::new(msg)),
                None => Ok(Transaction {
                    hash: alloy_primitives::B256::repeat_byte(7),
                    nonce: opts.nonce,
                    gas_price: opts.gas_price,
                }),
            }
        }
    }

    fn submitter(client: Arc<MockClient>, store: Store) -> TxSubmitter {
        let account = Account {
            address: "0x724d1b69a7ba352f11d73fdbdeb7ff869cb22e19".parse().unwrap(),
            private_key: alloy_primitives::B256::repeat_byte(1),
        };
        TxSubmitter::new(client, store, account, 1.0, 100)
            .with_retry_delay(Duration::from_millis(5))
    }

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::from(GWEI)
    }

    #[tokio::test]
    async fn bumps_nonce_when_stale() {
        let client = Arc::new(MockClient::new(7, gwei(1_000_000), gwei(10)));
        let store = Store::temporary().unwrap();
        store.put(db::GAS_KEY, &db::encode_big(&gwei(10))).unwrap();
        let sub = submitter(client, store);

        let builder = ScriptedBuilder::new(vec![Some("rpc: nonce too low"), None]);
        let request = SubmissionRequest { ctx_name: "test", builder: &builder };
        let tx = sub.submit(&CancellationToken::new(), &request).await.unwrap();

        let opts = builder.opts();
        assert_eq!(opts.len(), 2);
        assert_eq!(opts[0].nonce, 7);
        assert_eq!(opts[1].nonce, 8);
        assert_eq!(tx.nonce, 8);
    }

    #[tokio::test]
    async fn bumps_gas_when_underpriced() {
        let client = Arc::new(MockClient::new(1, gwei(1_000_000), gwei(10)));
        let store = Store::temporary().unwrap();
        store.put(db::GAS_KEY, &db::encode_big(&gwei(10))).unwrap();
        let sub = submitter(client, store);

        let builder = ScriptedBuilder::new(vec![
            Some("replacement transaction underpriced"),
            Some("replacement transaction underpriced"),
            None,
        ]);
        let request = SubmissionRequest { ctx_name: "test", builder: &builder };
        sub.submit(&CancellationToken::new(), &request).await.unwrap();

        let opts = builder.opts();
        assert_eq!(opts.len(), 3);
        assert_eq!(opts[0].gas_price, gwei(10));
        assert_eq!(opts[1].gas_price, gwei(10));
        // Third attempt replaces an underpriced transaction: >= base * 1.22
        // and never above the configured maximum.
        assert!(opts[2].gas_price >= gwei(10) * U256::from(122u64) / U256::from(100u64));
        assert!(opts[2].gas_price <= gwei(100));
    }

    #[tokio::test]
    async fn gas_price_clamps_to_max() {
        let client = Arc::new(MockClient::new(1, gwei(1_000_000_000), gwei(10)));
        let store = Store::temporary().unwrap();
        store.put(db::GAS_KEY, &db::encode_big(&gwei(5_000))).unwrap();
        let sub = submitter(client, store);

        let builder = ScriptedBuilder::new(vec![None]);
        let request = SubmissionRequest { ctx_name: "test", builder: &builder };
        sub.submit(&CancellationToken::new(), &request).await.unwrap();

        assert_eq!(builder.opts()[0].gas_price, gwei(100));
    }

    #[tokio::test]
    async fn aborts_on_insufficient_funds_without_building() {
        // balance 1e15 wei, cost = 1000 gwei * 3e6 gas = 3e18 wei
        let client = Arc::new(MockClient::new(3, U256::from(1_000_000_000_000_000u64), gwei(10)));
        let store = Store::temporary().unwrap();
        store.put(db::GAS_KEY, &db::encode_big(&gwei(1_000))).unwrap();
        // raise the clamp so the configured price stays expensive
        let account = Account {
            address: "0x724d1b69a7ba352f11d73fdbdeb7ff869cb22e19".parse().unwrap(),
            private_key: alloy_primitives::B256::repeat_byte(1),
        };
        let sub = TxSubmitter::new(client, store, account, 1.0, 2_000)
            .with_retry_delay(Duration::from_millis(5));

        let builder = ScriptedBuilder::new(vec![]);
        let request = SubmissionRequest { ctx_name: "test", builder: &builder };
        let err = sub.submit(&CancellationToken::new(), &request).await.unwrap_err();

        assert!(matches!(err, SubmitError::InsufficientFunds { .. }));
        // Nothing was built, so the sticky nonce never advanced.
        assert!(builder.opts().is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_suggested_gas_price() {
        let client = Arc::new(MockClient::new(1, gwei(1_000_000), gwei(7)));
        let store = Store::temporary().unwrap();
        let sub = submitter(client, store);

        let builder = ScriptedBuilder::new(vec![None]);
        let request = SubmissionRequest { ctx_name: "test", builder: &builder };
        sub.submit(&CancellationToken::new(), &request).await.unwrap();

        assert_eq!(builder.opts()[0].gas_price, gwei(7));
    }

    #[tokio::test]
    async fn cancellation_during_retry_sleep() {
        let client = Arc::new(MockClient::new(1, gwei(1_000_000), gwei(10)));
        let store = Store::temporary().unwrap();
        store.put(db::GAS_KEY, &db::encode_big(&gwei(10))).unwrap();
        let account = Account {
            address: "0x724d1b69a7ba352f11d73fdbdeb7ff869cb22e19".parse().unwrap(),
            private_key: alloy_primitives::B256::repeat_byte(1),
        };
        let sub = TxSubmitter::new(client, store, account, 1.0, 100)
            .with_retry_delay(Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let builder = ScriptedBuilder::new(vec![Some("connection reset"), None]);
        let request = SubmissionRequest { ctx_name: "test", builder: &builder };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = sub.submit(&cancel, &request).await.unwrap_err();
        assert!(matches!(err, SubmitError::Canceled));
    }
}
