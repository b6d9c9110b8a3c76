use std::sync::Arc;

use alloy_primitives::U256;
use async_trait::async_trait;
use shared::errors::ClientError;
use shared::types::Challenge;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::format_units;
use crate::eth::submitter::{BuildTx, SubmissionRequest, TxSubmitter};
use crate::eth::{Contract, Transaction, TxOpts};

struct AddTipTx {
    contract: Arc<dyn Contract>,
    request_id: u64,
    amount: U256,
}

#[async_trait]
impl BuildTx for AddTipTx {
    async fn build(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        self.contract.add_tip(opts, self.request_id, self.amount).await
    }
}

/// Keeps the request queue worth mining: when a round arrives untipped, tip
/// its first request id with the configured amount so the reward clears the
/// gas spent answering it.
pub struct TipRequester {
    contract: Arc<dyn Contract>,
    submitter: Arc<TxSubmitter>,
    amount: U256,
}

impl TipRequester {
    pub fn new(contract: Arc<dyn Contract>, submitter: Arc<TxSubmitter>, amount: U256) -> Self {
        TipRequester { contract, submitter, amount }
    }

    pub async fn maybe_tip(
        &self,
        cancel: &CancellationToken,
        challenge: &Challenge,
    ) -> anyhow::Result<Option<Transaction>> {
        if self.amount.is_zero() || !challenge.tip.is_zero() {
            return Ok(None);
        }
        let request_id = challenge.request_ids[0];
        let request = SubmissionRequest {
            ctx_name: "addTip",
            builder: AddTipTx { contract: self.contract.clone(), request_id, amount: self.amount },
        };
        let tx = self.submitter.submit(cancel, &request).await?;
        info!(
            "tipped request {request_id} with {} TRB | tx {:#x}",
            format_units(self.amount),
            tx.hash
        );
        Ok(Some(tx))
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::B256;
    use shared::db::{self, Store};

    use super::*;
    use crate::eth::mock::{test_variables, MockClient, MockContract};
    use crate::eth::Account;

    fn requester(contract: Arc<MockContract>, store: &Store, trb: u64) -> TipRequester {
        let client = Arc::new(MockClient::new(
            0,
            U256::from(10u64).pow(U256::from(20u64)),
            U256::from(1_000_000_000u64),
        ));
        store
            .put(db::GAS_KEY, &db::encode_big(&U256::from(1_000_000_000u64)))
            .unwrap();
        let account = Account {
            address: "0x724d1b69a7ba352f11d73fdbdeb7ff869cb22e19".parse().unwrap(),
            private_key: B256::repeat_byte(1),
        };
        let submitter =
            Arc::new(TxSubmitter::new(client, store.clone(), account, 1.0, 100));
        let amount = U256::from(trb) * U256::from(10u64).pow(U256::from(18u64));
        TipRequester::new(contract, submitter, amount)
    }

    fn challenge(tip: u64) -> Challenge {
        let vars = test_variables(9, 500, [7, 2, 3, 4, 5]);
        Challenge {
            hash: vars.challenge,
            difficulty: vars.difficulty,
            request_ids: vars.request_ids,
            tip: U256::from(tip),
        }
    }

    #[tokio::test]
    async fn tips_untipped_challenges() {
        let store = Store::temporary().unwrap();
        let contract = Arc::new(MockContract::new(test_variables(9, 500, [7, 2, 3, 4, 5])));
        let requester = requester(contract.clone(), &store, 1);

        let tx = requester
            .maybe_tip(&CancellationToken::new(), &challenge(0))
            .await
            .unwrap();
        assert!(tx.is_some());

        let tips = contract.tips.lock().unwrap();
        assert_eq!(tips.len(), 1);
        assert_eq!(tips[0].0, 7);
        assert_eq!(tips[0].1, U256::from(10u64).pow(U256::from(18u64)));
    }

    #[tokio::test]
    async fn leaves_tipped_rounds_alone() {
        let store = Store::temporary().unwrap();
        let contract = Arc::new(MockContract::new(test_variables(9, 500, [7, 2, 3, 4, 5])));
        let requester = requester(contract.clone(), &store, 1);

        let tx = requester
            .maybe_tip(&CancellationToken::new(), &challenge(50))
            .await
            .unwrap();
        assert!(tx.is_none());
        assert!(contract.tips.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_amount_never_tips() {
        let store = Store::temporary().unwrap();
        let contract = Arc::new(MockContract::new(test_variables(9, 500, [7, 2, 3, 4, 5])));
        let requester = requester(contract.clone(), &store, 0);

        let tx = requester
            .maybe_tip(&CancellationToken::new(), &challenge(0))
            .await
            .unwrap();
        assert!(tx.is_none());
        assert!(contract.tips.lock().unwrap().is_empty());
    }
}
