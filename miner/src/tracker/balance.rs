use std::sync::Arc;

use alloy_primitives::Address;
use async_trait::async_trait;
use shared::db::{self, Store};
use tokio_util::sync::CancellationToken;

use super::Tracker;
use crate::eth::{Contract, EthClient};

/// Keeps the miner's ETH and TRB balances fresh in the store.
pub struct BalanceTracker {
    client: Arc<dyn EthClient>,
    contract: Arc<dyn Contract>,
    store: Store,
    address: Address,
}

impl BalanceTracker {
    pub fn new(
        client: Arc<dyn EthClient>,
        contract: Arc<dyn Contract>,
        store: Store,
        address: Address,
    ) -> Self {
        BalanceTracker { client, contract, store, address }
    }
}

#[async_trait]
impl Tracker for BalanceTracker {
    fn name(&self) -> &'static str {
        "balance"
    }

    async fn exec(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let eth = self.client.balance_at(self.address).await?;
        self.store.put(db::ETH_BALANCE_KEY, &db::encode_big(&eth))?;

        let trb = self.contract.balance_of(self.address).await?;
        self.store.put(db::TRB_BALANCE_KEY, &db::encode_big(&trb))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;

    use super::*;
    use crate::eth::mock::{test_variables, MockClient, MockContract};

    #[tokio::test]
    async fn stores_both_balances() {
        let store = Store::temporary().unwrap();
        let client = Arc::new(MockClient::new(0, U256::from(5_000u64), U256::from(1u64)));
        let contract = Arc::new(MockContract::new(test_variables(1, 1, [1, 2, 3, 4, 5])));
        *contract.trb_balance.lock().unwrap() = U256::from(12u64);

        let tracker =
            BalanceTracker::new(client, contract, store.clone(), Address::repeat_byte(1));
        tracker.exec(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            db::decode_big(&store.get(db::ETH_BALANCE_KEY).unwrap().unwrap()).unwrap(),
            U256::from(5_000u64)
        );
        assert_eq!(
            db::decode_big(&store.get(db::TRB_BALANCE_KEY).unwrap().unwrap()).unwrap(),
            U256::from(12u64)
        );
    }
}
