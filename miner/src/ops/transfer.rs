use std::sync::Arc;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use shared::errors::ClientError;
use tokio_util::sync::CancellationToken;

use super::format_units;
use crate::eth::submitter::{BuildTx, SubmissionRequest, TxSubmitter};
use crate::eth::{Contract, Transaction, TxOpts};

struct TransferTx {
    contract: Arc<dyn Contract>,
    to: Address,
    amount: U256,
    approve: bool,
}

#[async_trait]
impl BuildTx for TransferTx {
    async fn build(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        if self.approve {
            self.contract.approve(opts, self.to, self.amount).await
        } else {
            self.contract.transfer(opts, self.to, self.amount).await
        }
    }
}

/// Sends TRB after checking the balance covers it.
pub async fn transfer(
    contract: Arc<dyn Contract>,
    submitter: &TxSubmitter,
    to: Address,
    amount: U256,
) -> anyhow::Result<()> {
    let held = contract.balance_of(submitter.address()).await?;
    if held < amount {
        anyhow::bail!(
            "insufficient TRB balance: {} < {}",
            format_units(held),
            format_units(amount)
        );
    }
    let request = SubmissionRequest {
        ctx_name: "transfer",
        builder: TransferTx { contract, to, amount, approve: false },
    };
    let tx = submitter.submit(&CancellationToken::new(), &request).await?;
    println!("transferred {} TRB to {to:#x} | tx {:#x}", format_units(amount), tx.hash);
    Ok(())
}

/// Approves a TRB allowance for a spender.
pub async fn approve(
    contract: Arc<dyn Contract>,
    submitter: &TxSubmitter,
    spender: Address,
    amount: U256,
) -> anyhow::Result<()> {
    let request = SubmissionRequest {
        ctx_name: "approve",
        builder: TransferTx { contract, to: spender, amount, approve: true },
    };
    let tx = submitter.submit(&CancellationToken::new(), &request).await?;
    println!("approved {} TRB for {spender:#x} | tx {:#x}", format_units(amount), tx.hash);
    Ok(())
}

#[cfg(test)]
mod tests {
    use shared::db::{self, Store};

    use super::*;
    use crate::eth::mock::{test_variables, MockClient, MockContract};
    use crate::eth::Account;

    fn submitter(store: &Store) -> TxSubmitter {
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
            private_key: alloy_primitives::B256::repeat_byte(1),
        };
        TxSubmitter::new(client, store.clone(), account, 1.0, 100)
    }

    #[tokio::test]
    async fn refuses_to_overdraw() {
        let store = Store::temporary().unwrap();
        let contract = Arc::new(MockContract::new(test_variables(1, 1, [1, 2, 3, 4, 5])));
        *contract.trb_balance.lock().unwrap() = U256::from(5u64);

        let err = transfer(
            contract.clone(),
            &submitter(&store),
            Address::repeat_byte(9),
            U256::from(10u64),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("insufficient TRB balance"));
    }

    #[tokio::test]
    async fn transfers_within_balance() {
        let store = Store::temporary().unwrap();
        let contract = Arc::new(MockContract::new(test_variables(1, 1, [1, 2, 3, 4, 5])));
        *contract.trb_balance.lock().unwrap() = U256::from(100u64);

        transfer(
            contract.clone(),
            &submitter(&store),
            Address::repeat_byte(9),
            U256::from(10u64),
        )
        .await
        .unwrap();
    }
}
