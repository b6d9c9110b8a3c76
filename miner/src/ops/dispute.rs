use std::sync::Arc;

use alloy_primitives::{keccak256, U256};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::errors::ClientError;
use tokio_util::sync::CancellationToken;

use crate::eth::submitter::{BuildTx, SubmissionRequest, TxSubmitter};
use crate::eth::{Contract, Transaction, TxOpts};

struct VoteTx {
    contract: Arc<dyn Contract>,
    dispute_id: U256,
    supports: bool,
}

#[async_trait]
impl BuildTx for VoteTx {
    async fn build(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        self.contract.vote(opts, self.dispute_id, self.supports).await
    }
}

struct NewDisputeTx {
    contract: Arc<dyn Contract>,
    request_id: u64,
    timestamp: U256,
    miner_index: u64,
}

#[async_trait]
impl BuildTx for NewDisputeTx {
    async fn build(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        self.contract
            .begin_dispute(opts, self.request_id, self.timestamp, self.miner_index)
            .await
    }
}

pub async fn vote(
    contract: Arc<dyn Contract>,
    submitter: &TxSubmitter,
    dispute_id: u64,
    supports: bool,
) -> anyhow::Result<()> {
    let request = SubmissionRequest {
        ctx_name: "vote",
        builder: VoteTx { contract, dispute_id: U256::from(dispute_id), supports },
    };
    let tx = submitter.submit(&CancellationToken::new(), &request).await?;
    println!("voted {} on dispute {dispute_id} | tx {:#x}", supports, tx.hash);
    Ok(())
}

pub async fn new(
    contract: Arc<dyn Contract>,
    submitter: &TxSubmitter,
    request_id: u64,
    timestamp: u64,
    miner_index: u64,
) -> anyhow::Result<()> {
    if miner_index > 4 {
        anyhow::bail!("miner index must be 0..=4, got {miner_index}");
    }
    let request = SubmissionRequest {
        ctx_name: "beginDispute",
        builder: NewDisputeTx {
            contract,
            request_id,
            timestamp: U256::from(timestamp),
            miner_index,
        },
    };
    let tx = submitter.submit(&CancellationToken::new(), &request).await?;
    println!(
        "dispute opened for request {request_id} at {timestamp} slot {miner_index} | tx {:#x}",
        tx.hash
    );
    Ok(())
}

/// Lists known disputes, one line each.
pub async fn show(contract: &dyn Contract) -> anyhow::Result<()> {
    let count = contract.get_uint_var(keccak256(b"disputeCount")).await?.to::<u64>();
    if count == 0 {
        println!("no disputes");
        return Ok(());
    }
    for id in 1..=count {
        let (request_id, timestamp, executed) =
            contract.get_dispute_info(U256::from(id)).await?;
        let when = i64::try_from(timestamp)
            .ok()
            .and_then(|s| Utc.timestamp_opt(s, 0).single())
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| timestamp.to_string());
        println!(
            "dispute {id} | request {request_id} | at {when} | {}",
            if executed { "executed" } else { "open" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use shared::db::{self, Store};

    use super::*;
    use crate::eth::mock::{test_variables, MockClient, MockContract};
    use crate::eth::Account;

    #[tokio::test]
    async fn rejects_out_of_range_miner_index() {
        let store = Store::temporary().unwrap();
        let contract = Arc::new(MockContract::new(test_variables(1, 1, [1, 2, 3, 4, 5])));
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
        let submitter = TxSubmitter::new(client, store, account, 1.0, 100);

        let err = new(contract, &submitter, 1, 1_700_000_000, 9).await.unwrap_err();
        assert!(err.to_string().contains("miner index"));
    }
}
