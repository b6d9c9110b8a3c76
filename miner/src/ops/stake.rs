use std::sync::Arc;

use alloy_primitives::{keccak256, U256};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::errors::ClientError;
use tokio_util::sync::CancellationToken;

use super::format_units;
use crate::eth::submitter::{BuildTx, SubmissionRequest, TxSubmitter};
use crate::eth::{Contract, Transaction, TxOpts};

enum StakeCall {
    Deposit,
    RequestWithdraw,
    Withdraw,
}

struct StakeTx {
    contract: Arc<dyn Contract>,
    call: StakeCall,
}

#[async_trait]
impl BuildTx for StakeTx {
    async fn build(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        match self.call {
            StakeCall::Deposit => self.contract.deposit_stake(opts).await,
            StakeCall::RequestWithdraw => self.contract.request_staking_withdraw(opts).await,
            StakeCall::Withdraw => self.contract.withdraw_stake(opts).await,
        }
    }
}

fn describe_status(status: U256) -> &'static str {
    match status.to::<u64>() {
        0 => "not staked",
        1 => "staked",
        2 => "withdraw requested",
        3 => "in dispute",
        _ => "unknown",
    }
}

/// Locks the stake amount. Refuses when the balance cannot cover it or the
/// address is already staked.
pub async fn deposit(contract: Arc<dyn Contract>, submitter: &TxSubmitter) -> anyhow::Result<()> {
    let (status, _) = contract.get_staker_info(submitter.address()).await?;
    if status == U256::from(1u64) {
        println!("already staked");
        return Ok(());
    }
    let required = contract.get_uint_var(keccak256(b"stakeAmount")).await?;
    let held = contract.balance_of(submitter.address()).await?;
    if held < required {
        anyhow::bail!(
            "insufficient TRB to stake: {} < {}",
            format_units(held),
            format_units(required)
        );
    }
    let request = SubmissionRequest {
        ctx_name: "depositStake",
        builder: StakeTx { contract, call: StakeCall::Deposit },
    };
    let tx = submitter.submit(&CancellationToken::new(), &request).await?;
    println!("stake deposited | tx {:#x}", tx.hash);
    Ok(())
}

pub async fn request_withdraw(
    contract: Arc<dyn Contract>,
    submitter: &TxSubmitter,
) -> anyhow::Result<()> {
    let request = SubmissionRequest {
        ctx_name: "requestStakingWithdraw",
        builder: StakeTx { contract, call: StakeCall::RequestWithdraw },
    };
    let tx = submitter.submit(&CancellationToken::new(), &request).await?;
    println!("staking withdraw requested | tx {:#x}", tx.hash);
    Ok(())
}

pub async fn withdraw(contract: Arc<dyn Contract>, submitter: &TxSubmitter) -> anyhow::Result<()> {
    let request = SubmissionRequest {
        ctx_name: "withdrawStake",
        builder: StakeTx { contract, call: StakeCall::Withdraw },
    };
    let tx = submitter.submit(&CancellationToken::new(), &request).await?;
    println!("stake withdrawn | tx {:#x}", tx.hash);
    Ok(())
}

/// Prints one line with the staker status.
pub async fn status(contract: &dyn Contract, submitter: &TxSubmitter) -> anyhow::Result<()> {
    let (status, start_date) = contract.get_staker_info(submitter.address()).await?;
    let since = i64::try_from(start_date)
        .ok()
        .filter(|s| *s > 0)
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
        .map(|t| format!(" since {}", t.to_rfc3339()))
        .unwrap_or_default();
    println!(
        "{:#x} | staker status: {} ({}){}",
        submitter.address(),
        status,
        describe_status(status),
        since
    );
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
    async fn deposit_needs_the_stake_amount() {
        let store = Store::temporary().unwrap();
        let contract = Arc::new(MockContract::new(test_variables(1, 1, [1, 2, 3, 4, 5])));
        *contract.staker_status.lock().unwrap() = U256::ZERO;
        contract
            .uint_vars
            .lock()
            .unwrap()
            .insert(keccak256(b"stakeAmount"), U256::from(500u64));
        *contract.trb_balance.lock().unwrap() = U256::from(100u64);

        let err = deposit(contract.clone(), &submitter(&store)).await.unwrap_err();
        assert!(err.to_string().contains("insufficient TRB to stake"));

        *contract.trb_balance.lock().unwrap() = U256::from(600u64);
        deposit(contract, &submitter(&store)).await.unwrap();
    }

    #[test]
    fn status_names() {
        assert_eq!(describe_status(U256::from(1u64)), "staked");
        assert_eq!(describe_status(U256::from(7u64)), "unknown");
    }
}
