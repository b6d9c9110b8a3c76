//! In-memory fakes of the node and contract surfaces for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use shared::errors::ClientError;

use super::{
    BlockHeader, Contract, CurrentVariables, EthClient, NonceSubmittedEvent, Receipt, Transaction,
    TransferredEvent, TxInfo, TxOpts,
};

pub struct MockClient {
    pub nonce: AtomicU64,
    pub balance: Mutex<U256>,
    pub gas_price: Mutex<U256>,
    pub chain_id: u64,
    pub head: Mutex<BlockHeader>,
}

impl MockClient {
    pub fn new(nonce: u64, balance: U256, gas_price: U256) -> Self {
        MockClient {
            nonce: AtomicU64::new(nonce),
            balance: Mutex::new(balance),
            gas_price: Mutex::new(gas_price),
            chain_id: 1337,
            head: Mutex::new(BlockHeader { number: 1_000, timestamp: 1_700_000_000 }),
        }
    }
}

#[async_trait]
impl EthClient for MockClient {
    async fn nonce_at(&self, _address: Address) -> Result<u64, ClientError> {
        Ok(self.nonce.load(Ordering::SeqCst))
    }

    async fn pending_nonce_at(&self, address: Address) -> Result<u64, ClientError> {
        self.nonce_at(address).await
    }

    async fn balance_at(&self, _address: Address) -> Result<U256, ClientError> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn suggest_gas_price(&self) -> Result<U256, ClientError> {
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn network_id(&self) -> Result<u64, ClientError> {
        Ok(self.chain_id)
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, ClientError> {
        let head = *self.head.lock().unwrap();
        Ok(match number {
            None => head,
            Some(n) => BlockHeader {
                number: n,
                timestamp: head.timestamp.saturating_sub((head.number.saturating_sub(n)) * 13),
            },
        })
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<TxInfo>, ClientError> {
        Ok(Some(TxInfo { hash, nonce: 0, gas_price: *self.gas_price.lock().unwrap() }))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, ClientError> {
        Ok(Some(Receipt {
            tx_hash: hash,
            status: true,
            gas_used: U256::from(120_000u64),
            effective_gas_price: *self.gas_price.lock().unwrap(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub opts: TxOpts,
    pub nonce: String,
    pub request_ids: [u64; 5],
    pub values: [U256; 5],
}

pub struct MockContract {
    pub vars: Mutex<CurrentVariables>,
    pub staker_status: Mutex<U256>,
    pub uint_vars: Mutex<HashMap<B256, U256>>,
    pub trb_balance: Mutex<U256>,
    pub reward: Mutex<U256>,
    pub submitted: Mutex<Vec<RecordedSubmission>>,
    pub tips: Mutex<Vec<(u64, U256)>>,
    pub mined: Mutex<HashSet<B256>>,
    pub did_mine_calls: Mutex<Vec<B256>>,
    pub nonce_events: Mutex<Vec<NonceSubmittedEvent>>,
    pub transfer_events: Mutex<Vec<TransferredEvent>>,
    /// Added latency before submit_solution returns, for preemption tests.
    pub submit_delay: Mutex<Duration>,
}

impl MockContract {
    pub fn new(vars: CurrentVariables) -> Self {
        MockContract {
            vars: Mutex::new(vars),
            staker_status: Mutex::new(U256::from(1u64)),
            uint_vars: Mutex::new(HashMap::new()),
            trb_balance: Mutex::new(U256::ZERO),
            reward: Mutex::new(U256::ZERO),
            submitted: Mutex::new(Vec::new()),
            tips: Mutex::new(Vec::new()),
            mined: Mutex::new(HashSet::new()),
            did_mine_calls: Mutex::new(Vec::new()),
            nonce_events: Mutex::new(Vec::new()),
            transfer_events: Mutex::new(Vec::new()),
            submit_delay: Mutex::new(Duration::ZERO),
        }
    }

    fn tx(&self, opts: &TxOpts, tag: &[u8]) -> Transaction {
        Transaction {
            hash: keccak256([tag, &opts.nonce.to_be_bytes()].concat()),
            nonce: opts.nonce,
            gas_price: opts.gas_price,
        }
    }
}

#[async_trait]
impl Contract for MockContract {
    async fn get_current_variables(&self) -> Result<CurrentVariables, ClientError> {
        Ok(self.vars.lock().unwrap().clone())
    }

    async fn did_mine(&self, challenge: B256, _miner: Address) -> Result<bool, ClientError> {
        self.did_mine_calls.lock().unwrap().push(challenge);
        Ok(self.mined.lock().unwrap().contains(&challenge))
    }

    async fn get_staker_info(&self, _miner: Address) -> Result<(U256, U256), ClientError> {
        Ok((*self.staker_status.lock().unwrap(), U256::ZERO))
    }

    async fn get_uint_var(&self, key: B256) -> Result<U256, ClientError> {
        Ok(self.uint_vars.lock().unwrap().get(&key).copied().unwrap_or(U256::ZERO))
    }

    async fn current_reward(&self) -> Result<U256, ClientError> {
        Ok(*self.reward.lock().unwrap())
    }

    async fn balance_of(&self, _address: Address) -> Result<U256, ClientError> {
        Ok(*self.trb_balance.lock().unwrap())
    }

    async fn get_dispute_info(&self, _dispute_id: U256) -> Result<(u64, U256, bool), ClientError> {
        Ok((0, U256::ZERO, false))
    }

    async fn submit_solution(
        &self,
        opts: &TxOpts,
        nonce: &str,
        request_ids: [u64; 5],
        values: [U256; 5],
    ) -> Result<Transaction, ClientError> {
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.submitted.lock().unwrap().push(RecordedSubmission {
            opts: *opts,
            nonce: nonce.to_string(),
            request_ids,
            values,
        });
        Ok(self.tx(opts, b"submitSolution"))
    }

    async fn add_tip(
        &self,
        opts: &TxOpts,
        request_id: u64,
        amount: U256,
    ) -> Result<Transaction, ClientError> {
        self.tips.lock().unwrap().push((request_id, amount));
        Ok(self.tx(opts, b"addTip"))
    }

    async fn transfer(
        &self,
        opts: &TxOpts,
        _to: Address,
        _amount: U256,
    ) -> Result<Transaction, ClientError> {
        Ok(self.tx(opts, b"transfer"))
    }

    async fn approve(
        &self,
        opts: &TxOpts,
        _spender: Address,
        _amount: U256,
    ) -> Result<Transaction, ClientError> {
        Ok(self.tx(opts, b"approve"))
    }

    async fn deposit_stake(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        Ok(self.tx(opts, b"depositStake"))
    }

    async fn request_staking_withdraw(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        Ok(self.tx(opts, b"requestStakingWithdraw"))
    }

    async fn withdraw_stake(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        Ok(self.tx(opts, b"withdrawStake"))
    }

    async fn begin_dispute(
        &self,
        opts: &TxOpts,
        _request_id: u64,
        _timestamp: U256,
        _miner_index: u64,
    ) -> Result<Transaction, ClientError> {
        Ok(self.tx(opts, b"beginDispute"))
    }

    async fn vote(
        &self,
        opts: &TxOpts,
        _dispute_id: U256,
        _supports: bool,
    ) -> Result<Transaction, ClientError> {
        Ok(self.tx(opts, b"vote"))
    }

    async fn nonce_submitted_logs(
        &self,
        from_block: u64,
        to_block: u64,
        miners: Option<&[Address]>,
    ) -> Result<Vec<NonceSubmittedEvent>, ClientError> {
        Ok(self
            .nonce_events
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| ev.block_number >= from_block && ev.block_number <= to_block)
            .filter(|ev| miners.map_or(true, |m| m.contains(&ev.miner)))
            .cloned()
            .collect())
    }

    async fn transferred_logs(
        &self,
        from_block: u64,
        to_block: u64,
        to: &[Address],
    ) -> Result<Vec<TransferredEvent>, ClientError> {
        Ok(self
            .transfer_events
            .lock()
            .unwrap()
            .iter()
            .filter(|ev| ev.block_number >= from_block && ev.block_number <= to_block)
            .filter(|ev| to.contains(&ev.to))
            .cloned()
            .collect())
    }
}

pub fn test_variables(challenge_seed: u64, difficulty: u64, request_ids: [u64; 5]) -> CurrentVariables {
    let mut hash = [0u8; 32];
    hash[24..].copy_from_slice(&challenge_seed.to_be_bytes());
    CurrentVariables {
        challenge: B256::from(hash),
        request_ids,
        difficulty: U256::from(difficulty),
        query_string: String::new(),
        granularity: 1_000_000,
        tip: U256::ZERO,
    }
}
