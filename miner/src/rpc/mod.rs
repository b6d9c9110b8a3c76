//! Concrete node and contract adapters over alloy. Everything alloy-flavored
//! stays in this module; the pipeline works against the eth traits.

use std::sync::Arc;

use alloy::consensus::Transaction as _;
use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::eth::{BlockNumberOrTag, BlockTransactionsKind, Filter, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::http::{Client, Http};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use shared::errors::ClientError;
use tracing::debug;

use crate::eth::{
    Account, BlockHeader, Contract, CurrentVariables, EthClient, NonceSubmittedEvent, Receipt,
    Transaction, TransferredEvent, TxInfo, TxOpts,
};
use crate::tracker::index::{ChainSourceFactory, Endpoint, ParserType, PriceSource};

mod uniswap;

pub use uniswap::UniswapSource;

alloy::sol! {
    interface ITribute {
        function getCurrentVariables() external view returns (
            bytes32 challenge,
            uint256[5] requestIds,
            uint256 difficulty,
            string queryString,
            uint256 granularity,
            uint256 tip
        );
        function didMine(bytes32 challenge, address miner) external view returns (bool);
        function getStakerInfo(address staker) external view returns (uint256 status, uint256 startDate);
        function getUintVar(bytes32 key) external view returns (uint256);
        function currentReward() external view returns (uint256);
        function balanceOf(address owner) external view returns (uint256);
        function getDisputeInfo(uint256 disputeId) external view returns (
            uint256 requestId,
            uint256 timestamp,
            bool executed
        );

        function submitMiningSolution(string nonce, uint256[5] requestIds, uint256[5] values) external;
        function addTip(uint256 requestId, uint256 amount) external;
        function transfer(address to, uint256 amount) external returns (bool);
        function approve(address spender, uint256 amount) external returns (bool);
        function depositStake() external;
        function requestStakingWithdraw() external;
        function withdrawStake() external;
        function beginDispute(uint256 requestId, uint256 timestamp, uint256 minerIndex) external;
        function vote(uint256 disputeId, bool supportsDispute) external;

        event NonceSubmitted(
            address indexed miner,
            string nonce,
            uint256[5] requestIds,
            uint256[5] values,
            bytes32 challenge
        );
        event Transferred(address indexed from, address indexed to, uint256 value);
    }
}

pub type HttpProvider = RootProvider<Http<Client>>;

fn rpc_err(context: &str, err: impl std::fmt::Display) -> ClientError {
    ClientError::new(format!("{context}: {err}"))
}

/// Thin `EthClient` over a JSON-RPC provider.
pub struct EthRpcClient {
    provider: HttpProvider,
}

impl EthRpcClient {
    pub fn connect(node_url: &str) -> anyhow::Result<Self> {
        let url = node_url
            .parse()
            .map_err(|e| anyhow::anyhow!("bad nodeURL {node_url:?}: {e}"))?;
        Ok(EthRpcClient { provider: RootProvider::new_http(url) })
    }

    pub fn provider(&self) -> HttpProvider {
        self.provider.clone()
    }
}

#[async_trait]
impl EthClient for EthRpcClient {
    async fn nonce_at(&self, address: Address) -> Result<u64, ClientError> {
        self.provider
            .get_transaction_count(address)
            .await
            .map_err(|e| rpc_err("getting nonce", e))
    }

    async fn pending_nonce_at(&self, address: Address) -> Result<u64, ClientError> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| rpc_err("getting pending nonce", e))
    }

    async fn balance_at(&self, address: Address) -> Result<U256, ClientError> {
        self.provider
            .get_balance(address)
            .await
            .map_err(|e| rpc_err("getting balance", e))
    }

    async fn suggest_gas_price(&self) -> Result<U256, ClientError> {
        self.provider
            .get_gas_price()
            .await
            .map(U256::from)
            .map_err(|e| rpc_err("getting gas price", e))
    }

    async fn network_id(&self) -> Result<u64, ClientError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| rpc_err("getting network id", e))
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<BlockHeader, ClientError> {
        let tag = match number {
            Some(n) => BlockNumberOrTag::Number(n),
            None => BlockNumberOrTag::Latest,
        };
        let block = self
            .provider
            .get_block_by_number(tag, BlockTransactionsKind::Hashes)
            .await
            .map_err(|e| rpc_err("getting block header", e))?
            .ok_or_else(|| ClientError::new("block not found"))?;
        Ok(BlockHeader {
            number: block.header.number,
            timestamp: block.header.timestamp,
        })
    }

    async fn transaction_by_hash(&self, hash: B256) -> Result<Option<TxInfo>, ClientError> {
        let tx = self
            .provider
            .get_transaction_by_hash(hash)
            .await
            .map_err(|e| rpc_err("getting transaction", e))?;
        Ok(tx.map(|tx| TxInfo {
            hash,
            nonce: tx.inner.nonce(),
            gas_price: U256::from(tx.inner.gas_price().unwrap_or_default()),
        }))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>, ClientError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| rpc_err("getting receipt", e))?;
        Ok(receipt.map(|r| Receipt {
            tx_hash: hash,
            status: r.status(),
            gas_used: U256::from(r.gas_used),
            effective_gas_price: U256::from(r.effective_gas_price),
        }))
    }
}

/// The oracle contract adapter: read calls through `eth_call`, write calls
/// signed locally and sent raw.
pub struct TributeContract {
    provider: HttpProvider,
    address: Address,
    signer: PrivateKeySigner,
    chain_id: std::sync::OnceLock<u64>,
}

impl TributeContract {
    pub fn new(provider: HttpProvider, address: Address, account: &Account) -> anyhow::Result<Self> {
        let signer = PrivateKeySigner::from_bytes(&account.private_key)
            .map_err(|e| anyhow::anyhow!("bad private key: {e}"))?;
        if signer.address() != account.address {
            anyhow::bail!(
                "PRIVATE_KEY derives {:#x}, config says {:#x}",
                signer.address(),
                account.address
            );
        }
        Ok(TributeContract {
            provider,
            address,
            signer,
            chain_id: std::sync::OnceLock::new(),
        })
    }

    async fn call<C: SolCall>(&self, call: C) -> Result<C::Return, ClientError> {
        let request = TransactionRequest::default()
            .with_to(self.address)
            .with_input(call.abi_encode());
        let raw = self
            .provider
            .call(&request)
            .await
            .map_err(|e| rpc_err("contract call", e))?;
        C::abi_decode_returns(&raw, true).map_err(|e| rpc_err("decoding contract return", e))
    }

    async fn send<C: SolCall>(&self, opts: &TxOpts, call: C) -> Result<Transaction, ClientError> {
        let chain_id = match self.chain_id.get() {
            Some(id) => *id,
            None => {
                let id = self
                    .provider
                    .get_chain_id()
                    .await
                    .map_err(|e| rpc_err("getting chain id", e))?;
                *self.chain_id.get_or_init(|| id)
            }
        };

        let mut request = TransactionRequest::default()
            .with_to(self.address)
            .with_input(call.abi_encode())
            .with_chain_id(chain_id)
            .with_nonce(opts.nonce)
            .with_value(opts.value)
            .with_gas_limit(opts.gas_limit)
            .with_gas_price(opts.gas_price.to::<u128>());
        request.from = Some(opts.from);

        let wallet = EthereumWallet::from(self.signer.clone());
        let signed = request
            .build(&wallet)
            .await
            .map_err(|e| rpc_err("signing transaction", e))?;

        let pending = self
            .provider
            .send_raw_transaction(&signed.encoded_2718())
            .await
            .map_err(|e| rpc_err("sending transaction", e))?;
        let hash = *pending.tx_hash();
        debug!("sent transaction {hash:#x} nonce {}", opts.nonce);
        Ok(Transaction { hash, nonce: opts.nonce, gas_price: opts.gas_price })
    }

    fn base_filter(&self, from_block: u64, to_block: u64, signature: B256) -> Filter {
        Filter::new()
            .address(self.address)
            .event_signature(signature)
            .from_block(from_block)
            .to_block(to_block)
    }
}

fn ids_to_u64(ids: &[U256; 5]) -> [u64; 5] {
    let mut out = [0u64; 5];
    for (slot, id) in out.iter_mut().zip(ids) {
        *slot = id.to::<u64>();
    }
    out
}

#[async_trait]
impl Contract for TributeContract {
    async fn get_current_variables(&self) -> Result<CurrentVariables, ClientError> {
        let ret = self.call(ITribute::getCurrentVariablesCall {}).await?;
        Ok(CurrentVariables {
            challenge: ret.challenge,
            request_ids: ids_to_u64(&ret.requestIds),
            difficulty: ret.difficulty,
            query_string: ret.queryString,
            granularity: ret.granularity.to::<u64>(),
            tip: ret.tip,
        })
    }

    async fn did_mine(&self, challenge: B256, miner: Address) -> Result<bool, ClientError> {
        Ok(self.call(ITribute::didMineCall { challenge, miner }).await?._0)
    }

    async fn get_staker_info(&self, miner: Address) -> Result<(U256, U256), ClientError> {
        let ret = self.call(ITribute::getStakerInfoCall { staker: miner }).await?;
        Ok((ret.status, ret.startDate))
    }

    async fn get_uint_var(&self, key: B256) -> Result<U256, ClientError> {
        Ok(self.call(ITribute::getUintVarCall { key }).await?._0)
    }

    async fn current_reward(&self) -> Result<U256, ClientError> {
        Ok(self.call(ITribute::currentRewardCall {}).await?._0)
    }

    async fn balance_of(&self, address: Address) -> Result<U256, ClientError> {
        Ok(self.call(ITribute::balanceOfCall { owner: address }).await?._0)
    }

    async fn get_dispute_info(&self, dispute_id: U256) -> Result<(u64, U256, bool), ClientError> {
        let ret = self.call(ITribute::getDisputeInfoCall { disputeId: dispute_id }).await?;
        Ok((ret.requestId.to::<u64>(), ret.timestamp, ret.executed))
    }

    async fn submit_solution(
        &self,
        opts: &TxOpts,
        nonce: &str,
        request_ids: [u64; 5],
        values: [U256; 5],
    ) -> Result<Transaction, ClientError> {
        self.send(opts, ITribute::submitMiningSolutionCall {
            nonce: nonce.to_string(),
            requestIds: request_ids.map(U256::from),
            values,
        })
        .await
    }

    async fn add_tip(
        &self,
        opts: &TxOpts,
        request_id: u64,
        amount: U256,
    ) -> Result<Transaction, ClientError> {
        self.send(opts, ITribute::addTipCall { requestId: U256::from(request_id), amount })
            .await
    }

    async fn transfer(
        &self,
        opts: &TxOpts,
        to: Address,
        amount: U256,
    ) -> Result<Transaction, ClientError> {
        self.send(opts, ITribute::transferCall { to, amount }).await
    }

    async fn approve(
        &self,
        opts: &TxOpts,
        spender: Address,
        amount: U256,
    ) -> Result<Transaction, ClientError> {
        self.send(opts, ITribute::approveCall { spender, amount }).await
    }

    async fn deposit_stake(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        self.send(opts, ITribute::depositStakeCall {}).await
    }

    async fn request_staking_withdraw(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        self.send(opts, ITribute::requestStakingWithdrawCall {}).await
    }

    async fn withdraw_stake(&self, opts: &TxOpts) -> Result<Transaction, ClientError> {
        self.send(opts, ITribute::withdrawStakeCall {}).await
    }

    async fn begin_dispute(
        &self,
        opts: &TxOpts,
        request_id: u64,
        timestamp: U256,
        miner_index: u64,
    ) -> Result<Transaction, ClientError> {
        self.send(opts, ITribute::beginDisputeCall {
            requestId: U256::from(request_id),
            timestamp,
            minerIndex: U256::from(miner_index),
        })
        .await
    }

    async fn vote(
        &self,
        opts: &TxOpts,
        dispute_id: U256,
        supports: bool,
    ) -> Result<Transaction, ClientError> {
        self.send(opts, ITribute::voteCall {
            disputeId: dispute_id,
            supportsDispute: supports,
        })
        .await
    }

    async fn nonce_submitted_logs(
        &self,
        from_block: u64,
        to_block: u64,
        miners: Option<&[Address]>,
    ) -> Result<Vec<NonceSubmittedEvent>, ClientError> {
        let mut filter =
            self.base_filter(from_block, to_block, ITribute::NonceSubmitted::SIGNATURE_HASH);
        if let Some(miners) = miners {
            filter = filter.topic1(miners.iter().map(|a| a.into_word()).collect::<Vec<_>>());
        }
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| rpc_err("filtering NonceSubmitted logs", e))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let decoded = ITribute::NonceSubmitted::decode_log(&log.inner, true)
                .map_err(|e| rpc_err("decoding NonceSubmitted", e))?
                .data;
            events.push(NonceSubmittedEvent {
                miner: decoded.miner,
                nonce: decoded.nonce,
                challenge: decoded.challenge,
                request_ids: ids_to_u64(&decoded.requestIds),
                values: decoded.values,
                block_number: log.block_number.unwrap_or_default(),
                tx_hash: log.transaction_hash.unwrap_or_default(),
            });
        }
        Ok(events)
    }

    async fn transferred_logs(
        &self,
        from_block: u64,
        to_block: u64,
        to: &[Address],
    ) -> Result<Vec<TransferredEvent>, ClientError> {
        let filter = self
            .base_filter(from_block, to_block, ITribute::Transferred::SIGNATURE_HASH)
            .topic2(to.iter().map(|a| a.into_word()).collect::<Vec<_>>());
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| rpc_err("filtering Transferred logs", e))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let decoded = ITribute::Transferred::decode_log(&log.inner, true)
                .map_err(|e| rpc_err("decoding Transferred", e))?
                .data;
            events.push(TransferredEvent {
                from: decoded.from,
                to: decoded.to,
                value: decoded.value,
                block_number: log.block_number.unwrap_or_default(),
                tx_hash: log.transaction_hash.unwrap_or_default(),
            });
        }
        Ok(events)
    }
}

/// Builds on-chain price sources for index endpoints of type `ethereum`.
pub struct ChainSources {
    provider: HttpProvider,
}

impl ChainSources {
    pub fn new(provider: HttpProvider) -> Self {
        ChainSources { provider }
    }
}

impl ChainSourceFactory for ChainSources {
    fn make(&self, symbol: &str, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn PriceSource>> {
        match endpoint.parser {
            ParserType::Uniswap => Ok(Arc::new(UniswapSource::new(
                self.provider.clone(),
                symbol,
                endpoint,
            )?)),
            ParserType::Balancer => anyhow::bail!(
                "symbol {symbol}: Balancer sources need an external PriceSource implementation"
            ),
            ParserType::JsonPath => {
                anyhow::bail!("symbol {symbol}: jsonPath parser cannot read an on-chain source")
            }
        }
    }
}
