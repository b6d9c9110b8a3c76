use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use anyhow::Context;
use clap::{Parser, Subcommand};
use shared::db::Store;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{load_config_file, load_manual_data, Config};
use crate::eth::submitter::TxSubmitter;
use crate::eth::{Account, Contract, EthClient};
use crate::ops::dataserver::DataServerOps;
use crate::ops::mining::MiningMgr;
use crate::ops::tips::TipRequester;
use crate::pow::group::MiningGroup;
use crate::pow::hasher::{CpuHasher, Hasher};
use crate::pow::solution::SolutionHandler;
use crate::psr::Psrs;
use crate::rpc::{ChainSources, EthRpcClient, TributeContract};
use crate::tracker::challenge::ChallengeTracker;
use crate::tracker::spawn_loop;

mod config;
mod eth;
mod ops;
mod pow;
mod psr;
mod rpc;
mod tracker;
mod web;

#[derive(Parser, Debug)]
#[command(name = "tribute-miner", about = "Decentralized oracle miner", version)]
struct Cli {
    /// Path to the primary JSON config file.
    #[arg(long, default_value = "configs/config.json", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mine and submit solutions for the current challenge
    Mine {
        /// Rely on a store another process keeps fresh instead of running
        /// the full tracker set here.
        #[arg(long, short)]
        remote: bool,
    },
    /// Run the tracker set standalone against the shared store
    Dataserver,
    /// Staking operations
    Stake {
        #[command(subcommand)]
        op: StakeOp,
    },
    /// Send TRB to an address
    Transfer { amount: String, address: String },
    /// Approve a TRB allowance for an address
    Approve { amount: String, address: String },
    /// Check the balance of an address (defaults to the miner)
    Balance { address: Option<String> },
    /// Dispute operations
    Dispute {
        #[command(subcommand)]
        op: DisputeOp,
    },
}

#[derive(Subcommand, Debug)]
enum StakeOp {
    /// Deposit the TRB stake
    Deposit,
    /// Withdraw a released stake
    Withdraw,
    /// Request to withdraw the stake
    Request,
    /// Show the current staking status
    Status,
}

#[derive(Subcommand, Debug)]
enum DisputeOp {
    /// Vote on an active dispute
    Vote { dispute_id: u64, support: bool },
    /// Open a new dispute
    New { request_id: u64, timestamp: u64, miner_index: u64 },
    /// List known disputes
    Show,
}

/// Everything a command needs, built once. Handles are explicit; nothing
/// rides along in ambient state.
struct App {
    cfg: Config,
    store: Store,
    account: Account,
    client: Arc<dyn EthClient>,
    contract: Arc<dyn Contract>,
    submitter: Arc<TxSubmitter>,
    psrs: Arc<Psrs>,
    provider: rpc::HttpProvider,
}

impl App {
    fn build(cfg: Config) -> anyhow::Result<App> {
        let account = Account::from_env(&cfg.public_address)?;
        let store = Store::open(&cfg.db_file)
            .with_context(|| format!("open store at {}", cfg.db_file))?;

        let rpc_client = EthRpcClient::connect(&cfg.node_url)?;
        let provider = rpc_client.provider();
        let contract_address: Address = cfg
            .contract_address
            .parse()
            .map_err(|e| anyhow::anyhow!("bad contractAddress: {e}"))?;
        let contract: Arc<dyn Contract> =
            Arc::new(TributeContract::new(provider.clone(), contract_address, &account)?);
        let client: Arc<dyn EthClient> = Arc::new(rpc_client);

        let submitter = Arc::new(TxSubmitter::new(
            client.clone(),
            store.clone(),
            account.clone(),
            cfg.gas_multiplier,
            cfg.gas_max,
        ));
        let psrs = Arc::new(Psrs::new(
            store.clone(),
            cfg.dispute_time_delta,
            cfg.min_confidence,
            cfg.dispute_threshold,
            cfg.tracker_cycle.max(1),
        ));

        Ok(App { cfg, store, account, client, contract, submitter, psrs, provider })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    shared::log::init_log();

    let cli = Cli::parse();
    let cfg = load_config_file(&cli.config)?;
    let app = App::build(cfg)?;

    match cli.command {
        Command::Mine { remote } => mine(app, remote).await,
        Command::Dataserver => dataserver(app).await,
        Command::Stake { op } => match op {
            StakeOp::Deposit => ops::stake::deposit(app.contract.clone(), &app.submitter).await,
            StakeOp::Withdraw => ops::stake::withdraw(app.contract.clone(), &app.submitter).await,
            StakeOp::Request => {
                ops::stake::request_withdraw(app.contract.clone(), &app.submitter).await
            }
            StakeOp::Status => ops::stake::status(app.contract.as_ref(), &app.submitter).await,
        },
        Command::Transfer { amount, address } => {
            let to = parse_address(&address)?;
            let amount = ops::parse_trb(&amount)?;
            ops::transfer::transfer(app.contract.clone(), &app.submitter, to, amount).await
        }
        Command::Approve { amount, address } => {
            let spender = parse_address(&address)?;
            let amount = ops::parse_trb(&amount)?;
            ops::transfer::approve(app.contract.clone(), &app.submitter, spender, amount).await
        }
        Command::Balance { address } => {
            let target = match address {
                Some(raw) => parse_address(&raw)?,
                None => app.account.address,
            };
            ops::balance::show(app.client.as_ref(), app.contract.as_ref(), target).await
        }
        Command::Dispute { op } => match op {
            DisputeOp::Vote { dispute_id, support } => {
                ops::dispute::vote(app.contract.clone(), &app.submitter, dispute_id, support).await
            }
            DisputeOp::New { request_id, timestamp, miner_index } => {
                ops::dispute::new(
                    app.contract.clone(),
                    &app.submitter,
                    request_id,
                    timestamp,
                    miner_index,
                )
                .await
            }
            DisputeOp::Show => ops::dispute::show(app.contract.as_ref()).await,
        },
    }
}

fn parse_address(raw: &str) -> anyhow::Result<Address> {
    raw.parse().map_err(|e| anyhow::anyhow!("bad address {raw:?}: {e}"))
}

async fn mine(app: App, remote: bool) -> anyhow::Result<()> {
    if app.cfg.enable_pool_worker {
        warn!("pool worker mode is not supported by this build, mining standalone");
    }

    // No point burning hashes if the stake cannot submit.
    let (status, _) = app.contract.get_staker_info(app.account.address).await?;
    if status != U256::from(1u64) {
        anyhow::bail!("miner is not able to mine with staker status {status}");
    }

    let (challenge_tx, challenge_rx) = mpsc::channel(1);
    let tracker_cancel = CancellationToken::new();
    let chain_sources = ChainSources::new(app.provider.clone());

    // Co-located deployments run the full tracker set; remote ones only
    // poll the challenge and read everything else from the shared store.
    let mut dataserver = None;
    if remote {
        let tracker = Arc::new(ChallengeTracker::new(
            app.contract.clone(),
            app.store.clone(),
            challenge_tx,
        ));
        spawn_loop(
            tracker,
            std::time::Duration::from_secs(app.cfg.tracker_cycle.max(1)),
            tracker_cancel.clone(),
        );
    } else {
        dataserver = Some(DataServerOps::start(
            &app.cfg,
            app.store.clone(),
            app.client.clone(),
            app.contract.clone(),
            app.psrs.clone(),
            app.account.address,
            challenge_tx,
            Some(&chain_sources),
        )?);
    }

    // Hashers: CPU threads here, GPU kernels are separate builds.
    let cpus = if app.cfg.num_processors > 0 {
        app.cfg.num_processors
    } else {
        num_cpus::get()
    };
    if !app.cfg.gpu_config.is_empty() {
        warn!(
            "GPUConfig names {} devices but this build carries no GPU kernels",
            app.cfg.gpu_config.len()
        );
    }
    let hashers: Vec<Arc<dyn Hasher>> = (0..cpus)
        .map(|i| Arc::new(CpuHasher::new(i)) as Arc<dyn Hasher>)
        .collect();
    info!("mining with {} hashers", hashers.len());

    let (group_in_tx, group_in_rx) = mpsc::channel(4);
    let (group_out_tx, group_out_rx) = mpsc::channel(4);
    tokio::spawn(MiningGroup::new(hashers).mine(group_in_rx, group_out_tx));

    let manual_data = load_manual_data(&app.cfg.manual_data_file)?;
    let handler = Arc::new(SolutionHandler::new(
        app.store.clone(),
        app.contract.clone(),
        app.submitter.clone(),
        app.psrs.clone(),
        app.account.address,
        manual_data,
        app.cfg.submit_zero_legacy,
    ));

    // Keep untipped rounds worth answering when the operator funds tips.
    let tipper = (app.cfg.request_tips > 0).then(|| {
        Arc::new(TipRequester::new(
            app.contract.clone(),
            app.submitter.clone(),
            U256::from(app.cfg.request_tips) * U256::from(10u64).pow(U256::from(18u64)),
        ))
    });

    let mgr = MiningMgr::new(
        app.store.clone(),
        app.contract.clone(),
        handler,
        group_in_tx,
        group_out_rx,
        challenge_rx,
        tipper,
        app.account.lower_hex(),
    );

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    let run = mgr.run(shutdown).await;

    // The mining half has drained; now the trackers.
    tracker_cancel.cancel();
    if let Some(dataserver) = dataserver {
        dataserver.stop().await;
    }
    info!("main shutdown complete");
    run
}

async fn dataserver(app: App) -> anyhow::Result<()> {
    let (challenge_tx, mut challenge_rx) = mpsc::channel(1);
    // Nobody schedules work here; drain the notifications.
    tokio::spawn(async move { while challenge_rx.recv().await.is_some() {} });

    let chain_sources = ChainSources::new(app.provider.clone());
    let ops = DataServerOps::start(
        &app.cfg,
        app.store.clone(),
        app.client.clone(),
        app.contract.clone(),
        app.psrs.clone(),
        app.account.address,
        challenge_tx,
        Some(&chain_sources),
    )?;
    info!("dataserver running against {}", app.cfg.db_file);

    tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
    info!("interrupt received, shutting down");
    ops.stop().await;
    info!("main shutdown complete");
    Ok(())
}
