use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::Context;
use shared::db::Store;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::eth::{Contract, EthClient};
use crate::psr::Psrs;
use crate::tracker::balance::BalanceTracker;
use crate::tracker::challenge::ChallengeTracker;
use crate::tracker::dispute::DisputeChecker;
use crate::tracker::gas::GasTracker;
use crate::tracker::index::{load_index_file, ChainSourceFactory, IndexTracker};
use crate::tracker::profit::ProfitTracker;
use crate::tracker::staker::{DisputeStatusTracker, TimeOutTracker};
use crate::tracker::values::QueriedValuesTracker;
use crate::tracker::{spawn_loop, Tracker};

const STOP_WAIT: Duration = Duration::from_secs(30);

/// The full tracker set running against the shared store. `mine` embeds one
/// unless it is pointed at a store another process keeps fresh.
pub struct DataServerOps {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl DataServerOps {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        cfg: &Config,
        store: Store,
        client: Arc<dyn EthClient>,
        contract: Arc<dyn Contract>,
        psrs: Arc<Psrs>,
        address: Address,
        challenge_notify: mpsc::Sender<()>,
        chain_sources: Option<&dyn ChainSourceFactory>,
    ) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let cycle = Duration::from_secs(cfg.tracker_cycle.max(1));
        let psr_cycle = Duration::from_secs(cfg.psr_cycle.max(1));

        let whitelist = parse_whitelist(&cfg.server_whitelist)?;

        let trackers: Vec<Arc<dyn Tracker>> = vec![
            Arc::new(ChallengeTracker::new(contract.clone(), store.clone(), challenge_notify)),
            Arc::new(GasTracker::new(client.clone(), store.clone())),
            Arc::new(TimeOutTracker::new(
                contract.clone(),
                store.clone(),
                address,
                whitelist.clone(),
            )),
            Arc::new(DisputeStatusTracker::new(
                contract.clone(),
                store.clone(),
                address,
                whitelist.clone(),
            )),
            Arc::new(BalanceTracker::new(
                client.clone(),
                contract.clone(),
                store.clone(),
                address,
            )),
            Arc::new(DisputeChecker::new(client.clone(), contract.clone(), psrs.clone())),
            Arc::new(ProfitTracker::new(
                client.clone(),
                contract.clone(),
                psrs.clone(),
                std::iter::once(address).chain(whitelist).collect(),
            )),
        ];

        let mut handles: Vec<JoinHandle<()>> = trackers
            .into_iter()
            .map(|t| spawn_loop(t, cycle, cancel.clone()))
            .collect();
        handles.push(spawn_loop(
            Arc::new(QueriedValuesTracker::new(psrs, store.clone())),
            psr_cycle,
            cancel.clone(),
        ));

        // Price samplers, one per (symbol, endpoint).
        let index_path = std::path::Path::new(&cfg.index_file);
        if index_path.exists() {
            let indexes = load_index_file(index_path)?;
            let tracker = IndexTracker::build(store, indexes, cycle, chain_sources)?;
            info!("tracking {} price sources", tracker.source_count());
            handles.extend(tracker.start(cancel.clone()));
        } else {
            warn!("index file {} not found, no price sources tracked", cfg.index_file);
        }

        Ok(DataServerOps { cancel, handles })
    }

    /// Cancels every loop and waits up to the shutdown budget; stragglers
    /// are logged and abandoned.
    pub async fn stop(self) {
        self.cancel.cancel();
        let count = self.handles.len();
        let drained = tokio::time::timeout(STOP_WAIT, async {
            for handle in self.handles {
                let _ = handle.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("{count} tracker loops did not all exit within {STOP_WAIT:?}");
        }
    }
}

fn parse_whitelist(raw: &[String]) -> anyhow::Result<Vec<Address>> {
    raw.iter()
        .map(|s| {
            s.parse::<Address>()
                .with_context(|| format!("bad serverWhitelist address {s:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use shared::db;

    use super::*;
    use crate::eth::mock::{test_variables, MockClient, MockContract};

    #[tokio::test]
    async fn runs_and_stops_the_tracker_set() {
        let store = Store::temporary().unwrap();
        let client = Arc::new(MockClient::new(0, U256::from(1u64), U256::from(2u64)));
        let contract = Arc::new(MockContract::new(test_variables(9, 100, [1, 2, 3, 4, 5])));
        let psrs = Arc::new(Psrs::new(store.clone(), 60, 0.8, 0.05, 30));
        let (tx, mut rx) = mpsc::channel(1);

        let cfg = Config {
            tracker_cycle: 1,
            index_file: "does-not-exist.json".into(),
            ..Config::default()
        };
        let ops = DataServerOps::start(
            &cfg,
            store.clone(),
            client,
            contract,
            psrs,
            Address::repeat_byte(7),
            tx,
            None,
        )
        .unwrap();

        // The first ticks land immediately: a challenge notification and
        // the mirrored store keys appear.
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("challenge notification")
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.get(db::GAS_KEY).unwrap().is_none() {
            assert!(tokio::time::Instant::now() < deadline, "gas price never stored");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tokio::time::timeout(Duration::from_secs(10), ops.stop())
            .await
            .expect("stop within the budget");
    }

    #[test]
    fn rejects_bad_whitelist_entries() {
        assert!(parse_whitelist(&["nope".to_string()]).is_err());
        assert_eq!(
            parse_whitelist(&["0x724d1b69a7ba352f11d73fdbdeb7ff869cb22e19".to_string()])
                .unwrap()
                .len(),
            1
        );
    }
}
