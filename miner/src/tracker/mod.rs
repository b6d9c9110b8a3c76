use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod balance;
pub mod challenge;
pub mod dispute;
pub mod gas;
pub mod index;
pub mod profit;
pub mod staker;
pub mod values;

/// A periodic polling body. Recoverable failures are logged by the runner
/// and retried on the next tick; they never reach the scheduler.
#[async_trait]
pub trait Tracker: Send + Sync {
    fn name(&self) -> &'static str;
    async fn exec(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Runs a tracker on its cycle until the token fires. The first tick is
/// immediate so consumers see fresh data shortly after startup.
pub fn spawn_loop(
    tracker: Arc<dyn Tracker>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("{} loop exited", tracker.name());
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = tracker.exec(&cancel).await {
                        warn!("{} tick failed: {err:#}", tracker.name());
                    }
                }
            }
        }
    })
}
