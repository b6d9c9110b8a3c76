use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shared::db::{self, Store};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Tracker;
use crate::psr::Psrs;

/// Recomputes every registry entry and publishes the ones whose data is
/// confident enough for submission.
pub struct QueriedValuesTracker {
    psrs: Arc<Psrs>,
    store: Store,
}

impl QueriedValuesTracker {
    pub fn new(psrs: Arc<Psrs>, store: Store) -> Self {
        QueriedValuesTracker { psrs, store }
    }
}

#[async_trait]
impl Tracker for QueriedValuesTracker {
    fn name(&self) -> &'static str {
        "psrValues"
    }

    async fn exec(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let now = Utc::now().timestamp_millis();
        for id in self.psrs.ids() {
            match self.psrs.value_for_time(id, now)? {
                Some((value, confidence)) if confidence >= self.psrs.min_confidence() => {
                    self.store.put(
                        &format!("{}{}", db::QUERIED_VALUE_PREFIX, id),
                        &db::encode_big(&value),
                    )?;
                    debug!("request id {id} value {value} confidence {confidence:.2}");
                }
                Some((_, confidence)) => {
                    debug!("request id {id} unavailable, confidence {confidence:.2}");
                }
                None => debug!("request id {id} has no samples"),
            }
        }
        Ok(())
    }
}
