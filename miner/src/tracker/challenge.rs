use std::sync::{Arc, Mutex};

use alloy_primitives::U256;
use async_trait::async_trait;
use shared::db::{self, Store};
use shared::types::Challenge;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Tracker;
use crate::eth::Contract;

/// Polls the contract's current variables into the store and pokes the
/// scheduler only when the challenge actually changes.
pub struct ChallengeTracker {
    contract: Arc<dyn Contract>,
    store: Store,
    notify: mpsc::Sender<()>,
    last: Mutex<Option<Challenge>>,
}

impl ChallengeTracker {
    pub fn new(contract: Arc<dyn Contract>, store: Store, notify: mpsc::Sender<()>) -> Self {
        ChallengeTracker { contract, store, notify, last: Mutex::new(None) }
    }
}

#[async_trait]
impl Tracker for ChallengeTracker {
    fn name(&self) -> &'static str {
        "currentVariables"
    }

    async fn exec(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        let vars = self.contract.get_current_variables().await?;
        let challenge = Challenge {
            hash: vars.challenge,
            difficulty: vars.difficulty,
            request_ids: vars.request_ids,
            tip: vars.tip,
        };

        self.store.put(db::CHALLENGE_KEY, challenge.hash.as_slice())?;
        self.store.put(db::DIFFICULTY_KEY, &db::encode_big(&challenge.difficulty))?;
        for (i, id) in challenge.request_ids.iter().enumerate() {
            self.store.put(
                &format!("{}{}", db::REQUEST_ID_PREFIX, i),
                &db::encode_big(&U256::from(*id)),
            )?;
        }
        self.store.put(db::TIP_KEY, &db::encode_big(&challenge.tip))?;

        let mut last = self.last.lock().unwrap();
        if last.as_ref() != Some(&challenge) {
            info!(
                "new challenge {:#x} difficulty {} request ids {:?}",
                challenge.hash, challenge.difficulty, challenge.request_ids
            );
            *last = Some(challenge);
            // A full channel already has a wake-up pending.
            let _ = self.notify.try_send(());
        } else {
            debug!("challenge unchanged");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::B256;

    use super::*;
    use crate::eth::mock::{test_variables, MockContract};

    #[tokio::test]
    async fn writes_variables_and_notifies_once_per_change() {
        let store = Store::temporary().unwrap();
        let contract = Arc::new(MockContract::new(test_variables(256, 500, [1, 2, 3, 4, 5])));
        let (tx, mut rx) = mpsc::channel(8);
        let tracker = ChallengeTracker::new(contract.clone(), store.clone(), tx);
        let cancel = CancellationToken::new();

        // Ten unchanged polls produce exactly one notification.
        for _ in 0..10 {
            tracker.exec(&cancel).await.unwrap();
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // The store carries the published fields.
        let hash = store.get(db::CHALLENGE_KEY).unwrap().unwrap();
        assert_eq!(B256::from_slice(&hash), test_variables(256, 500, [1, 2, 3, 4, 5]).challenge);
        let difficulty =
            db::decode_big(&store.get(db::DIFFICULTY_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(difficulty, U256::from(500u64));
        let req0 = db::decode_big(
            &store.get(&format!("{}0", db::REQUEST_ID_PREFIX)).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(req0, U256::from(1u64));

        // A difficulty change is a new challenge round.
        contract.vars.lock().unwrap().difficulty = U256::from(900u64);
        tracker.exec(&cancel).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
