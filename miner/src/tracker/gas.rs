use std::sync::Arc;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::Deserialize;
use shared::db::{self, Store};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Tracker;
use crate::eth::EthClient;
use crate::web;

const MAINNET: u64 = 1;
const DEFAULT_GAS_STATION_URL: &str = "https://ethgasstation.info/json/ethgasAPI.json";

/// What the gas station endpoint returns. Only the fields we read.
#[derive(Debug, Deserialize)]
struct GasPriceModel {
    /// Price in tenths of gwei.
    fast: f64,
}

/// Keeps the latest gas price in the store. On mainnet a third-party
/// estimator is preferred, the node's suggestion is the fallback everywhere.
pub struct GasTracker {
    client: Arc<dyn EthClient>,
    store: Store,
    http: reqwest::Client,
    gas_station_url: String,
}

impl GasTracker {
    pub fn new(client: Arc<dyn EthClient>, store: Store) -> Self {
        GasTracker {
            client,
            store,
            http: reqwest::Client::new(),
            gas_station_url: DEFAULT_GAS_STATION_URL.to_string(),
        }
    }

    async fn station_price(&self, cancel: &CancellationToken) -> anyhow::Result<U256> {
        let payload = web::fetch(&self.http, &self.gas_station_url, cancel).await?;
        let model: GasPriceModel = serde_json::from_slice(&payload)?;
        // fast is tenths of gwei; keep it in wei.
        let wei = (model.fast / 10.0) * 1e9;
        if wei <= 0.0 {
            anyhow::bail!("non-positive gas station price {}", model.fast);
        }
        Ok(U256::from(wei as u128))
    }
}

#[async_trait]
impl Tracker for GasTracker {
    fn name(&self) -> &'static str {
        "gas"
    }

    async fn exec(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let net = self.client.network_id().await?;

        let price = if net == MAINNET {
            match self.station_price(cancel).await {
                Ok(price) => {
                    info!("using gas station fast price {price}");
                    price
                }
                Err(err) => {
                    warn!("gas station unavailable ({err:#}), using the suggested price");
                    self.client.suggest_gas_price().await?
                }
            }
        } else {
            self.client.suggest_gas_price().await?
        };

        self.store.put(db::GAS_KEY, &db::encode_big(&price))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::mock::MockClient;

    #[tokio::test]
    async fn stores_the_suggested_price_off_mainnet() {
        let store = Store::temporary().unwrap();
        let client = Arc::new(MockClient::new(0, U256::ZERO, U256::from(7_000_000_000u64)));
        let tracker = GasTracker::new(client, store.clone());

        tracker.exec(&CancellationToken::new()).await.unwrap();

        let price = db::decode_big(&store.get(db::GAS_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(price, U256::from(7_000_000_000u64));
    }

    #[test]
    fn parses_the_gas_station_payload() {
        let model: GasPriceModel =
            serde_json::from_str(r#"{"fast": 250.0, "fastest": 300.0, "average": 100.0}"#)
                .unwrap();
        assert_eq!(model.fast, 250.0);
    }
}
