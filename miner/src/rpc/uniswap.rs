use alloy::network::TransactionBuilder;
use alloy::providers::Provider;
use alloy::rpc::types::eth::TransactionRequest;
use alloy::sol_types::SolCall;
use alloy_primitives::Address;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::HttpProvider;
use crate::tracker::index::{Endpoint, PriceSource};

alloy::sol! {
    interface IUniswapV2Pair {
        function getReserves() external view returns (
            uint112 reserve0,
            uint112 reserve1,
            uint32 blockTimestampLast
        );
    }
}

/// Spot price from a V2-style pair: reserve1/reserve0 adjusted for token
/// decimals. `param` carries the decimals as `"dec0:dec1"` (18:18 default).
pub struct UniswapSource {
    provider: HttpProvider,
    pair: Address,
    source: String,
    scale: f64,
}

impl UniswapSource {
    pub fn new(provider: HttpProvider, symbol: &str, endpoint: &Endpoint) -> anyhow::Result<Self> {
        let pair: Address = endpoint
            .url
            .parse()
            .map_err(|e| anyhow::anyhow!("symbol {symbol}: bad pair address {:?}: {e}", endpoint.url))?;

        let (dec0, dec1) = match endpoint.param.split_once(':') {
            Some((a, b)) => (
                a.trim().parse::<i32>().unwrap_or(18),
                b.trim().parse::<i32>().unwrap_or(18),
            ),
            None => (18, 18),
        };

        Ok(UniswapSource {
            provider,
            pair,
            source: format!("uniswap:{}", endpoint.url.to_lowercase()),
            scale: 10f64.powi(dec0 - dec1),
        })
    }
}

#[async_trait]
impl PriceSource for UniswapSource {
    fn source(&self) -> &str {
        &self.source
    }

    async fn get(&self, _cancel: &CancellationToken) -> anyhow::Result<(f64, i64)> {
        let request = TransactionRequest::default()
            .with_to(self.pair)
            .with_input(IUniswapV2Pair::getReservesCall {}.abi_encode());
        let raw = self.provider.call(&request).await?;
        let reserves = IUniswapV2Pair::getReservesCall::abi_decode_returns(&raw, true)?;

        let reserve0: f64 = reserves.reserve0.to_string().parse()?;
        let reserve1: f64 = reserves.reserve1.to_string().parse()?;
        if reserve0 <= 0.0 {
            anyhow::bail!("pair {} has no liquidity", self.pair);
        }
        let price = (reserve1 / reserve0) * self.scale;
        Ok((price, reserves.blockTimestampLast as i64 * 1000))
    }
}
