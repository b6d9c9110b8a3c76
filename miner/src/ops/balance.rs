use alloy_primitives::Address;

use super::format_units;
use crate::eth::{Contract, EthClient};

/// Prints one line with the address's ETH and TRB holdings.
pub async fn show(
    client: &dyn EthClient,
    contract: &dyn Contract,
    address: Address,
) -> anyhow::Result<()> {
    let eth = client.balance_at(address).await?;
    let trb = contract.balance_of(address).await?;
    println!("{address:#x} | {} ETH | {} TRB", format_units(eth), format_units(trb));
    Ok(())
}
