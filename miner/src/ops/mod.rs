use alloy_primitives::U256;

pub mod balance;
pub mod dataserver;
pub mod dispute;
pub mod mining;
pub mod stake;
pub mod tips;
pub mod transfer;

pub const TRB_DECIMALS: u32 = 18;

/// Parses a human TRB amount like "1.5" into its 18-decimal representation.
pub fn parse_trb(amount: &str) -> anyhow::Result<U256> {
    let amount = amount.trim();
    let (whole, frac) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    if frac.len() > TRB_DECIMALS as usize {
        anyhow::bail!("amount {amount:?} has more than {TRB_DECIMALS} decimal places");
    }
    if whole.is_empty() && frac.is_empty() {
        anyhow::bail!("empty amount");
    }

    let whole: U256 = if whole.is_empty() {
        U256::ZERO
    } else {
        whole.parse().map_err(|_| anyhow::anyhow!("bad amount {amount:?}"))?
    };
    let mut padded = frac.to_string();
    while padded.len() < TRB_DECIMALS as usize {
        padded.push('0');
    }
    let frac: U256 = if padded.is_empty() {
        U256::ZERO
    } else {
        padded.parse().map_err(|_| anyhow::anyhow!("bad amount {amount:?}"))?
    };

    Ok(whole * U256::from(10u64).pow(U256::from(TRB_DECIMALS)) + frac)
}

/// Formats an 18-decimal amount for display.
pub fn format_units(value: U256) -> String {
    let wei: f64 = value.to_string().parse().unwrap_or(f64::MAX);
    format!("{:.6}", wei / 1e18)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trb_amounts() {
        assert_eq!(parse_trb("1").unwrap(), U256::from(10u64).pow(U256::from(18u64)));
        assert_eq!(
            parse_trb("1.5").unwrap(),
            U256::from(15u64) * U256::from(10u64).pow(U256::from(17u64))
        );
        assert_eq!(parse_trb("0.000000000000000001").unwrap(), U256::from(1u64));
        assert!(parse_trb("1.0000000000000000001").is_err());
        assert!(parse_trb("").is_err());
        assert!(parse_trb("abc").is_err());
    }

    #[test]
    fn formats_units() {
        assert_eq!(format_units(U256::from(10u64).pow(U256::from(18u64))), "1.000000");
        assert_eq!(format_units(U256::ZERO), "0.000000");
    }
}
