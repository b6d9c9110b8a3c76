use std::collections::HashMap;

use alloy_primitives::U256;
use shared::db::{self, Store};
use shared::errors::StoreError;
use shared::types::Sample;

/// Registry entry for the TRB/ETH conversion used by profit accounting.
pub const REQUEST_ID_TRB_ETH: u64 = 43;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    Median,
    Mean,
    VolumeWeightedAverage,
    /// Same computation as `Mean`, anchored at an explicit historical time.
    MeanAt,
}

/// Recipe for producing a single value for one request ID.
#[derive(Debug, Clone)]
pub struct Psr {
    pub id: u64,
    pub symbols: &'static [&'static str],
    pub aggregator: Aggregator,
    /// Fixed-point scale applied before on-chain submission.
    pub granularity: u64,
}

/// The known request recipes. Static, built once at startup.
fn registry() -> Vec<Psr> {
    use Aggregator::*;
    let psr = |id, symbols, aggregator, granularity| Psr { id, symbols, aggregator, granularity };
    vec![
        psr(1, &["ETH/USD"][..], Median, 1_000_000),
        psr(2, &["BTC/USD"][..], Median, 1_000_000),
        psr(3, &["BNB/USD"][..], Median, 1_000_000),
        psr(4, &["BTC/USD", "BTC/USD-VOLUME"][..], VolumeWeightedAverage, 1_000_000),
        psr(5, &["ETH/BTC"][..], Median, 1_000_000),
        psr(6, &["BNB/BTC"][..], Median, 1_000_000),
        psr(10, &["ETH/USD", "ETH/USD-VOLUME"][..], VolumeWeightedAverage, 1_000_000),
        psr(41, &["ETH/USD"][..], MeanAt, 1_000_000),
        psr(REQUEST_ID_TRB_ETH, &["TRB/ETH"][..], Median, 1_000_000),
        psr(50, &["TRB/USD"][..], Median, 1_000_000),
        psr(59, &["ETH/JPY"][..], Median, 1_000_000),
    ]
}

#[derive(Debug, Clone)]
pub struct ValueCheck {
    pub low: f64,
    pub high: f64,
    pub within_range: bool,
    pub datapoints: Vec<f64>,
    /// Unix millisecond timestamps the datapoints were sampled at.
    pub times: Vec<i64>,
}

/// Lookup and aggregation over the sample series in the store.
pub struct Psrs {
    store: Store,
    by_id: HashMap<u64, Psr>,
    /// Half-width of the aggregation window, milliseconds.
    time_delta_ms: i64,
    min_confidence: f64,
    dispute_threshold: f64,
    /// Assumed sampling interval when a source has not recorded one.
    default_interval_secs: f64,
}

impl Psrs {
    pub fn new(
        store: Store,
        time_delta_secs: u64,
        min_confidence: f64,
        dispute_threshold: f64,
        default_interval_secs: u64,
    ) -> Self {
        Psrs {
            store,
            by_id: registry().into_iter().map(|p| (p.id, p)).collect(),
            time_delta_ms: (time_delta_secs as i64) * 1000,
            min_confidence,
            dispute_threshold,
            default_interval_secs: default_interval_secs.max(1) as f64,
        }
    }

    pub fn get(&self, id: u64) -> Option<&Psr> {
        self.by_id.get(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    /// The registry value for `id` at `at_ms`, scaled by the PSR's
    /// granularity, plus the confidence of the data behind it. `None` when
    /// the id is unknown or no samples exist in the window.
    pub fn value_for_time(&self, id: u64, at_ms: i64) -> Result<Option<(U256, f64)>, StoreError> {
        match self.float_value_for_time(id, at_ms)? {
            Some((value, confidence)) => {
                let scaled = if value <= 0.0 { 0.0 } else { value };
                Ok(Some((U256::from(scaled.round() as u128), confidence)))
            }
            None => Ok(None),
        }
    }

    /// Scaled value as a float, the form range checks compare against.
    pub fn float_value_for_time(
        &self,
        id: u64,
        at_ms: i64,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let Some(psr) = self.by_id.get(&id) else { return Ok(None) };

        let raw = match psr.aggregator {
            Aggregator::VolumeWeightedAverage => self.vwap(psr, at_ms)?,
            Aggregator::Median => self.pointwise(psr, at_ms, median)?,
            Aggregator::Mean | Aggregator::MeanAt => self.pointwise(psr, at_ms, mean)?,
        };

        Ok(raw.map(|(value, confidence)| (value * psr.granularity as f64, confidence)))
    }

    /// Whether `value` for request `id` sits inside the confidence band of
    /// recent neighbor samples, checked in five places spread over the
    /// dispute time delta. `None` when no sample point was confident enough.
    pub fn check_value_at_time(
        &self,
        id: u64,
        value: U256,
        at_ms: i64,
    ) -> Result<Option<ValueCheck>, StoreError> {
        let mut datapoints = Vec::new();
        let mut times = Vec::new();
        for i in 0..5i64 {
            let t = at_ms + (i - 2) * self.time_delta_ms / 5;
            if let Some((v, confidence)) = self.float_value_for_time(id, t)? {
                if confidence > self.min_confidence {
                    datapoints.push(v);
                    times.push(t);
                }
            }
        }
        if datapoints.is_empty() {
            return Ok(None);
        }

        let mut low = f64::MAX;
        let mut high = 0.0f64;
        for dp in &datapoints {
            low = low.min(*dp);
            high = high.max(*dp);
        }
        low *= 1.0 - self.dispute_threshold;
        high *= 1.0 + self.dispute_threshold;

        let val: f64 = value.to_string().parse().unwrap_or(f64::MAX);
        Ok(Some(ValueCheck {
            low,
            high,
            within_range: val > low && val < high,
            datapoints,
            times,
        }))
    }

    /// Aggregate sample values across every source of every symbol.
    fn pointwise(
        &self,
        psr: &Psr,
        at_ms: i64,
        combine: fn(&mut Vec<f64>) -> f64,
    ) -> Result<Option<(f64, f64)>, StoreError> {
        let mut per_symbol = Vec::new();
        let mut confidences = Vec::new();
        for symbol in psr.symbols {
            let (samples, confidence) = self.symbol_samples(symbol, at_ms)?;
            confidences.push(confidence);
            if !samples.is_empty() {
                let mut values: Vec<f64> = samples.iter().map(|s| s.value).collect();
                per_symbol.push(combine(&mut values));
            }
        }
        if per_symbol.is_empty() {
            return Ok(None);
        }
        let value = per_symbol.iter().sum::<f64>() / per_symbol.len() as f64;
        let confidence = confidences.iter().sum::<f64>() / confidences.len().max(1) as f64;
        Ok(Some((value, confidence)))
    }

    /// Price and volume symbols joined positionally within the window.
    fn vwap(&self, psr: &Psr, at_ms: i64) -> Result<Option<(f64, f64)>, StoreError> {
        let price_symbol = psr.symbols.first().copied().unwrap_or_default();
        let volume_symbol = psr.symbols.get(1).copied().unwrap_or_default();
        let (prices, price_conf) = self.symbol_samples(price_symbol, at_ms)?;
        let (volumes, volume_conf) = self.symbol_samples(volume_symbol, at_ms)?;

        let n = prices.len().min(volumes.len());
        if n == 0 {
            return Ok(None);
        }
        let mut weighted = 0.0;
        let mut total = 0.0;
        for i in 0..n {
            weighted += prices[i].value * volumes[i].value;
            total += volumes[i].value;
        }
        let value = if total > 0.0 {
            weighted / total
        } else {
            prices.iter().take(n).map(|s| s.value).sum::<f64>() / n as f64
        };
        Ok(Some((value, (price_conf + volume_conf) / 2.0)))
    }

    /// All samples for a symbol in `[t-delta, t+delta]` across its sources,
    /// with confidence = actual / expected sample count.
    fn symbol_samples(&self, symbol: &str, at_ms: i64) -> Result<(Vec<Sample>, f64), StoreError> {
        let from = at_ms - self.time_delta_ms;
        let to = at_ms + self.time_delta_ms;
        let window_secs = (to - from) as f64 / 1000.0;

        let mut samples = Vec::new();
        let mut expected = 0.0;
        for name in self.store.series_names(&db::index_series_prefix(symbol)) {
            let series = self.store.series(&name)?;
            samples.extend(series.range(from, to)?);

            let interval_name = format!("interval_{}", &name["idx_".len()..]);
            let interval = self
                .store
                .series(&interval_name)?
                .last()?
                .map(|s| s.value)
                .filter(|v| *v > 0.0)
                .unwrap_or(self.default_interval_secs);
            expected += window_secs / interval;
        }
        samples.sort_by_key(|s| s.ts);

        let confidence = if expected > 0.0 {
            (samples.len() as f64 / expected).min(1.0)
        } else {
            0.0
        };
        Ok((samples, confidence))
    }
}

/// Human-readable account of an out-of-band value, for the dispute artifact
/// and the high-severity log line.
pub fn format_value_check(request_id: u64, at_ms: i64, value: &U256, check: &ValueCheck) -> String {
    let mut s = format!(
        "suspected incorrect value {value} for request id {request_id} at {at_ms}ms \
         (expected within [{:.0}, {:.0}]), nearest values:\n",
        check.low, check.high
    );
    for (dp, t) in check.datapoints.iter().zip(&check.times) {
        let delta_ms = at_ms - t;
        if delta_ms >= 0 {
            s.push_str(&format!("\t{dp:.0}, {}s before\n", delta_ms / 1000));
        } else {
            s.push_str(&format!("\t{dp:.0}, {}s after\n", -delta_ms / 1000));
        }
    }
    s
}

/// Writes a dispute-candidate file and returns its path.
pub fn save_dispute_artifact(
    dir: &std::path::Path,
    at_ms: i64,
    body: &str,
) -> std::io::Result<std::path::PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("possible-dispute-{at_ms}.txt"));
    std::fs::write(&path, body)?;
    Ok(path)
}

fn mean(values: &mut Vec<f64>) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &mut Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn seed(store: &Store, symbol: &str, source: &str, interval_secs: f64, samples: &[(i64, f64)]) {
        let series = store.series(&db::index_series(symbol, source)).unwrap();
        for (ts, v) in samples {
            series.append(*ts, *v).unwrap();
        }
        let intervals = store.series(&db::interval_series(symbol, source)).unwrap();
        intervals.append(NOW, interval_secs).unwrap();
    }

    fn psrs(store: &Store, delta_secs: u64) -> Psrs {
        Psrs::new(store.clone(), delta_secs, 0.8, 0.05, 30)
    }

    #[test]
    fn median_over_window_scaled_by_granularity() {
        let store = Store::temporary().unwrap();
        seed(
            &store,
            "ETH/USD",
            "api.one",
            30.0,
            &[(NOW - 40_000, 100.0), (NOW - 20_000, 105.0), (NOW, 110.0), (NOW + 20_000, 120.0)],
        );

        let psrs = psrs(&store, 60);
        let (value, confidence) = psrs.value_for_time(1, NOW).unwrap().unwrap();
        // median of {100, 105, 110, 120} = 107.5, times 1e6
        assert_eq!(value, U256::from(107_500_000u64));
        assert!(confidence >= 0.8, "confidence {confidence}");
    }

    #[test]
    fn confidence_gating_reports_sparse_data() {
        let store = Store::temporary().unwrap();
        // One source, one second interval: 60 samples expected in a 60s
        // window; only three present.
        seed(
            &store,
            "ETH/USD",
            "api.one",
            1.0,
            &[(NOW - 10_000, 100.0), (NOW, 101.0), (NOW + 10_000, 102.0)],
        );

        let psrs = psrs(&store, 30);
        let (_, confidence) = psrs.value_for_time(1, NOW).unwrap().unwrap();
        assert!(confidence <= 0.051, "confidence {confidence}");
    }

    #[test]
    fn unknown_request_id_has_no_value() {
        let store = Store::temporary().unwrap();
        let psrs = psrs(&store, 60);
        assert!(psrs.value_for_time(9_999, NOW).unwrap().is_none());
    }

    #[test]
    fn empty_window_has_no_value() {
        let store = Store::temporary().unwrap();
        seed(&store, "ETH/USD", "api.one", 30.0, &[(NOW - 900_000, 100.0)]);
        let psrs = psrs(&store, 60);
        assert!(psrs.value_for_time(1, NOW).unwrap().is_none());
    }

    #[test]
    fn vwap_weights_by_volume() {
        let store = Store::temporary().unwrap();
        seed(
            &store,
            "BTC/USD",
            "api.one",
            30.0,
            &[(NOW - 30_000, 100.0), (NOW, 200.0)],
        );
        seed(
            &store,
            "BTC/USD-VOLUME",
            "api.one",
            30.0,
            &[(NOW - 30_000, 1.0), (NOW, 3.0)],
        );

        let psrs = psrs(&store, 60);
        let (value, _) = psrs.value_for_time(4, NOW).unwrap().unwrap();
        // (100*1 + 200*3) / 4 = 175, times 1e6
        assert_eq!(value, U256::from(175_000_000u64));
    }

    #[test]
    fn check_value_flags_out_of_band_submission() {
        let store = Store::temporary().unwrap();
        // Dense samples so every probe point is confident.
        let samples: Vec<(i64, f64)> = (-12..=12)
            .map(|i| (NOW + i * 10_000, if i % 2 == 0 { 100.0 } else { 110.0 }))
            .collect();
        seed(&store, "ETH/USD", "api.one", 30.0, &samples);

        let psrs = psrs(&store, 60);

        // 150e6 sits far above the [~95e6, ~115.5e6] band.
        let check = psrs
            .check_value_at_time(1, U256::from(150_000_000u64), NOW)
            .unwrap()
            .expect("confident samples");
        assert!(!check.within_range);
        assert!(!check.datapoints.is_empty());

        // Five probes spread over the dispute delta: endpoints at 2/5 of
        // the 60s delta on either side.
        assert_eq!(check.times.first(), Some(&(NOW - 24_000)));
        assert_eq!(check.times.last(), Some(&(NOW + 24_000)));

        // A value inside the band passes.
        let check = psrs
            .check_value_at_time(1, U256::from(105_000_000u64), NOW)
            .unwrap()
            .unwrap();
        assert!(check.within_range);
    }

    #[test]
    fn check_value_without_confident_samples() {
        let store = Store::temporary().unwrap();
        let psrs = psrs(&store, 60);
        assert!(psrs
            .check_value_at_time(1, U256::from(1u64), NOW)
            .unwrap()
            .is_none());
    }
}
