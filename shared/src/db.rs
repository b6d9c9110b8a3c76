use std::collections::HashMap;
use std::path::Path;

use alloy_primitives::U256;
use sled::Db;

use crate::errors::StoreError;
use crate::types::Sample;

pub const CHALLENGE_KEY: &str = "challenge_hash";
pub const DIFFICULTY_KEY: &str = "current_challenge_difficulty";
pub const REQUEST_ID_PREFIX: &str = "current_challenge_reqID_";
pub const TIP_KEY: &str = "current_challenge_tip";
pub const GAS_KEY: &str = "gas_price";
pub const DISPUTE_STATUS_KEY: &str = "dispute_status";
pub const TIME_OUT_KEY: &str = "time_out";
pub const TRB_BALANCE_KEY: &str = "trb_balance";
pub const ETH_BALANCE_KEY: &str = "eth_balance";
pub const QUERIED_VALUE_PREFIX: &str = "queried_value_";

/// Series name for raw samples of a symbol from one source.
pub fn index_series(symbol: &str, source: &str) -> String {
    format!("idx_{}_{}", sanitize(symbol), sanitize(source))
}

/// Prefix shared by every source series of a symbol.
pub fn index_series_prefix(symbol: &str) -> String {
    format!("idx_{}_", sanitize(symbol))
}

/// Series name for the sampling interval recorded next to the values.
/// The confidence calculation needs it to know the expected sample count.
pub fn interval_series(symbol: &str, source: &str) -> String {
    format!("interval_{}_{}", sanitize(symbol), sanitize(source))
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Durable byte-string to byte-string mapping shared by the trackers and the
/// mining pipeline. Tolerates concurrent readers and writers; single writer
/// per key is a convention, not enforced here.
#[derive(Clone)]
pub struct Store {
    db: Db,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Ok(Store { db: sled::open(path)? })
    }

    /// In-memory store for tests.
    pub fn temporary() -> Result<Self, StoreError> {
        Ok(Store { db: sled::Config::new().temporary(true).open()? })
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    pub fn batch_get(&self, keys: &[&str]) -> Result<HashMap<String, Option<Vec<u8>>>, StoreError> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            out.insert((*key).to_string(), self.get(key)?);
        }
        Ok(out)
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    /// Opens the time-series append overlay for `name`.
    pub fn series(&self, name: &str) -> Result<Series, StoreError> {
        Ok(Series { tree: self.db.open_tree(format!("series_{name}"))? })
    }

    /// All series names with the given prefix. Used to discover which sources
    /// have recorded samples for a symbol.
    pub fn series_names(&self, prefix: &str) -> Vec<String> {
        let full = format!("series_{prefix}");
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|n| String::from_utf8(n.to_vec()).ok())
            .filter(|n| n.starts_with(&full))
            .map(|n| n["series_".len()..].to_string())
            .collect()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Append-only time series with ordered range scans. Keys are big-endian
/// millisecond timestamps so sled's lexicographic order is time order.
pub struct Series {
    tree: sled::Tree,
}

impl Series {
    pub fn append(&self, ts: i64, value: f64) -> Result<(), StoreError> {
        self.tree.insert(ts.to_be_bytes(), value.to_be_bytes().as_slice())?;
        Ok(())
    }

    /// Samples with `from <= ts <= to`, in time order.
    pub fn range(&self, from: i64, to: i64) -> Result<Vec<Sample>, StoreError> {
        let mut out = Vec::new();
        for kv in self.tree.range(from.to_be_bytes()..=to.to_be_bytes()) {
            let (k, v) = kv?;
            out.push(decode_sample(&k, &v)?);
        }
        Ok(out)
    }

    pub fn last(&self) -> Result<Option<Sample>, StoreError> {
        match self.tree.last()? {
            Some((k, v)) => Ok(Some(decode_sample(&k, &v)?)),
            None => Ok(None),
        }
    }
}

fn decode_sample(k: &[u8], v: &[u8]) -> Result<Sample, StoreError> {
    let ts = i64::from_be_bytes(k.try_into().map_err(|_| StoreError::Corrupt {
        key: String::from_utf8_lossy(k).into_owned(),
        reason: "series key is not an i64".into(),
    })?);
    let value = f64::from_be_bytes(v.try_into().map_err(|_| StoreError::Corrupt {
        key: ts.to_string(),
        reason: "series value is not an f64".into(),
    })?);
    Ok(Sample { ts, value })
}

/// Store values are hex-encoded big integers unless noted otherwise.
pub fn encode_big(value: &U256) -> Vec<u8> {
    format!("{value:#x}").into_bytes()
}

pub fn decode_big(raw: &[u8]) -> Result<U256, StoreError> {
    let s = std::str::from_utf8(raw).map_err(|_| StoreError::Corrupt {
        key: String::new(),
        reason: "hex value is not utf-8".into(),
    })?;
    let trimmed = s.trim_start_matches("0x");
    U256::from_str_radix(trimmed, 16).map_err(|e| StoreError::Corrupt {
        key: String::new(),
        reason: format!("bad hex integer {s:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = Store::temporary().unwrap();
        store.put("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(b"v".as_slice()));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn batch_get_reports_absent_keys() {
        let store = Store::temporary().unwrap();
        store.put("a", b"1").unwrap();
        let m = store.batch_get(&["a", "b"]).unwrap();
        assert_eq!(m["a"].as_deref(), Some(b"1".as_slice()));
        assert_eq!(m["b"], None);
    }

    #[test]
    fn series_range_is_time_ordered() {
        let store = Store::temporary().unwrap();
        let series = store.series("idx_eth_usd_test").unwrap();
        series.append(3000, 3.0).unwrap();
        series.append(1000, 1.0).unwrap();
        series.append(2000, 2.0).unwrap();

        let samples = series.range(1000, 2500).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], Sample { ts: 1000, value: 1.0 });
        assert_eq!(samples[1], Sample { ts: 2000, value: 2.0 });
        assert_eq!(series.last().unwrap(), Some(Sample { ts: 3000, value: 3.0 }));
    }

    #[test]
    fn series_discovery_by_prefix() {
        let store = Store::temporary().unwrap();
        store.series(&index_series("ETH/USD", "api.one")).unwrap();
        store.series(&index_series("ETH/USD", "api.two")).unwrap();
        store.series(&index_series("BTC/USD", "api.one")).unwrap();

        let mut names = store.series_names("idx_eth_usd_");
        names.sort();
        assert_eq!(names, vec!["idx_eth_usd_api_one", "idx_eth_usd_api_two"]);
    }

    #[test]
    fn big_int_round_trip() {
        let v = U256::from(700_000_000u64);
        let enc = encode_big(&v);
        assert_eq!(enc, b"0x29b92700".to_vec());
        assert_eq!(decode_big(&enc).unwrap(), v);
        assert!(decode_big(b"not hex").is_err());
    }
}
