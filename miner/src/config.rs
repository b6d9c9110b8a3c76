use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use alloy_primitives::U256;
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// GPU kernel launch geometry, keyed by device name in the config.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct GpuConfig {
    pub group_size: u64,
    pub groups: u64,
    pub count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub public_address: String,
    pub contract_address: String,
    pub node_url: String,
    pub db_file: String,
    /// Gas price ceiling in gwei.
    pub gas_max: u64,
    pub gas_multiplier: f64,
    /// Fraction around the neighbor-sample band, e.g. 0.05.
    pub dispute_threshold: f64,
    /// Half-width of the sample window in seconds.
    pub dispute_time_delta: u64,
    pub min_confidence: f64,
    /// Seconds between tracker polls.
    pub tracker_cycle: u64,
    /// Seconds between registry value recomputations.
    pub psr_cycle: u64,
    pub request_tips: u64,
    pub index_file: String,
    pub manual_data_file: String,
    pub server_whitelist: Vec<String>,
    pub enable_pool_worker: bool,
    /// Keep the historical zero-for-legacy-ids submission workaround.
    pub submit_zero_legacy: bool,
    /// CPU hashers to run; 0 means every logical core.
    pub num_processors: usize,
    #[serde(rename = "GPUConfig")]
    pub gpu_config: HashMap<String, GpuConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            public_address: String::new(),
            contract_address: String::new(),
            node_url: "http://localhost:8545".to_string(),
            db_file: "tributeDB".to_string(),
            gas_max: 100,
            gas_multiplier: 1.0,
            dispute_threshold: 0.05,
            dispute_time_delta: 5 * 60,
            min_confidence: 0.8,
            tracker_cycle: 15,
            psr_cycle: 30,
            request_tips: 0,
            index_file: "configs/index.json".to_string(),
            manual_data_file: "configs/manualData.json".to_string(),
            server_whitelist: Vec::new(),
            enable_pool_worker: false,
            submit_zero_legacy: true,
            num_processors: 0,
            gpu_config: HashMap::new(),
        }
    }
}

pub fn load_config_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let file = File::open(&path)
        .with_context(|| format!("open config file {}", path.as_ref().display()))?;
    let config: Config = serde_json::from_reader(file).context("parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn parse_config_bytes(raw: &[u8]) -> anyhow::Result<Config> {
    let config: Config = serde_json::from_slice(raw).context("parse config")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> anyhow::Result<()> {
    if config.public_address.is_empty() {
        anyhow::bail!("publicAddress is required");
    }
    if config.contract_address.is_empty() {
        anyhow::bail!("contractAddress is required");
    }
    if !(0.0..1.0).contains(&config.min_confidence) {
        anyhow::bail!("minConfidence must be within [0, 1)");
    }
    if config.dispute_time_delta == 0 {
        anyhow::bail!("disputeTimeDelta must be positive");
    }
    Ok(())
}

/// The static request id -> value overlay used when a tracker has nothing.
/// File shape: `{"<id>": {"VALUE": 123}}`.
pub fn load_manual_data<P: AsRef<Path>>(path: P) -> anyhow::Result<HashMap<u64, U256>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read(path)
        .with_context(|| format!("read manual data file {}", path.display()))?;
    parse_manual_data(&raw)
}

pub fn parse_manual_data(raw: &[u8]) -> anyhow::Result<HashMap<u64, U256>> {
    let parsed: HashMap<String, HashMap<String, u64>> =
        serde_json::from_slice(raw).context("parse manual data file")?;

    let mut out = HashMap::new();
    for (id, entry) in parsed {
        let id: u64 = id
            .parse()
            .with_context(|| format!("manual data key {id:?} is not a request id"))?;
        if let Some(value) = entry.get("VALUE").filter(|v| **v > 0) {
            out.insert(id, U256::from(*value));
        }
    }
    Ok(out)
}
