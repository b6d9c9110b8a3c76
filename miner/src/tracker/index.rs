use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use shared::db::{self, Store};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::web;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum IndexType {
    #[default]
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "ethereum")]
    Ethereum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum ParserType {
    #[default]
    #[serde(rename = "jsonPath")]
    JsonPath,
    Uniswap,
    Balancer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "type", default)]
    pub index_type: IndexType,
    #[serde(default)]
    pub parser: ParserType,
    #[serde(default)]
    pub param: String,
}

/// One symbol's entry in the index file.
#[derive(Debug, Clone, Deserialize)]
pub struct Apis {
    /// Seconds between fetches; stay at or above the source's rate limit.
    pub interval: u64,
    pub endpoints: Vec<Endpoint>,
}

pub fn load_index_file(path: &Path) -> anyhow::Result<HashMap<String, Apis>> {
    let raw = std::fs::read(path)
        .with_context(|| format!("read index file {}", path.display()))?;
    parse_index(&raw)
}

pub fn parse_index(raw: &[u8]) -> anyhow::Result<HashMap<String, Apis>> {
    let mut indexes: HashMap<String, Apis> =
        serde_json::from_slice(raw).context("parse index file")?;
    for apis in indexes.values_mut() {
        for endpoint in &mut apis.endpoints {
            endpoint.url = expand_env(&endpoint.url);
        }
    }
    Ok(indexes)
}

/// `${VAR}` expansion so API keys stay out of the index file.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// A sampler for one named symbol. `get` returns the current value and the
/// source's own timestamp in unix milliseconds.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn source(&self) -> &str;
    async fn get(&self, cancel: &CancellationToken) -> anyhow::Result<(f64, i64)>;
}

/// Builds sources that live on-chain (Uniswap and friends). Implemented by
/// the rpc module; absent in data-only deployments.
pub trait ChainSourceFactory: Send + Sync {
    fn make(&self, symbol: &str, endpoint: &Endpoint) -> anyhow::Result<Arc<dyn PriceSource>>;
}

/// HTTP endpoint parsed with a JSON path.
pub struct JsonApi {
    url: String,
    http: reqwest::Client,
    path: JsonPath,
}

impl JsonApi {
    pub fn new(url: String, param: &str) -> anyhow::Result<Self> {
        Ok(JsonApi { url, http: reqwest::Client::new(), path: JsonPath::parse(param)? })
    }
}

#[async_trait]
impl PriceSource for JsonApi {
    fn source(&self) -> &str {
        &self.url
    }

    async fn get(&self, cancel: &CancellationToken) -> anyhow::Result<(f64, i64)> {
        let payload = web::fetch(&self.http, &self.url, cancel)
            .await
            .with_context(|| format!("fetching data from API url:{}", self.url))?;
        let value: serde_json::Value = serde_json::from_slice(&payload)
            .with_context(|| format!("parsing data from API url:{}", self.url))?;
        self.path.read(&value)
    }
}

/// Volume endpoints report 0 when the source timestamp has not advanced, so
/// overlapping polls do not double count a period. Skipping the sample
/// instead would skew the confidence calculation, which counts data points.
pub struct VolumeSource<S> {
    inner: S,
    last_ts: Mutex<i64>,
}

impl<S> VolumeSource<S> {
    pub fn new(inner: S) -> Self {
        VolumeSource { inner, last_ts: Mutex::new(0) }
    }
}

#[async_trait]
impl<S: PriceSource> PriceSource for VolumeSource<S> {
    fn source(&self) -> &str {
        self.inner.source()
    }

    async fn get(&self, cancel: &CancellationToken) -> anyhow::Result<(f64, i64)> {
        let (mut value, ts) = self.inner.get(cancel).await?;
        let mut last = self.last_ts.lock().unwrap();
        if *last == ts {
            value = 0.0;
        }
        *last = ts;
        Ok((value, ts))
    }
}

/// The dotted/indexed subset of JSON path the index file uses, for example
/// `$.data[0].price`. The addressed node may be a scalar or a
/// `[value, timestamp]` pair.
#[derive(Debug, Clone)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Field(String),
    Index(usize),
}

impl JsonPath {
    pub fn parse(param: &str) -> anyhow::Result<Self> {
        let mut rest = param.trim().strip_prefix('$').unwrap_or(param.trim());
        let mut segments = Vec::new();
        while !rest.is_empty() {
            if let Some(tail) = rest.strip_prefix('.') {
                rest = tail;
                continue;
            }
            if let Some(tail) = rest.strip_prefix('[') {
                let end = tail.find(']').ok_or_else(|| anyhow!("unclosed index in {param:?}"))?;
                let idx: usize = tail[..end]
                    .parse()
                    .map_err(|_| anyhow!("bad index in {param:?}"))?;
                segments.push(Segment::Index(idx));
                rest = &tail[end + 1..];
                continue;
            }
            let end = rest.find(['.', '[']).unwrap_or(rest.len());
            segments.push(Segment::Field(rest[..end].to_string()));
            rest = &rest[end..];
        }
        Ok(JsonPath { segments })
    }

    pub fn read(&self, root: &serde_json::Value) -> anyhow::Result<(f64, i64)> {
        let mut node = root;
        for segment in &self.segments {
            node = match segment {
                Segment::Field(name) => node
                    .get(name)
                    .ok_or_else(|| anyhow!("missing field {name:?}"))?,
                Segment::Index(idx) => node
                    .get(idx)
                    .ok_or_else(|| anyhow!("missing index {idx}"))?,
            };
        }

        let mut now_ms = Utc::now().timestamp_millis();
        match node {
            serde_json::Value::Array(items) => {
                let value = parse_number(items.first().ok_or_else(|| anyhow!("empty result"))?)?;
                if let Some(ts) = items.get(1) {
                    let raw = parse_number(ts)?;
                    // Above this the source is already reporting milliseconds.
                    now_ms = if raw > 9_999_999_999.0 {
                        raw as i64
                    } else {
                        (raw * 1000.0) as i64
                    };
                }
                Ok((value, now_ms))
            }
            other => Ok((parse_number(other)?, now_ms)),
        }
    }
}

fn parse_number(value: &serde_json::Value) -> anyhow::Result<f64> {
    match value {
        serde_json::Value::Number(n) => {
            n.as_f64().ok_or_else(|| anyhow!("non-finite number {n}"))
        }
        serde_json::Value::String(s) => {
            // Normalize american locale thousands separators.
            let clean = s.replace(',', "");
            clean
                .parse()
                .map_err(|_| anyhow!("value needs to be a valid float: {s:?}"))
        }
        other => bail!("value needs to be a number: {other}"),
    }
}

struct Sampler {
    symbol: String,
    source: Arc<dyn PriceSource>,
    interval: Duration,
}

/// Spawns one staggered sampler per (symbol, endpoint) and appends priced
/// samples to the store.
pub struct IndexTracker {
    store: Store,
    samplers: Vec<Sampler>,
    get_errors: Arc<AtomicU64>,
}

impl IndexTracker {
    pub fn build(
        store: Store,
        indexes: HashMap<String, Apis>,
        default_interval: Duration,
        chain: Option<&dyn ChainSourceFactory>,
    ) -> anyhow::Result<Self> {
        let mut samplers = Vec::new();
        for (symbol, apis) in indexes {
            let interval = if apis.interval > 0 {
                Duration::from_secs(apis.interval)
            } else {
                default_interval
            };
            for endpoint in &apis.endpoints {
                let source: Arc<dyn PriceSource> = match endpoint.index_type {
                    IndexType::Http => {
                        let api = JsonApi::new(endpoint.url.clone(), &endpoint.param)
                            .with_context(|| format!("endpoint for {symbol}"))?;
                        if symbol.to_lowercase().contains("volume") {
                            Arc::new(VolumeSource::new(api))
                        } else {
                            Arc::new(api)
                        }
                    }
                    IndexType::Ethereum => match chain {
                        Some(factory) => factory.make(&symbol, endpoint)?,
                        None => bail!(
                            "symbol {symbol} uses an on-chain source but no client is available"
                        ),
                    },
                };
                samplers.push(Sampler { symbol: symbol.clone(), source, interval });
            }
        }
        Ok(IndexTracker { store, samplers, get_errors: Arc::new(AtomicU64::new(0)) })
    }

    pub fn source_count(&self) -> usize {
        self.samplers.len()
    }

    pub fn error_count(&self) -> u64 {
        self.get_errors.load(Ordering::Relaxed)
    }

    /// One task per sampler, staggered a second apart so every endpoint is
    /// not hit in the same instant after startup.
    pub fn start(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let IndexTracker { store, samplers, get_errors } = self;
        samplers
            .into_iter()
            .enumerate()
            .map(|(i, sampler)| {
                let store = store.clone();
                let cancel = cancel.clone();
                let errors = get_errors.clone();
                let delay = Duration::from_secs(1 + i as u64);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    record_loop(store, sampler, errors, cancel).await;
                })
            })
            .collect()
    }
}

async fn record_loop(
    store: Store,
    sampler: Sampler,
    errors: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let values = match store.series(&db::index_series(&sampler.symbol, sampler.source.source())) {
        Ok(series) => series,
        Err(err) => {
            error!("{}: opening series: {err}", sampler.symbol);
            return;
        }
    };
    let intervals =
        match store.series(&db::interval_series(&sampler.symbol, sampler.source.source())) {
            Ok(series) => series,
            Err(err) => {
                error!("{}: opening interval series: {err}", sampler.symbol);
                return;
            }
        };

    loop {
        let now = Utc::now().timestamp_millis();

        // The interval feeds the confidence calculation:
        // confidence = avg(actual / expected samples) over a window.
        if let Err(err) = intervals.append(now, sampler.interval.as_secs_f64()) {
            error!("{}: recording interval: {err}", sampler.symbol);
        }

        match sampler.source.get(&cancel).await {
            Ok((value, _source_ts)) => {
                debug!(
                    "{} {} from {}",
                    sampler.symbol,
                    value,
                    sampler.source.source()
                );
                if let Err(err) = values.append(now, value) {
                    error!("{}: appending value: {err}", sampler.symbol);
                }
            }
            Err(err) => {
                errors.fetch_add(1, Ordering::Relaxed);
                warn!("{}: getting value: {err:#}", sampler.symbol);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{} record loop exited", sampler.symbol);
                return;
            }
            _ = tokio::time::sleep(sampler.interval) => {}
        }
    }
}
