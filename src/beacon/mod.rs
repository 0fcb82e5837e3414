use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::config::BeaconConfig;

/// Beacon genesis information.
#[derive(Debug, Clone)]
pub struct GenesisResponse {
    pub genesis_time: SystemTime,
}

/// Beacon chain spec.
#[derive(Debug, Clone, Copy)]
pub struct SpecResponse {
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
}

/// Checkpoints of the head state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalityCheckpoints {
    pub previous_justified: u64,
    pub current_justified: u64,
    pub finalized: u64,
}

/// Callback type for recording beacon request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Beacon node API client trait.
pub trait BeaconClient: Send + Sync {
    /// Fetch genesis information from the beacon node.
    fn fetch_genesis(&self) -> impl Future<Output = Result<GenesisResponse>> + Send;

    /// Fetch chain spec parameters from the beacon node.
    fn fetch_spec(&self) -> impl Future<Output = Result<SpecResponse>> + Send;

    /// Fetch the finality checkpoints of the head state.
    fn fetch_finality(&self) -> impl Future<Output = Result<FinalityCheckpoints>> + Send;
}

/// HTTP-based beacon node API client.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new beacon node client.
    pub fn new(cfg: &BeaconConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Perform a GET request and deserialize the JSON response.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let start = Instant::now();
        let endpoint = endpoint_from_path(path);
        let url = format!("{}{}", self.endpoint, path);

        let response = match self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.record_request(endpoint, "error", start.elapsed());
                return Err(e).with_context(|| format!("requesting {path}"));
            }
        };

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, path, body);
        }

        let result: T = response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))?;

        self.record_request(endpoint, "success", start.elapsed());

        Ok(result)
    }
}

/// Extract a short endpoint name from an API path.
fn endpoint_from_path(path: &str) -> &'static str {
    match path {
        "/eth/v1/beacon/genesis" => "genesis",
        "/eth/v1/config/spec" => "spec",
        "/eth/v1/beacon/states/head/finality_checkpoints" => "finality",
        _ => "other",
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct GenesisApiResponse {
    data: GenesisData,
}

#[derive(Deserialize)]
struct GenesisData {
    genesis_time: String,
}

#[derive(Deserialize)]
struct SpecApiResponse {
    data: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct FinalityApiResponse {
    data: FinalityData,
}

#[derive(Deserialize)]
struct FinalityData {
    previous_justified: Checkpoint,
    current_justified: Checkpoint,
    finalized: Checkpoint,
}

#[derive(Deserialize)]
struct Checkpoint {
    epoch: String,
}

impl Checkpoint {
    fn epoch(&self, name: &str) -> Result<u64> {
        self.epoch
            .parse()
            .with_context(|| format!("parsing {name} epoch {:?}", self.epoch))
    }
}

impl BeaconClient for Client {
    async fn fetch_genesis(&self) -> Result<GenesisResponse> {
        debug!("fetching beacon genesis");

        let resp: GenesisApiResponse = self
            .get_json("/eth/v1/beacon/genesis")
            .await
            .context("fetching genesis")?;

        let genesis_unix: u64 = resp
            .data
            .genesis_time
            .parse()
            .with_context(|| format!("parsing genesis time {:?}", resp.data.genesis_time))?;

        let genesis_time = UNIX_EPOCH + Duration::from_secs(genesis_unix);

        Ok(GenesisResponse { genesis_time })
    }

    async fn fetch_spec(&self) -> Result<SpecResponse> {
        debug!("fetching beacon spec");

        let resp: SpecApiResponse = self
            .get_json("/eth/v1/config/spec")
            .await
            .context("fetching spec")?;

        let seconds_per_slot = spec_uint64(&resp.data, "SECONDS_PER_SLOT")?;
        let slots_per_epoch = spec_uint64(&resp.data, "SLOTS_PER_EPOCH")?;

        Ok(SpecResponse {
            seconds_per_slot,
            slots_per_epoch,
        })
    }

    async fn fetch_finality(&self) -> Result<FinalityCheckpoints> {
        debug!("fetching finality checkpoints");

        let resp: FinalityApiResponse = self
            .get_json("/eth/v1/beacon/states/head/finality_checkpoints")
            .await
            .context("fetching finality checkpoints")?;

        parse_finality(&resp.data)
    }
}

fn parse_finality(data: &FinalityData) -> Result<FinalityCheckpoints> {
    Ok(FinalityCheckpoints {
        previous_justified: data.previous_justified.epoch("previous_justified")?,
        current_justified: data.current_justified.epoch("current_justified")?,
        finalized: data.finalized.epoch("finalized")?,
    })
}

/// Extract a string-encoded u64 from a spec data map.
fn spec_uint64(data: &HashMap<String, serde_json::Value>, key: &str) -> Result<u64> {
    let value = data
        .get(key)
        .with_context(|| format!("spec missing required key {key:?}"))?;

    let s = value
        .as_str()
        .with_context(|| format!("spec key {key:?} is not a string"))?;

    s.parse::<u64>()
        .with_context(|| format!("parsing {key} value {s:?}"))
}
