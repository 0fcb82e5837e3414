use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::schema::query::is_identifier;
use crate::store::partition::Level;

/// Top-level configuration for the epochroll exporter.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Beacon node connection configuration.
    #[serde(default)]
    pub beacon: BeaconConfig,

    /// Per-epoch metrics source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Hot store (SQLite) configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Raw epoch ingestion.
    #[serde(default)]
    pub insert: InsertConfig,

    /// Hot to archive transfer.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Retention and partitioning per aggregation level.
    #[serde(default)]
    pub levels: LevelsConfig,

    /// Hourly and daily bucket rollups.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Sliding window rollups.
    #[serde(default)]
    pub rolling: RollingConfig,

    /// Sleep after a failed cycle before retrying. Default: 10s.
    #[serde(default = "default_error_backoff", with = "humantime_serde")]
    pub error_backoff: Duration,

    /// Maximum time to wait for in-flight cycles on shutdown. Default: 30s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Beacon node connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BeaconConfig {
    /// Beacon node HTTP endpoint (e.g., "http://localhost:5052").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Per-epoch metrics source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Metrics service HTTP endpoint (e.g., "http://localhost:8080").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 60s.
    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Hot store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file. Default: "epochroll.db".
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Pool size. Default: 1.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Maximum wait for a pooled connection. Default: 5m.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// SQLite busy timeout. Default: 30s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,
}

/// Raw epoch ingestion configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InsertConfig {
    /// Run the insert loop. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay between cycles. Default: 12s.
    #[serde(default = "default_insert_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// First epoch ever scheduled. Default: 0.
    #[serde(default)]
    pub start_epoch: u64,

    /// Epochs selected per cycle. Default: 64.
    #[serde(default = "default_fetch_at_once_limit")]
    pub fetch_at_once_limit: usize,

    /// Epochs per batch. Default: 8.
    #[serde(default = "default_insert_at_once_limit")]
    pub insert_at_once_limit: usize,

    /// Batches written concurrently. Default: 2.
    #[serde(default = "default_parallelism")]
    pub insert_in_parallel: usize,
}

/// Hot to archive transfer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Run the transfer loop. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Delay between cycles. Default: 1m.
    #[serde(default = "default_transfer_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Epochs per batch. Default: 32.
    #[serde(default = "default_transfer_batch_size")]
    pub batch_size: usize,

    /// Epochs scheduled per cycle. Default: 256.
    #[serde(default = "default_transfer_bundle_size")]
    pub bundle_size: usize,

    /// Batches transferred concurrently. Default: 2.
    #[serde(default = "default_parallelism")]
    pub transfer_in_parallel: usize,

    /// Archive connection.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Retention and partitioning of one level.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelConfig {
    /// How far behind the frontier data is kept. Unset keeps everything.
    #[serde(default, with = "humantime_serde")]
    pub retention: Option<Duration>,

    /// Time span covered by one partition table.
    #[serde(with = "humantime_serde")]
    pub partition_width: Duration,
}

/// Per-level retention and partitioning.
#[derive(Debug, Clone, Deserialize)]
pub struct LevelsConfig {
    #[serde(default = "default_epoch_level")]
    pub epoch: LevelConfig,

    #[serde(default = "default_hourly_level")]
    pub hourly: LevelConfig,

    #[serde(default = "default_daily_level")]
    pub daily: LevelConfig,
}

/// Fixed-grain rollup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Run the hourly/daily loop. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay between cycles. Default: 30s.
    #[serde(default = "default_aggregation_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Buckets aggregated per level and cycle. Default: 48.
    #[serde(default = "default_max_buckets_per_cycle")]
    pub max_buckets_per_cycle: usize,

    /// Source data kept past the last completed bucket. Default: 1h.
    #[serde(default = "default_prune_buffer", with = "humantime_serde")]
    pub prune_buffer: Duration,
}

/// Sliding window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RollingConfig {
    /// Run the rolling loop. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay between cycles. Default: 30s.
    #[serde(default = "default_aggregation_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Windows maintained concurrently. Default: 2.
    #[serde(default = "default_parallelism")]
    pub rollings_in_parallel: usize,

    /// Source partitions one bootstrap reads concurrently. Default: 4.
    #[serde(default = "default_rolling_parts_in_parallel")]
    pub rolling_parts_in_parallel: usize,

    /// Bounded windows. Default: 24h from hourly; 7d, 30d, 90d from daily.
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowConfig>,

    /// Maintain the all-time window. Default: true.
    #[serde(default = "default_true")]
    pub total: bool,

    /// Lag that forces the all-time window to rebuild. Default: 2d.
    #[serde(default = "default_total_threshold", with = "humantime_serde")]
    pub total_threshold: Duration,
}

/// One bounded sliding window.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Table suffix (`rolling_{name}`).
    pub name: String,

    /// Window length.
    #[serde(with = "humantime_serde")]
    pub width: Duration,

    /// Level the window is rebuilt from.
    pub source: Level,

    /// Lag that forces a rebuild. Default: two source buckets.
    #[serde(default, with = "humantime_serde")]
    pub bootstrap_threshold: Option<Duration>,
}

impl WindowConfig {
    pub fn new(name: &str, width: Duration, source: Level) -> Self {
        Self {
            name: name.to_string(),
            width,
            source,
            bootstrap_threshold: None,
        }
    }

    /// Effective rebuild threshold.
    pub fn threshold(&self) -> Duration {
        self.bootstrap_threshold
            .unwrap_or_else(|| self.source.bucket_duration() * 2)
    }

    /// How far behind the window tail raw data must still exist.
    fn reach(&self) -> Duration {
        self.width + self.threshold() + self.source.bucket_duration()
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_store_path() -> PathBuf {
    PathBuf::from("epochroll.db")
}

fn default_max_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_insert_interval() -> Duration {
    Duration::from_secs(12)
}

fn default_fetch_at_once_limit() -> usize {
    64
}

fn default_insert_at_once_limit() -> usize {
    8
}

fn default_parallelism() -> usize {
    2
}

fn default_transfer_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_transfer_batch_size() -> usize {
    32
}

fn default_transfer_bundle_size() -> usize {
    256
}

fn default_database() -> String {
    "default".to_string()
}

const DAY: Duration = Duration::from_secs(86_400);

fn default_epoch_level() -> LevelConfig {
    LevelConfig {
        retention: Some(DAY * 100),
        partition_width: DAY,
    }
}

fn default_hourly_level() -> LevelConfig {
    LevelConfig {
        retention: Some(DAY * 7),
        partition_width: DAY,
    }
}

fn default_daily_level() -> LevelConfig {
    LevelConfig {
        retention: None,
        partition_width: DAY * 30,
    }
}

fn default_aggregation_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_buckets_per_cycle() -> usize {
    48
}

fn default_prune_buffer() -> Duration {
    Duration::from_secs(3_600)
}

fn default_rolling_parts_in_parallel() -> usize {
    4
}

fn default_windows() -> Vec<WindowConfig> {
    vec![
        WindowConfig::new("24h", DAY, Level::Hourly),
        WindowConfig::new("7d", DAY * 7, Level::Daily),
        WindowConfig::new("30d", DAY * 30, Level::Daily),
        WindowConfig::new("90d", DAY * 90, Level::Daily),
    ]
}

fn default_total_threshold() -> Duration {
    DAY * 2
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            beacon: BeaconConfig::default(),
            source: SourceConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
            insert: InsertConfig::default(),
            transfer: TransferConfig::default(),
            levels: LevelsConfig::default(),
            aggregation: AggregationConfig::default(),
            rolling: RollingConfig::default(),
            error_backoff: default_error_backoff(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_http_timeout(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_source_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl Default for InsertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: default_insert_interval(),
            start_epoch: 0,
            fetch_at_once_limit: default_fetch_at_once_limit(),
            insert_at_once_limit: default_insert_at_once_limit(),
            insert_in_parallel: default_parallelism(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: default_transfer_interval(),
            batch_size: default_transfer_batch_size(),
            bundle_size: default_transfer_bundle_size(),
            transfer_in_parallel: default_parallelism(),
            clickhouse: ClickHouseConfig::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for LevelsConfig {
    fn default() -> Self {
        Self {
            epoch: default_epoch_level(),
            hourly: default_hourly_level(),
            daily: default_daily_level(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: default_aggregation_interval(),
            max_buckets_per_cycle: default_max_buckets_per_cycle(),
            prune_buffer: default_prune_buffer(),
        }
    }
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: default_aggregation_interval(),
            rollings_in_parallel: default_parallelism(),
            rolling_parts_in_parallel: default_rolling_parts_in_parallel(),
            windows: default_windows(),
            total: true,
            total_threshold: default_total_threshold(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl LevelsConfig {
    pub fn get(&self, level: Level) -> &LevelConfig {
        match level {
            Level::Epoch => &self.epoch,
            Level::Hourly => &self.hourly,
            Level::Daily => &self.daily,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.beacon.endpoint.is_empty() {
            bail!("beacon.endpoint is required");
        }

        if self.insert.enabled && self.source.endpoint.is_empty() {
            bail!("source.endpoint is required when insert is enabled");
        }

        if self.store.max_connections == 0 {
            bail!("store.max_connections must be positive");
        }

        if self.error_backoff.is_zero() {
            bail!("error_backoff must be positive");
        }

        self.validate_insert()?;
        self.validate_transfer()?;
        self.validate_levels()?;
        self.validate_rolling()?;

        Ok(())
    }

    fn validate_insert(&self) -> Result<()> {
        let insert = &self.insert;

        if insert.fetch_at_once_limit == 0 {
            bail!("insert.fetch_at_once_limit must be positive");
        }

        if insert.insert_at_once_limit == 0 {
            bail!("insert.insert_at_once_limit must be positive");
        }

        if insert.insert_in_parallel == 0 {
            bail!("insert.insert_in_parallel must be positive");
        }

        if insert.poll_interval.is_zero() {
            bail!("insert.poll_interval must be positive");
        }

        Ok(())
    }

    fn validate_transfer(&self) -> Result<()> {
        let transfer = &self.transfer;
        if !transfer.enabled {
            return Ok(());
        }

        if transfer.clickhouse.endpoint.is_empty() {
            bail!("transfer.clickhouse.endpoint is required when transfer is enabled");
        }

        if transfer.batch_size == 0 || transfer.bundle_size == 0 {
            bail!("transfer.batch_size and transfer.bundle_size must be positive");
        }

        if transfer.batch_size > transfer.bundle_size {
            bail!(
                "transfer.batch_size ({}) must not exceed transfer.bundle_size ({})",
                transfer.batch_size,
                transfer.bundle_size
            );
        }

        if transfer.transfer_in_parallel == 0 {
            bail!("transfer.transfer_in_parallel must be positive");
        }

        Ok(())
    }

    fn validate_levels(&self) -> Result<()> {
        for level in Level::ALL {
            let cfg = self.levels.get(level);

            if cfg.partition_width < level.bucket_duration() {
                bail!(
                    "levels.{level}.partition_width {:?} must cover at least one {level} bucket",
                    cfg.partition_width
                );
            }

            if let Some(retention) = cfg.retention {
                if retention < cfg.partition_width {
                    bail!(
                        "levels.{level}.retention {retention:?} must be at least one partition ({:?})",
                        cfg.partition_width
                    );
                }
            }
        }

        if self.aggregation.max_buckets_per_cycle == 0 {
            bail!("aggregation.max_buckets_per_cycle must be positive");
        }

        Ok(())
    }

    fn validate_rolling(&self) -> Result<()> {
        let rolling = &self.rolling;
        if !rolling.enabled {
            return Ok(());
        }

        if rolling.rollings_in_parallel == 0 || rolling.rolling_parts_in_parallel == 0 {
            bail!("rolling.rollings_in_parallel and rolling.rolling_parts_in_parallel must be positive");
        }

        let mut names = HashSet::new();
        if rolling.total {
            names.insert("total");
            if let Some(retention) = self.levels.daily.retention {
                bail!("rolling.total needs unbounded daily retention, got {retention:?}");
            }
        }

        for window in &rolling.windows {
            if !is_identifier(&format!("rolling_{}", window.name)) {
                bail!(
                    "rolling window name {:?} may only contain lowercase letters, digits and underscores",
                    window.name
                );
            }

            if !names.insert(window.name.as_str()) {
                bail!("duplicate rolling window name {:?}", window.name);
            }

            if window.source == Level::Epoch {
                bail!(
                    "rolling window {:?} must rebuild from hourly or daily, not epoch",
                    window.name
                );
            }

            if window.width < window.source.bucket_duration() {
                bail!(
                    "rolling window {:?} width {:?} is shorter than one {} bucket",
                    window.name,
                    window.width,
                    window.source
                );
            }

            // Tail removal reads raw epochs; bootstraps read the source level.
            for level in [Level::Epoch, window.source] {
                if let Some(retention) = self.levels.get(level).retention {
                    if retention < window.reach() {
                        bail!(
                            "levels.{level}.retention {retention:?} must cover rolling window {:?} ({:?} including rebuild margin)",
                            window.name,
                            window.reach()
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            beacon: BeaconConfig {
                endpoint: "http://localhost:5052".to_string(),
                ..Default::default()
            },
            source: SourceConfig {
                endpoint: "http://localhost:8080".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.store.max_connections, 1);
        assert_eq!(cfg.rolling.windows.len(), 4);
        assert!(cfg.rolling.total);
        assert!(!cfg.transfer.enabled);
        assert_eq!(cfg.levels.daily.retention, None);
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate().expect("defaults should validate");
    }

    #[test]
    fn test_validate_missing_beacon_endpoint() {
        let mut cfg = valid_config();
        cfg.beacon.endpoint.clear();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("beacon.endpoint"));
    }

    #[test]
    fn test_validate_missing_source_endpoint() {
        let mut cfg = valid_config();
        cfg.source.endpoint.clear();
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("source.endpoint"));

        cfg.insert.enabled = false;
        cfg.validate().expect("source not needed without insert");
    }

    #[test]
    fn test_validate_zero_insert_limits() {
        let mut cfg = valid_config();
        cfg.insert.insert_at_once_limit = 0;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("insert_at_once_limit"));
    }

    #[test]
    fn test_validate_transfer_requires_clickhouse() {
        let mut cfg = valid_config();
        cfg.transfer.enabled = true;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("transfer.clickhouse.endpoint"));

        cfg.transfer.clickhouse.endpoint = "localhost:9000".to_string();
        cfg.validate().expect("should pass");
    }

    #[test]
    fn test_validate_transfer_batch_exceeds_bundle() {
        let mut cfg = valid_config();
        cfg.transfer.enabled = true;
        cfg.transfer.clickhouse.endpoint = "localhost:9000".to_string();
        cfg.transfer.batch_size = 512;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn test_validate_epoch_retention_covers_windows() {
        let mut cfg = valid_config();
        cfg.levels.epoch.retention = Some(DAY * 30);
        let err = cfg.validate().expect_err("30d window needs more raw data");
        assert!(err.to_string().contains("levels.epoch.retention"));
        assert!(err.to_string().contains("\"30d\""));
    }

    #[test]
    fn test_validate_hourly_retention_covers_24h_window() {
        let mut cfg = valid_config();
        cfg.levels.hourly.retention = Some(DAY);
        let err = cfg.validate().expect_err("no room for rebuild margin");
        assert!(err.to_string().contains("levels.hourly.retention"));
    }

    #[test]
    fn test_validate_total_needs_unbounded_daily() {
        let mut cfg = valid_config();
        cfg.levels.daily.retention = Some(DAY * 365);
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("rolling.total"));

        cfg.rolling.total = false;
        cfg.validate().expect("bounded daily is fine without total");
    }

    #[test]
    fn test_validate_window_names() {
        let mut cfg = valid_config();
        cfg.rolling.windows.push(WindowConfig::new("7d", DAY * 7, Level::Daily));
        let err = cfg.validate().expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"));

        let mut cfg = valid_config();
        cfg.rolling.windows = vec![WindowConfig::new("24-h", DAY, Level::Hourly)];
        let err = cfg.validate().expect_err("bad name");
        assert!(err.to_string().contains("lowercase"));

        let mut cfg = valid_config();
        cfg.rolling.windows = vec![WindowConfig::new("total", DAY, Level::Hourly)];
        assert!(cfg.validate().is_err(), "total is reserved");
    }

    #[test]
    fn test_validate_window_source_level() {
        let mut cfg = valid_config();
        cfg.rolling.windows = vec![WindowConfig::new("1h", Duration::from_secs(3_600), Level::Epoch)];
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("hourly or daily"));
    }

    #[test]
    fn test_window_threshold_default() {
        let w = WindowConfig::new("24h", DAY, Level::Hourly);
        assert_eq!(w.threshold(), Duration::from_secs(7_200));
        let w = WindowConfig::new("7d", DAY * 7, Level::Daily);
        assert_eq!(w.threshold(), DAY * 2);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
beacon:
  endpoint: "http://beacon:5052"
source:
  endpoint: "http://metrics:8080"
  timeout: 2m
store:
  path: /var/lib/epochroll/hot.db
insert:
  fetch_at_once_limit: 128
  insert_at_once_limit: 16
levels:
  epoch:
    retention: 120d
    partition_width: 1d
rolling:
  total: false
  windows:
    - name: 24h
      width: 24h
      source: hourly
    - name: 7d
      width: 7d
      source: daily
      bootstrap_threshold: 12h
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("should parse");
        cfg.validate().expect("should validate");

        assert_eq!(cfg.source.timeout, Duration::from_secs(120));
        assert_eq!(cfg.store.path, PathBuf::from("/var/lib/epochroll/hot.db"));
        assert_eq!(cfg.insert.fetch_at_once_limit, 128);
        assert_eq!(cfg.levels.epoch.retention, Some(DAY * 120));
        assert_eq!(cfg.levels.hourly.retention, Some(DAY * 7));
        assert_eq!(cfg.rolling.windows[1].source, Level::Daily);
        assert_eq!(cfg.rolling.windows[1].threshold(), Duration::from_secs(43_200));
        assert!(!cfg.rolling.total);
    }
}
