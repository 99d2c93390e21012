//! Engine configuration.
//!
//! Loaded from a TOML file with environment-variable overrides for
//! deployment-sensitive values, validated before the engine starts.
//! Every section has defaults so a partial file works.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use arb_common::MarketPair;
use arb_market::FeedConfig;

use crate::detector::DetectorConfig;
use crate::edge::EdgeConfig;
use crate::exec::breaker::BreakerConfig;
use crate::exec::retry::RetryConfig;
use crate::risk::anomaly::AnomalyConfig;
use crate::risk::manager::RiskConfig;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dry-run (simulated execution) vs live submission.
    pub dry_run: bool,
    /// Logging level: trace|debug|info|warn|error.
    pub log_level: String,
    /// Directory for the date-sharded event log.
    pub event_log_dir: PathBuf,
    /// Optional crash-recovery snapshot path.
    pub snapshot_path: Option<PathBuf>,
    /// Wallet address (hex). Required for live mode.
    pub wallet_address: String,
    /// Market pairs to trade.
    pub markets: Vec<MarketEntry>,
    pub trading: TradingSection,
    pub risk: RiskSection,
    pub feed: FeedSection,
    pub circuit_breaker: BreakerSection,
    pub retry: RetrySection,
    pub anomaly: AnomalySection,
    pub execution: ExecutionSection,
    pub telemetry: TelemetrySection,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            log_level: "info".to_string(),
            event_log_dir: PathBuf::from("data/events"),
            snapshot_path: None,
            wallet_address: String::new(),
            markets: Vec::new(),
            trading: TradingSection::default(),
            risk: RiskSection::default(),
            feed: FeedSection::default(),
            circuit_breaker: BreakerSection::default(),
            retry: RetrySection::default(),
            anomaly: AnomalySection::default(),
            execution: ExecutionSection::default(),
            telemetry: TelemetrySection::default(),
        }
    }
}

/// One configured market pair.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketEntry {
    pub market_id: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub end_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl MarketEntry {
    pub fn to_pair(&self) -> Result<MarketPair> {
        MarketPair::new(
            self.market_id.clone(),
            self.yes_token_id.as_str(),
            self.no_token_id.as_str(),
            self.question.clone(),
            self.end_date,
        )
        .with_context(|| format!("invalid market entry {}", self.market_id))
    }
}

/// Sizing and edge parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingSection {
    /// USDC committed per opportunity across both legs.
    pub trade_size: Decimal,
    /// Minimum profit as a fraction of quantity.
    pub min_profit_threshold_pct: Decimal,
    /// Absolute profit floor in USDC.
    pub min_profit_threshold_abs: Decimal,
    /// Pre-filter floor on expected total profit at detection.
    pub prefilter_floor: Decimal,
    /// Taker fee rate.
    pub fee_rate: Decimal,
    /// Expected slippage budget in basis points.
    pub max_slippage_bps: u32,
    /// Latency risk buffer in basis points.
    pub latency_buffer_bps: u32,
    /// Cap on the latency buffer in USDC.
    pub latency_buffer_cap_usdc: Decimal,
}

impl Default for TradingSection {
    fn default() -> Self {
        Self {
            trade_size: Decimal::new(10, 0),
            min_profit_threshold_pct: Decimal::new(1, 2), // 1%
            min_profit_threshold_abs: Decimal::new(1, 2), // $0.01
            prefilter_floor: Decimal::new(1, 4),          // $0.0001
            fee_rate: Decimal::new(35, 4),                // 0.35%
            max_slippage_bps: 5,
            latency_buffer_bps: 2,
            latency_buffer_cap_usdc: Decimal::new(5, 2),
        }
    }
}

/// Risk limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskSection {
    pub max_position_size: Decimal,
    pub max_daily_loss: Decimal,
    pub max_gas_cost_usdc: Decimal,
    /// Gas price ceiling in gwei (submission refuses above this).
    pub max_gas_price_gwei: u64,
    pub idempotency_window_ms: u64,
}

impl Default for RiskSection {
    fn default() -> Self {
        Self {
            max_position_size: Decimal::new(1000, 0),
            max_daily_loss: Decimal::new(500, 0),
            max_gas_cost_usdc: Decimal::ONE,
            max_gas_price_gwei: 500,
            idempotency_window_ms: 10_000,
        }
    }
}

/// Market-data connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub url: String,
    pub ws_backoff_initial_ms: u64,
    pub ws_backoff_max_ms: u64,
    pub dedup_lru_size: usize,
    pub orderbook_depth_cap: usize,
    pub connect_timeout_ms: u64,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            url: "wss://ws-subscriptions-clob.example.com/ws/market".to_string(),
            ws_backoff_initial_ms: 1_000,
            ws_backoff_max_ms: 30_000,
            dedup_lru_size: 10_000,
            orderbook_depth_cap: 50,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Circuit-breaker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub consec_threshold: u32,
    pub rate_threshold: f64,
    pub window: usize,
    pub open_timeout_ms: u64,
    pub half_open_max: u32,
    pub gas_threshold_usdc: Decimal,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            consec_threshold: 3,
            rate_threshold: 0.5,
            window: 20,
            open_timeout_ms: 60_000,
            half_open_max: 3,
            gas_threshold_usdc: Decimal::TWO,
        }
    }
}

/// Retry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Anomaly-guard settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalySection {
    pub enabled: bool,
    pub pulse_threshold: Decimal,
    pub depth_threshold: Decimal,
    pub correlation_threshold: Decimal,
    pub window_ms: u64,
    pub flag_window_ms: u64,
}

impl Default for AnomalySection {
    fn default() -> Self {
        Self {
            enabled: true,
            pulse_threshold: Decimal::new(8, 2),
            depth_threshold: Decimal::new(6, 1),
            correlation_threshold: Decimal::new(15, 2),
            window_ms: 30_000,
            flag_window_ms: 60_000,
        }
    }
}

/// Execution-path settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    /// Receipt wait deadline per submission.
    pub receipt_timeout_ms: u64,
    /// Bounded execution pool size.
    pub max_concurrent_signals: usize,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            receipt_timeout_ms: 30_000,
            max_concurrent_signals: 4,
        }
    }
}

/// Telemetry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub channel_capacity: usize,
    pub recorder_buffer: usize,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            recorder_buffer: 64,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {path:?}"))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("failed to parse config {path:?}"))?;
        Ok(config)
    }

    /// Apply environment overrides for deployment-sensitive values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ARB_DRY_RUN") {
            if let Ok(flag) = v.parse::<bool>() {
                self.dry_run = flag;
            }
        }
        if let Ok(v) = std::env::var("ARB_WALLET_ADDRESS") {
            self.wallet_address = v;
        }
        if let Ok(v) = std::env::var("ARB_FEED_URL") {
            self.feed.url = v;
        }
        if let Ok(v) = std::env::var("ARB_EVENT_LOG_DIR") {
            self.event_log_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ARB_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    /// Validate invariants before starting.
    pub fn validate(&self) -> Result<()> {
        if self.trading.trade_size <= Decimal::ZERO {
            bail!("trading.trade_size must be positive");
        }
        if self.trading.fee_rate < Decimal::ZERO || self.trading.fee_rate >= Decimal::ONE {
            bail!("trading.fee_rate must be in [0, 1)");
        }
        if self.risk.max_daily_loss <= Decimal::ZERO {
            bail!("risk.max_daily_loss must be positive");
        }
        if !(0.0..=1.0).contains(&self.circuit_breaker.rate_threshold) {
            bail!("circuit_breaker.rate_threshold must be in [0, 1]");
        }
        if self.circuit_breaker.window == 0 {
            bail!("circuit_breaker.window must be non-zero");
        }
        if self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be >= 1");
        }
        if self.feed.dedup_lru_size < 1_000 {
            bail!("feed.dedup_lru_size too small to be useful (< 1000)");
        }
        if !self.dry_run && self.wallet_address.is_empty() {
            bail!("wallet_address required when dry_run = false");
        }
        for market in &self.markets {
            market.to_pair()?;
        }
        Ok(())
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            trade_size: self.trading.trade_size,
            prefilter_floor: self.trading.prefilter_floor,
        }
    }

    pub fn edge_config(&self) -> EdgeConfig {
        EdgeConfig {
            fee_rate: self.trading.fee_rate,
            slippage_bps: self.trading.max_slippage_bps,
            latency_buffer_bps: self.trading.latency_buffer_bps,
            latency_buffer_cap: self.trading.latency_buffer_cap_usdc,
            min_profit_abs: self.trading.min_profit_threshold_abs,
            min_profit_pct: self.trading.min_profit_threshold_pct,
            max_gas_cost_usdc: self.risk.max_gas_cost_usdc,
            default_gas_limit: 150_000,
        }
    }

    pub fn risk_config(&self) -> RiskConfig {
        RiskConfig {
            max_position_size: self.risk.max_position_size,
            max_daily_loss: self.risk.max_daily_loss,
            max_gas_cost_usdc: self.risk.max_gas_cost_usdc,
            idempotency_window_ms: self.risk.idempotency_window_ms,
            strategy_tag: "atomic".to_string(),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            consec_threshold: self.circuit_breaker.consec_threshold,
            rate_threshold: self.circuit_breaker.rate_threshold,
            window: self.circuit_breaker.window,
            open_timeout: Duration::from_millis(self.circuit_breaker.open_timeout_ms),
            half_open_max: self.circuit_breaker.half_open_max,
            gas_cost_threshold: self.circuit_breaker.gas_threshold_usdc,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn anomaly_config(&self) -> AnomalyConfig {
        AnomalyConfig {
            enabled: self.anomaly.enabled,
            pulse_threshold: self.anomaly.pulse_threshold,
            depth_threshold: self.anomaly.depth_threshold,
            correlation_threshold: self.anomaly.correlation_threshold,
            window: Duration::from_millis(self.anomaly.window_ms),
            flag_window: Duration::from_millis(self.anomaly.flag_window_ms),
        }
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            url: self.feed.url.clone(),
            backoff_initial: Duration::from_millis(self.feed.ws_backoff_initial_ms),
            backoff_max: Duration::from_millis(self.feed.ws_backoff_max_ms),
            dedup_lru_size: self.feed.dedup_lru_size,
            connect_timeout: Duration::from_millis(self.feed.connect_timeout_ms),
        }
    }

    /// Idempotency-registry TTL: one window plus grace.
    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_millis(self.risk.idempotency_window_ms) + Duration::from_secs(300)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.execution.receipt_timeout_ms)
    }

    /// Configured market pairs, validated.
    pub fn market_pairs(&self) -> Result<Vec<MarketPair>> {
        self.markets.iter().map(|m| m.to_pair()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert!(config.dry_run);
        assert_eq!(config.trading.trade_size, dec!(10));
        assert_eq!(config.trading.fee_rate, dec!(0.0035));
        assert_eq!(config.circuit_breaker.consec_threshold, 3);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_parse_partial_toml() {
        let text = r#"
            dry_run = false
            wallet_address = "0x000000000000000000000000000000000000dEaD"

            [trading]
            trade_size = "25"
            fee_rate = "0.003"

            [circuit_breaker]
            consec_threshold = 5

            [[markets]]
            market_id = "cond-1"
            yes_token_id = "yes-1"
            no_token_id = "no-1"
            question = "Will it settle?"
        "#;
        let config: EngineConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();

        assert!(!config.dry_run);
        assert_eq!(config.trading.trade_size, dec!(25));
        assert_eq!(config.trading.fee_rate, dec!(0.003));
        assert_eq!(config.circuit_breaker.consec_threshold, 5);
        // Untouched sections keep defaults.
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.markets.len(), 1);
        assert_eq!(config.market_pairs().unwrap()[0].market_id, "cond-1");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = EngineConfig::default();
        config.trading.trade_size = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.trading.fee_rate = dec!(1.5);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.circuit_breaker.rate_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        // Live mode requires a wallet.
        let mut config = EngineConfig::default();
        config.dry_run = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_token_market_rejected() {
        let mut config = EngineConfig::default();
        config.markets.push(MarketEntry {
            market_id: "m".to_string(),
            yes_token_id: "same".to_string(),
            no_token_id: "same".to_string(),
            question: String::new(),
            end_date: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = EngineConfig::default();
        let breaker = config.breaker_config();
        assert_eq!(breaker.open_timeout, Duration::from_secs(60));
        let retry = config.retry_config();
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        let edge = config.edge_config();
        assert_eq!(edge.slippage_bps, 5);
        let feed = config.feed_config();
        assert_eq!(feed.backoff_initial, Duration::from_secs(1));
        assert_eq!(
            config.idempotency_ttl(),
            Duration::from_millis(10_000) + Duration::from_secs(300)
        );
    }
}
