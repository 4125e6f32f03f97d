//! Bot configuration
//!
//! [`BotConfig`] is the immutable parameter bundle for one symbol engine.
//! [`Settings`] is the process-level configuration loaded from a file plus
//! `GRIDBOT__*` environment overrides.

use config::{Config, File};
pub use config::ConfigError;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Per-symbol bot configuration
///
/// Created at startup and never mutated for the lifetime of one engine
/// instance. Each component receives this struct (or the fields it needs)
/// explicitly; there is no global configuration singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Symbol to trade (e.g., "BTCUSDT")
    pub symbol: String,

    /// Order quantity per grid level, in base asset
    pub volume: f64,

    /// Grid spacing = ATR * grid_multiplier
    pub grid_multiplier: f64,

    /// Number of grid levels per side (2 * num_of_grids orders total)
    pub num_of_grids: u32,

    /// Leverage setting (1-100)
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Take-profit threshold as a percentage of position notional
    pub take_profit_percent: f64,

    /// Stop-loss threshold as a percentage of position notional
    pub stop_loss_percent: f64,

    /// Trailing-stop callback: exit when PnL percent retraces this much
    /// from its peak
    #[serde(default = "default_trailing_stop_callback")]
    pub trailing_stop_callback: f64,

    /// ATR at or below this value falls back to tick-size grid spacing
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold: f64,

    /// Fraction of account risked per trade (informational sizing cap)
    #[serde(default = "default_risk_percentage")]
    pub risk_percentage: f64,

    /// Price decimal places used for display formatting
    #[serde(default = "default_price_decimals")]
    pub price_decimals: u32,

    /// Quantity decimal places used for display formatting
    #[serde(default = "default_qty_decimals")]
    pub qty_decimals: u32,

    /// Run against the exchange sandbox instead of live
    #[serde(default)]
    pub sandbox: bool,

    /// ATR lookback period in bars
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// Reconcile loop interval (milliseconds)
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,

    /// Risk/PnL loop interval (milliseconds)
    #[serde(default = "default_risk_interval")]
    pub risk_interval_ms: u64,

    /// Maximum retry attempts for exchange calls
    #[serde(default = "default_max_retries")]
    pub max_order_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

fn default_leverage() -> u32 {
    1
}

fn default_trailing_stop_callback() -> f64 {
    0.1
}

fn default_volatility_threshold() -> f64 {
    0.0
}

fn default_risk_percentage() -> f64 {
    0.01
}

fn default_price_decimals() -> u32 {
    2
}

fn default_qty_decimals() -> u32 {
    3
}

fn default_atr_period() -> usize {
    14
}

fn default_reconcile_interval() -> u64 {
    500
}

fn default_risk_interval() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    100
}

impl BotConfig {
    /// Create a new configuration with required parameters
    ///
    /// # Arguments
    /// * `symbol` - Symbol to trade (e.g., "BTCUSDT")
    /// * `volume` - Order quantity per grid level
    /// * `grid_multiplier` - Grid spacing multiplier applied to ATR
    /// * `num_of_grids` - Levels per side
    pub fn new(
        symbol: impl Into<String>,
        volume: f64,
        grid_multiplier: f64,
        num_of_grids: u32,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            volume,
            grid_multiplier,
            num_of_grids,
            leverage: default_leverage(),
            take_profit_percent: 0.5,
            stop_loss_percent: 0.5,
            trailing_stop_callback: default_trailing_stop_callback(),
            volatility_threshold: default_volatility_threshold(),
            risk_percentage: default_risk_percentage(),
            price_decimals: default_price_decimals(),
            qty_decimals: default_qty_decimals(),
            sandbox: false,
            atr_period: default_atr_period(),
            reconcile_interval_ms: default_reconcile_interval(),
            risk_interval_ms: default_risk_interval(),
            max_order_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }

    /// Builder: set leverage
    pub fn with_leverage(mut self, leverage: u32) -> Self {
        self.leverage = leverage;
        self
    }

    /// Builder: set take-profit and stop-loss percentages
    pub fn with_exit_thresholds(mut self, take_profit: f64, stop_loss: f64) -> Self {
        self.take_profit_percent = take_profit;
        self.stop_loss_percent = stop_loss;
        self
    }

    /// Builder: set trailing-stop callback percent
    pub fn with_trailing_stop(mut self, callback: f64) -> Self {
        self.trailing_stop_callback = callback;
        self
    }

    /// Builder: set volatility threshold for the spacing fallback
    pub fn with_volatility_threshold(mut self, threshold: f64) -> Self {
        self.volatility_threshold = threshold;
        self
    }

    /// Builder: set display precision
    pub fn with_precision(mut self, price_decimals: u32, qty_decimals: u32) -> Self {
        self.price_decimals = price_decimals;
        self.qty_decimals = qty_decimals;
        self
    }

    /// Builder: run against the sandbox
    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Builder: set ATR lookback period
    pub fn with_atr_period(mut self, period: usize) -> Self {
        self.atr_period = period;
        self
    }

    /// Builder: set retry parameters
    pub fn with_retry_config(mut self, max_retries: u32, base_delay_ms: u64) -> Self {
        self.max_order_retries = max_retries;
        self.retry_base_delay_ms = base_delay_ms;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty() {
            return Err(Error::InvalidConfig("symbol cannot be empty".into()));
        }

        if self.volume <= 0.0 {
            return Err(Error::InvalidConfig("volume must be positive".into()));
        }

        if self.grid_multiplier <= 0.0 {
            return Err(Error::InvalidConfig(
                "grid_multiplier must be positive".into(),
            ));
        }

        if self.num_of_grids == 0 {
            return Err(Error::InvalidConfig(
                "num_of_grids must be at least 1".into(),
            ));
        }

        if self.leverage == 0 || self.leverage > 100 {
            return Err(Error::InvalidConfig(
                "leverage must be between 1 and 100".into(),
            ));
        }

        if self.take_profit_percent <= 0.0 || self.stop_loss_percent <= 0.0 {
            return Err(Error::InvalidConfig(
                "take_profit_percent and stop_loss_percent must be positive".into(),
            ));
        }

        if self.trailing_stop_callback < 0.0 {
            return Err(Error::InvalidConfig(
                "trailing_stop_callback cannot be negative".into(),
            ));
        }

        if self.volatility_threshold < 0.0 {
            return Err(Error::InvalidConfig(
                "volatility_threshold cannot be negative".into(),
            ));
        }

        if self.atr_period < 2 {
            return Err(Error::InvalidConfig("atr_period must be at least 2".into()));
        }

        Ok(())
    }
}

/// Process-level settings
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// One engine per configured symbol
    pub symbols: Vec<BotConfig>,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    ///
    /// Environment variables override file values, e.g.
    /// `GRIDBOT__LOG__LEVEL=debug`.
    pub fn new(config_path: &str) -> std::result::Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(config::Environment::with_prefix("GRIDBOT").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
