//! Adaptive grid market making for leveraged derivatives exchanges
//!
//! The engine maintains a ladder of resting buy/sell limit orders around
//! the mark price, sizes the ladder from rolling volatility (ATR),
//! reconciles it against fills in real time, and tracks position risk
//! (PnL, stop-loss, take-profit, trailing stop).
//!
//! # Architecture
//!
//! - [`volatility`] - ATR estimation from price bars
//! - [`planner`] - converts ATR + reference price into target grid levels
//! - [`feed`] - folds depth/trade streams into the latest market snapshot
//! - [`orders`] - order lifecycle: draw, reconcile, cancel, position
//! - [`risk`] - PnL tracking and take-profit / stop-loss / trailing exits
//! - [`engine`] - per-symbol task group running the three loops
//! - [`orchestrator`] - multi-symbol supervision and shutdown
//! - [`exchange`] - the collaborator trait plus a deterministic simulator
//!
//! # Example
//!
//! ```rust,ignore
//! use gridbot::{BotConfig, Orchestrator, SymbolEngine};
//! use gridbot::exchange::sim::SimExchange;
//! use std::sync::Arc;
//!
//! let config = BotConfig::new("BTCUSDT", 0.001, 0.5, 5)
//!     .with_leverage(10)
//!     .with_exit_thresholds(5.0, 2.0)
//!     .with_sandbox(true);
//!
//! let exchange = Arc::new(SimExchange::new(50000.0));
//! let engine = SymbolEngine::start(config, exchange).await?;
//!
//! let mut orchestrator = Orchestrator::new();
//! orchestrator.add_engine(engine);
//! orchestrator.run().await?;
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod feed;
pub mod helpers;
pub mod orchestrator;
pub mod orders;
pub mod planner;
pub mod risk;
pub mod types;
pub mod volatility;

// Re-export commonly used types
pub use config::{BotConfig, LogConfig, Settings};
pub use engine::SymbolEngine;
pub use errors::{Error, Result};
pub use exchange::{
    Exchange, ExchangeOrderStatus, InstrumentRules, OpenOrderInfo, OrderRequest, TimeInForce,
};
pub use feed::{DepthEvent, MarketDataFeed, MarketSnapshot, SnapshotHandle, TradeEvent};
pub use helpers::{round_to_step, round_to_tick, EPSILON};
pub use orchestrator::Orchestrator;
pub use orders::{LadderSummary, OrderLifecycleManager};
pub use planner::GridPlanner;
pub use risk::{ExitReason, PnLRecord, RiskMonitor};
pub use types::{Order, OrderSide, OrderStatus, Position, PositionSide, PriceLevel};
pub use volatility::{atr, Bar, DEFAULT_ATR_PERIOD};
