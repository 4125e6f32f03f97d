//! Grid bot binary
//!
//! ## Run mode
//!
//! ```bash
//! gridbot run --config gridbot.toml
//! ```
//!
//! Starts one engine per configured symbol and runs until interrupted.
//! Symbols flagged `sandbox = true` trade against the built-in simulator,
//! which replays a deterministic price walk and fills crossed orders.
//! Live symbols need an exchange connector wired in at build time; without
//! one they fail startup.
//!
//! ## Self-test mode
//!
//! ```bash
//! gridbot self-test
//! ```
//!
//! Exercises each component contract against the simulator and exits
//! non-zero on any failure.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use gridbot::exchange::sim::SimExchange;
use gridbot::{
    atr, round_to_step, round_to_tick, Bar, BotConfig, DepthEvent, Exchange, GridPlanner,
    Orchestrator, OrderSide, PositionSide, RiskMonitor, Settings, SymbolEngine, TradeEvent,
};

#[tokio::main]
async fn main() -> ExitCode {
    match dotenvy::dotenv() {
        Ok(path) => eprintln!("Loaded environment from {}", path.display()),
        Err(_) => {}
    }

    let args: Vec<String> = env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("run");

    match mode {
        "self-test" => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init();
            self_test().await
        }
        "run" => run(&args).await,
        other => {
            eprintln!("Unknown mode '{other}'. Usage: gridbot [run|self-test] [--config <path>]");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> ExitCode {
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
        .unwrap_or("gridbot");

    let settings = match Settings::new(config_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load config '{config_path}': {e}");
            return ExitCode::FAILURE;
        }
    };

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", &settings.log.level);
    }
    env_logger::try_init().ok();

    let mut orchestrator = Orchestrator::new();
    let mut startup_failures = 0usize;

    for config in settings.symbols {
        let symbol = config.symbol.clone();

        if !config.sandbox {
            error!("{symbol}: live trading requires an exchange connector; set sandbox = true to run against the simulator");
            startup_failures += 1;
            continue;
        }

        let exchange = Arc::new(SimExchange::new(sandbox_base_price(&symbol)));
        spawn_sandbox_driver(exchange.clone(), &symbol).await;

        match SymbolEngine::start(config, exchange).await {
            Ok(engine) => {
                info!("{symbol}: engine started (sandbox)");
                orchestrator.add_engine(engine);
            }
            Err(e) => {
                error!("{symbol}: startup failed: {e}");
                startup_failures += 1;
            }
        }
    }

    if orchestrator.is_empty() {
        error!("No engine could start ({startup_failures} failure(s))");
        return ExitCode::FAILURE;
    }

    if startup_failures > 0 {
        warn!("{startup_failures} symbol(s) failed to start; continuing with the rest");
    }

    match orchestrator.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Orchestrator failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Deterministic starting price per symbol so multi-symbol sandbox runs
/// look plausible
fn sandbox_base_price(symbol: &str) -> f64 {
    match symbol {
        s if s.starts_with("BTC") => 50000.0,
        s if s.starts_with("ETH") => 3000.0,
        _ => 100.0,
    }
}

/// Drive the simulator: a slow deterministic price oscillation, depth and
/// trade events, paper fills for crossed orders, and a rolling bar history
/// for the ATR.
async fn spawn_sandbox_driver(exchange: Arc<SimExchange>, symbol: &str) {
    let base = sandbox_base_price(symbol);

    // Seed enough history for the default ATR period
    let seed: Vec<Bar> = (0..20)
        .map(|i| {
            let drift = base * 0.001 * ((i % 5) as f64 - 2.0);
            Bar::new(base + drift + base * 0.001, base + drift - base * 0.001, base + drift)
        })
        .collect();
    exchange.set_bars(seed).await;

    let symbol = symbol.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        let mut tick = 0u64;
        let mut bar_high = base;
        let mut bar_low = base;

        loop {
            ticker.tick().await;
            tick += 1;

            // Slow oscillation with a faster ripple on top
            let slow = (tick as f64 / 150.0).sin() * 0.004;
            let fast = (tick as f64 / 11.0).sin() * 0.0012;
            let price = base * (1.0 + slow + fast);

            exchange.set_mark_price(price).await;
            exchange
                .push_trade(TradeEvent { price, qty: 0.01 })
                .await;
            exchange
                .push_depth(DepthEvent {
                    bids: vec![(price * 0.9999, 5.0), (price * 0.9998, 8.0)],
                    asks: vec![(price * 1.0001, 5.0), (price * 1.0002, 8.0)],
                })
                .await;

            let filled = exchange.fill_crossed(price).await;
            if !filled.is_empty() {
                info!("{symbol}: sandbox filled {} order(s) at {price:.2}", filled.len());
            }

            bar_high = bar_high.max(price);
            bar_low = bar_low.min(price);

            // Close out one bar every five seconds
            if tick % 25 == 0 {
                let mut bars = exchange.bars.lock().await;
                bars.push(Bar::new(bar_high, bar_low, price));
                if bars.len() > 100 {
                    bars.remove(0);
                }
                drop(bars);
                bar_high = price;
                bar_low = price;
            }
        }
    });
}

/// Exercise each component contract against the simulator.
async fn self_test() -> ExitCode {
    let mut failures = 0usize;
    let mut check = |name: &str, pass: bool| {
        if pass {
            info!("ok   {name}");
        } else {
            error!("FAIL {name}");
            failures += 1;
        }
    };

    // Volatility estimator
    let bars = vec![Bar::new(101.0, 99.0, 100.0); 15];
    let atr_value = atr(&bars, 14);
    check(
        "atr: constant 2.0-range bars give ATR 2.0",
        matches!(atr_value, Ok(v) if (v - 2.0).abs() < 1e-9),
    );
    check(
        "atr: refuses short history",
        atr(&bars[..10], 14).is_err(),
    );

    // Planner
    let planner = GridPlanner::new(1.0, 2, 0.0);
    let levels = planner.plan(50000.0, 100.0, 0.1);
    check("planner: produces 2n levels", levels.len() == 4);
    check(
        "planner: n buys below and n sells above the reference",
        levels.iter().filter(|l| l.side == OrderSide::Buy && l.price < 50000.0).count() == 2
            && levels.iter().filter(|l| l.side == OrderSide::Sell && l.price > 50000.0).count() == 2,
    );
    check(
        "planner: zero ATR falls back to tick spacing",
        (planner.spacing(0.0, 0.5) - 0.5).abs() < 1e-9,
    );

    // Rounding
    let rounded = round_to_tick(50000.07, 0.1);
    check(
        "helpers: tick rounding is idempotent",
        round_to_tick(rounded, 0.1) == rounded,
    );
    let stepped = round_to_step(0.0019, 0.001);
    check(
        "helpers: step rounding truncates",
        (stepped - 0.001).abs() < 1e-9,
    );

    // Imbalance
    check(
        "feed: imbalance of 30 vs 10 is 0.5",
        (gridbot::feed::order_book_imbalance(30.0, 10.0) - 0.5).abs() < 1e-9,
    );
    check(
        "feed: imbalance of an empty book is 0",
        gridbot::feed::order_book_imbalance(0.0, 0.0) == 0.0,
    );

    // Order lifecycle against the simulator
    let config = BotConfig::new("BTCUSDT", 0.01, 0.5, 2)
        .with_exit_thresholds(5.0, 2.0)
        .with_retry_config(2, 1);
    let exchange = Arc::new(SimExchange::new(50000.0));
    exchange
        .set_bars(vec![Bar::new(50100.0, 49900.0, 50000.0); 20])
        .await;

    let engine = match SymbolEngine::start(config.clone(), exchange.clone()).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("FAIL engine startup: {e}");
            return ExitCode::FAILURE;
        }
    };
    let manager = engine.manager();

    let planner = GridPlanner::from_config(&config);
    let rules = exchange.instrument_rules("BTCUSDT").await.unwrap();
    let spacing = planner.spacing(100.0, rules.tick_size);
    let levels = planner.plan(50000.0, 100.0, rules.tick_size);

    let placed = manager.draw_grid(&levels, spacing).await.unwrap_or(0);
    check("orders: draw places the full ladder", placed == 4);

    // A sell fill updates the position and spawns exactly one replacement
    let open = exchange.open_orders("BTCUSDT").await.unwrap();
    let sell = open.iter().find(|o| o.side == OrderSide::Sell).unwrap().clone();
    exchange.fill_order(sell.oid, sell.price).await.unwrap();
    let fills = manager.reconcile().await.unwrap_or(0);
    check("orders: reconcile observes the fill", fills == 1);
    check(
        "orders: position reflects the sell",
        manager.position().await.side == PositionSide::Short,
    );
    check(
        "orders: ladder restored to 2n after the fill",
        manager.active_order_count().await == 4,
    );

    // Risk exit: a 6% favorable move fires the take-profit and suspends
    // grid placement
    let entry = manager.position().await.entry_price.unwrap_or(50000.0);
    let mut monitor = RiskMonitor::from_config(&config);
    let exit = monitor
        .check_and_enforce(&manager, entry * 0.94)
        .await
        .unwrap_or(None);
    check("risk: take-profit fires on a 6% move", exit.is_some());
    check(
        "risk: exactly one closing order is working",
        exchange.open_order_count().await == 1,
    );
    check("risk: grid placement suspended", manager.is_suspended().await);

    // cancel_all is idempotent
    let first = manager.cancel_all(None).await.unwrap_or(99);
    let second = manager.cancel_all(None).await;
    check(
        "orders: cancel_all twice is a no-op the second time",
        first == 1 && matches!(second, Ok(0)),
    );

    if failures == 0 {
        info!("self-test passed");
        ExitCode::SUCCESS
    } else {
        error!("self-test failed: {failures} check(s)");
        ExitCode::FAILURE
    }
}
