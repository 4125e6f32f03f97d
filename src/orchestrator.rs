//! Multi-symbol supervision
//!
//! Runs one [`SymbolEngine`] task per configured symbol. Symbols share no
//! mutable state; the only thing engines have in common is the shutdown
//! signal. One symbol's failure is logged and never tears down its
//! siblings. On shutdown each engine attempts a best-effort cancel of its
//! resting orders before the process exits.

use log::{error, info};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::engine::SymbolEngine;
use crate::errors::Result;
use crate::exchange::Exchange;

/// Supervises a set of symbol engines
pub struct Orchestrator<E: Exchange + 'static> {
    engines: Vec<SymbolEngine<E>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<E: Exchange + 'static> Orchestrator<E> {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engines: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn add_engine(&mut self, engine: SymbolEngine<E>) {
        self.engines.push(engine);
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Run all engines until ctrl-c
    pub async fn run(self) -> Result<()> {
        self.run_with_signal(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Run all engines until `signal` completes (or every engine exits on
    /// its own), then broadcast shutdown and join them.
    pub async fn run_with_signal(self, signal: impl std::future::Future<Output = ()>) -> Result<()> {
        let mut set = JoinSet::new();
        for engine in self.engines {
            let symbol = engine.symbol().to_string();
            let rx = self.shutdown_rx.clone();
            set.spawn(async move {
                let result = engine.run(rx).await;
                (symbol, result)
            });
        }
        drop(self.shutdown_rx);

        info!("Orchestrator running {} engine(s)", set.len());
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received");
                    let _ = self.shutdown_tx.send(true);
                    while let Some(joined) = set.join_next().await {
                        log_engine_exit(joined);
                    }
                    break;
                }
                joined = set.join_next() => match joined {
                    Some(result) => log_engine_exit(result),
                    None => {
                        info!("All engines finished");
                        break;
                    }
                }
            }
        }

        info!("Orchestrator stopped");
        Ok(())
    }
}

impl<E: Exchange + 'static> Default for Orchestrator<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn log_engine_exit(joined: std::result::Result<(String, Result<()>), tokio::task::JoinError>) {
    match joined {
        Ok((symbol, Ok(()))) => info!("{symbol}: engine exited cleanly"),
        Ok((symbol, Err(e))) => error!("{symbol}: engine failed: {e}"),
        Err(e) => error!("Engine task aborted: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::exchange::sim::SimExchange;
    use crate::volatility::Bar;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_config(symbol: &str) -> BotConfig {
        let mut config = BotConfig::new(symbol, 0.01, 0.5, 2)
            .with_exit_thresholds(5.0, 2.0)
            .with_retry_config(2, 1);
        config.reconcile_interval_ms = 20;
        config.risk_interval_ms = 20;
        config
    }

    async fn sim_with_history(mark: f64) -> Arc<SimExchange> {
        let exchange = Arc::new(SimExchange::new(mark));
        exchange
            .set_bars(vec![Bar::new(mark + 100.0, mark - 100.0, mark); 20])
            .await;
        exchange
    }

    #[tokio::test]
    async fn test_runs_multiple_symbols_independently() {
        let btc = sim_with_history(50000.0).await;
        let eth = sim_with_history(3000.0).await;

        let mut orchestrator = Orchestrator::new();
        orchestrator.add_engine(
            SymbolEngine::start(fast_config("BTCUSDT"), btc.clone())
                .await
                .unwrap(),
        );
        orchestrator.add_engine(
            SymbolEngine::start(fast_config("ETHUSDT"), eth.clone())
                .await
                .unwrap(),
        );

        let (trigger_tx, trigger_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(orchestrator.run_with_signal(async {
            let _ = trigger_rx.await;
        }));

        // Both ladders appear independently
        for _ in 0..200 {
            if btc.open_order_count().await == 4 && eth.open_order_count().await == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(btc.open_order_count().await, 4);
        assert_eq!(eth.open_order_count().await, 4);

        // Shutdown cancels everything on both exchanges
        trigger_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(btc.open_order_count().await, 0);
        assert_eq!(eth.open_order_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_orchestrator_exits_immediately() {
        let orchestrator: Orchestrator<SimExchange> = Orchestrator::new();
        // No engines: returns without waiting for the signal
        orchestrator
            .run_with_signal(std::future::pending())
            .await
            .unwrap();
    }
}
