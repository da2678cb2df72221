use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::data::{PriceError, PriceLoader};
use crate::types::{Signal, SignalResult, StrategyInput, StrategyOutput};
use crate::strategies::Strategy;
use crate::utils::WarnDedup;

/// Signal-processing counters, shared across workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalCounters {
    pub signals_processed: u64,
    pub signals_skipped_no_candles: u64,
    pub signals_skipped_corrupt_csv: u64,
}

/// Fan-out driver: for each signal, load its candle window and run every
/// strategy over it. The outer loop may run as a bounded worker pool; the
/// result list is re-sorted by (signal_id, timestamp) so downstream replay is
/// reproducible regardless of completion order.
pub struct BacktestDriver {
    price_loader: Arc<dyn PriceLoader>,
    strategies: Vec<Arc<dyn Strategy>>,
    before_minutes: i64,
    after_minutes: i64,
    parallel: bool,
    max_workers: usize,
    warn: Arc<WarnDedup>,
    counters: Arc<Mutex<SignalCounters>>,
}

impl BacktestDriver {
    pub fn new(
        price_loader: Arc<dyn PriceLoader>,
        strategies: Vec<Arc<dyn Strategy>>,
        before_minutes: i64,
        after_minutes: i64,
        parallel: bool,
        max_workers: usize,
        warn: Arc<WarnDedup>,
    ) -> Self {
        Self {
            price_loader,
            strategies,
            before_minutes,
            after_minutes,
            parallel,
            max_workers: max_workers.max(1),
            warn,
            counters: Arc::new(Mutex::new(SignalCounters::default())),
        }
    }

    pub fn counters(&self) -> SignalCounters {
        *self.counters.lock().expect("counter lock poisoned")
    }

    pub async fn run(&self, signals: Vec<Signal>) -> Result<Vec<SignalResult>> {
        let total = signals.len();
        let mut results: Vec<SignalResult> = Vec::new();

        if self.parallel && total > 1 {
            info!(
                "processing {} signals in parallel (max_workers={})",
                total, self.max_workers
            );
            let semaphore = Arc::new(Semaphore::new(self.max_workers));
            let mut set: JoinSet<Result<Vec<SignalResult>>> = JoinSet::new();
            for signal in signals {
                let permit_source = Arc::clone(&semaphore);
                let ctx = self.worker_context();
                set.spawn(async move {
                    let _permit = permit_source
                        .acquire_owned()
                        .await
                        .expect("semaphore never closed");
                    ctx.process_signal(&signal).await
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(signal_results)) => results.extend(signal_results),
                    Ok(Err(e)) => return Err(e),
                    Err(e) => warn!("signal worker panicked: {}", e),
                }
            }
        } else {
            if self.parallel {
                warn!("parallel processing requested but only {} signal(s), running sequentially", total);
            }
            for signal in &signals {
                results.extend(self.worker_context().process_signal(signal).await?);
            }
        }

        // Completion order is non-deterministic in parallel mode.
        results.sort_by(|a, b| {
            a.signal_id
                .cmp(&b.signal_id)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.strategy.cmp(&b.strategy))
        });

        let counters = self.counters();
        info!(
            "signal processing summary: processed={} skipped_no_candles={} \
             skipped_corrupt_csv={} total={}",
            counters.signals_processed,
            counters.signals_skipped_no_candles,
            counters.signals_skipped_corrupt_csv,
            total
        );
        info!("{}", self.warn.summary(10));

        Ok(results)
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            price_loader: Arc::clone(&self.price_loader),
            strategies: self.strategies.clone(),
            before_minutes: self.before_minutes,
            after_minutes: self.after_minutes,
            warn: Arc::clone(&self.warn),
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Per-worker slice of the driver's shared state.
struct WorkerContext {
    price_loader: Arc<dyn PriceLoader>,
    strategies: Vec<Arc<dyn Strategy>>,
    before_minutes: i64,
    after_minutes: i64,
    warn: Arc<WarnDedup>,
    counters: Arc<Mutex<SignalCounters>>,
}

impl WorkerContext {
    /// One signal through the whole per-signal pipeline. A failing signal is
    /// recorded and skipped; only fail-fast rate limiting aborts the run.
    async fn process_signal(&self, signal: &Signal) -> Result<Vec<SignalResult>> {
        let start_time = signal.timestamp - Duration::minutes(self.before_minutes);
        let end_time = signal.timestamp + Duration::minutes(self.after_minutes);

        let candles = match self
            .price_loader
            .load_prices(&signal.contract_address, Some(start_time), Some(end_time))
            .await
        {
            Ok(candles) => candles,
            Err(e @ PriceError::RateLimitExceeded { .. }) => {
                // Fail-fast mode aborts the whole run.
                return Err(e.into());
            }
            Err(e) => {
                warn!("failed to load candles for signal {}: {}", signal.id, e);
                let mut counters = self.counters.lock().expect("counter lock poisoned");
                counters.signals_skipped_corrupt_csv += 1;
                return Ok(Vec::new());
            }
        };

        if candles.is_empty() {
            let mut counters = self.counters.lock().expect("counter lock poisoned");
            counters.signals_skipped_no_candles += 1;
            debug!(
                "signal {} skipped: no candles for {}",
                signal.id, signal.contract_address
            );
            return Ok(Vec::new());
        }

        {
            let mut counters = self.counters.lock().expect("counter lock poisoned");
            counters.signals_processed += 1;
        }
        if let Some(first) = candles.first() {
            if first.timestamp > signal.timestamp {
                self.warn.warn_once(
                    &format!("first_candle_after_signal|{}|{}", signal.id, signal.contract_address),
                    &format!(
                        "signal {} at {} is earlier than the first candle {}",
                        signal.id, signal.timestamp, first.timestamp
                    ),
                );
            }
        }

        let input = StrategyInput {
            signal,
            candles: &candles,
        };
        let mut results = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            // A strategy failure yields an error output for this signal and
            // never terminates the batch.
            let output = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                strategy.on_signal(&input)
            })) {
                Ok(output) => output,
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<String>()
                        .cloned()
                        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
                        .unwrap_or_else(|| "strategy panicked".to_string());
                    warn!("strategy {} failed on signal {}: {}", strategy.name(), signal.id, detail);
                    StrategyOutput::error(&detail)
                }
            };
            results.push(SignalResult {
                signal_id: signal.id.clone(),
                contract_address: signal.contract_address.clone(),
                strategy: strategy.name().to_string(),
                timestamp: signal.timestamp,
                output,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::{RunnerConfig, RunnerStrategy, TakeProfitLevel, TradeBlueprint};
    use crate::types::Candle;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + Duration::minutes(minute)
    }

    /// In-memory loader: candles per contract, no I/O.
    struct FixtureLoader {
        candles: HashMap<String, Vec<Candle>>,
    }

    #[async_trait]
    impl PriceLoader for FixtureLoader {
        async fn load_prices(
            &self,
            contract_address: &str,
            start_time: Option<DateTime<Utc>>,
            end_time: Option<DateTime<Utc>>,
        ) -> Result<Vec<Candle>, PriceError> {
            Ok(self
                .candles
                .get(contract_address)
                .map(|c| crate::types::slice_range(c, start_time, end_time))
                .unwrap_or_default())
        }
    }

    struct PanickyStrategy;
    impl Strategy for PanickyStrategy {
        fn name(&self) -> &str {
            "panicky"
        }
        fn on_signal(&self, _input: &StrategyInput<'_>) -> StrategyOutput {
            panic!("boom");
        }
        fn blueprint(&self, input: &StrategyInput<'_>) -> TradeBlueprint {
            TradeBlueprint::no_entry(
                &input.signal.id,
                "panicky",
                &input.signal.contract_address,
                input.signal.timestamp,
            )
        }
    }

    fn candles(minutes: &[i64]) -> Vec<Candle> {
        minutes
            .iter()
            .map(|m| Candle {
                timestamp: at(*m),
                open: dec!(100),
                high: dec!(250),
                low: dec!(90),
                close: dec!(100),
                volume: dec!(1000),
            })
            .collect()
    }

    fn runner() -> Arc<dyn Strategy> {
        Arc::new(RunnerStrategy::new(RunnerConfig::new(
            "runner_test",
            vec![TakeProfitLevel {
                xn: dec!(2),
                fraction: dec!(1.0),
            }],
        )))
    }

    fn driver(loader: FixtureLoader, strategies: Vec<Arc<dyn Strategy>>, parallel: bool) -> BacktestDriver {
        BacktestDriver::new(
            Arc::new(loader),
            strategies,
            60,
            360,
            parallel,
            4,
            Arc::new(WarnDedup::new()),
        )
    }

    #[tokio::test]
    async fn test_signal_without_candles_is_skipped() {
        let loader = FixtureLoader {
            candles: HashMap::new(),
        };
        let d = driver(loader, vec![runner()], false);
        let results = d
            .run(vec![Signal::new("s1", "NO_SUCH_TOKEN", at(0))])
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(d.counters().signals_skipped_no_candles, 1);
        assert_eq!(d.counters().signals_processed, 0);
    }

    #[tokio::test]
    async fn test_strategy_panic_becomes_error_output() {
        let mut fixtures = HashMap::new();
        fixtures.insert("TOKEN1".to_string(), candles(&[0, 1, 2]));
        let d = driver(
            FixtureLoader { candles: fixtures },
            vec![Arc::new(PanickyStrategy)],
            false,
        );
        let results = d.run(vec![Signal::new("s1", "TOKEN1", at(0))]).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].output.reason, "error");
        assert!(results[0].output.meta.contains_key("exception"));
    }

    #[tokio::test]
    async fn test_parallel_results_are_sorted_deterministically() {
        let mut fixtures = HashMap::new();
        for i in 0..8 {
            fixtures.insert(format!("TOKEN{}", i), candles(&[0, 1, 2]));
        }
        let signals: Vec<Signal> = (0..8)
            .map(|i| Signal::new(&format!("sig{:02}", i), &format!("TOKEN{}", i), at(i)))
            .collect();

        let d = driver(FixtureLoader { candles: fixtures.clone() }, vec![runner()], true);
        let parallel_results = d.run(signals.clone()).await.unwrap();

        let d2 = driver(FixtureLoader { candles: fixtures }, vec![runner()], false);
        let sequential_results = d2.run(signals).await.unwrap();

        let parallel_ids: Vec<&str> = parallel_results.iter().map(|r| r.signal_id.as_str()).collect();
        let sequential_ids: Vec<&str> =
            sequential_results.iter().map(|r| r.signal_id.as_str()).collect();
        assert_eq!(parallel_ids, sequential_ids);
        assert_eq!(d.counters().signals_processed, 8);
    }

    #[tokio::test]
    async fn test_each_strategy_gets_a_result_row() {
        let mut fixtures = HashMap::new();
        fixtures.insert("TOKEN1".to_string(), candles(&[0, 1, 2]));
        let second = Arc::new(RunnerStrategy::new(RunnerConfig::new(
            "runner_b",
            vec![TakeProfitLevel {
                xn: dec!(3),
                fraction: dec!(1.0),
            }],
        )));
        let d = driver(
            FixtureLoader { candles: fixtures },
            vec![runner(), second],
            false,
        );
        let results = d.run(vec![Signal::new("s1", "TOKEN1", at(0))]).await.unwrap();
        assert_eq!(results.len(), 2);
        let names: Vec<&str> = results.iter().map(|r| r.strategy.as_str()).collect();
        assert!(names.contains(&"runner_test"));
        assert!(names.contains(&"runner_b"));
    }
}
