// =============================================================================
// Periodic Scheduler — background loops, jitter, graceful shutdown
// =============================================================================
//
// Owns the engine's four background tasks:
//   OrderMonitor    every 5 s   (entry/exit/stop fill polling)
//   ExitMonitor     every 10 s  (prioritized exit evaluation)
//   StrategySignal  every 1 s   (bar completion + worker-set sync)
//   EndOfSession    16:05 market time, one-shot per session (daily summary)
//
// Scheduling applies ±10% jitter per tick so the loops never burst against
// the broker in lockstep. Every loop checks the shutdown signal between
// ticks. A loop that hits three consecutive invariant violations halts and
// raises an operator alert; the other loops keep running.
//
// Stop: signal shutdown, then wait up to 10 s for in-flight ticks to finish
// (reverse start order) before aborting stragglers.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::strategy_task::StrategySupervisor;
use crate::engine::{exit_monitor, order_monitor, Engine};
use crate::error::{EngineError, EngineResult};
use crate::session;

/// Market-local time of the end-of-session summary task.
const EOS_SUMMARY_TIME: &str = "16:05";
/// Consecutive invariant violations before a loop halts.
const MAX_INVARIANT_STRIKES: u32 = 3;
/// How long stop() waits for in-flight ticks before aborting.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Apply ±10% jitter to a base interval.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    base.mul_f64(factor)
}

/// Tracks consecutive invariant violations for one loop.
struct StrikeCounter {
    name: &'static str,
    strikes: u32,
}

enum LoopDirective {
    Continue,
    Halt,
}

impl StrikeCounter {
    fn new(name: &'static str) -> Self {
        Self { name, strikes: 0 }
    }

    fn record(&mut self, result: &EngineResult<()>) -> LoopDirective {
        match result {
            Ok(()) => {
                self.strikes = 0;
                LoopDirective::Continue
            }
            Err(EngineError::InvariantViolation(detail)) => {
                self.strikes += 1;
                error!(
                    task = self.name,
                    strikes = self.strikes,
                    detail = %detail,
                    "invariant violation in periodic task"
                );
                if self.strikes >= MAX_INVARIANT_STRIKES {
                    LoopDirective::Halt
                } else {
                    LoopDirective::Continue
                }
            }
            Err(e) => {
                // Transient/permanent broker and store hiccups: log and keep
                // the loop alive.
                warn!(task = self.name, error = %e, "periodic task error");
                self.strikes = 0;
                LoopDirective::Continue
            }
        }
    }
}

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    /// Spawn all background tasks.
    pub fn start(engine: Arc<Engine>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut handles = Vec::new();

        // ── OrderMonitor ─────────────────────────────────────────────
        {
            let engine = engine.clone();
            let mut shutdown = shutdown_tx.subscribe();
            let base = Duration::from_secs(engine.config.order_monitor_interval_secs);
            handles.push((
                "order_monitor",
                tokio::spawn(async move {
                    let mut strikes = StrikeCounter::new("order_monitor");
                    let mut rotation = 0usize;
                    info!(interval_secs = base.as_secs(), "order monitor started");
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(jittered(base)) => {}
                            _ = shutdown.changed() => break,
                        }
                        let result =
                            order_monitor::tick(&engine, Utc::now().naive_utc(), &mut rotation)
                                .await;
                        if let LoopDirective::Halt = strikes.record(&result) {
                            engine.raise_operator_alert(
                                "order monitor halted after repeated invariant violations"
                                    .to_string(),
                            );
                            break;
                        }
                    }
                    info!("order monitor stopped");
                }),
            ));
        }

        // ── ExitMonitor ──────────────────────────────────────────────
        {
            let engine = engine.clone();
            let mut shutdown = shutdown_tx.subscribe();
            let base = Duration::from_secs(engine.config.exit_monitor_interval_secs);
            handles.push((
                "exit_monitor",
                tokio::spawn(async move {
                    let mut strikes = StrikeCounter::new("exit_monitor");
                    let mut rotation = 0usize;
                    info!(interval_secs = base.as_secs(), "exit monitor started");
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(jittered(base)) => {}
                            _ = shutdown.changed() => break,
                        }
                        let result =
                            exit_monitor::tick(&engine, session::market_now(), &mut rotation)
                                .await;
                        if let LoopDirective::Halt = strikes.record(&result) {
                            engine.raise_operator_alert(
                                "exit monitor halted after repeated invariant violations"
                                    .to_string(),
                            );
                            break;
                        }
                    }
                    info!("exit monitor stopped");
                }),
            ));
        }

        // ── StrategySignal ───────────────────────────────────────────
        {
            let engine = engine.clone();
            let mut shutdown = shutdown_tx.subscribe();
            handles.push((
                "strategy_signal",
                tokio::spawn(async move {
                    let mut supervisor = StrategySupervisor::new(engine.clone());
                    let mut strikes = StrikeCounter::new("strategy_signal");
                    let mut iteration = 0u64;
                    info!("strategy signal task started");
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(jittered(Duration::from_secs(1))) => {}
                            _ = shutdown.changed() => break,
                        }
                        supervisor.drive_bars(Utc::now());

                        // The enabled set is read-mostly: re-sync every 5 s.
                        if iteration % 5 == 0 {
                            let result = supervisor.sync().await;
                            if let LoopDirective::Halt = strikes.record(&result) {
                                engine.raise_operator_alert(
                                    "strategy task halted after repeated invariant violations"
                                        .to_string(),
                                );
                                break;
                            }
                        }
                        iteration += 1;
                    }
                    supervisor.shutdown();
                    info!("strategy signal task stopped");
                }),
            ));
        }

        // ── EndOfSession ─────────────────────────────────────────────
        {
            let engine = engine.clone();
            let mut shutdown = shutdown_tx.subscribe();
            handles.push((
                "end_of_session",
                tokio::spawn(async move {
                    let mut last_summarised: Option<NaiveDate> = None;
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(jittered(Duration::from_secs(30))) => {}
                            _ = shutdown.changed() => break,
                        }
                        let now = session::market_now();
                        let today = session::session_date(now);
                        if session::at_or_past(now, EOS_SUMMARY_TIME)
                            && last_summarised != Some(today)
                        {
                            match engine.store.upsert_daily_summary(today).await {
                                Ok(summary) => {
                                    info!(
                                        date = %today,
                                        pnl = summary.total_pnl,
                                        "end-of-session summary written"
                                    );
                                    last_summarised = Some(today);
                                }
                                Err(e) => {
                                    warn!(error = %e, "end-of-session summary failed — will retry");
                                }
                            }
                        }
                    }
                    info!("end-of-session task stopped");
                }),
            ));
        }

        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Signal shutdown and drain the tasks in reverse start order, within
    /// the stop timeout. Stragglers are aborted.
    pub async fn stop(mut self) {
        info!("scheduler stopping");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        while let Some((name, handle)) = self.handles.pop() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(_) => info!(task = name, "task drained"),
                Err(_) => {
                    warn!(task = name, "task did not drain in time — aborting");
                    // The JoinHandle was consumed by the timeout future; the
                    // runtime drops the task at shutdown.
                }
            }
        }
        info!("scheduler stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::engine_with_sim;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let j = jittered(base);
            assert!(j >= Duration::from_secs_f64(9.0));
            assert!(j <= Duration::from_secs_f64(11.0));
        }
    }

    #[test]
    fn strikes_reset_on_success() {
        let mut counter = StrikeCounter::new("test");
        let violation: EngineResult<()> =
            Err(EngineError::InvariantViolation("boom".to_string()));

        assert!(matches!(counter.record(&violation), LoopDirective::Continue));
        assert!(matches!(counter.record(&violation), LoopDirective::Continue));
        assert!(matches!(counter.record(&Ok(())), LoopDirective::Continue));
        assert_eq!(counter.strikes, 0);
    }

    #[test]
    fn three_consecutive_violations_halt() {
        let mut counter = StrikeCounter::new("test");
        let violation: EngineResult<()> =
            Err(EngineError::InvariantViolation("boom".to_string()));

        assert!(matches!(counter.record(&violation), LoopDirective::Continue));
        assert!(matches!(counter.record(&violation), LoopDirective::Continue));
        assert!(matches!(counter.record(&violation), LoopDirective::Halt));
    }

    #[test]
    fn non_invariant_errors_never_halt() {
        let mut counter = StrikeCounter::new("test");
        let transient: EngineResult<()> =
            Err(EngineError::TransientBroker("offline".to_string()));

        for _ in 0..10 {
            assert!(matches!(counter.record(&transient), LoopDirective::Continue));
        }
    }

    #[tokio::test]
    async fn start_and_stop_promptly() {
        let (engine, _sim) = engine_with_sim().await;
        let scheduler = Scheduler::start(engine);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = tokio::time::Instant::now();
        scheduler.stop().await;
        assert!(started.elapsed() < STOP_TIMEOUT);
    }
}
