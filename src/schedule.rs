//! In-process periodic sync (`harvest schedule`).
//!
//! Runs one sync pass per interval. A pass that outlives its interval
//! delays the next one instead of overlapping it, and a failed pass is
//! logged and retried on the next tick.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::ingest::{run_sync, SyncOptions};

/// What a schedule loop did before it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleReport {
    pub passes: u32,
    pub failed_passes: u32,
    pub cancelled: bool,
}

/// Call `pass` every `every` until `max_runs` passes ran or `cancel` fires.
pub async fn run_every<F, Fut>(
    every: Duration,
    max_runs: Option<u32>,
    cancel: CancellationToken,
    mut pass: F,
) -> ScheduleReport
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut report = ScheduleReport::default();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if max_runs.is_some_and(|max| report.passes >= max) {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                report.cancelled = true;
                break;
            }
            _ = interval.tick() => {}
        }

        report.passes += 1;
        let n = report.passes;
        info!(pass = n, "scheduled sync pass starting");
        if let Err(e) = pass(n).await {
            report.failed_passes += 1;
            warn!(
                pass = n,
                error = %format!("{:#}", e),
                "scheduled sync pass failed; will retry next interval"
            );
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
    }

    info!(
        passes = report.passes,
        failed = report.failed_passes,
        cancelled = report.cancelled,
        "schedule stopped"
    );
    report
}

/// Sync `source_spec` every `every` seconds.
pub async fn run_schedule(
    config: &Config,
    source_spec: &str,
    opts: &SyncOptions,
    every: Duration,
    max_runs: Option<u32>,
    cancel: CancellationToken,
) -> Result<ScheduleReport> {
    if every.is_zero() {
        anyhow::bail!("--every must be at least 1 second");
    }

    let report = run_every(every, max_runs, cancel.clone(), |_| {
        let cancel = cancel.clone();
        async move { run_sync(config, source_spec, opts, cancel).await.map(|_| ()) }
    })
    .await;

    println!(
        "schedule stopped after {} pass(es), {} failed{}",
        report.passes,
        report.failed_passes,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stops_after_max_runs_and_keeps_going_on_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let pass = move |n: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 2 {
                    anyhow::bail!("upstream down");
                }
                Ok(())
            }
        };
        let report =
            run_every(Duration::from_millis(5), Some(3), CancellationToken::new(), pass).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            report,
            ScheduleReport {
                passes: 3,
                failed_passes: 1,
                cancelled: false,
            }
        );
    }

    #[tokio::test]
    async fn passes_never_overlap() {
        let running = Arc::new(AtomicU32::new(0));
        let overlaps = Arc::new(AtomicU32::new(0));
        let (r, o) = (running.clone(), overlaps.clone());
        run_every(Duration::from_millis(1), Some(4), CancellationToken::new(), move |_| {
            let (r, o) = (r.clone(), o.clone());
            async move {
                if r.fetch_add(1, Ordering::SeqCst) > 0 {
                    o.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let report = run_every(Duration::from_millis(5), None, cancel, move |n| {
            if n == 2 {
                token.cancel();
            }
            async { Ok(()) }
        })
        .await;

        assert_eq!(report.passes, 2);
        assert!(report.cancelled);
    }
}
