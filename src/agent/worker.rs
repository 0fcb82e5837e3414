use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::classify;
use crate::export::health::HealthMetrics;

/// Timing of one background loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    /// Delay between successful cycles.
    pub interval: Duration,
    /// Delay after a failed cycle.
    pub error_backoff: Duration,
}

/// Spawns a task that runs `cycle` until `cancel` fires.
///
/// A cycle that has started always runs to completion; cancellation is
/// observed between cycles and while sleeping.
pub fn spawn_loop<F, Fut>(
    name: &'static str,
    timing: LoopTiming,
    cancel: CancellationToken,
    health: Arc<HealthMetrics>,
    cycle: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        info!(pipeline = name, interval = ?timing.interval, "loop started");

        while !cancel.is_cancelled() {
            let delay = match cycle().await {
                Ok(()) => {
                    record(&health, name, "ok");
                    timing.interval
                }
                Err(e) => {
                    let class = classify(&e);
                    record(&health, name, class);
                    if class == "not_ready" {
                        warn!(pipeline = name, error = %format!("{e:#}"), "cycle not ready");
                    } else {
                        error!(pipeline = name, class, error = %format!("{e:#}"), "cycle failed");
                    }
                    timing.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(pipeline = name, "loop stopped");
    })
}

fn record(health: &HealthMetrics, name: &str, result: &str) {
    health
        .cycles_total
        .with_label_values(&[name, result])
        .inc();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::PipelineError;

    fn timing() -> LoopTiming {
        LoopTiming {
            interval: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
        }
    }

    fn health() -> Arc<HealthMetrics> {
        Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"))
    }

    #[tokio::test]
    async fn test_loop_counts_results_and_stops() {
        let health = health();
        let cancel = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let handle = spawn_loop("test", timing(), cancel.clone(), Arc::clone(&health), move || {
            let counter = Arc::clone(&counter);
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(PipelineError::SourceNotReady {
                        what: "source".to_string(),
                        reason: "warming up".to_string(),
                    }
                    .into()),
                    1 => anyhow::bail!("boom"),
                    _ => Ok(()),
                }
            }
        });

        while runs.load(Ordering::SeqCst) < 4 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        cancel.cancel();
        handle.await.expect("join");

        let count = |result: &str| health.cycles_total.with_label_values(&["test", result]).get();
        assert_eq!(count("not_ready"), 1.0);
        assert_eq!(count("error"), 1.0);
        assert!(count("ok") >= 2.0);
    }

    #[tokio::test]
    async fn test_cancelled_loop_never_runs() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        spawn_loop("idle", timing(), cancel, health(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .expect("join");

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
