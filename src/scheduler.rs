use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::error::Result;

/// Default bound on a single warming call.
pub const DEFAULT_TICK_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs `job` immediately and then on a fixed cadence until the shutdown
/// signal flips. Ticks never overlap: the job is awaited inline and missed
/// ticks are skipped rather than bursted. Each tick is bounded by
/// `tick_timeout`.
pub fn spawn_refresher<F, Fut>(
    name: &'static str,
    period: Duration,
    tick_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match timeout(tick_timeout, job()).await {
                        Ok(Ok(())) => tracing::debug!("{name} warming tick completed"),
                        Ok(Err(e)) => tracing::warn!("{name} warming tick failed: {e}"),
                        Err(_) => tracing::warn!("{name} warming tick timed out after {tick_timeout:?}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("{name} refresher stopping");
                        break;
                    }
                }
            }
        }
    })
}
