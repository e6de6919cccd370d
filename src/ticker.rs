//! Single cooperative ticker for every periodic job.
//!
//! Reclamation, retention pruning, cache-refresh signaling, and metrics all
//! run from one loop on their own periods. Each job is bounded to its own
//! period so a slow job cannot overlap itself or starve the others, and one
//! cancel token shuts the whole thing down.

use futures_util::future::BoxFuture;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

/// How often the ticker wakes to check for due jobs.
const BASE_TICK: Duration = Duration::from_millis(250);

type JobFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Job {
    name: &'static str,
    period: Duration,
    last_run: Option<Instant>,
    run: JobFn,
}

#[derive(Default)]
pub struct Ticker {
    jobs: Vec<Job>,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job to run every `period`.
    pub fn every<F, Fut>(mut self, name: &'static str, period: Duration, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.jobs.push(Job {
            name,
            period,
            last_run: None,
            run: Box::new(move || Box::pin(f())),
        });
        self
    }

    /// Spawn the ticker loop. Runs until `cancel` fires.
    pub fn spawn(mut self, cancel: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut cancel_wait = cancel.clone();
            let mut tick = tokio::time::interval(BASE_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel_wait.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let now = Instant::now();
                for job in &mut self.jobs {
                    let due = job
                        .last_run
                        .map_or(true, |last| now.duration_since(last) >= job.period);
                    if !due {
                        continue;
                    }
                    job.last_run = Some(now);
                    // Bound each job to its own period so it cannot overlap
                    // itself on the next pass.
                    match tokio::time::timeout(job.period.max(BASE_TICK), (job.run)()).await {
                        Ok(()) => debug!(job = job.name, "tick job ran"),
                        Err(_) => warn!(job = job.name, "tick job exceeded its period — aborted"),
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
            debug!("ticker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn jobs_run_on_their_periods() {
        let fast = Arc::new(AtomicU32::new(0));
        let slow = Arc::new(AtomicU32::new(0));
        let (src, token) = CancelSource::new();

        let fast2 = Arc::clone(&fast);
        let slow2 = Arc::clone(&slow);
        let handle = Ticker::new()
            .every("fast", Duration::from_millis(300), move || {
                let c = Arc::clone(&fast2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .every("slow", Duration::from_millis(1200), move || {
                let c = Arc::clone(&slow2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .spawn(token);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        src.cancel();
        handle.await.unwrap();

        let fast_runs = fast.load(Ordering::SeqCst);
        let slow_runs = slow.load(Ordering::SeqCst);
        assert!(fast_runs >= 3, "fast job ran {fast_runs} times");
        assert!(slow_runs >= 1, "slow job ran {slow_runs} times");
        assert!(fast_runs > slow_runs);
    }

    #[tokio::test]
    async fn cancel_stops_the_loop() {
        let count = Arc::new(AtomicU32::new(0));
        let (src, token) = CancelSource::new();
        let count2 = Arc::clone(&count);
        let handle = Ticker::new()
            .every("job", Duration::from_millis(100), move || {
                let c = Arc::clone(&count2);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            })
            .spawn(token);

        tokio::time::sleep(Duration::from_millis(350)).await;
        src.cancel();
        handle.await.unwrap();
        let after_cancel = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn overlong_job_is_bounded() {
        let (src, token) = CancelSource::new();
        let handle = Ticker::new()
            .every("stuck", Duration::from_millis(200), || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .spawn(token);

        // The stuck job must not wedge the ticker past its period bound.
        tokio::time::sleep(Duration::from_millis(700)).await;
        src.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("ticker must shut down despite stuck job")
            .unwrap();
    }
}
