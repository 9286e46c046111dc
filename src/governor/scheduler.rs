//! In-process recurring job scheduler.
//!
//! Each registered job gets its own interval timer task. A job whose
//! previous run is still active when its timer fires is skipped for that
//! tick, so runs of the same job never overlap. A failed or panicking run
//! still releases the job for the next tick.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

/// A unit of recurring work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> anyhow::Result<()>;
}

struct Registered {
    job: Arc<dyn Job>,
    interval: Duration,
    running: Arc<AtomicBool>,
    runs: Arc<AtomicU64>,
}

impl Registered {
    /// Spawn one run unless the previous one is still going.
    fn fire(&self) -> Option<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Job {} still running, skipping this tick", self.job.name());
            return None;
        }

        let job = self.job.clone();
        let running = self.running.clone();
        let runs = self.runs.clone();
        Some(tokio::spawn(async move {
            debug!("Running job {}", job.name());
            match AssertUnwindSafe(job.run()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Job {} failed: {:#}", job.name(), e),
                Err(_) => error!("Job {} panicked", job.name()),
            }
            runs.fetch_add(1, Ordering::Relaxed);
            running.store(false, Ordering::Release);
        }))
    }
}

/// Registers jobs with intervals and drives them until shut down.
pub struct Scheduler {
    jobs: HashMap<String, Registered>,
    shutdown_tx: watch::Sender<bool>,
    timers: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs: HashMap::new(),
            shutdown_tx,
            timers: Vec::new(),
        }
    }

    /// Register `job` to run every `interval`. A later registration under the
    /// same name replaces the earlier one.
    pub fn register(&mut self, job: Arc<dyn Job>, interval: Duration) {
        let name = job.name().to_string();
        info!("Registered job {} every {:?}", name, interval);
        self.jobs.insert(
            name,
            Registered {
                job,
                interval,
                running: Arc::new(AtomicBool::new(false)),
                runs: Arc::new(AtomicU64::new(0)),
            },
        );
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Completed runs of `name` since registration
    pub fn run_count(&self, name: &str) -> Option<u64> {
        self.jobs.get(name).map(|r| r.runs.load(Ordering::Relaxed))
    }

    /// Start a timer task per job. The first run happens one interval from now.
    pub fn start(&mut self) {
        for registered in self.jobs.values() {
            let entry = Registered {
                job: registered.job.clone(),
                interval: registered.interval,
                running: registered.running.clone(),
                runs: registered.runs.clone(),
            };
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            self.timers.push(tokio::spawn(async move {
                let start = tokio::time::Instant::now() + entry.interval;
                let mut timer = interval_at(start, entry.interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            entry.fire();
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Timer for job {} stopped", entry.job.name());
            }));
        }
        info!("Scheduler started with {} jobs", self.jobs.len());
    }

    /// Run `name` now, outside its schedule. Returns `None` for unknown jobs
    /// or when a run is already in progress.
    pub fn trigger(&self, name: &str) -> Option<JoinHandle<()>> {
        self.jobs.get(name).and_then(Registered::fire)
    }

    /// Stop all timers. Runs already in progress finish on their own.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for timer in self.timers.drain(..) {
            if let Err(e) = timer.await {
                warn!("Scheduler timer ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Notify;

    struct Counting {
        name: String,
        count: Arc<AtomicU64>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self) -> anyhow::Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(name: &str, gate: Option<Arc<Notify>>) -> (Arc<Counting>, Arc<AtomicU64>) {
        let count = Arc::new(AtomicU64::new(0));
        let job = Arc::new(Counting {
            name: name.to_string(),
            count: count.clone(),
            gate,
        });
        (job, count)
    }

    #[tokio::test]
    async fn test_trigger_runs_job() {
        let mut scheduler = Scheduler::new();
        let (job, count) = counting("fine", None);
        scheduler.register(job, Duration::from_secs(3600));

        scheduler.trigger("fine").unwrap().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.run_count("fine"), Some(1));
        assert!(scheduler.trigger("missing").is_none());
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_skipped() {
        let mut scheduler = Scheduler::new();
        let gate = Arc::new(Notify::new());
        let (job, count) = counting("daily", Some(gate.clone()));
        scheduler.register(job, Duration::from_secs(3600));

        let first = scheduler.trigger("daily").unwrap();
        tokio::task::yield_now().await;
        assert!(scheduler.trigger("daily").is_none());

        gate.notify_one();
        first.await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_and_shuts_down() {
        let mut scheduler = Scheduler::new();
        let (job, count) = counting("purge", None);
        scheduler.register(job, Duration::from_secs(60));
        scheduler.start();

        tokio::time::sleep(Duration::from_secs(185)).await;
        scheduler.shutdown().await;
        let seen = count.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    struct Panicking {
        calls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Job for Panicking {
        fn name(&self) -> &str {
            "fine"
        }

        async fn run(&self) -> anyhow::Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first run blows up");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_run_releases_job() {
        let mut scheduler = Scheduler::new();
        let calls = Arc::new(AtomicU64::new(0));
        scheduler.register(
            Arc::new(Panicking {
                calls: calls.clone(),
            }),
            Duration::from_secs(3600),
        );

        scheduler.trigger("fine").unwrap().await.unwrap();
        let second = scheduler
            .trigger("fine")
            .expect("job stayed marked as running after a panic");
        second.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.run_count("fine"), Some(2));
    }

    #[test]
    fn test_job_names_sorted() {
        let mut scheduler = Scheduler::new();
        scheduler.register(counting("b", None).0, Duration::from_secs(1));
        scheduler.register(counting("a", None).0, Duration::from_secs(1));
        assert_eq!(scheduler.job_names(), vec!["a", "b"]);
    }
}
