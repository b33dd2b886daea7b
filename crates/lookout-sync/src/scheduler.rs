//! Fixed-delay job runner.
//!
//! Every job runs once immediately, then sleeps its interval after each completion.
//! A failing or panicking tick is logged and the job keeps its schedule.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type JobAction = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Clone)]
pub struct Job {
    name: String,
    interval: Duration,
    action: JobAction,
}

impl Job {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            action: Arc::new(move || -> JobFuture { Box::pin(action()) }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn add(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Starts one task per job.
    pub fn spawn(self) -> SchedulerHandle {
        let tasks = self
            .jobs
            .into_iter()
            .map(|job| {
                info!(job = %job.name, interval_secs = job.interval.as_secs(), "scheduling job");
                tokio::spawn(run_forever(job))
            })
            .collect();
        SchedulerHandle { tasks }
    }

    /// Runs every job until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future,
    {
        let handle = self.spawn();
        shutdown.await;
        info!("shutdown requested, stopping jobs");
        handle.abort_all();
    }
}

#[derive(Debug)]
pub struct SchedulerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn abort_all(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn run_forever(job: Job) {
    loop {
        let span = info_span!("job", job = %job.name);
        // Spawned so a panic ends only this tick.
        let tick = tokio::spawn((job.action)().instrument(span));
        match tick.await {
            Ok(Ok(())) => debug!(job = %job.name, "tick finished"),
            Ok(Err(err)) => warn!(job = %job.name, error = %err, "tick failed"),
            Err(err) if err.is_panic() => warn!(job = %job.name, "tick panicked"),
            Err(err) => warn!(job = %job.name, error = %err, "tick cancelled"),
        }
        tokio::time::sleep(job.interval).await;
    }
}
