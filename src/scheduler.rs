//! TTL and cron scheduling: an id-keyed map of spawned tasks with
//! cancel-and-replace semantics on re-arm, so a sensor never runs two
//! expiry jobs at once. Cron parsing is built on `croner`.

use croner::Cron;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

pub type JobId = (String, String);
type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct ArmedJob {
    handle: JoinHandle<()>,
    next_run_unix: Option<f64>,
}

/// Owns every live TTL/cron task. Re-arming an id atomically aborts the
/// previous task before spawning the new one, so a sensor never runs
/// two expiry jobs concurrently.
#[derive(Default)]
pub struct Scheduler {
    jobs: Mutex<HashMap<JobId, ArmedJob>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cancel_locked(jobs: &mut HashMap<JobId, ArmedJob>, id: &JobId) {
        if let Some(job) = jobs.remove(id) {
            job.handle.abort();
        }
    }

    /// Cancel any job registered for `id`.
    pub async fn cancel(&self, id: &JobId) {
        let mut jobs = self.jobs.lock().await;
        Self::cancel_locked(&mut jobs, &id.clone()).await;
    }

    /// Arm a one-shot delay (TTL expiry). `seconds` is the delay from
    /// now; `run` fires once the delay elapses.
    pub async fn arm_after(&self, id: JobId, seconds: u64, now_unix: f64, run: JobFn) {
        let mut jobs = self.jobs.lock().await;
        Self::cancel_locked(&mut jobs, &id).await;
        let next_run_unix = now_unix + seconds as f64;
        let handle = tokio::spawn(async move {
            sleep(Duration::from_secs(seconds)).await;
            run().await;
        });
        jobs.insert(
            id,
            ArmedJob {
                handle,
                next_run_unix: Some(next_run_unix),
            },
        );
    }

    /// Arm a recurring cron job from a 5- or 6-field cron spec. The job
    /// re-arms itself for the following occurrence after every firing,
    /// so a single `Scheduler::arm_cron` call keeps the schedule alive
    /// indefinitely.
    pub fn parse_cron(spec: &str) -> crate::error::Result<Cron> {
        Cron::new(spec)
            .with_seconds_optional()
            .parse()
            .map_err(|e| crate::error::HubError::InvalidCron {
                spec: spec.to_string(),
                reason: e.to_string(),
            })
    }

    pub async fn arm_cron(&self, id: JobId, cron: Cron, run: JobFn) {
        let mut jobs = self.jobs.lock().await;
        Self::cancel_locked(&mut jobs, &id).await;

        let job_id = id.clone();
        let runner = run.clone();
        let handle = tokio::spawn(async move {
            loop {
                let now = chrono::Utc::now();
                let next = match cron.find_next_occurrence(&now, false) {
                    Ok(n) => n,
                    Err(e) => {
                        log::error!("{}.{}: cron scheduling stopped: {e}", job_id.0, job_id.1);
                        return;
                    }
                };
                let delay = (next - now).to_std().unwrap_or(Duration::from_secs(0));
                sleep(delay).await;
                runner().await;
                // loop back around for the next occurrence; a
                // concurrent `cancel`/re-arm call aborts this task via
                // `JoinHandle::abort`.
            }
        });
        jobs.insert(
            id,
            ArmedJob {
                handle,
                next_run_unix: None,
            },
        );
    }

    pub async fn next_run(&self, id: &JobId) -> Option<f64> {
        self.jobs.lock().await.get(id).and_then(|j| j.next_run_unix)
    }

    pub async fn is_armed(&self, id: &JobId) -> bool {
        self.jobs.lock().await.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_cron_spec() {
        assert!(Scheduler::parse_cron("not a cron spec").is_err());
    }

    #[test]
    fn accepts_standard_five_field_spec() {
        assert!(Scheduler::parse_cron("*/5 * * * *").is_ok());
    }
}
