//! Job metrics
//!
//! Thin helpers over the `metrics` facade. Nothing is exported unless the
//! host process installs a recorder.

use metrics::{counter, histogram};
use std::time::Duration;

/// Per-queue metrics helper
#[derive(Debug, Clone)]
pub struct JobMetrics {
    queue: String,
}

impl JobMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// A job ran to completion
    pub fn job_processed(&self, duration: Duration) {
        counter!("job_worker_jobs_processed_total", "queue" => self.queue.clone()).increment(1);
        histogram!("job_worker_job_duration_seconds", "queue" => self.queue.clone())
            .record(duration.as_secs_f64());
    }

    /// A job returned an error or panicked
    pub fn job_failed(&self, panicked: bool) {
        counter!(
            "job_worker_jobs_failed_total",
            "queue" => self.queue.clone(),
            "panicked" => panicked.to_string()
        )
        .increment(1);
    }

    /// A failed job was put on the retry set
    pub fn job_retried(&self) {
        counter!("job_worker_jobs_retried_total", "queue" => self.queue.clone()).increment(1);
    }

    /// A job ran out of retries and was buried
    pub fn job_dead(&self) {
        counter!("job_worker_jobs_dead_total", "queue" => self.queue.clone()).increment(1);
    }

    /// A message left in progress by an earlier run was redelivered
    pub fn job_recovered(&self) {
        counter!("job_worker_jobs_recovered_total", "queue" => self.queue.clone()).increment(1);
    }

    /// An undecodable payload was dropped
    pub fn payload_dropped(&self) {
        counter!("job_worker_payloads_dropped_total", "queue" => self.queue.clone()).increment(1);
    }
}
