//! Job producer
//!
//! Pushes new jobs onto queues, or onto the schedule set when they should run
//! later. Any service holding a [`Config`] can enqueue; it does not need to
//! run a [`Manager`](crate::Manager).
//!
//! # Example
//!
//! ```rust,ignore
//! use job_worker::{Config, Options, Producer};
//! use serde_json::json;
//!
//! let config = Config::connect(Options::from_env()?).await?;
//! let producer = Producer::new(config);
//!
//! let jid = producer.enqueue("mailers", vec![json!("user@example.com")]).await?;
//! producer
//!     .enqueue_in("mailers", Duration::from_secs(3600), vec![json!("reminder")])
//!     .await?;
//! ```

use crate::config::Config;
use crate::error::{StoreError, WorkerError};
use crate::message::{JobRecord, Retry, epoch_seconds, now_seconds};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Per-job options for [`Producer::enqueue_with_options`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub retry: Retry,
    /// Run no earlier than this; `None` or a past time enqueues immediately
    pub at: Option<DateTime<Utc>>,
    /// Free-form job type label, carried as `class`
    pub class: Option<String>,
}

impl EnqueueOptions {
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Producer {
    config: Config,
}

impl Producer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Enqueue a job for immediate processing. Returns the job id.
    pub async fn enqueue(&self, queue: &str, args: Vec<Value>) -> Result<String, WorkerError> {
        self.enqueue_with_options(queue, args, EnqueueOptions::default())
            .await
    }

    /// Enqueue a job to run after `delay`
    pub async fn enqueue_in(
        &self,
        queue: &str,
        delay: Duration,
        args: Vec<Value>,
    ) -> Result<String, WorkerError> {
        let at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.enqueue_at(queue, at, args).await
    }

    /// Enqueue a job to run at `at`
    pub async fn enqueue_at(
        &self,
        queue: &str,
        at: DateTime<Utc>,
        args: Vec<Value>,
    ) -> Result<String, WorkerError> {
        self.enqueue_with_options(queue, args, EnqueueOptions::default().with_at(at))
            .await
    }

    pub async fn enqueue_with_options(
        &self,
        queue: &str,
        args: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<String, WorkerError> {
        let now = now_seconds();
        let at = options.at.map(epoch_seconds).filter(|at| *at > now);

        let record = JobRecord {
            jid: Uuid::new_v4().simple().to_string(),
            queue: Some(queue.to_string()),
            class: options.class,
            args,
            enqueued_at: Some(now),
            at,
            retry: options.retry,
            ..JobRecord::default()
        };
        let payload = record.encode()?;
        let store = self.config.store();

        match at {
            Some(at) => {
                store.zadd(&self.config.schedule_key(), at, &payload).await?;
                debug!(queue = %queue, jid = %record.jid, at, "Scheduled job");
            }
            None => {
                store.lpush(&self.config.queue_key(queue), &payload).await?;
                debug!(queue = %queue, jid = %record.jid, "Enqueued job");
            }
        }

        Ok(record.jid)
    }

    /// Jobs waiting on `queue`, not counting those in progress
    pub async fn queue_length(&self, queue: &str) -> Result<usize, StoreError> {
        self.config.store().llen(&self.config.queue_key(queue)).await
    }

    /// Jobs waiting on the schedule set
    pub async fn scheduled_length(&self) -> Result<usize, StoreError> {
        self.config.store().zcard(&self.config.schedule_key()).await
    }
}
