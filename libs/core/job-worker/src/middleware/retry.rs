use super::Middleware;
use crate::config::Config;
use crate::dead::DeadSet;
use crate::error::{JobError, WorkerError};
use crate::handler::{Handler, JobHandler};
use crate::message::{JobRecord, Message, now_seconds};
use crate::metrics::JobMetrics;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};

const TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Seconds to wait before retry number `retry_count`.
///
/// `count⁴ + 15 + rand(0..30) × (count + 1)`: about 15 seconds for the
/// first retry, growing to roughly four days by the 25th.
pub fn backoff_secs(retry_count: u32) -> u64 {
    let count = u64::from(retry_count);
    let jitter = rand::random::<u64>() % 30;
    count.saturating_pow(4) + 15 + jitter * (count + 1)
}

/// Puts failed jobs on the retry set.
///
/// A failed job whose policy allows another attempt is re-encoded with its
/// retry bookkeeping and added to `<ns>goretry`, due after
/// [`backoff_secs`]. A job that has used up its retries goes to the dead
/// set; a job without a retry policy is dropped. The error is always passed
/// on to the caller.
///
/// A job sent for another attempt is not acknowledged: it stays in the
/// in-progress list alongside its retry-set copy. Dropped and buried jobs
/// report through and are acknowledged, unless burying fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryJobs;

impl Middleware for RetryJobs {
    fn wrap(&self, queue: &str, config: &Config, next: Handler) -> Handler {
        Arc::new(Retrying {
            queue: config.namespaced(queue),
            config: config.clone(),
            dead: DeadSet::new(config.clone()),
            metrics: JobMetrics::new(queue),
            next,
        })
    }
}

struct Retrying {
    /// Namespaced queue name recorded on retried jobs
    queue: String,
    config: Config,
    dead: DeadSet,
    metrics: JobMetrics,
    next: Handler,
}

enum Decision {
    Retry,
    Exhausted,
    Drop,
}

fn decide(message: &Message) -> Decision {
    let Some(max) = message.retry().max_retries() else {
        return Decision::Drop;
    };
    if message.retry_count().unwrap_or(0) < max {
        Decision::Retry
    } else {
        Decision::Exhausted
    }
}

/// Copy of the job carrying the failure and the next retry count
fn failed_record(message: &Message, queue: &str, error: &JobError) -> JobRecord {
    let now = Utc::now().format(TIME_LAYOUT).to_string();
    let mut record = message.record().clone();

    record.queue = Some(queue.to_string());
    record.error_message = Some(error.to_string());
    record.retry_count = Some(match record.retry_count {
        None => {
            record.failed_at = Some(now);
            0
        }
        Some(count) => {
            record.retried_at = Some(now);
            count + 1
        }
    });
    record
}

impl Retrying {
    async fn schedule_retry(&self, record: &JobRecord) -> Result<u64, WorkerError> {
        let retry_count = record.retry_count.unwrap_or(0);
        let delay = backoff_secs(retry_count);
        let payload = record.encode()?;

        self.config
            .store()
            .zadd(
                &self.config.retry_key(),
                now_seconds() + delay as f64,
                &payload,
            )
            .await?;
        Ok(delay)
    }
}

#[async_trait]
impl JobHandler for Retrying {
    async fn perform(&self, message: &mut Message) -> Result<(), JobError> {
        let result = self.next.perform(message).await;
        let Err(err) = &result else {
            return result;
        };

        match decide(message) {
            Decision::Drop => {}
            Decision::Retry => {
                // Mid-retry jobs stay in progress; only exhausted or unretried ones ack
                message.suppress_ack();
                let record = failed_record(message, &self.queue, err);
                match self.schedule_retry(&record).await {
                    Ok(delay) => {
                        self.metrics.job_retried();
                        info!(
                            jid = %message.jid(),
                            retry_count = record.retry_count.unwrap_or(0),
                            delay_secs = delay,
                            "Scheduled retry"
                        );
                    }
                    Err(e) => {
                        error!(jid = %message.jid(), error = %e, "Could not schedule retry, keeping job in progress");
                    }
                }
            }
            Decision::Exhausted => {
                let mut record = message.record().clone();
                record.queue = Some(self.queue.clone());
                record.error_message = Some(err.to_string());

                match self.dead.bury(&record).await {
                    Ok(()) => self.metrics.job_dead(),
                    Err(e) => {
                        message.suppress_ack();
                        error!(jid = %message.jid(), error = %e, "Could not bury job, keeping job in progress");
                    }
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::error::StoreError;
    use crate::handler::job_fn;
    use crate::middleware::Middlewares;
    use crate::store::{JobStore, MemoryStore, MockJobStore};
    use serde_json::Value;

    fn config(store: Arc<dyn JobStore>) -> Config {
        Config::with_store(Options::new("1").with_namespace("prod"), store).unwrap()
    }

    fn failing() -> Handler {
        Arc::new(job_fn(|_: Message| async {
            Err::<(), JobError>(JobError::new("boom"))
        }))
    }

    fn retrying(config: &Config) -> Handler {
        Middlewares::new().append(RetryJobs).build("myqueue", config, failing())
    }

    #[test]
    fn test_backoff_bounds() {
        for count in [0_u32, 1, 5, 25] {
            let delay = backoff_secs(count);
            let base = u64::from(count).pow(4) + 15;
            assert!(delay >= base);
            assert!(delay < base + 30 * (u64::from(count) + 1));
        }
    }

    #[tokio::test]
    async fn test_first_failure_goes_to_retry_set() {
        let store = MemoryStore::new();
        let config = config(Arc::new(store.clone()));
        let mut message = Message::parse(r#"{"jid":"1","args":["a"],"retry":true}"#).unwrap();

        let err = retrying(&config).perform(&mut message).await.unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert!(!message.ack());

        let members = store.zrange("prod:goretry", 0, 10).await.unwrap();
        assert_eq!(members.len(), 1);
        let retried: Value = serde_json::from_str(&members[0]).unwrap();
        assert_eq!(retried["queue"], "prod:myqueue");
        assert_eq!(retried["error_message"], "boom");
        assert_eq!(retried["retry_count"], 0);
        assert!(retried["failed_at"].is_string());
        assert_eq!(retried["args"], serde_json::json!(["a"]));

        let due = store.score("prod:goretry", &members[0]).await.unwrap();
        assert!(due >= now_seconds() + 14.0);
    }

    #[tokio::test]
    async fn test_later_failures_increment_retry_count() {
        let store = MemoryStore::new();
        let config = config(Arc::new(store.clone()));
        let mut message =
            Message::parse(r#"{"jid":"1","args":[],"retry":5,"retry_count":2}"#).unwrap();

        retrying(&config).perform(&mut message).await.unwrap_err();

        let members = store.zrange("prod:goretry", 0, 10).await.unwrap();
        let retried: Value = serde_json::from_str(&members[0]).unwrap();
        assert_eq!(retried["retry_count"], 3);
        assert!(retried["retried_at"].is_string());
    }

    #[tokio::test]
    async fn test_without_retry_policy_job_is_dropped() {
        let store = MemoryStore::new();
        let config = config(Arc::new(store.clone()));
        let mut message = Message::parse(r#"{"jid":"1","args":[]}"#).unwrap();

        retrying(&config).perform(&mut message).await.unwrap_err();

        assert!(message.ack());
        assert_eq!(store.zcard("prod:goretry").await.unwrap(), 0);
        assert_eq!(store.zcard("prod:dead").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_job_is_buried() {
        let store = MemoryStore::new();
        let config = config(Arc::new(store.clone()));
        let mut message =
            Message::parse(r#"{"jid":"1","args":[],"retry":2,"retry_count":2}"#).unwrap();

        retrying(&config).perform(&mut message).await.unwrap_err();

        assert!(message.ack());
        assert_eq!(store.zcard("prod:goretry").await.unwrap(), 0);
        let dead = DeadSet::new(config).list(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_success_is_untouched() {
        let store = MemoryStore::new();
        let config = config(Arc::new(store.clone()));
        let handler = Middlewares::new().append(RetryJobs).build(
            "myqueue",
            &config,
            Arc::new(job_fn(|_: Message| async { Ok::<(), JobError>(()) })),
        );
        let mut message = Message::parse(r#"{"jid":"1","args":[],"retry":true}"#).unwrap();

        handler.perform(&mut message).await.unwrap();
        assert_eq!(store.zcard("prod:goretry").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_suppresses_ack() {
        let mut store = MockJobStore::new();
        store
            .expect_zadd()
            .times(1)
            .returning(|_, _, _| Err(StoreError::Backend("down".into())));

        let config = config(Arc::new(store));
        let mut message = Message::parse(r#"{"jid":"1","args":[],"retry":true}"#).unwrap();

        let err = retrying(&config).perform(&mut message).await.unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert!(!message.ack());
    }

    #[tokio::test]
    async fn test_bury_failure_suppresses_ack() {
        let mut store = MockJobStore::new();
        store
            .expect_zadd()
            .times(1)
            .returning(|key, _, _| {
                assert_eq!(key, "prod:dead");
                Err(StoreError::Backend("down".into()))
            });

        let config = config(Arc::new(store));
        let mut message =
            Message::parse(r#"{"jid":"1","args":[],"retry":1,"retry_count":1}"#).unwrap();

        retrying(&config).perform(&mut message).await.unwrap_err();
        assert!(!message.ack());
    }
}
