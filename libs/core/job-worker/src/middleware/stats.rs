use super::Middleware;
use crate::config::Config;
use crate::error::JobError;
use crate::handler::{Handler, JobHandler};
use crate::message::Message;
use crate::metrics::JobMetrics;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Counts processed and failed jobs.
///
/// Increments `<ns>stat:processed` / `<ns>stat:failed` plus a per-day key
/// (`<ns>stat:processed:2024-05-01`) and mirrors them as metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsJobs;

impl Middleware for StatsJobs {
    fn wrap(&self, queue: &str, config: &Config, next: Handler) -> Handler {
        Arc::new(Counted {
            config: config.clone(),
            metrics: JobMetrics::new(queue),
            next,
        })
    }
}

struct Counted {
    config: Config,
    metrics: JobMetrics,
    next: Handler,
}

impl Counted {
    async fn increment(&self, metric: &str) {
        let today = Utc::now().format("%Y-%m-%d");
        let keys = [
            self.config.stat_key(metric),
            self.config.stat_key(&format!("{metric}:{today}")),
        ];

        for key in keys {
            if let Err(e) = self.config.store().incr(&key).await {
                warn!(key = %key, error = %e, "Failed to update job stats");
            }
        }
    }
}

#[async_trait]
impl JobHandler for Counted {
    async fn perform(&self, message: &mut Message) -> Result<(), JobError> {
        let started = Instant::now();
        let result = self.next.perform(message).await;

        match &result {
            Ok(()) => {
                self.metrics.job_processed(started.elapsed());
                self.increment("processed").await;
            }
            Err(e) => {
                self.metrics.job_failed(e.is_panic());
                self.increment("failed").await;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::handler::job_fn;
    use crate::middleware::Middlewares;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_counts_processed_and_failed() {
        let store = MemoryStore::new();
        let config = Config::with_store(
            Options::new("1").with_namespace("prod"),
            Arc::new(store.clone()),
        )
        .unwrap();
        let chain = Middlewares::new().append(StatsJobs);

        let ok = chain.build(
            "q",
            &config,
            Arc::new(job_fn(|_: Message| async { Ok::<(), JobError>(()) })),
        );
        let failing = chain.build(
            "q",
            &config,
            Arc::new(job_fn(|_: Message| async {
                Err::<(), JobError>(JobError::new("boom"))
            })),
        );

        let mut message = Message::parse(r#"{"jid":"1","args":[]}"#).unwrap();
        ok.perform(&mut message).await.unwrap();
        ok.perform(&mut message).await.unwrap();
        assert!(failing.perform(&mut message).await.is_err());

        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(store.counter("prod:stat:processed").await, 2);
        assert_eq!(store.counter(&format!("prod:stat:processed:{today}")).await, 2);
        assert_eq!(store.counter("prod:stat:failed").await, 1);
        assert_eq!(store.counter(&format!("prod:stat:failed:{today}")).await, 1);
    }
}
