use super::Middleware;
use crate::config::Config;
use crate::error::JobError;
use crate::handler::{Handler, JobHandler};
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, error, info, info_span};

/// Logs the start and end of every job inside a `job` span
#[derive(Debug, Clone, Copy, Default)]
pub struct LogJobs;

impl Middleware for LogJobs {
    fn wrap(&self, queue: &str, _config: &Config, next: Handler) -> Handler {
        Arc::new(Logged {
            queue: queue.to_string(),
            next,
        })
    }
}

struct Logged {
    queue: String,
    next: Handler,
}

#[async_trait]
impl JobHandler for Logged {
    async fn perform(&self, message: &mut Message) -> Result<(), JobError> {
        let span = info_span!("job", queue = %self.queue, jid = %message.jid());

        async {
            let started = Instant::now();
            info!("start");
            debug!(args = ?message.args(), "job arguments");

            let result = self.next.perform(message).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(()) => info!(elapsed_ms, "done"),
                Err(e) => error!(elapsed_ms, error = %e, panicked = e.is_panic(), "fail"),
            }
            result
        }
        .instrument(span)
        .await
    }
}
