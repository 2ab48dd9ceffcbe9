//! Jobs Worker Service
//!
//! Serves the queues listed in `JOBS_QUEUES` with a handler that logs every
//! job it receives.
//!
//! ## Architecture
//!
//! ```text
//! Redis list (<ns>queue:<name>)
//!   ↓ BRPOPLPUSH into <ns>queue:<name>:<pid>:inprogress
//! Fetcher → Worker slots (logging → retry → stats → handler)
//!   ↓ acknowledgement
//! LREM from the in-progress list
//!
//! Scheduler: <ns>goretry / <ns>schedule → queues, every poll interval
//! ```
//!
//! Configuration comes from the environment, see `Options::from_env` in the
//! job-worker crate and [`queues::queues_from_env`].

pub mod queues;
pub mod telemetry;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use job_worker::{Handler, JobError, JobHandler, Manager, Message, Options};
use std::sync::Arc;
use telemetry::Environment;
use tracing::info;

/// Logs each job's arguments and succeeds
pub struct LogArgs;

#[async_trait]
impl JobHandler for LogArgs {
    async fn perform(&self, message: &mut Message) -> Result<(), JobError> {
        info!(
            jid = %message.jid(),
            args = %joined_args(message),
            enqueued_at = ?message.enqueued_at(),
            "Received job"
        );
        Ok(())
    }
}

fn joined_args(message: &Message) -> String {
    message
        .args()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Run the jobs worker until SIGINT/SIGTERM
///
/// # Errors
///
/// Returns an error if the configuration is invalid or Redis cannot be
/// reached.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    telemetry::init_tracing(&environment);

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting jobs worker service"
    );

    let options = Options::from_env().wrap_err("Failed to load job options")?;
    let queues = queues::queues_from_env().wrap_err("Failed to parse JOBS_QUEUES")?;

    info!(
        process_id = %options.process_id,
        namespace = %options.namespace,
        queues = queues.len(),
        "Worker configuration loaded"
    );

    let manager = Manager::new(options)
        .await
        .wrap_err("Failed to connect to Redis")?;

    let handler: Handler = Arc::new(LogArgs);
    for queue in queues {
        manager
            .add_worker(queue.name, queue.concurrency, handler.clone(), None)
            .await
            .wrap_err("Invalid JOBS_QUEUES")?;
    }

    manager.run().await;
    info!("Jobs worker stopped");
    Ok(())
}
