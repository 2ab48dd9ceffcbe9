//! Job Worker
//!
//! A Redis-backed background job engine with at-least-once delivery.
//!
//! ## Features
//!
//! - **Crash recovery**: claimed jobs live in a per-process in-progress list
//!   until acknowledged and are replayed when the same process id restarts
//! - **Middleware**: logging, retry with backoff and stats by default,
//!   composable per queue
//! - **Retries and scheduling**: failed jobs and future jobs wait in sorted
//!   sets and are requeued by the scheduler when due
//! - **Dead set**: jobs that run out of retries are kept for inspection
//! - **Graceful shutdown**: SIGINT/SIGTERM let running jobs finish
//!
//! ## Example
//!
//! ```ignore
//! use job_worker::{job_fn, JobError, Manager, Message, Options};
//! use std::sync::Arc;
//!
//! let manager = Manager::new(Options::new("worker-1").with_server_addr("localhost:6379")).await?;
//!
//! manager
//!     .add_worker("mailers", 5, Arc::new(job_fn(|message: Message| async move {
//!         let (to,): (String,) = message.args_as()?;
//!         send_mail(&to).await.map_err(|e| JobError::new(e.to_string()))
//!     })), None)
//!     .await?;
//!
//! manager.producer().enqueue("mailers", vec!["user@example.com".into()]).await?;
//! manager.run().await;
//! ```
//!
//! ## Keys
//!
//! With namespace `prod` and process id `1`:
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `prod:queue:<q>` | list | jobs waiting on queue `q` |
//! | `prod:queue:<q>:1:inprogress` | list | jobs claimed by process `1` |
//! | `prod:goretry` | sorted set | failed jobs, scored by retry time |
//! | `prod:schedule` | sorted set | future jobs, scored by run time |
//! | `prod:dead` | sorted set | jobs out of retries |
//! | `prod:stat:processed`, `prod:stat:failed` | counter | totals, plus `:<yyyy-mm-dd>` per day |

mod config;
mod dead;
mod error;
mod fetcher;
mod handler;
mod manager;
pub mod message;
pub mod metrics;
pub mod middleware;
mod producer;
mod scheduler;
mod shutdown;
pub mod store;
mod worker;

pub use config::{
    Config, ConnectionSettings, ConnectionTarget, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_POOL_SIZE,
    Options,
};
pub use dead::DeadSet;
pub use error::{ConfigError, JobError, MessageError, Result, StoreError, WorkerError};
pub use handler::{Handler, JobFn, JobHandler, job_fn};
pub use manager::{Hook, Manager};
pub use message::{DEFAULT_MAX_RETRY, JobRecord, Message, Retry};
pub use metrics::JobMetrics;
pub use middleware::{LogJobs, Middleware, Middlewares, RetryJobs, StatsJobs};
pub use producer::{EnqueueOptions, Producer};
pub use shutdown::shutdown_signal;
pub use store::{JobStore, MemoryStore, RedisStore};
pub use worker::InFlight;
