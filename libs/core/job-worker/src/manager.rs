//! Process manager
//!
//! The [`Manager`] owns everything one process runs: a fetcher and a pool of
//! workers per registered queue, the scheduler, the signal listener and the
//! acknowledgement fan-in that routes processed messages back to the fetcher
//! that claimed them.
//!
//! # Example
//!
//! ```rust,ignore
//! use job_worker::{job_fn, JobError, Manager, Message, Options};
//! use std::sync::Arc;
//!
//! let manager = Manager::new(Options::from_env()?).await?;
//! manager
//!     .add_worker("mailers", 5, Arc::new(job_fn(|message: Message| async move {
//!         tracing::info!(jid = %message.jid(), "sending mail");
//!         Ok::<(), JobError>(())
//!     })), None)
//!     .await?;
//!
//! // Blocks until SIGINT/SIGTERM or `manager.stop()`
//! manager.run().await;
//! ```

use crate::config::{Config, Options};
use crate::dead::DeadSet;
use crate::error::{ConfigError, WorkerError};
use crate::fetcher::Fetcher;
use crate::handler::{Handler, PanicGuard};
use crate::middleware::Middlewares;
use crate::producer::Producer;
use crate::scheduler::Scheduler;
use crate::shutdown::shutdown_signal;
use crate::worker::{Acknowledgement, InFlight, Worker, WorkerHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Callback run before start or while draining
pub type Hook = Arc<dyn Fn() + Send + Sync>;

struct Registration {
    queue: String,
    concurrency: usize,
    handler: Handler,
    middlewares: Option<Middlewares>,
}

struct Pool {
    fetcher: Arc<Fetcher>,
    workers: Vec<WorkerHandle>,
}

struct Running {
    pools: Vec<Pool>,
    scheduler: Arc<Scheduler>,
    signal_stop: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    registrations: Vec<Registration>,
    before_start: Vec<Hook>,
    during_drain: Vec<Hook>,
    /// Set for the whole duration of `run`
    active: bool,
    /// Present from start until `stop` takes it
    running: Option<Running>,
}

struct Inner {
    id: String,
    config: Config,
    state: Mutex<State>,
}

/// Runs worker pools for the registered queues.
///
/// Cheap to clone; clones control the same process.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Validate `options` and connect to Redis
    pub async fn new(options: Options) -> Result<Self, WorkerError> {
        Ok(Self::with_config(Config::connect(options).await?))
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4().simple().to_string(),
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Identifies this manager in logs
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Register `queue` with `concurrency` worker slots.
    ///
    /// The handler is wrapped with `middlewares`, or with
    /// [`Middlewares::defaults`] when `None`. A concurrency of 0 is treated
    /// as 1. Each queue can be registered once, since its pool owns the
    /// queue's in-progress list; registrations take effect on the next
    /// [`Manager::run`].
    pub async fn add_worker(
        &self,
        queue: impl Into<String>,
        concurrency: usize,
        handler: Handler,
        middlewares: Option<Middlewares>,
    ) -> Result<(), ConfigError> {
        let queue = queue.into();

        let mut state = self.inner.state.lock().await;
        if state.registrations.iter().any(|r| r.queue == queue) {
            warn!(queue = %queue, "Queue is already registered");
            return Err(ConfigError::DuplicateQueue { queue });
        }

        state.registrations.push(Registration {
            queue,
            concurrency: concurrency.max(1),
            handler,
            middlewares,
        });
        Ok(())
    }

    /// Hooks run, in order, at the start of [`Manager::run`]
    pub async fn add_before_start_hooks(&self, hooks: impl IntoIterator<Item = Hook>) {
        self.inner.state.lock().await.before_start.extend(hooks);
    }

    /// Hooks run, in order, by [`Manager::stop`] once every queue and the
    /// scheduler have stopped
    pub async fn add_during_drain_hooks(&self, hooks: impl IntoIterator<Item = Hook>) {
        self.inner.state.lock().await.during_drain.extend(hooks);
    }

    /// Start every registered queue, the scheduler and the signal listener,
    /// then wait until [`Manager::stop`] has been called and everything has
    /// exited.
    ///
    /// Calling `run` while already running returns immediately.
    pub async fn run(&self) {
        let config = &self.inner.config;
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        {
            let mut state = self.inner.state.lock().await;
            if state.active {
                warn!(manager = %self.inner.id, "Manager is already running");
                return;
            }
            state.active = true;

            for hook in &state.before_start {
                hook();
            }

            let mut pools = Vec::with_capacity(state.registrations.len());
            for registration in &state.registrations {
                let pool = self.start_pool(registration, &ack_tx, &mut tasks).await;
                pools.push(pool);
            }

            let scheduler = Arc::new(Scheduler::new(config.clone()));
            tasks.spawn({
                let scheduler = scheduler.clone();
                async move { scheduler.run().await }
            });

            let (signal_stop, signal_rx) = oneshot::channel();
            tasks.spawn({
                let manager = self.clone();
                async move {
                    tokio::select! {
                        _ = shutdown_signal() => manager.stop().await,
                        _ = signal_rx => {}
                    }
                }
            });

            info!(
                manager = %self.inner.id,
                process_id = %config.process_id(),
                namespace = %config.namespace(),
                queues = pools.len(),
                "Manager started"
            );

            state.running = Some(Running {
                pools,
                scheduler,
                signal_stop,
            });
        }

        // Workers hold the remaining senders; the fan-in ends with them
        drop(ack_tx);
        let acks = tokio::spawn(acknowledge_all(ack_rx));

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(manager = %self.inner.id, error = %e, "Manager task failed");
            }
        }
        if let Err(e) = acks.await {
            error!(manager = %self.inner.id, error = %e, "Acknowledgement task failed");
        }

        let mut state = self.inner.state.lock().await;
        state.running = None;
        state.active = false;
        info!(manager = %self.inner.id, "Manager stopped");
    }

    /// Stop processing and let [`Manager::run`] return.
    ///
    /// Each queue's workers are stopped one after another, letting running
    /// jobs finish, then its fetcher. Afterwards the scheduler stops and the
    /// drain hooks run. A no-op when not running.
    pub async fn stop(&self) {
        let (running, drain_hooks) = {
            let mut state = self.inner.state.lock().await;
            let Some(running) = state.running.take() else {
                debug!(manager = %self.inner.id, "Stop requested but manager is not running");
                return;
            };
            (running, state.during_drain.clone())
        };

        info!(manager = %self.inner.id, "Stopping manager");

        for pool in &running.pools {
            for worker in &pool.workers {
                worker.quit().await;
            }
            pool.fetcher.close().await;
            debug!(queue = %pool.fetcher.queue(), "Queue stopped");
        }

        running.scheduler.quit().await;

        for hook in &drain_hooks {
            hook();
        }

        let _ = running.signal_stop.send(());
    }

    /// `true` between start and stop
    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.running.is_some()
    }

    /// Jobs currently being processed, by queue
    pub async fn in_progress(&self) -> HashMap<String, Vec<InFlight>> {
        let state = self.inner.state.lock().await;
        let Some(running) = &state.running else {
            return HashMap::new();
        };

        running
            .pools
            .iter()
            .map(|pool| {
                let jobs = pool
                    .workers
                    .iter()
                    .filter_map(WorkerHandle::in_flight)
                    .collect();
                (pool.fetcher.queue().to_string(), jobs)
            })
            .collect()
    }

    /// Key of the retry set
    pub fn retry_queue(&self) -> String {
        self.inner.config.retry_key()
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.inner.config.clone())
    }

    pub fn dead_set(&self) -> DeadSet {
        DeadSet::new(self.inner.config.clone())
    }

    async fn start_pool(
        &self,
        registration: &Registration,
        acks: &mpsc::UnboundedSender<Acknowledgement>,
        tasks: &mut JoinSet<()>,
    ) -> Pool {
        let config = &self.inner.config;
        let queue = registration.queue.as_str();

        let blocking = match config.store().dedicated().await {
            Ok(store) => store,
            Err(e) => {
                warn!(queue = %queue, error = %e, "No dedicated connection, blocking pops share the pool");
                config.store().clone()
            }
        };

        let fetcher = Arc::new(Fetcher::new(
            config,
            queue,
            blocking,
            registration.concurrency,
        ));
        tasks.spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch().await }
        });

        let chain = registration
            .middlewares
            .clone()
            .unwrap_or_else(Middlewares::defaults);
        let handler = chain.build(queue, config, PanicGuard::wrap(registration.handler.clone()));

        let workers = (0..registration.concurrency)
            .map(|_| {
                let (worker, handle) = Worker::new(handler.clone(), fetcher.clone(), acks.clone());
                tasks.spawn(worker.work());
                handle
            })
            .collect();

        info!(queue = %queue, concurrency = registration.concurrency, "Queue started");
        Pool { fetcher, workers }
    }
}

async fn acknowledge_all(mut acks: mpsc::UnboundedReceiver<Acknowledgement>) {
    while let Some(Acknowledgement { fetcher, message }) = acks.recv().await {
        if let Err(e) = fetcher.acknowledge(&message).await {
            error!(
                queue = %fetcher.queue(),
                jid = %message.jid(),
                error = %e,
                "Failed to acknowledge message, it will be replayed on restart"
            );
        }
    }
}
