//! Scheduled job poller
//!
//! Every poll interval the [`Scheduler`] moves due entries from the retry set
//! (`<ns>goretry`) and the schedule set (`<ns>schedule`) back onto their
//! queues. Entries are claimed one at a time with `ZREM`, so several
//! processes can poll the same sets and each entry is requeued once.

use crate::config::Config;
use crate::message::{JobRecord, now_seconds};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Exited,
}

pub(crate) struct Scheduler {
    config: Config,
    keys: [String; 2],
    stop: watch::Sender<bool>,
    phase: watch::Sender<Phase>,
}

impl Scheduler {
    pub(crate) fn new(config: Config) -> Self {
        let keys = [config.retry_key(), config.schedule_key()];
        Self {
            config,
            keys,
            stop: watch::Sender::new(false),
            phase: watch::Sender::new(Phase::Idle),
        }
    }

    /// Poll until [`Scheduler::quit`] is called
    pub(crate) async fn run(&self) {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Idle {
                *phase = Phase::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        info!(interval_secs = self.config.poll_interval().as_secs(), "Scheduler started");
        let mut stop = self.stop.subscribe();

        loop {
            if *stop.borrow() {
                break;
            }

            self.poll().await;

            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.phase.send_replace(Phase::Exited);
        info!("Scheduler stopped");
    }

    /// Requeue everything that is due right now
    pub(crate) async fn poll(&self) {
        let now = now_seconds();
        for key in &self.keys {
            self.requeue_due(key, now).await;
        }
    }

    /// Signal the loop to stop and wait for it to exit
    pub(crate) async fn quit(&self) {
        self.stop.send_replace(true);
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Idle {
                *phase = Phase::Exited;
                true
            } else {
                false
            }
        });

        let mut phase = self.phase.subscribe();
        let _ = phase.wait_for(|p| *p == Phase::Exited).await;
    }

    async fn requeue_due(&self, key: &str, now: f64) {
        let store = self.config.store();
        loop {
            let member = match store.zfirst_due(key, now).await {
                Ok(Some(member)) => member,
                Ok(None) => return,
                Err(e) => {
                    warn!(set = %key, error = %e, "Failed to read scheduled set");
                    return;
                }
            };

            match store.zrem(key, &member).await {
                Ok(true) => self.requeue(key, &member).await,
                Ok(false) => debug!(set = %key, "Scheduled job claimed by another poller"),
                Err(e) => {
                    warn!(set = %key, error = %e, "Failed to claim scheduled job");
                    return;
                }
            }
        }
    }

    async fn requeue(&self, key: &str, member: &str) {
        let mut record = match JobRecord::decode(member) {
            Ok(record) => record,
            Err(e) => {
                error!(set = %key, payload = %member, error = %e, "Dropping malformed scheduled job");
                return;
            }
        };

        let Some(queue) = record.queue.as_deref() else {
            error!(set = %key, jid = %record.jid, "Dropping scheduled job without a queue");
            return;
        };
        let queue_key = self.config.queue_key(self.config.strip_namespace(queue));

        record.enqueued_at = Some(now_seconds());
        let payload = match record.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(set = %key, jid = %record.jid, error = %e, "Dropping unencodable scheduled job");
                return;
            }
        };

        let store = self.config.store();
        match store.lpush(&queue_key, &payload).await {
            Ok(()) => debug!(set = %key, queue = %queue_key, jid = %record.jid, "Requeued scheduled job"),
            Err(e) => {
                warn!(set = %key, jid = %record.jid, error = %e, "Failed to requeue, returning job to its set");
                if let Err(e) = store.zadd(key, now_seconds(), member).await {
                    error!(set = %key, payload = %member, error = %e, "Lost scheduled job");
                }
            }
        }
    }
}
