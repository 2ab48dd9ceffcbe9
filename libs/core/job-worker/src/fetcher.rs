//! Queue fetcher
//!
//! One [`Fetcher`] per registered queue moves messages from the queue into
//! this process's in-progress list and hands them to idle workers.
//!
//! Hand-off protocol: an idle worker sends a one-shot reply channel (an
//! offer) on the fetcher's ready channel. The fetcher only claims a message
//! from the store once it holds an offer, and then answers that offer with
//! the message. A slot therefore never has more than one undelivered message.
//!
//! Lifecycle: `Idle → Recovering → Polling → Closed`. While recovering, the
//! fetcher replays what an earlier run of the same process id left in the
//! in-progress list, oldest claim first, before it claims anything new.

use crate::config::Config;
use crate::error::StoreError;
use crate::message::Message;
use crate::metrics::JobMetrics;
use crate::store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Upper bound on one blocking pop; also bounds how long a stop request waits
const FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after an empty pop, cut short by a worker finishing a job
const EMPTY_QUEUE_PAUSE: Duration = Duration::from_millis(500);

const MAX_STORE_BACKOFF_EXP: u32 = 4;

/// A worker's request for one message
pub(crate) type Offer = oneshot::Sender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetcherState {
    Idle,
    Recovering,
    Polling,
    Closed,
}

/// Returned by the internal steps once a stop has been requested
struct Stopped;

pub(crate) struct Fetcher {
    queue: String,
    queue_key: String,
    in_progress_key: String,
    /// Shared store, used for acknowledgements and clean-up
    store: Arc<dyn JobStore>,
    /// Store used for blocking pops
    blocking: Arc<dyn JobStore>,
    metrics: JobMetrics,
    ready_tx: mpsc::Sender<Offer>,
    ready_rx: Mutex<mpsc::Receiver<Offer>>,
    finished_tx: mpsc::Sender<()>,
    finished_rx: Mutex<mpsc::Receiver<()>>,
    stop: watch::Sender<bool>,
    state: watch::Sender<FetcherState>,
}

impl Fetcher {
    /// Create a fetcher for `queue` serving up to `slots` workers.
    ///
    /// `blocking` carries the blocking pops; it should not be shared with
    /// other users (see [`JobStore::dedicated`]).
    pub(crate) fn new(config: &Config, queue: &str, blocking: Arc<dyn JobStore>, slots: usize) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(slots.max(1));
        let (finished_tx, finished_rx) = mpsc::channel(1);

        Self {
            queue: queue.to_string(),
            queue_key: config.queue_key(queue),
            in_progress_key: config.in_progress_key(queue),
            store: config.store().clone(),
            blocking,
            metrics: JobMetrics::new(queue),
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
            finished_tx,
            finished_rx: Mutex::new(finished_rx),
            stop: watch::Sender::new(false),
            state: watch::Sender::new(FetcherState::Idle),
        }
    }

    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn state(&self) -> FetcherState {
        *self.state.borrow()
    }

    /// `true` once a close was requested or the fetch loop has ended
    pub(crate) fn closed(&self) -> bool {
        *self.stop.borrow() || self.state() == FetcherState::Closed
    }

    /// Channel on which idle workers post their offers
    pub(crate) fn ready(&self) -> mpsc::Sender<Offer> {
        self.ready_tx.clone()
    }

    /// Best-effort "a job just finished" hint. Sends never block; a full
    /// channel simply drops the hint.
    pub(crate) fn finished_work(&self) -> &mpsc::Sender<()> {
        &self.finished_tx
    }

    /// Run the fetch loop until [`Fetcher::close`] is called.
    ///
    /// Returns immediately if the fetcher already ran or was closed.
    pub(crate) async fn fetch(&self) {
        let started = self.state.send_if_modified(|state| {
            if *state == FetcherState::Idle {
                *state = FetcherState::Recovering;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        let mut ready = self.ready_rx.lock().await;
        let mut finished = self.finished_rx.lock().await;
        let mut stop = self.stop.subscribe();

        info!(queue = %self.queue, in_progress = %self.in_progress_key, "Fetcher started");

        if self.recover(&mut ready, &mut stop).await.is_ok() {
            self.state.send_replace(FetcherState::Polling);
            let _ = self.poll(&mut ready, &mut finished, &mut stop).await;
        }

        self.state.send_replace(FetcherState::Closed);
        info!(queue = %self.queue, "Fetcher closed");
    }

    /// Remove a processed message from the in-progress list.
    ///
    /// Removes one entry equal to the message's original payload. Acknowledging
    /// the same message twice is harmless.
    pub(crate) async fn acknowledge(&self, message: &Message) -> Result<(), StoreError> {
        let removed = self
            .store
            .lrem_last(&self.in_progress_key, message.payload())
            .await?;

        if removed == 0 {
            debug!(queue = %self.queue, jid = %message.jid(), "Message was no longer in progress");
        }
        Ok(())
    }

    /// Stop fetching and wait until the loop has exited.
    ///
    /// No message is handed to a worker after this returns. Messages claimed
    /// but not yet delivered stay in the in-progress list.
    pub(crate) async fn close(&self) {
        self.stop.send_replace(true);
        self.state.send_if_modified(|state| {
            if *state == FetcherState::Idle {
                *state = FetcherState::Closed;
                true
            } else {
                false
            }
        });

        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == FetcherState::Closed).await;
    }

    async fn recover(
        &self,
        ready: &mut mpsc::Receiver<Offer>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), Stopped> {
        let mut failures = 0;
        let leftovers = loop {
            match self.store.lrange_all(&self.in_progress_key).await {
                Ok(values) => break values,
                Err(e) => {
                    failures += 1;
                    warn!(queue = %self.queue, error = %e, "Failed to read in-progress list");
                    pause(stop, store_backoff(failures)).await?;
                }
            }
        };

        if leftovers.is_empty() {
            return Ok(());
        }
        info!(queue = %self.queue, count = leftovers.len(), "Recovering in-progress messages");

        // Head first: the oldest claim is at the tail
        for payload in leftovers.into_iter().rev() {
            match Message::parse(payload.as_str()) {
                Ok(message) => {
                    self.deliver(ready, stop, message).await?;
                    self.metrics.job_recovered();
                }
                Err(e) => self.drop_malformed(&payload, &e.to_string()).await,
            }
        }
        Ok(())
    }

    async fn poll(
        &self,
        ready: &mut mpsc::Receiver<Offer>,
        finished: &mut mpsc::Receiver<()>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), Stopped> {
        loop {
            let offer = next_offer(ready, stop).await?;
            let message = self.claim(finished, stop).await?;

            if let Err(message) = offer.send(message) {
                // The slot went away while we were claiming
                self.deliver(ready, stop, message).await?;
            }
        }
    }

    /// Move one message from the queue to the in-progress list
    async fn claim(
        &self,
        finished: &mut mpsc::Receiver<()>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Message, Stopped> {
        let mut failures = 0;
        loop {
            if *stop.borrow() {
                return Err(Stopped);
            }

            match self
                .blocking
                .brpoplpush(&self.queue_key, &self.in_progress_key, FETCH_TIMEOUT)
                .await
            {
                Ok(Some(payload)) => {
                    failures = 0;
                    match Message::parse(payload.as_str()) {
                        Ok(message) => return Ok(message),
                        Err(e) => self.drop_malformed(&payload, &e.to_string()).await,
                    }
                }
                Ok(None) => {
                    failures = 0;
                    idle(finished, stop).await?;
                }
                Err(e) if e.is_timeout() => {
                    debug!(queue = %self.queue, "Blocking pop timed out");
                    idle(finished, stop).await?;
                }
                Err(e) => {
                    failures += 1;
                    warn!(queue = %self.queue, error = %e, failures, "Failed to fetch from queue");
                    pause(stop, store_backoff(failures)).await?;
                }
            }
        }
    }

    /// Hand `message` to the next idle worker
    async fn deliver(
        &self,
        ready: &mut mpsc::Receiver<Offer>,
        stop: &mut watch::Receiver<bool>,
        mut message: Message,
    ) -> Result<(), Stopped> {
        loop {
            let offer = next_offer(ready, stop).await?;
            match offer.send(message) {
                Ok(()) => return Ok(()),
                Err(returned) => message = returned,
            }
        }
    }

    async fn drop_malformed(&self, payload: &str, reason: &str) {
        error!(queue = %self.queue, payload = %payload, error = %reason, "Dropping malformed message");
        self.metrics.payload_dropped();

        if let Err(e) = self.store.lrem_last(&self.in_progress_key, payload).await {
            warn!(queue = %self.queue, error = %e, "Failed to remove malformed message");
        }
    }
}

async fn next_offer(
    ready: &mut mpsc::Receiver<Offer>,
    stop: &mut watch::Receiver<bool>,
) -> Result<Offer, Stopped> {
    tokio::select! {
        biased;
        _ = stop.wait_for(|stopped| *stopped) => Err(Stopped),
        offer = ready.recv() => offer.ok_or(Stopped),
    }
}

/// Wait out an empty queue, waking early when a worker finishes a job
async fn idle(
    finished: &mut mpsc::Receiver<()>,
    stop: &mut watch::Receiver<bool>,
) -> Result<(), Stopped> {
    tokio::select! {
        _ = stop.wait_for(|stopped| *stopped) => Err(Stopped),
        _ = finished.recv() => Ok(()),
        _ = tokio::time::sleep(EMPTY_QUEUE_PAUSE) => Ok(()),
    }
}

async fn pause(stop: &mut watch::Receiver<bool>, duration: Duration) -> Result<(), Stopped> {
    tokio::select! {
        _ = stop.wait_for(|stopped| *stopped) => Err(Stopped),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// 1s, 2s, 4s, 8s, then 16s for every further consecutive failure
fn store_backoff(failures: u32) -> Duration {
    Duration::from_secs(1 << failures.saturating_sub(1).min(MAX_STORE_BACKOFF_EXP))
}
