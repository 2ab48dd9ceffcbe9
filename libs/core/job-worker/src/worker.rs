//! Worker slots
//!
//! A worker is a long-lived task that runs one job at a time. While idle it
//! offers itself to its queue's fetcher; once a message arrives it runs the
//! middleware-wrapped handler, reports the message for acknowledgement and
//! goes back to offering.

use crate::error::JobError;
use crate::fetcher::Fetcher;
use crate::handler::Handler;
use crate::message::Message;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// A processed message that should be removed from its in-progress list
pub(crate) struct Acknowledgement {
    pub(crate) fetcher: Arc<Fetcher>,
    pub(crate) message: Message,
}

/// The job a worker slot is running
#[derive(Debug, Clone)]
pub struct InFlight {
    pub message: Message,
    pub started_at: DateTime<Utc>,
}

type Current = Arc<Mutex<Option<InFlight>>>;

/// Controls a running [`Worker`]
pub(crate) struct WorkerHandle {
    stop: mpsc::Sender<oneshot::Sender<()>>,
    current: Current,
}

impl WorkerHandle {
    /// Ask the worker to exit and wait until it has.
    ///
    /// A job that is already running is allowed to finish first.
    pub(crate) async fn quit(&self) {
        let (exited_tx, exited_rx) = oneshot::channel();
        if self.stop.send(exited_tx).await.is_ok() {
            let _ = exited_rx.await;
        }
    }

    pub(crate) fn in_flight(&self) -> Option<InFlight> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) struct Worker {
    queue: String,
    handler: Handler,
    fetcher: Arc<Fetcher>,
    acks: mpsc::UnboundedSender<Acknowledgement>,
    stop: mpsc::Receiver<oneshot::Sender<()>>,
    current: Current,
}

impl Worker {
    pub(crate) fn new(
        handler: Handler,
        fetcher: Arc<Fetcher>,
        acks: mpsc::UnboundedSender<Acknowledgement>,
    ) -> (Self, WorkerHandle) {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let current = Current::default();

        let worker = Self {
            queue: fetcher.queue().to_string(),
            handler,
            fetcher,
            acks,
            stop: stop_rx,
            current: current.clone(),
        };
        let handle = WorkerHandle {
            stop: stop_tx,
            current,
        };
        (worker, handle)
    }

    pub(crate) async fn work(mut self) {
        let ready = self.fetcher.ready();
        let mut delivery: Option<oneshot::Receiver<Message>> = None;
        let mut fetcher_gone = false;

        let exited = loop {
            tokio::select! {
                biased;

                exited = self.stop.recv() => break exited,

                received = async {
                    match delivery.as_mut() {
                        Some(rx) => rx.await,
                        None => std::future::pending().await,
                    }
                } => {
                    delivery = None;
                    match received {
                        Ok(message) => self.process(message).await,
                        // The fetcher dropped our offer, it only does that when stopping
                        Err(_) => fetcher_gone = self.fetcher.closed(),
                    }
                }

                permit = ready.reserve(), if delivery.is_none() && !fetcher_gone => {
                    match permit {
                        Ok(permit) => {
                            let (tx, rx) = oneshot::channel();
                            permit.send(tx);
                            delivery = Some(rx);
                        }
                        Err(_) => fetcher_gone = true,
                    }
                }
            }
        };

        // A message handed over just before the stop request still runs
        if let Some(mut rx) = delivery
            && let Ok(message) = rx.try_recv()
        {
            self.process(message).await;
        }

        debug!(queue = %self.queue, "Worker exited");
        if let Some(exited) = exited {
            let _ = exited.send(());
        }
    }

    async fn process(&self, mut message: Message) {
        self.set_current(Some(InFlight {
            message: message.clone(),
            started_at: Utc::now(),
        }));

        let outcome = AssertUnwindSafe(self.handler.perform(&mut message))
            .catch_unwind()
            .await;

        if let Err(payload) = outcome {
            let err = JobError::from_panic(payload.as_ref());
            error!(queue = %self.queue, jid = %message.jid(), error = %err, "Middleware panicked");
        }

        if message.ack() {
            let ack = Acknowledgement {
                fetcher: self.fetcher.clone(),
                message,
            };
            if self.acks.send(ack).is_err() {
                warn!(queue = %self.queue, "Acknowledgement channel closed, message stays in progress");
            }
        }

        self.set_current(None);
        let _ = self.fetcher.finished_work().try_send(());
    }

    fn set_current(&self, in_flight: Option<InFlight>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = in_flight;
    }
}
