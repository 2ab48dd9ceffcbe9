//! Job handlers
//!
//! A [`JobHandler`] runs one job. Middleware wraps handlers in other
//! handlers, so the same trait describes both the user code and every layer
//! around it.

use crate::error::JobError;
use crate::message::Message;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Runs a single job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, message: &mut Message) -> Result<(), JobError>;
}

/// Shared, type-erased handler
pub type Handler = Arc<dyn JobHandler>;

/// Handler built from an async closure, see [`job_fn`]
pub struct JobFn<F>(F);

/// Wrap an async closure as a [`JobHandler`].
///
/// The closure receives its own copy of the message.
///
/// ```
/// use job_worker::{job_fn, JobError, Message};
///
/// let handler = job_fn(|message: Message| async move {
///     let (to,): (String,) = message.args_as()?;
///     if to.is_empty() {
///         return Err(JobError::new("missing recipient"));
///     }
///     Ok::<(), JobError>(())
/// });
/// # let _ = handler;
/// ```
pub fn job_fn<F, Fut>(f: F) -> JobFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    JobFn(f)
}

#[async_trait]
impl<F, Fut> JobHandler for JobFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn perform(&self, message: &mut Message) -> Result<(), JobError> {
        (self.0)(message.clone()).await
    }
}

/// Converts a panic inside `inner` into [`JobError::Panicked`].
///
/// Sits directly around the user handler so every middleware layer sees
/// panics as ordinary errors.
pub(crate) struct PanicGuard {
    inner: Handler,
}

impl PanicGuard {
    pub(crate) fn wrap(inner: Handler) -> Handler {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl JobHandler for PanicGuard {
    async fn perform(&self, message: &mut Message) -> Result<(), JobError> {
        match AssertUnwindSafe(self.inner.perform(message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(JobError::from_panic(payload.as_ref())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message::parse(r#"{"jid":"1","args":["a"]}"#).unwrap()
    }

    #[tokio::test]
    async fn test_job_fn_receives_message() {
        let handler = job_fn(|message: Message| async move {
            assert_eq!(message.jid(), "1");
            Ok::<(), JobError>(())
        });
        assert!(handler.perform(&mut message()).await.is_ok());
    }

    #[tokio::test]
    async fn test_panic_guard_matches_returned_error() {
        let panicking = PanicGuard::wrap(Arc::new(job_fn(|message: Message| async move {
            if message.jid() == "1" {
                panic!("boom");
            }
            Ok::<(), JobError>(())
        })));
        let failing = PanicGuard::wrap(Arc::new(job_fn(|_: Message| async {
            Err::<(), JobError>(JobError::new("boom"))
        })));

        let panicked = panicking.perform(&mut message()).await.unwrap_err();
        let failed = failing.perform(&mut message()).await.unwrap_err();

        assert_eq!(panicked.to_string(), "boom");
        assert_eq!(panicked.to_string(), failed.to_string());
        assert!(panicked.is_panic());
    }

    #[tokio::test]
    async fn test_panic_guard_passes_success_through() {
        let handler = PanicGuard::wrap(Arc::new(job_fn(|_: Message| async {
            Ok::<(), JobError>(())
        })));
        assert!(handler.perform(&mut message()).await.is_ok());
    }
}
