//! Middleware chains
//!
//! A [`Middleware`] wraps the next handler in a new one. A [`Middlewares`]
//! chain is applied first-to-last from the outside in: for `[A, B, C]` and a
//! handler `H`, a job runs `A → B → C → H` and returns `H → C → B → A`.
//!
//! Chains are values. [`Middlewares::append`] and [`Middlewares::prepend`]
//! return a new chain and leave the receiver untouched, so a chain can be
//! shared between queues and extended per queue.

mod logging;
mod retry;
mod stats;

pub use logging::LogJobs;
pub use retry::{RetryJobs, backoff_secs};
pub use stats::StatsJobs;

use crate::config::Config;
use crate::handler::Handler;
use std::sync::Arc;

/// Wraps a handler with cross-cutting behaviour
pub trait Middleware: Send + Sync {
    /// Build the handler for `queue` that runs around `next`
    fn wrap(&self, queue: &str, config: &Config, next: Handler) -> Handler;
}

impl<F> Middleware for F
where
    F: Fn(&str, &Config, Handler) -> Handler + Send + Sync,
{
    fn wrap(&self, queue: &str, config: &Config, next: Handler) -> Handler {
        self(queue, config, next)
    }
}

/// Ordered, immutable middleware chain
#[derive(Clone, Default)]
pub struct Middlewares {
    layers: Vec<Arc<dyn Middleware>>,
}

impl Middlewares {
    /// An empty chain; jobs go straight to the handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Logging, then retry, then statistics
    pub fn defaults() -> Self {
        Self::new()
            .append(LogJobs)
            .append(RetryJobs)
            .append(StatsJobs)
    }

    /// A new chain with `middleware` as the innermost layer
    pub fn append(&self, middleware: impl Middleware + 'static) -> Self {
        let mut layers = self.layers.clone();
        layers.push(Arc::new(middleware));
        Self { layers }
    }

    /// A new chain with `middleware` as the outermost layer
    pub fn prepend(&self, middleware: impl Middleware + 'static) -> Self {
        let mut layers = Vec::with_capacity(self.layers.len() + 1);
        layers.push(Arc::new(middleware) as Arc<dyn Middleware>);
        layers.extend(self.layers.iter().cloned());
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wrap `handler` with every layer, first layer outermost
    pub fn build(&self, queue: &str, config: &Config, handler: Handler) -> Handler {
        self.layers
            .iter()
            .rev()
            .fold(handler, |next, layer| layer.wrap(queue, config, next))
    }
}
