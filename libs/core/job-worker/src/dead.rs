//! Dead set
//!
//! Jobs whose retries are exhausted end up in the `<ns>dead` sorted set,
//! scored by the time they died.

use crate::config::Config;
use crate::error::{StoreError, WorkerError};
use crate::message::{JobRecord, now_seconds};
use tracing::{info, warn};

/// Handle on the dead set of one namespace
#[derive(Debug, Clone)]
pub struct DeadSet {
    config: Config,
}

impl DeadSet {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn key(&self) -> String {
        self.config.dead_key()
    }

    /// Add a job to the dead set
    pub async fn bury(&self, record: &JobRecord) -> Result<(), WorkerError> {
        let payload = record.encode()?;
        self.config
            .store()
            .zadd(&self.key(), now_seconds(), &payload)
            .await?;

        info!(
            jid = %record.jid,
            retry_count = ?record.retry_count,
            error = record.error_message.as_deref().unwrap_or_default(),
            "Moved job to dead set"
        );
        Ok(())
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.config.store().zcard(&self.key()).await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Oldest `count` dead jobs. Entries that fail to decode are skipped.
    pub async fn list(&self, count: usize) -> Result<Vec<JobRecord>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let members = self.config.store().zrange(&self.key(), 0, count - 1).await?;
        Ok(members
            .iter()
            .filter_map(|member| match JobRecord::decode(member) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable dead job");
                    None
                }
            })
            .collect())
    }

    /// Drop every dead job
    pub async fn purge(&self) -> Result<(), StoreError> {
        self.config.store().del(&self.key()).await
    }
}
