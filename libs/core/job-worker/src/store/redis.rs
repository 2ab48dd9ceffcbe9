use super::JobStore;
use crate::config::{ConnectionSettings, ConnectionTarget};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Redis backed [`JobStore`].
///
/// Non-blocking commands are spread round-robin over a small pool of
/// `ConnectionManager`s. Blocking pops go through [`JobStore::dedicated`],
/// which opens a connection of its own.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    pool: Arc<[ConnectionManager]>,
    next: Arc<AtomicUsize>,
}

impl RedisStore {
    /// Resolve the target, open the pool and verify it with PING
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self, StoreError> {
        let url = match &settings.target {
            ConnectionTarget::Server(addr) => settings.url_for(addr),
            ConnectionTarget::Sentinel { addrs, master_name } => {
                let master = resolve_master(addrs, master_name).await?;
                info!(master = %master_name, addr = %master, "Resolved Redis master via sentinel");
                settings.url_for(&master)
            }
        };

        let store = Self::from_client(Client::open(url)?, settings.pool_size).await?;

        let mut conn = store.connection();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(pool_size = settings.pool_size, "Connected to Redis");
        Ok(store)
    }

    /// Open `pool_size` managed connections on an existing client
    pub async fn from_client(client: Client, pool_size: usize) -> Result<Self, StoreError> {
        Self::open(client, pool_size, ConnectionManagerConfig::new()).await
    }

    async fn open(
        client: Client,
        pool_size: usize,
        config: ConnectionManagerConfig,
    ) -> Result<Self, StoreError> {
        let mut pool = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            pool.push(ConnectionManager::new_with_config(client.clone(), config.clone()).await?);
        }

        Ok(Self {
            client,
            pool: pool.into(),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[index].clone()
    }
}

/// Ask each sentinel in turn for the current master address
async fn resolve_master(addrs: &[String], master_name: &str) -> Result<String, StoreError> {
    for addr in addrs {
        let url = if addr.contains("://") {
            addr.clone()
        } else {
            format!("redis://{addr}")
        };

        let lookup = async {
            let client = Client::open(url.as_str())?;
            let mut conn = client.get_multiplexed_async_connection().await?;
            redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(master_name)
                .query_async::<Option<Vec<String>>>(&mut conn)
                .await
        };

        match lookup.await {
            Ok(Some(parts)) if parts.len() == 2 => return Ok(format!("{}:{}", parts[0], parts[1])),
            Ok(_) => warn!(sentinel = %addr, master = %master_name, "Sentinel does not know master"),
            Err(e) => warn!(sentinel = %addr, error = %e, "Sentinel lookup failed"),
        }
    }

    Err(StoreError::MasterNotFound {
        master: master_name.to_string(),
    })
}

#[async_trait]
impl JobStore for RedisStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: i64 = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        let value: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn lrem_last(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection();
        let removed: usize = redis::cmd("LREM")
            .arg(key)
            .arg(-1)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection();
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zfirst_due(&self, key: &str, max_score: f64) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score)
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(members.into_iter().next())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection();
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection();
        let len: usize = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn zrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection();
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    /// A single connection without a client-side response timeout: blocking
    /// pops must only end on the server's timeout, or a job Redis already
    /// moved to in-progress could have its reply discarded.
    async fn dedicated(&self) -> Result<Arc<dyn JobStore>, StoreError> {
        let config = ConnectionManagerConfig::new().set_response_timeout(None);
        let store = Self::open(self.client.clone(), 1, config).await?;
        Ok(Arc::new(store))
    }
}
