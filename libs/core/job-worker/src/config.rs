//! Engine configuration
//!
//! [`Options`] is what callers fill in (directly or from the environment);
//! [`Config`] is the validated, immutable value shared by every component.
//! Validation never touches the network.

use crate::error::{ConfigError, WorkerError};
use crate::store::{JobStore, RedisStore};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Default seconds between scheduler ticks
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Default number of pooled store connections
pub const DEFAULT_POOL_SIZE: usize = 1;

const RETRY_KEY: &str = "goretry";
const SCHEDULED_JOBS_KEY: &str = "schedule";
const DEAD_KEY: &str = "dead";

/// User supplied engine options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Identifies this instance; scopes the in-progress lists it owns
    pub process_id: String,

    /// Key prefix, a trailing `:` is added when non-empty
    pub namespace: String,

    /// Scheduler tick in seconds, 0 means the default
    pub poll_interval_secs: u64,

    /// `host:port` of a single Redis server, optionally with a scheme
    pub server_addr: Option<String>,

    /// `host:port` of each sentinel
    pub sentinel_addrs: Vec<String>,

    /// Master name monitored by the sentinels
    pub master_name: Option<String>,

    /// Pooled connections for non-blocking commands, 0 means the default
    pub pool_size: usize,

    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<i64>,
}

impl Options {
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            ..Self::default()
        }
    }

    /// Load options from the environment.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `JOBS_PROCESS_ID` | `process_id` |
    /// | `JOBS_NAMESPACE` | `namespace` |
    /// | `JOBS_POLL_INTERVAL` | `poll_interval_secs` |
    /// | `REDIS_URL` or `REDIS_HOST` | `server_addr` |
    /// | `REDIS_SENTINELS` (comma separated) | `sentinel_addrs` |
    /// | `REDIS_MASTER_NAME` | `master_name` |
    /// | `REDIS_POOL_SIZE` | `pool_size` |
    /// | `REDIS_USERNAME`, `REDIS_PASSWORD`, `REDIS_DATABASE` | credentials and db |
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            process_id: env_or_default("JOBS_PROCESS_ID", ""),
            namespace: env_or_default("JOBS_NAMESPACE", ""),
            poll_interval_secs: env_parse("JOBS_POLL_INTERVAL")?
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            server_addr: env_optional("REDIS_URL").or_else(|| env_optional("REDIS_HOST")),
            sentinel_addrs: env_optional("REDIS_SENTINELS")
                .map(|addrs| split_addrs(&addrs))
                .unwrap_or_default(),
            master_name: env_optional("REDIS_MASTER_NAME"),
            pool_size: env_parse("REDIS_POOL_SIZE")?.unwrap_or(DEFAULT_POOL_SIZE),
            username: env_optional("REDIS_USERNAME"),
            password: env_optional("REDIS_PASSWORD"),
            database: env_parse("REDIS_DATABASE")?,
        })
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn with_server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = Some(addr.into());
        self
    }

    /// Set sentinel addresses from a comma separated list
    pub fn with_sentinels(mut self, addrs: &str) -> Self {
        self.sentinel_addrs = split_addrs(addrs);
        self
    }

    pub fn with_master_name(mut self, name: impl Into<String>) -> Self {
        self.master_name = Some(name.into());
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_database(mut self, database: i64) -> Self {
        self.database = Some(database);
        self
    }

    /// Validate everything needed to connect
    pub fn validate(&self) -> Result<ConnectionSettings, ConfigError> {
        self.check_identity()?;

        let target = match (&self.server_addr, self.sentinel_addrs.is_empty()) {
            (Some(addr), _) if !addr.trim().is_empty() => ConnectionTarget::Server(addr.clone()),
            (_, false) => match self.master_name.as_deref().map(str::trim) {
                Some(master) if !master.is_empty() => ConnectionTarget::Sentinel {
                    addrs: self.sentinel_addrs.clone(),
                    master_name: master.to_string(),
                },
                _ => return Err(ConfigError::MissingMasterName),
            },
            _ => return Err(ConfigError::MissingServer),
        };

        Ok(ConnectionSettings {
            target,
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database,
            pool_size: self.pool_size_or_default(),
        })
    }

    fn check_identity(&self) -> Result<(), ConfigError> {
        if self.process_id.trim().is_empty() {
            return Err(ConfigError::MissingProcessId);
        }
        Ok(())
    }

    fn normalized_namespace(&self) -> String {
        if self.namespace.is_empty() || self.namespace.ends_with(':') {
            self.namespace.clone()
        } else {
            format!("{}:", self.namespace)
        }
    }

    fn poll_interval(&self) -> Duration {
        match self.poll_interval_secs {
            0 => Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    fn pool_size_or_default(&self) -> usize {
        match self.pool_size {
            0 => DEFAULT_POOL_SIZE,
            size => size,
        }
    }
}

/// Where the store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    Server(String),
    Sentinel {
        addrs: Vec<String>,
        master_name: String,
    },
}

/// Validated connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub target: ConnectionTarget,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<i64>,
    pub pool_size: usize,
}

impl ConnectionSettings {
    /// Build a `redis://` URL for `addr` carrying the credentials and database
    pub fn url_for(&self, addr: &str) -> String {
        let (scheme, host) = addr.split_once("://").unwrap_or(("redis", addr));
        let host = host.trim_end_matches('/');

        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(pass)
            ),
            (None, Some(pass)) => format!(":{}@", urlencoding::encode(pass)),
            (Some(user), None) => format!("{}@", urlencoding::encode(user)),
            (None, None) => String::new(),
        };

        match self.database {
            Some(db) => format!("{scheme}://{auth}{host}/{db}"),
            None => format!("{scheme}://{auth}{host}"),
        }
    }
}

/// Validated, immutable engine configuration.
///
/// Cheap to clone; every component holds its own copy.
#[derive(Clone)]
pub struct Config {
    namespace: String,
    process_id: String,
    poll_interval: Duration,
    store: Arc<dyn JobStore>,
}

impl Config {
    /// Validate the options and connect to Redis
    pub async fn connect(options: Options) -> Result<Self, WorkerError> {
        let settings = options.validate()?;
        let store = RedisStore::connect(&settings).await?;
        Ok(Self::build(&options, Arc::new(store)))
    }

    /// Validate the options and use an already constructed store.
    ///
    /// The connection fields of `options` are ignored.
    pub fn with_store(options: Options, store: Arc<dyn JobStore>) -> Result<Self, ConfigError> {
        options.check_identity()?;
        Ok(Self::build(&options, store))
    }

    fn build(options: &Options, store: Arc<dyn JobStore>) -> Self {
        Self {
            namespace: options.normalized_namespace(),
            process_id: options.process_id.clone(),
            poll_interval: options.poll_interval(),
            store,
        }
    }

    /// Key prefix including its trailing `:` (empty when unset)
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// `<ns><queue>`, the queue name as recorded on retried jobs
    pub fn namespaced(&self, queue: &str) -> String {
        format!("{}{}", self.namespace, queue)
    }

    /// Remove the namespace prefix from a recorded queue name
    pub fn strip_namespace<'a>(&self, queue: &'a str) -> &'a str {
        if self.namespace.is_empty() {
            return queue;
        }
        queue.strip_prefix(self.namespace.as_str()).unwrap_or(queue)
    }

    /// `<ns>queue:<name>`
    pub fn queue_key(&self, queue: &str) -> String {
        format!("{}queue:{}", self.namespace, queue)
    }

    /// `<ns>queue:<name>:<process id>:inprogress`
    pub fn in_progress_key(&self, queue: &str) -> String {
        format!("{}:{}:inprogress", self.queue_key(queue), self.process_id)
    }

    pub fn retry_key(&self) -> String {
        format!("{}{}", self.namespace, RETRY_KEY)
    }

    pub fn schedule_key(&self) -> String {
        format!("{}{}", self.namespace, SCHEDULED_JOBS_KEY)
    }

    pub fn dead_key(&self) -> String {
        format!("{}{}", self.namespace, DEAD_KEY)
    }

    /// `<ns>stat:<metric>`
    pub fn stat_key(&self, metric: &str) -> String {
        format!("{}stat:{}", self.namespace, metric)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("namespace", &self.namespace)
            .field("process_id", &self.process_id)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

fn split_addrs(addrs: &str) -> Vec<String> {
    addrs
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env_optional(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::ParseError {
                key: key.to_string(),
                details: e.to_string(),
            })
        })
        .transpose()
}
