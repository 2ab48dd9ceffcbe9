//! Shared test utilities
//!
//! - `TestRedis`: Redis container with automatic cleanup
//! - `TestKeys`: deterministic, per-test process ids, namespaces and queue
//!   names so tests sharing one server never see each other's keys
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestKeys, TestRedis};
//!
//! #[tokio::test]
//! #[ignore] // Requires Docker
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let keys = TestKeys::from_test_name("my_redis_test");
//!
//!     let options = Options::new(keys.process_id())
//!         .with_namespace(keys.namespace())
//!         .with_server_addr(redis.addr());
//! }
//! ```

mod redis;

pub use redis::TestRedis;

/// Key names derived from a seed
///
/// The same test name always yields the same names, which keeps failures
/// reproducible.
pub struct TestKeys {
    seed: u64,
}

impl TestKeys {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed from a hash of the test name
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    pub fn process_id(&self) -> String {
        format!("test-{:x}", self.seed)
    }

    /// Namespace without the trailing separator
    pub fn namespace(&self) -> String {
        format!("test{}", self.seed)
    }

    /// e.g. `queue("mailers")` → `mailers-<seed>`
    pub fn queue(&self, name: &str) -> String {
        format!("{}-{}", name, self.seed)
    }
}
