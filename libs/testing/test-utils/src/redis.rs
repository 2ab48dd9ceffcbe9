//! Redis test infrastructure

use redis::Client;
use redis::aio::MultiplexedConnection;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Redis container for one test
///
/// The container is stopped and removed when this struct is dropped.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    host_port: u16,
    pub connection_string: String,
}

impl TestRedis {
    /// Start a Redis 8 Alpine container and wait until it accepts connections
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client =
            Client::open(connection_string.clone()).expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            host_port,
            connection_string,
        }
    }

    /// Connection for inspecting keys directly
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// `host:port`, the form job options take
    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.host_port)
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_container_accepts_list_commands() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        let _: () = redis::cmd("LPUSH")
            .arg("queue:smoke")
            .arg("{}")
            .query_async(&mut conn)
            .await
            .unwrap();
        let len: usize = redis::cmd("LLEN")
            .arg("queue:smoke")
            .query_async(&mut conn)
            .await
            .unwrap();

        assert_eq!(len, 1);
        assert!(redis.connection_string().ends_with(&redis.addr()));
    }
}
