//! Namespaced Redis adapter
//!
//! Every Redis key the queue touches is built by [`Keys`] so that the whole
//! keyspace lives under one configurable namespace (`resque:` by default,
//! matching the Resque wire format). All commands go through
//! [`Store::run`], which retries transient `LOADING` replies and maps every
//! other client error to [`ResqError::Redis`].

use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ResqError, ResqResult};

/// Namespace prepended to every key when none is configured
pub const DEFAULT_NAMESPACE: &str = "resque:";

/// Attempts made against a Redis instance that is still loading its dataset
const LOADING_ATTEMPTS: u64 = 19;

/// Configuration for the Redis backend
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Redis connection URL (DSN)
    pub url: String,
    /// Key namespace; a trailing `:` is appended if absent
    pub namespace: String,
    /// Optional database number, selected after connecting
    pub database: Option<i64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: None,
        }
    }
}

/// Builder for every Redis key used by the queue
#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    /// Create a key builder, normalizing the namespace to end with `:`
    pub fn new(namespace: &str) -> Self {
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else if namespace.ends_with(':') {
            namespace.to_string()
        } else {
            format!("{}:", namespace)
        };
        Self { namespace }
    }

    /// The normalized namespace, trailing `:` included
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix an arbitrary key with the namespace
    pub fn apply(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Strip the namespace iff it is present
    pub fn strip<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.namespace).unwrap_or(key)
    }

    /// Set of all known queue names
    pub fn queues(&self) -> String {
        self.apply("queues")
    }

    /// List of envelopes for one queue
    pub fn queue(&self, name: &str) -> String {
        self.apply(&format!("queue:{}", name))
    }

    /// Set of live worker ids
    pub fn workers(&self) -> String {
        self.apply("workers")
    }

    /// JSON of the job a worker is currently processing
    pub fn worker(&self, id: &str) -> String {
        self.apply(&format!("worker:{}", id))
    }

    /// Human timestamp of a worker's startup
    pub fn worker_started(&self, id: &str) -> String {
        self.apply(&format!("worker:{}:started", id))
    }

    /// Integer counter
    pub fn stat(&self, name: &str) -> String {
        self.apply(&format!("stat:{}", name))
    }

    /// Per-job status record
    pub fn status(&self, job_id: &str) -> String {
        self.apply(&format!("job:{}:status", job_id))
    }

    /// Failure record for one job
    pub fn failed(&self, job_id: &str) -> String {
        self.apply(&format!("failed:{}", job_id))
    }

    /// Sorted set of delayed-schedule timestamps
    pub fn delayed_schedule(&self) -> String {
        self.apply("_schdlr_")
    }

    /// List of envelopes due at one timestamp
    pub fn delayed_at(&self, timestamp: i64) -> String {
        self.apply(&format!("_schdlr_:{}", timestamp))
    }
}

/// Shared handle to the namespaced Redis backend
#[derive(Clone)]
pub struct Store {
    client: Client,
    conn: Arc<RwLock<MultiplexedConnection>>,
    keys: Keys,
    database: Option<i64>,
}

impl Store {
    /// Connect to Redis and verify the connection with a PING
    pub async fn connect(config: StoreConfig) -> ResqResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        if let Some(db) = config.database {
            let mut select = redis::cmd("SELECT");
            select.arg(db);
            select.query_async::<_, ()>(&mut conn).await?;
        }

        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        info!("connected to redis at {}", config.url);

        Ok(Self {
            client,
            conn: Arc::new(RwLock::new(conn)),
            keys: Keys::new(&config.namespace),
            database: config.database,
        })
    }

    /// Connect with the default configuration
    pub async fn connect_default() -> ResqResult<Self> {
        Self::connect(StoreConfig::default()).await
    }

    /// The key builder for this store's namespace
    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// Drop the current connection and establish a fresh one
    pub async fn reconnect(&self) -> ResqResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        if let Some(db) = self.database {
            let mut select = redis::cmd("SELECT");
            select.arg(db);
            select.query_async::<_, ()>(&mut conn).await?;
        }
        *self.conn.write().await = conn;
        debug!("redis connection re-established");
        Ok(())
    }

    async fn connection(&self) -> MultiplexedConnection {
        self.conn.read().await.clone()
    }

    /// Run a command, retrying while the server reports it is still loading.
    ///
    /// Each retry sleeps one second longer than the previous one; after the
    /// ladder is exhausted the caller gets [`ResqError::StillLoading`].
    pub async fn run<T: FromRedisValue>(&self, cmd: &Cmd) -> ResqResult<T> {
        let mut conn = self.connection().await;
        for wait in 1..=LOADING_ATTEMPTS {
            match cmd.query_async::<_, T>(&mut conn).await {
                Ok(value) => return Ok(value),
                Err(err) if err.code() == Some("LOADING") => {
                    if wait == LOADING_ATTEMPTS {
                        break;
                    }
                    warn!("redis is loading its dataset, retrying in {}s", wait);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ResqError::StillLoading {
            attempts: LOADING_ATTEMPTS as u32,
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("namespace", &self.keys.namespace)
            .field("database", &self.database)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_normalization() {
        assert_eq!(Keys::new("resque:").namespace(), "resque:");
        assert_eq!(Keys::new("resque").namespace(), "resque:");
        assert_eq!(Keys::new("myapp:jobs").namespace(), "myapp:jobs:");
        assert_eq!(Keys::new("").namespace(), "resque:");
    }

    #[test]
    fn test_key_shapes() {
        let keys = Keys::new("resque");
        assert_eq!(keys.queues(), "resque:queues");
        assert_eq!(keys.queue("high"), "resque:queue:high");
        assert_eq!(keys.workers(), "resque:workers");
        assert_eq!(keys.worker("h:1:q"), "resque:worker:h:1:q");
        assert_eq!(keys.worker_started("h:1:q"), "resque:worker:h:1:q:started");
        assert_eq!(keys.stat("processed"), "resque:stat:processed");
        assert_eq!(keys.status("abc"), "resque:job:abc:status");
        assert_eq!(keys.failed("abc"), "resque:failed:abc");
        assert_eq!(keys.delayed_schedule(), "resque:_schdlr_");
        assert_eq!(keys.delayed_at(1700000000), "resque:_schdlr_:1700000000");
    }

    #[test]
    fn test_strip_only_when_present() {
        let keys = Keys::new("resque");
        assert_eq!(keys.strip("resque:queue:high"), "queue:high");
        assert_eq!(keys.strip("other:queue:high"), "other:queue:high");
        assert_eq!(keys.strip("queues"), "queues");
    }
}
