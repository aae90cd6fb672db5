use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::FromRedisValue;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use crate::error::{CourierError, Result};
use crate::queue::{BucketSpec, Priority};
use crate::store::{KeySpace, SharedStore};

/// Refill-and-take against the server clock in one round trip.
///
/// KEYS[1] = bucket hash, ARGV[1] = capacity, ARGV[2] = refill per second.
/// Returns 1 when a token was taken, 0 otherwise.
const TAKE_TOKEN_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local t = redis.call("TIME")
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local state = redis.call("HMGET", KEYS[1], "tokens", "last_refill")
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end
local elapsed = math.max(0, now - last)
tokens = math.min(capacity, tokens + elapsed * refill / 1000)
local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end
redis.call("HSET", KEYS[1], "tokens", tostring(tokens), "last_refill", now)
if refill > 0 then
  redis.call("PEXPIRE", KEYS[1], math.ceil(capacity / refill * 1000) + 1000)
end
return allowed
"#;

/// Whether a failed command may be sent a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Reads: repeating them changes nothing.
    Always,
    /// Writes: only retried when the first attempt never reached the server,
    /// since a lost reply may hide an applied push or a taken token.
    BeforeSend,
}

impl Replay {
    fn allows(self, sent: bool) -> bool {
        match self {
            Replay::Always => true,
            Replay::BeforeSend => !sent,
        }
    }
}

/// Extra response time allowed on top of a BLPOP's own timeout.
const BLOCKING_RESPONSE_GRACE: Duration = Duration::from_secs(2);

/// Smallest BLPOP timeout sent; zero would block forever.
const MIN_BLOCKING_TIMEOUT: Duration = Duration::from_millis(10);

/// Store backed by Redis (or Valkey) shared by every worker process.
///
/// Commands go over one multiplexed connection. BLPOP gets its own
/// connection so a parked pop never delays token or throttle calls; create
/// one `RedisStore` per worker so pops do not queue behind each other.
pub struct RedisStore {
    client: redis::Client,
    keys: KeySpace,
    connection: Arc<Mutex<Option<MultiplexedConnection>>>,
    blocking: Mutex<Option<(Duration, MultiplexedConnection)>>,
}

impl RedisStore {
    /// Parse the URL. Connections open lazily on first use.
    pub fn new(redis_url: &str, keys: KeySpace) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CourierError::Store(format!("invalid redis url {}: {}", redis_url, e)))?;
        Ok(Self {
            client,
            keys,
            connection: Arc::new(Mutex::new(None)),
            blocking: Mutex::new(None),
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Round trip to verify the server is reachable.
    pub async fn ping(&self) -> Result<()> {
        let _: String = self.run_command("ping", Replay::Always, || redis::cmd("PING")).await?;
        Ok(())
    }

    async fn run_command<T, F>(&self, operation: &'static str, replay: Replay, build: F) -> Result<T>
    where
        T: FromRedisValue + Send,
        F: Fn() -> redis::Cmd,
    {
        let mut last_err: Option<CourierError> = None;
        for attempt in 0..2 {
            let mut conn = match self.connection().await {
                Ok(conn) => conn,
                Err(error) => {
                    tracing::warn!(operation, attempt = attempt + 1, error = %error, "Redis connect failed");
                    last_err = Some(error);
                    if !replay.allows(false) {
                        break;
                    }
                    continue;
                }
            };
            let result: redis::RedisResult<T> = build().query_async(&mut conn).await;
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(operation, attempt = attempt + 1, "Redis command succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        error = %error,
                        "Redis command failed; reconnecting"
                    );
                    *self.connection.lock().await = None;
                    last_err = Some(CourierError::Store(format!("{} failed: {}", operation, error)));
                    if !replay.allows(true) {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CourierError::Store(format!("{} failed", operation))))
    }

    /// Shared multiplexed connection, opened on first use. The lock is only
    /// held while connecting, never across a query.
    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        tracing::debug!(rate_key = %self.keys.rate_limit(), "Redis store connected");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn blocking_pop(&self, timeout: Duration) -> Result<Option<(String, String)>> {
        let timeout = timeout.max(MIN_BLOCKING_TIMEOUT);
        let mut guard = self.blocking.lock().await;

        let reusable = matches!(guard.as_ref(), Some((made_for, _)) if *made_for >= timeout);
        if !reusable {
            let config = redis::AsyncConnectionConfig::new()
                .set_response_timeout(Some(timeout + BLOCKING_RESPONSE_GRACE));
            let conn = self.client.get_multiplexed_async_connection_with_config(&config).await?;
            *guard = Some((timeout, conn));
        }
        let Some((_, conn)) = guard.as_mut() else {
            return Err(CourierError::Store("redis blocking connection unavailable".to_string()));
        };

        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(self.keys.queues()).arg(timeout.as_secs_f64());
        let result: redis::RedisResult<Option<(String, String)>> = cmd.query_async(conn).await;
        match result {
            Ok(popped) => Ok(popped),
            Err(error) => {
                *guard = None;
                Err(CourierError::Store(format!("BLPOP failed: {}", error)))
            }
        }
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn push_back(&self, priority: Priority, payload: String) -> Result<()> {
        let key = self.keys.queue(priority);
        let _: i64 = self
            .run_command("rpush", Replay::BeforeSend, || {
                let mut cmd = redis::cmd("RPUSH");
                cmd.arg(key.as_str()).arg(payload.as_str());
                cmd
            })
            .await?;
        Ok(())
    }

    async fn push_front(&self, priority: Priority, payload: String) -> Result<()> {
        let key = self.keys.queue(priority);
        let _: i64 = self
            .run_command("lpush", Replay::BeforeSend, || {
                let mut cmd = redis::cmd("LPUSH");
                cmd.arg(key.as_str()).arg(payload.as_str());
                cmd
            })
            .await?;
        Ok(())
    }

    async fn pop_first(&self, timeout: Duration) -> Result<Option<(Priority, String)>> {
        let Some((key, payload)) = self.blocking_pop(timeout).await? else {
            return Ok(None);
        };
        match self.keys.priority_of(&key) {
            Some(priority) => Ok(Some((priority, payload))),
            None => Err(CourierError::Store(format!("BLPOP returned unknown key {}", key))),
        }
    }

    async fn take_token(&self, spec: &BucketSpec) -> Result<bool> {
        let key = self.keys.rate_limit();
        let allowed: i64 = self
            .run_command("take_token", Replay::BeforeSend, || {
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(TAKE_TOKEN_SCRIPT)
                    .arg(1)
                    .arg(key.as_str())
                    .arg(spec.capacity)
                    .arg(spec.refill_per_sec);
                cmd
            })
            .await?;
        Ok(allowed == 1)
    }

    async fn try_mark_recipient(&self, recipient: &str, ttl: Duration) -> Result<bool> {
        let key = self.keys.throttle(recipient);
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let set: Option<String> = self
            .run_command("mark_recipient", Replay::BeforeSend, || {
                let mut cmd = redis::cmd("SET");
                cmd.arg(key.as_str()).arg(1).arg("NX").arg("PX").arg(ttl_ms);
                cmd
            })
            .await?;
        Ok(set.is_some())
    }

    async fn len(&self, priority: Priority) -> Result<usize> {
        let key = self.keys.queue(priority);
        let len: usize = self
            .run_command("llen", Replay::Always, || {
                let mut cmd = redis::cmd("LLEN");
                cmd.arg(key.as_str());
                cmd
            })
            .await?;
        Ok(len)
    }
}
