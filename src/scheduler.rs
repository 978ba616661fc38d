//! Delayed-job extension
//!
//! Future-dated envelopes are parked on a per-timestamp list, with the
//! timestamps themselves kept in a sorted set. A dedicated scheduler process
//! polls the set and promotes matured envelopes onto their live queues.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::{ResqError, ResqResult};
use crate::job::{self, Context, Job, Payload};
use crate::status::{self, Status};
use crate::store::Store;

fn validate_timestamp(timestamp: i64) -> ResqResult<()> {
    if timestamp <= 0 {
        return Err(ResqError::config(format!(
            "invalid delayed timestamp {}",
            timestamp
        )));
    }
    Ok(())
}

/// Epoch timestamp `seconds` from now
pub fn timestamp_in(seconds: i64) -> i64 {
    chrono::Utc::now().timestamp() + seconds
}

/// Park a job for execution at an absolute epoch timestamp.
///
/// Returns the job id. With `track` set, the job is observable in
/// [`Status::Scheduled`] until promotion.
pub async fn enqueue_at(
    ctx: &Context,
    timestamp: i64,
    queue: &str,
    class: &str,
    args: Option<Value>,
    track: bool,
) -> ResqResult<String> {
    job::validate_create(queue, class)?;
    validate_timestamp(timestamp)?;

    let id = job::new_job_id();
    if track {
        status::create(&ctx.store, &id).await?;
        status::update(&ctx.store, &id, Status::Scheduled).await?;
    }

    let payload = Payload {
        class: class.to_string(),
        args: args.map(|arg| vec![arg]),
        id: Some(id.clone()),
        queue: Some(queue.to_string()),
        track: Some(track),
    };
    delayed_push(&ctx.store, timestamp, &payload).await?;

    debug!("scheduled {} on {} for {}", class, queue, timestamp);
    Ok(id)
}

/// Park a job for execution `seconds` from now
pub async fn enqueue_in(
    ctx: &Context,
    seconds: i64,
    queue: &str,
    class: &str,
    args: Option<Value>,
    track: bool,
) -> ResqResult<String> {
    enqueue_at(ctx, timestamp_in(seconds), queue, class, args, track).await
}

/// Append an envelope to a timestamp's list and index the timestamp
pub async fn delayed_push(store: &Store, timestamp: i64, payload: &Payload) -> ResqResult<()> {
    let encoded = serde_json::to_string(payload)?;

    let mut rpush = redis::cmd("RPUSH");
    rpush.arg(store.keys().delayed_at(timestamp)).arg(&encoded);
    store.run::<()>(&rpush).await?;

    let mut zadd = redis::cmd("ZADD");
    zadd.arg(store.keys().delayed_schedule())
        .arg(timestamp)
        .arg(timestamp);
    store.run::<()>(&zadd).await
}

/// Earliest timestamp at or before `at` with work parked on it
pub async fn next_delayed_timestamp(store: &Store, at: i64) -> ResqResult<Option<i64>> {
    let mut cmd = redis::cmd("ZRANGEBYSCORE");
    cmd.arg(store.keys().delayed_schedule())
        .arg("-inf")
        .arg(at)
        .arg("LIMIT")
        .arg(0)
        .arg(1);
    let timestamps: Vec<i64> = store.run(&cmd).await?;
    Ok(timestamps.first().copied())
}

/// Pop the next envelope parked at a timestamp.
///
/// Once the timestamp's list drains, the list key and its sorted-set entry
/// are removed. A malformed entry is dropped with a warning.
pub async fn next_item_for_timestamp(store: &Store, timestamp: i64) -> ResqResult<Option<Payload>> {
    let key = store.keys().delayed_at(timestamp);

    let mut lpop = redis::cmd("LPOP");
    lpop.arg(&key);
    let raw: Option<String> = store.run(&lpop).await?;

    let item = raw.and_then(|entry| match serde_json::from_str(&entry) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!("dropping malformed delayed envelope at {}: {}", timestamp, err);
            None
        }
    });

    clean_up_timestamp(store, timestamp).await?;
    Ok(item)
}

async fn clean_up_timestamp(store: &Store, timestamp: i64) -> ResqResult<()> {
    let key = store.keys().delayed_at(timestamp);

    let mut llen = redis::cmd("LLEN");
    llen.arg(&key);
    let remaining: u64 = store.run(&llen).await?;
    if remaining > 0 {
        return Ok(());
    }

    let mut del = redis::cmd("DEL");
    del.arg(&key);
    store.run::<()>(&del).await?;

    let mut zrem = redis::cmd("ZREM");
    zrem.arg(store.keys().delayed_schedule()).arg(timestamp);
    store.run::<()>(&zrem).await
}

/// Remove every parked copy of an envelope, matching by exact identity.
///
/// Scans all timestamp lists; returns the number of entries removed.
pub async fn remove_delayed(store: &Store, payload: &Payload) -> ResqResult<u64> {
    let encoded = serde_json::to_string(payload)?;

    let mut keys_cmd = redis::cmd("KEYS");
    keys_cmd.arg(store.keys().apply("_schdlr_:*"));
    let keys: Vec<String> = store.run(&keys_cmd).await?;

    let mut removed = 0u64;
    for key in keys {
        let mut lrem = redis::cmd("LREM");
        lrem.arg(&key).arg(0).arg(&encoded);
        let count: u64 = store.run(&lrem).await?;
        removed += count;
    }
    Ok(removed)
}

/// Number of distinct timestamps with parked work
pub async fn schedule_size(store: &Store) -> ResqResult<u64> {
    let mut zcard = redis::cmd("ZCARD");
    zcard.arg(store.keys().delayed_schedule());
    store.run(&zcard).await
}

/// Number of envelopes parked at one timestamp
pub async fn items_at(store: &Store, timestamp: i64) -> ResqResult<u64> {
    let mut llen = redis::cmd("LLEN");
    llen.arg(store.keys().delayed_at(timestamp));
    store.run(&llen).await
}

/// Scheduler process that promotes matured envelopes onto live queues
pub struct DelayedScheduler {
    ctx: Context,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl DelayedScheduler {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            poll_interval: Duration::from_secs(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the poll interval (defaults to one second)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Flag handle for stopping the scheduler from another task
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Ask the run loop to stop after the current pass
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Poll the schedule until shutdown is requested
    pub async fn run(&self) -> ResqResult<()> {
        info!("delayed scheduler started");
        while !self.shutdown.load(Ordering::SeqCst) {
            let now = chrono::Utc::now().timestamp();
            if let Err(err) = self.promote_due(now).await {
                error!("delayed promotion failed: {}", err);
            }
            sleep(self.poll_interval).await;
        }
        info!("delayed scheduler stopped");
        Ok(())
    }

    /// Promote every envelope whose timestamp is at or before `now`.
    ///
    /// Returns the number of envelopes moved onto live queues.
    pub async fn promote_due(&self, now: i64) -> ResqResult<u64> {
        let mut promoted = 0u64;

        while let Some(timestamp) = next_delayed_timestamp(&self.ctx.store, now).await? {
            debug!("promoting delayed items for {}", timestamp);
            while let Some(payload) = next_item_for_timestamp(&self.ctx.store, timestamp).await? {
                let Some(queue) = payload.queue.clone() else {
                    warn!("delayed envelope for {} names no queue, dropping", payload.class);
                    continue;
                };
                let args = payload.args.as_ref().and_then(|list| list.first()).cloned();
                let track = payload.track.unwrap_or(false);

                Job::create(&self.ctx, &queue, &payload.class, args, track, payload.id).await?;
                promoted += 1;
            }
        }

        if promoted > 0 {
            info!("promoted {} delayed envelopes", promoted);
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_timestamp_validation() {
        assert!(validate_timestamp(1_700_000_000).is_ok());
        assert!(matches!(
            validate_timestamp(0),
            Err(ResqError::Config { .. })
        ));
        assert!(matches!(
            validate_timestamp(-5),
            Err(ResqError::Config { .. })
        ));
    }

    #[test]
    fn test_timestamp_in_is_relative_to_now() {
        let before = chrono::Utc::now().timestamp();
        let at = timestamp_in(30);
        let after = chrono::Utc::now().timestamp();
        assert!(at >= before + 30 && at <= after + 30);
    }

    #[test]
    fn test_delayed_envelope_wire_shape() {
        let payload = Payload {
            class: "Email::Send".to_string(),
            args: Some(vec![json!({"to": "ops@example.com"})]),
            id: Some("abc".to_string()),
            queue: Some("mail".to_string()),
            track: Some(true),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""queue":"mail""#));
        assert!(json.contains(r#""track":true"#));

        // promotion extracts the single positional argument
        let first = payload.args.as_ref().and_then(|list| list.first()).unwrap();
        assert_eq!(first, &json!({"to": "ops@example.com"}));
    }
}
