//! Queue operations over Redis lists and the queue registry set
//!
//! Envelopes are treated as opaque JSON strings here; decoding happens at
//! reserve time. Every push registers the queue name in the `queues` set so
//! consumers can discover live queues without a key scan.

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ResqResult;
use crate::job::Payload;
use crate::store::Store;

/// Push an envelope onto the tail of a queue, registering the queue name
pub async fn push(store: &Store, queue: &str, payload: &Payload) -> ResqResult<()> {
    let encoded = serde_json::to_string(payload)?;

    let mut sadd = redis::cmd("SADD");
    sadd.arg(store.keys().queues()).arg(queue);
    store.run::<()>(&sadd).await?;

    let mut rpush = redis::cmd("RPUSH");
    rpush.arg(store.keys().queue(queue)).arg(&encoded);
    store.run::<()>(&rpush).await?;

    debug!("pushed {} onto queue {}", payload.class, queue);
    Ok(())
}

/// Pop the head of a queue.
///
/// Returns `None` when the queue is empty. An entry that fails to decode is
/// logged and also reported as `None` so one poison message cannot wedge the
/// consumer.
pub async fn pop(store: &Store, queue: &str) -> ResqResult<Option<Payload>> {
    let mut lpop = redis::cmd("LPOP");
    lpop.arg(store.keys().queue(queue));
    let raw: Option<String> = store.run(&lpop).await?;

    Ok(raw.and_then(|entry| decode_entry(queue, &entry)))
}

/// Blocking pop across several queues.
///
/// Returns the queue name the envelope came from along with the envelope.
/// `timeout` is in seconds; `0` blocks indefinitely.
pub async fn pop_blocking(
    store: &Store,
    queues: &[String],
    timeout: u64,
) -> ResqResult<Option<(String, Payload)>> {
    if queues.is_empty() {
        return Ok(None);
    }

    let mut blpop = redis::cmd("BLPOP");
    for queue in queues {
        blpop.arg(store.keys().queue(queue));
    }
    blpop.arg(timeout);
    let hit: Option<(String, String)> = store.run(&blpop).await?;

    Ok(hit.and_then(|(key, entry)| {
        let name = store
            .keys()
            .strip(&key)
            .strip_prefix("queue:")
            .unwrap_or(&key)
            .to_string();
        decode_entry(&name, &entry).map(|payload| (name, payload))
    }))
}

/// Number of envelopes waiting in a queue
pub async fn size(store: &Store, queue: &str) -> ResqResult<u64> {
    let mut llen = redis::cmd("LLEN");
    llen.arg(store.keys().queue(queue));
    store.run(&llen).await
}

/// Read a slice of a queue without consuming it
pub async fn peek(store: &Store, queue: &str, start: i64, count: i64) -> ResqResult<Vec<Payload>> {
    let mut lrange = redis::cmd("LRANGE");
    lrange
        .arg(store.keys().queue(queue))
        .arg(start)
        .arg(start + count - 1);
    let entries: Vec<String> = store.run(&lrange).await?;

    Ok(entries
        .iter()
        .filter_map(|entry| decode_entry(queue, entry))
        .collect())
}

/// All known queue names
pub async fn queues(store: &Store) -> ResqResult<Vec<String>> {
    let mut smembers = redis::cmd("SMEMBERS");
    smembers.arg(store.keys().queues());
    store.run(&smembers).await
}

/// Delete a queue's list and drop it from the registry
pub async fn remove_queue(store: &Store, queue: &str) -> ResqResult<()> {
    let mut del = redis::cmd("DEL");
    del.arg(store.keys().queue(queue));
    store.run::<()>(&del).await?;

    let mut srem = redis::cmd("SREM");
    srem.arg(store.keys().queues()).arg(queue);
    store.run::<()>(&srem).await?;
    Ok(())
}

/// Predicate applied to queued envelopes by [`dequeue`]
#[derive(Debug, Clone)]
pub enum DequeueFilter {
    /// Match every envelope of the named class
    Class(String),
    /// Match the one envelope with this class and id
    Instance { class: String, id: String },
    /// Match envelopes of the class whose first positional argument is an
    /// object containing every listed key/value pair
    Args {
        class: String,
        args: serde_json::Map<String, Value>,
    },
}

impl DequeueFilter {
    /// Check a decoded envelope against this predicate
    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            DequeueFilter::Class(class) => payload.class == *class,
            DequeueFilter::Instance { class, id } => {
                payload.class == *class && payload.id.as_deref() == Some(id.as_str())
            }
            DequeueFilter::Args { class, args } => {
                if payload.class != *class {
                    return false;
                }
                let first = payload
                    .args
                    .as_ref()
                    .and_then(|list| list.first())
                    .and_then(Value::as_object);
                match first {
                    Some(map) => args.iter().all(|(k, v)| map.get(k) == Some(v)),
                    None => args.is_empty(),
                }
            }
        }
    }
}

/// Remove envelopes from a queue.
///
/// With no filters the whole queue is dropped and its prior size returned.
/// With filters, envelopes are rotated through a pair of temporary lists so
/// that unmatched entries are restored in their original relative order;
/// matched entries are discarded and counted.
pub async fn dequeue(store: &Store, queue: &str, filters: &[DequeueFilter]) -> ResqResult<u64> {
    if filters.is_empty() {
        let count = size(store, queue).await?;
        let mut del = redis::cmd("DEL");
        del.arg(store.keys().queue(queue));
        store.run::<()>(&del).await?;
        return Ok(count);
    }

    let source = store.keys().queue(queue);
    let now = chrono::Utc::now().timestamp();
    let temp = format!("{}:temp:{}", source, now);
    let requeue = format!("{}:requeue", temp);

    let mut removed = 0u64;
    loop {
        let mut rotate = redis::cmd("RPOPLPUSH");
        rotate.arg(&source).arg(&temp);
        let entry: Option<String> = store.run(&rotate).await?;
        let Some(entry) = entry else { break };

        let matched = serde_json::from_str::<Payload>(&entry)
            .map(|payload| filters.iter().any(|f| f.matches(&payload)))
            .unwrap_or(false);

        if matched {
            let mut rpop = redis::cmd("RPOP");
            rpop.arg(&temp);
            store.run::<Option<String>>(&rpop).await?;
            removed += 1;
        } else {
            let mut park = redis::cmd("RPOPLPUSH");
            park.arg(&temp).arg(&requeue);
            store.run::<Option<String>>(&park).await?;
        }
    }

    // drain survivors back into the source in their original order
    loop {
        let mut restore = redis::cmd("RPOPLPUSH");
        restore.arg(&requeue).arg(&source);
        let entry: Option<String> = store.run(&restore).await?;
        if entry.is_none() {
            break;
        }
    }

    let mut del = redis::cmd("DEL");
    del.arg(&temp).arg(&requeue);
    store.run::<()>(&del).await?;

    debug!("dequeued {} envelopes from {}", removed, queue);
    Ok(removed)
}

fn decode_entry(queue: &str, entry: &str) -> Option<Payload> {
    match serde_json::from_str(entry) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!("skipping malformed envelope on queue {}: {}", queue, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(class: &str, id: &str, args: Value) -> Payload {
        Payload {
            class: class.to_string(),
            args: Some(vec![args]),
            id: Some(id.to_string()),
            queue: None,
            track: None,
        }
    }

    #[test]
    fn test_class_filter() {
        let filter = DequeueFilter::Class("Email".to_string());
        assert!(filter.matches(&payload("Email", "a", json!({}))));
        assert!(!filter.matches(&payload("Sms", "a", json!({}))));
    }

    #[test]
    fn test_instance_filter() {
        let filter = DequeueFilter::Instance {
            class: "Email".to_string(),
            id: "a1".to_string(),
        };
        assert!(filter.matches(&payload("Email", "a1", json!({}))));
        assert!(!filter.matches(&payload("Email", "b2", json!({}))));
        assert!(!filter.matches(&payload("Sms", "a1", json!({}))));
    }

    #[test]
    fn test_args_filter_requires_superset() {
        let mut wanted = serde_json::Map::new();
        wanted.insert("to".to_string(), json!("ops@example.com"));
        let filter = DequeueFilter::Args {
            class: "Email".to_string(),
            args: wanted,
        };

        // envelope argument object carries extra keys: still a match
        assert!(filter.matches(&payload(
            "Email",
            "a",
            json!({"to": "ops@example.com", "body": "hi"})
        )));
        assert!(!filter.matches(&payload("Email", "a", json!({"to": "other"}))));
        assert!(!filter.matches(&payload("Email", "a", json!([1, 2]))));
    }

    #[test]
    fn test_args_filter_empty_map_matches_class() {
        let filter = DequeueFilter::Args {
            class: "Email".to_string(),
            args: serde_json::Map::new(),
        };
        assert!(filter.matches(&payload("Email", "a", json!({"k": 1}))));
        assert!(filter.matches(&Payload {
            class: "Email".to_string(),
            args: None,
            id: None,
            queue: None,
            track: None,
        }));
    }
}
