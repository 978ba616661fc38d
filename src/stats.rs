//! Integer statistics counters keyed by name

use crate::error::ResqResult;
use crate::store::Store;

/// Read a counter; a missing key reads as zero
pub async fn get(store: &Store, name: &str) -> ResqResult<u64> {
    let mut cmd = redis::cmd("GET");
    cmd.arg(store.keys().stat(name));
    let value: Option<u64> = store.run(&cmd).await?;
    Ok(value.unwrap_or(0))
}

/// Increment a counter by one
pub async fn incr(store: &Store, name: &str) -> ResqResult<u64> {
    incr_by(store, name, 1).await
}

/// Increment a counter by an arbitrary amount
pub async fn incr_by(store: &Store, name: &str, by: u64) -> ResqResult<u64> {
    let mut cmd = redis::cmd("INCRBY");
    cmd.arg(store.keys().stat(name)).arg(by);
    store.run(&cmd).await
}

/// Decrement a counter by an arbitrary amount
pub async fn decr_by(store: &Store, name: &str, by: u64) -> ResqResult<i64> {
    let mut cmd = redis::cmd("DECRBY");
    cmd.arg(store.keys().stat(name)).arg(by);
    store.run(&cmd).await
}

/// Remove a counter
pub async fn clear(store: &Store, name: &str) -> ResqResult<()> {
    let mut cmd = redis::cmd("DEL");
    cmd.arg(store.keys().stat(name));
    store.run(&cmd).await
}
