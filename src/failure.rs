//! Failure capture
//!
//! Each failed job leaves a self-expiring record carrying enough context to
//! re-queue or post-mortem it: the original envelope, the error chain, and
//! which worker hit it on which queue.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use tracing::debug;

use crate::error::{ResqError, ResqResult};
use crate::job::Payload;
use crate::status::TERMINAL_TTL_SECS;
use crate::store::Store;

/// Wire form of a failure record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// `YYYY-MM-DD HH:MM:SS` wall clock of the failure
    pub failed_at: String,
    /// The envelope that was being processed
    pub payload: Payload,
    /// Error kind name
    pub exception: String,
    /// Top-level error message
    pub error: String,
    /// One frame per link of the error chain
    pub backtrace: Vec<String>,
    /// Id of the worker that hit the failure
    pub worker: String,
    /// Queue the envelope was reserved from
    pub queue: String,
}

impl FailureRecord {
    /// Build a record from a job error
    pub fn new(payload: &Payload, queue: &str, worker: &str, err: &ResqError) -> Self {
        Self {
            failed_at: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            payload: payload.clone(),
            exception: err.kind().to_string(),
            error: err.to_string(),
            backtrace: backtrace_of(err),
            worker: worker.to_string(),
            queue: queue.to_string(),
        }
    }
}

/// Persist a failure record with the standard TTL
pub async fn record(
    store: &Store,
    payload: &Payload,
    queue: &str,
    worker: &str,
    err: &ResqError,
) -> ResqResult<()> {
    let job_id = payload.id.clone().unwrap_or_else(crate::job::new_job_id);
    let record = FailureRecord::new(payload, queue, worker, err);
    let json = serde_json::to_string(&record)?;

    let mut setex = redis::cmd("SETEX");
    setex
        .arg(store.keys().failed(&job_id))
        .arg(TERMINAL_TTL_SECS)
        .arg(json);
    store.run::<()>(&setex).await?;

    debug!("recorded failure for job {} on {}", job_id, queue);
    Ok(())
}

/// Read the failure record for a job, if one exists
pub async fn get(store: &Store, job_id: &str) -> ResqResult<Option<FailureRecord>> {
    let mut cmd = redis::cmd("GET");
    cmd.arg(store.keys().failed(job_id));
    let raw: Option<String> = store.run(&cmd).await?;
    Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
}

/// Total failures recorded by all workers
pub async fn count(store: &Store) -> ResqResult<u64> {
    crate::stats::get(store, "failed").await
}

/// Walk the error chain into backtrace frames, outermost first
fn backtrace_of(err: &ResqError) -> Vec<String> {
    let mut frames = vec![format!("{}: {}", err.kind(), err)];
    let mut source = err.source();
    while let Some(cause) = source {
        frames.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Payload {
        Payload {
            class: "Email::Send".to_string(),
            args: Some(vec![serde_json::json!({"to": "ops@example.com"})]),
            id: Some("c0ffee".to_string()),
            queue: None,
            track: None,
        }
    }

    #[test]
    fn test_record_shape() {
        let err = ResqError::dirty_exit("executor aborted");
        let record = FailureRecord::new(&payload(), "critical", "host:42:critical", &err);

        assert_eq!(record.exception, "DirtyExit");
        assert!(record.error.contains("executor aborted"));
        assert_eq!(record.worker, "host:42:critical");
        assert_eq!(record.queue, "critical");
        assert!(!record.backtrace.is_empty());

        let json = serde_json::to_value(&record).unwrap();
        for field in [
            "failed_at",
            "payload",
            "exception",
            "error",
            "backtrace",
            "worker",
            "queue",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn test_backtrace_walks_error_chain() {
        let root = anyhow::anyhow!("connection refused");
        let err = ResqError::JobThrew(root.context("sending welcome mail"));
        let frames = backtrace_of(&err);

        assert!(frames.len() >= 2);
        assert!(frames[0].starts_with("JobThrew"));
        assert!(frames.iter().any(|f| f.contains("connection refused")));
    }

    #[test]
    fn test_failed_at_format() {
        let err = ResqError::dirty_exit("x");
        let record = FailureRecord::new(&payload(), "q", "w", &err);
        // YYYY-MM-DD HH:MM:SS
        assert_eq!(record.failed_at.len(), 19);
        assert_eq!(&record.failed_at[4..5], "-");
        assert_eq!(&record.failed_at[10..11], " ");
        assert_eq!(&record.failed_at[13..14], ":");
    }
}
