//! Per-job status tracking
//!
//! Status records are optional: producers opt in at enqueue time. Terminal
//! records expire after a day so the keyspace cleans itself up.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ResqResult;
use crate::store::Store;

/// Seconds a terminal status record stays readable
pub const TERMINAL_TTL_SECS: i64 = 86_400;

/// Job status states with their wire discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    Waiting = 1,
    Running = 2,
    Failed = 3,
    Complete = 4,
    /// Extension state used by the delayed-job scheduler
    Scheduled = 63,
}

impl Status {
    /// Terminal states cause the record to expire
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Failed | Status::Complete)
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Status::Waiting),
            2 => Ok(Status::Running),
            3 => Ok(Status::Failed),
            4 => Ok(Status::Complete),
            63 => Ok(Status::Scheduled),
            other => Err(format!("unknown job status {}", other)),
        }
    }
}

/// Wire form of a status record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: Status,
    /// Epoch seconds of the last transition
    pub updated: i64,
    /// Epoch seconds of record creation; only the initial write carries it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<i64>,
}

/// Start tracking a job in `Waiting`
pub async fn create(store: &Store, job_id: &str) -> ResqResult<()> {
    let now = chrono::Utc::now().timestamp();
    let record = StatusRecord {
        status: Status::Waiting,
        updated: now,
        started: Some(now),
    };
    write(store, job_id, &record).await
}

/// Read a job's status record, if tracked
pub async fn get(store: &Store, job_id: &str) -> ResqResult<Option<StatusRecord>> {
    let mut cmd = redis::cmd("GET");
    cmd.arg(store.keys().status(job_id));
    let raw: Option<String> = store.run(&cmd).await?;

    Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
}

/// Transition a tracked job to a new state.
///
/// Returns `false` without writing when the job is untracked or already in
/// a terminal state. Terminal writes arm the expiry timer.
pub async fn update(store: &Store, job_id: &str, status: Status) -> ResqResult<bool> {
    let Some(current) = get(store, job_id).await? else {
        return Ok(false);
    };
    if current.status.is_terminal() {
        debug!("ignoring status update for finished job {}", job_id);
        return Ok(false);
    }

    let record = StatusRecord {
        status,
        updated: chrono::Utc::now().timestamp(),
        started: None,
    };
    write(store, job_id, &record).await?;

    if status.is_terminal() {
        let mut expire = redis::cmd("EXPIRE");
        expire.arg(store.keys().status(job_id)).arg(TERMINAL_TTL_SECS);
        store.run::<()>(&expire).await?;
    }
    Ok(true)
}

/// Stop tracking a job entirely
pub async fn stop(store: &Store, job_id: &str) -> ResqResult<()> {
    let mut del = redis::cmd("DEL");
    del.arg(store.keys().status(job_id));
    store.run::<()>(&del).await
}

/// Whether a status record exists for this job
pub async fn is_tracking(store: &Store, job_id: &str) -> ResqResult<bool> {
    let mut exists = redis::cmd("EXISTS");
    exists.arg(store.keys().status(job_id));
    store.run(&exists).await
}

async fn write(store: &Store, job_id: &str, record: &StatusRecord) -> ResqResult<()> {
    let json = serde_json::to_string(record)?;
    let mut set = redis::cmd("SET");
    set.arg(store.keys().status(job_id)).arg(json);
    store.run::<()>(&set).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_discriminants() {
        assert_eq!(u8::from(Status::Waiting), 1);
        assert_eq!(u8::from(Status::Running), 2);
        assert_eq!(u8::from(Status::Failed), 3);
        assert_eq!(u8::from(Status::Complete), 4);
        assert_eq!(u8::from(Status::Scheduled), 63);
        assert!(Status::try_from(5).is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(Status::Failed.is_terminal());
        assert!(Status::Complete.is_terminal());
        assert!(!Status::Waiting.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Scheduled.is_terminal());
    }

    #[test]
    fn test_record_wire_shape() {
        let record = StatusRecord {
            status: Status::Waiting,
            updated: 1700000000,
            started: Some(1700000000),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"status":1,"updated":1700000000,"started":1700000000}"#
        );

        // transitions omit the started field
        let record = StatusRecord {
            status: Status::Running,
            updated: 1700000005,
            started: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"status":2,"updated":1700000005}"#);
    }

    #[test]
    fn test_record_decode() {
        let record: StatusRecord =
            serde_json::from_str(r#"{"status":63,"updated":1700000000,"started":1699999999}"#)
                .unwrap();
        assert_eq!(record.status, Status::Scheduled);
        assert_eq!(record.started, Some(1699999999));
    }
}
