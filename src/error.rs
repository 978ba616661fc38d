//! Error types for the job queue

use thiserror::Error;

/// Result type alias for queue operations
pub type ResqResult<T> = Result<T, ResqError>;

/// Error taxonomy for the job queue system
#[derive(Error, Debug)]
pub enum ResqError {
    /// Redis connection or command errors
    #[error("redis unavailable: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis kept replying LOADING after the retry ladder was exhausted
    #[error("redis is still loading its dataset after {attempts} attempts")]
    StillLoading { attempts: u32 },

    /// A popped list entry could not be decoded as a job envelope
    #[error("malformed job envelope: {reason}")]
    MalformedEnvelope { reason: String },

    /// The factory could not resolve or instantiate the named job class
    #[error("job class not creatable: {class}: {reason}")]
    JobNotCreatable { class: String, reason: String },

    /// The executor died before reporting a result
    #[error("job executor exited dirty: {reason}")]
    DirtyExit { reason: String },

    /// A throwable escaped the job's perform or tear-down
    #[error("job failed: {0}")]
    JobThrew(#[source] anyhow::Error),

    /// Producer-side configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Envelope serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors (signal installation, process table reads)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResqError {
    /// Create a malformed envelope error
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
        }
    }

    /// Create a job-not-creatable error
    pub fn not_creatable<S: Into<String>>(class: S, reason: S) -> Self {
        Self::JobNotCreatable {
            class: class.into(),
            reason: reason.into(),
        }
    }

    /// Create a dirty exit error
    pub fn dirty_exit<S: Into<String>>(reason: S) -> Self {
        Self::DirtyExit {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Short kind name recorded in failure records
    pub fn kind(&self) -> &'static str {
        match self {
            ResqError::Redis(_) => "RedisUnavailable",
            ResqError::StillLoading { .. } => "RedisStillLoading",
            ResqError::MalformedEnvelope { .. } => "MalformedEnvelope",
            ResqError::JobNotCreatable { .. } => "JobNotCreatable",
            ResqError::DirtyExit { .. } => "DirtyExit",
            ResqError::JobThrew(_) => "JobThrew",
            ResqError::Config { .. } => "ConfigError",
            ResqError::Serialization(_) => "SerializationError",
            ResqError::Io(_) => "IoError",
        }
    }

    /// True for errors caused by losing the Redis backend
    pub fn is_redis_unavailable(&self) -> bool {
        matches!(self, ResqError::Redis(_) | ResqError::StillLoading { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(ResqError::dirty_exit("status 1").kind(), "DirtyExit");
        assert_eq!(ResqError::config("empty queue").kind(), "ConfigError");
        assert_eq!(
            ResqError::not_creatable("Mail", "not registered").kind(),
            "JobNotCreatable"
        );
        assert_eq!(
            ResqError::JobThrew(anyhow::anyhow!("boom")).kind(),
            "JobThrew"
        );
    }

    #[test]
    fn test_display_carries_detail() {
        let err = ResqError::dirty_exit("executor aborted");
        assert!(err.to_string().contains("executor aborted"));

        let err = ResqError::not_creatable("Email::Send", "no perform");
        let msg = err.to_string();
        assert!(msg.contains("Email::Send") && msg.contains("no perform"));
    }

    #[test]
    fn test_redis_unavailable_classification() {
        assert!(ResqError::StillLoading { attempts: 19 }.is_redis_unavailable());
        assert!(!ResqError::config("bad timestamp").is_redis_unavailable());
        assert!(!ResqError::malformed("truncated json").is_redis_unavailable());
    }

    #[test]
    fn test_serialization_from_serde() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ResqError::from(parse_err);
        assert_eq!(err.kind(), "SerializationError");
    }
}
