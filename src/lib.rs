//! # resq
//!
//! A Redis-backed distributed job queue speaking the Resque wire format:
//! producers and workers written against the same keyspace — in any
//! language — interoperate at the data level.
//!
//! ## Features
//!
//! - Named FIFO queues over Redis lists, with a live queue registry
//! - Supervising workers with signal-driven graceful shutdown
//! - Multi-queue reservation with blocking pops, `*` wildcards and `!`
//!   exclusions
//! - Optional per-job status tracking with self-expiring terminal states
//! - Failure records carrying the envelope, error chain, worker and queue
//! - A distributed worker registry with dead-worker pruning
//! - A delayed-job scheduler promoting future-dated envelopes at their due
//!   time
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resq::{Context, Job, JobHandler, JobInfo, Store, StoreConfig, Worker, WorkerConfig};
//! use serde_json::Value;
//!
//! struct SendEmail;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for SendEmail {
//!     async fn perform(&self, args: &Value, _job: &JobInfo<'_>) -> anyhow::Result<()> {
//!         println!("sending mail to {}", args["to"]);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Store::connect(StoreConfig::default()).await?;
//!     let ctx = Context::new(store);
//!     ctx.registry.register("Email::Send", SendEmail).await;
//!
//!     let args = serde_json::json!({"to": "ops@example.com"});
//!     Job::create(&ctx, "mail", "Email::Send", Some(args), false, None).await?;
//!
//!     let worker = Worker::new(ctx, vec!["mail".to_string()], WorkerConfig::default())?;
//!     worker.work().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod events;
pub mod failure;
pub mod job;
pub mod queue;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod stats;
pub mod status;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use error::{ResqError, ResqResult};
pub use events::{EventBus, Hook, HookEvent, HookFlow};
pub use failure::FailureRecord;
pub use job::{new_job_id, Context, Job, Payload, Perform};
pub use queue::DequeueFilter;
pub use registry::{JobHandler, JobInfo, JobRegistry};
pub use scheduler::DelayedScheduler;
pub use status::{Status, StatusRecord};
pub use store::{Keys, Store, StoreConfig, DEFAULT_NAMESPACE};
pub use worker::{parse_worker_id, Worker, WorkerConfig, WorkingOn};

/// Version of the job queue library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
