//! Job envelopes and descriptors
//!
//! An envelope is the JSON record that travels through Redis; a [`Job`] is a
//! reserved envelope bound to the context it will execute in. The envelope
//! layout (`class`, `args`, `id`) is shared with every other client of the
//! same keyspace, so it changes here only if the wire format changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{ResqError, ResqResult};
use crate::events::{EventBus, Hook, HookEvent, HookFlow};
use crate::failure;
use crate::queue;
use crate::registry::{JobInfo, JobRegistry};
use crate::stats;
use crate::status::{self, Status};
use crate::store::Store;

/// Generate a fresh 32-hex job id
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The JSON envelope carried on queue lists.
///
/// Live envelopes serialize `class`, `args` and `id`; envelopes parked on
/// the delayed schedule additionally carry their target `queue` and the
/// status-tracking flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<bool>,
}

impl Payload {
    /// Build a live envelope
    pub fn new(class: impl Into<String>, args: Option<Value>, id: Option<String>) -> Self {
        Self {
            class: class.into(),
            args: args.map(|arg| vec![arg]),
            id,
            queue: None,
            track: None,
        }
    }

    /// The single positional argument, or an empty array when absent
    pub fn arguments(&self) -> Value {
        self.args
            .as_ref()
            .and_then(|list| list.first())
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
    }
}

/// Shared dependencies handed to every component
#[derive(Clone)]
pub struct Context {
    pub store: Store,
    pub events: Arc<EventBus>,
    pub registry: Arc<JobRegistry>,
}

impl Context {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            events: Arc::new(EventBus::new()),
            registry: Arc::new(JobRegistry::new()),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("store", &self.store).finish()
    }
}

/// Outcome of running a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perform {
    /// The handler ran to completion
    Ran,
    /// A `BeforePerform` hook or the handler's set-up declined the run
    Skipped,
}

/// A reserved envelope, bound to its queue and execution context
#[derive(Clone)]
pub struct Job {
    pub queue: String,
    pub payload: Payload,
    /// Set by the worker that reserved this job
    pub worker_id: Option<String>,
    ctx: Context,
    /// Tracking flag cache; only `status::stop` could invalidate it, and an
    /// untracked job never becomes tracked again
    tracking: Option<bool>,
}

pub(crate) fn validate_create(queue: &str, class: &str) -> ResqResult<()> {
    if queue.trim().is_empty() {
        return Err(ResqError::config("queue name cannot be empty"));
    }
    if class.trim().is_empty() {
        return Err(ResqError::config("job class cannot be empty"));
    }
    Ok(())
}

impl Job {
    /// Enqueue a new job and return its id.
    ///
    /// With `track` set a status record is created in `Waiting` (or an
    /// existing record for a re-created id is transitioned there).
    pub async fn create(
        ctx: &Context,
        queue: &str,
        class: &str,
        args: Option<Value>,
        track: bool,
        id: Option<String>,
    ) -> ResqResult<String> {
        validate_create(queue, class)?;
        let id = id.unwrap_or_else(new_job_id);

        if track {
            if status::is_tracking(&ctx.store, &id).await? {
                status::update(&ctx.store, &id, Status::Waiting).await?;
            } else {
                status::create(&ctx.store, &id).await?;
            }
        }

        let payload = Payload::new(class, args, Some(id.clone()));
        queue::push(&ctx.store, queue, &payload).await?;

        ctx.events.fire(
            Hook::AfterEnqueue,
            &HookEvent {
                queue: Some(queue),
                class: Some(class),
                job_id: Some(&id),
                args: payload.args.as_deref(),
                ..HookEvent::default()
            },
        );
        Ok(id)
    }

    /// Reserve the next envelope from a queue
    pub async fn reserve(ctx: &Context, queue: &str) -> ResqResult<Option<Job>> {
        Ok(queue::pop(&ctx.store, queue)
            .await?
            .map(|payload| Job::bind(ctx, queue, payload)))
    }

    /// Reserve from several queues at once, blocking up to `timeout` seconds
    pub async fn reserve_blocking(
        ctx: &Context,
        queues: &[String],
        timeout: u64,
    ) -> ResqResult<Option<Job>> {
        Ok(queue::pop_blocking(&ctx.store, queues, timeout)
            .await?
            .map(|(queue, payload)| Job::bind(ctx, &queue, payload)))
    }

    fn bind(ctx: &Context, queue: &str, payload: Payload) -> Job {
        Job {
            queue: queue.to_string(),
            payload,
            worker_id: None,
            ctx: ctx.clone(),
            tracking: None,
        }
    }

    /// The single positional argument, or an empty array when absent
    pub fn arguments(&self) -> Value {
        self.payload.arguments()
    }

    /// Whether this job has a live status record
    pub async fn is_tracked(&mut self) -> ResqResult<bool> {
        if let Some(cached) = self.tracking {
            return Ok(cached);
        }
        let tracked = match &self.payload.id {
            Some(id) => status::is_tracking(&self.ctx.store, id).await?,
            None => false,
        };
        self.tracking = Some(tracked);
        Ok(tracked)
    }

    /// Transition this job's status record, if it has one
    pub async fn update_status(&mut self, state: Status) -> ResqResult<()> {
        let Some(id) = self.payload.id.clone() else {
            return Ok(());
        };
        if self.is_tracked().await? {
            status::update(&self.ctx.store, &id, state).await?;
        }
        Ok(())
    }

    /// Re-enqueue this job with the same class and arguments.
    ///
    /// The tracking flag of the original is carried over; a fresh id is
    /// generated and returned.
    pub async fn recreate(&mut self) -> ResqResult<String> {
        let track = self.is_tracked().await?;
        let args = self.payload.args.as_ref().and_then(|list| list.first()).cloned();
        let queue = self.queue.clone();
        let class = self.payload.class.clone();
        Job::create(&self.ctx, &queue, &class, args, track, None).await
    }

    /// Resolve this job's handler and run it.
    ///
    /// Returns [`Perform::Skipped`] when a `BeforePerform` hook or the
    /// handler's set-up declines the run; errors from the handler's perform
    /// or tear-down propagate as [`ResqError::JobThrew`].
    pub async fn perform(&mut self) -> ResqResult<Perform> {
        let handler = self
            .ctx
            .registry
            .get(&self.payload.class)
            .await
            .ok_or_else(|| {
                ResqError::not_creatable(self.payload.class.as_str(), "no handler registered")
            })?;

        let flow = self.ctx.events.fire(Hook::BeforePerform, &self.hook_event(None));
        if flow == HookFlow::Skip {
            info!("skipping job {} by hook request", self.describe());
            return Ok(Perform::Skipped);
        }

        let arguments = self.arguments();
        let job_info = JobInfo {
            id: self.payload.id.as_deref(),
            queue: &self.queue,
        };

        match handler.set_up(&arguments, &job_info).await {
            Ok(HookFlow::Skip) => {
                info!("skipping job {} by set-up request", self.describe());
                return Ok(Perform::Skipped);
            }
            Ok(HookFlow::Continue) => {}
            Err(err) => return Err(ResqError::JobThrew(err)),
        }

        handler
            .perform(&arguments, &job_info)
            .await
            .map_err(ResqError::JobThrew)?;
        handler
            .tear_down(&arguments, &job_info)
            .await
            .map_err(ResqError::JobThrew)?;

        self.ctx.events.fire(Hook::AfterPerform, &self.hook_event(None));
        Ok(Perform::Ran)
    }

    /// Record this job as failed: fire the failure hook, mark the status
    /// record, persist a failure record, and bump the failure counters.
    pub async fn fail(&mut self, err: &ResqError) -> ResqResult<()> {
        self.ctx.events.fire(Hook::OnFailure, &self.hook_event(Some(err)));

        self.update_status(Status::Failed).await?;

        let worker = self.worker_id.clone().unwrap_or_default();
        failure::record(&self.ctx.store, &self.payload, &self.queue, &worker, err).await?;

        stats::incr(&self.ctx.store, "failed").await?;
        if let Some(worker_id) = &self.worker_id {
            stats::incr(&self.ctx.store, &format!("failed:{}", worker_id)).await?;
        }
        Ok(())
    }

    /// Short human label used in logs
    pub fn describe(&self) -> String {
        match &self.payload.id {
            Some(id) => format!("{} ({}) on {}", self.payload.class, id, self.queue),
            None => format!("{} on {}", self.payload.class, self.queue),
        }
    }

    pub(crate) fn fire_hook(&self, hook: Hook) {
        self.ctx.events.fire(hook, &self.hook_event(None));
    }

    pub(crate) fn hook_event<'a>(&'a self, error: Option<&'a ResqError>) -> HookEvent<'a> {
        HookEvent {
            worker: self.worker_id.as_deref(),
            queue: Some(&self.queue),
            class: Some(&self.payload.class),
            job_id: self.payload.id.as_deref(),
            args: self.payload.args.as_deref(),
            error,
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("queue", &self.queue)
            .field("payload", &self.payload)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_id_is_32_hex_chars() {
        let id = new_job_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_job_id(), id);
    }

    #[test]
    fn test_live_envelope_wire_shape() {
        let payload = Payload::new(
            "Email::Send",
            Some(json!({"to": "ops@example.com"})),
            Some("00112233445566778899aabbccddeeff".to_string()),
        );
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            json,
            r#"{"class":"Email::Send","args":[{"to":"ops@example.com"}],"id":"00112233445566778899aabbccddeeff"}"#
        );
    }

    #[test]
    fn test_envelope_round_trip() {
        let payload = Payload::new("C", Some(json!([1, "two", null])), Some("A".to_string()));
        let json = serde_json::to_string(&payload).unwrap();
        let decoded: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_envelope_without_args_or_id() {
        let decoded: Payload = serde_json::from_str(r#"{"class":"C"}"#).unwrap();
        assert_eq!(decoded.class, "C");
        assert!(decoded.args.is_none());
        assert!(decoded.id.is_none());
        assert_eq!(decoded.arguments(), json!([]));
    }

    #[test]
    fn test_arguments_returns_first_positional() {
        let payload = Payload::new("C", Some(json!({"n": 7})), None);
        assert_eq!(payload.arguments(), json!({"n": 7}));
    }

    #[test]
    fn test_big_integer_arguments_survive_round_trip() {
        // 2^53 + 1 is not representable as an f64
        let wire = r#"{"class":"C","args":[9007199254740993],"id":"x"}"#;
        let decoded: Payload = serde_json::from_str(wire).unwrap();
        let encoded = serde_json::to_string(&decoded).unwrap();
        assert!(encoded.contains("9007199254740993"));
    }

    #[test]
    fn test_create_validation() {
        assert!(matches!(
            validate_create("", "C"),
            Err(ResqError::Config { .. })
        ));
        assert!(matches!(
            validate_create("q", "  "),
            Err(ResqError::Config { .. })
        ));
        assert!(validate_create("q", "C").is_ok());
    }
}
