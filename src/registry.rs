//! Job handler registry (the job factory)
//!
//! Maps job class names to executable handlers. Handlers are registered
//! explicitly; reserving an envelope whose class has no registration is a
//! normal job failure, not a worker crash.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::events::HookFlow;

/// Facts about the job being executed, visible to its handler
#[derive(Debug, Clone, Copy)]
pub struct JobInfo<'a> {
    pub id: Option<&'a str>,
    pub queue: &'a str,
}

/// Executable unit resolved by class name.
///
/// `set_up` may veto the run by returning [`HookFlow::Skip`]; that outcome
/// is not a failure. Errors from `perform` and `tear_down` fail the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn set_up(&self, _args: &Value, _job: &JobInfo<'_>) -> anyhow::Result<HookFlow> {
        Ok(HookFlow::Continue)
    }

    async fn perform(&self, args: &Value, job: &JobInfo<'_>) -> anyhow::Result<()>;

    async fn tear_down(&self, _args: &Value, _job: &JobInfo<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Registry of job handlers by class name
#[derive(Default)]
pub struct JobRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job class
    pub async fn register<H>(&self, class: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        let class = class.into();
        self.handlers
            .write()
            .await
            .insert(class.clone(), Arc::new(handler));
        info!("registered job handler for {}", class);
    }

    /// Look up the handler for a job class
    pub async fn get(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(class).cloned()
    }

    /// Whether a handler is registered for a job class
    pub async fn contains(&self, class: &str) -> bool {
        self.handlers.read().await.contains_key(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopJob;

    #[async_trait]
    impl JobHandler for NoopJob {
        async fn perform(&self, _args: &Value, _job: &JobInfo<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = JobRegistry::new();
        registry.register("Email::Send", NoopJob).await;

        assert!(registry.contains("Email::Send").await);
        assert!(registry.get("Email::Send").await.is_some());
        assert!(registry.get("Unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_default_set_up_continues() {
        let handler = NoopJob;
        let job = JobInfo {
            id: Some("abc"),
            queue: "default",
        };
        let flow = handler.set_up(&Value::Null, &job).await.unwrap();
        assert_eq!(flow, HookFlow::Continue);
    }
}
