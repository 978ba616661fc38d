//! Simple worker example
//!
//! This example demonstrates how to:
//! 1. Register job handlers by class name
//! 2. Enqueue a few jobs
//! 3. Run a worker that drains the queues and exits
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example simple_worker

use resq::{
    Context, Hook, HookFlow, Job, JobHandler, JobInfo, Store, StoreConfig, Worker, WorkerConfig,
};
use serde_json::{json, Value};
use tracing::{info, Level};

/// Pretends to deliver an email
struct SendEmail;

#[async_trait::async_trait]
impl JobHandler for SendEmail {
    async fn perform(&self, args: &Value, job: &JobInfo<'_>) -> anyhow::Result<()> {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        info!(
            "delivered mail to {} (job {:?} on {})",
            args["to"], job.id, job.queue
        );
        Ok(())
    }
}

/// A job that always blows up, to exercise the failure path
struct AlwaysFails;

#[async_trait::async_trait]
impl JobHandler for AlwaysFails {
    async fn perform(&self, _args: &Value, _job: &JobInfo<'_>) -> anyhow::Result<()> {
        anyhow::bail!("smtp relay refused the connection")
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let store = Store::connect(StoreConfig::default()).await?;
    let ctx = Context::new(store);

    ctx.registry.register("Email::Send", SendEmail).await;
    ctx.registry.register("AlwaysFails", AlwaysFails).await;

    // log every failure as it is recorded
    ctx.events.subscribe(Hook::OnFailure, |event| {
        info!(
            "failure hook: {:?} on {:?}",
            event.class, event.queue
        );
        HookFlow::Continue
    });

    info!("enqueuing test jobs");
    for i in 0..3 {
        Job::create(
            &ctx,
            "mail",
            "Email::Send",
            Some(json!({"to": format!("user{}@example.com", i)})),
            true,
            None,
        )
        .await?;
    }
    Job::create(&ctx, "mail", "AlwaysFails", None, false, None).await?;

    // interval 0 drains the queues once, then returns
    let config = WorkerConfig {
        interval: 0,
        ..WorkerConfig::default()
    };
    let worker = Worker::new(ctx, vec!["mail".to_string()], config)?;
    info!("starting worker {}", worker.id());
    worker.work().await?;

    info!("worker finished");
    Ok(())
}
