//! Producer example
//!
//! Pushes a handful of jobs onto two queues and inspects queue sizes.
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example enqueue_jobs

use resq::{queue, scheduler, Context, Store, StoreConfig};
use serde_json::json;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let store = Store::connect(StoreConfig::default()).await?;
    let ctx = Context::new(store.clone());

    info!("enqueuing mail jobs");
    for recipient in ["amy@example.com", "ben@example.com", "cat@example.com"] {
        let id = resq::Job::create(
            &ctx,
            "mail",
            "Email::Send",
            Some(json!({"to": recipient, "subject": "Welcome!"})),
            true,
            None,
        )
        .await?;
        info!("enqueued Email::Send for {} as {}", recipient, id);
    }

    info!("enqueuing a report job");
    resq::Job::create(
        &ctx,
        "reports",
        "Report::Nightly",
        Some(json!({"day": "2024-01-01"})),
        false,
        None,
    )
    .await?;

    // park one job for a minute from now
    let id = scheduler::enqueue_in(
        &ctx,
        60,
        "mail",
        "Email::Send",
        Some(json!({"to": "late@example.com"})),
        false,
    )
    .await?;
    info!("scheduled delayed Email::Send as {}", id);

    for name in queue::queues(&store).await? {
        info!("queue {} holds {} jobs", name, queue::size(&store, &name).await?);
    }

    Ok(())
}
