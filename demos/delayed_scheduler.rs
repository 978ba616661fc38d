//! Delayed scheduler example
//!
//! Parks a few future-dated jobs, then runs the promoter until they have
//! all been moved onto their live queues.
//!
//! To run this example:
//! 1. Make sure Redis is running on localhost:6379
//! 2. Run: cargo run --example delayed_scheduler

use resq::{queue, scheduler, Context, DelayedScheduler, Store, StoreConfig};
use serde_json::json;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let store = Store::connect(StoreConfig::default()).await?;
    let ctx = Context::new(store.clone());

    for delay in [2i64, 4, 6] {
        let id = scheduler::enqueue_in(
            &ctx,
            delay,
            "mail",
            "Email::Send",
            Some(json!({"to": format!("in-{}s@example.com", delay)})),
            true,
        )
        .await?;
        info!("parked job {} for {}s from now", id, delay);
    }
    info!(
        "schedule now holds {} timestamps",
        scheduler::schedule_size(&store).await?
    );

    let promoter = DelayedScheduler::new(ctx);
    let shutdown = promoter.shutdown_handle();

    // stop the promoter once everything has matured
    let watcher_store = store.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            match scheduler::schedule_size(&watcher_store).await {
                Ok(0) => {
                    shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    info!("schedule size check failed: {}", err);
                }
            }
        }
    });

    promoter.run().await?;

    info!(
        "mail queue now holds {} jobs",
        queue::size(&store, "mail").await?
    );
    Ok(())
}
