//! Minimal end-to-end usage: an engine over the reqwest transport with
//! priorities, retries, and lifecycle listeners.
//!
//! Run with: `cargo run --example basic`

use retryq::prelude::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber_init();

    let transport = Arc::new(HttpTransport::new()?);
    let engine = RetryEngine::new(
        transport,
        EngineConfig::builder()
            .retries(3)
            .max_concurrent_requests(5)
            .blocking_queue_threshold(Priority::Critical)
            .build(),
    )?;

    engine.on(
        EventKind::BeforeRetry,
        Arc::new(|event: &RetryEvent| {
            if let RetryEvent::BeforeRetry(descriptor) = event {
                println!("retrying {} (attempt {})", descriptor.id, descriptor.attempt);
            }
        }),
    );

    let response = engine
        .execute(
            RequestOptions::new(TransportRequest::get("https://httpbin.org/status/200"))
                .with_priority(Priority::High),
        )
        .await?;

    if let Some(response) = response {
        println!("status: {}", response.status);
    }

    let metrics = engine.metrics();
    println!("requests: {}", metrics.total_requests);
    println!(
        "retries: {} ok / {} failed",
        metrics.successful_retries, metrics.failed_retries
    );

    engine.destroy();
    Ok(())
}

fn tracing_subscriber_init() {
    // Keep the example dependency-light: events from the engine are visible
    // through the listener above; wire tracing-subscriber here if you want
    // the engine's debug logs too.
}
