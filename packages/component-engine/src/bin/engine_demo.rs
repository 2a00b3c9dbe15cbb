//! Drives a small processor end to end: two producers, a thread-switching
//! policy and a graceful stop.
//!
//! ```text
//! RUST_LOG=debug cargo run --bin engine-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use component_engine::policy::{DefaultPolicyManager, ThreadSwitchPolicy};
use component_engine::{
    init_tracing, ComponentLocation, ComponentMessageProcessor, ComponentModel, ComponentOutput,
    EngineConfig, Event, ExecutionContext, FnExecutor, TypedValue,
};
use futures::StreamExt;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info,component_engine=debug");

    let config = EngineConfig::from_env()?;
    info!(?config, "starting engine demo");

    let executor = Arc::new(FnExecutor::new(|ctx: &ExecutionContext| {
        let text = ctx
            .event()
            .message()
            .payload()
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("expected a text payload"))?
            .to_uppercase();
        Ok(ComponentOutput::value(text))
    }));

    let policies = Arc::new(DefaultPolicyManager::new());
    policies.register(
        "thread-switch",
        |_, location| location.root_container() == "demo",
        Arc::new(ThreadSwitchPolicy::new().before(tokio::runtime::Handle::current())),
    );

    let processor = ComponentMessageProcessor::builder(
        ComponentModel::new("demo:uppercase", "demo"),
        executor,
    )
    .with_location(ComponentLocation::new("demo", "processors/0"))
    .with_policy_manager(policies)
    .completes_asynchronously(true)
    .with_config(config)
    .build()?;

    let producers = ["alpha", "beta"].map(|name| {
        let processor = processor.clone();
        tokio::spawn(async move {
            let events = (0..5).map(move |i| Event::of(TypedValue::from(format!("{name}-{i}"))));
            let mut results = processor.apply(futures::stream::iter(events));
            let mut answered = 0usize;
            while let Some(result) = results.next().await {
                match result {
                    Ok(event) => info!(
                        producer = name,
                        payload = ?event.message().payload(),
                        "processed"
                    ),
                    Err(failure) => warn!(producer = name, error = %failure, "event failed"),
                }
                answered += 1;
            }
            answered
        })
    });

    for producer in producers {
        let answered = producer.await?;
        info!(answered, "producer finished");
    }

    tokio::time::timeout(Duration::from_secs(10), processor.stop()).await??;
    processor.dispose()?;
    info!(
        state = %serde_json::to_string(&processor.mediator().state())?,
        "engine demo stopped"
    );
    Ok(())
}
