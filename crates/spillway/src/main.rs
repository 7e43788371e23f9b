use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use spillway::logging::{init_logging, LoggingConfig};
use spillway::prelude::*;

/// Record persisted for every processed item
#[derive(Debug, Serialize)]
struct Processed {
    id: u64,
    outcome: String,
}

/// Simulated third-party call with variable latency
struct Upstream;

#[async_trait]
impl TimedCall for Upstream {
    type Config = u64;
    type Output = u64;

    async fn call(&self, id: &u64, _timeout: Duration) -> spillway::Result<u64> {
        let latency = Duration::from_millis(rand::thread_rng().gen_range(1..40));
        tokio::time::sleep(latency).await;
        Ok(id.wrapping_mul(2))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging(&LoggingConfig::from_env())?;

    tracing::info!("spillway starting...");

    let config = SpillwayConfig::from_env().context("Invalid spillway configuration")?;
    tracing::info!(
        pool = %config.pool.name,
        min_workers = config.pool.min_workers,
        max_workers = config.pool.max_workers,
        rate_cap = config.rate.max_calls_per_second,
        "Configuration loaded"
    );

    let sink = Arc::new(match &config.telemetry_path {
        Some(path) => {
            let writer = LineFileWriter::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            TelemetrySink::start(config.sink.clone(), writer)?
        }
        None => TelemetrySink::start(config.sink.clone(), MemoryWriter::new())?,
    });
    let controller = Arc::new(RateController::new(Upstream, config.rate.clone()));

    let handler = {
        let sink = Arc::clone(&sink);
        let controller = Arc::clone(&controller);
        item_handler(move |id: u64| {
            let sink = Arc::clone(&sink);
            let controller = Arc::clone(&controller);
            async move {
                let outcome = match controller
                    .attempt_call(&id, Duration::from_millis(100))
                    .await
                {
                    Ok(_) => "ok".to_string(),
                    Err(e) => e.kind().to_string(),
                };
                sink.offer_telemetry(
                    Processed { id, outcome },
                    Duration::from_millis(5),
                    Duration::ZERO,
                    true,
                )
                .await
                .map_err(|e| e.to_string())?;
                Ok(())
            }
        })
    };

    let pool = ElasticPool::with_handler(config.pool.clone(), handler)?;
    pool.start().await?;
    tracing::info!("Pool started, producing synthetic load until Ctrl-C");

    let mut producer = tokio::time::interval(Duration::from_millis(2));
    let mut reporter = tokio::time::interval(Duration::from_secs(5));
    let mut next_id = 0u64;
    let mut shed = 0u64;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = reporter.tick() => {
                let pool_stats = pool.stats();
                let sink_stats = sink.stats();
                let rate_stats = controller.stats();
                tracing::info!(
                    active_workers = pool_stats.active_workers,
                    queued = pool_stats.queued,
                    processed = pool_stats.processed,
                    shed,
                    admitted = rate_stats.admitted,
                    rate_limited = rate_stats.rejected,
                    written = sink_stats.written,
                    dropped = sink_stats.dropped,
                    sink_status = %sink_stats.status,
                    "Stats"
                );
            }
            _ = producer.tick() => {
                for _ in 0..5 {
                    if pool.offer(next_id, Duration::ZERO).await {
                        next_id += 1;
                    } else {
                        shed += 1;
                    }
                }
            }
        }
    }

    if let Err(e) = pool.shutdown(true).await {
        tracing::warn!(error = %e, "Pool did not shut down cleanly");
    }
    sink.shut_down("process exit").await;

    let sink_stats = sink.stats();
    tracing::info!(
        produced = next_id,
        written = sink_stats.written,
        dropped = sink_stats.dropped,
        "spillway shutdown complete"
    );
    Ok(())
}
