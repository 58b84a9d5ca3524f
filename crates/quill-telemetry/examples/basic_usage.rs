//! Basic pipeline usage example
//!
//! Initializes the global logger, binds a request context, emits a few events and
//! prints the pipeline health at the end.
//!
//! Run with: cargo run --example basic_usage

use quill_telemetry::context::{self, CorrelationContext};
use quill_telemetry::{instrument_request, HttpRequestInfo, Level, TelemetryConfig, TelemetrySystem};
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
#[error("inventory service unavailable")]
struct InventoryDown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config = TelemetryConfig::default();
    config.service.name = "example-shop".to_string();
    config.logging.log_dir = PathBuf::from("./example_logs");
    config.logging.timezone = "+09:00".to_string();
    config.logging.install_tracing_bridge = true;

    let guard = TelemetrySystem::init(config)?;
    let logger = guard.logger().clone();

    // Plain event inside a manually bound unit of work
    context::scope(CorrelationContext::for_request(None), async {
        quill_telemetry::event(Level::Info, "user_fetched")
            .message("User fetched")
            .context(json!({ "user_id": 7 }))
            .emit();
    })
    .await;

    // A request that fails, with the error attached
    let request = HttpRequestInfo::new("POST", "/orders").with_client_ip("203.0.113.9");
    let _ = instrument_request(&logger, request, async {
        let err = InventoryDown;
        quill_telemetry::event(Level::Error, "inventory_check_failed")
            .query(json!({ "sql": "SELECT qty FROM stock WHERE sku = $1", "params": ["sku-1"] }))
            .exception(&err)
            .emit();
        Err::<u16, _>(err)
    })
    .await;

    // tracing events reach the pipeline through the bridge
    tracing::warn!(event = "cache_cold", region = "ap-northeast-2", "Cache is cold");

    println!("{}", serde_json::to_string_pretty(&logger.health())?);
    Ok(())
}
