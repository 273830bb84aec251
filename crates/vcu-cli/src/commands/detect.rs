//! Detect command - identify the adapter dialect

use anyhow::{bail, Context, Result};
use vcu_link::{create_channel, AdapterType, LinkConfig};

use crate::output::OutputContext;

/// Run the detection cascade on the configured channel and report the dialect
///
/// Fails when none of the handshake steps gets a definitive answer.
pub async fn detect(config: &LinkConfig, ctx: &OutputContext) -> Result<()> {
    let channel = create_channel(&config.transport)
        .await
        .context("Failed to open adapter channel")?;
    let description = channel.describe();
    ctx.info(&format!("Detecting adapter on {}...", description));

    let detected = vcu_link::adapter::detect(&*channel, &config.detect).await;
    if let Err(e) = channel.close().await {
        tracing::debug!(error = %e, "Channel close failed");
    }
    let adapter = detected.context("Adapter detection failed")?;

    if adapter == AdapterType::Unknown {
        bail!(
            "No supported adapter answered on {} (tried ATE0, ATI, V)",
            description
        );
    }

    ctx.print_kv(&[
        ("Channel", description),
        ("Adapter", adapter.to_string()),
    ]);
    Ok(())
}
