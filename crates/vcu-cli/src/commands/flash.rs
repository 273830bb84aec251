//! Flash command - firmware update over the bootloader protocol

use std::path::Path;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use vcu_link::firmware::block_count;
use vcu_link::{DeviceToken, FlashState, ProgressSink, Session};

use crate::output::OutputContext;

/// Drives an indicatif bar from transfer callbacks
struct ProgressBarSink {
    pb: ProgressBar,
}

impl ProgressSink for ProgressBarSink {
    fn on_progress(&self, current: u32, total: u32) {
        self.pb.set_length(u64::from(total));
        self.pb.set_position(u64::from(current));
    }

    fn on_state(&self, state: FlashState) {
        self.pb.set_message(state.to_string());
    }
}

/// Flash the firmware in `file_path` to the unit identified by `token`
pub async fn flash(
    session: &Session,
    file_path: &Path,
    token: &str,
    ctx: &OutputContext,
) -> Result<()> {
    ctx.info(&format!("Reading firmware from {}...", file_path.display()));
    let firmware = std::fs::read(file_path)
        .with_context(|| format!("Failed to read firmware file: {}", file_path.display()))?;
    let token = DeviceToken::from_hex(token).context("Invalid device token")?;

    let blocks = block_count(firmware.len());
    ctx.info(&format!(
        "Firmware size: {} bytes ({} blocks)",
        firmware.len(),
        blocks
    ));

    let pb = ProgressBar::new(blocks as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} blocks {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("=>-"),
    );
    let sink = ProgressBarSink { pb };

    match session.run_firmware_transfer(&firmware, &token, &sink).await {
        Ok(report) => {
            sink.pb.finish_with_message("Complete!");
            if !report.adapter_restored {
                ctx.warn("Adapter did not accept its restore commands; reconnect before polling");
            }
            ctx.success(&format!(
                "\nFirmware update completed: {} blocks in {:.1}s (job {})",
                report.total_blocks,
                report.elapsed.as_secs_f64(),
                report.job_id
            ));
            Ok(())
        }
        Err(e) => {
            sink.pb.abandon_with_message("Flash failed!");
            Err(e).context("Firmware transfer failed")
        }
    }
}
