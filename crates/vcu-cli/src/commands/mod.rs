//! Command implementations for vcuctl

pub mod detect;
pub mod flash;
pub mod monitor;
pub mod params;
pub mod send;
pub mod write;

pub use detect::detect;
pub use flash::flash;
pub use monitor::monitor;
pub use params::params;
pub use send::send;
pub use write::write;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use vcu_link::{CanFrame, CanId};

use crate::output::{FrameRow, OutputContext};

/// Parse a 3-digit hex CAN identifier
pub(crate) fn parse_can_id(raw: &str) -> Result<CanId> {
    raw.parse()
        .with_context(|| format!("Invalid CAN id '{}'", raw))
}

/// Collect frames from `expected` until `window` elapses
pub(crate) async fn collect_replies(
    frames: &mut broadcast::Receiver<CanFrame>,
    expected: Option<CanId>,
    window: Duration,
) -> Vec<CanFrame> {
    let mut replies = Vec::new();
    let deadline = tokio::time::Instant::now() + window;

    loop {
        match tokio::time::timeout_at(deadline, frames.recv()).await {
            Ok(Ok(frame)) => {
                if expected.map_or(true, |id| frame.id == id) {
                    replies.push(frame);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::warn!(skipped, "Frame listener lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
        }
    }

    replies
}

pub(crate) fn print_frames(frames: &[CanFrame], ctx: &OutputContext) {
    let now = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
    let rows: Vec<FrameRow> = frames
        .iter()
        .map(|frame| FrameRow {
            timestamp: now.clone(),
            can_id: frame.id.to_string(),
            data: frame.data_hex(),
        })
        .collect();
    ctx.print(&rows);
}
