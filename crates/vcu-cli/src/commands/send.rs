//! Send command - one-off diagnostic request

use std::time::Duration;

use anyhow::{Context, Result};
use vcu_link::adapter::codec::response_id_for;
use vcu_link::{RequestDescriptor, Session};

use super::{collect_replies, parse_can_id, print_frames};
use crate::output::OutputContext;

/// Send `payload` to `can_id` once and print what comes back
pub async fn send(
    session: &Session,
    can_id: &str,
    payload: &str,
    listen: Duration,
    ctx: &OutputContext,
) -> Result<()> {
    let id = parse_can_id(can_id)?;
    let request = RequestDescriptor::new(id, payload, 0)
        .with_context(|| format!("Invalid payload '{}'", payload))?;

    let mut frames = session.frames();
    session
        .send_once(&request)
        .await
        .context("Failed to send request")?;
    ctx.info(&format!("Sent {} {}", id, request.payload_hex()));

    let replies = collect_replies(&mut frames, response_id_for(id), listen).await;
    if replies.is_empty() {
        ctx.warn(&format!("No reply within {} ms", listen.as_millis()));
    } else {
        print_frames(&replies, ctx);
    }
    Ok(())
}
