//! Adapter dialect detection
//!
//! A single query cannot tell the dialects apart: AT adapters may echo, and
//! slcan adapters answer BEL to anything they do not understand. Detection
//! therefore runs a short cascade and stops at the first definitive answer:
//!
//! 1. `ATE0` answered with `OK` -> command-style
//! 2. `ATI` answer contains `ELM327` -> command-style
//! 3. `V` answer contains `ELM327` -> command-style, a short alphanumeric
//!    token (slcan version) -> frame-style
//!
//! Anything else is [`AdapterType::Unknown`].

use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use super::AdapterType;
use crate::config::DetectConfig;
use crate::transport::{Channel, TransportError};

const IDENTIFICATION: &str = "ELM327";
const MAX_VERSION_TOKEN: usize = 8;

/// Classify the adapter behind `channel`
///
/// Must run before the session reader starts, since it reads the channel
/// directly. Transport errors propagate; silence is not an error.
pub async fn detect(
    channel: &dyn Channel,
    config: &DetectConfig,
) -> Result<AdapterType, TransportError> {
    let reply = query(channel, "ATE0", config).await?;
    if reply_lines(&reply).any(|line| line.eq_ignore_ascii_case("OK")) {
        info!("Adapter acknowledged echo-off");
        return Ok(AdapterType::CommandStyle);
    }

    let reply = query(channel, "ATI", config).await?;
    if contains_identification(&reply) {
        info!("Adapter identified itself");
        return Ok(AdapterType::CommandStyle);
    }

    let reply = query(channel, "V", config).await?;
    if contains_identification(&reply) {
        return Ok(AdapterType::CommandStyle);
    }
    if is_version_token(&reply) {
        info!(version = clean(&reply), "Adapter answered version query");
        return Ok(AdapterType::FrameStyle);
    }

    debug!("No handshake step produced a definitive answer");
    Ok(AdapterType::Unknown)
}

/// Send adapter commands one by one, discarding their replies
pub(crate) async fn send_commands(
    channel: &dyn Channel,
    commands: &[String],
    config: &DetectConfig,
) -> Result<(), TransportError> {
    for command in commands {
        let reply = query(channel, command, config).await?;
        debug!(command = %command, reply = clean(&reply), "Adapter command answered");
    }
    Ok(())
}

async fn query(
    channel: &dyn Channel,
    command: &str,
    config: &DetectConfig,
) -> Result<String, TransportError> {
    debug!(command, "Querying adapter");
    channel.write(format!("{}\r", command).as_bytes()).await?;
    collect_reply(channel, config.step_timeout(), config.quiet()).await
}

/// Read until a `>` prompt, until `quiet` passes after a terminated line, or
/// until `step_timeout` expires, whichever comes first
async fn collect_reply(
    channel: &dyn Channel,
    step_timeout: Duration,
    quiet: Duration,
) -> Result<String, TransportError> {
    let deadline = Instant::now() + step_timeout;
    let mut reply = String::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let wait = if ends_with_terminator(&reply) {
            remaining.min(quiet)
        } else {
            remaining
        };

        match timeout(wait, channel.read()).await {
            Ok(Ok(Some(chunk))) => {
                reply.push_str(&String::from_utf8_lossy(&chunk));
                if reply.contains('>') {
                    break;
                }
            }
            Ok(Ok(None)) => return Err(TransportError::ConnectionClosed),
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }

    Ok(reply)
}

fn ends_with_terminator(reply: &str) -> bool {
    reply.ends_with(['\r', '\n', '\x07'])
}

fn clean(reply: &str) -> &str {
    reply.trim_matches(|c: char| c.is_whitespace() || c.is_control() || c == '>')
}

fn reply_lines(reply: &str) -> impl Iterator<Item = &str> {
    reply
        .split(['\r', '\n'])
        .map(clean)
        .filter(|line| !line.is_empty())
}

fn contains_identification(reply: &str) -> bool {
    reply.to_ascii_uppercase().contains(IDENTIFICATION)
}

fn is_version_token(reply: &str) -> bool {
    let token = clean(reply);
    (1..=MAX_VERSION_TOKEN).contains(&token.len())
        && token.chars().all(|c| c.is_ascii_alphanumeric())
}
