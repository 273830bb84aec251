//! Write command - UDS write data by identifier

use std::time::Duration;

use anyhow::{bail, Context, Result};
use vcu_link::adapter::codec::response_id_for;
use vcu_link::uds::{self, service_id};
use vcu_link::{RequestDescriptor, Session};

use super::{collect_replies, parse_can_id, print_frames};
use crate::output::OutputContext;

/// Write `data` to data identifier `did` on the unit at `can_id`
pub async fn write(
    session: &Session,
    can_id: &str,
    did: &str,
    data: &str,
    listen: Duration,
    ctx: &OutputContext,
) -> Result<()> {
    let id = parse_can_id(can_id)?;
    let did = parse_did(did)?;
    let data = hex::decode(data).with_context(|| format!("Invalid data '{}'", data))?;

    let request = RequestDescriptor {
        can_id: id,
        payload: uds::write_data_by_identifier(did, &data),
        interval_ms: 0,
    };

    let mut frames = session.frames();
    session
        .send_once(&request)
        .await
        .context("Failed to send write request")?;

    let replies = collect_replies(&mut frames, response_id_for(id), listen).await;
    let positive = service_id::WRITE_DATA_BY_ID + service_id::POSITIVE_RESPONSE_OFFSET;
    for reply in &replies {
        if let Some((sid, nrc)) = uds::negative_response(&reply.data_hex()) {
            bail!(
                "Write rejected: service 0x{:02X}, NRC 0x{:02X}",
                sid,
                nrc
            );
        }
        if reply.data.get(1) == Some(&positive) {
            ctx.success(&format!("Wrote {:04X} = {}", did, hex::encode_upper(&data)));
            return Ok(());
        }
    }

    if replies.is_empty() {
        ctx.warn(&format!("No reply within {} ms", listen.as_millis()));
    } else {
        ctx.warn("No positive response; frames received:");
        print_frames(&replies, ctx);
    }
    Ok(())
}

/// Parse a data identifier given as hex, with or without `0x`
fn parse_did(raw: &str) -> Result<u16> {
    let digits = raw.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).with_context(|| format!("Invalid data identifier '{}'", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_did() {
        assert_eq!(parse_did("0301").unwrap(), 0x0301);
        assert_eq!(parse_did("0xF190").unwrap(), 0xF190);
        assert!(parse_did("XYZ").is_err());
        assert!(parse_did("12345").is_err());
    }
}
