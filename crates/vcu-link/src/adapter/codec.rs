//! Per-dialect frame encoding and response line decoding
//!
//! Command-style (AT) wire format:
//!   Request:  `ATSH<ID:3hex>\r` then `<DATA:hex>\r`
//!   Response: `7BB 07 62 03 01 00 00 01 68` (headers on, spaces on)
//!             `7BB0762030100000168`          (headers on, spaces off)
//!             `07 62 03 01 00 00 01 68`     (headers off, id inferred)
//!
//! Frame-style (slcan) wire format:
//!   Standard: `t<ID:3hex><DLC:1hex><DATA:2hex*DLC>\r`

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{AdapterType, CanFrame, CanId, FrameError};
use crate::config::AdapterConfig;
use crate::error::LinkError;
use crate::registry::RequestDescriptor;

/// slcan bitrate commands (S0-S8)
const SLCAN_BITRATES: [(u32, &str); 9] = [
    (10_000, "S0"),    // 10 Kbit/s
    (20_000, "S1"),    // 20 Kbit/s
    (50_000, "S2"),    // 50 Kbit/s
    (100_000, "S3"),   // 100 Kbit/s
    (125_000, "S4"),   // 125 Kbit/s
    (250_000, "S5"),   // 250 Kbit/s
    (500_000, "S6"),   // 500 Kbit/s
    (750_000, "S7"),   // 750 Kbit/s
    (1_000_000, "S8"), // 1 Mbit/s
];

/// Status and banner lines an AT adapter prints between frames
const COMMAND_STYLE_SERVICE_LINES: &[&str] = &[
    "OK",
    "?",
    "ELM327",
    "NO DATA",
    "SEARCHING",
    "STOPPED",
    "BUS INIT",
    "BUS BUSY",
    "BUS ERROR",
    "CAN ERROR",
    "BUFFER FULL",
    "DATA ERROR",
    "FB ERROR",
    "UNABLE TO CONNECT",
];

/// Result of decoding one response line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A CAN frame addressed to us
    Frame(CanFrame),
    /// Adapter status, prompt, banner or echo; no effect
    Service,
    /// Matches no known format (adapter noise)
    Unparseable,
    /// Header-less response received before any request was sent
    MissingRequestContext,
}

/// Encoder/decoder for one adapter dialect
///
/// Selected once per connection by [`codec_for`] and used for every frame in
/// both directions.
pub trait FrameCodec: Send + Sync {
    fn adapter_type(&self) -> AdapterType;

    /// Wire writes that put `frame` on the bus, in order
    fn encode(&self, frame: &CanFrame) -> Vec<Vec<u8>>;

    /// Pause between consecutive writes returned by [`FrameCodec::encode`]
    fn inter_write_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Bus frame carrying a diagnostic request
    fn request_frame(&self, request: &RequestDescriptor) -> Result<CanFrame, FrameError>;

    /// Decode one response line
    ///
    /// `last_request_id` is the destination of the most recent request; it
    /// is needed when the adapter suppresses headers.
    fn decode(&self, line: &str, last_request_id: Option<CanId>) -> DecodeOutcome;

    /// Adapter commands sent once after detection
    fn init_commands(&self) -> Vec<String>;

    /// Adapter commands that allow raw 8-byte frames (bootloader transfer)
    fn raw_mode_commands(&self) -> &'static [&'static str];

    /// Adapter commands that undo [`FrameCodec::raw_mode_commands`]
    fn restore_commands(&self) -> &'static [&'static str];

    /// Wire bytes for an adapter command
    fn command(&self, command: &str) -> Vec<u8> {
        format!("{}\r", command).into_bytes()
    }
}

/// Resolve the codec for a detected adapter
pub fn codec_for(
    adapter: AdapterType,
    config: &AdapterConfig,
) -> Result<Arc<dyn FrameCodec>, LinkError> {
    match adapter {
        AdapterType::CommandStyle => Ok(Arc::new(CommandStyleCodec::new(
            config.inter_write_delay(),
        ))),
        AdapterType::FrameStyle => Ok(Arc::new(FrameStyleCodec::new(config.can_bitrate)?)),
        AdapterType::Unknown => Err(LinkError::UnsupportedAdapter),
    }
}

/// Response id for a request id when the adapter hides headers
///
/// `7DF` (functional) and `7E0`-`7E7` follow the OBD convention of +8.
/// Other `7XY` ids answer on `7(X+2)Y`, e.g. `79B` -> `7BB`.
pub fn response_id_for(request: CanId) -> Option<CanId> {
    let raw = request.raw();
    match raw {
        0x7DF => CanId::new(0x7E8),
        0x7E0..=0x7E7 => CanId::new(raw + 0x08),
        0x700..=0x7DE => CanId::new(raw + 0x20),
        _ => None,
    }
}

/// Strip prompts, control characters and surrounding whitespace
pub fn clean_line(line: &str) -> &str {
    line.trim_matches(|c: char| c.is_whitespace() || c.is_control() || c == '>')
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn parse_id(token: &str) -> Option<CanId> {
    token.parse().ok()
}

fn frame_or_noise(id: CanId, data_hex: &str) -> DecodeOutcome {
    match CanFrame::from_hex(id, data_hex) {
        Ok(frame) => DecodeOutcome::Frame(frame),
        Err(e) => {
            debug!(%id, data = data_hex, error = %e, "Undecodable frame data");
            DecodeOutcome::Unparseable
        }
    }
}

// =============================================================================
// Command-style (AT) codec
// =============================================================================

/// AT-command adapter codec (ELM327 and clones)
#[derive(Debug, Clone)]
pub struct CommandStyleCodec {
    inter_write_delay: Duration,
}

impl CommandStyleCodec {
    pub fn new(inter_write_delay: Duration) -> Self {
        Self { inter_write_delay }
    }

    fn is_service_line(line: &str) -> bool {
        let upper = line.to_ascii_uppercase();
        upper.starts_with("AT")
            || COMMAND_STYLE_SERVICE_LINES
                .iter()
                .any(|prefix| upper.starts_with(prefix))
    }
}

impl FrameCodec for CommandStyleCodec {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::CommandStyle
    }

    fn encode(&self, frame: &CanFrame) -> Vec<Vec<u8>> {
        vec![
            self.command(&format!("ATSH{}", frame.id)),
            self.command(&frame.data_hex()),
        ]
    }

    fn inter_write_delay(&self) -> Duration {
        self.inter_write_delay
    }

    fn request_frame(&self, request: &RequestDescriptor) -> Result<CanFrame, FrameError> {
        // The adapter adds the ISO-TP PCI byte itself
        if request.payload.len() > CanFrame::MAX_DATA - 1 {
            return Err(FrameError::TooLong(request.payload.len() + 1));
        }
        CanFrame::new(request.can_id, request.payload.clone())
    }

    fn decode(&self, line: &str, last_request_id: Option<CanId>) -> DecodeOutcome {
        let line = clean_line(line);
        if line.is_empty() || Self::is_service_line(line) {
            return DecodeOutcome::Service;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let first = tokens[0];

        // Space-delimited with header
        if tokens.len() > 1 && first.len() == 3 && is_hex(first) {
            return match parse_id(first) {
                Some(id) => frame_or_noise(id, &tokens[1..].concat()),
                None => DecodeOutcome::Unparseable,
            };
        }

        // No spaces, header present
        if let (1, Some(header)) = (tokens.len(), line.get(..3)) {
            if is_hex(header) {
                return match parse_id(header) {
                    Some(id) => frame_or_noise(id, &line[3..]),
                    None => DecodeOutcome::Unparseable,
                };
            }
        }

        // Headers suppressed: first token is the PCI/response-mode byte
        if first.len() == 2 && is_hex(first) {
            let Some(request_id) = last_request_id else {
                return DecodeOutcome::MissingRequestContext;
            };
            let Some(id) = response_id_for(request_id) else {
                debug!(%request_id, "No response id convention for request id");
                return DecodeOutcome::MissingRequestContext;
            };
            return frame_or_noise(id, &tokens.concat());
        }

        DecodeOutcome::Unparseable
    }

    fn init_commands(&self) -> Vec<String> {
        // ISO 15765-4 CAN 11-bit 500 kbit/s, headers on, auto formatting on
        vec!["ATSP6".into(), "ATH1".into(), "ATCAF1".into()]
    }

    fn raw_mode_commands(&self) -> &'static [&'static str] {
        &["ATCAF0", "ATAL"]
    }

    fn restore_commands(&self) -> &'static [&'static str] {
        &["ATCAF1", "ATD"]
    }
}

// =============================================================================
// Frame-style (slcan) codec
// =============================================================================

/// slcan (Serial Line CAN) ASCII protocol codec
#[derive(Debug, Clone)]
pub struct FrameStyleCodec {
    bitrate_command: &'static str,
}

impl FrameStyleCodec {
    pub fn new(bitrate: u32) -> Result<Self, LinkError> {
        Ok(Self {
            bitrate_command: find_bitrate_command(bitrate)?,
        })
    }

    fn is_service_line(line: &str) -> bool {
        // Transmit acks, version and serial number answers
        matches!(line.chars().next(), Some('z' | 'Z' | 'V' | 'v' | 'N'))
    }
}

/// Find the slcan bitrate command for a given bitrate
pub fn find_bitrate_command(bitrate: u32) -> Result<&'static str, LinkError> {
    SLCAN_BITRATES
        .iter()
        .find(|(rate, _)| *rate == bitrate)
        .map(|(_, cmd)| *cmd)
        .ok_or_else(|| {
            let valid: Vec<String> = SLCAN_BITRATES.iter().map(|(r, _)| r.to_string()).collect();
            LinkError::Config(format!(
                "Invalid CAN bitrate {}. Valid bitrates: {}",
                bitrate,
                valid.join(", ")
            ))
        })
}

impl FrameCodec for FrameStyleCodec {
    fn adapter_type(&self) -> AdapterType {
        AdapterType::FrameStyle
    }

    fn encode(&self, frame: &CanFrame) -> Vec<Vec<u8>> {
        let mut cmd = String::with_capacity(32);
        cmd.push('t');
        cmd.push_str(&frame.id.to_string());
        cmd.push_str(&format!("{:X}", frame.dlc()));
        cmd.push_str(&frame.data_hex());
        cmd.push('\r');
        vec![cmd.into_bytes()]
    }

    fn request_frame(&self, request: &RequestDescriptor) -> Result<CanFrame, FrameError> {
        // Raw adapter: prepend the ISO-TP single-frame PCI byte
        let len = request.payload.len();
        if len > CanFrame::MAX_DATA - 1 {
            return Err(FrameError::TooLong(len + 1));
        }
        let mut data = Vec::with_capacity(len + 1);
        data.push(len as u8);
        data.extend_from_slice(&request.payload);
        CanFrame::new(request.can_id, data)
    }

    fn decode(&self, line: &str, _last_request_id: Option<CanId>) -> DecodeOutcome {
        let line = clean_line(line);
        if line.is_empty() || Self::is_service_line(line) {
            return DecodeOutcome::Service;
        }

        let bytes = line.as_bytes();
        // prefix + ID + DLC
        if bytes[0] != b't' || bytes.len() < 5 || !line.is_char_boundary(5) {
            return DecodeOutcome::Unparseable;
        }

        let Some(id) = line.get(1..4).and_then(parse_id) else {
            return DecodeOutcome::Unparseable;
        };

        let dlc = match (bytes[4] as char).to_digit(16) {
            Some(dlc) if dlc <= 8 => dlc as usize,
            _ => return DecodeOutcome::Unparseable,
        };

        let data_end = 5 + dlc * 2;
        if line.len() < data_end || !line.is_char_boundary(data_end) {
            return DecodeOutcome::Unparseable;
        }

        // Anything after the data (slcan timestamps) is ignored
        frame_or_noise(id, &line[5..data_end])
    }

    fn init_commands(&self) -> Vec<String> {
        vec!["C".into(), self.bitrate_command.into(), "O".into()]
    }

    fn raw_mode_commands(&self) -> &'static [&'static str] {
        &[]
    }

    fn restore_commands(&self) -> &'static [&'static str] {
        &[]
    }
}
