//! UDS (Unified Diagnostic Services) helpers
//!
//! Only the single-frame read/write-by-identifier subset used for parameter
//! polling is covered.

use std::fmt;

use crate::adapter::CanId;

/// Standard UDS service ID constants
pub mod service_id {
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    /// Added to a request SID to form its positive response SID
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
}

/// Hex characters of a read response needed to correlate it:
/// PCI length byte, response SID, 2-byte identifier
const MIN_RESPONSE_HEX: usize = 8;

/// Request payload bytes naming a parameter (service + identifier)
const PID_BYTES: usize = 3;

/// Identity of an outstanding request: where the answer comes from and
/// which service + identifier it answers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub response_id: CanId,
    pub request_pid: String,
}

impl CorrelationKey {
    pub fn new(response_id: CanId, request_pid: impl Into<String>) -> Self {
        Self {
            response_id,
            request_pid: request_pid.into().to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.response_id, self.request_pid)
    }
}

/// Service + identifier portion of a request payload, uppercase hex
///
/// `22 03 01` -> `"220301"`. Shorter payloads use all their bytes.
pub fn request_pid(payload: &[u8]) -> String {
    hex::encode_upper(&payload[..payload.len().min(PID_BYTES)])
}

/// Request PID answered by a positive read-by-identifier response
///
/// `data_hex` is the full frame data including the PCI byte, e.g.
/// `0762030100000168` -> `Some("220301")`. Anything that is not a `62`
/// response is `None`.
pub fn answered_read_pid(data_hex: &str) -> Option<String> {
    let head = data_hex.get(..MIN_RESPONSE_HEX)?;
    if !head.is_ascii() {
        return None;
    }
    let positive = service_id::READ_DATA_BY_ID + service_id::POSITIVE_RESPONSE_OFFSET;
    let sid = u8::from_str_radix(&head[2..4], 16).ok()?;
    if sid != positive {
        return None;
    }
    let identifier = &head[4..8];
    if !identifier.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!(
        "{:02X}{}",
        service_id::READ_DATA_BY_ID,
        identifier.to_ascii_uppercase()
    ))
}

/// `(rejected SID, NRC)` if `data_hex` is a negative response frame
pub fn negative_response(data_hex: &str) -> Option<(u8, u8)> {
    let data = hex::decode(data_hex).ok()?;
    match data.as_slice() {
        [_, service_id::NEGATIVE_RESPONSE, sid, nrc, ..] => Some((*sid, *nrc)),
        _ => None,
    }
}

/// Payload writing `data` to one data identifier
pub fn write_data_by_identifier(did: u16, data: &[u8]) -> Vec<u8> {
    let [hi, lo] = did.to_be_bytes();
    let mut payload = Vec::with_capacity(3 + data.len());
    payload.extend_from_slice(&[service_id::WRITE_DATA_BY_ID, hi, lo]);
    payload.extend_from_slice(data);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_pid() {
        assert_eq!(request_pid(&[0x22, 0x03, 0x01]), "220301");
        assert_eq!(request_pid(&[0x2E, 0x03, 0x01, 0xAA]), "2E0301");
        assert_eq!(request_pid(&[0x3E]), "3E");
    }

    #[test]
    fn test_answered_read_pid() {
        assert_eq!(
            answered_read_pid("0762030100000168"),
            Some("220301".to_string())
        );
        assert_eq!(answered_read_pid("056203ab"), Some("2203AB".to_string()));
        // Negative response
        assert_eq!(answered_read_pid("037F2231"), None);
        // Too short
        assert_eq!(answered_read_pid("036203"), None);
    }

    #[test]
    fn test_negative_response() {
        assert_eq!(negative_response("037F2231"), Some((0x22, 0x31)));
        assert_eq!(negative_response("0762030100000168"), None);
    }

    #[test]
    fn test_write_payload() {
        assert_eq!(
            write_data_by_identifier(0x0301, &[0x00, 0x01]),
            vec![0x2E, 0x03, 0x01, 0x00, 0x01]
        );
    }

    #[test]
    fn test_correlation_key_normalises_case() {
        let id: CanId = "7BB".parse().unwrap();
        assert_eq!(
            CorrelationKey::new(id, "2203ab"),
            CorrelationKey::new(id, "2203AB")
        );
        assert_eq!(CorrelationKey::new(id, "220301").to_string(), "7BB/220301");
    }
}
