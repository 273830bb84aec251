//! Declarative response decoding
//!
//! Offsets count bytes of the full frame data, PCI byte included:
//!
//! ```text
//! 07 62 03 01 00 00 01 68
//! ^0 ^1 ^2 ^3 ^4 ^5 ^6 ^7
//! PCI SID  DID   value...
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::ParseError;

/// First byte after PCI, response SID and 2-byte identifier
const DEFAULT_DATA_OFFSET: usize = 4;

/// How a parameter's response data becomes a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DecodeRule {
    /// One integer, scaled: `physical = raw * scale + offset`
    Scalar(ScalarRule),
    /// Named bit/byte sub-fields, producing a JSON object
    Fields(FieldsRule),
    /// Raw bytes as uppercase hex
    Hex(HexRule),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRule {
    #[serde(default = "default_data_offset")]
    pub byte: usize,
    #[serde(default = "default_length")]
    pub length: usize,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Raw value the ECU reports when the value is unavailable
    #[serde(default)]
    pub invalid: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldsRule {
    pub fields: Vec<FieldRule>,
}

/// Sub-field of one byte; a 1-bit field decodes to a bool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    pub byte: usize,
    /// Lowest bit of the field
    #[serde(default)]
    pub bit: u8,
    #[serde(default = "default_width")]
    pub width: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HexRule {
    #[serde(default = "default_data_offset")]
    pub byte: usize,
    /// Bytes to take; all remaining when absent
    #[serde(default)]
    pub length: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

fn default_data_offset() -> usize {
    DEFAULT_DATA_OFFSET
}

fn default_length() -> usize {
    2
}

fn default_scale() -> f64 {
    1.0
}

fn default_width() -> u8 {
    8
}

impl DecodeRule {
    /// Check the rule's shape once, at load time
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Scalar(rule) => {
                if !(1..=4).contains(&rule.length) {
                    return Err(format!("scalar length {} not in 1..=4", rule.length));
                }
                if rule.scale == 0.0 || !rule.scale.is_finite() {
                    return Err("scalar scale must be finite and non-zero".to_string());
                }
            }
            Self::Fields(rule) => {
                if rule.fields.is_empty() {
                    return Err("fields rule has no fields".to_string());
                }
                for field in &rule.fields {
                    if field.width == 0 || field.bit as u16 + field.width as u16 > 8 {
                        return Err(format!(
                            "field '{}' bits {}+{} exceed one byte",
                            field.name, field.bit, field.width
                        ));
                    }
                }
            }
            Self::Hex(_) => {}
        }
        Ok(())
    }

    /// Decode frame data (hex); `Ok(None)` means "no value"
    pub fn apply(&self, data_hex: &str) -> Result<Option<Value>, ParseError> {
        let data =
            hex::decode(data_hex).map_err(|_| ParseError::InvalidData(data_hex.to_string()))?;
        match self {
            Self::Scalar(rule) => decode_scalar(rule, &data),
            Self::Fields(rule) => decode_fields(rule, &data).map(Some),
            Self::Hex(rule) => decode_hex(rule, &data).map(Some),
        }
    }
}

fn slice(data: &[u8], start: usize, length: usize) -> Result<&[u8], ParseError> {
    data.get(start..start + length)
        .ok_or(ParseError::TooShort {
            needed: start + length,
            actual: data.len(),
        })
}

fn decode_scalar(rule: &ScalarRule, data: &[u8]) -> Result<Option<Value>, ParseError> {
    let bytes = slice(data, rule.byte, rule.length)?;

    let mut unsigned: u64 = 0;
    let ordered: Vec<u8> = match rule.byte_order {
        ByteOrder::Big => bytes.to_vec(),
        ByteOrder::Little => bytes.iter().rev().copied().collect(),
    };
    for b in ordered {
        unsigned = (unsigned << 8) | b as u64;
    }

    let raw: i64 = if rule.signed {
        let shift = 64 - rule.length as u32 * 8;
        ((unsigned << shift) as i64) >> shift
    } else {
        unsigned as i64
    };

    if rule.invalid == Some(raw) {
        return Ok(None);
    }

    let physical = raw as f64 * rule.scale + rule.offset;
    Ok(Some(to_json_number(physical)))
}

fn decode_fields(rule: &FieldsRule, data: &[u8]) -> Result<Value, ParseError> {
    let mut object = Map::new();
    for field in &rule.fields {
        let byte = slice(data, field.byte, 1)?[0];
        let mask = if field.width >= 8 {
            0xFF
        } else {
            (1u8 << field.width) - 1
        };
        let raw = (byte >> field.bit) & mask;
        let value = if field.width == 1 {
            Value::Bool(raw == 1)
        } else {
            json!(raw)
        };
        object.insert(field.name.clone(), value);
    }
    Ok(Value::Object(object))
}

fn decode_hex(rule: &HexRule, data: &[u8]) -> Result<Value, ParseError> {
    let bytes = match rule.length {
        Some(length) => slice(data, rule.byte, length)?,
        None => data.get(rule.byte..).unwrap_or_default(),
    };
    Ok(Value::String(hex::encode_upper(bytes)))
}

/// Whole numbers stay integers in JSON
fn to_json_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOLTAGE_FRAME: &str = "0762030100000168";

    fn scalar(byte: usize, length: usize) -> ScalarRule {
        ScalarRule {
            byte,
            length,
            byte_order: ByteOrder::Big,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            invalid: None,
        }
    }

    #[test]
    fn test_scalar_big_endian() {
        let rule = DecodeRule::Scalar(scalar(5, 2));
        assert_eq!(rule.apply(VOLTAGE_FRAME).unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_scalar_scaled_and_signed() {
        let rule = DecodeRule::Scalar(ScalarRule {
            signed: true,
            scale: 0.5,
            offset: -10.0,
            ..scalar(4, 1)
        });
        // 0xFE = -2 -> -2 * 0.5 - 10
        assert_eq!(rule.apply("056203AAFE").unwrap(), Some(json!(-11)));

        let little = DecodeRule::Scalar(ScalarRule {
            byte_order: ByteOrder::Little,
            scale: 0.1,
            ..scalar(4, 2)
        });
        assert_eq!(little.apply("066203AA0500").unwrap(), Some(json!(0.5)));
    }

    #[test]
    fn test_scalar_invalid_marker_is_null() {
        let rule = DecodeRule::Scalar(ScalarRule {
            invalid: Some(0xFFFF),
            ..scalar(4, 2)
        });
        assert_eq!(rule.apply("066203AAFFFF").unwrap(), None);
    }

    #[test]
    fn test_scalar_too_short() {
        let rule = DecodeRule::Scalar(scalar(6, 4));
        assert!(matches!(
            rule.apply(VOLTAGE_FRAME),
            Err(ParseError::TooShort { needed: 10, actual: 8 })
        ));
    }

    #[test]
    fn test_fields_object() {
        let rule = DecodeRule::Fields(FieldsRule {
            fields: vec![
                FieldRule {
                    name: "status".into(),
                    byte: 4,
                    bit: 0,
                    width: 4,
                },
                FieldRule {
                    name: "ready".into(),
                    byte: 4,
                    bit: 7,
                    width: 1,
                },
            ],
        });
        assert_eq!(
            rule.apply("056203108A").unwrap(),
            Some(json!({"status": 10, "ready": true}))
        );
    }

    #[test]
    fn test_hex_rule() {
        let rule = DecodeRule::Hex(HexRule {
            byte: 4,
            length: None,
        });
        assert_eq!(
            rule.apply(VOLTAGE_FRAME).unwrap(),
            Some(json!("00000168"))
        );
    }

    #[test]
    fn test_validate_rejects_wide_field() {
        let rule = DecodeRule::Fields(FieldsRule {
            fields: vec![FieldRule {
                name: "mode".into(),
                byte: 4,
                bit: 6,
                width: 4,
            }],
        });
        assert!(rule.validate().is_err());
    }
}
