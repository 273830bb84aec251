//! Parameter registry
//!
//! Maps parameter ids to the request that reads them and the parser that
//! turns the response into a value. Built in code (closure parsers) or loaded
//! from TOML:
//!
//! ```toml
//! [[parameters]]
//! id = "battery_voltage"
//! name = "Battery voltage"
//! unit = "V"
//! can_id = "79B"
//! payload = "220301"
//! interval_ms = 1000
//! # response_can_id = "7BB"   (derived from can_id when omitted)
//!
//! [parameters.decode]
//! type = "scalar"
//! byte = 5
//! length = 2
//! ```

mod decode;

pub use decode::{ByteOrder, DecodeRule, FieldRule, FieldsRule, HexRule, ScalarRule};

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::adapter::{codec::response_id_for, decode_hex, CanId, FrameError};
use crate::uds;

/// Response parser: frame data hex in, value (or nothing) out
pub type Parser = Arc<dyn Fn(&str) -> Result<Option<Value>, ParseError> + Send + Sync>;

/// Parser failures; logged by the polling engine, never propagated
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid response data '{0}'")]
    InvalidData(String),

    #[error("Response too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid registry document: {0}")]
    Toml(String),

    #[error("Parameter '{id}': {reason}")]
    InvalidParameter { id: String, reason: String },

    #[error("Duplicate parameter id '{0}'")]
    Duplicate(String),
}

/// One diagnostic request: destination, payload and polling interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub can_id: CanId,
    pub payload: Vec<u8>,
    pub interval_ms: u64,
}

impl RequestDescriptor {
    pub fn new(can_id: CanId, payload_hex: &str, interval_ms: u64) -> Result<Self, FrameError> {
        Ok(Self {
            can_id,
            payload: decode_hex(payload_hex)?,
            interval_ms,
        })
    }

    pub fn payload_hex(&self) -> String {
        hex::encode_upper(&self.payload)
    }

    /// Service + identifier this request asks for
    pub fn pid(&self) -> String {
        uds::request_pid(&self.payload)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// A pollable parameter
#[derive(Clone)]
pub struct ParameterSpec {
    pub id: String,
    pub name: Option<String>,
    pub unit: Option<String>,
    pub request: RequestDescriptor,
    pub response_can_id: CanId,
    pub parser: Parser,
}

impl ParameterSpec {
    pub fn new<F>(
        id: impl Into<String>,
        request: RequestDescriptor,
        response_can_id: CanId,
        parser: F,
    ) -> Self
    where
        F: Fn(&str) -> Result<Option<Value>, ParseError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            name: None,
            unit: None,
            request,
            response_can_id,
            parser: Arc::new(parser),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Key a response to this parameter's request will carry
    pub fn correlation_key(&self) -> uds::CorrelationKey {
        uds::CorrelationKey::new(self.response_can_id, self.request.pid())
    }
}

impl fmt::Debug for ParameterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterSpec")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("response_can_id", &self.response_can_id)
            .finish_non_exhaustive()
    }
}

/// Registry document as written in TOML
#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    parameters: Vec<ParameterDef>,
}

#[derive(Debug, Deserialize)]
struct ParameterDef {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    can_id: String,
    payload: String,
    #[serde(default = "default_interval")]
    interval_ms: u64,
    #[serde(default)]
    response_can_id: Option<String>,
    decode: DecodeRule,
}

fn default_interval() -> u64 {
    1000
}

impl ParameterDef {
    fn into_spec(self) -> Result<ParameterSpec, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidParameter {
            id: self.id.clone(),
            reason,
        };

        let can_id: CanId = self.can_id.parse().map_err(|e: FrameError| invalid(e.to_string()))?;
        let request = RequestDescriptor::new(can_id, &self.payload, self.interval_ms)
            .map_err(|e| invalid(e.to_string()))?;
        if request.payload.is_empty() {
            return Err(invalid("empty request payload".to_string()));
        }
        if request.interval_ms == 0 {
            return Err(invalid("interval_ms must be positive".to_string()));
        }

        let response_can_id = match &self.response_can_id {
            Some(id) => id.parse().map_err(|e: FrameError| invalid(e.to_string()))?,
            None => response_id_for(can_id).ok_or_else(|| {
                invalid(format!(
                    "no response id convention for {}; set response_can_id",
                    can_id
                ))
            })?,
        };

        self.decode.validate().map_err(invalid)?;

        let rule = self.decode;
        let mut spec = ParameterSpec::new(self.id, request, response_can_id, move |data| {
            rule.apply(data)
        });
        spec.name = self.name;
        spec.unit = self.unit;
        Ok(spec)
    }
}

/// Parameter id -> spec, ordered by id
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    parameters: BTreeMap<String, ParameterSpec>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, returning the one it replaced
    pub fn insert(&mut self, spec: ParameterSpec) -> Option<ParameterSpec> {
        self.parameters.insert(spec.id.clone(), spec)
    }

    pub fn get(&self, id: &str) -> Option<&ParameterSpec> {
        self.parameters.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.parameters.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.parameters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters.values()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Parse a registry from a TOML document
    pub fn from_toml(content: &str) -> Result<Self, RegistryError> {
        let document: RegistryDocument =
            toml::from_str(content).map_err(|e| RegistryError::Toml(e.to_string()))?;

        let mut registry = Self::new();
        for def in document.parameters {
            let spec = def.into_spec()?;
            let id = spec.id.clone();
            if registry.insert(spec).is_some() {
                return Err(RegistryError::Duplicate(id));
            }
        }
        Ok(registry)
    }

    /// Load a registry from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| RegistryError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    const REGISTRY: &str = r#"
        [[parameters]]
        id = "battery_voltage"
        name = "Battery voltage"
        unit = "V"
        can_id = "79B"
        payload = "220301"
        interval_ms = 500

        [parameters.decode]
        type = "scalar"
        byte = 5
        length = 2

        [[parameters]]
        id = "drive_state"
        can_id = "790"
        payload = "220410"

        [parameters.decode]
        type = "fields"
        fields = [
            { name = "status", byte = 4, width = 4 },
            { name = "ready", byte = 4, bit = 7, width = 1 },
        ]
    "#;

    #[test]
    fn test_load_from_toml() {
        let registry = ParameterRegistry::from_toml(REGISTRY).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.ids().collect::<Vec<_>>(),
            vec!["battery_voltage", "drive_state"]
        );

        let voltage = registry.get("battery_voltage").unwrap();
        assert_eq!(voltage.request.payload_hex(), "220301");
        assert_eq!(voltage.request.interval_ms, 500);
        assert_eq!(voltage.response_can_id.to_string(), "7BB");
        assert_eq!(voltage.unit.as_deref(), Some("V"));
        assert_eq!((voltage.parser)("0762030100000168").unwrap(), Some(json!(1)));

        let state = registry.get("drive_state").unwrap();
        assert_eq!(state.response_can_id.to_string(), "7B0");
        assert_eq!(state.request.interval_ms, 1000);
        assert_eq!(
            (state.parser)("0562041083").unwrap(),
            Some(json!({"status": 3, "ready": true}))
        );
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let doc = r#"
            [[parameters]]
            id = "a"
            can_id = "79B"
            payload = "220301"
            decode = { type = "hex" }

            [[parameters]]
            id = "a"
            can_id = "79B"
            payload = "220302"
            decode = { type = "hex" }
        "#;
        assert!(matches!(
            ParameterRegistry::from_toml(doc),
            Err(RegistryError::Duplicate(id)) if id == "a"
        ));
    }

    #[test]
    fn test_invalid_parameter_rejected() {
        let bad_id = r#"
            [[parameters]]
            id = "a"
            can_id = "79"
            payload = "220301"
            decode = { type = "hex" }
        "#;
        assert!(matches!(
            ParameterRegistry::from_toml(bad_id),
            Err(RegistryError::InvalidParameter { .. })
        ));

        let zero_interval = r#"
            [[parameters]]
            id = "a"
            can_id = "79B"
            payload = "220301"
            interval_ms = 0
            decode = { type = "hex" }
        "#;
        assert!(ParameterRegistry::from_toml(zero_interval).is_err());

        let no_convention = r#"
            [[parameters]]
            id = "a"
            can_id = "123"
            payload = "220301"
            decode = { type = "hex" }
        "#;
        assert!(ParameterRegistry::from_toml(no_convention).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REGISTRY.as_bytes()).unwrap();

        let registry = ParameterRegistry::from_file(file.path()).unwrap();
        assert!(registry.contains("drive_state"));

        assert!(matches!(
            ParameterRegistry::from_file("/nonexistent/registry.toml"),
            Err(RegistryError::Io { .. })
        ));
    }

    #[test]
    fn test_programmatic_spec() {
        let can_id: CanId = "79B".parse().unwrap();
        let request = RequestDescriptor::new(can_id, "220301", 1000).unwrap();
        let spec = ParameterSpec::new("v", request, "7BB".parse().unwrap(), |_| Ok(None));

        assert_eq!(spec.correlation_key().to_string(), "7BB/220301");
    }
}
