//! Periodic parameter polling
//!
//! Each requested parameter gets its own timer. Every tick records a pending
//! request under its correlation key and writes the request; responses
//! arriving on the session's frame stream are matched against the pending
//! map and parsed into values for the [`UpdateSink`].

mod manager;

pub use manager::PollingEngine;

use serde_json::Value;
use thiserror::Error;

/// Receives parsed parameter values
pub trait UpdateSink: Send + Sync {
    fn on_update(&self, parameter_id: &str, value: &Value);
}

impl<F> UpdateSink for F
where
    F: Fn(&str, &Value) + Send + Sync,
{
    fn on_update(&self, parameter_id: &str, value: &Value) {
        self(parameter_id, value)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PollingError {
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Parameter {0} has a zero polling interval")]
    InvalidInterval(String),
}
