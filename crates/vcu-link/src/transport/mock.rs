//! Mock channel for testing
//!
//! Simulates either adapter dialect closely enough to exercise detection,
//! polling and firmware transfer without hardware.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::{Channel, TransportError};
use crate::config::{MockConfig, MockDialect};

type WriteFailure = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Mock channel for testing
pub struct MockChannel {
    config: MockConfig,
    connected: AtomicBool,
    incoming_tx: mpsc::UnboundedSender<Option<Bytes>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<Bytes>>>,
    /// Scripted replies (command text -> reply text)
    responses: RwLock<Vec<(String, String)>>,
    /// Every command written, without its terminator
    writes: Mutex<Vec<String>>,
    write_failure: RwLock<Option<WriteFailure>>,
}

impl MockChannel {
    pub fn new(config: &MockConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            config: config.clone(),
            connected: AtomicBool::new(true),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            responses: RwLock::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            write_failure: RwLock::new(None),
        }
    }

    /// Mock adapter speaking the AT command dialect
    pub fn command_style() -> Self {
        Self::new(&MockConfig {
            dialect: MockDialect::CommandStyle,
            ..Default::default()
        })
    }

    /// Mock adapter speaking the slcan dialect
    pub fn frame_style() -> Self {
        Self::new(&MockConfig {
            dialect: MockDialect::FrameStyle,
            ..Default::default()
        })
    }

    /// Mock adapter that never answers
    pub fn silent() -> Self {
        Self::new(&MockConfig {
            dialect: MockDialect::Silent,
            ..Default::default()
        })
    }

    /// Reply with `reply` whenever `command` is written
    ///
    /// The reply is sent as-is; include the dialect's terminators.
    pub fn add_response(&self, command: impl Into<String>, reply: impl Into<String>) {
        self.responses.write().push((command.into(), reply.into()));
    }

    /// Inject bytes as if the adapter had sent them unsolicited
    pub fn inject(&self, data: impl Into<Bytes>) {
        let _ = self.incoming_tx.send(Some(data.into()));
    }

    /// Fail every write whose command text matches the predicate
    pub fn fail_writes_when<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        *self.write_failure.write() = Some(Box::new(predicate));
    }

    pub fn clear_write_failure(&self) {
        *self.write_failure.write() = None;
    }

    /// Commands written so far, terminators stripped
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    fn scripted_reply(&self, command: &str) -> Option<String> {
        self.responses
            .read()
            .iter()
            .find(|(cmd, _)| cmd.eq_ignore_ascii_case(command))
            .map(|(_, reply)| reply.clone())
    }

    fn default_reply(&self, command: &str) -> Option<String> {
        let upper = command.to_ascii_uppercase();
        match self.config.dialect {
            MockDialect::Silent => None,
            MockDialect::CommandStyle => {
                let body = if upper == "ATI" || upper == "ATZ" {
                    "ELM327 v1.5"
                } else if upper.starts_with("AT") {
                    "OK"
                } else if upper.chars().all(|c| c.is_ascii_hexdigit()) && upper.len() % 2 == 0 {
                    "NO DATA"
                } else {
                    "?"
                };
                Some(format!("{}\r\r>", body))
            }
            MockDialect::FrameStyle => {
                if command == "V" {
                    Some("V1013\r".to_string())
                } else if command.starts_with('t') || command.starts_with('T') {
                    Some("z\r".to_string())
                } else if command == "O" || command == "C" || upper.starts_with('S') {
                    Some("\r".to_string())
                } else {
                    Some("\x07".to_string())
                }
            }
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        // Simulate latency
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let text = String::from_utf8_lossy(bytes);
        for command in text.split(['\r', '\n']).filter(|c| !c.is_empty()) {
            if let Some(fail) = self.write_failure.read().as_ref() {
                if fail(command) {
                    return Err(TransportError::SendFailed(format!(
                        "mock write rejected: {}",
                        command
                    )));
                }
            }

            self.writes.lock().push(command.to_string());
            tracing::debug!(command, "Mock channel: received command");

            let reply = self
                .scripted_reply(command)
                .or_else(|| self.default_reply(command));
            if let Some(reply) = reply {
                let _ = self.incoming_tx.send(Some(Bytes::from(reply)));
            }
        }

        Ok(())
    }

    async fn read(&self) -> Result<Option<Bytes>, TransportError> {
        let mut rx = self.incoming_rx.lock().await;
        match rx.recv().await {
            Some(Some(data)) => Ok(Some(data)),
            Some(None) | None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.incoming_tx.send(None);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mock ({:?})", self.config.dialect)
    }
}
