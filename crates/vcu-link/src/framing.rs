//! Response line reassembly
//!
//! Channels deliver arbitrary chunks; adapters speak in lines. The
//! reassembler buffers partial input and hands out complete lines.

use tracing::warn;

use crate::config::ReassemblyMode;

const PROMPT: char = '>';

/// Incremental line splitter for one channel
#[derive(Debug)]
pub struct LineReassembler {
    mode: ReassemblyMode,
    max_buffer: usize,
    buffer: String,
}

impl LineReassembler {
    pub fn new(mode: ReassemblyMode, max_buffer: usize) -> Self {
        Self {
            mode,
            max_buffer,
            buffer: String::new(),
        }
    }

    /// Append a chunk and return every line it completes
    ///
    /// Empty lines are dropped. Incomplete trailing input stays buffered for
    /// the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let lines = match self.mode {
            ReassemblyMode::Lines => self.take_lines(),
            ReassemblyMode::Prompt => self.take_prompted(),
        };

        if self.buffer.len() > self.max_buffer {
            warn!(
                buffered = self.buffer.len(),
                limit = self.max_buffer,
                "Discarding unterminated adapter output"
            );
            self.buffer.clear();
        }

        lines
    }

    /// Bytes held back waiting for a terminator
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn take_lines(&mut self) -> Vec<String> {
        let Some(end) = self.buffer.rfind(['\r', '\n']) else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(end + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);
        split_lines(&complete, &['\r', '\n'])
    }

    fn take_prompted(&mut self) -> Vec<String> {
        let Some(end) = self.buffer.rfind(PROMPT) else {
            return Vec::new();
        };
        let rest = self.buffer.split_off(end + PROMPT.len_utf8());
        let complete = std::mem::replace(&mut self.buffer, rest);
        split_lines(&complete, &['\r', '\n', PROMPT])
    }
}

fn split_lines(text: &str, separators: &[char]) -> Vec<String> {
    text.split(separators)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}
