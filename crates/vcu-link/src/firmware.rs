//! Bootloader block transfer
//!
//! The target bootloader has no acknowledgements; fixed delays pace the
//! transfer. Wire sequence on the firmware request id:
//!
//! ```text
//! EF BE AD DE <token reversed>        wake (DEADBEEF reversed), then settle
//! FF <lo(i)> <hi(i)> <4 data bytes>   one frame per block, i = 0..N-1
//! DE FA DE C0                         finalize (C0DEFADE reversed)
//! ```
//!
//! States run strictly forward:
//! `Idle -> PreparingAdapter -> EnteringBootloader -> TransferringBlocks ->
//! Finalizing -> RestoringAdapter -> Succeeded | Failed`.
//! Adapter restore is attempted after any failure past `Idle`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapter::{AdapterType, CanFrame, CanId};
use crate::config::FirmwareConfig;
use crate::session::FrameSink;
use crate::transport::TransportError;

const WAKE_MAGIC: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
const FINALIZE_MAGIC: [u8; 4] = [0xC0, 0xDE, 0xFA, 0xDE];
const BLOCK_SENTINEL: u8 = 0xFF;

/// Firmware bytes carried per block
pub const BLOCK_SIZE: usize = 4;
/// Block addresses are 16 bits
pub const MAX_BLOCKS: usize = 1 << 16;
const MAX_TOKEN_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashState {
    Idle,
    PreparingAdapter,
    EnteringBootloader,
    TransferringBlocks,
    Finalizing,
    RestoringAdapter,
    Succeeded,
    Failed,
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PreparingAdapter => "preparing adapter",
            Self::EnteringBootloader => "entering bootloader",
            Self::TransferringBlocks => "transferring blocks",
            Self::Finalizing => "finalizing",
            Self::RestoringAdapter => "restoring adapter",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashErrorKind {
    #[error("firmware image is empty")]
    EmptyImage,

    #[error("firmware image needs {0} blocks (max 65536)")]
    ImageTooLarge(usize),

    #[error("invalid device token '{0}': expected 1-4 bytes of hex")]
    InvalidToken(String),

    #[error("invalid firmware request id: {0}")]
    InvalidRequestId(String),

    #[error("adapter {0} cannot carry firmware frames")]
    UnsupportedAdapter(AdapterType),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A firmware transfer failure and the state it happened in
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("firmware transfer failed while {state}: {kind}")]
pub struct FlashError {
    pub state: FlashState,
    pub kind: FlashErrorKind,
}

impl FlashError {
    pub fn new(state: FlashState, kind: impl Into<FlashErrorKind>) -> Self {
        Self {
            state,
            kind: kind.into(),
        }
    }
}

/// Device authorization token, 1-4 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceToken(Vec<u8>);

impl DeviceToken {
    pub fn from_hex(token: &str) -> Result<Self, FlashError> {
        let invalid = || {
            FlashError::new(
                FlashState::Idle,
                FlashErrorKind::InvalidToken(token.to_string()),
            )
        };
        let bytes = hex::decode(token.trim()).map_err(|_| invalid())?;
        if bytes.is_empty() || bytes.len() > MAX_TOKEN_BYTES {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.0))
    }
}

/// Reverse the byte order of a sequence
pub fn reverse_bytes(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// Number of blocks an image of `len` bytes takes
pub fn block_count(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE)
}

/// Frame data for block `index`, zero padded
pub fn block_payload(image: &[u8], index: usize) -> Vec<u8> {
    let start = index * BLOCK_SIZE;
    let end = (start + BLOCK_SIZE).min(image.len());
    let [lo, hi] = (index as u16).to_le_bytes();

    let mut payload = Vec::with_capacity(3 + BLOCK_SIZE);
    payload.extend_from_slice(&[BLOCK_SENTINEL, lo, hi]);
    if start < end {
        payload.extend_from_slice(&image[start..end]);
    }
    payload.resize(3 + BLOCK_SIZE, 0x00);
    payload
}

/// Receives transfer progress
pub trait ProgressSink: Send + Sync {
    /// Called after every block with `(blocks sent, total blocks)`
    fn on_progress(&self, current: u32, total: u32);

    fn on_state(&self, _state: FlashState) {}
}

impl<F> ProgressSink for F
where
    F: Fn(u32, u32) + Send + Sync,
{
    fn on_progress(&self, current: u32, total: u32) {
        self(current, total)
    }
}

/// One flash attempt
#[derive(Debug, Clone)]
pub struct FirmwareTransferJob {
    pub id: Uuid,
    pub total_blocks: u32,
    pub current_block: u32,
    pub device_token: DeviceToken,
    pub state: FlashState,
}

impl FirmwareTransferJob {
    fn new(total_blocks: u32, device_token: DeviceToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            total_blocks,
            current_block: 0,
            device_token,
            state: FlashState::Idle,
        }
    }
}

/// Outcome of a successful transfer
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareReport {
    pub job_id: Uuid,
    pub total_blocks: u32,
    /// Whether the adapter accepted its restore commands
    pub adapter_restored: bool,
    pub elapsed: Duration,
}

/// Drives the bootloader block transfer over a [`FrameSink`]
pub struct FirmwareTransfer {
    sink: Arc<dyn FrameSink>,
    config: FirmwareConfig,
}

impl FirmwareTransfer {
    pub fn new(sink: Arc<dyn FrameSink>, config: FirmwareConfig) -> Self {
        Self { sink, config }
    }

    /// Flash `image` and return once the job reaches a terminal state
    #[instrument(skip(self, image, progress), fields(image_len = image.len()))]
    pub async fn run(
        &self,
        image: &[u8],
        token: &DeviceToken,
        progress: &dyn ProgressSink,
    ) -> Result<FirmwareReport, FlashError> {
        let idle = |kind: FlashErrorKind| FlashError::new(FlashState::Idle, kind);

        let request_id: CanId = self
            .config
            .request_can_id
            .parse()
            .map_err(|e: crate::adapter::FrameError| {
                idle(FlashErrorKind::InvalidRequestId(e.to_string()))
            })?;
        if image.is_empty() {
            return Err(idle(FlashErrorKind::EmptyImage));
        }
        let blocks = block_count(image.len());
        if blocks > MAX_BLOCKS {
            return Err(idle(FlashErrorKind::ImageTooLarge(blocks)));
        }
        let adapter = self.sink.adapter_type();
        if adapter == AdapterType::Unknown {
            return Err(idle(FlashErrorKind::UnsupportedAdapter(adapter)));
        }

        let started = Instant::now();
        let mut job = FirmwareTransferJob::new(blocks as u32, token.clone());
        info!(
            job_id = %job.id,
            blocks = job.total_blocks,
            %request_id,
            %adapter,
            "Starting firmware transfer"
        );

        let outcome = self.transfer(&mut job, request_id, image, progress).await;

        Self::enter(&mut job, FlashState::RestoringAdapter, progress);
        let adapter_restored = match self.sink.restore_defaults().await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Adapter restore failed");
                false
            }
        };

        match outcome {
            Ok(()) => {
                Self::enter(&mut job, FlashState::Succeeded, progress);
                info!(job_id = %job.id, blocks = job.total_blocks, "Firmware transfer succeeded");
                Ok(FirmwareReport {
                    job_id: job.id,
                    total_blocks: job.total_blocks,
                    adapter_restored,
                    elapsed: started.elapsed(),
                })
            }
            Err(e) => {
                Self::enter(&mut job, FlashState::Failed, progress);
                error!(
                    job_id = %job.id,
                    block = job.current_block,
                    error = %e,
                    "Firmware transfer failed"
                );
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        job: &mut FirmwareTransferJob,
        request_id: CanId,
        image: &[u8],
        progress: &dyn ProgressSink,
    ) -> Result<(), FlashError> {
        Self::enter(job, FlashState::PreparingAdapter, progress);
        self.sink
            .prepare_raw_mode()
            .await
            .map_err(|e| FlashError::new(job.state, e))?;

        Self::enter(job, FlashState::EnteringBootloader, progress);
        let mut wake = reverse_bytes(&WAKE_MAGIC);
        wake.extend(reverse_bytes(job.device_token.as_bytes()));
        self.send(job, request_id, wake).await?;
        sleep(self.config.settle()).await;

        Self::enter(job, FlashState::TransferringBlocks, progress);
        for index in 0..job.total_blocks as usize {
            self.send(job, request_id, block_payload(image, index)).await?;
            sleep(self.config.block_delay()).await;
            job.current_block = index as u32 + 1;
            progress.on_progress(job.current_block, job.total_blocks);
        }

        Self::enter(job, FlashState::Finalizing, progress);
        self.send(job, request_id, reverse_bytes(&FINALIZE_MAGIC)).await
    }

    async fn send(
        &self,
        job: &FirmwareTransferJob,
        request_id: CanId,
        data: Vec<u8>,
    ) -> Result<(), FlashError> {
        let frame = CanFrame::new(request_id, data)
            .map_err(|e| FlashError::new(job.state, TransportError::from(e)))?;
        self.sink
            .send_frame(&frame)
            .await
            .map_err(|e| FlashError::new(job.state, e))
    }

    fn enter(job: &mut FirmwareTransferJob, state: FlashState, progress: &dyn ProgressSink) {
        job.state = state;
        info!(job_id = %job.id, %state, "Firmware transfer state");
        progress.on_state(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use crate::registry::RequestDescriptor;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
        /// Frame data (hex) that fails to send
        fail_on: Option<String>,
        restores: Mutex<u32>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        fn adapter_type(&self) -> AdapterType {
            AdapterType::CommandStyle
        }

        async fn send_request(&self, _request: &RequestDescriptor) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError> {
            let data = frame.data_hex();
            if self.fail_on.as_deref() == Some(data.as_str()) {
                return Err(TransportError::SendFailed("injected".into()));
            }
            self.frames.lock().push(data);
            Ok(())
        }

        async fn prepare_raw_mode(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn restore_defaults(&self) -> Result<(), TransportError> {
            *self.restores.lock() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Observer {
        progress: Mutex<Vec<(u32, u32)>>,
        states: Mutex<Vec<FlashState>>,
    }

    impl ProgressSink for Observer {
        fn on_progress(&self, current: u32, total: u32) {
            self.progress.lock().push((current, total));
        }

        fn on_state(&self, state: FlashState) {
            self.states.lock().push(state);
        }
    }

    const IMAGE: [u8; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

    fn token() -> DeviceToken {
        DeviceToken::from_hex("11223344").unwrap()
    }

    #[test]
    fn test_reverse_bytes() {
        assert_eq!(hex::encode_upper(reverse_bytes(&WAKE_MAGIC)), "EFBEADDE");
        assert_eq!(hex::encode_upper(reverse_bytes(&FINALIZE_MAGIC)), "DEFADEC0");
    }

    #[test]
    fn test_ten_byte_image_is_three_blocks() {
        assert_eq!(block_count(IMAGE.len()), 3);
        assert_eq!(block_payload(&IMAGE, 0), vec![0xFF, 0x00, 0x00, 1, 2, 3, 4]);
        assert_eq!(block_payload(&IMAGE, 1), vec![0xFF, 0x01, 0x00, 5, 6, 7, 8]);
        assert_eq!(block_payload(&IMAGE, 2), vec![0xFF, 0x02, 0x00, 9, 10, 0, 0]);
        assert_eq!(&block_payload(&[0; 4 * 300], 299)[1..3], &[0x2B, 0x01]);
    }

    #[test]
    fn test_token_validation() {
        assert!(DeviceToken::from_hex("AB").is_ok());
        for bad in ["", "ABC", "0011223344", "zz"] {
            let err = DeviceToken::from_hex(bad).unwrap_err();
            assert_eq!(err.state, FlashState::Idle);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_transfer() {
        let sink = Arc::new(RecordingSink::default());
        let observer = Observer::default();
        let transfer = FirmwareTransfer::new(sink.clone(), FirmwareConfig::default());

        let started = Instant::now();
        let report = transfer.run(&IMAGE, &token(), &observer).await.unwrap();

        assert_eq!(report.total_blocks, 3);
        assert!(report.adapter_restored);
        assert!(started.elapsed() >= Duration::from_millis(5000 + 3 * 20));
        assert_eq!(
            sink.frames.lock().clone(),
            vec![
                "EFBEADDE44332211",
                "FF000001020304",
                "FF010005060708",
                "FF0200090A0000",
                "DEFADEC0",
            ]
        );
        assert_eq!(observer.progress.lock().clone(), vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(
            observer.states.lock().clone(),
            vec![
                FlashState::PreparingAdapter,
                FlashState::EnteringBootloader,
                FlashState::TransferringBlocks,
                FlashState::Finalizing,
                FlashState::RestoringAdapter,
                FlashState::Succeeded,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_failure_restores_and_fails() {
        let sink = Arc::new(RecordingSink {
            fail_on: Some("FF010005060708".to_string()),
            ..Default::default()
        });
        let observer = Observer::default();
        let transfer = FirmwareTransfer::new(sink.clone(), FirmwareConfig::default());

        let err = transfer.run(&IMAGE, &token(), &observer).await.unwrap_err();

        assert_eq!(err.state, FlashState::TransferringBlocks);
        assert!(matches!(err.kind, FlashErrorKind::Transport(_)));
        assert_eq!(*sink.restores.lock(), 1);
        assert_eq!(observer.progress.lock().clone(), vec![(1, 3)]);
        assert_eq!(observer.states.lock().last(), Some(&FlashState::Failed));
        assert!(!sink.frames.lock().iter().any(|f| f == "DEFADEC0"));
    }

    #[tokio::test]
    async fn test_validation_happens_before_adapter_is_touched() {
        let sink = Arc::new(RecordingSink::default());
        let transfer = FirmwareTransfer::new(sink.clone(), FirmwareConfig::default());
        let progress = |_: u32, _: u32| {};

        let err = transfer.run(&[], &token(), &progress).await.unwrap_err();
        assert_eq!(err, FlashError::new(FlashState::Idle, FlashErrorKind::EmptyImage));

        let huge = vec![0u8; BLOCK_SIZE * MAX_BLOCKS + 1];
        let err = transfer.run(&huge, &token(), &progress).await.unwrap_err();
        assert_eq!(err.kind, FlashErrorKind::ImageTooLarge(MAX_BLOCKS + 1));

        let bad_id = FirmwareTransfer::new(
            sink.clone(),
            FirmwareConfig {
                request_can_id: "XYZ".into(),
                ..Default::default()
            },
        );
        let err = bad_id.run(&IMAGE, &token(), &progress).await.unwrap_err();
        assert!(matches!(err.kind, FlashErrorKind::InvalidRequestId(_)));

        assert!(sink.frames.lock().is_empty());
        assert_eq!(*sink.restores.lock(), 0);
    }
}
