//! Adapter session
//!
//! A [`Session`] owns one channel for its whole life: it detects the adapter,
//! initialises it, runs the standing reader task and hands the polling engine
//! and firmware transfer a [`FrameSink`] to write through.
//!
//! ```text
//!            ┌──────────── Session ─────────────┐
//!  Channel ──┤ reader: reassemble -> decode ────┼──> broadcast<CanFrame>
//!            │                                  │        │
//!            │ Link (FrameSink) <── PollingEngine <───────┘
//!            │      ^                           │
//!            │      └────── FirmwareTransfer    │
//!            └──────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::adapter::{detect, AdapterType, CanFrame, CanId, DecodeOutcome, FrameCodec};
use crate::adapter::{codec_for, detect::send_commands};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::firmware::{DeviceToken, FirmwareReport, FirmwareTransfer, ProgressSink};
use crate::framing::LineReassembler;
use crate::polling::{PollingEngine, UpdateSink};
use crate::registry::{ParameterRegistry, RequestDescriptor};
use crate::transport::{create_channel, Channel, TransportError};

/// Outbound side of a connection, shared by polling and firmware transfer
#[async_trait]
pub trait FrameSink: Send + Sync {
    fn adapter_type(&self) -> AdapterType;

    /// Encode and write a diagnostic request
    ///
    /// Remembers the destination id so header-less replies can be attributed.
    async fn send_request(&self, request: &RequestDescriptor) -> Result<(), TransportError>;

    /// Write a frame exactly as given
    async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Switch the adapter to raw 8-byte frames
    async fn prepare_raw_mode(&self) -> Result<(), TransportError>;

    /// Undo [`FrameSink::prepare_raw_mode`]
    async fn restore_defaults(&self) -> Result<(), TransportError>;
}

/// Per-connection protocol state; `None` once the connection is gone
pub struct ConnectionState {
    adapter: AdapterType,
    codec: Arc<dyn FrameCodec>,
    last_request_id: Option<CanId>,
}

struct Link {
    channel: Arc<dyn Channel>,
    state: RwLock<Option<ConnectionState>>,
    /// Keeps multi-write frames contiguous on the wire
    write_lock: tokio::sync::Mutex<()>,
}

impl Link {
    fn codec(&self) -> Result<Arc<dyn FrameCodec>, TransportError> {
        self.state
            .read()
            .as_ref()
            .map(|state| state.codec.clone())
            .ok_or(TransportError::ConnectionClosed)
    }

    fn last_request_id(&self) -> Option<CanId> {
        self.state.read().as_ref().and_then(|state| state.last_request_id)
    }

    fn reset(&self) {
        if self.state.write().take().is_some() {
            info!(channel = %self.channel.describe(), "Connection state reset");
        }
    }

    async fn write_sequence(
        &self,
        codec: &dyn FrameCodec,
        writes: &[Vec<u8>],
    ) -> Result<(), TransportError> {
        let delay = codec.inter_write_delay();
        for (index, bytes) in writes.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                sleep(delay).await;
            }
            debug!(tx = %String::from_utf8_lossy(bytes).trim_end(), "Adapter write");
            if let Err(e) = self.channel.write(bytes).await {
                if e == TransportError::ConnectionClosed {
                    self.reset();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn send_commands(&self, commands: &[&str]) -> Result<(), TransportError> {
        if commands.is_empty() {
            return Ok(());
        }
        let codec = self.codec()?;
        let writes: Vec<Vec<u8>> = commands.iter().map(|cmd| codec.command(cmd)).collect();

        let _guard = self.write_lock.lock().await;
        self.write_sequence(&*codec, &writes).await
    }
}

#[async_trait]
impl FrameSink for Link {
    fn adapter_type(&self) -> AdapterType {
        self.state
            .read()
            .as_ref()
            .map(|state| state.adapter)
            .unwrap_or_default()
    }

    async fn send_request(&self, request: &RequestDescriptor) -> Result<(), TransportError> {
        if request.payload.is_empty() {
            return Err(TransportError::InvalidFrame("empty request payload".into()));
        }
        let codec = self.codec()?;
        let frame = codec.request_frame(request)?;

        let _guard = self.write_lock.lock().await;
        if let Some(state) = self.state.write().as_mut() {
            state.last_request_id = Some(frame.id);
        }
        self.write_sequence(&*codec, &codec.encode(&frame)).await
    }

    async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError> {
        let codec = self.codec()?;

        let _guard = self.write_lock.lock().await;
        self.write_sequence(&*codec, &codec.encode(frame)).await
    }

    async fn prepare_raw_mode(&self) -> Result<(), TransportError> {
        let codec = self.codec()?;
        self.send_commands(codec.raw_mode_commands()).await
    }

    async fn restore_defaults(&self) -> Result<(), TransportError> {
        let codec = self.codec()?;
        self.send_commands(codec.restore_commands()).await
    }
}

/// An open connection to one adapter
pub struct Session {
    link: Arc<Link>,
    config: LinkConfig,
    polling: Arc<PollingEngine>,
    frames: broadcast::Sender<CanFrame>,
    /// Set while a firmware transfer owns the channel
    flashing: AtomicBool,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create the configured channel and open a session on it
    #[instrument(skip_all)]
    pub async fn connect(config: LinkConfig) -> Result<Self, LinkError> {
        let channel = create_channel(&config.transport).await?;
        Self::open(channel, config).await
    }

    /// Detect and initialise the adapter behind `channel`
    ///
    /// The channel is closed again if no supported adapter answers.
    #[instrument(skip_all, fields(channel = %channel.describe()))]
    pub async fn open(channel: Arc<dyn Channel>, config: LinkConfig) -> Result<Self, LinkError> {
        let (adapter, codec) = match handshake(&*channel, &config).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "Adapter handshake failed");
                let _ = channel.close().await;
                return Err(e);
            }
        };
        info!(%adapter, "Adapter ready");

        let link = Arc::new(Link {
            channel,
            state: RwLock::new(Some(ConnectionState {
                adapter,
                codec: codec.clone(),
                last_request_id: None,
            })),
            write_lock: tokio::sync::Mutex::new(()),
        });

        let (frames, _) = broadcast::channel(config.adapter.frame_channel_capacity.max(1));
        let reassembler = LineReassembler::new(
            config.transport.reassembly(),
            config.adapter.max_line_buffer,
        );
        let polling = Arc::new(PollingEngine::new(link.clone(), config.polling.clone()));
        polling.start_listener(frames.subscribe());

        let reader = tokio::spawn(read_loop(
            link.clone(),
            codec,
            frames.clone(),
            reassembler,
            polling.clone(),
        ));

        Ok(Self {
            link,
            config,
            polling,
            frames,
            flashing: AtomicBool::new(false),
            reader_handle: Mutex::new(Some(reader)),
        })
    }

    pub fn adapter_type(&self) -> AdapterType {
        self.link.adapter_type()
    }

    pub fn is_connected(&self) -> bool {
        self.link.state.read().is_some()
    }

    pub fn describe(&self) -> String {
        self.link.channel.describe()
    }

    /// Every frame decoded from now on
    pub fn frames(&self) -> broadcast::Receiver<CanFrame> {
        self.frames.subscribe()
    }

    pub fn polling(&self) -> &PollingEngine {
        &self.polling
    }

    pub fn start_polling<S: AsRef<str>>(
        &self,
        parameter_ids: &[S],
        registry: &ParameterRegistry,
        on_update: Arc<dyn UpdateSink>,
    ) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed.into());
        }
        if self.flashing.load(Ordering::SeqCst) {
            return Err(LinkError::TransferInProgress);
        }
        Ok(self.polling.start_polling(parameter_ids, registry, on_update)?)
    }

    pub fn stop_all_polling(&self) {
        self.polling.stop_all_polling();
    }

    /// Send one request without waiting for or correlating a reply
    #[instrument(skip(self), fields(can_id = %request.can_id, payload = %request.payload_hex()))]
    pub async fn send_once(&self, request: &RequestDescriptor) -> Result<(), LinkError> {
        Ok(self.link.send_request(request).await?)
    }

    /// Flash a firmware image; polling is stopped first
    ///
    /// Polling cannot be restarted, and no second transfer can start, until
    /// this one returns.
    #[instrument(skip(self, image, progress), fields(image_len = image.len()))]
    pub async fn run_firmware_transfer(
        &self,
        image: &[u8],
        token: &DeviceToken,
        progress: &dyn ProgressSink,
    ) -> Result<FirmwareReport, LinkError> {
        let _busy = FlashGuard::acquire(&self.flashing)?;
        self.polling.stop_all_polling();
        let transfer = FirmwareTransfer::new(self.link.clone(), self.config.firmware.clone());
        Ok(transfer.run(image, token, progress).await?)
    }

    pub fn is_flashing(&self) -> bool {
        self.flashing.load(Ordering::SeqCst)
    }

    /// Stop all activity and close the channel
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), LinkError> {
        self.polling.stop_all_polling();
        if let Some(reader) = self.reader_handle.lock().take() {
            reader.abort();
        }
        self.link.reset();
        self.link.channel.close().await?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(reader) = self.reader_handle.lock().take() {
            reader.abort();
        }
    }
}

/// Clears the session's flashing flag when the transfer ends
struct FlashGuard<'a>(&'a AtomicBool);

impl<'a> FlashGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, LinkError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| LinkError::TransferInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for FlashGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn handshake(
    channel: &dyn Channel,
    config: &LinkConfig,
) -> Result<(AdapterType, Arc<dyn FrameCodec>), LinkError> {
    let adapter = detect(channel, &config.detect).await?;
    if adapter == AdapterType::Unknown {
        return Err(LinkError::UnsupportedAdapter);
    }
    let codec = codec_for(adapter, &config.adapter)?;
    send_commands(channel, &codec.init_commands(), &config.detect).await?;
    Ok((adapter, codec))
}

async fn read_loop(
    link: Arc<Link>,
    codec: Arc<dyn FrameCodec>,
    frames: broadcast::Sender<CanFrame>,
    mut reassembler: LineReassembler,
    polling: Arc<PollingEngine>,
) {
    loop {
        match link.channel.read().await {
            Ok(Some(chunk)) => {
                for line in reassembler.feed(&chunk) {
                    match codec.decode(&line, link.last_request_id()) {
                        DecodeOutcome::Frame(frame) => {
                            debug!(%frame, "Frame received");
                            // No receivers is fine
                            let _ = frames.send(frame);
                        }
                        DecodeOutcome::Service => trace!(line = %line, "Adapter service line"),
                        DecodeOutcome::Unparseable => {
                            debug!(line = %line, "Unparseable adapter output")
                        }
                        DecodeOutcome::MissingRequestContext => {
                            debug!(line = %line, "Header-less response with no request outstanding")
                        }
                    }
                }
            }
            Ok(None) => {
                info!(channel = %link.channel.describe(), "Channel reached end of stream");
                break;
            }
            Err(e) => {
                error!(channel = %link.channel.describe(), error = %e, "Channel read failed");
                break;
            }
        }
    }
    link.reset();
    polling.stop_all_polling();
}
