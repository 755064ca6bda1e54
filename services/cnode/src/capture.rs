//! Single-shot still capture on top of an event-driven camera device.
//!
//! The device delivers events asynchronously from its own threads; this
//! module turns that into one blocking [`CaptureController::capture_once`]
//! call that either yields an encoded still, reports that the device was
//! asked to quit, or fails. Device stalls are recovered by cycling the
//! device under a [`RestartPolicy`].

use crate::config::CameraConfig;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors reported by a camera device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to open camera: {0}")]
    Open(String),

    #[error("Failed to configure camera: {0}")]
    Configure(String),

    #[error("Failed to start camera: {0}")]
    Start(String),

    #[error("Failed to stop camera: {0}")]
    Stop(String),

    #[error("Camera stream error: {0}")]
    Stream(String),

    #[error("Failed to map frame buffer: {0}")]
    Buffer(String),
}

/// Errors produced while encoding a still image.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    #[error("Frame buffer too small: expected {expected} bytes, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("Image encoding failed: {0}")]
    Encoding(String),
}

/// Errors that end a capture run.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Unrecognised camera event: {0}")]
    UnrecognizedEvent(String),

    #[error("Camera stalled again after {restarts} restarts, restart limit reached")]
    RestartLimitExceeded { restarts: u32 },

    #[error("Still encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Encoder produced an empty still")]
    EmptyFrame,

    #[error("Capture already ran (state {0:?})")]
    InvalidState(CaptureState),
}

/// Logical stream a completed request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Still,
    Viewfinder,
    Raw,
}

/// Pixel layout of a stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    Gray8,
    Jpeg,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats.
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgb => Some(3),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Jpeg => None,
        }
    }
}

/// Geometry of a stream buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, including padding
    pub stride: u32,
    pub format: PixelFormat,
}

/// Per-request capture metadata (exposure, timestamps, sequence numbers).
pub type CaptureMetadata = BTreeMap<String, serde_json::Value>;

/// A request the device has finished filling.
#[derive(Debug)]
pub struct CompletedRequest<B> {
    pub stream: StreamRole,
    pub metadata: CaptureMetadata,
    pub buffer: B,
}

/// Event delivered by [`CameraDevice::wait_for_event`].
#[derive(Debug)]
pub enum DeviceEvent<B> {
    /// No frame arrived within the device's own deadline
    Timeout,
    /// The device was asked to stop producing frames
    Quit,
    RequestComplete(CompletedRequest<B>),
    /// Anything the device contract does not define
    Other(String),
}

/// Read-only view of a frame buffer.
///
/// The view borrows the device it was mapped from, so the device cannot be
/// restarted (and the memory re-queued) while the view is alive.
pub struct BufferView<'a> {
    planes: Vec<Box<dyn AsRef<[u8]> + 'a>>,
}

impl<'a> BufferView<'a> {
    pub fn new() -> Self {
        Self { planes: Vec::new() }
    }

    pub fn with_plane(mut self, plane: impl AsRef<[u8]> + 'a) -> Self {
        self.planes.push(Box::new(plane));
        self
    }

    pub fn planes(&self) -> Vec<&[u8]> {
        self.planes.iter().map(|p| (**p).as_ref()).collect()
    }

    pub fn len(&self) -> usize {
        self.planes.iter().map(|p| (**p).as_ref().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BufferView<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capabilities the controller needs from a camera.
pub trait CameraDevice {
    /// Handle to a filled buffer, valid until the device is restarted.
    type Buffer;

    fn open(&mut self) -> Result<(), DeviceError>;

    /// Apply device-specific still configuration. Called once, before the first start.
    fn configure(&mut self) -> Result<(), DeviceError>;

    fn start(&mut self) -> Result<(), DeviceError>;

    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Block until the device has something to report.
    fn wait_for_event(&mut self) -> Result<DeviceEvent<Self::Buffer>, DeviceError>;

    fn stream_info(
        &self,
        request: &CompletedRequest<Self::Buffer>,
    ) -> Result<StreamInfo, DeviceError>;

    fn map_buffer<'a>(&'a self, buffer: &'a Self::Buffer) -> Result<BufferView<'a>, DeviceError>;
}

/// Turns mapped frame planes into encoded still bytes.
pub trait StillEncoder: Send + Sync {
    fn encode(
        &self,
        planes: &[&[u8]],
        info: &StreamInfo,
        metadata: &CaptureMetadata,
    ) -> Result<Vec<u8>, EncodeError>;
}

/// How many stalls to tolerate and how long to wait before each restart.
#[derive(Debug)]
pub struct RestartPolicy {
    max_restarts: Option<u32>,
    backoff: ExponentialBackoff,
}

impl RestartPolicy {
    pub fn new(max_restarts: Option<u32>, base_delay: Duration, max_delay: Duration) -> Self {
        let backoff = ExponentialBackoff {
            initial_interval: base_delay,
            current_interval: base_delay,
            max_interval: max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };

        Self {
            max_restarts,
            backoff,
        }
    }

    /// Build a policy from camera configuration (`max_restarts = 0` means unbounded).
    pub fn from_config(config: &CameraConfig) -> Self {
        let max_restarts = match config.max_restarts {
            0 => None,
            n => Some(n),
        };
        Self::new(
            max_restarts,
            config.restart_base_delay(),
            config.restart_max_delay(),
        )
    }

    /// Restart without delay, up to `max_restarts` times.
    pub fn immediate(max_restarts: Option<u32>) -> Self {
        Self::new(max_restarts, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_restarts(&self) -> Option<u32> {
        self.max_restarts
    }

    fn allows(&self, restarts: u32) -> bool {
        self.max_restarts.map_or(true, |max| restarts <= max)
    }

    fn next_delay(&mut self) -> Duration {
        self.backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval)
    }
}

/// State of a capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Running,
    StoppingForRestart,
    Complete,
    Failed,
}

/// An encoded still and the context it was captured in.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Bytes,
    pub info: StreamInfo,
    pub metadata: CaptureMetadata,
    /// Stall restarts needed before the frame arrived
    pub restarts: u32,
}

/// Result of a capture run that did not fail.
#[derive(Debug)]
pub enum CaptureOutcome {
    Frame(CapturedFrame),
    /// The device quit before producing a frame
    Quit,
}

/// Drives a camera through one still capture.
pub struct CaptureController<D: CameraDevice> {
    device: D,
    encoder: Arc<dyn StillEncoder>,
    policy: RestartPolicy,
    state: CaptureState,
    restarts: u32,
    device_running: bool,
}

impl<D: CameraDevice> CaptureController<D> {
    pub fn new(device: D, encoder: Arc<dyn StillEncoder>, policy: RestartPolicy) -> Self {
        Self {
            device,
            encoder,
            policy,
            state: CaptureState::Idle,
            restarts: 0,
            device_running: false,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Capture exactly one still, blocking the calling thread.
    ///
    /// The device is stopped before the frame buffer is read, so the returned
    /// bytes can no longer be overwritten by the camera.
    pub fn capture_once(&mut self) -> Result<CaptureOutcome, CaptureError> {
        if self.state != CaptureState::Idle {
            return Err(CaptureError::InvalidState(self.state));
        }

        match self.run() {
            Ok(outcome) => {
                self.state = CaptureState::Complete;
                Ok(outcome)
            }
            Err(e) => {
                self.state = CaptureState::Failed;
                error!(error = %e, restarts = self.restarts, "Still capture failed");
                if self.device_running {
                    if let Err(stop) = self.stop_device() {
                        warn!(error = %stop, "Failed to stop camera after capture failure");
                    }
                }
                Err(e)
            }
        }
    }

    fn run(&mut self) -> Result<CaptureOutcome, CaptureError> {
        self.device.open()?;
        self.device.configure()?;
        self.start_device()?;
        self.state = CaptureState::Running;
        debug!("Camera started, waiting for still");

        loop {
            match self.device.wait_for_event()? {
                DeviceEvent::Timeout => self.restart_after_stall()?,
                DeviceEvent::Quit => {
                    info!("Camera quit before a still was captured");
                    return Ok(CaptureOutcome::Quit);
                }
                DeviceEvent::RequestComplete(request) if request.stream != StreamRole::Still => {
                    debug!(stream = ?request.stream, "Ignoring completed request for non-still stream");
                }
                DeviceEvent::RequestComplete(request) => {
                    self.stop_device()?;
                    info!(restarts = self.restarts, "Still capture image received");
                    return self.extract(request).map(CaptureOutcome::Frame);
                }
                DeviceEvent::Other(kind) => return Err(CaptureError::UnrecognizedEvent(kind)),
            }
        }
    }

    fn start_device(&mut self) -> Result<(), DeviceError> {
        self.device.start()?;
        self.device_running = true;
        Ok(())
    }

    fn stop_device(&mut self) -> Result<(), DeviceError> {
        self.device.stop()?;
        self.device_running = false;
        Ok(())
    }

    fn restart_after_stall(&mut self) -> Result<(), CaptureError> {
        if !self.policy.allows(self.restarts + 1) {
            return Err(CaptureError::RestartLimitExceeded {
                restarts: self.restarts,
            });
        }
        self.restarts += 1;

        warn!(
            restart = self.restarts,
            max_restarts = ?self.policy.max_restarts(),
            "Device timeout detected, attempting a restart"
        );

        self.state = CaptureState::StoppingForRestart;
        self.stop_device()?;

        let delay = self.policy.next_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before camera restart");
            std::thread::sleep(delay);
        }

        self.start_device()?;
        self.state = CaptureState::Running;
        Ok(())
    }

    fn extract(&self, request: CompletedRequest<D::Buffer>) -> Result<CapturedFrame, CaptureError> {
        let info = self.device.stream_info(&request)?;
        let encoded = {
            let view = self.device.map_buffer(&request.buffer)?;
            self.encoder
                .encode(&view.planes(), &info, &request.metadata)?
        };

        if encoded.is_empty() {
            return Err(CaptureError::EmptyFrame);
        }

        debug!(
            width = info.width,
            height = info.height,
            bytes = encoded.len(),
            "Still encoded"
        );

        Ok(CapturedFrame {
            data: Bytes::from(encoded),
            info,
            metadata: request.metadata,
            restarts: self.restarts,
        })
    }
}
