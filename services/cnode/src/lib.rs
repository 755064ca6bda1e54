//! Cnode - single-shot camera capture and MQTT publish for edge nodes
//!
//! One process run captures one still from the local camera, wraps it in a
//! CBOR envelope and publishes it to an MQTT broker at QoS 1:
//!
//! - Capture: waits for a still, restarting the device when it stalls
//! - Envelope: `{ cnode_id, created, frame }` encoded as a CBOR map
//! - Publish: connect, publish, disconnect, each step under a timeout
//!
//! # Example
//!
//! ```rust,no_run
//! use cnode::prelude::*;
//! use cnode::CameraDevice;
//! use std::sync::Arc;
//!
//! async fn capture_and_publish<D>(camera: D) -> anyhow::Result<()>
//! where
//!     D: CameraDevice + Send + 'static,
//! {
//!     let config = CnodeConfig::load()?;
//!     config.validate()?;
//!
//!     let controller = CaptureController::new(
//!         camera,
//!         Arc::new(JpegStillEncoder::new(config.camera.jpeg_quality)),
//!         RestartPolicy::from_config(&config.camera),
//!     );
//!     let envelopes = EnvelopeBuilder::new(config.node.id.clone(), Arc::new(SystemClock));
//!     let connector = MqttConnector::from_config(&config.broker);
//!
//!     Pipeline::new(config, controller, envelopes, connector).run().await?;
//!     Ok(())
//! }
//! ```
//!
//! With the default `gstreamer` feature, `GstCamera::new(config.camera.clone())`
//! is the camera the service binary passes in.

pub mod capture;
pub mod config;
pub mod envelope;
#[cfg(feature = "gstreamer")]
pub mod gst_camera;
pub mod jpeg;
pub mod pipeline;
pub mod publisher;

// Re-export main types
pub use capture::{
    BufferView, CameraDevice, CaptureController, CaptureError, CaptureMetadata, CaptureOutcome,
    CaptureState, CapturedFrame, DeviceError, DeviceEvent, EncodeError, PixelFormat,
    RestartPolicy, StillEncoder, StreamInfo, StreamRole,
};
pub use config::{CnodeConfig, ConfigValidationError};
pub use envelope::{build_envelope, Clock, EnvelopeBuilder, EnvelopeError, FixedClock, SystemClock};
#[cfg(feature = "gstreamer")]
pub use gst_camera::GstCamera;
pub use jpeg::JpegStillEncoder;
pub use pipeline::{Pipeline, PipelineError, RunOutcome};
pub use publisher::{
    BrokerConnector, BrokerError, BrokerSession, ConnectionLost, DeliveryReport, MqttConnector,
    PublishClient, PublishError, PublishRequest, QoS,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::capture::{CaptureController, RestartPolicy};
    pub use crate::config::CnodeConfig;
    pub use crate::envelope::{EnvelopeBuilder, SystemClock};
    #[cfg(feature = "gstreamer")]
    pub use crate::gst_camera::GstCamera;
    pub use crate::jpeg::JpegStillEncoder;
    pub use crate::pipeline::{Pipeline, RunOutcome};
    pub use crate::publisher::MqttConnector;
}
