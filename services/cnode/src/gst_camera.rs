//! GStreamer camera device.
//!
//! Builds a `<source> ! ... ! appsink` pipeline and exposes it through
//! [`CameraDevice`]. Every pulled sample is a completed still request.

use crate::capture::{
    BufferView, CameraDevice, CaptureMetadata, CompletedRequest, DeviceError, DeviceEvent,
    PixelFormat, StreamInfo, StreamRole,
};
use crate::config::{CameraConfig, CameraFormat};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, error, info, warn};

/// How long `start` waits for the pipeline to reach `Playing`.
const STATE_CHANGE_TIMEOUT_SECS: u64 = 5;

/// A camera driven by a GStreamer pipeline ending in an appsink.
pub struct GstCamera {
    config: CameraConfig,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
}

impl GstCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            pipeline: None,
            appsink: None,
        }
    }

    /// Build the GStreamer pipeline description.
    fn build_pipeline_string(&self) -> String {
        let caps = match self.config.format {
            CameraFormat::Rgb => format!(
                "videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={}",
                self.config.width, self.config.height
            ),
            CameraFormat::Jpeg => format!(
                "image/jpeg,width={},height={}",
                self.config.width, self.config.height
            ),
        };

        format!(
            "{source} ! {caps} ! appsink name=sink sync=false max-buffers=1 drop=true",
            source = self.config.source,
            caps = caps,
        )
    }

    fn pipeline(&self) -> Result<&gst::Pipeline, DeviceError> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| DeviceError::Stream("Pipeline not configured".to_string()))
    }

    fn stall_timeout(&self) -> gst::ClockTime {
        gst::ClockTime::from_mseconds(self.config.stall_timeout_ms)
    }

    /// Drain pending bus messages, failing on the first pipeline error.
    fn check_bus(&self) -> Result<bool, DeviceError> {
        let Some(bus) = self.pipeline()?.bus() else {
            return Ok(false);
        };

        let mut eos = false;
        while let Some(msg) = bus.pop() {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    error!(
                        error = %err.error(),
                        debug = ?err.debug(),
                        "GStreamer pipeline error"
                    );
                    return Err(DeviceError::Stream(err.error().to_string()));
                }
                gst::MessageView::Eos(_) => {
                    info!("End of stream");
                    eos = true;
                }
                gst::MessageView::Warning(w) => {
                    warn!(warning = %w.error(), "GStreamer warning");
                }
                _ => {}
            }
        }

        Ok(eos)
    }
}

impl CameraDevice for GstCamera {
    type Buffer = gst::Sample;

    fn open(&mut self) -> Result<(), DeviceError> {
        gst::init().map_err(|e| DeviceError::Open(e.to_string()))
    }

    fn configure(&mut self) -> Result<(), DeviceError> {
        let pipeline_str = self.build_pipeline_string();
        debug!(pipeline = %pipeline_str, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| DeviceError::Configure(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| DeviceError::Configure("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| DeviceError::Configure("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| DeviceError::Configure("Could not cast to AppSink".to_string()))?;

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let pipeline = self.pipeline()?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| DeviceError::Start(e.to_string()))?;

        let (result, _state, _pending) =
            pipeline.state(gst::ClockTime::from_seconds(STATE_CHANGE_TIMEOUT_SECS));
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(DeviceError::Start(
                "Timeout waiting for pipeline to start".to_string(),
            ));
        }

        debug!(source = %self.config.source, "Camera pipeline playing");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.pipeline()?
            .set_state(gst::State::Null)
            .map_err(|e| DeviceError::Stop(e.to_string()))?;
        Ok(())
    }

    fn wait_for_event(&mut self) -> Result<DeviceEvent<gst::Sample>, DeviceError> {
        if self.check_bus()? {
            return Ok(DeviceEvent::Quit);
        }

        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| DeviceError::Stream("Pipeline not configured".to_string()))?;

        let Some(sample) = appsink.try_pull_sample(self.stall_timeout()) else {
            if appsink.is_eos() {
                return Ok(DeviceEvent::Quit);
            }
            // a failed pipeline also stops delivering samples
            self.check_bus()?;
            debug!(
                timeout_ms = self.config.stall_timeout_ms,
                "No sample before stall timeout"
            );
            return Ok(DeviceEvent::Timeout);
        };

        let mut metadata = CaptureMetadata::new();
        if let Some(buffer) = sample.buffer() {
            if let Some(pts) = buffer.pts() {
                metadata.insert("pts_ns".to_string(), serde_json::json!(pts.nseconds()));
            }
            metadata.insert("offset".to_string(), serde_json::json!(buffer.offset()));
        }

        Ok(DeviceEvent::RequestComplete(CompletedRequest {
            stream: StreamRole::Still,
            metadata,
            buffer: sample,
        }))
    }

    fn stream_info(
        &self,
        request: &CompletedRequest<gst::Sample>,
    ) -> Result<StreamInfo, DeviceError> {
        let caps = request
            .buffer
            .caps()
            .ok_or_else(|| DeviceError::Buffer("Sample has no caps".to_string()))?;

        let structure = caps
            .structure(0)
            .ok_or_else(|| DeviceError::Buffer("Caps have no structure".to_string()))?;

        if structure.has_name("image/jpeg") {
            return Ok(StreamInfo {
                width: structure.get::<i32>("width").unwrap_or(0) as u32,
                height: structure.get::<i32>("height").unwrap_or(0) as u32,
                stride: 0,
                format: PixelFormat::Jpeg,
            });
        }

        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| DeviceError::Buffer(e.to_string()))?;

        let format = match info.format() {
            gst_video::VideoFormat::Rgb => PixelFormat::Rgb,
            gst_video::VideoFormat::Gray8 => PixelFormat::Gray8,
            other => {
                return Err(DeviceError::Buffer(format!(
                    "Unsupported video format {:?}",
                    other
                )))
            }
        };

        Ok(StreamInfo {
            width: info.width(),
            height: info.height(),
            stride: info.stride()[0] as u32,
            format,
        })
    }

    fn map_buffer<'a>(&'a self, buffer: &'a gst::Sample) -> Result<BufferView<'a>, DeviceError> {
        let buffer = buffer
            .buffer()
            .ok_or_else(|| DeviceError::Buffer("Sample has no buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| DeviceError::Buffer(e.to_string()))?;

        Ok(BufferView::new().with_plane(map))
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> CameraConfig {
        CameraConfig {
            source: "videotestsrc num-buffers=1".to_string(),
            width: 640,
            height: 480,
            ..CameraConfig::default()
        }
    }

    #[test]
    fn test_pipeline_string_rgb() {
        let camera = GstCamera::new(create_test_config());
        let pipeline = camera.build_pipeline_string();

        assert!(pipeline.starts_with("videotestsrc num-buffers=1 ! videoconvert"));
        assert!(pipeline.contains("video/x-raw,format=RGB,width=640,height=480"));
        assert!(pipeline.ends_with("appsink name=sink sync=false max-buffers=1 drop=true"));
    }

    #[test]
    fn test_pipeline_string_jpeg() {
        let mut config = create_test_config();
        config.source = "v4l2src device=/dev/video0".to_string();
        config.format = CameraFormat::Jpeg;
        let pipeline = GstCamera::new(config).build_pipeline_string();

        assert!(pipeline.contains("v4l2src device=/dev/video0 ! image/jpeg,width=640,height=480"));
        assert!(!pipeline.contains("videoconvert"));
    }

    #[test]
    fn test_start_before_configure_fails() {
        let mut camera = GstCamera::new(create_test_config());
        assert!(matches!(camera.start(), Err(DeviceError::Stream(_))));
    }
}
