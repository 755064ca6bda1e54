//! Capture → envelope → publish, once per process.
//!
//! [`Pipeline::run`] is the single place where failures of any stage are
//! collected. It either publishes exactly one envelope, reports that the
//! camera quit before producing a frame, or returns a [`PipelineError`]
//! naming the stage that failed.

use crate::capture::{CameraDevice, CaptureController, CaptureError, CaptureOutcome};
use crate::config::CnodeConfig;
use crate::envelope::{EnvelopeBuilder, EnvelopeError};
use crate::publisher::{
    BrokerConnector, ConnectionLost, DeliveryReport, PublishClient, PublishError, PublishRequest,
};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Errors that fail a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Envelope encoding failed: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Failed to write still to {path}: {source}")]
    Save {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Capture task aborted: {0}")]
    Task(String),
}

impl PipelineError {
    /// Stage of the pipeline the error came from.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Capture(_) | PipelineError::Task(_) => "capture",
            PipelineError::Envelope(_) => "encode",
            PipelineError::Save { .. } => "save",
            PipelineError::Publish(_) => "publish",
        }
    }
}

/// How a successful run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Published(DeliveryReport),
    /// The camera quit before a frame was produced; nothing was published
    NoFrame,
}

/// One capture-and-publish run.
pub struct Pipeline<D: CameraDevice, C: BrokerConnector> {
    config: CnodeConfig,
    controller: CaptureController<D>,
    envelopes: EnvelopeBuilder,
    connector: C,
}

impl<D, C> Pipeline<D, C>
where
    D: CameraDevice + Send + 'static,
    C: BrokerConnector,
{
    pub fn new(
        config: CnodeConfig,
        controller: CaptureController<D>,
        envelopes: EnvelopeBuilder,
        connector: C,
    ) -> Self {
        Self {
            config,
            controller,
            envelopes,
            connector,
        }
    }

    /// Run the pipeline to completion.
    pub async fn run(self) -> Result<RunOutcome, PipelineError> {
        let Pipeline {
            config,
            mut controller,
            envelopes,
            connector,
        } = self;

        info!(node_id = %envelopes.node_id(), "Starting still capture");
        let outcome = tokio::task::spawn_blocking(move || controller.capture_once())
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;

        let frame = match outcome {
            CaptureOutcome::Frame(frame) => frame,
            CaptureOutcome::Quit => {
                info!("No frame captured, skipping publish");
                return Ok(RunOutcome::NoFrame);
            }
        };

        info!(
            width = frame.info.width,
            height = frame.info.height,
            bytes = frame.data.len(),
            restarts = frame.restarts,
            "Still captured"
        );

        let payload = envelopes.build(&frame.data)?;
        info!(envelope_bytes = payload.len(), "Envelope built");

        if let Some(output) = &config.camera.output {
            let path = PathBuf::from(output);
            tokio::fs::write(&path, &frame.data)
                .await
                .map_err(|source| PipelineError::Save {
                    path: path.clone(),
                    source,
                })?;
            info!(path = %path.display(), "Still written to output");
        }
        drop(frame);

        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let client = PublishClient::new(connector, lost_tx);
        let request = PublishRequest::from_config(&config.broker, payload);

        let result = client.publish_once(request).await;
        drop(client);
        drain_connection_lost(&mut lost_rx);

        let report = result?;
        info!(
            topic = %report.topic,
            bytes = report.bytes,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Envelope published"
        );

        Ok(RunOutcome::Published(report))
    }
}

fn drain_connection_lost(rx: &mut mpsc::UnboundedReceiver<ConnectionLost>) {
    while let Ok(lost) = rx.try_recv() {
        warn!(broker = %lost.broker, cause = %lost.cause, "Broker connection lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fake::{controller, Call, Scripted, ScriptedCamera};
    use crate::capture::StreamRole;
    use crate::config::tests::create_test_config;
    use crate::envelope::FixedClock;
    use crate::publisher::fake::{BrokerCall, ScriptedConnector, Step};
    use crate::publisher::QoS;
    use chrono::{TimeZone, Utc};
    use ciborium::value::Value;
    use std::sync::Arc;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0xFF, 0xD9];

    fn envelopes() -> EnvelopeBuilder {
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        EnvelopeBuilder::new("1", Arc::new(clock))
    }

    fn pipeline(
        events: Vec<Scripted>,
        connector: ScriptedConnector,
    ) -> Pipeline<ScriptedCamera, ScriptedConnector> {
        Pipeline::new(create_test_config(), controller(events), envelopes(), connector)
    }

    #[tokio::test]
    async fn test_stalls_then_frame_is_published() {
        let connector = ScriptedConnector::healthy();
        let outcome = pipeline(
            vec![
                Scripted::Timeout,
                Scripted::Timeout,
                Scripted::Frame(StreamRole::Still, JPEG.to_vec()),
            ],
            connector.clone(),
        )
        .run()
        .await
        .unwrap();

        let report = match outcome {
            RunOutcome::Published(report) => report,
            RunOutcome::NoFrame => panic!("expected a publish"),
        };
        assert_eq!(report.topic, "events/frame");
        assert_eq!(report.qos, QoS::AtLeastOnce);

        let calls = connector.calls();
        assert_eq!(
            calls[0],
            BrokerCall::Open("mqtt://broker.local:1883".into(), "cnode-1".into())
        );
        assert_eq!(calls.last(), Some(&BrokerCall::Disconnect));
    }

    #[tokio::test]
    async fn test_published_envelope_contents() {
        let connector = ScriptedConnector::healthy();
        pipeline(
            vec![
                Scripted::Timeout,
                Scripted::Timeout,
                Scripted::Frame(StreamRole::Still, JPEG.to_vec()),
            ],
            connector.clone(),
        )
        .run()
        .await
        .unwrap();

        let published = connector
            .calls()
            .into_iter()
            .find_map(|call| match call {
                BrokerCall::Publish(topic, payload, qos) => Some((topic, payload, qos)),
                _ => None,
            })
            .expect("nothing was published");

        let (topic, payload, qos) = published;
        assert_eq!(topic, "events/frame");
        assert_eq!(qos, QoS::AtLeastOnce);

        let entries = match ciborium::from_reader::<Value, _>(payload.as_ref()).unwrap() {
            Value::Map(entries) => entries,
            other => panic!("expected a map, got {:?}", other),
        };
        assert_eq!(
            entries,
            vec![
                (Value::Text("cnode_id".into()), Value::Text("1".into())),
                (
                    Value::Text("created".into()),
                    Value::Text("2024-01-01T00:00:00Z".into())
                ),
                (Value::Text("frame".into()), Value::Bytes(JPEG.to_vec())),
            ]
        );
    }

    #[tokio::test]
    async fn test_other_node_and_clock_are_published() {
        let clock = FixedClock(Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap());
        let connector = ScriptedConnector::healthy();
        Pipeline::new(
            create_test_config(),
            controller(vec![Scripted::Frame(StreamRole::Still, JPEG.to_vec())]),
            EnvelopeBuilder::new("9", Arc::new(clock)),
            connector.clone(),
        )
        .run()
        .await
        .unwrap();

        let payload = connector
            .calls()
            .into_iter()
            .find_map(|call| match call {
                BrokerCall::Publish(_, payload, _) => Some(payload),
                _ => None,
            })
            .expect("nothing was published");
        let expected = crate::envelope::build_envelope(
            "9",
            JPEG,
            Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap(),
        )
        .unwrap();
        assert_eq!(payload, expected);
    }

    #[tokio::test]
    async fn test_quit_never_opens_broker() {
        let connector = ScriptedConnector::healthy();
        let outcome = pipeline(vec![Scripted::Quit], connector.clone())
            .run()
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::NoFrame));
        assert!(connector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_event_fails_without_publish() {
        let connector = ScriptedConnector::healthy();
        let err = pipeline(vec![Scripted::Other("Metadata")], connector.clone())
            .run()
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "capture");
        assert!(matches!(
            err,
            PipelineError::Capture(CaptureError::UnrecognizedEvent(_))
        ));
        assert!(connector.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_fails_run() {
        let connector = ScriptedConnector::new(Step::Hang, Step::Ack, Step::Ack);
        let err = pipeline(
            vec![Scripted::Frame(StreamRole::Still, JPEG.to_vec())],
            connector.clone(),
        )
        .run()
        .await
        .unwrap_err();

        assert_eq!(err.stage(), "publish");
        assert!(err.to_string().contains("mqtt://broker.local:1883"));
        assert!(!connector
            .calls()
            .iter()
            .any(|c| matches!(c, BrokerCall::Publish(..))));
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let connector = ScriptedConnector::new(Step::Ack, Step::Fail, Step::Ack);
        let err = pipeline(
            vec![Scripted::Frame(StreamRole::Still, JPEG.to_vec())],
            connector.clone(),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::Publish(PublishError::Publish { .. })));
        assert!(!connector.calls().contains(&BrokerCall::Disconnect));
    }

    #[tokio::test]
    async fn test_device_stopped_before_envelope() {
        let connector = ScriptedConnector::healthy();
        let controller = controller(vec![Scripted::Frame(StreamRole::Still, JPEG.to_vec())]);
        let calls = controller.device().calls.clone();

        Pipeline::new(create_test_config(), controller, envelopes(), connector)
            .run()
            .await
            .unwrap();

        let calls = calls.lock().clone();
        let stop = calls.iter().rposition(|c| *c == Call::Stop).unwrap();
        let map = calls.iter().position(|c| *c == Call::MapBuffer).unwrap();
        assert!(stop < map);
    }

    #[tokio::test]
    async fn test_still_written_to_output() {
        let path = std::env::temp_dir().join(format!("cnode-still-{}.jpg", std::process::id()));
        let mut config = create_test_config();
        config.camera.output = Some(path.to_string_lossy().into_owned());

        Pipeline::new(
            config,
            controller(vec![Scripted::Frame(StreamRole::Still, JPEG.to_vec())]),
            envelopes(),
            ScriptedConnector::healthy(),
        )
        .run()
        .await
        .unwrap();

        let written = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(written, JPEG);
    }

    #[tokio::test]
    async fn test_unwritable_output_fails_before_publish() {
        let mut config = create_test_config();
        config.camera.output = Some("/nonexistent-dir/cnode/still.jpg".to_string());
        let connector = ScriptedConnector::healthy();

        let err = Pipeline::new(
            config,
            controller(vec![Scripted::Frame(StreamRole::Still, JPEG.to_vec())]),
            envelopes(),
            connector.clone(),
        )
        .run()
        .await
        .unwrap_err();

        assert_eq!(err.stage(), "save");
        assert!(connector.calls().is_empty());
    }
}
