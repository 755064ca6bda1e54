//! Capture node for edge camera stills
//!
//! Captures one still from the local camera, wraps it in a CBOR envelope and
//! publishes it to an MQTT broker, then exits.
//!
//! # Architecture
//!
//! ```text
//! GstCamera -> CaptureController -> EnvelopeBuilder -> PublishClient -> MQTT broker
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with CNODE_)
//!
//! # Exit status
//!
//! 0 when the envelope was published or the camera quit without a frame,
//! 1 on any failure.

use anyhow::Context;
use cnode::config::{CnodeConfig, LoggingConfig};
use cnode::{
    CaptureController, EnvelopeBuilder, GstCamera, JpegStillEncoder, MqttConnector, Pipeline,
    RestartPolicy, RunOutcome, SystemClock,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Capture node failed");
            eprintln!("ERROR: *** {:#} ***", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = load_config()?;

    init_logging(&config.logging).context("Failed to initialize logging")?;

    info!(
        service = "cnode",
        version = env!("CARGO_PKG_VERSION"),
        node_id = %config.node.id,
        "Starting capture node"
    );

    if config.logging.verbose >= 2 {
        let effective =
            serde_json::to_string(&config).context("Failed to render configuration")?;
        info!(config = %effective, "Effective configuration");
    }

    config.validate().context("Invalid configuration")?;

    let controller = CaptureController::new(
        GstCamera::new(config.camera.clone()),
        Arc::new(JpegStillEncoder::new(config.camera.jpeg_quality)),
        RestartPolicy::from_config(&config.camera),
    );
    let envelopes = EnvelopeBuilder::new(config.node.id.clone(), Arc::new(SystemClock));
    let connector = MqttConnector::from_config(&config.broker);

    let pipeline = Pipeline::new(config, controller, envelopes, connector);
    match pipeline.run().await {
        Ok(RunOutcome::Published(report)) => {
            info!(
                topic = %report.topic,
                bytes = report.bytes,
                "Capture node completed successfully"
            );
            Ok(())
        }
        Ok(RunOutcome::NoFrame) => {
            warn!("Camera stopped before a still was captured");
            Ok(())
        }
        Err(e) => {
            error!(stage = e.stage(), error = %e, "Pipeline failed");
            Err(e.into())
        }
    }
}

/// Load configuration.
fn load_config() -> anyhow::Result<CnodeConfig> {
    // Try loading from files first, fall back to environment
    let config = CnodeConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({}), trying environment", e);
        CnodeConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let level = match config.verbose {
        0 => level,
        1 => level.max(Level::DEBUG),
        _ => Level::TRACE,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("cnode={}", level).parse()?)
        .add_directive("rumqttc=warn".parse()?)
        .add_directive("gstreamer=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}
