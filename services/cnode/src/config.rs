//! Configuration management for the capture node.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Main configuration for the capture node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CnodeConfig {
    /// Node identity
    pub node: NodeConfig,

    /// Camera device configuration
    #[serde(default)]
    pub camera: CameraConfig,

    /// MQTT broker configuration
    pub broker: BrokerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity of this edge node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier written into every envelope as `cnode_id`
    pub id: String,
}

/// Pixel format requested from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraFormat {
    /// Raw RGB frames, JPEG-encoded in-process
    #[default]
    Rgb,
    /// The camera delivers JPEG directly
    Jpeg,
}

/// Camera device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// GStreamer source element description (e.g. "libcamerasrc", "v4l2src device=/dev/video0")
    #[serde(default = "default_source")]
    pub source: String,

    /// Requested still width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Requested still height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Pixel format delivered by the camera
    #[serde(default)]
    pub format: CameraFormat,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Time without a frame after which the device reports a stall
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    /// Maximum number of stall restarts (0 = infinite)
    #[serde(default)]
    pub max_restarts: u32,

    /// Base delay between stopping and restarting a stalled device
    #[serde(default = "default_restart_base_delay_ms")]
    pub restart_base_delay_ms: u64,

    /// Maximum delay between stopping and restarting a stalled device
    #[serde(default = "default_restart_max_delay_ms")]
    pub restart_max_delay_ms: u64,

    /// Optional file the encoded still is also written to
    #[serde(default)]
    pub output: Option<String>,
}

/// Last Will and Testament settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastWillConfig {
    /// Attach the will message on connect
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_lwt_topic")]
    pub topic: String,

    #[serde(default = "default_lwt_payload")]
    pub payload: String,

    #[serde(default = "default_true")]
    pub retain: bool,
}

/// MQTT broker configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker address (mqtt://host:port, tcp://host:port, host:port or host)
    pub address: String,

    /// MQTT client identifier
    pub client_id: String,

    /// Topic the envelope is published to
    pub topic: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Time to wait for the connection acknowledgement
    #[serde(default = "default_broker_timeout")]
    pub connect_timeout_secs: u64,

    /// Time to wait for the publish acknowledgement
    #[serde(default = "default_broker_timeout")]
    pub publish_timeout_secs: u64,

    /// Time to wait for the disconnect to be flushed
    #[serde(default = "default_broker_timeout")]
    pub disconnect_timeout_secs: u64,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Largest MQTT packet accepted or sent, in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    #[serde(default)]
    pub last_will: LastWillConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Verbosity; at 2 the effective configuration is printed on startup
    #[serde(default)]
    pub verbose: u8,
}

// Default value functions
fn default_source() -> String {
    "libcamerasrc".to_string()
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_jpeg_quality() -> u8 {
    93
}
fn default_stall_timeout_ms() -> u64 {
    5000
}
fn default_restart_base_delay_ms() -> u64 {
    100
}
fn default_restart_max_delay_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_lwt_topic() -> String {
    "events/disconnect".to_string()
}
fn default_lwt_payload() -> String {
    "Last will and testament.".to_string()
}
fn default_broker_timeout() -> u64 {
    10
}
fn default_keep_alive() -> u64 {
    30
}
fn default_max_packet_size() -> usize {
    16 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            width: default_width(),
            height: default_height(),
            format: CameraFormat::default(),
            jpeg_quality: default_jpeg_quality(),
            stall_timeout_ms: default_stall_timeout_ms(),
            max_restarts: 0,
            restart_base_delay_ms: default_restart_base_delay_ms(),
            restart_max_delay_ms: default_restart_max_delay_ms(),
            output: None,
        }
    }
}

impl Default for LastWillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: default_lwt_topic(),
            payload: default_lwt_payload(),
            retain: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            verbose: 0,
        }
    }
}

// Hand-written so the password never reaches the logs.
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("address", &self.address)
            .field("client_id", &self.client_id)
            .field("topic", &self.topic)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("publish_timeout_secs", &self.publish_timeout_secs)
            .field("disconnect_timeout_secs", &self.disconnect_timeout_secs)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("max_packet_size", &self.max_packet_size)
            .field("last_will", &self.last_will)
            .finish()
    }
}

impl CnodeConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with CNODE_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. CNODE_BROKER__TOPIC
            .add_source(
                Environment::with_prefix("CNODE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("CNODE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.node.id.is_empty() {
            return Err(ConfigValidationError::MissingField("node.id".to_string()));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.camera.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.jpeg_quality".to_string(),
                message: "Quality must be between 1 and 100".to_string(),
            });
        }

        if self.camera.stall_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.stall_timeout_ms".to_string(),
                message: "Stall timeout must be greater than 0".to_string(),
            });
        }

        if self.camera.output.as_deref() == Some("") {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.output".to_string(),
                message: "Output path must not be empty when set".to_string(),
            });
        }

        if self.broker.address.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "broker.address".to_string(),
            ));
        }
        if let Err(message) = crate::publisher::parse_broker_address(&self.broker.address) {
            return Err(ConfigValidationError::InvalidValue {
                field: "broker.address".to_string(),
                message,
            });
        }

        if self.broker.client_id.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "broker.client_id".to_string(),
            ));
        }

        if self.broker.topic.is_empty() {
            return Err(ConfigValidationError::MissingField("broker.topic".to_string()));
        }

        if self.broker.connect_timeout_secs == 0
            || self.broker.publish_timeout_secs == 0
            || self.broker.disconnect_timeout_secs == 0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "broker.*_timeout_secs".to_string(),
                message: "Timeouts must be greater than 0".to_string(),
            });
        }

        if self.broker.last_will.enabled && self.broker.last_will.topic.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "broker.last_will.topic".to_string(),
            ));
        }

        Ok(())
    }
}

impl CameraConfig {
    /// Get base restart delay as Duration.
    pub fn restart_base_delay(&self) -> Duration {
        Duration::from_millis(self.restart_base_delay_ms)
    }

    /// Get maximum restart delay as Duration.
    pub fn restart_max_delay(&self) -> Duration {
        Duration::from_millis(self.restart_max_delay_ms)
    }
}

impl BrokerConfig {
    /// Get connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get publish acknowledgement timeout as Duration.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    /// Get disconnect timeout as Duration.
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }

    /// Get keep-alive interval as Duration.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
