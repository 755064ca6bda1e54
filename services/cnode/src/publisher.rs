//! Single-shot MQTT publisher.
//!
//! [`PublishClient::publish_once`] owns one broker session for the duration of
//! a single publish: connect, publish at QoS 1 and wait for the broker's
//! acknowledgement, then disconnect. Every step is bounded by a timeout and
//! any failure aborts the remaining steps.

use crate::config::{BrokerConfig, LastWillConfig};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet,
};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

pub use rumqttc::QoS;

/// Default MQTT port when the address does not name one.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Errors reported by a broker session.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Client request failed: {0}")]
    Request(String),
}

/// Errors that can occur during a publish run.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to open client for broker {address}: {source}")]
    Open { address: String, source: BrokerError },

    #[error("Timed out after {timeout:?} connecting to broker {address}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("Failed to connect to broker {address}: {source}")]
    Connect { address: String, source: BrokerError },

    #[error("Timed out after {timeout:?} waiting for publish acknowledgement on topic {topic}")]
    PublishTimeout { topic: String, timeout: Duration },

    #[error("Failed to publish to topic {topic}: {source}")]
    Publish { topic: String, source: BrokerError },

    #[error("Timed out after {timeout:?} disconnecting from broker {address}")]
    DisconnectTimeout { address: String, timeout: Duration },

    #[error("Failed to disconnect from broker {address}: {source}")]
    Disconnect { address: String, source: BrokerError },
}

/// Notification that an established broker connection dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLost {
    pub broker: String,
    pub cause: String,
}

/// One publish to perform.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub broker_address: String,
    pub client_id: String,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub disconnect_timeout: Duration,
}

impl PublishRequest {
    /// Build an at-least-once request for `payload` from broker configuration.
    pub fn from_config(config: &BrokerConfig, payload: Bytes) -> Self {
        Self {
            broker_address: config.address.clone(),
            client_id: config.client_id.clone(),
            topic: config.topic.clone(),
            payload,
            qos: QoS::AtLeastOnce,
            connect_timeout: config.connect_timeout(),
            publish_timeout: config.publish_timeout(),
            disconnect_timeout: config.disconnect_timeout(),
        }
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub topic: String,
    pub bytes: usize,
    pub qos: QoS,
    pub elapsed: Duration,
}

/// A connection to a broker, driven one step at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerSession: Send {
    /// Connect and wait for the broker's acknowledgement.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    /// Publish and wait until the broker has acknowledged delivery for `qos`.
    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), BrokerError>;

    /// Disconnect cleanly.
    async fn disconnect(&mut self) -> Result<(), BrokerError>;
}

/// Opens broker sessions.
pub trait BrokerConnector: Send + Sync {
    type Session: BrokerSession;

    /// Open a session bound to `address` and `client_id`. Drops of an
    /// established connection are reported on `connection_lost`.
    fn open(
        &self,
        address: &str,
        client_id: &str,
        connection_lost: mpsc::UnboundedSender<ConnectionLost>,
    ) -> Result<Self::Session, BrokerError>;
}

/// Delivers one payload over one broker session.
pub struct PublishClient<C: BrokerConnector> {
    connector: C,
    connection_lost: mpsc::UnboundedSender<ConnectionLost>,
}

impl<C: BrokerConnector> PublishClient<C> {
    pub fn new(connector: C, connection_lost: mpsc::UnboundedSender<ConnectionLost>) -> Self {
        Self {
            connector,
            connection_lost,
        }
    }

    /// Connect, publish `request.payload` and disconnect.
    ///
    /// Disconnect is only attempted after the publish was acknowledged; on any
    /// failure the session is dropped without a DISCONNECT, which closes the
    /// socket and lets the broker fire the last will.
    #[instrument(
        skip(self, request),
        fields(broker = %request.broker_address, topic = %request.topic, bytes = request.payload.len())
    )]
    pub async fn publish_once(&self, request: PublishRequest) -> Result<DeliveryReport, PublishError> {
        let started = Instant::now();
        let address = request.broker_address.clone();

        info!(broker = %address, client_id = %request.client_id, "Initializing broker client");
        let mut session = self
            .connector
            .open(&address, &request.client_id, self.connection_lost.clone())
            .map_err(|source| PublishError::Open {
                address: address.clone(),
                source,
            })?;

        info!("Connecting to broker");
        bounded(request.connect_timeout, session.connect())
            .await
            .map_err(|step| match step {
                StepError::Elapsed => PublishError::ConnectTimeout {
                    address: address.clone(),
                    timeout: request.connect_timeout,
                },
                StepError::Failed(source) => PublishError::Connect {
                    address: address.clone(),
                    source,
                },
            })?;
        info!("Connected to broker");

        let bytes = request.payload.len();
        info!(qos = ?request.qos, "Publishing envelope");
        bounded(
            request.publish_timeout,
            session.publish(&request.topic, request.payload, request.qos),
        )
        .await
        .map_err(|step| match step {
            StepError::Elapsed => PublishError::PublishTimeout {
                topic: request.topic.clone(),
                timeout: request.publish_timeout,
            },
            StepError::Failed(source) => PublishError::Publish {
                topic: request.topic.clone(),
                source,
            },
        })?;
        info!("Publish acknowledged");

        info!("Disconnecting from broker");
        bounded(request.disconnect_timeout, session.disconnect())
            .await
            .map_err(|step| match step {
                StepError::Elapsed => PublishError::DisconnectTimeout {
                    address: address.clone(),
                    timeout: request.disconnect_timeout,
                },
                StepError::Failed(source) => PublishError::Disconnect {
                    address: address.clone(),
                    source,
                },
            })?;

        let report = DeliveryReport {
            topic: request.topic,
            bytes,
            qos: request.qos,
            elapsed: started.elapsed(),
        };
        debug!(elapsed_ms = report.elapsed.as_millis() as u64, "Publish run complete");

        Ok(report)
    }
}

enum StepError {
    Elapsed,
    Failed(BrokerError),
}

async fn bounded<F>(timeout: Duration, step: F) -> Result<(), StepError>
where
    F: Future<Output = Result<(), BrokerError>>,
{
    match tokio::time::timeout(timeout, step).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(StepError::Failed(e)),
        Err(_) => Err(StepError::Elapsed),
    }
}

/// Parse broker address in format mqtt://host:port, tcp://host:port, host:port or host.
pub fn parse_broker_address(address: &str) -> Result<(&str, u16), String> {
    let address = address.trim_start_matches("mqtt://");
    let address = address.trim_start_matches("tcp://");

    let parts: Vec<&str> = address.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((*host, DEFAULT_MQTT_PORT)),
        [host, port] if !host.is_empty() => port
            .parse::<u16>()
            .map(|port| (*host, port))
            .map_err(|_| format!("Invalid port in broker address: {}", port)),
        _ => Err(format!("Invalid broker address format: {}", address)),
    }
}

/// Connection settings shared by every MQTT session.
#[derive(Clone)]
pub struct MqttConnector {
    credentials: Option<(String, String)>,
    last_will: Option<LastWillConfig>,
    keep_alive: Duration,
    max_packet_size: usize,
}

impl MqttConnector {
    pub fn from_config(config: &BrokerConfig) -> Self {
        let credentials = config.username.as_ref().map(|user| {
            (
                user.clone(),
                config.password.clone().unwrap_or_default(),
            )
        });

        Self {
            credentials,
            last_will: config
                .last_will
                .enabled
                .then(|| config.last_will.clone()),
            keep_alive: config.keep_alive(),
            max_packet_size: config.max_packet_size,
        }
    }

    fn options(&self, client_id: &str, host: &str, port: u16) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(self.max_packet_size, self.max_packet_size);

        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user, password);
        }

        if let Some(will) = &self.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.as_bytes().to_vec(),
                QoS::AtLeastOnce,
                will.retain,
            ));
        }

        options
    }
}

impl BrokerConnector for MqttConnector {
    type Session = MqttSession;

    fn open(
        &self,
        address: &str,
        client_id: &str,
        connection_lost: mpsc::UnboundedSender<ConnectionLost>,
    ) -> Result<MqttSession, BrokerError> {
        let (host, port) = parse_broker_address(address).map_err(BrokerError::InvalidAddress)?;
        let (client, eventloop) = AsyncClient::new(self.options(client_id, host, port), 10);

        Ok(MqttSession {
            client,
            eventloop,
            broker: address.to_string(),
            connection_lost,
            connected: false,
        })
    }
}

/// A rumqttc client and the event loop that drives it.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    broker: String,
    connection_lost: mpsc::UnboundedSender<ConnectionLost>,
    connected: bool,
}

impl MqttSession {
    /// Poll one event, reporting the loss of an established connection.
    async fn next_event(&mut self) -> Result<Event, BrokerError> {
        match self.eventloop.poll().await {
            Ok(event) => Ok(event),
            Err(e) => {
                let cause = e.to_string();
                let err = broker_error(e);
                if self.connected {
                    self.connected = false;
                    warn!(broker = %self.broker, cause = %cause, "Connection lost");
                    let _ = self.connection_lost.send(ConnectionLost {
                        broker: self.broker.clone(),
                        cause: cause.clone(),
                    });
                }
                Err(err)
            }
        }
    }
}

/// Classify an event loop error. A refused CONNACK arrives here, not as a packet.
fn broker_error(e: ConnectionError) -> BrokerError {
    match e {
        ConnectionError::ConnectionRefused(code) => BrokerError::Refused(format!("{:?}", code)),
        other => BrokerError::Connection(other.to_string()),
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        loop {
            if let Event::Incoming(Packet::ConnAck(ack)) = self.next_event().await? {
                if ack.code != ConnectReturnCode::Success {
                    return Err(BrokerError::Refused(format!("{:?}", ack.code)));
                }
                self.connected = true;
                return Ok(());
            }
        }
    }

    async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<(), BrokerError> {
        self.client
            .publish_bytes(topic, qos, false, payload)
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))?;

        let mut pkid = None;
        loop {
            match self.next_event().await? {
                Event::Outgoing(Outgoing::Publish(id)) => {
                    if qos == QoS::AtMostOnce {
                        return Ok(());
                    }
                    pkid = Some(id);
                }
                Event::Incoming(Packet::PubAck(ack)) if qos == QoS::AtLeastOnce => {
                    if pkid == Some(ack.pkid) {
                        return Ok(());
                    }
                }
                Event::Incoming(Packet::PubComp(comp)) if qos == QoS::ExactlyOnce => {
                    if pkid == Some(comp.pkid) {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))?;

        // MQTT 3.1.1 has no disconnect acknowledgement; the packet leaving is the end.
        loop {
            if let Event::Outgoing(Outgoing::Disconnect) = self.next_event().await? {
                self.connected = false;
                return Ok(());
            }
        }
    }
}
