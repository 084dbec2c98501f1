use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use rumqttc::{
    v5::{
        mqttbytes::{v5::Packet, QoS},
        AsyncClient, ClientError, Event, EventLoop, MqttOptions,
    },
    Outgoing, Transport,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::TelemetryDocument;

/// Lifecycle of the link to the ingestion endpoint
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel options: {0}")]
    Options(&'static str),

    #[error("could not encode telemetry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not queue message: {0}")]
    Publish(#[from] ClientError),
}

/// Outbound half of the telemetry channel, shared with the GPS task
pub trait TelemetryLink: Send + Sync {
    /// Queue `document` for `topic` and return without waiting for the endpoint
    fn publish(&self, topic: &str, document: &TelemetryDocument) -> Result<(), ChannelError>;

    /// Ask for a clean close of the session, also non-blocking
    fn disconnect(&self);
}

/// Creates one link per monitoring session.
/// Any background work must be spawned on `tracker` and stop when `cancel_token` fires.
pub trait TelemetryConnector: Send + Sync {
    fn connect(
        &self,
        cancel_token: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Arc<dyn TelemetryLink>, ChannelError>;
}

/// channel options, these are static immutable settings
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// hostname of the ingestion endpoint
    pub host: String,
    pub port: u16,
    /// device access token, sent as the MQTT username
    pub access_token: String,
    pub keep_alive: Duration,
    /// TLS with the platform trust store, only turn off for a local broker
    pub tls: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            host: "thingsboard.cloud".to_string(),
            port: 8883,
            access_token: String::new(),
            keep_alive: Duration::from_secs(60),
            tls: true,
        }
    }
}

impl ChannelOptions {
    /// Build the MQTT client options
    pub fn mqtt_options(&self) -> Result<MqttOptions, ChannelError> {
        if self.host.is_empty() {
            return Err(ChannelError::Options("missing host"));
        }
        if self.access_token.is_empty() {
            return Err(ChannelError::Options("missing access token"));
        }

        let mut mqtt_opts = MqttOptions::new(
            format!(
                "vehicle-telemetry-{}",
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis()
            ),
            self.host.clone(),
            self.port,
        );
        mqtt_opts
            .set_keep_alive(self.keep_alive)
            .set_credentials(self.access_token.clone(), "")
            .set_connection_timeout(5);
        if self.tls {
            // rustls only speaks TLS 1.2 and up and always verifies the server chain
            mqtt_opts.set_transport(Transport::tls_with_default_config());
        }
        Ok(mqtt_opts)
    }
}

/// A connected session to the ingestion endpoint.
/// The network loop runs on its own task; this handle only enqueues requests.
pub struct TelemetryChannel {
    client: AsyncClient,
    state_recv: watch::Receiver<ConnectionState>,
}

impl TelemetryChannel {
    /// Create the client and start its network loop on `tracker`.
    /// Connecting happens in the background, the outcome is reported through
    /// `subscribe_state` and the log.
    pub fn connect(
        opts: &ChannelOptions,
        cancel_token: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<TelemetryChannel, ChannelError> {
        let mqtt_opts = opts.mqtt_options()?;
        let (client, eventloop) = AsyncClient::new(mqtt_opts, 100);
        let (state_send, state_recv) = watch::channel(ConnectionState::Connecting);

        info!("Connecting to {}:{}...", opts.host, opts.port);
        tracker.spawn(process_mqtt(eventloop, state_send, cancel_token));

        Ok(TelemetryChannel { client, state_recv })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_recv.clone()
    }
}

impl TelemetryLink for TelemetryChannel {
    fn publish(&self, topic: &str, document: &TelemetryDocument) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(document)?;
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        debug!("Sent {:?}", document);
        Ok(())
    }

    fn disconnect(&self) {
        if let Err(err) = self.client.try_disconnect() {
            debug!("Could not request disconnect: {}", err);
        }
    }
}

/// Connects sessions over MQTT with the given options
pub struct MqttConnector {
    pub opts: ChannelOptions,
}

impl TelemetryConnector for MqttConnector {
    fn connect(
        &self,
        cancel_token: CancellationToken,
        tracker: &TaskTracker,
    ) -> Result<Arc<dyn TelemetryLink>, ChannelError> {
        let channel = TelemetryChannel::connect(&self.opts, cancel_token, tracker)?;
        Ok(Arc::new(channel))
    }
}

/// Drives the network loop until cancelled, disconnected, or the first connection error.
/// Polling again after an error would make the client reconnect, which is not wanted here.
async fn process_mqtt(
    mut eventloop: EventLoop,
    state_send: watch::Sender<ConnectionState>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Shutting down telemetry channel!");
                if !matches!(*state_send.borrow(), ConnectionState::Failed(_)) {
                    state_send.send_replace(ConnectionState::Disconnected);
                }
                break;
            },
            msg = eventloop.poll() => match msg {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to telemetry endpoint ({:?})", ack.code);
                    state_send.send_replace(ConnectionState::Connected);
                },
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    debug!("Telemetry published, id={}", ack.pkid);
                },
                Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                    warn!("Endpoint closed the session: {:?}", disconnect.reason_code);
                    state_send.send_replace(ConnectionState::Failed(format!("{:?}", disconnect.reason_code)));
                    break;
                },
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    trace!("Telemetry handed to network, id={}", pkid);
                },
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from telemetry endpoint");
                    state_send.send_replace(ConnectionState::Disconnected);
                    break;
                },
                Ok(_) => {},
                Err(err) => {
                    error!("Telemetry connection failed, not reconnecting: {}", err);
                    state_send.send_replace(ConnectionState::Failed(err.to_string()));
                    break;
                }
            },
        }
    }
}
