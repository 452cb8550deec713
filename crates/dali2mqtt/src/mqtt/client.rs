use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::ConnectReturnCode;
use rumqttc::ConnectionError;
use rumqttc::Event;
use rumqttc::LastWill;
use rumqttc::MqttOptions;
use rumqttc::Outgoing;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::MqttConfig;

/// Pause between reconnection attempts after the broker connection drops.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// MQTT message received from a subscription
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    #[allow(dead_code)]
    pub retain: bool,
}

/// Something that happened on the broker connection
#[derive(Debug, Clone)]
pub enum MqttEvent {
    /// The broker accepted our connection (initially or after a reconnect)
    Connected,
    /// The connection dropped; the client keeps retrying on its own
    Disconnected(String),
    Message(MqttMessage),
}

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("MQTT broker refused the connection: {0}")]
    NotAuthorized(String),

    #[error("MQTT client not connected. Call connect() first.")]
    NotConnected,

    #[error("MQTT request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT event loop has stopped")]
    Closed,

    #[error("failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Trait for MQTT client operations
///
/// This trait allows for mocking the MQTT client for testing purposes
#[async_trait]
pub trait MqttClient: Send {
    /// Start talking to the broker. Connection progress is reported through
    /// [`MqttClient::poll_event`].
    async fn connect(&mut self) -> Result<(), MqttError>;

    /// Subscribe to an MQTT topic or wildcard pattern
    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError>;

    /// Publish a message to an MQTT topic
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError>;

    /// Wait up to `timeout` for the next connection event
    ///
    /// Returns `Ok(None)` if nothing happened in time. Errors are fatal.
    async fn poll_event(&mut self, timeout: Duration) -> Result<Option<MqttEvent>, MqttError>;

    /// Flush outstanding messages and close the connection
    async fn disconnect(&mut self) -> Result<(), MqttError>;
}

/// Mock MQTT client for testing
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttClient {
    pub events: VecDeque<MqttEvent>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>, bool)>,
    pub is_connected: bool,
    /// When set, the next poll fails as if the broker rejected our credentials
    pub refuse: Option<String>,
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        self.is_connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        self.published
            .push((topic.to_string(), payload.to_vec(), retain));
        Ok(())
    }

    async fn poll_event(&mut self, timeout: Duration) -> Result<Option<MqttEvent>, MqttError> {
        if let Some(reason) = self.refuse.take() {
            return Err(MqttError::NotAuthorized(reason));
        }
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        self.is_connected = false;
        Ok(())
    }
}

#[cfg(test)]
impl MockMqttClient {
    /// Create a new mock MQTT client
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an incoming message
    pub fn add_message(&mut self, topic: &str, payload: &[u8]) {
        self.events.push_back(MqttEvent::Message(MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain: false,
        }));
    }

    /// Payloads published to `topic`, oldest first
    pub fn published_to(&self, topic: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    /// Topics published so far, in order
    pub fn published_topics(&self) -> Vec<String> {
        self.published.iter().map(|(t, _, _)| t.clone()).collect()
    }
}

/// Real MQTT client implementation using rumqttc
pub struct RumqttcClient {
    /// MQTT connection options (stored for lazy initialization)
    mqtt_options: MqttOptions,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Event receiver (created in connect())
    event_rx: Option<mpsc::UnboundedReceiver<Result<MqttEvent, MqttError>>>,

    /// Background event loop task handle
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    /// Create a new RumqttcClient from configuration
    ///
    /// `last_will` is a `(topic, payload)` pair the broker publishes if we
    /// vanish without disconnecting.
    pub fn new(config: &MqttConfig, last_will: Option<(String, String)>) -> Self {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);

        // Set keep-alive interval
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        // Allow large MQTT packets (2 MiB) for discovery payloads
        mqtt_options.set_max_packet_size(2 * 1024 * 1024, 2 * 1024 * 1024);

        if let Some((username, password)) = config.credentials() {
            mqtt_options.set_credentials(username, password);
        }

        if let Some((topic, payload)) = last_will {
            mqtt_options.set_last_will(LastWill::new(topic, payload, QoS::AtMostOnce, false));
        }

        Self {
            mqtt_options,
            client: None,
            event_rx: None,
            event_loop_task: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, MqttError> {
        self.client.as_ref().ok_or(MqttError::NotConnected)
    }
}

fn refused_credentials(code: ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
    )
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        // Create client and event loop
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 256);

        // Create channel for events
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Spawn background task to poll event loop. It only moves bytes; all
        // bridge state stays with the task calling poll_event().
        let task = tokio::spawn(async move {
            loop {
                let event = match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(MqttEvent::Connected),
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        Ok(MqttEvent::Message(MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        }))
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT disconnect sent");
                        break;
                    }
                    Ok(_) => {
                        // Ignore other events (puback, pingresp, etc.)
                        continue;
                    }
                    Err(ConnectionError::ConnectionRefused(code)) if refused_credentials(code) => {
                        let _ = event_tx.send(Err(MqttError::NotAuthorized(format!("{:?}", code))));
                        break;
                    }
                    Err(e) => {
                        warn!("MQTT event loop error: {}", e);
                        if event_tx.send(Ok(MqttEvent::Disconnected(e.to_string()))).is_err() {
                            break;
                        }
                        tokio::time::sleep(RECONNECT_INTERVAL).await;
                        continue;
                    }
                };

                // Send to channel; if receiver dropped, exit
                if event_tx.send(event).is_err() {
                    break;
                }
            }
            info!("MQTT event loop task exiting");
        });

        self.client = Some(client);
        self.event_rx = Some(event_rx);
        self.event_loop_task = Some(task);

        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), MqttError> {
        self.client()?.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .await?;
        Ok(())
    }

    async fn poll_event(&mut self, timeout: Duration) -> Result<Option<MqttEvent>, MqttError> {
        let rx = self.event_rx.as_mut().ok_or(MqttError::NotConnected)?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(event)) => event.map(Some),
            Ok(None) => Err(MqttError::Closed),
        }
    }

    async fn disconnect(&mut self) -> Result<(), MqttError> {
        self.client()?.disconnect().await?;
        if let Some(task) = self.event_loop_task.take() {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("MQTT event loop did not stop in time");
            }
        }
        Ok(())
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}
