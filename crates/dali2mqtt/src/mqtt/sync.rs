use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use super::MqttConfig;
use super::client::MqttClient;
use super::client::MqttError;
use super::client::MqttEvent;
use super::client::MqttMessage;
use super::discovery::discovery_topic;
use super::entity::Action;
use super::entity::Entity;
use super::entity::EntityId;

/// Keeps Home Assistant's view of our entities in step with their state
///
/// Owns every registered entity. Discovery is (re)published on registration,
/// on connect and whenever Home Assistant announces it has come online. State
/// is published only when it changes.
///
/// Home Assistant drops states that arrive right after a discovery message
/// which created something, so the first state after a discovery message is
/// held back for the debounce interval. While held back, later changes to the
/// same entity are not published; the entity's state at release time is.
pub struct HomeAssistant<C: MqttClient> {
    client: C,
    discovery_prefix: String,
    debounce: Duration,
    connected: bool,
    entities: Vec<Entity>,
    command_topics: HashMap<String, EntityId>,
    command_patterns: Vec<String>,
    /// Release times, oldest first
    pending: VecDeque<(Instant, EntityId)>,
}

impl<C: MqttClient> HomeAssistant<C> {
    pub fn new(client: C, config: &MqttConfig) -> Self {
        Self {
            client,
            discovery_prefix: config.discovery_prefix.clone(),
            debounce: config.state_debounce(),
            connected: false,
            entities: Vec::new(),
            command_topics: HashMap::new(),
            command_patterns: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Topic Home Assistant announces its own availability on
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    pub fn entity(&self, id: EntityId) -> &Entity {
        &self.entities[id.0]
    }

    #[cfg(test)]
    pub fn client(&self) -> &C {
        &self.client
    }

    #[cfg(test)]
    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Subscribe to command topics matching `pattern`, now and on every
    /// reconnect.
    pub async fn register_command_pattern(&mut self, pattern: String) -> Result<(), MqttError> {
        if self.connected {
            self.client.subscribe(&pattern).await?;
        }
        self.command_patterns.push(pattern);
        Ok(())
    }

    /// Take ownership of an entity and announce it.
    ///
    /// Entities are never unregistered.
    pub async fn register_entity(&mut self, entity: Entity) -> Result<EntityId, MqttError> {
        let id = EntityId(self.entities.len());
        if let Some(topic) = &entity.command_topic {
            self.command_topics.insert(topic.clone(), id);
        }
        debug!("Registering entity {}", entity.unique_id);
        self.entities.push(entity);
        self.update(id, true).await?;
        Ok(id)
    }

    /// Record a new state for an entity, publishing it if it changed.
    pub async fn set_state(&mut self, id: EntityId, state: impl Into<String>) -> Result<(), MqttError> {
        let state = state.into();
        let entity = &mut self.entities[id.0];
        if entity.state.as_deref() == Some(state.as_str()) {
            return Ok(());
        }
        entity.state = Some(state);
        self.update(id, false).await
    }

    /// Record and publish a state straight away, even if it is being held
    /// back. For the last words before shutting down.
    pub async fn set_state_now(
        &mut self,
        id: EntityId,
        state: impl Into<String>,
    ) -> Result<(), MqttError> {
        self.pending.retain(|(_, p)| *p != id);
        self.entities[id.0].state = Some(state.into());
        self.update(id, false).await
    }

    fn is_pending(&self, id: EntityId) -> bool {
        self.pending.iter().any(|(_, p)| *p == id)
    }

    async fn update(&mut self, id: EntityId, send_discovery: bool) -> Result<(), MqttError> {
        if !self.connected {
            return Ok(());
        }
        let entity = &self.entities[id.0];
        if send_discovery {
            let topic = discovery_topic(
                &self.discovery_prefix,
                entity.component().as_ref(),
                &entity.unique_id,
            );
            let payload = serde_json::to_vec(&entity.discovery())?;
            self.client.publish(&topic, &payload, false).await?;
            if entity.state_topic.is_some() && !self.is_pending(id) {
                self.pending.push_back((Instant::now() + self.debounce, id));
            }
            return Ok(());
        }
        if self.is_pending(id) {
            return Ok(());
        }
        if let (Some(topic), Some(state)) = (&entity.state_topic, &entity.state) {
            self.client.publish(topic, state.as_bytes(), false).await?;
        }
        Ok(())
    }

    /// Republish discovery and state for every entity.
    pub async fn update_all(&mut self) -> Result<(), MqttError> {
        for index in 0..self.entities.len() {
            self.update(EntityId(index), true).await?;
        }
        Ok(())
    }

    pub async fn connect(&mut self) -> Result<(), MqttError> {
        self.client.connect().await
    }

    pub async fn poll_event(&mut self, timeout: Duration) -> Result<Option<MqttEvent>, MqttError> {
        self.client.poll_event(timeout).await
    }

    pub async fn on_connect(&mut self) -> Result<(), MqttError> {
        info!("Connected to MQTT broker");
        self.connected = true;
        let status_topic = self.status_topic();
        self.client.subscribe(&status_topic).await?;
        for pattern in &self.command_patterns {
            self.client.subscribe(pattern).await?;
        }
        self.update_all().await
    }

    pub fn on_disconnect(&mut self) {
        self.connected = false;
        // Everything is republished on reconnect
        self.pending.clear();
    }

    /// Handle an incoming message, returning the command it carries if any.
    pub async fn handle_message(
        &mut self,
        msg: &MqttMessage,
    ) -> Result<Option<(Action, Vec<u8>)>, MqttError> {
        if msg.topic == self.status_topic() {
            if msg.payload == b"online" {
                info!("Home Assistant came online, republishing everything");
                self.update_all().await?;
            }
            return Ok(None);
        }
        match self.command_topics.get(&msg.topic) {
            Some(id) => {
                let entity = &self.entities[id.0];
                debug!("Command for {}", entity.unique_id);
                Ok(entity.action().map(|action| (action, msg.payload.clone())))
            }
            None => {
                debug!("Ignoring message on {}", msg.topic);
                Ok(None)
            }
        }
    }

    /// When the next held-back state is due
    pub fn next_release(&self) -> Option<Instant> {
        self.pending.front().map(|(release, _)| *release)
    }

    /// Publish every held-back state whose release time has passed.
    pub async fn publish_due(&mut self, now: Instant) -> Result<(), MqttError> {
        while let Some(&(release, id)) = self.pending.front() {
            if release > now {
                break;
            }
            self.pending.pop_front();
            self.update(id, false).await?;
        }
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        self.connected = false;
        self.client.disconnect().await
    }
}
