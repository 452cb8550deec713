//! The bridge between one DALI bus and Home Assistant.
//!
//! [`Bridge`] owns every control gear, group and scene on the bus together
//! with the [`BridgeContext`] they act through: the bus driver, the Home
//! Assistant connection and the bridge's own entities. Gear are the only
//! scheduled tasks; groups and scenes change only in reaction to gear or to
//! commands.

pub mod gear;
pub mod group;

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;
use tracing::info;
use tracing::warn;

use self::gear::ControlGear;
use self::group::Group;
use crate::bus::BusError;
use crate::bus::Driver;
use crate::bus::send;
use crate::config::DaliConfig;
use crate::config::GroupMode;
use crate::dali::Address;
use crate::dali::Command;
use crate::mqtt::HomeAssistant;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttError;
use crate::mqtt::MqttEvent;
use crate::mqtt::discovery::DeviceInfo;
use crate::mqtt::entity::Action;
use crate::mqtt::entity::Entity;
use crate::mqtt::entity::EntityCategory;
use crate::mqtt::entity::EntityId;
use crate::mqtt::entity::EntityKind;
use crate::mqtt::entity::Topics;
use crate::mqtt::light::LightCommand;
use crate::scheduler;

pub(crate) const MANUFACTURER: &str = "dali2mqtt";

/// Status the bridge leaves behind when it goes away
pub const STATUS_STOPPED: &str = "Stopped";

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Mqtt(#[from] MqttError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initialising,
    Scanning,
    Running,
}

/// Everything gear and groups need while they run.
pub struct BridgeContext<C: MqttClient> {
    hass: HomeAssistant<C>,
    bus: Box<dyn Driver>,
    topics: Topics,
    bus_name: String,
    bridge_device: DeviceInfo,
    group_mode: GroupMode,
    dry_run: bool,
    /// Scene entities, created as gear report levels for them
    scenes: BTreeMap<u8, EntityId>,
    emergency_controls: bool,
    status: EntityId,
    phase: Phase,
    bus_unavailable: bool,
}

impl<C: MqttClient> BridgeContext<C> {
    /// Register the bridge's own entities and command subscription.
    pub async fn new(
        mut hass: HomeAssistant<C>,
        bus: Box<dyn Driver>,
        config: &DaliConfig,
        dry_run: bool,
    ) -> Result<Self, MqttError> {
        let topics = Topics::new(&config.mqtt_prefix, &config.bus_id);
        hass.register_command_pattern(topics.command_pattern()).await?;

        let bridge_device = DeviceInfo {
            identifiers: vec![config.bus_id.clone()],
            name: config.bus_name.clone(),
            manufacturer: MANUFACTURER.to_string(),
            model: Some("DALI bridge".to_string()),
            hw_version: None,
            sw_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            via_device: None,
        };

        let status = Entity::new(
            &topics,
            "status",
            "DALI bridge status",
            Some(bridge_device.clone()),
            EntityKind::Sensor {
                device_class: None,
                category: Some(EntityCategory::Diagnostic),
            },
        );
        let status = hass.register_entity(status).await?;

        let rescan = Entity::new(
            &topics,
            "rescan",
            "Rescan DALI devices",
            Some(bridge_device.clone()),
            EntityKind::Button {
                device_class: Some("restart"),
                category: Some(EntityCategory::Config),
                action: Action::Rescan,
            },
        );
        hass.register_entity(rescan).await?;

        let mut ctx = Self {
            hass,
            bus,
            topics,
            bus_name: config.bus_name.clone(),
            bridge_device,
            group_mode: config.groups,
            dry_run,
            scenes: BTreeMap::new(),
            emergency_controls: false,
            status,
            phase: Phase::Initialising,
            bus_unavailable: false,
        };
        ctx.update_status().await?;
        Ok(ctx)
    }

    pub fn groups_enabled(&self) -> bool {
        self.group_mode != GroupMode::Off
    }

    fn status_text(&self) -> &'static str {
        if self.bus_unavailable {
            return "Bus unavailable";
        }
        match self.phase {
            Phase::Initialising => "Initialising",
            Phase::Scanning => "Scanning",
            Phase::Running if self.dry_run => "Test mode",
            Phase::Running => "Running",
        }
    }

    async fn update_status(&mut self) -> Result<(), MqttError> {
        let text = self.status_text();
        self.hass.set_state(self.status, text).await
    }

    async fn set_phase(&mut self, phase: Phase) -> Result<(), MqttError> {
        if self.phase != phase {
            info!("Bridge {:?}", phase);
            self.phase = phase;
        }
        self.update_status().await
    }

    /// A bus transaction went through.
    pub async fn bus_ok(&mut self) -> Result<(), MqttError> {
        if self.bus_unavailable {
            info!("Bus available again");
            self.bus_unavailable = false;
        }
        self.update_status().await
    }

    /// A bus transaction failed in transport.
    pub async fn bus_failed(&mut self) -> Result<(), MqttError> {
        self.bus_unavailable = true;
        self.update_status().await
    }

    /// Send one command in its own transaction. Returns whether the rest of
    /// the system should act as if it took effect; in dry-run mode nothing is
    /// sent and it always does.
    pub async fn send(&mut self, command: Command) -> Result<bool, MqttError> {
        let name = command.name();
        if self.dry_run {
            info!("Dry run, not sending {}", name);
            return Ok(true);
        }
        let result = match self.bus.connect().await {
            Ok(mut conn) => send(conn.as_mut(), command).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => {
                self.bus_ok().await?;
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to send {}: {}", name, e);
                self.bus_failed().await?;
                Ok(false)
            }
        }
    }

    /// Create the entity for a scene unless it exists.
    pub async fn add_scene(&mut self, scene: u8) -> Result<(), MqttError> {
        if self.scenes.contains_key(&scene) {
            return Ok(());
        }
        let entity = Entity::new(
            &self.topics,
            &format!("scene_{}", scene),
            format!("Scene {}", scene),
            None,
            EntityKind::Scene {
                action: Action::Scene(scene),
            },
        );
        let id = self.hass.register_entity(entity).await?;
        self.scenes.insert(scene, id);
        Ok(())
    }

    /// Create the emergency lighting buttons unless they exist.
    pub async fn register_emergency_controls(&mut self) -> Result<(), MqttError> {
        if self.emergency_controls {
            return Ok(());
        }
        let buttons = [
            (
                "inhibit",
                "Inhibit emergency lighting for 15 minutes",
                Action::Inhibit,
            ),
            (
                "reset_inhibit",
                "Re-enable emergency lighting",
                Action::ResetInhibit,
            ),
        ];
        for (uid, name, action) in buttons {
            let entity = Entity::new(
                &self.topics,
                uid,
                name,
                Some(self.bridge_device.clone()),
                EntityKind::Button {
                    device_class: None,
                    category: Some(EntityCategory::Config),
                    action,
                },
            );
            self.hass.register_entity(entity).await?;
        }
        self.emergency_controls = true;
        Ok(())
    }
}

/// State topic of the bridge status entity, for the MQTT last will
pub fn status_topic(config: &DaliConfig) -> String {
    Topics::new(&config.mqtt_prefix, &config.bus_id).state("status")
}

pub struct Bridge<C: MqttClient> {
    ctx: BridgeContext<C>,
    /// Indexed by short address
    gear: Vec<ControlGear>,
    groups: BTreeMap<u8, Group>,
}

impl<C: MqttClient> Bridge<C> {
    pub async fn new(
        hass: HomeAssistant<C>,
        bus: Box<dyn Driver>,
        config: &DaliConfig,
        dry_run: bool,
    ) -> Result<Self, MqttError> {
        let ctx = BridgeContext::new(hass, bus, config, dry_run).await?;
        let gear = (0..=config.max_address)
            .map(|address| {
                let brightness = config.gear(address).and_then(|g| g.brightness);
                ControlGear::new(address, config.poll_interval(), brightness)
            })
            .collect();
        Ok(Self {
            ctx,
            gear,
            groups: BTreeMap::new(),
        })
    }

    pub fn gear(&self) -> &[ControlGear] {
        &self.gear
    }

    pub fn groups(&self) -> &BTreeMap<u8, Group> {
        &self.groups
    }

    #[cfg(test)]
    pub(crate) fn hass(&self) -> &HomeAssistant<C> {
        &self.ctx.hass
    }

    #[cfg(test)]
    pub(crate) fn hass_mut(&mut self) -> &mut HomeAssistant<C> {
        &mut self.ctx.hass
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> String {
        testing::status(&self.ctx)
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.hass.is_connected()
    }

    pub async fn connect(&mut self) -> Result<(), MqttError> {
        self.ctx.hass.connect().await
    }

    pub async fn poll_event(&mut self, timeout: Duration) -> Result<Option<MqttEvent>, MqttError> {
        self.ctx.hass.poll_event(timeout).await
    }

    pub async fn handle_event(&mut self, event: MqttEvent) -> Result<(), MqttError> {
        match event {
            MqttEvent::Connected => self.ctx.hass.on_connect().await,
            MqttEvent::Disconnected(reason) => {
                if self.ctx.hass.is_connected() {
                    warn!("Lost connection to MQTT broker: {}", reason);
                } else {
                    debug!("MQTT connection attempt failed: {}", reason);
                }
                self.ctx.hass.on_disconnect();
                Ok(())
            }
            MqttEvent::Message(msg) => match self.ctx.hass.handle_message(&msg).await? {
                Some((action, payload)) => self.dispatch(action, &payload).await,
                None => Ok(()),
            },
        }
    }

    /// Act on a command from Home Assistant.
    pub async fn dispatch(&mut self, action: Action, payload: &[u8]) -> Result<(), MqttError> {
        debug!("Dispatching {:?}", action);
        match action {
            Action::Rescan => self.rescan().await,
            Action::Inhibit => {
                self.ctx
                    .send(Command::emergency_inhibit(Address::Broadcast))
                    .await?;
                Ok(())
            }
            Action::ResetInhibit => {
                self.ctx
                    .send(Command::emergency_relight_reset_inhibit(Address::Broadcast))
                    .await?;
                Ok(())
            }
            Action::Scene(scene) => self.recall_scene(scene).await,
            Action::Light(address) => {
                let Some(command) = parse_light_command(payload) else {
                    return Ok(());
                };
                let Some(gear) = self.gear.get_mut(usize::from(address)) else {
                    warn!(address, "command for an address that isn't scanned");
                    return Ok(());
                };
                gear.command(&mut self.ctx, &command).await?;
                self.refresh_groups().await
            }
            Action::Group(number) => {
                let Some(command) = parse_light_command(payload) else {
                    return Ok(());
                };
                let Some(group) = self.groups.get_mut(&number) else {
                    warn!(group = number, "command for an unknown group");
                    return Ok(());
                };
                group.command(&mut self.ctx, &mut self.gear, &command).await?;
                self.refresh_groups().await
            }
        }
    }

    /// Mark every gear for scanning again.
    pub async fn rescan(&mut self) -> Result<(), MqttError> {
        info!("Rescanning all control gear");
        for gear in &mut self.gear {
            gear.rescan();
        }
        self.ctx.set_phase(Phase::Scanning).await
    }

    async fn recall_scene(&mut self, scene: u8) -> Result<(), MqttError> {
        info!("Recalling scene {}", scene);
        if !self
            .ctx
            .send(Command::go_to_scene(Address::Broadcast, scene))
            .await?
        {
            return Ok(());
        }
        for gear in &mut self.gear {
            gear.notify_scene(&mut self.ctx, scene).await?;
        }
        self.refresh_groups().await
    }

    async fn refresh_groups(&mut self) -> Result<(), MqttError> {
        for group in self.groups.values() {
            group.refresh(&mut self.ctx, &self.gear).await?;
        }
        Ok(())
    }

    /// Earliest gear deadline
    pub fn next_deadline(&self) -> Option<(usize, tokio::time::Instant)> {
        scheduler::earliest(&self.gear)
    }

    /// When the next held-back state is due to be published
    pub fn next_release(&self) -> Option<tokio::time::Instant> {
        self.ctx.hass.next_release()
    }

    pub async fn publish_due(&mut self, now: tokio::time::Instant) -> Result<(), MqttError> {
        self.ctx.hass.publish_due(now).await
    }

    /// Run the gear at `index`: scan it if unscanned, otherwise poll it.
    pub async fn run_task(&mut self, index: usize) -> Result<(), MqttError> {
        if self.ctx.phase == Phase::Initialising {
            self.ctx.set_phase(Phase::Scanning).await?;
        }
        let Some(gear) = self.gear.get_mut(index) else {
            return Ok(());
        };
        let scanning = gear.is_unscanned();
        gear.run(&mut self.ctx).await?;

        if scanning && gear.is_light() && self.ctx.groups_enabled() {
            let memberships = gear.groups();
            for number in (0..16u8).filter(|n| memberships & (1 << n) != 0) {
                self.groups
                    .entry(number)
                    .or_insert_with(|| Group::new(number))
                    .join(gear);
            }
        }

        let address = gear.address();
        for group in self.groups.values().filter(|g| g.contains(address)) {
            group.refresh(&mut self.ctx, &self.gear).await?;
        }
        Ok(())
    }

    /// Work done whenever no gear is due: announce groups found since the
    /// last sweep and mark scanning complete.
    pub async fn idle(&mut self) -> Result<(), MqttError> {
        for group in self.groups.values_mut().filter(|g| !g.is_announced()) {
            info!(
                group = group.number(),
                members = ?group.members(),
                "announcing group"
            );
            group.announce(&mut self.ctx, &self.gear).await?;
        }
        if self.ctx.phase != Phase::Running && !self.gear.iter().any(ControlGear::is_unscanned) {
            self.ctx.set_phase(Phase::Running).await?;
        }
        Ok(())
    }

    /// Say goodbye and disconnect.
    pub async fn shutdown(&mut self) -> Result<(), MqttError> {
        info!("Shutting down");
        self.ctx
            .hass
            .set_state_now(self.ctx.status, STATUS_STOPPED)
            .await?;
        self.ctx.hass.disconnect().await
    }
}

fn parse_light_command(payload: &[u8]) -> Option<LightCommand> {
    match LightCommand::parse(payload) {
        Ok(command) => Some(command),
        Err(e) => {
            warn!("Ignoring malformed light command: {}", e);
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::SimGear;
    use crate::bus::mock::SimulatedBus;
    use crate::mqtt::MqttMessage;
    use testing::bridge;

    fn office() -> SimulatedBus {
        SimulatedBus::new()
            .with_gear(
                0,
                SimGear {
                    actual_level: 120,
                    groups: 0b10,
                    scenes: {
                        let mut scenes = [0xff; 16];
                        scenes[4] = 30;
                        scenes
                    },
                    ..Default::default()
                },
            )
            .with_gear(
                2,
                SimGear {
                    min_level: 50,
                    max_level: 200,
                    groups: 0b10,
                    ..Default::default()
                },
            )
    }

    async fn scan_all(bridge: &mut Bridge<crate::mqtt::MockMqttClient>) {
        for index in 0..bridge.gear().len() {
            bridge.run_task(index).await.unwrap();
        }
        bridge.idle().await.unwrap();
    }

    fn command(topic: &str, payload: &str) -> MqttEvent {
        MqttEvent::Message(MqttMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            retain: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_bridge_announces_itself() {
        let bridge = bridge(SimulatedBus::new(), false, "max_address = 3").await;
        assert_eq!(bridge.gear().len(), 4);
        assert_eq!(bridge.status(), "Initialising");

        let client = bridge.hass().client();
        assert!(client
            .subscriptions
            .contains(&"dali2mqtt/bus1/+/command".to_string()));
        assert_eq!(
            client.published_topics(),
            vec![
                "homeassistant/sensor/bus1_status/config",
                "homeassistant/button/bus1_rescan/config",
            ]
        );
    }

    #[test]
    fn test_status_topic() {
        let config = testing::dali_config("mqtt_prefix = \"lights\"");
        assert_eq!(status_topic(&config), "lights/bus1/status/state");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gear_override_from_config() {
        let bus = SimulatedBus::new().with_gear(
            1,
            SimGear {
                device_types: vec![7],
                ..Default::default()
            },
        );
        let mut bridge = bridge(
            bus,
            false,
            "max_address = 3\n[gear.1]\nbrightness = true",
        )
        .await;
        scan_all(&mut bridge).await;
        assert!(bridge.gear()[1].supports_brightness());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_then_running() {
        let mut bridge = bridge(office(), false, "max_address = 3").await;
        bridge.run_task(0).await.unwrap();
        assert_eq!(bridge.status(), "Scanning");

        scan_all(&mut bridge).await;
        assert!(bridge.gear()[0].is_light());
        assert!(!bridge.gear()[1].is_light());
        assert_eq!(bridge.status(), "Running");
        assert!(bridge.groups().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_status() {
        let mut bridge = bridge(office(), true, "max_address = 3").await;
        scan_all(&mut bridge).await;
        assert_eq!(bridge.status(), "Test mode");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_button() {
        let mut bridge = bridge(office(), false, "max_address = 3").await;
        scan_all(&mut bridge).await;

        bridge
            .handle_event(command("dali2mqtt/bus1/rescan/command", "PRESS"))
            .await
            .unwrap();
        assert!(bridge.gear().iter().all(ControlGear::is_unscanned));
        assert_eq!(bridge.status(), "Scanning");
    }

    #[tokio::test(start_paused = true)]
    async fn test_light_command_over_mqtt() {
        let bus = office();
        let mut bridge = bridge(bus.clone(), false, "max_address = 3").await;
        scan_all(&mut bridge).await;
        bus.clear_sent();

        bridge
            .handle_event(command(
                "dali2mqtt/bus1/light_2/command",
                r#"{"state": "ON", "brightness": 100}"#,
            ))
            .await
            .unwrap();
        assert_eq!(bus.sent(), vec!["DirectArcPower"]);
        assert_eq!(bus.gear(2).unwrap().actual_level, 100);
        assert_eq!(bridge.gear()[2].current_level(), 100);

        bridge
            .handle_event(command("dali2mqtt/bus1/light_2/command", "not json"))
            .await
            .unwrap();
        assert_eq!(bus.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scene_recall() {
        let bus = office();
        let mut bridge = bridge(bus.clone(), false, "max_address = 3").await;
        scan_all(&mut bridge).await;
        bus.clear_sent();

        bridge
            .handle_event(command("dali2mqtt/bus1/scene_4/command", "ON"))
            .await
            .unwrap();
        assert_eq!(bus.sent(), vec!["GoToScene"]);
        assert_eq!(bridge.gear()[0].current_level(), 30);
        // No level stored for this scene
        assert_eq!(bridge.gear()[2].current_level(), 0);
        assert!(bridge
            .hass()
            .client()
            .published_topics()
            .contains(&"homeassistant/scene/bus1_scene_4/config".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scene_recall_in_dry_run() {
        let bus = office();
        let mut bridge = bridge(bus.clone(), true, "max_address = 3").await;
        scan_all(&mut bridge).await;
        bus.clear_sent();

        bridge.dispatch(Action::Scene(4), b"ON").await.unwrap();
        assert!(bus.sent().is_empty());
        assert_eq!(bridge.gear()[0].current_level(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_controls() {
        let bus = SimulatedBus::new().with_gear(
            1,
            SimGear {
                device_types: vec![1],
                ..Default::default()
            },
        );
        let mut bridge = bridge(bus.clone(), false, "max_address = 3").await;
        let topics = bridge.hass().client().published_topics();
        assert!(!topics.contains(&"homeassistant/button/bus1_inhibit/config".to_string()));

        scan_all(&mut bridge).await;
        let topics = bridge.hass().client().published_topics();
        assert!(topics.contains(&"homeassistant/button/bus1_inhibit/config".to_string()));
        assert!(topics.contains(&"homeassistant/button/bus1_reset_inhibit/config".to_string()));

        bus.clear_sent();
        bridge
            .handle_event(command("dali2mqtt/bus1/inhibit/command", "PRESS"))
            .await
            .unwrap();
        bridge
            .handle_event(command("dali2mqtt/bus1/reset_inhibit/command", "PRESS"))
            .await
            .unwrap();
        let sent = bus.sent();
        assert!(sent.contains(&"Inhibit"));
        assert!(sent.contains(&"ReLightResetInhibit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_announced_when_idle() {
        let bus = office();
        let mut bridge = bridge(bus.clone(), false, "max_address = 3\ngroups = \"max\"").await;
        for index in 0..bridge.gear().len() {
            bridge.run_task(index).await.unwrap();
        }
        let group = &bridge.groups()[&1];
        assert_eq!(group.members(), &[0, 2]);
        assert!(!group.is_announced());

        bridge.idle().await.unwrap();
        assert!(bridge.groups()[&1].is_announced());
        assert!(bridge
            .hass()
            .client()
            .published_topics()
            .contains(&"homeassistant/light/bus1_group_1/config".to_string()));

        bus.clear_sent();
        bridge
            .handle_event(command("dali2mqtt/bus1/group_1/command", r#"{"state": "OFF"}"#))
            .await
            .unwrap();
        assert_eq!(bus.sent(), vec!["Off"]);
        assert_eq!(bridge.gear()[0].current_level(), 0);
        assert_eq!(bus.gear(0).unwrap().actual_level, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_reconnect() {
        let mut bridge = bridge(office(), false, "max_address = 3").await;
        bridge
            .handle_event(MqttEvent::Disconnected("broker went away".to_string()))
            .await
            .unwrap();
        assert!(!bridge.is_connected());
        bridge.handle_event(MqttEvent::Connected).await.unwrap();
        assert!(bridge.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_publishes_stopped() {
        let mut bridge = bridge(office(), false, "max_address = 3").await;
        bridge.shutdown().await.unwrap();
        assert_eq!(
            bridge.hass().client().published_to("dali2mqtt/bus1/status/state"),
            vec!["Stopped"]
        );
        assert!(!bridge.is_connected());
    }
}
