//! One control gear on the bus and the light it is exposed as.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::BridgeContext;
use super::BridgeError;
use crate::bus::BusError;
use crate::bus::Connection;
use crate::bus::execute;
use crate::bus::send;
use crate::dali::Address;
use crate::dali::Command;
use crate::dali::EmergencyFeatures;
use crate::dali::Level;
use crate::dali::Progress;
use crate::dali::command::DEVICE_TYPE_EMERGENCY;
use crate::dali::command::DEVICE_TYPE_RELAY;
use crate::dali::command::SCENE_COUNT;
use crate::dali::sequence::QueryDeviceTypes;
use crate::dali::sequence::QueryGroups;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttError;
use crate::mqtt::discovery::DeviceInfo;
use crate::mqtt::entity::Action;
use crate::mqtt::entity::Entity;
use crate::mqtt::entity::EntityCategory;
use crate::mqtt::entity::EntityId;
use crate::mqtt::entity::EntityKind;
use crate::mqtt::entity::on_off;
use crate::mqtt::light::LightCommand;
use crate::mqtt::light::LightState;
use crate::scheduler::Scheduled;

/// Physical minimum reported by gear that can only switch on and off.
const ON_OFF_PHYSICAL_MINIMUM: u8 = 254;

/// The cheapest bus command reaching a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelPrimitive {
    Off,
    RecallMin,
    RecallMax,
    DirectArcPower(u8),
}

impl LevelPrimitive {
    /// Pick the command for `target` on gear limited to `min..=max`.
    ///
    /// Fades need the direct level command; instant changes use the boundary
    /// recalls where they apply.
    pub fn choose(target: u8, min: u8, max: u8, transition: bool) -> Self {
        if transition {
            let level = if target == 0 {
                0
            } else {
                target.clamp(min, max.max(min))
            };
            return Self::DirectArcPower(level);
        }
        if target == 0 {
            Self::Off
        } else if target <= min {
            Self::RecallMin
        } else if target >= max {
            Self::RecallMax
        } else {
            Self::DirectArcPower(target)
        }
    }

    pub fn command(self, address: Address) -> Command {
        match self {
            Self::Off => Command::off(address),
            Self::RecallMin => Command::recall_min_level(address),
            Self::RecallMax => Command::recall_max_level(address),
            Self::DirectArcPower(level) => Command::direct_arc_power(address, level),
        }
    }

    /// Level gear limited to `min..=max` ends up at.
    pub fn resulting_level(self, min: u8, max: u8) -> u8 {
        match self {
            Self::Off | Self::DirectArcPower(0) => 0,
            Self::RecallMin => min,
            Self::RecallMax => max,
            Self::DirectArcPower(level) => level.clamp(min, max.max(min)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GearState {
    /// Waiting for a scan
    Unscanned { due: Instant },
    /// Nothing answered at this address
    NotPresent,
    /// Answered, but isn't something we expose as a light
    NonLight,
    /// A scan was abandoned on a missing reply; waits for a rescan
    Unresolved,
    Light,
}

enum ScanOutcome {
    NotPresent,
    NonLight,
    Unresolved(&'static str),
    Light,
}

enum PollOutcome {
    Level(u8),
    LampFailure(bool),
    Missing,
}

#[derive(Debug, Clone, Copy)]
struct GearEntities {
    light: EntityId,
    failure: EntityId,
    physical_minimum: EntityId,
}

#[derive(Debug)]
pub struct ControlGear {
    address: u8,
    poll_interval: Duration,
    brightness_override: Option<bool>,
    state: GearState,
    supports_brightness: bool,
    physical_minimum: u8,
    min_level: u8,
    max_level: u8,
    current_level: u8,
    previous_active_level: u8,
    lamp_failure: bool,
    /// Scene number to recall level
    scenes: BTreeMap<u8, u8>,
    /// Group membership, bit n set for group n
    groups: u16,
    last_update: Instant,
    entities: Option<GearEntities>,
}

impl Scheduled for ControlGear {
    fn deadline(&self) -> Option<Instant> {
        match self.state {
            GearState::Unscanned { due } => Some(due),
            GearState::Light => self.last_update.checked_add(self.poll_interval),
            GearState::NotPresent | GearState::NonLight | GearState::Unresolved => None,
        }
    }
}

impl ControlGear {
    pub fn new(address: u8, poll_interval: Duration, brightness_override: Option<bool>) -> Self {
        let now = Instant::now();
        Self {
            address,
            poll_interval,
            brightness_override,
            state: GearState::Unscanned { due: now },
            supports_brightness: true,
            physical_minimum: 0,
            min_level: 0,
            max_level: 0,
            current_level: 0,
            previous_active_level: 0,
            lamp_failure: false,
            scenes: BTreeMap::new(),
            groups: 0,
            last_update: now,
            entities: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn state(&self) -> GearState {
        self.state
    }

    pub fn is_unscanned(&self) -> bool {
        matches!(self.state, GearState::Unscanned { .. })
    }

    pub fn is_light(&self) -> bool {
        self.state == GearState::Light
    }

    pub fn supports_brightness(&self) -> bool {
        self.supports_brightness
    }

    pub fn min_level(&self) -> u8 {
        self.min_level
    }

    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    pub fn current_level(&self) -> u8 {
        self.current_level
    }

    pub fn previous_active_level(&self) -> u8 {
        self.previous_active_level
    }

    pub fn lamp_failure(&self) -> bool {
        self.lamp_failure
    }

    pub fn scenes(&self) -> &BTreeMap<u8, u8> {
        &self.scenes
    }

    pub fn groups(&self) -> u16 {
        self.groups
    }

    /// Forget the last scan; the gear is scanned again as soon as possible.
    /// Entities already created are kept.
    pub fn rescan(&mut self) {
        self.state = GearState::Unscanned {
            due: Instant::now(),
        };
    }

    /// Scan if unscanned, otherwise poll.
    pub async fn run<C: MqttClient>(&mut self, ctx: &mut BridgeContext<C>) -> Result<(), MqttError> {
        match self.state {
            GearState::Unscanned { .. } => self.scan(ctx).await,
            GearState::Light => self.poll(ctx).await,
            GearState::NotPresent | GearState::NonLight | GearState::Unresolved => Ok(()),
        }
    }

    pub async fn scan<C: MqttClient>(&mut self, ctx: &mut BridgeContext<C>) -> Result<(), MqttError> {
        debug!(address = self.address, "scanning");
        let outcome = match ctx.bus.connect().await {
            Ok(mut conn) => self.scan_with(ctx, conn.as_mut()).await,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(outcome) => {
                ctx.bus_ok().await?;
                self.state = match outcome {
                    ScanOutcome::NotPresent if self.entities.is_some() => {
                        warn!(address = self.address, "light no longer answers, keeping it");
                        self.keep_light(ctx).await?
                    }
                    ScanOutcome::NotPresent => {
                        debug!(address = self.address, "no control gear present");
                        GearState::NotPresent
                    }
                    ScanOutcome::NonLight => GearState::NonLight,
                    ScanOutcome::Unresolved(reason) if self.entities.is_some() => {
                        warn!(address = self.address, "rescan abandoned: {}", reason);
                        self.keep_light(ctx).await?
                    }
                    ScanOutcome::Unresolved(reason) => {
                        warn!(address = self.address, "scan abandoned: {}", reason);
                        GearState::Unresolved
                    }
                    ScanOutcome::Light => {
                        info!(
                            address = self.address,
                            min = self.min_level,
                            max = self.max_level,
                            level = self.current_level,
                            "found light"
                        );
                        self.publish_state(ctx).await?;
                        GearState::Light
                    }
                };
                Ok(())
            }
            Err(BridgeError::Bus(e)) => {
                warn!(address = self.address, "scan failed: {}", e);
                self.state = GearState::Unscanned {
                    due: Instant::now() + self.poll_interval,
                };
                ctx.bus_failed().await
            }
            Err(BridgeError::Mqtt(e)) => Err(e),
        }
    }

    /// An exposed light whose rescan didn't complete goes back to polling
    /// with what it already knows.
    async fn keep_light<C: MqttClient>(
        &mut self,
        ctx: &mut BridgeContext<C>,
    ) -> Result<GearState, MqttError> {
        self.last_update = Instant::now();
        self.publish_state(ctx).await?;
        Ok(GearState::Light)
    }

    async fn scan_with<C: MqttClient>(
        &mut self,
        ctx: &mut BridgeContext<C>,
        conn: &mut dyn Connection,
    ) -> Result<ScanOutcome, BridgeError> {
        let address = Address::Short(self.address);

        if !send(conn, Command::query_control_gear_present(address))
            .await?
            .is_yes()
        {
            return Ok(ScanOutcome::NotPresent);
        }

        let mut report = |p: &Progress| debug!(%address, "{}", p.message);
        let device_types =
            match execute(conn, QueryDeviceTypes::new(address), Some(&mut report)).await {
                Ok(types) => types,
                Err(BusError::Sequence(e)) => {
                    debug!(%address, "could not read device types: {}", e);
                    return Ok(ScanOutcome::Unresolved("device types unreadable"));
                }
                Err(e) => return Err(e.into()),
            };
        debug!(%address, "device types {:?}", device_types);

        if device_types.contains(&DEVICE_TYPE_EMERGENCY) {
            debug!(%address, "is an emergency unit");
            ctx.register_emergency_controls().await?;
            let Some(features) = send(conn, Command::query_emergency_features(address))
                .await?
                .value()
            else {
                return Ok(ScanOutcome::Unresolved("no reply to QueryEmergencyFeatures"));
            };
            if !EmergencyFeatures(features).switched_maintained() {
                debug!(%address, "not switched maintained control gear, skipping");
                return Ok(ScanOutcome::NonLight);
            }
        }

        let Level::Value(physical_minimum) =
            send(conn, Command::query_physical_minimum(address)).await?.level()
        else {
            return Ok(ScanOutcome::Unresolved("no reply to QueryPhysicalMinimum"));
        };
        self.physical_minimum = physical_minimum;

        self.supports_brightness = !(device_types.contains(&DEVICE_TYPE_RELAY)
            || physical_minimum == ON_OFF_PHYSICAL_MINIMUM);
        if let Some(brightness) = self.brightness_override {
            debug!(%address, "brightness support overridden in config");
            self.supports_brightness = brightness;
        }

        let Level::Value(min_level) = send(conn, Command::query_min_level(address)).await?.level()
        else {
            return Ok(ScanOutcome::Unresolved("no reply to QueryMinLevel"));
        };
        let Level::Value(max_level) = send(conn, Command::query_max_level(address)).await?.level()
        else {
            return Ok(ScanOutcome::Unresolved("no reply to QueryMaxLevel"));
        };
        self.min_level = min_level;
        self.max_level = max_level;

        match send(conn, Command::query_actual_level(address)).await?.level() {
            Level::Value(level) => {
                self.current_level = level;
                self.lamp_failure = false;
            }
            Level::Mask => {
                self.lamp_failure = send(conn, Command::query_lamp_failure(address))
                    .await?
                    .is_yes();
                self.current_level = 0;
            }
            Level::Missing => return Ok(ScanOutcome::Unresolved("no reply to QueryActualLevel")),
        }
        self.previous_active_level = if self.current_level == 0 {
            self.max_level
        } else {
            self.current_level
        };

        let mut scenes = BTreeMap::new();
        for scene in 0..SCENE_COUNT {
            match send(conn, Command::query_scene_level(address, scene)).await?.level() {
                Level::Mask => continue,
                Level::Missing => {
                    return Ok(ScanOutcome::Unresolved("no reply to QuerySceneLevel"));
                }
                Level::Value(level) => {
                    scenes.insert(scene, level);
                    ctx.add_scene(scene).await?;
                }
            }
        }
        self.scenes = scenes;

        if ctx.groups_enabled() {
            match execute(conn, QueryGroups::new(address), None).await {
                Ok(groups) => self.groups = groups,
                Err(BusError::Sequence(e)) => {
                    debug!(%address, "could not read groups: {}", e);
                    return Ok(ScanOutcome::Unresolved("group membership unreadable"));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let entities = match self.entities {
            Some(entities) => entities,
            None => {
                let entities = self.create_entities(ctx).await?;
                self.entities = Some(entities);
                entities
            }
        };
        ctx.hass
            .set_state(entities.physical_minimum, physical_minimum.to_string())
            .await?;
        self.last_update = Instant::now();
        Ok(ScanOutcome::Light)
    }

    async fn create_entities<C: MqttClient>(
        &self,
        ctx: &mut BridgeContext<C>,
    ) -> Result<GearEntities, MqttError> {
        let uid = format!("light_{}", self.address);
        let name = format!("{} Light {}", ctx.bus_name, self.address);
        let device = DeviceInfo {
            identifiers: vec![ctx.topics.unique_id(&uid)],
            name: name.clone(),
            manufacturer: super::MANUFACTURER.to_string(),
            model: Some(format!("DALI light @ {}", self.address)),
            hw_version: None,
            sw_version: None,
            via_device: Some(ctx.topics.bus_id().to_string()),
        };

        let light = Entity::new(
            &ctx.topics,
            &uid,
            name,
            Some(device.clone()),
            EntityKind::Light {
                brightness_scale: self.supports_brightness.then_some(self.max_level),
                action: Action::Light(self.address),
            },
        );
        let failure = Entity::new(
            &ctx.topics,
            &format!("{}_failure", uid),
            "Lamp status",
            Some(device.clone()),
            EntityKind::BinarySensor {
                device_class: Some("problem"),
                category: Some(EntityCategory::Diagnostic),
            },
        );
        let physical_minimum = Entity::new(
            &ctx.topics,
            &format!("{}_physical_minimum", uid),
            "Physical minimum level",
            Some(device),
            EntityKind::Sensor {
                device_class: None,
                category: Some(EntityCategory::Diagnostic),
            },
        );

        Ok(GearEntities {
            light: ctx.hass.register_entity(light).await?,
            failure: ctx.hass.register_entity(failure).await?,
            physical_minimum: ctx.hass.register_entity(physical_minimum).await?,
        })
    }

    /// Background refresh of a known light.
    pub async fn poll<C: MqttClient>(&mut self, ctx: &mut BridgeContext<C>) -> Result<(), MqttError> {
        debug!(address = self.address, "polling");
        let outcome = match ctx.bus.connect().await {
            Ok(mut conn) => self.poll_with(conn.as_mut()).await,
            Err(e) => Err(e),
        };
        // A failed poll still waits a full interval before the next one
        self.last_update = Instant::now();
        match outcome {
            Ok(PollOutcome::Level(level)) => {
                ctx.bus_ok().await?;
                self.lamp_failure = false;
                self.set_level(level);
                self.publish_state(ctx).await
            }
            Ok(PollOutcome::LampFailure(failure)) => {
                ctx.bus_ok().await?;
                self.lamp_failure = failure;
                self.publish_state(ctx).await
            }
            Ok(PollOutcome::Missing) => {
                debug!(address = self.address, "no reply to QueryActualLevel");
                ctx.bus_ok().await
            }
            Err(e) => {
                warn!(address = self.address, "poll failed: {}", e);
                ctx.bus_failed().await
            }
        }
    }

    async fn poll_with(&self, conn: &mut dyn Connection) -> Result<PollOutcome, BusError> {
        let address = Address::Short(self.address);
        Ok(match send(conn, Command::query_actual_level(address)).await?.level() {
            Level::Value(level) => PollOutcome::Level(level),
            // The lamp may be preheating or may have failed
            Level::Mask => PollOutcome::LampFailure(
                send(conn, Command::query_lamp_failure(address))
                    .await?
                    .is_yes(),
            ),
            Level::Missing => PollOutcome::Missing,
        })
    }

    /// Apply a light command from Home Assistant.
    pub async fn command<C: MqttClient>(
        &mut self,
        ctx: &mut BridgeContext<C>,
        command: &LightCommand,
    ) -> Result<(), MqttError> {
        if self.entities.is_none() {
            warn!(address = self.address, "command for a light that was never found");
            return Ok(());
        }
        let target = command.target_level(self.previous_active_level);
        let primitive = LevelPrimitive::choose(
            target,
            self.min_level,
            self.max_level,
            command.has_transition(),
        );
        debug!(
            address = self.address,
            target_level = target,
            transition = ?command.transition,
            "using {:?}",
            primitive
        );
        if !ctx.send(primitive.command(Address::Short(self.address))).await? {
            return Ok(());
        }
        self.apply(ctx, primitive).await
    }

    /// Update local state after `primitive` was sent to a group or broadcast
    /// including this gear.
    pub async fn apply<C: MqttClient>(
        &mut self,
        ctx: &mut BridgeContext<C>,
        primitive: LevelPrimitive,
    ) -> Result<(), MqttError> {
        if self.entities.is_none() {
            return Ok(());
        }
        self.set_level(primitive.resulting_level(self.min_level, self.max_level));
        self.last_update = Instant::now();
        self.publish_state(ctx).await
    }

    /// A scene was recalled by broadcast; go to its level without asking.
    pub async fn notify_scene<C: MqttClient>(
        &mut self,
        ctx: &mut BridgeContext<C>,
        scene: u8,
    ) -> Result<(), MqttError> {
        let Some(&level) = self.scenes.get(&scene) else {
            return Ok(());
        };
        self.set_level(level);
        self.last_update = Instant::now();
        self.publish_state(ctx).await
    }

    /// Change the cached level, remembering the last level before switching off.
    fn set_level(&mut self, level: u8) {
        if level == 0 && self.current_level != 0 {
            self.previous_active_level = self.current_level;
        }
        self.current_level = level;
    }

    async fn publish_state<C: MqttClient>(&self, ctx: &mut BridgeContext<C>) -> Result<(), MqttError> {
        let Some(entities) = self.entities else {
            return Ok(());
        };
        let state = LightState::new(self.current_level, self.supports_brightness);
        ctx.hass.set_state(entities.light, state.to_payload()).await?;
        ctx.hass
            .set_state(entities.failure, on_off(self.lamp_failure))
            .await
    }

    #[cfg(test)]
    pub(crate) fn light_entity(&self) -> Option<EntityId> {
        self.entities.map(|e| e.light)
    }
}
