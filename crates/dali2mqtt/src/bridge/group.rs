//! A DALI group, exposed as one light standing for all its members.

use tracing::debug;
use tracing::warn;

use super::BridgeContext;
use super::gear::ControlGear;
use super::gear::LevelPrimitive;
use crate::config::GroupMode;
use crate::dali::Address;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttError;
use crate::mqtt::entity::Action;
use crate::mqtt::entity::Entity;
use crate::mqtt::entity::EntityId;
use crate::mqtt::entity::EntityKind;
use crate::mqtt::light::LightCommand;
use crate::mqtt::light::LightState;

#[derive(Debug)]
pub struct Group {
    number: u8,
    /// Short addresses; only ever grows
    members: Vec<u8>,
    min_level: u8,
    max_level: u8,
    supports_brightness: bool,
    previous_active_level: u8,
    entity: Option<EntityId>,
}

impl Group {
    pub fn new(number: u8) -> Self {
        Self {
            number,
            members: Vec::new(),
            min_level: u8::MAX,
            max_level: 0,
            supports_brightness: false,
            previous_active_level: 0,
            entity: None,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn members(&self) -> &[u8] {
        &self.members
    }

    pub fn contains(&self, address: u8) -> bool {
        self.members.contains(&address)
    }

    pub fn min_level(&self) -> u8 {
        self.min_level
    }

    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    pub fn supports_brightness(&self) -> bool {
        self.supports_brightness
    }

    pub fn is_announced(&self) -> bool {
        self.entity.is_some()
    }

    /// Add a scanned light. Joining twice is harmless.
    pub fn join(&mut self, gear: &ControlGear) {
        if self.contains(gear.address()) {
            return;
        }
        debug!(group = self.number, address = gear.address(), "joined group");
        self.members.push(gear.address());
        self.min_level = self.min_level.min(gear.min_level());
        self.max_level = self.max_level.max(gear.max_level());
        self.supports_brightness |= gear.supports_brightness();
        if self.previous_active_level == 0 {
            self.previous_active_level = self.max_level;
        }
    }

    /// Combine member levels as configured.
    pub fn level(&self, mode: GroupMode, gear: &[ControlGear]) -> u8 {
        let levels = self
            .members
            .iter()
            .filter_map(|&a| gear.get(usize::from(a)))
            .map(ControlGear::current_level);
        match mode {
            GroupMode::Off => 0,
            GroupMode::Min => levels.min().unwrap_or(0),
            GroupMode::Max => levels.max().unwrap_or(0),
            GroupMode::Average => {
                let (sum, count) = levels.fold((0u32, 0u32), |(sum, count), level| {
                    (sum + u32::from(level), count + 1)
                });
                if count == 0 {
                    0
                } else {
                    ((sum + count / 2) / count) as u8
                }
            }
        }
    }

    /// Create the group's entity if it doesn't exist yet, then publish its
    /// state.
    pub async fn announce<C: MqttClient>(
        &mut self,
        ctx: &mut BridgeContext<C>,
        gear: &[ControlGear],
    ) -> Result<(), MqttError> {
        if self.entity.is_none() {
            let uid = format!("group_{}", self.number);
            let entity = Entity::new(
                &ctx.topics,
                &uid,
                format!("{} Group {}", ctx.bus_name, self.number),
                Some(ctx.bridge_device.clone()),
                EntityKind::Light {
                    brightness_scale: self.supports_brightness.then_some(self.max_level),
                    action: Action::Group(self.number),
                },
            );
            self.entity = Some(ctx.hass.register_entity(entity).await?);
        }
        self.refresh(ctx, gear).await
    }

    /// Publish the aggregate of member levels.
    pub async fn refresh<C: MqttClient>(
        &self,
        ctx: &mut BridgeContext<C>,
        gear: &[ControlGear],
    ) -> Result<(), MqttError> {
        let Some(entity) = self.entity else {
            return Ok(());
        };
        let state = LightState::new(self.level(ctx.group_mode, gear), self.supports_brightness);
        ctx.hass.set_state(entity, state.to_payload()).await
    }

    /// Send one group-addressed command, then bring members' cached levels
    /// in line with what it does to each of them.
    pub async fn command<C: MqttClient>(
        &mut self,
        ctx: &mut BridgeContext<C>,
        gear: &mut [ControlGear],
        command: &LightCommand,
    ) -> Result<(), MqttError> {
        if self.members.is_empty() {
            warn!(group = self.number, "command for an empty group");
            return Ok(());
        }
        let target = command.target_level(self.previous_active_level);
        if target == 0 {
            let level = self.level(ctx.group_mode, gear);
            if level != 0 {
                self.previous_active_level = level;
            }
        }
        let primitive = LevelPrimitive::choose(
            target,
            self.min_level,
            self.max_level,
            command.has_transition(),
        );
        debug!(group = self.number, target_level = target, "using {:?}", primitive);
        if !ctx.send(primitive.command(Address::Group(self.number))).await? {
            return Ok(());
        }
        for &address in &self.members {
            if let Some(member) = gear.get_mut(usize::from(address)) {
                member.apply(ctx, primitive).await?;
            }
        }
        self.refresh(ctx, gear).await
    }
}
