//! An in-memory DALI bus for tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;

use super::BusError;
use super::Connection;
use super::Driver;
use crate::dali::Command;
use crate::dali::Reply;

/// A simulated control gear. Levels of 255 read back as MASK.
#[derive(Debug, Clone)]
pub struct SimGear {
    pub device_types: Vec<u8>,
    pub emergency_features: u8,
    pub physical_minimum: u8,
    pub min_level: u8,
    pub max_level: u8,
    pub actual_level: u8,
    pub lamp_failure: bool,
    pub scenes: [u8; 16],
    pub groups: u16,
    /// Query opcodes this gear ignores.
    pub silent: Vec<u8>,
}

impl Default for SimGear {
    fn default() -> Self {
        Self {
            device_types: vec![6],
            emergency_features: 0,
            physical_minimum: 1,
            min_level: 1,
            max_level: 254,
            actual_level: 0,
            lamp_failure: false,
            scenes: [0xff; 16],
            groups: 0,
            silent: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    gear: BTreeMap<u8, SimGear>,
    sent: Vec<Command>,
    next_device_type: BTreeMap<u8, usize>,
    offline: bool,
    connections: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gear(self, address: u8, gear: SimGear) -> Self {
        self.state.lock().unwrap().gear.insert(address, gear);
        self
    }

    pub fn gear(&self, address: u8) -> Option<SimGear> {
        self.state.lock().unwrap().gear.get(&address).cloned()
    }

    pub fn update(&self, address: u8, f: impl FnOnce(&mut SimGear)) {
        if let Some(gear) = self.state.lock().unwrap().gear.get_mut(&address) {
            f(gear);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Names of every command sent so far, in order.
    pub fn sent(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().sent.iter().map(Command::name).collect()
    }

    pub fn sent_commands(&self) -> Vec<Command> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }
}

#[async_trait]
impl Driver for SimulatedBus {
    async fn connect(&self) -> Result<Box<dyn Connection>, BusError> {
        let mut state = self.state.lock().unwrap();
        if state.offline {
            return Err(BusError::Connect(
                "simulated".to_string(),
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ));
        }
        state.connections += 1;
        Ok(Box::new(SimConnection {
            state: self.state.clone(),
        }))
    }
}

struct SimConnection {
    state: Arc<Mutex<SimState>>,
}

fn yes(answer: bool) -> Reply {
    if answer {
        Reply::Frame(0xff)
    } else {
        Reply::NoAnswer
    }
}

impl SimState {
    fn targets(&self, address_byte: u8) -> Vec<u8> {
        match address_byte {
            0x00..=0x7f => vec![address_byte >> 1],
            0x80..=0x9f => {
                let group = (address_byte >> 1) & 0x0f;
                self.gear
                    .iter()
                    .filter(|(_, g)| g.groups & (1 << group) != 0)
                    .map(|(a, _)| *a)
                    .collect()
            }
            _ => self.gear.keys().copied().collect(),
        }
    }

    fn apply(&mut self, address_byte: u8, opcode: u8) {
        let arc_power = address_byte & 0x01 == 0;
        for address in self.targets(address_byte) {
            let Some(gear) = self.gear.get_mut(&address) else {
                continue;
            };
            let level = match (arc_power, opcode) {
                (true, 0) => Some(0),
                (true, level) => Some(level.clamp(gear.min_level, gear.max_level)),
                (false, 0x00) => Some(0),
                (false, 0x05) => Some(gear.max_level),
                (false, 0x06) => Some(gear.min_level),
                (false, 0x10..=0x1f) => Some(gear.scenes[usize::from(opcode & 0x0f)])
                    .filter(|&l| l != 0xff),
                _ => None,
            };
            if let Some(level) = level {
                gear.actual_level = level;
            }
        }
    }

    fn query(&mut self, address: u8, opcode: u8) -> Reply {
        let Some(gear) = self.gear.get(&address) else {
            return Reply::NoAnswer;
        };
        if gear.silent.contains(&opcode) {
            return Reply::NoAnswer;
        }
        match opcode {
            0x91 => yes(true),
            0x92 => yes(gear.lamp_failure),
            0x99 => {
                self.next_device_type.insert(address, 0);
                match gear.device_types.as_slice() {
                    [] => Reply::Frame(254),
                    [dt] => Reply::Frame(*dt),
                    _ => Reply::Frame(255),
                }
            }
            0xa7 => {
                let cursor = self.next_device_type.entry(address).or_default();
                let reply = gear.device_types.get(*cursor).copied().unwrap_or(254);
                *cursor += 1;
                Reply::Frame(reply)
            }
            0x9a => Reply::Frame(gear.physical_minimum),
            0xa0 => Reply::Frame(gear.actual_level),
            0xa1 => Reply::Frame(gear.max_level),
            0xa2 => Reply::Frame(gear.min_level),
            0xb0..=0xbf => Reply::Frame(gear.scenes[usize::from(opcode & 0x0f)]),
            0xc0 => Reply::Frame(gear.groups.to_be_bytes()[1]),
            0xc1 => Reply::Frame(gear.groups.to_be_bytes()[0]),
            0xfb => Reply::Frame(gear.emergency_features),
            _ => Reply::NoAnswer,
        }
    }
}

#[async_trait]
impl Connection for SimConnection {
    async fn exchange(&mut self, command: &Command) -> Result<Reply, BusError> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(command.clone());

        let [address_byte, opcode] = (command.frame().data() as u16).to_be_bytes();
        if address_byte == 0xc1 {
            return Ok(Reply::NoAnswer);
        }
        if address_byte & 0x01 == 1 && opcode >= 0x90 && address_byte < 0x80 {
            return Ok(state.query(address_byte >> 1, opcode));
        }
        state.apply(address_byte, opcode);
        Ok(Reply::NoAnswer)
    }
}
