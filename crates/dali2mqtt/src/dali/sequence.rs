//! Multi-step bus interactions.
//!
//! A [`Sequence`] is a resumable state machine. Each call to
//! [`Sequence::step`] hands it the reply to the previous [`Instruction::Send`]
//! (or `None`) and gets back the next instruction. The bus engine relays the
//! instructions until the sequence yields [`Instruction::Done`].

use std::time::Duration;

use super::address::Address;
use super::command::Command;
use super::response::Reply;

/// Mid-sequence status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub message: String,
    pub completed: Option<u32>,
    pub size: Option<u32>,
}

impl Progress {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            completed: None,
            size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction<T> {
    Send(Command),
    Sleep(Duration),
    Progress(Progress),
    Done(T),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("no response to {0}")]
    NoResponse(&'static str),

    #[error("device type {0} reported out of order")]
    OutOfOrder(u8),

    #[error("device reported multiple device types but listed none")]
    NoDeviceTypes,

    #[error("sequence resumed after completion")]
    Finished,
}

pub trait Sequence {
    type Output;

    fn step(&mut self, reply: Option<Reply>) -> Result<Instruction<Self::Output>, SequenceError>;
}

/// A lone command, treated as a one-step sequence whose result is its reply.
#[derive(Debug)]
pub struct Single {
    command: Option<Command>,
}

impl Single {
    pub fn new(command: Command) -> Self {
        Self {
            command: Some(command),
        }
    }
}

impl Sequence for Single {
    type Output = Reply;

    fn step(&mut self, reply: Option<Reply>) -> Result<Instruction<Reply>, SequenceError> {
        if let Some(command) = self.command.take() {
            return Ok(Instruction::Send(command));
        }
        reply.map(Instruction::Done).ok_or(SequenceError::Finished)
    }
}

/// QueryDeviceType reply meaning "no device types beyond part 102".
const DEVICE_TYPE_NONE: u8 = 254;

/// QueryDeviceType reply meaning "several; enumerate them".
const DEVICE_TYPE_MULTIPLE: u8 = 255;

#[derive(Debug)]
enum DeviceTypesState {
    Start,
    AwaitingFirst,
    Enumerating,
}

/// Find every device type a control gear implements.
#[derive(Debug)]
pub struct QueryDeviceTypes {
    address: Address,
    state: DeviceTypesState,
    found: Vec<u8>,
}

impl QueryDeviceTypes {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            state: DeviceTypesState::Start,
            found: Vec::new(),
        }
    }

    fn next(&mut self) -> Instruction<Vec<u8>> {
        self.state = DeviceTypesState::Enumerating;
        Instruction::Send(Command::query_next_device_type(self.address))
    }
}

impl Sequence for QueryDeviceTypes {
    type Output = Vec<u8>;

    fn step(&mut self, reply: Option<Reply>) -> Result<Instruction<Vec<u8>>, SequenceError> {
        match self.state {
            DeviceTypesState::Start => {
                self.state = DeviceTypesState::AwaitingFirst;
                Ok(Instruction::Send(Command::query_device_type(self.address)))
            }
            DeviceTypesState::AwaitingFirst => {
                match reply.and_then(Reply::value) {
                    None => Err(SequenceError::NoResponse("QueryDeviceType")),
                    Some(DEVICE_TYPE_NONE) => Ok(Instruction::Done(Vec::new())),
                    Some(DEVICE_TYPE_MULTIPLE) => Ok(self.next()),
                    Some(dt) => Ok(Instruction::Done(vec![dt])),
                }
            }
            DeviceTypesState::Enumerating => {
                let Some(dt) = reply.and_then(Reply::value) else {
                    // Resumed after a Progress report; carry on enumerating.
                    if reply.is_none() {
                        return Ok(self.next());
                    }
                    return Err(SequenceError::NoResponse("QueryNextDeviceType"));
                };
                if dt == DEVICE_TYPE_NONE {
                    if self.found.is_empty() {
                        return Err(SequenceError::NoDeviceTypes);
                    }
                    return Ok(Instruction::Done(std::mem::take(&mut self.found)));
                }
                if self.found.last().is_some_and(|&last| dt <= last) {
                    return Err(SequenceError::OutOfOrder(dt));
                }
                self.found.push(dt);
                Ok(Instruction::Progress(Progress::message(format!(
                    "{} implements device type {}",
                    self.address, dt
                ))))
            }
        }
    }
}

/// Read the 16-bit group membership mask of a control gear.
#[derive(Debug)]
pub struct QueryGroups {
    address: Address,
    sent: u8,
    low: u8,
}

impl QueryGroups {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            sent: 0,
            low: 0,
        }
    }
}

impl Sequence for QueryGroups {
    type Output = u16;

    fn step(&mut self, reply: Option<Reply>) -> Result<Instruction<u16>, SequenceError> {
        self.sent += 1;
        match self.sent {
            1 => Ok(Instruction::Send(Command::query_groups_zero_to_seven(
                self.address,
            ))),
            2 => {
                self.low = reply
                    .and_then(Reply::value)
                    .ok_or(SequenceError::NoResponse("QueryGroupsZeroToSeven"))?;
                Ok(Instruction::Send(Command::query_groups_eight_to_fifteen(
                    self.address,
                )))
            }
            3 => {
                let high = reply
                    .and_then(Reply::value)
                    .ok_or(SequenceError::NoResponse("QueryGroupsEightToFifteen"))?;
                Ok(Instruction::Done(u16::from_be_bytes([high, self.low])))
            }
            _ => Err(SequenceError::Finished),
        }
    }
}
