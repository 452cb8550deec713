//! DALI bus command interface: addresses, frames, commands, replies and
//! multi-step sequences. Nothing in here does I/O.

pub mod address;
pub mod command;
pub mod response;
pub mod sequence;

pub use address::Address;
pub use address::AddressError;
pub use command::Command;
pub use command::EmergencyFeatures;
pub use command::ForwardFrame;
pub use response::Level;
pub use response::Reply;
pub use sequence::Instruction;
pub use sequence::Progress;
pub use sequence::Sequence;
pub use sequence::SequenceError;
