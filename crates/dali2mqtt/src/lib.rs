//! Bridge between a DALI lighting bus and Home Assistant over MQTT.
//!
//! Control gear on the bus are discovered by scanning every short address
//! and exposed as Home Assistant lights, together with scenes and groups.
//! The bridge keeps its view of each light current by polling and turns
//! Home Assistant commands into bus commands.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod dali;
pub mod mqtt;
pub mod scheduler;
