//! Access to the DALI bus through a gateway.
//!
//! A [`Driver`] opens one [`Connection`] per transaction. The connection is
//! closed when it is dropped, so every exit path from a transaction scope
//! releases it.

pub mod daliserver;
mod engine;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
pub use daliserver::DaliServer;
pub use engine::execute;
pub use engine::send;

use crate::config::BusConfig;
use crate::dali::Command;
use crate::dali::Reply;
use crate::dali::SequenceError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to bus gateway {0}: {1}")]
    Connect(String, #[source] std::io::Error),

    #[error("bus gateway I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus gateway did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("unsupported {0}-bit frame")]
    UnsupportedFrame(u8),

    #[error("bus gateway reported status {0}")]
    Status(u8),

    #[error("sequence failed: {0}")]
    Sequence(#[from] SequenceError),
}

/// One open transaction scope on the bus.
#[async_trait]
pub trait Connection: Send {
    /// Send one command and return the gateway's interpretation of the reply.
    async fn exchange(&mut self, command: &Command) -> Result<Reply, BusError>;
}

/// A way of reaching the bus.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, BusError>;
}

/// Build the driver selected in configuration.
pub fn from_config(config: &BusConfig) -> Box<dyn Driver> {
    match config {
        BusConfig::Daliserver { hostname, port, .. } => {
            Box::new(DaliServer::new(hostname.clone(), *port, config.timeout()))
        }
    }
}
