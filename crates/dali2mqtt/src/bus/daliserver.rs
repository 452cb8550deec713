//! Driver for [daliserver](https://github.com/onitake/daliserver).
//!
//! Each request is four bytes, `[version, 0, address, opcode]`; each response
//! is four bytes, `[version, status, value, pad]`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::BusError;
use super::Connection;
use super::Driver;
use crate::dali::Command;
use crate::dali::ForwardFrame;
use crate::dali::Reply;

pub const PROTOCOL_VERSION: u8 = 2;

pub const DEFAULT_PORT: u16 = 55825;

const STATUS_NO_ANSWER: u8 = 0;
const STATUS_ANSWER: u8 = 1;
/// Several gear answered and the gateway saw a garbled frame.
const STATUS_COLLISION: u8 = 255;

/// Encode a forward frame as a daliserver request.
pub fn encode_request(frame: ForwardFrame) -> Result<[u8; 4], BusError> {
    if frame.bits() != 16 {
        return Err(BusError::UnsupportedFrame(frame.bits()));
    }
    let [address, opcode] = (frame.data() as u16).to_be_bytes();
    Ok([PROTOCOL_VERSION, 0, address, opcode])
}

/// Interpret a daliserver response.
///
/// A collision is reported as status 255; it still means somebody answered,
/// so it becomes a backward frame of 255 rather than an error.
pub fn decode_response(response: [u8; 4]) -> Result<Reply, BusError> {
    let [_version, status, value, _pad] = response;
    match status {
        STATUS_NO_ANSWER => Ok(Reply::NoAnswer),
        STATUS_ANSWER => Ok(Reply::Frame(value)),
        STATUS_COLLISION => Ok(Reply::Frame(0xff)),
        other => Err(BusError::Status(other)),
    }
}

#[derive(Debug, Clone)]
pub struct DaliServer {
    hostname: String,
    port: u16,
    timeout: Duration,
}

impl DaliServer {
    pub fn new(hostname: String, port: u16, timeout: Duration) -> Self {
        Self {
            hostname,
            port,
            timeout,
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

#[async_trait]
impl Driver for DaliServer {
    async fn connect(&self) -> Result<Box<dyn Connection>, BusError> {
        let target = self.target();
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| BusError::Timeout(self.timeout))?
            .map_err(|e| BusError::Connect(target.clone(), e))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(DaliServerConnection {
            stream,
            timeout: self.timeout,
        }))
    }
}

pub struct DaliServerConnection {
    stream: TcpStream,
    timeout: Duration,
}

impl DaliServerConnection {
    async fn transmit(&mut self, request: &[u8; 4]) -> Result<[u8; 4], BusError> {
        self.stream.write_all(request).await?;
        let mut response = [0u8; 4];
        tokio::time::timeout(self.timeout, self.stream.read_exact(&mut response))
            .await
            .map_err(|_| BusError::Timeout(self.timeout))??;
        Ok(response)
    }

    async fn send_frame(&mut self, command: &Command) -> Result<Reply, BusError> {
        let request = encode_request(command.frame())?;
        let mut response = self.transmit(&request).await?;
        if command.send_twice() {
            response = self.transmit(&request).await?;
        }
        decode_response(response)
    }
}

#[async_trait]
impl Connection for DaliServerConnection {
    async fn exchange(&mut self, command: &Command) -> Result<Reply, BusError> {
        if command.device_type() != 0 {
            let enable = Command::enable_device_type(command.device_type());
            debug!("{} before {}", enable, command.name());
            self.send_frame(&enable).await?;
        }
        self.send_frame(command).await
    }
}
