/*!
 * Line-oriented channel over TCP.
 *
 * Suited to serial-to-network bridges and to device simulators listening
 * on a socket. Config key `address` (`host:port`) is required.
 */
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use orchestra_core::types::Params;

use crate::channel::{
    ensure_connected, frame_command, Channel, ChannelError, ChannelSettings, ChannelState,
    ProtocolVersion, Result,
};

/// TCP channel
#[derive(Debug)]
pub struct TcpChannel {
    config: Params,
    address: String,
    state: ChannelState,
    protocol_version: ProtocolVersion,
    timeout: Duration,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    // Bytes of a reply line that a timed out receive left behind
    pending: Vec<u8>,
}

impl TcpChannel {
    /// Build a TCP channel from its config bag
    pub fn new(config: Params) -> Result<Self> {
        let settings = ChannelSettings::from_config(&config)?;
        let address = config
            .get("address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::invalid_config("tcp channel needs an 'address' string"))?
            .to_string();

        Ok(Self {
            config,
            address,
            state: ChannelState::Disconnected,
            protocol_version: settings.protocol_version,
            timeout: settings.timeout,
            reader: None,
            writer: None,
            pending: Vec::new(),
        })
    }

    /// Remote address
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn channel_type(&self) -> &str {
        "tcp"
    }

    fn config(&self) -> &Params {
        &self.config
    }

    fn state(&self) -> ChannelState {
        self.state
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn connect(&mut self) -> Result<()> {
        if self.state == ChannelState::Connected {
            return Ok(());
        }
        self.state = ChannelState::Connecting;
        debug!(address = %self.address, "connecting");

        let connect = TcpStream::connect(&self.address);
        let stream = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state = ChannelState::Error;
                error!(address = %self.address, error = %e, "connection failed");
                return Err(ChannelError::connection(format!(
                    "Failed to connect to {}: {}",
                    self.address, e
                )));
            }
            Err(_) => {
                self.state = ChannelState::Error;
                error!(address = %self.address, "connection timed out");
                return Err(ChannelError::connection(format!(
                    "Connecting to {} timed out after {:?}",
                    self.address, self.timeout
                )));
            }
        };

        let (read_half, write_half) = stream.into_split();
        self.reader = Some(BufReader::new(read_half));
        self.writer = Some(write_half);
        self.pending.clear();
        self.state = ChannelState::Connected;
        info!(
            address = %self.address,
            protocol_version = %self.protocol_version,
            "tcp channel connected"
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(address = %self.address, error = %e, "shutdown on disconnect failed");
            }
            info!(address = %self.address, "tcp channel disconnected");
        }
        self.reader = None;
        self.pending.clear();
        self.state = ChannelState::Disconnected;
        Ok(())
    }

    async fn send(&mut self, command: &str, args: &Params) -> Result<()> {
        ensure_connected(&*self)?;
        let envelope = frame_command(self.protocol_version, command, args);
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ChannelError::connection("tcp channel has no writer"))?;
        writer.write_all(envelope.as_bytes()).await?;
        writer.flush().await?;
        debug!(envelope = %envelope.trim_end(), "tcp send");
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<String> {
        ensure_connected(&*self)?;
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ChannelError::connection("tcp channel has no reader"))?;

        // read_until is cancel safe: bytes read before a timeout stay in `pending`.
        match tokio::time::timeout(timeout, reader.read_until(b'\n', &mut self.pending)).await {
            Err(_) => Err(ChannelError::Timeout(timeout)),
            Ok(Err(e)) => Err(ChannelError::Io(e)),
            Ok(Ok(0)) => Err(ChannelError::Closed),
            Ok(Ok(_)) => {
                let line = std::mem::take(&mut self.pending);
                Ok(String::from_utf8_lossy(&line)
                    .trim_end_matches(&['\r', '\n'][..])
                    .to_string())
            }
        }
    }
}
