/*!
 * In-process channel emulating a line-oriented device.
 *
 * Every command is answered with `OK:<command>` unless the channel is
 * configured `silent`. Config keys:
 *
 * * `fail_connect` - connecting fails and leaves the channel in `Error`
 * * `silent` - commands are accepted but never answered
 * * `latency_ms` - delay applied to connect and to every response
 */
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use orchestra_core::types::{Params, Value};

use crate::channel::{
    ensure_connected, frame_command, Channel, ChannelError, ChannelSettings, ChannelState,
    ProtocolVersion, Result,
};

/// Shared log of the envelopes a [`SimulatedChannel`] has sent
pub type Transcript = Arc<Mutex<Vec<String>>>;

/// Emulated channel
#[derive(Debug)]
pub struct SimulatedChannel {
    config: Params,
    state: ChannelState,
    protocol_version: ProtocolVersion,
    timeout: Duration,
    latency: Duration,
    fail_connect: bool,
    silent: bool,
    pending: VecDeque<String>,
    transcript: Transcript,
}

impl SimulatedChannel {
    /// Build a simulated channel from its config bag
    pub fn new(config: Params) -> Result<Self> {
        let settings = ChannelSettings::from_config(&config)?;
        let flag = |key: &str| -> Result<bool> {
            match config.get(key) {
                None | Some(Value::Null) => Ok(false),
                Some(v) => v
                    .as_bool()
                    .ok_or_else(|| {
                        ChannelError::invalid_config(format!("'{}' must be a boolean", key))
                    }),
            }
        };
        let fail_connect = flag("fail_connect")?;
        let silent = flag("silent")?;
        let latency = match config.get("latency_ms") {
            None | Some(Value::Null) => Duration::ZERO,
            Some(v) => v
                .as_integer()
                .filter(|ms| *ms >= 0)
                .map(|ms| Duration::from_millis(ms as u64))
                .ok_or_else(|| {
                    ChannelError::invalid_config("'latency_ms' must be a non-negative integer")
                })?,
        };

        Ok(Self {
            config,
            state: ChannelState::Disconnected,
            protocol_version: settings.protocol_version,
            timeout: settings.timeout,
            latency,
            fail_connect,
            silent,
            pending: VecDeque::new(),
            transcript: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Record sent envelopes into `transcript` instead of a private log
    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = transcript;
        self
    }

    /// Handle on the sent-envelope log
    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Channel for SimulatedChannel {
    fn channel_type(&self) -> &str {
        "simulated"
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
        self.simulate_latency().await;

        if self.fail_connect {
            self.state = ChannelState::Error;
            warn!("simulated channel refused connection");
            return Err(ChannelError::connection("simulated connection failure"));
        }

        self.state = ChannelState::Connected;
        info!(protocol_version = %self.protocol_version, "simulated channel connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.state != ChannelState::Disconnected {
            debug!("simulated channel disconnected");
        }
        self.pending.clear();
        self.state = ChannelState::Disconnected;
        Ok(())
    }

    async fn send(&mut self, command: &str, args: &Params) -> Result<()> {
        ensure_connected(&*self)?;
        let envelope = frame_command(self.protocol_version, command, args);
        debug!(envelope = %envelope.trim_end(), "simulated send");
        self.transcript.lock().push(envelope);
        if !self.silent {
            self.pending.push_back(format!("OK:{}", command));
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<String> {
        ensure_connected(&*self)?;
        match self.pending.pop_front() {
            Some(reply) => {
                self.simulate_latency().await;
                Ok(reply)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Err(ChannelError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn config(pairs: &[(&str, Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_connect_transitions() {
        let mut channel = SimulatedChannel::new(Params::new()).unwrap();
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert_ok!(channel.connect().await);
        assert_eq!(channel.state(), ChannelState::Connected);
        assert_ok!(channel.disconnect().await);
        assert_ok!(channel.disconnect().await);
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_enters_error_state() {
        let mut channel =
            SimulatedChannel::new(config(&[("fail_connect", Value::from(true))])).unwrap();
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Connection(_)));
        assert_eq!(channel.state(), ChannelState::Error);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut channel = SimulatedChannel::new(Params::new()).unwrap();
        let transcript = channel.transcript();

        assert!(matches!(
            channel.send("HOME", &Params::new()).await,
            Err(ChannelError::Connection(_))
        ));
        assert!(matches!(channel.receive(SHORT).await, Err(ChannelError::Connection(_))));
        assert!(transcript.lock().is_empty());
    }

    #[tokio::test]
    async fn test_envelope_uses_current_protocol_version() {
        let mut channel =
            SimulatedChannel::new(config(&[("protocol_version", Value::from("2.0"))])).unwrap();
        channel.connect().await.unwrap();

        channel.send("HOME", &Params::new()).await.unwrap();
        channel.set_protocol_version(ProtocolVersion::V3);
        channel
            .send("MOVE", &config(&[("steps", Value::from(5))]))
            .await
            .unwrap();

        let sent = channel.transcript().lock().clone();
        assert!(sent[0].starts_with("2.0:HOME"));
        assert_eq!(sent[1], "3.0:MOVE steps=5\n");
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let mut channel = SimulatedChannel::new(Params::new()).unwrap();
        channel.connect().await.unwrap();
        let reply = channel.request("INIT", &Params::new(), SHORT).await.unwrap();
        assert_eq!(reply, "OK:INIT");
    }

    #[tokio::test]
    async fn test_silent_channel_times_out() {
        let mut channel = SimulatedChannel::new(config(&[("silent", Value::from(true))])).unwrap();
        channel.connect().await.unwrap();
        channel.send("ping", &Params::new()).await.unwrap();

        assert!(matches!(
            channel.receive(SHORT).await,
            Err(ChannelError::Timeout(t)) if t == SHORT
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(SimulatedChannel::new(config(&[("silent", Value::from("yes"))])).is_err());
        assert!(SimulatedChannel::new(config(&[("latency_ms", Value::from(-5))])).is_err());
        assert!(matches!(
            SimulatedChannel::new(config(&[("protocol_version", Value::from("9"))])),
            Err(ChannelError::UnsupportedProtocol(_))
        ));
    }
}
