//! Gateway and BusinessWorker settings.
//!
//! Every struct deserializes from its own TOML section with `#[serde(default)]`,
//! so a configuration file only needs the keys it wants to change.

use crate::error::{GatewayError, Result};
use gateway_event_loop::Backend;
use gateway_protocol::{FrameProbe, LengthPrefixed, LineDelimited, Unframed, DEFAULT_MAX_BODY};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

/// Default read bound for persistent connections with a header-based framing,
/// before the probe has seen anything.
pub const PERSISTENT_PREREAD: usize = 4;

/// Default read bound for request/response connections.
pub const ONE_SHOT_PREREAD: usize = 65535;

/// Client-facing transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

/// How client byte streams are cut into frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Whatever one read returns is a frame.
    Raw,
    /// 4-byte big-endian length, then the body.
    LengthPrefixed,
    /// Frames end at `\n`.
    #[default]
    Line,
}

/// Settings of one Gateway process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Client-facing address, "IP:PORT".
    pub listen: String,
    pub transport: Transport,
    pub framing: Framing,
    /// Address workers use to reach this Gateway.
    pub lan_ip: String,
    /// Lan port; `0` lets the OS pick one.
    pub lan_port: u16,
    /// Keep client connections open after a frame.
    pub persistent_connection: bool,
    /// Initial read bound; `0` selects the mode's default.
    pub preread_length: usize,
    /// Upper bound on declared body lengths (client frames and envelopes).
    pub max_body: usize,
    /// Heartbeat period in seconds; `0` disables it.
    pub ping_interval: u64,
    /// Heartbeat payload, or a path to a file holding it.
    pub ping_data: String,
    /// Drain after this many accepted requests; `0` is unlimited.
    pub max_requests: u64,
    pub send_timeout_ms: u64,
    pub drain_grace_ms: u64,
    /// Answer a malformed frame with `packet_err:<bytes>` before closing.
    pub reply_packet_err: bool,
    pub backend: Backend,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8480".to_string(),
            transport: Transport::Tcp,
            framing: Framing::Line,
            lan_ip: "127.0.0.1".to_string(),
            lan_port: 0,
            persistent_connection: true,
            preread_length: 0,
            max_body: DEFAULT_MAX_BODY,
            ping_interval: 0,
            ping_data: String::new(),
            max_requests: 0,
            send_timeout_ms: 500,
            drain_grace_ms: 3000,
            reply_packet_err: false,
            backend: Backend::Poll,
        }
    }
}

impl GatewayConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| GatewayError::Config(format!("listen address '{}': {e}", self.listen)))
    }

    pub fn lan_addr(&self) -> Result<SocketAddrV4> {
        let ip: Ipv4Addr = self
            .lan_ip
            .parse()
            .map_err(|e| GatewayError::Config(format!("lan_ip '{}': {e}", self.lan_ip)))?;
        Ok(SocketAddrV4::new(ip, self.lan_port))
    }

    /// Read bound before the probe has seen any bytes.
    ///
    /// Raw framing treats every read as a frame, so its default read is a full
    /// chunk rather than a header's worth.
    pub fn preread(&self) -> usize {
        match (self.preread_length, self.framing, self.persistent_connection) {
            (0, Framing::Raw, _) | (0, _, false) => ONE_SHOT_PREREAD,
            (0, _, true) => PERSISTENT_PREREAD,
            (n, _, _) => n,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Builds the probe for client traffic.
    pub fn client_probe(&self) -> Box<dyn FrameProbe> {
        match self.framing {
            Framing::Raw => Box::new(Unframed),
            Framing::LengthPrefixed => Box::new(LengthPrefixed::new(self.max_body)),
            Framing::Line => Box::new(LineDelimited::new(self.max_body)),
        }
    }

    /// Rejects settings the Gateway cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        self.lan_addr()?;
        if self.max_body == 0 {
            return Err(GatewayError::Config("max_body must be greater than zero".into()));
        }
        if self.ping_interval > 0 && self.ping_data.is_empty() {
            return Err(GatewayError::Config("ping_interval is set but ping_data is empty".into()));
        }
        Ok(())
    }
}

/// Settings of one BusinessWorker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// How often the Gateway address list is re-read.
    pub refresh_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub max_body: usize,
    pub backend: Backend,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 1000,
            connect_timeout_ms: 1000,
            send_timeout_ms: 500,
            max_body: DEFAULT_MAX_BODY,
            backend: Backend::Poll,
        }
    }
}

impl WorkerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }
}

/// Which [`crate::store::Store`] backs the address registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// In-process only; Gateway and workers must share one process.
    Memory,
    /// Files in a shared directory, guarded by a lock file.
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub kind: StoreKind,
    pub directory: PathBuf,
    pub lock_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::File,
            directory: PathBuf::from("run/registry"),
            lock_timeout_ms: 2000,
        }
    }
}

impl RegistryConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_defaults() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lan_addr().unwrap().port(), 0);
        assert_eq!(config.preread(), PERSISTENT_PREREAD);
        assert_eq!(config.send_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_preread_follows_connection_mode() {
        let mut config = GatewayConfig {
            persistent_connection: false,
            ..Default::default()
        };
        assert_eq!(config.preread(), ONE_SHOT_PREREAD);
        config.preread_length = 25;
        assert_eq!(config.preread(), 25);
    }

    #[test]
    fn test_raw_framing_reads_whole_chunks() {
        let mut config = GatewayConfig {
            framing: Framing::Raw,
            ..Default::default()
        };
        assert!(config.persistent_connection);
        assert_eq!(config.preread(), ONE_SHOT_PREREAD);

        config.framing = Framing::LengthPrefixed;
        assert_eq!(config.preread(), PERSISTENT_PREREAD);
    }

    #[test]
    fn test_validation_rejects_bad_addresses() {
        let config = GatewayConfig {
            listen: "not-an-address".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));

        let config = GatewayConfig {
            lan_ip: "::1".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_requires_data() {
        let config = GatewayConfig {
            ping_interval: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_section() {
        let config: GatewayConfig = toml::from_str(
            r#"
listen = "0.0.0.0:9000"
transport = "udp"
framing = "length_prefixed"
backend = "task"
"#,
        )
        .unwrap();
        assert_eq!(config.transport, Transport::Udp);
        assert_eq!(config.framing, Framing::LengthPrefixed);
        assert_eq!(config.backend, Backend::Task);
        assert_eq!(config.lan_ip, "127.0.0.1");
    }
}
