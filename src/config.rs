//! Channel, strap and read-pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

const DEFAULT_BUF_SIZE: usize = 10 * 1024;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_READ_FAILURES: u32 = 3;
const DEFAULT_MAX_CHANNELS: usize = 1024;

/// Per-channel tunables. Immutable once a channel is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Size of the buffer handed to each transport read.
    pub read_buf_size: usize,
    /// Size hint for transport write buffering.
    pub write_buf_size: usize,
    /// Deadline applied to a single transport read.
    pub read_timeout: Duration,
    /// Deadline applied to a single transport write.
    pub write_timeout: Duration,
    /// Consecutive read failures tolerated before the channel is
    /// force-closed. WebSocket channels ignore this and close on the
    /// first read error.
    pub max_read_failures: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            read_buf_size: DEFAULT_BUF_SIZE,
            write_buf_size: DEFAULT_BUF_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_read_failures: DEFAULT_MAX_READ_FAILURES,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.read_buf_size == 0 {
            return Err(ChannelError::config("read_buf_size", "must be positive"));
        }
        if self.write_buf_size == 0 {
            return Err(ChannelError::config("write_buf_size", "must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(ChannelError::config("read_timeout", "must be positive"));
        }
        if self.write_timeout.is_zero() {
            return Err(ChannelError::config("write_timeout", "must be positive"));
        }
        if self.max_read_failures == 0 {
            return Err(ChannelError::config("max_read_failures", "must be positive"));
        }
        Ok(())
    }
}

/// Sizing for the shared read pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadPoolConf {
    /// Number of long-lived worker tasks. One worker gives strict
    /// per-channel dispatch order.
    pub max_workers: usize,
    /// Queue capacity; producers block while the queue is full.
    pub max_queue: usize,
}

impl Default for ReadPoolConf {
    fn default() -> Self {
        ReadPoolConf {
            max_workers: 8,
            max_queue: 1024,
        }
    }
}

impl ReadPoolConf {
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.max_workers == 0 {
            return Err(ChannelError::config("max_workers", "must be positive"));
        }
        if self.max_queue == 0 {
            return Err(ChannelError::config("max_queue", "must be positive"));
        }
        Ok(())
    }
}

/// Server strap configuration: bind address, capacity, and an optional
/// channel-config override for the channels it accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConf {
    pub addr: String,
    pub max_channels: usize,
    pub channel: Option<ChannelConfig>,
}

impl ServerConf {
    pub fn new(addr: impl Into<String>) -> Self {
        ServerConf {
            addr: addr.into(),
            max_channels: DEFAULT_MAX_CHANNELS,
            channel: None,
        }
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    pub fn with_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.addr.is_empty() {
            return Err(ChannelError::config("addr", "must not be empty"));
        }
        if self.max_channels == 0 {
            return Err(ChannelError::config("max_channels", "must be positive"));
        }
        if let Some(channel) = &self.channel {
            channel.validate()?;
        }
        Ok(())
    }
}

/// Client strap configuration: the target address, an optional request
/// path (WebSocket dials), and an optional channel-config override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConf {
    pub addr: String,
    pub path: String,
    pub channel: Option<ChannelConfig>,
}

impl ClientConf {
    pub fn new(addr: impl Into<String>) -> Self {
        ClientConf {
            addr: addr.into(),
            path: "/".to_string(),
            channel: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_channel_config(mut self, channel: ChannelConfig) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.addr.is_empty() {
            return Err(ChannelError::config("addr", "must not be empty"));
        }
        if let Some(channel) = &self.channel {
            channel.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ChannelConfig::default().validate().unwrap();
        ReadPoolConf::default().validate().unwrap();
        ServerConf::new("127.0.0.1:0").validate().unwrap();
        ClientConf::new("127.0.0.1:80").validate().unwrap();
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let conf = ChannelConfig {
            read_buf_size: 0,
            ..ChannelConfig::default()
        };
        assert!(conf.validate().is_err());

        let conf = ChannelConfig {
            read_timeout: Duration::ZERO,
            ..ChannelConfig::default()
        };
        assert!(conf.validate().is_err());

        let pool = ReadPoolConf {
            max_workers: 0,
            ..ReadPoolConf::default()
        };
        assert!(pool.validate().is_err());
    }

    #[test]
    fn server_conf_requires_capacity() {
        let conf = ServerConf::new("127.0.0.1:0").with_max_channels(0);
        assert!(conf.validate().is_err());

        let conf = ServerConf::new("");
        assert!(conf.validate().is_err());
    }
}
