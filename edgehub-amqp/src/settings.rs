//! Settings of the protocol head

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Default maximum frame size
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Default maximum size of a received message, 256 KiB
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 256 * 1024;

/// Default time a link is given to open
pub const DEFAULT_LINK_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time a connection is given to open
pub const DEFAULT_CONNECTION_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default container id announced in the open frame
pub const DEFAULT_CONTAINER_ID: &str = "edgehub";

/// Exponential back-off of an accept loop after a failed `accept()`.
///
/// The delay starts at `initial_delay`, doubles on each consecutive failure up to `max_delay`
/// and is reset by the next accepted transport. Delays are given in milliseconds when
/// deserialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AcceptBackoff {
    #[serde(deserialize_with = "deserialize_millis")]
    pub initial_delay: Duration,

    #[serde(deserialize_with = "deserialize_millis")]
    pub max_delay: Duration,
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl AcceptBackoff {
    /// Clamps both delays to at least 1ms with `initial_delay <= max_delay`
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }

    /// Delay after one more failure following `delay`
    pub fn next_delay(&self, delay: Duration) -> Duration {
        (delay * 2).min(self.max_delay)
    }
}

/// Listener the protocol head accepts connections on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSettings {
    /// Plain TCP
    Tcp {
        /// Socket address, `host:port`
        address: String,
    },
}

impl TransportSettings {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::Tcp {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        match self {
            TransportSettings::Tcp { address } => address,
        }
    }
}

/// Settings of [`AmqpProtocolHead`](crate::head::AmqpProtocolHead) and of the connections it
/// accepts
///
/// Timeouts are given in seconds when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AmqpSettings {
    #[serde(default = "default_container_id")]
    pub container_id: String,

    pub iot_hub_host_name: String,

    #[serde(default)]
    pub transports: Vec<TransportSettings>,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,

    #[serde(
        default = "default_link_open_timeout",
        deserialize_with = "deserialize_secs"
    )]
    pub link_open_timeout: Duration,

    #[serde(
        default = "default_connection_open_timeout",
        deserialize_with = "deserialize_secs"
    )]
    pub connection_open_timeout: Duration,

    #[serde(default)]
    pub accept_backoff: AcceptBackoff,
}

impl AmqpSettings {
    /// Creates a builder for the IoT hub `iot_hub_host_name`
    pub fn builder(iot_hub_host_name: impl Into<String>) -> Builder {
        Builder {
            inner: AmqpSettings {
                container_id: default_container_id(),
                iot_hub_host_name: iot_hub_host_name.into(),
                transports: Vec::new(),
                max_frame_size: DEFAULT_MAX_FRAME_SIZE,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                link_open_timeout: DEFAULT_LINK_OPEN_TIMEOUT,
                connection_open_timeout: DEFAULT_CONNECTION_OPEN_TIMEOUT,
                accept_backoff: AcceptBackoff::default(),
            },
        }
    }
}

/// Builder of [`AmqpSettings`]
#[derive(Debug, Clone)]
pub struct Builder {
    inner: AmqpSettings,
}

impl Builder {
    /// Container id announced in the open frame
    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.inner.container_id = id.into();
        self
    }

    /// Adds a listener
    pub fn transport(mut self, transport: TransportSettings) -> Self {
        self.inner.transports.push(transport);
        self
    }

    /// Adds a plain TCP listener
    pub fn tcp(self, address: impl Into<String>) -> Self {
        self.transport(TransportSettings::tcp(address))
    }

    /// Proposed maximum frame size
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.inner.max_frame_size = max_frame_size;
        self
    }

    /// Maximum encoded size of a received message
    pub fn max_message_size(mut self, max_message_size: u64) -> Self {
        self.inner.max_message_size = max_message_size;
        self
    }

    pub fn link_open_timeout(mut self, timeout: Duration) -> Self {
        self.inner.link_open_timeout = timeout;
        self
    }

    pub fn connection_open_timeout(mut self, timeout: Duration) -> Self {
        self.inner.connection_open_timeout = timeout;
        self
    }

    /// Back-off of the accept loops after failed accepts
    pub fn accept_backoff(mut self, backoff: AcceptBackoff) -> Self {
        self.inner.accept_backoff = backoff;
        self
    }

    pub fn build(self) -> AmqpSettings {
        self.inner
    }
}

fn default_container_id() -> String {
    DEFAULT_CONTAINER_ID.to_string()
}

fn default_max_frame_size() -> u32 {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_message_size() -> u64 {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_link_open_timeout() -> Duration {
    DEFAULT_LINK_OPEN_TIMEOUT
}

fn default_connection_open_timeout() -> Duration {
    DEFAULT_CONNECTION_OPEN_TIMEOUT
}

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
