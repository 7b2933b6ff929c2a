//! Configuration types.
//!
//! The configuration surface is small: the log server endpoint, the stream
//! the service works on and the per-subscriber queue capacity of in-process
//! stores. The migration catalog is supplied in code.

use nutype::nutype;

use crate::errors::ConfigError;
use crate::types::StreamName;

/// Environment variable holding the endpoint address.
pub const HOST_ENV_VAR: &str = "ENTITYSTORE_HOST";
/// Environment variable holding the stream name.
pub const STREAM_ENV_VAR: &str = "ENTITYSTORE_STREAM";
/// Endpoint used when none is configured.
pub const DEFAULT_HOST: &str = "tcp://localhost:1113";

/// Address of the log server, e.g. `tcp://localhost:1113`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 2048, predicate = |address| address.contains("://")),
    derive(Debug, Clone, PartialEq, Eq, Hash, AsRef, Display, TryFrom, Serialize, Deserialize)
)]
pub struct EndpointAddress(String);

impl Default for EndpointAddress {
    fn default() -> Self {
        Self::try_new(DEFAULT_HOST).expect("default endpoint is valid")
    }
}

/// Capacity of the bounded queue feeding each subscriber.
///
/// A full queue suspends the appender until the subscriber catches up.
#[nutype(
    validate(greater = 0),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, AsRef, Into, Display)
)]
pub struct SubscriberCapacity(usize);

impl Default for SubscriberCapacity {
    fn default() -> Self {
        Self::try_new(1024).expect("default capacity is valid")
    }
}

/// Connection settings of an [`EventStoreService`](crate::service::EventStoreService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStoreConfig {
    /// Log server endpoint.
    pub host: EndpointAddress,
    /// Name of the stream the service reads and writes.
    pub stream: StreamName,
}

impl EventStoreConfig {
    /// Settings for `stream` on the default endpoint.
    pub fn new(stream: StreamName) -> Self {
        Self {
            host: EndpointAddress::default(),
            stream,
        }
    }

    /// Replaces the endpoint.
    #[must_use]
    pub fn with_host(mut self, host: EndpointAddress) -> Self {
        self.host = host;
        self
    }

    /// Builds settings from raw strings, validating both values.
    pub fn parse(host: Option<&str>, stream: Option<&str>) -> Result<Self, ConfigError> {
        let host = match host {
            Some(host) => EndpointAddress::try_new(host)
                .map_err(|error| ConfigError::InvalidHost(error.to_string()))?,
            None => EndpointAddress::default(),
        };
        let stream = stream
            .ok_or_else(|| ConfigError::InvalidStream("missing value".to_string()))
            .and_then(|stream| {
                StreamName::try_new(stream)
                    .map_err(|error| ConfigError::InvalidStream(error.to_string()))
            })?;
        Ok(Self { host, stream })
    }

    /// Reads [`HOST_ENV_VAR`] (optional) and [`STREAM_ENV_VAR`] (required).
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var(HOST_ENV_VAR).ok();
        let stream = std::env::var(STREAM_ENV_VAR).ok();
        Self::parse(host.as_deref(), stream.as_deref())
    }
}
