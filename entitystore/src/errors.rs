//! Error types for entitystore.
//!
//! Every subsystem owns its own error enum so that callers can tell a storage
//! failure from a structural problem in an entity graph or a misconfigured
//! migration catalog:
//!
//! - **EventStoreError**: stream and backend failures
//! - **EnvelopeError**: a stored record could not be decoded into an [`Event`](crate::event::Event)
//! - **EventParseFailure**: the side-channel report for one undecodable record
//! - **EntityError**: diffing and replay failures
//! - **MigrationError**: stream migration failures
//! - **ResourceTypeError**: registry lookups and registrations
//! - **IndexError**: a domain index rejected an event
//! - **ConfigError**: invalid configuration values
//!
//! Fail-fast errors abort the single operation that raised them and leave the
//! stream untouched. Undecodable records are the exception: they are reported
//! through [`EventParseFailure`] and skipped so reads can make progress.

use thiserror::Error;

use crate::envelope::RawRecord;
use crate::types::StreamName;

/// Errors raised by event streams and their backends.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventStoreError {
    /// The stream handle was deleted. Deletion is terminal: obtain a fresh
    /// handle from the store to work with the next generation of the stream.
    #[error("Stream '{stream}' has been deleted")]
    StreamDeleted {
        /// Name of the deleted stream.
        stream: StreamName,
    },

    /// A required argument was missing or malformed.
    #[error("Invalid argument: {0}")]
    ArgumentInvalid(String),

    /// The backend failed. The message is propagated verbatim; no retry is attempted.
    #[error("Backend failure: {0}")]
    Backend(String),

    /// An event or metadata value could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A metadata value stored on the backend has a type that cannot be represented.
    #[error("Unsupported value stored under metadata key '{key}'")]
    UnsupportedMetadata {
        /// The offending key.
        key: String,
    },
}

impl EventStoreError {
    /// Shorthand for [`EventStoreError::StreamDeleted`].
    pub fn deleted(stream: &StreamName) -> Self {
        Self::StreamDeleted {
            stream: stream.clone(),
        }
    }
}

impl From<serde_json::Error> for EventStoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Reasons a stored record could not be turned back into an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// The header block is not a JSON object.
    #[error("Malformed headers: {0}")]
    MalformedHeaders(String),

    /// A required header is absent or has the wrong JSON type.
    #[error("Missing or invalid header '{0}'")]
    MissingHeader(&'static str),

    /// The `type` header names an event kind this library does not know.
    #[error("Unknown event type '{0}'")]
    UnknownEventType(String),

    /// The payload could not be parsed.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// One record that could not be decoded while reading or following a stream.
///
/// Parse failures never abort a read. They are handed to the reader's
/// parse-failure handler (or logged as a warning when none is installed) and
/// the record is skipped.
#[derive(Debug, Clone, Error)]
#[error("Could not parse event #{event_number} of stream '{stream}': {source}")]
pub struct EventParseFailure {
    /// The stream the record was read from.
    pub stream: StreamName,
    /// Position of the record in the backend log.
    pub event_number: u64,
    /// The undecodable record, exactly as the backend returned it.
    pub record: RawRecord,
    /// Why decoding failed.
    #[source]
    pub source: EnvelopeError,
}

/// Errors raised while diffing entities or reconstructing them from a stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EntityError {
    /// The requested Rust type is not the type registered for the resource type.
    #[error("Resource type '{resource_type}' is registered for {registered}, not {requested}")]
    TypeMismatch {
        /// Name of the resource type.
        resource_type: String,
        /// Type registered under that name.
        registered: &'static str,
        /// Type the caller asked for.
        requested: &'static str,
    },

    /// Nested-object recursion reached the maximum depth.
    #[error("Object graph at '{path}' is nested {depth} levels deep; assuming a cycle")]
    CyclicGraph {
        /// Property path at which the limit was hit.
        path: String,
        /// Depth at which the limit was hit.
        depth: usize,
    },

    /// A nested-object type has no empty instance to diff against or materialize.
    #[error("Type {type_name} cannot be default-constructed")]
    MissingEmptyConstructor {
        /// The type lacking an empty instance.
        type_name: &'static str,
    },

    /// A required argument was missing or malformed.
    #[error("Invalid argument: {0}")]
    ArgumentInvalid(String),

    /// A field value could not be converted to or from its event representation.
    #[error("Could not serialize property '{path}': {detail}")]
    Serialization {
        /// Property path of the field.
        path: String,
        /// Serializer message.
        detail: String,
    },

    /// Reading the stream failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Errors raised by the stream migrator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MigrationError {
    /// Two migrations in the catalog start from the same version.
    #[error("Found multiple migrations starting from version {from_version}")]
    Ambiguous {
        /// The duplicated source version.
        from_version: u32,
    },

    /// The stream carries a version marker that is not a valid version.
    #[error("Stream '{stream}' has an invalid version marker: {value}")]
    InvalidVersion {
        /// The stream being migrated.
        stream: StreamName,
        /// The stored marker, rendered for diagnostics.
        value: String,
    },

    /// A migration's transform failed.
    #[error("Migration from version {from_version} to {to_version} failed: {detail}")]
    Migration {
        /// Source version.
        from_version: u32,
        /// Target version.
        to_version: u32,
        /// What went wrong.
        detail: String,
    },

    /// A stream operation failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

/// Errors raised by the resource type registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceTypeError {
    /// The name is empty or whitespace.
    #[error("Invalid resource type name: {0}")]
    InvalidName(String),

    /// No resource type is registered under the name.
    #[error("No resource type named '{name}' is registered")]
    Unknown {
        /// The name that was looked up.
        name: String,
    },
}

/// A domain index rejected an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// The index could not apply the event.
    #[error("Index rejected event: {0}")]
    Rejected(String),
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The endpoint address is missing or malformed.
    #[error("Invalid configuration: bad value for 'host': {0}")]
    InvalidHost(String),

    /// The stream name is missing or malformed.
    #[error("Invalid configuration: bad value for 'stream': {0}")]
    InvalidStream(String),
}

/// Result type for stream operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Result type for diff and replay operations.
pub type EntityResult<T> = Result<T, EntityError>;

/// Result type for migrations.
pub type MigrationResult<T> = Result<T, MigrationError>;
