//! Crate error type.
//!
//! Transport failures and invalid-argument conditions surface as `Err`;
//! protocol timeouts (no ack, no response) never do -- they come back as
//! error-coded [`CommandResponse`](crate::commands::CommandResponse) values.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Initial connection to the backing server failed.
    #[error("could not connect to the Redis server: {0}")]
    Connect(#[source] redis::RedisError),

    /// Transport or server failure after init.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A serialization tag with no registered codec.
    #[error("unknown serialization \"{0}\"")]
    UnknownSerialization(String),

    /// A tag already present in the codec registry.
    #[error("serialization \"{0}\" is already registered")]
    SerializationExists(String),

    #[error("serialization failed: {0}")]
    Serialize(String),

    #[error("deserialization failed: {0}")]
    Deserialize(String),

    /// A user entry payload used one of the runtime's field names.
    #[error("\"{0}\" is a reserved entry field")]
    ReservedField(String),

    /// An attempt to register a handler under a built-in command name.
    #[error("\"{0}\" is a reserved command name")]
    ReservedCommand(String),

    /// A stream name not present in the element's published-streams set.
    #[error("stream \"{0}\" does not exist")]
    NoSuchStream(String),

    /// The reference snapshot script failed to load at init; stream
    /// snapshots are permanently unavailable on this element.
    #[error("reference snapshot script is not loaded")]
    ScriptNotLoaded,

    #[error("reference \"{0}\" not found")]
    ReferenceNotFound(String),

    /// The server replied with something the protocol does not allow.
    #[error("invalid response from the Redis server: {0}")]
    InvalidResponse(String),
}
