//! Atom: lightweight inter-process messaging and RPC over a
//! Redis-compatible server.
//!
//! Processes ("elements") discover one another through well-known stream
//! names, exchange request/reply commands through paired command/response
//! streams, publish time-ordered entries on per-element streams, and share
//! large payloads by reference (expiring keyed blobs) instead of by value.
//!
//! ```no_run
//! use atom::{Element, ElementConfig, Response, Value};
//!
//! # async fn demo() -> atom::Result<()> {
//! let element = Element::new("camera", ElementConfig::default()).await?;
//! element.command_add(
//!     "snap",
//!     |_req| async move { Ok(Response::ok()) },
//!     None,
//!     atom::serialization::SERIALIZATION_NONE,
//! )?;
//! element.command_loop().await?;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod config;
pub mod element;
pub mod error;
pub mod pool;
pub mod reference;
pub mod serialization;
pub mod streams;

pub use atom_protocol as protocol;

pub use commands::{CommandResponse, HandlerResult, Response};
pub use config::ElementConfig;
pub use element::Element;
pub use error::{Error, Result};
pub use protocol::LogLevel;
pub use serialization::{Codec, Value, SERIALIZATION_MSGPACK, SERIALIZATION_NONE};
pub use streams::{StreamEntry, StreamHandler};
