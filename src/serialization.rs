//! Pluggable payload codecs keyed by short tag strings.
//!
//! The tag travels next to the payload (the `ser` field on entries, the
//! `:ser:<tag>` segment in reference keys) so readers pick the right codec
//! without negotiation. Two codecs are built in: `"none"` (identity on
//! bytes, ASCII rendering of scalars) and `"msgpack"`.
//!
//! Payloads are [`rmpv::Value`] trees; raw bytes are `Value::Binary`.

use std::collections::HashMap;
use std::sync::Arc;

pub use rmpv::Value;

use crate::error::{Error, Result};

/// Identity codec tag.
pub const SERIALIZATION_NONE: &str = "none";

/// MessagePack codec tag.
pub const SERIALIZATION_MSGPACK: &str = "msgpack";

/// Map the legacy boolean serialize/deserialize flag to a tag.
///
/// Kept as a compatibility shim for callers migrating off the boolean API;
/// the tag form wins whenever both are supplied.
pub fn legacy_serialization(flag: bool) -> &'static str {
    if flag {
        SERIALIZATION_MSGPACK
    } else {
        SERIALIZATION_NONE
    }
}

/// One serialize/deserialize pair.
pub trait Codec: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Built-in codecs
// ---------------------------------------------------------------------------

/// Bytes-identity. Scalars render as their ASCII form, the way the backing
/// server's own clients coerce them; containers are rejected.
struct NoneCodec;

impl Codec for NoneCodec {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Nil => Ok(Vec::new()),
            Value::Binary(b) => Ok(b.clone()),
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Integer(i) => Ok(i.to_string().into_bytes()),
            Value::F32(f) => Ok(f.to_string().into_bytes()),
            Value::F64(f) => Ok(f.to_string().into_bytes()),
            other => Err(Error::Serialize(format!(
                "\"none\" cannot carry {:?}; pick a structured codec",
                other
            ))),
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        Ok(Value::Binary(bytes.to_vec()))
    }
}

struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, value).map_err(|e| Error::Serialize(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Value> {
        let mut slice = bytes;
        rmpv::decode::read_value(&mut slice).map_err(|e| Error::Deserialize(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Codecs known to one element, keyed by tag.
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// A registry holding the built-in codecs.
    pub fn new() -> Self {
        let mut codecs: HashMap<String, Arc<dyn Codec>> = HashMap::new();
        codecs.insert(SERIALIZATION_NONE.to_owned(), Arc::new(NoneCodec));
        codecs.insert(SERIALIZATION_MSGPACK.to_owned(), Arc::new(MsgpackCodec));
        CodecRegistry { codecs }
    }

    /// Register a custom codec. Built-in tags cannot be replaced.
    pub fn register(&mut self, tag: &str, codec: Arc<dyn Codec>) -> Result<()> {
        if self.codecs.contains_key(tag) {
            return Err(Error::SerializationExists(tag.to_owned()));
        }
        self.codecs.insert(tag.to_owned(), codec);
        Ok(())
    }

    pub fn is_valid(&self, tag: &str) -> bool {
        self.codecs.contains_key(tag)
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn Codec>> {
        self.codecs
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::UnknownSerialization(tag.to_owned()))
    }

    pub fn serialize(&self, tag: &str, value: &Value) -> Result<Vec<u8>> {
        self.get(tag)?.serialize(value)
    }

    pub fn deserialize(&self, tag: &str, bytes: &[u8]) -> Result<Value> {
        self.get(tag)?.deserialize(bytes)
    }

    /// Best-effort decode: a payload the codec rejects is kept as raw bytes
    /// rather than lost. Unknown tags still error (callers validate tags at
    /// registration or first use).
    pub fn deserialize_lossy(&self, tag: &str, bytes: &[u8]) -> Result<Value> {
        let codec = self.get(tag)?;
        Ok(codec
            .deserialize(bytes)
            .unwrap_or_else(|_| Value::Binary(bytes.to_vec())))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        CodecRegistry::new()
    }
}
