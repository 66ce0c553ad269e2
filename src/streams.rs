//! Stream engine: publishing and the three read paths.
//!
//! Streams are append-only, id-ordered, length-capped logs named
//! `stream:<element>:<name>`. Publishing serializes each field value with
//! the selected codec and stamps the tag as a synthetic `ser` field;
//! reading reverses that, best-effort (a field the codec rejects is kept
//! as raw bytes).

use std::collections::HashMap;

use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use rmpv::Value;

use atom_protocol::{self as protocol, FieldMap, ENTRY_RESERVED_FIELDS, SER_FIELD};

use crate::config::MAX_BLOCK_MS;
use crate::element::{lock, Element};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Delivered entries
// ---------------------------------------------------------------------------

/// One decoded stream entry.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Server-assigned id, `<ms>-<seq>`.
    pub id: String,
    /// Serialization tag the publisher stamped, when present.
    pub ser: Option<String>,
    pub fields: HashMap<String, Value>,
}

/// A subscription for the fan-in loop: one source stream and the callback
/// its entries dispatch to.
pub struct StreamHandler {
    pub element: String,
    pub stream: String,
    handler: Box<dyn FnMut(StreamEntry) -> Result<()> + Send>,
}

impl StreamHandler {
    pub fn new<F>(element: &str, stream: &str, handler: F) -> StreamHandler
    where
        F: FnMut(StreamEntry) -> Result<()> + Send + 'static,
    {
        StreamHandler {
            element: element.to_owned(),
            stream: stream.to_owned(),
            handler: Box::new(handler),
        }
    }
}

impl Element {
    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Serialize `fields` and append them to `stream:<self>:<stream_name>`,
    /// trimming the stream to roughly `maxlen`. Returns the assigned entry
    /// id. The stream is recorded for deletion at teardown.
    ///
    /// Field names used by the runtime (`element`, `cmd`, `ser`, `id`, ...)
    /// are rejected.
    pub async fn entry_write(
        &self,
        stream_name: &str,
        fields: Vec<(String, Value)>,
        maxlen: usize,
        serialization: &str,
    ) -> Result<String> {
        for (name, _) in &fields {
            if ENTRY_RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(Error::ReservedField(name.clone()));
            }
        }
        let codec = self.codec_for(serialization)?;
        let mut wire: Vec<(String, Vec<u8>)> = Vec::with_capacity(fields.len() + 1);
        for (name, value) in &fields {
            wire.push((name.clone(), codec.serialize(value)?));
        }
        wire.push((SER_FIELD.to_owned(), serialization.as_bytes().to_vec()));

        lock(&self.streams).insert(stream_name.to_owned());

        let mut pipe = self.pool.acquire().await;
        {
            let cmd = pipe
                .pipeline()
                .cmd("XADD")
                .arg(protocol::stream_key(&self.name, stream_name))
                .arg("MAXLEN")
                .arg("~")
                .arg(maxlen)
                .arg("*");
            for (name, value) in wire {
                cmd.arg(name).arg(value);
            }
        }
        let ids: Vec<String> = pipe.execute().await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| Error::InvalidResponse("XADD returned no id".to_owned()))
    }

    /// Delete one published stream from the server and unrecord it.
    pub async fn clean_up_stream(&self, stream_name: &str) -> Result<()> {
        if !lock(&self.streams).contains(stream_name) {
            return Err(Error::NoSuchStream(stream_name.to_owned()));
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(protocol::stream_key(&self.name, stream_name))
            .await?;
        lock(&self.streams).remove(stream_name);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fan-in loop
    // -----------------------------------------------------------------------

    /// Block-read every subscribed stream and dispatch each delivered entry
    /// to its stream's handler.
    ///
    /// Cursors start at the server's current time, so only entries written
    /// after this call are delivered. Returns after `n_loops` reads, or
    /// when a read of `block_ms` comes back empty. Handler errors
    /// propagate; there is no re-delivery.
    ///
    /// With `force`, every entry decodes with the caller's tag regardless
    /// of what the publisher stamped.
    pub async fn entry_read_loop(
        &self,
        handlers: &mut [StreamHandler],
        n_loops: Option<u64>,
        block_ms: u64,
        serialization: &str,
        force: bool,
    ) -> Result<()> {
        let mut conn = self.dedicated_connection().await?;
        let start_ms = self.redis_time_ms().await?;

        let keys: Vec<String> = handlers
            .iter()
            .map(|h| protocol::stream_key(&h.element, &h.stream))
            .collect();
        let mut cursors: Vec<String> = vec![start_ms.to_string(); keys.len()];

        let mut remaining = n_loops;
        loop {
            match remaining.as_mut() {
                Some(0) => return Ok(()),
                Some(n) => *n -= 1,
                None => {}
            }

            let opts = StreamReadOptions::default().block(block_ms.min(MAX_BLOCK_MS) as usize);
            let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            let id_refs: Vec<&str> = cursors.iter().map(String::as_str).collect();
            let reply: StreamReadReply = conn.xread_options(&key_refs, &id_refs, &opts).await?;
            if reply.keys.is_empty() {
                return Ok(());
            }

            for stream in reply.keys {
                let Some(index) = keys.iter().position(|k| *k == stream.key) else {
                    continue;
                };
                for raw in stream.ids {
                    cursors[index] = raw.id.clone();
                    let entry = self.decode_entry(raw, serialization, force)?;
                    (handlers[index].handler)(entry)?;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // One-shot reads
    // -----------------------------------------------------------------------

    /// The `n` most recent entries of a peer's stream, newest first.
    pub async fn entry_read_n(
        &self,
        element: &str,
        stream_name: &str,
        n: usize,
        serialization: &str,
        force: bool,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrevrange_count(protocol::stream_key(element, stream_name), "+", "-", n)
            .await?;
        reply
            .ids
            .into_iter()
            .map(|raw| self.decode_entry(raw, serialization, force))
            .collect()
    }

    /// Entries appearing strictly after `last_id`.
    ///
    /// `"$"` means "after this call"; `"0"` means from the beginning; any
    /// explicit id continues from there. `count` bounds the result;
    /// `block_ms` of `Some(0)` blocks without limit, `None` does not block.
    pub async fn entry_read_since(
        &self,
        element: &str,
        stream_name: &str,
        last_id: &str,
        count: Option<usize>,
        block_ms: Option<u64>,
        serialization: &str,
        force: bool,
    ) -> Result<Vec<StreamEntry>> {
        let key = protocol::stream_key(element, stream_name);
        let mut opts = StreamReadOptions::default();
        if let Some(n) = count {
            opts = opts.count(n);
        }

        let reply: StreamReadReply = match block_ms {
            Some(ms) => {
                // A blocked read must not stall the shared connection.
                let mut conn = self.dedicated_connection().await?;
                opts = opts.block(ms.min(MAX_BLOCK_MS) as usize);
                conn.xread_options(&[key.as_str()], &[last_id], &opts)
                    .await?
            }
            None => {
                let mut conn = self.conn.clone();
                conn.xread_options(&[key.as_str()], &[last_id], &opts)
                    .await?
            }
        };

        let mut entries = Vec::new();
        for stream in reply.keys {
            if stream.key != key {
                continue;
            }
            for raw in stream.ids {
                entries.push(self.decode_entry(raw, serialization, force)?);
            }
        }
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Decoding
    // -----------------------------------------------------------------------

    /// Turn a raw entry into a [`StreamEntry`]: pick the codec (`force` >
    /// publisher's `ser` tag > caller tag), then decode each field
    /// best-effort, keeping undecodable values as raw bytes.
    fn decode_entry(
        &self,
        raw: StreamId,
        serialization: &str,
        force: bool,
    ) -> Result<StreamEntry> {
        let mut wire = fields_from(raw.map);
        let embedded = wire
            .remove(SER_FIELD)
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let tag = self.effective_tag(embedded.as_deref(), serialization, force);
        let codec = self.codec_for(tag)?;

        let mut fields = HashMap::with_capacity(wire.len());
        for (name, bytes) in wire {
            let value = codec
                .deserialize(&bytes)
                .unwrap_or_else(|_| Value::Binary(bytes));
            fields.insert(name, value);
        }
        Ok(StreamEntry {
            id: raw.id,
            ser: embedded,
            fields,
        })
    }
}

/// Flatten a raw reply map into byte-valued fields, dropping anything that
/// is not byte-like (streams only ever carry bulk strings).
pub(crate) fn fields_from(map: HashMap<String, redis::Value>) -> FieldMap {
    map.into_iter()
        .filter_map(|(name, value)| value_bytes(value).map(|bytes| (name, bytes)))
        .collect()
}

fn value_bytes(value: redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::BulkString(bytes) => Some(bytes),
        redis::Value::SimpleString(s) => Some(s.into_bytes()),
        redis::Value::Int(i) => Some(i.to_string().into_bytes()),
        _ => None,
    }
}
