//! Reference store: expiring keyed blobs that outlive stream retention.
//!
//! A reference key embeds its owner and serialization tag
//! (`reference:<owner>:<uuid>:ser:<tag>`), so a read is self-describing.
//! Snapshotting a stream entry into references runs server-side as a Lua
//! script, atomically with respect to stream trimming; the script is
//! preloaded at element init and re-loaded on `NOSCRIPT`.
//!
//! Unlike commands, reference operations are direct key operations: missing
//! keys and malformed replies are `Err`, not error codes.

use std::collections::HashMap;

use rmpv::Value;
use uuid::Uuid;

use atom_protocol as protocol;

use crate::element::{lock, Element};
use crate::error::{Error, Result};

/// Snapshot one stream entry into per-field reference keys.
///
/// ARGV: stream key, entry id ("" = most recent), base reference key,
/// timeout in ms (0 = no expiry). Returns the created keys. Each key is
/// `<base>[:ser:<tag>]:<field>` so the field name is the final segment and
/// the entry's tag rides along when it was stamped.
pub(crate) const STREAM_REFERENCE_SCRIPT: &str = r#"
local stream_key = ARGV[1]
local entry_id = ARGV[2]
local base_key = ARGV[3]
local timeout_ms = tonumber(ARGV[4])

local entries
if entry_id == '' then
    entries = redis.call('XREVRANGE', stream_key, '+', '-', 'COUNT', 1)
else
    entries = redis.call('XRANGE', stream_key, entry_id, entry_id)
end
if #entries == 0 then
    return redis.error_reply('no entry to snapshot')
end

local fields = entries[1][2]
local ser = nil
for i = 1, #fields, 2 do
    if fields[i] == 'ser' then
        ser = fields[i + 1]
    end
end

local keys = {}
for i = 1, #fields, 2 do
    local field = fields[i]
    if field ~= 'ser' then
        local key = base_key
        if ser then
            key = key .. ':ser:' .. ser
        end
        key = key .. ':' .. field
        if timeout_ms > 0 then
            redis.call('SET', key, fields[i + 1], 'PX', timeout_ms)
        else
            redis.call('SET', key, fields[i + 1])
        end
        table.insert(keys, key)
    end
end
return keys
"#;

impl Element {
    /// Store each value as a fresh expiring reference; returns one key per
    /// value, in order. `timeout_ms = 0` means no expiry.
    pub async fn reference_create(
        &self,
        values: &[Value],
        serialization: &str,
        timeout_ms: u64,
    ) -> Result<Vec<String>> {
        let codec = self.codec_for(serialization)?;

        let mut keys = Vec::with_capacity(values.len());
        let mut pipe = self.pool.acquire().await;
        for value in values {
            let key = format!(
                "{}:ser:{}",
                protocol::reference_key(&self.name, &Uuid::new_v4().to_string()),
                serialization
            );
            let blob = codec.serialize(value)?;
            let cmd = pipe.pipeline().cmd("SET").arg(&key).arg(blob);
            if timeout_ms > 0 {
                cmd.arg("PX").arg(timeout_ms);
            }
            // NX: a uuid collision must fail loudly, not overwrite.
            cmd.arg("NX");
            keys.push(key);
        }

        let replies: Vec<Option<String>> = pipe.execute().await?;
        if replies.len() != values.len() || replies.iter().any(Option::is_none) {
            return Err(Error::InvalidResponse(
                "failed to create reference".to_owned(),
            ));
        }
        Ok(keys)
    }

    /// Snapshot an entry of a peer's stream into references without the
    /// data leaving the server. `stream_id = ""` snapshots the most recent
    /// entry. Returns `{field name -> reference key}`.
    pub async fn reference_create_from_stream(
        &self,
        element: &str,
        stream_name: &str,
        stream_id: &str,
        timeout_ms: u64,
    ) -> Result<HashMap<String, String>> {
        let sha = lock(&self.reference_sha)
            .clone()
            .ok_or(Error::ScriptNotLoaded)?;

        let stream_key = protocol::stream_key(element, stream_name);
        let base_key = protocol::reference_key(&self.name, &Uuid::new_v4().to_string());

        let keys = match self
            .snapshot_eval(&sha, &stream_key, stream_id, &base_key, timeout_ms)
            .await
        {
            Err(Error::Redis(e)) if e.kind() == redis::ErrorKind::NoScriptError => {
                // The server lost its script cache (restart, FLUSHALL);
                // reload and retry once.
                let sha = self.reload_reference_script().await?;
                self.snapshot_eval(&sha, &stream_key, stream_id, &base_key, timeout_ms)
                    .await?
            }
            other => other?,
        };

        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key.rsplit(':')
                    .next()
                    .map(|field| (field.to_owned(), key.clone()))
            })
            .collect())
    }

    async fn snapshot_eval(
        &self,
        sha: &str,
        stream_key: &str,
        stream_id: &str,
        base_key: &str,
        timeout_ms: u64,
    ) -> Result<Vec<String>> {
        let mut pipe = self.pool.acquire().await;
        pipe.pipeline()
            .cmd("EVALSHA")
            .arg(sha)
            .arg(0)
            .arg(stream_key)
            .arg(stream_id)
            .arg(base_key)
            .arg(timeout_ms);
        let mut replies: Vec<Vec<String>> = pipe.execute().await?;
        match replies.pop() {
            Some(keys) if replies.is_empty() => Ok(keys),
            _ => Err(Error::InvalidResponse(
                "failed to make reference".to_owned(),
            )),
        }
    }

    async fn reload_reference_script(&self) -> Result<String> {
        let mut pipe = self.pool.acquire().await;
        pipe.pipeline()
            .cmd("SCRIPT")
            .arg("LOAD")
            .arg(STREAM_REFERENCE_SCRIPT);
        let shas: Vec<String> = pipe.execute().await?;
        let sha = shas
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidResponse("SCRIPT LOAD returned nothing".to_owned()))?;
        *lock(&self.reference_sha) = Some(sha.clone());
        Ok(sha)
    }

    /// Fetch references in one batch. A missing (expired, deleted) key
    /// yields `None`. The decode tag comes from the key name unless
    /// `force` selects the caller's tag.
    pub async fn reference_get(
        &self,
        keys: &[&str],
        serialization: &str,
        force: bool,
    ) -> Result<Vec<Option<Value>>> {
        let mut pipe = self.pool.acquire().await;
        for key in keys {
            pipe.pipeline().cmd("GET").arg(key);
        }
        let blobs: Vec<Option<Vec<u8>>> = pipe.execute().await?;
        if blobs.len() != keys.len() {
            return Err(Error::InvalidResponse(format!(
                "expected {} replies, got {}",
                keys.len(),
                blobs.len()
            )));
        }

        let mut values = Vec::with_capacity(keys.len());
        for (key, blob) in keys.iter().zip(blobs) {
            match blob {
                None => values.push(None),
                Some(bytes) => {
                    let tag = self.effective_tag(
                        protocol::serialization_from_reference_key(key),
                        serialization,
                        force,
                    );
                    values.push(Some(self.codec_for(tag)?.deserialize(&bytes)?));
                }
            }
        }
        Ok(values)
    }

    /// Delete references. Every key must exist.
    pub async fn reference_delete(&self, keys: &[&str]) -> Result<()> {
        let mut pipe = self.pool.acquire().await;
        for key in keys {
            pipe.pipeline().cmd("DEL").arg(key);
        }
        let deleted: Vec<i64> = pipe.execute().await?;
        for (key, count) in keys.iter().zip(deleted) {
            if count != 1 {
                return Err(Error::ReferenceNotFound((*key).to_owned()));
            }
        }
        Ok(())
    }

    /// Reset a reference's expiry: positive `timeout_ms` re-arms it, zero
    /// or negative removes it (the reference persists until deleted).
    pub async fn reference_update_timeout_ms(&self, key: &str, timeout_ms: i64) -> Result<()> {
        let mut pipe = self.pool.acquire().await;
        if timeout_ms > 0 {
            pipe.pipeline().cmd("PEXPIRE").arg(key).arg(timeout_ms);
        } else {
            pipe.pipeline().cmd("PERSIST").arg(key);
        }
        let replies: Vec<i64> = pipe.execute().await?;
        if replies != [1] {
            return Err(Error::ReferenceNotFound(key.to_owned()));
        }
        Ok(())
    }

    /// Milliseconds until the reference expires; `-1` when it has no
    /// expiry. A missing key is an error.
    pub async fn reference_get_timeout_ms(&self, key: &str) -> Result<i64> {
        let mut pipe = self.pool.acquire().await;
        pipe.pipeline().cmd("PTTL").arg(key);
        let replies: Vec<i64> = pipe.execute().await?;
        match replies.as_slice() {
            [-2] => Err(Error::ReferenceNotFound(key.to_owned())),
            [ttl] => Ok(*ttl),
            other => Err(Error::InvalidResponse(format!(
                "unexpected PTTL reply: {:?}",
                other
            ))),
        }
    }
}
