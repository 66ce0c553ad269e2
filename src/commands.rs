//! Command/response engine.
//!
//! Three named streams implement a per-element RPC mailbox: the callee's
//! inbox `command:<callee>`, and the caller's shared inbox
//! `response:<caller>` which carries both acknowledges and responses for
//! every call the caller has outstanding.
//!
//! # Protocol, caller side
//! 1. Snapshot the shared response cursor (before posting, so the ack
//!    cannot be missed)
//! 2. Append `{element, cmd, data}` to `command:<callee>`; the assigned
//!    entry id becomes `cmd_id`
//! 3. Wait for the matching acknowledge `(element, cmd_id, timeout)` until
//!    the ack deadline
//! 4. Wait for the matching response `(element, cmd_id, err_code, ...)`
//!    until the acknowledged timeout
//!
//! Because the response stream is shared, both wait phases only peek: each
//! call reads from its own private cursor and entries for other calls are
//! skipped, while the shared cursor is advanced monotonically as a hint so
//! concurrent calls can skip traffic they will never match.
//!
//! Protocol timeouts come back as error-coded [`CommandResponse`] values
//! (`NO_ACK` / `NO_RESPONSE`); only transport failures are `Err`.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use rmpv::Value;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use atom_protocol::{
    self as protocol, code, AckFrame, CommandFrame, LogLevel, ResponseFrame, LANG,
    RESERVED_COMMANDS,
};

use crate::config::{MAX_BLOCK_MS, RESPONSE_TIMEOUT_MS, STREAM_LEN};
use crate::element::{lock, Element};
use crate::error::{Error, Result};
use crate::serialization::{SERIALIZATION_MSGPACK, SERIALIZATION_NONE};
use crate::streams::fields_from;

// ---------------------------------------------------------------------------
// Handler plumbing
// ---------------------------------------------------------------------------

/// What a handler produces: a [`Response`] to transmit, or an error message
/// the loop converts into a `CALLBACK_FAILED` response.
pub type HandlerResult = std::result::Result<Response, String>;

pub type CommandFuture = BoxFuture<'static, HandlerResult>;

/// A registered handler. Invoked with the decoded payload, or `Value::Nil`
/// for the built-ins and for empty payloads.
pub type CommandFn = Arc<dyn Fn(Value) -> CommandFuture + Send + Sync>;

#[derive(Clone)]
pub(crate) enum CommandKind {
    /// Built-in `version` reply.
    Version,
    /// Built-in `command_list` reply.
    CommandList,
    Handler(CommandFn),
}

#[derive(Clone)]
pub(crate) struct CommandEntry {
    pub(crate) kind: CommandKind,
    /// Tag used to decode the request payload and encode the reply.
    pub(crate) serialization: String,
    /// Deadline handed to callers in the acknowledge.
    pub(crate) timeout_ms: u64,
}

impl CommandEntry {
    pub(crate) fn builtin(kind: CommandKind) -> CommandEntry {
        CommandEntry {
            kind,
            serialization: SERIALIZATION_MSGPACK.to_owned(),
            timeout_ms: RESPONSE_TIMEOUT_MS,
        }
    }

    pub(crate) fn healthcheck(handler: CommandFn) -> CommandEntry {
        CommandEntry {
            kind: CommandKind::Handler(handler),
            serialization: SERIALIZATION_NONE.to_owned(),
            timeout_ms: RESPONSE_TIMEOUT_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// What a handler returns to be transmitted back to the caller.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub data: Option<Value>,
    /// `0` success; any other value is shifted into the user range before
    /// transmission.
    pub err_code: u64,
    pub err_str: String,
    /// Tag used to encode `data`; the handler's registered tag applies
    /// when unset.
    pub serialization: Option<String>,
}

impl Response {
    pub fn ok() -> Response {
        Response::default()
    }

    pub fn with_data(data: Value) -> Response {
        Response {
            data: Some(data),
            ..Response::default()
        }
    }

    pub fn serialized(data: Value, tag: &str) -> Response {
        Response {
            data: Some(data),
            serialization: Some(tag.to_owned()),
            ..Response::default()
        }
    }

    pub fn error(err_code: u64, err_str: impl Into<String>) -> Response {
        Response {
            err_code,
            err_str: err_str.into(),
            ..Response::default()
        }
    }
}

/// The caller-facing result of `command_send`.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub data: Option<Value>,
    pub err_code: u64,
    pub err_str: String,
}

impl CommandResponse {
    fn success() -> CommandResponse {
        CommandResponse {
            data: None,
            err_code: code::NO_ERROR,
            err_str: String::new(),
        }
    }

    fn error(err_code: u64, err_str: String) -> CommandResponse {
        CommandResponse {
            data: None,
            err_code,
            err_str,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err_code == code::NO_ERROR
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

impl Element {
    /// Register `handler` under `name` for other elements to call.
    ///
    /// `timeout_ms` is the deadline handed to callers in the acknowledge;
    /// `serialization` decodes the request payload and encodes the reply
    /// unless the reply overrides it.
    pub fn command_add<F, Fut>(
        &self,
        name: &str,
        handler: F,
        timeout_ms: Option<u64>,
        serialization: &str,
    ) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if RESERVED_COMMANDS.contains(&name) {
            return Err(Error::ReservedCommand(name.to_owned()));
        }
        if !lock(&self.codecs).is_valid(serialization) {
            return Err(Error::UnknownSerialization(serialization.to_owned()));
        }
        let handler: CommandFn = Arc::new(move |value| Box::pin(handler(value)));
        lock(&self.handlers).insert(
            name.to_owned(),
            CommandEntry {
                kind: CommandKind::Handler(handler),
                serialization: serialization.to_owned(),
                timeout_ms: timeout_ms.unwrap_or(RESPONSE_TIMEOUT_MS),
            },
        );
        Ok(())
    }

    /// Replace the default healthcheck. The handler must return a
    /// [`Response`]; any non-zero code marks this element unhealthy.
    pub fn healthcheck_set<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: CommandFn = Arc::new(move |_| Box::pin(handler()));
        lock(&self.handlers).insert(
            protocol::HEALTHCHECK_COMMAND.to_owned(),
            CommandEntry::healthcheck(handler),
        );
    }

    /// Names of the user-registered commands (built-ins filtered out).
    pub fn command_list(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.handlers)
            .keys()
            .filter(|name| !RESERVED_COMMANDS.contains(&name.as_str()))
            .cloned()
            .collect();
        names.sort();
        names
    }

    // -----------------------------------------------------------------------
    // Callee loop
    // -----------------------------------------------------------------------

    /// Serve commands until [`command_loop_shutdown`](Self::command_loop_shutdown)
    /// is called. One command at a time: read, acknowledge, dispatch,
    /// respond. Handler failures become error-coded responses; only
    /// transport failures on the read path end the loop.
    pub async fn command_loop(&self) -> Result<()> {
        let mut conn = self.dedicated_connection().await?;
        let mut shutdown = self.shutdown.subscribe();
        let key = protocol::command_key(&self.name);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let last_id = lock(&self.command_last_id).clone();
            let opts = StreamReadOptions::default()
                .block(MAX_BLOCK_MS as usize)
                .count(1);
            let keys = [key.as_str()];
            let ids = [last_id.as_str()];

            let reply: StreamReadReply = tokio::select! {
                biased;
                _ = shutdown.changed() => continue,
                reply = conn.xread_options(&keys, &ids, &opts) => reply?,
            };

            for stream in reply.keys {
                for entry in stream.ids {
                    *lock(&self.command_last_id) = entry.id.clone();
                    let fields = fields_from(entry.map);
                    if let Err(e) = self.serve_command(&entry.id, fields).await {
                        // Fatal to this iteration only; the next read
                        // resumes from the following command id.
                        error!(element = %self.name, error = %e, "command iteration failed");
                    }
                }
            }
        }
    }

    /// Trigger a graceful exit of [`command_loop`](Self::command_loop).
    pub fn command_loop_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn serve_command(&self, cmd_id: &str, fields: protocol::FieldMap) -> Result<()> {
        // Entries missing the command fields are not commands; skip them.
        let Some(frame) = CommandFrame::from_fields(&fields) else {
            return Ok(());
        };
        if frame.element.is_empty() {
            error!(element = %self.name, "no caller name present in command");
            self.log(LogLevel::Err, "No caller name present in command!", false)
                .await;
            return Ok(());
        }
        debug!(element = %self.name, caller = %frame.element, cmd = %frame.cmd, "serving command");

        let entry = lock(&self.handlers).get(&frame.cmd).cloned();
        let timeout_ms = entry
            .as_ref()
            .map(|e| e.timeout_ms)
            .unwrap_or(RESPONSE_TIMEOUT_MS);

        // Acknowledge first, in its own flush, so the caller learns its
        // deadline before the handler starts running.
        let response_key = protocol::response_key(&frame.element);
        let ack = AckFrame {
            element: self.name.clone(),
            cmd_id: cmd_id.to_owned(),
            timeout_ms,
        };
        let mut pipe = self.pool.acquire().await;
        append_frame(pipe.pipeline(), &response_key, ack.to_fields());
        pipe.execute::<Vec<String>>().await?;

        let (mut response, tag) = match entry {
            None => {
                self.log(LogLevel::Err, "Received unsupported command.", false)
                    .await;
                (
                    Response::error(code::UNSUPPORTED_COMMAND, "Unsupported command."),
                    SERIALIZATION_NONE.to_owned(),
                )
            }
            Some(entry) => {
                let response = self.dispatch(&frame, &entry).await;
                let tag = response
                    .serialization
                    .clone()
                    .unwrap_or_else(|| entry.serialization.clone());
                (response, tag)
            }
        };

        let data = match &response.data {
            None => Vec::new(),
            Some(value) => match self.codec_for(&tag).and_then(|c| c.serialize(value)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Replace the reply rather than killing the loop.
                    response = Response::error(
                        code::INTERNAL_ERROR,
                        format!("Could not serialize response for {}: {}", frame.cmd, e),
                    );
                    Vec::new()
                }
            },
        };

        let frame_out = ResponseFrame {
            element: self.name.clone(),
            cmd: frame.cmd.clone(),
            cmd_id: cmd_id.to_owned(),
            err_code: response.err_code,
            err_str: response.err_str.clone(),
            data,
            ser: Some(tag),
        };
        append_frame(pipe.pipeline(), &response_key, frame_out.to_fields());
        pipe.execute::<Vec<String>>().await?;
        Ok(())
    }

    async fn dispatch(&self, frame: &CommandFrame, entry: &CommandEntry) -> Response {
        match &entry.kind {
            CommandKind::Version => Response::serialized(
                Value::Map(vec![
                    (Value::from("language"), Value::from(LANG)),
                    (
                        Value::from("version"),
                        Value::F64(protocol::version_major_minor()),
                    ),
                ]),
                SERIALIZATION_MSGPACK,
            ),
            CommandKind::CommandList => Response::serialized(
                Value::Array(self.command_list().into_iter().map(Value::from).collect()),
                SERIALIZATION_MSGPACK,
            ),
            CommandKind::Handler(handler) => {
                // Built-ins take no argument; user payloads decode with the
                // handler's registered tag.
                let reserved = RESERVED_COMMANDS.contains(&frame.cmd.as_str());
                let arg = if reserved || frame.data.is_empty() {
                    Value::Nil
                } else {
                    match self
                        .codec_for(&entry.serialization)
                        .and_then(|c| c.deserialize(&frame.data))
                    {
                        Ok(value) => value,
                        Err(e) => {
                            return Response::error(
                                code::INVALID_DATA,
                                format!("Could not deserialize payload for {}: {}", frame.cmd, e),
                            )
                        }
                    }
                };
                match handler(arg).await {
                    // A handler's non-zero code is shifted into the user
                    // range so it cannot collide with framework codes.
                    Ok(mut response) => {
                        if response.err_code != code::NO_ERROR {
                            response.err_code += code::USER_ERRORS_BEGIN;
                        }
                        response
                    }
                    Err(msg) => Response::error(
                        code::CALLBACK_FAILED,
                        format!("Handler for {} failed: {}", frame.cmd, msg),
                    ),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Caller
    // -----------------------------------------------------------------------

    /// Send `cmd` to `element` and wait for its acknowledge and response.
    ///
    /// With `block = false` the command is posted and the call returns an
    /// empty success immediately, leaving the ack and response unread.
    /// Timeouts yield `NO_ACK` / `NO_RESPONSE` codes, never `Err`.
    pub async fn command_send(
        &self,
        element: &str,
        cmd: &str,
        data: Value,
        block: bool,
        ack_timeout_ms: u64,
        serialization: &str,
    ) -> Result<CommandResponse> {
        // Snapshot the shared cursor before posting so a fast callee cannot
        // slip its ack in below our starting point.
        let mut local_last_id = lock(&self.response_last_id).clone();

        let payload = match &data {
            Value::Nil => Vec::new(),
            value => self.codec_for(serialization)?.serialize(value)?,
        };
        let frame = CommandFrame {
            element: self.name.clone(),
            cmd: cmd.to_owned(),
            data: payload,
        };

        let mut pipe = self.pool.acquire().await;
        append_frame(pipe.pipeline(), &protocol::command_key(element), frame.to_fields());
        let ids: Vec<String> = pipe.execute().await?;
        drop(pipe);
        let cmd_id = ids
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidResponse("XADD returned no id".to_owned()))?;

        if !block {
            return Ok(CommandResponse::success());
        }

        let mut conn = self.dedicated_connection().await?;
        let response_key = protocol::response_key(&self.name);

        // Acknowledge phase: wall-clock bounded, peeking past other calls'
        // traffic on the shared stream.
        let start = Instant::now();
        let mut response_timeout_ms = None;
        'ack: loop {
            let elapsed = start.elapsed().as_millis() as u64;
            if elapsed >= ack_timeout_ms {
                break;
            }
            let entries = read_after(&mut conn, &response_key, &local_last_id, ack_timeout_ms - elapsed).await?;
            for entry in entries {
                local_last_id = entry.id.clone();
                let fields = fields_from(entry.map);
                if let Some(timeout) = AckFrame::matches(&fields, element, &cmd_id) {
                    response_timeout_ms = Some(timeout);
                    break 'ack;
                }
                self.update_response_id_if_older(&local_last_id);
            }
        }
        let Some(timeout_ms) = response_timeout_ms else {
            let err_str = format!("Did not receive acknowledge from {}.", element);
            error!(element = %self.name, callee = %element, cmd = %cmd, "no acknowledge");
            self.log(LogLevel::Err, &err_str, false).await;
            return Ok(CommandResponse::error(code::NO_ACK, err_str));
        };

        // Response phase: deadline comes from the acknowledge.
        let start = Instant::now();
        let mut result = None;
        loop {
            let elapsed = start.elapsed().as_millis() as u64;
            if elapsed >= timeout_ms {
                break;
            }
            let entries = read_after(&mut conn, &response_key, &local_last_id, timeout_ms - elapsed).await?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                local_last_id = entry.id.clone();
                let fields = fields_from(entry.map);
                let Some(frame) = ResponseFrame::matches(&fields, element, &cmd_id) else {
                    continue;
                };
                if frame.err_code != code::NO_ERROR {
                    self.log(LogLevel::Err, &frame.err_str, false).await;
                }
                let data = if frame.data.is_empty() {
                    None
                } else {
                    let tag = self.effective_tag(frame.ser.as_deref(), serialization, false);
                    Some(self.decode_response_data(tag, &frame.data))
                };
                result = Some(CommandResponse {
                    data,
                    err_code: frame.err_code,
                    err_str: frame.err_str,
                });
                break;
            }
            self.update_response_id_if_older(&local_last_id);
            if let Some(response) = result.take() {
                return Ok(response);
            }
        }

        let err_str = format!("Did not receive response from {}.", element);
        error!(element = %self.name, callee = %element, cmd = %cmd, "no response");
        self.log(LogLevel::Err, &err_str, false).await;
        Ok(CommandResponse::error(code::NO_RESPONSE, err_str))
    }

    /// Best-effort decode of a response payload: on a codec failure the
    /// raw bytes are retained and a warning logged.
    fn decode_response_data(&self, tag: &str, bytes: &[u8]) -> Value {
        match self.codec_for(tag) {
            Ok(codec) => codec.deserialize(bytes).unwrap_or_else(|_| {
                warn!(element = %self.name, tag = %tag, "could not deserialize response");
                Value::Binary(bytes.to_vec())
            }),
            Err(_) => {
                warn!(element = %self.name, tag = %tag, "unknown response serialization");
                Value::Binary(bytes.to_vec())
            }
        }
    }

    /// Advance the shared response cursor to `new_id` unless another call
    /// already moved it past; the cursor never regresses.
    pub(crate) fn update_response_id_if_older(&self, new_id: &str) {
        let mut shared = lock(&self.response_last_id);
        if protocol::id_is_newer(new_id, &shared) {
            *shared = new_id.to_owned();
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn append_frame(
    pipe: &mut redis::Pipeline,
    key: &str,
    fields: Vec<(&'static str, Vec<u8>)>,
) {
    let cmd = pipe
        .cmd("XADD")
        .arg(key)
        .arg("MAXLEN")
        .arg("~")
        .arg(STREAM_LEN)
        .arg("*");
    for (field, value) in fields {
        cmd.arg(field).arg(value);
    }
}

/// One bounded blocking read after `cursor`, flattened to entries in
/// delivery order.
async fn read_after(
    conn: &mut redis::aio::MultiplexedConnection,
    key: &str,
    cursor: &str,
    remaining_ms: u64,
) -> Result<Vec<redis::streams::StreamId>> {
    let opts = StreamReadOptions::default().block(remaining_ms.max(1) as usize);
    let reply: StreamReadReply = conn.xread_options(&[key], &[cursor], &opts).await?;
    Ok(reply.keys.into_iter().flat_map(|k| k.ids).collect())
}
