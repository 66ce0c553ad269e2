// atom-protocol: Wire-level names, frames, and constants for the Atom
// inter-process messaging protocol.
//
// Everything on the wire is a flat map of short ASCII field names to byte
// values, appended to Redis streams. This crate owns the key namespace, the
// reserved names, the error-code ranges, and the frame layouts; it performs
// no I/O of its own.

use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Language / version identity
// ---------------------------------------------------------------------------

/// Language tag reported by the `version` built-in.
pub const LANG: &str = "Rust";

/// Full crate version, `major.minor.patch`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The `major.minor` portion of [`VERSION`] as a float, as transported in
/// `version` replies.
pub fn version_major_minor() -> f64 {
    let mut parts = VERSION.splitn(3, '.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    format!("{}.{}", major, minor).parse().unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Key namespace
// ---------------------------------------------------------------------------

/// The shared log stream key.
pub const LOG_STREAM: &str = "log";

/// Key of an element's command inbox stream.
pub fn command_key(element: &str) -> String {
    format!("command:{}", element)
}

/// Key of an element's response stream.
pub fn response_key(element: &str) -> String {
    format!("response:{}", element)
}

/// Key of a data stream owned by an element.
///
/// `element = "*"` yields the enumeration pattern for all elements' streams.
pub fn stream_key(element: &str, stream: &str) -> String {
    format!("stream:{}:{}", element, stream)
}

/// Base key for a new reference owned by `element`.
///
/// The serialization tag segment (`:ser:<tag>`) and, for stream snapshots,
/// the field-name segment are appended by the reference store.
pub fn reference_key(element: &str, uuid: &str) -> String {
    format!("reference:{}:{}", element, uuid)
}

/// Extract the element name from a `response:<name>` key.
pub fn element_from_response_key(key: &str) -> Option<&str> {
    key.strip_prefix("response:")
}

/// Extract the serialization tag embedded in a reference key, if any.
///
/// The tag is the segment immediately following a `ser` segment:
/// `reference:cam0:<uuid>:ser:msgpack:frame` yields `"msgpack"`.
pub fn serialization_from_reference_key(key: &str) -> Option<&str> {
    let mut segments = key.split(':');
    while let Some(seg) = segments.next() {
        if seg == "ser" {
            return segments.next();
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Reserved names
// ---------------------------------------------------------------------------

/// Field names written by the runtime itself; rejected in user entry payloads.
pub const ENTRY_RESERVED_FIELDS: [&str; 9] = [
    "element", "cmd", "cmd_id", "err_code", "err_str", "timeout", "ser", "data", "id",
];

/// The synthetic field carrying the serialization tag.
pub const SER_FIELD: &str = "ser";

/// The synthetic field carrying the entry id on delivered entries.
pub const ID_FIELD: &str = "id";

pub const HEALTHCHECK_COMMAND: &str = "healthcheck";
pub const VERSION_COMMAND: &str = "version";
pub const COMMAND_LIST_COMMAND: &str = "command_list";

/// Command names registered by every element at construction.
pub const RESERVED_COMMANDS: [&str; 3] =
    [COMMAND_LIST_COMMAND, VERSION_COMMAND, HEALTHCHECK_COMMAND];

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Response/exit codes.
///
/// The ranges partition: 0 success, 1-99 framework, 100-999 language
/// binding, >= 1000 user. A callee's non-zero code is shifted by
/// [`USER_ERRORS_BEGIN`] before transmission.
pub mod code {
    pub const NO_ERROR: u64 = 0;
    pub const INTERNAL_ERROR: u64 = 1;
    pub const REDIS_ERROR: u64 = 2;
    pub const NO_ACK: u64 = 3;
    pub const NO_RESPONSE: u64 = 4;
    pub const INVALID_DATA: u64 = 5;
    pub const UNSUPPORTED_COMMAND: u64 = 6;
    pub const CALLBACK_FAILED: u64 = 7;
    pub const LANGUAGE_ERRORS_BEGIN: u64 = 100;
    pub const USER_ERRORS_BEGIN: u64 = 1000;
}

// ---------------------------------------------------------------------------
// Log levels
// ---------------------------------------------------------------------------

/// Unix syslog severity carried on the shared log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Emerg = 0,
    Alert = 1,
    Crit = 2,
    Err = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Timing = 7,
    Debug = 8,
}

impl LogLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

// ---------------------------------------------------------------------------
// Entry ids
// ---------------------------------------------------------------------------

/// A server-assigned stream entry id, `<ms>-<seq>`.
///
/// Ids are compared lexicographically on `(ms, seq)`; a reader's cursor only
/// ever advances under this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// Parse `<ms>-<seq>`. A bare millisecond value (no `-<seq>`) parses
    /// with `seq = 0`, matching how the server interprets cursor values.
    pub fn parse(id: &str) -> Option<EntryId> {
        match id.split_once('-') {
            Some((ms, seq)) => Some(EntryId {
                ms: ms.parse().ok()?,
                seq: seq.parse().ok()?,
            }),
            None => Some(EntryId {
                ms: id.parse().ok()?,
                seq: 0,
            }),
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// True when `candidate` is strictly newer than `current` under entry-id
/// ordering. Unparseable ids never advance a cursor.
pub fn id_is_newer(candidate: &str, current: &str) -> bool {
    match (EntryId::parse(candidate), EntryId::parse(current)) {
        (Some(c), Some(cur)) => c > cur,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Raw field map of a stream entry as it comes off the wire.
pub type FieldMap = HashMap<String, Vec<u8>>;

/// A command posted to `command:<callee>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Caller element name.
    pub element: String,
    pub cmd: String,
    /// Opaque payload, possibly serialized. Empty means "no data".
    pub data: Vec<u8>,
}

impl CommandFrame {
    pub fn to_fields(&self) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            ("element", self.element.clone().into_bytes()),
            ("cmd", self.cmd.clone().into_bytes()),
            ("data", self.data.clone()),
        ]
    }

    /// Parse from a raw entry. `None` when any required field is missing
    /// or non-UTF-8 -- such entries are skipped, not errors.
    pub fn from_fields(fields: &FieldMap) -> Option<CommandFrame> {
        Some(CommandFrame {
            element: utf8_field(fields, "element")?,
            cmd: utf8_field(fields, "cmd")?,
            data: fields.get("data")?.clone(),
        })
    }
}

/// The early reply on `response:<caller>` carrying the response deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Callee element name.
    pub element: String,
    /// Id of the command being acknowledged.
    pub cmd_id: String,
    /// Milliseconds the caller should wait for the response.
    pub timeout_ms: u64,
}

impl AckFrame {
    pub fn to_fields(&self) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            ("element", self.element.clone().into_bytes()),
            ("cmd_id", self.cmd_id.clone().into_bytes()),
            ("timeout", self.timeout_ms.to_string().into_bytes()),
        ]
    }

    /// Match an entry against an outstanding `(callee, cmd_id)` pair.
    ///
    /// Entries missing the `timeout` field are not acks (a response frame
    /// for the same pair carries `err_code` instead).
    pub fn matches(fields: &FieldMap, callee: &str, cmd_id: &str) -> Option<u64> {
        if utf8_field(fields, "element")? != callee || utf8_field(fields, "cmd_id")? != cmd_id {
            return None;
        }
        utf8_field(fields, "timeout")?.parse().ok()
    }
}

/// The final reply on `response:<caller>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    /// Callee element name.
    pub element: String,
    pub cmd: String,
    pub cmd_id: String,
    pub err_code: u64,
    pub err_str: String,
    pub data: Vec<u8>,
    /// Serialization tag applied to `data`, when any.
    pub ser: Option<String>,
}

impl ResponseFrame {
    pub fn to_fields(&self) -> Vec<(&'static str, Vec<u8>)> {
        let mut fields = vec![
            ("element", self.element.clone().into_bytes()),
            ("cmd", self.cmd.clone().into_bytes()),
            ("cmd_id", self.cmd_id.clone().into_bytes()),
            ("err_code", self.err_code.to_string().into_bytes()),
        ];
        if !self.err_str.is_empty() {
            fields.push(("err_str", self.err_str.clone().into_bytes()));
        }
        if !self.data.is_empty() {
            fields.push(("data", self.data.clone()));
        }
        if let Some(tag) = &self.ser {
            fields.push(("ser", tag.clone().into_bytes()));
        }
        fields
    }

    /// Match an entry against an outstanding `(callee, cmd_id)` pair and
    /// parse it. Entries without `err_code` are not responses.
    pub fn matches(fields: &FieldMap, callee: &str, cmd_id: &str) -> Option<ResponseFrame> {
        let element = utf8_field(fields, "element")?;
        if element != callee || utf8_field(fields, "cmd_id")? != cmd_id {
            return None;
        }
        Some(ResponseFrame {
            element,
            cmd: utf8_field(fields, "cmd").unwrap_or_default(),
            cmd_id: cmd_id.to_owned(),
            err_code: utf8_field(fields, "err_code")?.parse().ok()?,
            err_str: utf8_field(fields, "err_str").unwrap_or_default(),
            data: fields.get("data").cloned().unwrap_or_default(),
            ser: utf8_field(fields, "ser"),
        })
    }
}

/// One record on the shared `log` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub element: String,
    /// OS nodename of the publishing host.
    pub host: String,
    pub level: LogLevel,
    pub msg: String,
}

impl LogFrame {
    pub fn to_fields(&self) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            ("element", self.element.clone().into_bytes()),
            ("host", self.host.clone().into_bytes()),
            ("level", self.level.to_string().into_bytes()),
            ("msg", self.msg.clone().into_bytes()),
        ]
    }
}

fn utf8_field(fields: &FieldMap, name: &str) -> Option<String> {
    String::from_utf8(fields.get(name)?.clone()).ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
