// mock_redis: An in-process Redis-compatible server for integration tests.
//
// Speaks enough RESP2 over TCP for the element runtime: stream append with
// approximate trimming, blocking multi-stream reads, reverse range fetch,
// key enumeration, expiring string keys, server time, and the script
// commands (EVALSHA executes the stream-snapshot semantics natively).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A mock Redis server for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port. Each test
/// can spin up its own isolated server instance; all state lives in memory
/// and dies with the server.
pub struct MockRedisServer {
    addr: SocketAddr,
    /// Handle to the background accept loop; dropped when the server is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockRedisServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(State {
            store: Mutex::new(Store::default()),
            wakeup: broadcast::channel(64).0,
        });

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            // Client drops are routine in tests; swallow.
                            let _ = handle_connection(stream, state).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct State {
    store: Mutex<Store>,
    /// Pinged on every XADD to wake blocked readers.
    wakeup: broadcast::Sender<()>,
}

#[derive(Default)]
struct Store {
    strings: HashMap<String, StringValue>,
    streams: HashMap<String, Stream>,
    /// sha -> source. The handle is opaque to clients, so any stable
    /// digest works; we use truncated SHA-256.
    scripts: HashMap<String, Vec<u8>>,
}

struct StringValue {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Stream {
    entries: Vec<Entry>,
    /// Highest id ever assigned; ids are never reused, even after trims.
    last: (u64, u64),
}

struct Entry {
    ms: u64,
    seq: u64,
    fields: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Entry {
    fn id(&self) -> String {
        format!("{}-{}", self.ms, self.seq)
    }
}

impl Store {
    /// Fetch a string key, lazily dropping it if its TTL has passed.
    fn live_string(&mut self, key: &str) -> Option<&StringValue> {
        let expired = self
            .strings
            .get(key)
            .is_some_and(|v| matches!(v.expires_at, Some(at) if at <= Instant::now()));
        if expired {
            self.strings.remove(key);
            return None;
        }
        self.strings.get(key)
    }

    fn live_keys(&mut self) -> Vec<String> {
        let now = Instant::now();
        self.strings
            .retain(|_, v| !matches!(v.expires_at, Some(at) if at <= now));
        let mut keys: Vec<String> = self.strings.keys().cloned().collect();
        keys.extend(self.streams.keys().cloned());
        keys
    }
}

fn lock(state: &State) -> MutexGuard<'_, Store> {
    state.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_unix() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// RESP plumbing
// ---------------------------------------------------------------------------

enum Reply {
    Ok,
    Simple(&'static str),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Reply>),
    NilArray,
}

impl Reply {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Ok => buf.extend_from_slice(b"+OK\r\n"),
            Reply::Simple(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Error(msg) => {
                buf.push(b'-');
                buf.extend_from_slice(msg.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Int(i) => {
                buf.push(b':');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Reply::Nil => buf.extend_from_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(buf);
                }
            }
            Reply::NilArray => buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    fn bulk_str(s: &str) -> Reply {
        Reply::Bulk(s.as_bytes().to_vec())
    }
}

/// Read one multibulk command. `None` on clean client disconnect.
async fn read_command(
    reader: &mut BufReader<OwnedReadHalf>,
) -> std::io::Result<Option<Vec<Vec<u8>>>> {
    let mut header = String::new();
    if reader.read_line(&mut header).await? == 0 {
        return Ok(None);
    }
    let header = header.trim_end();
    let count: usize = header
        .strip_prefix('*')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| bad_proto(format!("expected array header, got {:?}", header)))?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_line = String::new();
        if reader.read_line(&mut len_line).await? == 0 {
            return Ok(None);
        }
        let len: usize = len_line
            .trim_end()
            .strip_prefix('$')
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| bad_proto(format!("expected bulk header, got {:?}", len_line)))?;
        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        data.truncate(len);
        args.push(data);
    }
    Ok(Some(args))
}

fn bad_proto(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    state: Arc<State>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    loop {
        let Some(args) = read_command(&mut reader).await? else {
            return Ok(());
        };
        let reply = dispatch(&state, args).await;
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        write_half.write_all(&buf).await?;
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

async fn dispatch(state: &State, args: Vec<Vec<u8>>) -> Reply {
    let Some(name) = args.first() else {
        return Reply::Error("ERR empty command".to_owned());
    };
    let name = String::from_utf8_lossy(name).to_ascii_uppercase();

    match name.as_str() {
        "PING" => Reply::Simple("PONG"),
        // Connection-metadata chatter from clients; accepted and ignored.
        "CLIENT" => Reply::Ok,
        "TIME" => {
            let now = now_unix();
            Reply::Array(vec![
                Reply::bulk_str(&now.as_secs().to_string()),
                Reply::bulk_str(&now.subsec_micros().to_string()),
            ])
        }
        "SET" => cmd_set(state, &args),
        "GET" => cmd_get(state, &args),
        "DEL" => cmd_del(state, &args),
        "EXISTS" => cmd_exists(state, &args),
        "KEYS" => cmd_keys(state, &args),
        "PEXPIRE" => cmd_pexpire(state, &args),
        "PERSIST" => cmd_persist(state, &args),
        "PTTL" => cmd_pttl(state, &args),
        "XADD" => cmd_xadd(state, &args),
        "XRANGE" => cmd_xrange(state, &args, false),
        "XREVRANGE" => cmd_xrange(state, &args, true),
        "XREAD" => cmd_xread(state, &args).await,
        "SCRIPT" => cmd_script(state, &args),
        "EVALSHA" => cmd_evalsha(state, &args),
        other => Reply::Error(format!("ERR unknown command '{}'", other)),
    }
}

fn arg_str(args: &[Vec<u8>], index: usize) -> Option<String> {
    args.get(index)
        .map(|a| String::from_utf8_lossy(a).into_owned())
}

// -- strings ----------------------------------------------------------------

fn cmd_set(state: &State, args: &[Vec<u8>]) -> Reply {
    let (Some(key), Some(value)) = (arg_str(args, 1), args.get(2)) else {
        return Reply::Error("ERR wrong number of arguments for 'set'".to_owned());
    };
    let mut px: Option<u64> = None;
    let mut nx = false;
    let mut i = 3;
    while i < args.len() {
        match String::from_utf8_lossy(&args[i]).to_ascii_uppercase().as_str() {
            "PX" => {
                px = arg_str(args, i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "NX" => {
                nx = true;
                i += 1;
            }
            other => return Reply::Error(format!("ERR unsupported SET option '{}'", other)),
        }
    }

    let mut store = lock(state);
    if nx && store.live_string(&key).is_some() {
        return Reply::Nil;
    }
    store.strings.insert(
        key,
        StringValue {
            data: value.clone(),
            expires_at: px.map(|ms| Instant::now() + Duration::from_millis(ms)),
        },
    );
    Reply::Ok
}

fn cmd_get(state: &State, args: &[Vec<u8>]) -> Reply {
    let Some(key) = arg_str(args, 1) else {
        return Reply::Error("ERR wrong number of arguments for 'get'".to_owned());
    };
    match lock(state).live_string(&key) {
        Some(value) => Reply::Bulk(value.data.clone()),
        None => Reply::Nil,
    }
}

fn cmd_del(state: &State, args: &[Vec<u8>]) -> Reply {
    let mut store = lock(state);
    let mut removed = 0;
    for arg in &args[1..] {
        let key = String::from_utf8_lossy(arg).into_owned();
        if store.live_string(&key).is_some() {
            store.strings.remove(&key);
            removed += 1;
        } else if store.streams.remove(&key).is_some() {
            removed += 1;
        }
    }
    Reply::Int(removed)
}

fn cmd_exists(state: &State, args: &[Vec<u8>]) -> Reply {
    let mut store = lock(state);
    let mut found = 0;
    for arg in &args[1..] {
        let key = String::from_utf8_lossy(arg).into_owned();
        if store.live_string(&key).is_some() || store.streams.contains_key(&key) {
            found += 1;
        }
    }
    Reply::Int(found)
}

fn cmd_keys(state: &State, args: &[Vec<u8>]) -> Reply {
    let Some(pattern) = arg_str(args, 1) else {
        return Reply::Error("ERR wrong number of arguments for 'keys'".to_owned());
    };
    let keys = lock(state).live_keys();
    Reply::Array(
        keys.into_iter()
            .filter(|key| glob_match(pattern.as_bytes(), key.as_bytes()))
            .map(|key| Reply::Bulk(key.into_bytes()))
            .collect(),
    )
}

fn cmd_pexpire(state: &State, args: &[Vec<u8>]) -> Reply {
    let (Some(key), Some(ms)) = (arg_str(args, 1), arg_str(args, 2)) else {
        return Reply::Error("ERR wrong number of arguments for 'pexpire'".to_owned());
    };
    let Ok(ms) = ms.parse::<u64>() else {
        return Reply::Error("ERR value is not an integer or out of range".to_owned());
    };
    let mut store = lock(state);
    if store.live_string(&key).is_none() {
        return Reply::Int(0);
    }
    if let Some(value) = store.strings.get_mut(&key) {
        value.expires_at = Some(Instant::now() + Duration::from_millis(ms));
    }
    Reply::Int(1)
}

fn cmd_persist(state: &State, args: &[Vec<u8>]) -> Reply {
    let Some(key) = arg_str(args, 1) else {
        return Reply::Error("ERR wrong number of arguments for 'persist'".to_owned());
    };
    let mut store = lock(state);
    if store.live_string(&key).is_none() {
        return Reply::Int(0);
    }
    match store.strings.get_mut(&key) {
        Some(value) if value.expires_at.is_some() => {
            value.expires_at = None;
            Reply::Int(1)
        }
        _ => Reply::Int(0),
    }
}

fn cmd_pttl(state: &State, args: &[Vec<u8>]) -> Reply {
    let Some(key) = arg_str(args, 1) else {
        return Reply::Error("ERR wrong number of arguments for 'pttl'".to_owned());
    };
    let mut store = lock(state);
    match store.live_string(&key) {
        None => Reply::Int(-2),
        Some(value) => match value.expires_at {
            None => Reply::Int(-1),
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                Reply::Int(remaining.as_millis() as i64)
            }
        },
    }
}

// -- streams ----------------------------------------------------------------

fn parse_entry_id(id: &str, default_seq: u64) -> Option<(u64, u64)> {
    match id.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((id.parse().ok()?, default_seq)),
    }
}

fn cmd_xadd(state: &State, args: &[Vec<u8>]) -> Reply {
    let Some(key) = arg_str(args, 1) else {
        return Reply::Error("ERR wrong number of arguments for 'xadd'".to_owned());
    };
    let mut i = 2;
    let mut maxlen: Option<usize> = None;
    if arg_str(args, i).is_some_and(|a| a.eq_ignore_ascii_case("MAXLEN")) {
        i += 1;
        if arg_str(args, i).as_deref() == Some("~") || arg_str(args, i).as_deref() == Some("=") {
            i += 1;
        }
        maxlen = arg_str(args, i).and_then(|n| n.parse().ok());
        if maxlen.is_none() {
            return Reply::Error("ERR invalid MAXLEN".to_owned());
        }
        i += 1;
    }
    let Some(id_arg) = arg_str(args, i) else {
        return Reply::Error("ERR wrong number of arguments for 'xadd'".to_owned());
    };
    i += 1;
    let field_args = &args[i..];
    if field_args.is_empty() || field_args.len() % 2 != 0 {
        return Reply::Error("ERR wrong number of arguments for 'xadd'".to_owned());
    }

    let mut store = lock(state);
    let stream = store.streams.entry(key).or_default();

    let id = if id_arg == "*" {
        let now_ms = now_unix().as_millis() as u64;
        if now_ms <= stream.last.0 {
            (stream.last.0, stream.last.1 + 1)
        } else {
            (now_ms, 0)
        }
    } else {
        match parse_entry_id(&id_arg, 0) {
            Some(id) if id > stream.last => id,
            _ => {
                return Reply::Error(
                    "ERR The ID specified in XADD is equal or smaller than the target stream top item"
                        .to_owned(),
                )
            }
        }
    };
    stream.last = id;

    let fields = field_args
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    stream.entries.push(Entry {
        ms: id.0,
        seq: id.1,
        fields,
    });
    if let Some(cap) = maxlen {
        if stream.entries.len() > cap {
            let excess = stream.entries.len() - cap;
            stream.entries.drain(..excess);
        }
    }
    drop(store);

    let _ = state.wakeup.send(());
    Reply::Bulk(format!("{}-{}", id.0, id.1).into_bytes())
}

fn encode_entry(entry: &Entry) -> Reply {
    let mut flat = Vec::with_capacity(entry.fields.len() * 2);
    for (field, value) in &entry.fields {
        flat.push(Reply::Bulk(field.clone()));
        flat.push(Reply::Bulk(value.clone()));
    }
    Reply::Array(vec![
        Reply::Bulk(entry.id().into_bytes()),
        Reply::Array(flat),
    ])
}

fn cmd_xrange(state: &State, args: &[Vec<u8>], reverse: bool) -> Reply {
    let (Some(key), Some(first), Some(second)) =
        (arg_str(args, 1), arg_str(args, 2), arg_str(args, 3))
    else {
        return Reply::Error("ERR wrong number of arguments for 'xrange'".to_owned());
    };
    // XRANGE key start end; XREVRANGE key end start.
    let (start_arg, end_arg) = if reverse {
        (second, first)
    } else {
        (first, second)
    };
    let mut count = usize::MAX;
    if args.len() > 4 {
        if !arg_str(args, 4).is_some_and(|a| a.eq_ignore_ascii_case("COUNT")) {
            return Reply::Error("ERR syntax error".to_owned());
        }
        match arg_str(args, 5).and_then(|n| n.parse().ok()) {
            Some(n) => count = n,
            None => return Reply::Error("ERR invalid COUNT".to_owned()),
        }
    }

    let start = match start_arg.as_str() {
        "-" => (0, 0),
        id => match parse_entry_id(id, 0) {
            Some(id) => id,
            None => return Reply::Error("ERR Invalid stream ID".to_owned()),
        },
    };
    let end = match end_arg.as_str() {
        "+" => (u64::MAX, u64::MAX),
        id => match parse_entry_id(id, u64::MAX) {
            Some(id) => id,
            None => return Reply::Error("ERR Invalid stream ID".to_owned()),
        },
    };

    let store = lock(state);
    let mut items: Vec<Reply> = match store.streams.get(&key) {
        None => Vec::new(),
        Some(stream) => {
            let in_range = stream
                .entries
                .iter()
                .filter(|e| (e.ms, e.seq) >= start && (e.ms, e.seq) <= end);
            if reverse {
                in_range.rev().take(count).map(encode_entry).collect()
            } else {
                in_range.take(count).map(encode_entry).collect()
            }
        }
    };
    items.truncate(count);
    Reply::Array(items)
}

async fn cmd_xread(state: &State, args: &[Vec<u8>]) -> Reply {
    let mut count: Option<usize> = None;
    let mut block: Option<u64> = None;
    let mut i = 1;
    loop {
        match arg_str(args, i).map(|a| a.to_ascii_uppercase()).as_deref() {
            Some("COUNT") => {
                count = arg_str(args, i + 1).and_then(|n| n.parse().ok());
                i += 2;
            }
            Some("BLOCK") => {
                block = arg_str(args, i + 1).and_then(|n| n.parse().ok());
                i += 2;
            }
            Some("STREAMS") => {
                i += 1;
                break;
            }
            _ => return Reply::Error("ERR syntax error".to_owned()),
        }
    }
    let rest = &args[i..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Reply::Error(
            "ERR Unbalanced XREAD list of streams: for each stream key an ID must be specified"
                .to_owned(),
        );
    }
    let n = rest.len() / 2;
    let keys: Vec<String> = rest[..n]
        .iter()
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .collect();

    // Resolve cursors up front; "$" pins to the stream's current tip so
    // only entries appended after this call are delivered.
    let mut cursors = Vec::with_capacity(n);
    {
        let store = lock(state);
        for (key, id) in keys.iter().zip(&rest[n..]) {
            let id = String::from_utf8_lossy(id);
            let cursor = if id == "$" {
                store.streams.get(key).map(|s| s.last).unwrap_or((0, 0))
            } else {
                match parse_entry_id(&id, 0) {
                    Some(id) => id,
                    None => return Reply::Error("ERR Invalid stream ID".to_owned()),
                }
            };
            cursors.push(cursor);
        }
    }

    let deadline = match block {
        Some(0) => None,
        Some(ms) => Some(Instant::now() + Duration::from_millis(ms)),
        None => None,
    };

    loop {
        // Subscribe before checking so an append between the check and the
        // wait cannot be missed.
        let mut wakeup = state.wakeup.subscribe();

        let reply = collect_xread(state, &keys, &cursors, count);
        if !matches!(reply, Reply::NilArray) {
            return reply;
        }

        match block {
            None => return Reply::NilArray,
            Some(0) => {
                // Block without limit; any recv outcome (including a lagged
                // receiver) just means "re-check the streams".
                let _ = wakeup.recv().await;
            }
            Some(_) => {
                let Some(deadline) = deadline else {
                    return Reply::NilArray;
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Reply::NilArray;
                }
                if tokio::time::timeout(remaining, wakeup.recv()).await.is_err() {
                    return Reply::NilArray;
                }
            }
        }
    }
}

fn collect_xread(
    state: &State,
    keys: &[String],
    cursors: &[(u64, u64)],
    count: Option<usize>,
) -> Reply {
    let store = lock(state);
    let mut per_stream = Vec::new();
    for (key, cursor) in keys.iter().zip(cursors) {
        let Some(stream) = store.streams.get(key) else {
            continue;
        };
        let entries: Vec<Reply> = stream
            .entries
            .iter()
            .filter(|e| (e.ms, e.seq) > *cursor)
            .take(count.unwrap_or(usize::MAX))
            .map(encode_entry)
            .collect();
        if !entries.is_empty() {
            per_stream.push(Reply::Array(vec![
                Reply::Bulk(key.clone().into_bytes()),
                Reply::Array(entries),
            ]));
        }
    }
    if per_stream.is_empty() {
        Reply::NilArray
    } else {
        Reply::Array(per_stream)
    }
}

// -- scripting --------------------------------------------------------------

fn cmd_script(state: &State, args: &[Vec<u8>]) -> Reply {
    if !arg_str(args, 1).is_some_and(|a| a.eq_ignore_ascii_case("LOAD")) {
        return Reply::Error("ERR unsupported SCRIPT subcommand".to_owned());
    }
    let Some(source) = args.get(2) else {
        return Reply::Error("ERR wrong number of arguments for 'script load'".to_owned());
    };
    let digest = Sha256::digest(source);
    let sha: String = digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()[..40]
        .to_owned();
    lock(state).scripts.insert(sha.clone(), source.clone());
    Reply::Bulk(sha.into_bytes())
}

/// Executes the stream-snapshot script natively: resolve the requested
/// entry, write one reference key per field (embedding the entry's `ser`
/// tag), and return the created keys.
fn cmd_evalsha(state: &State, args: &[Vec<u8>]) -> Reply {
    let Some(sha) = arg_str(args, 1) else {
        return Reply::Error("ERR wrong number of arguments for 'evalsha'".to_owned());
    };
    let (Some(stream_key), Some(entry_id), Some(base_key), Some(timeout_ms)) = (
        arg_str(args, 3),
        arg_str(args, 4),
        arg_str(args, 5),
        arg_str(args, 6),
    ) else {
        return Reply::Error("ERR wrong number of arguments for 'evalsha'".to_owned());
    };
    let Ok(timeout_ms) = timeout_ms.parse::<u64>() else {
        return Reply::Error("ERR value is not an integer or out of range".to_owned());
    };

    let mut store = lock(state);
    if !store.scripts.contains_key(&sha) {
        return Reply::Error("NOSCRIPT No matching script. Please use EVAL.".to_owned());
    }

    let Some(stream) = store.streams.get(&stream_key) else {
        return Reply::Error("ERR no entry to snapshot".to_owned());
    };
    let entry = if entry_id.is_empty() {
        stream.entries.last()
    } else {
        match parse_entry_id(&entry_id, 0) {
            Some(id) => stream.entries.iter().find(|e| (e.ms, e.seq) == id),
            None => return Reply::Error("ERR Invalid stream ID".to_owned()),
        }
    };
    let Some(entry) = entry else {
        return Reply::Error("ERR no entry to snapshot".to_owned());
    };

    let ser = entry
        .fields
        .iter()
        .find(|(field, _)| field == b"ser")
        .map(|(_, value)| String::from_utf8_lossy(value).into_owned());

    let mut created = Vec::new();
    for (field, value) in &entry.fields {
        if field == b"ser" {
            continue;
        }
        let mut key = base_key.clone();
        if let Some(tag) = &ser {
            key.push_str(":ser:");
            key.push_str(tag);
        }
        key.push(':');
        key.push_str(&String::from_utf8_lossy(field));
        created.push((key, value.clone()));
    }

    let expires_at =
        (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
    let mut keys = Vec::with_capacity(created.len());
    for (key, data) in created {
        store
            .strings
            .insert(key.clone(), StringValue { data, expires_at });
        keys.push(Reply::Bulk(key.into_bytes()));
    }
    Reply::Array(keys)
}

// ---------------------------------------------------------------------------
// Glob matching (KEYS)
// ---------------------------------------------------------------------------

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text)
                || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}
