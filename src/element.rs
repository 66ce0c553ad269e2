//! The element runtime: lifecycle, discovery, the log publisher, and the
//! version/health helpers.
//!
//! An element is one unit of RPC identity and stream ownership. Construction
//! connects to the backing server, writes the discovery sentinels onto the
//! element's own response and command streams (peers enumerate
//! `response:*` to find each other), registers the built-in commands, and
//! preloads the reference snapshot script.
//!
//! # Lifecycle
//! 1. `Element::new` -- connect, write sentinels, register built-ins
//! 2. any mix of: `command_loop`, `command_send`, `entry_write`,
//!    `entry_read_*`, reference ops
//! 3. `close` -- stop the loop and delete every key the element owns
//!
//! All operations take `&self` and are safe to call from parallel tasks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use rmpv::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use atom_protocol::{
    self as protocol, code, LogFrame, LogLevel, COMMAND_LIST_COMMAND, HEALTHCHECK_COMMAND,
    LANG, VERSION_COMMAND,
};

use crate::commands::{CommandEntry, CommandKind, Response};
use crate::config::{ElementConfig, ACK_TIMEOUT_MS, STREAM_LEN};
use crate::error::{Error, Result};
use crate::pool::PipelinePool;
use crate::serialization::{Codec, CodecRegistry, SERIALIZATION_MSGPACK, SERIALIZATION_NONE};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Element {
    pub(crate) name: String,
    pub(crate) host: String,
    pub(crate) client: redis::Client,
    /// Shared connection for non-blocking direct reads; writes go through
    /// the pool, blocking reads through dedicated connections.
    pub(crate) conn: MultiplexedConnection,
    pub(crate) pool: PipelinePool,
    pub(crate) codecs: Mutex<CodecRegistry>,
    pub(crate) handlers: Mutex<HashMap<String, CommandEntry>>,
    /// Streams this element has published to; deleted on `close`.
    pub(crate) streams: Mutex<HashSet<String>>,
    /// Hint cursor on `response:<name>`, shared by all in-flight sends.
    pub(crate) response_last_id: Mutex<String>,
    /// Cursor on `command:<name>`; only the command loop advances it.
    pub(crate) command_last_id: Mutex<String>,
    /// SHA of the preloaded snapshot script; `None` if loading failed.
    pub(crate) reference_sha: Mutex<Option<String>>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl Element {
    /// Connect to the backing server and register `name` with the system.
    ///
    /// Fails if the server is unreachable. A failure to load the reference
    /// snapshot script is not fatal: the element stays usable for
    /// everything except `reference_create_from_stream`.
    pub async fn new(name: &str, config: ElementConfig) -> Result<Element> {
        let client =
            redis::Client::open(config.connection_info()).map_err(Error::Connect)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::Connect)?;
        let pool = PipelinePool::new(conn.clone(), config.pipeline_pool_size);

        // Discovery sentinels. Peers find this element by enumerating
        // response:* keys; the sentinel also seeds both read cursors.
        let mut pipe = pool.acquire().await;
        for key in [protocol::response_key(name), protocol::command_key(name)] {
            pipe.pipeline()
                .cmd("XADD")
                .arg(&key)
                .arg("MAXLEN")
                .arg("~")
                .arg(STREAM_LEN)
                .arg("*")
                .arg("language")
                .arg(LANG)
                .arg("version")
                .arg(protocol::VERSION);
        }
        let ids: Vec<String> = pipe.execute().await?;
        let (response_last_id, command_last_id) = match ids.as_slice() {
            [response_id, command_id] => (response_id.clone(), command_id.clone()),
            other => {
                return Err(Error::InvalidResponse(format!(
                    "expected two sentinel ids, got {:?}",
                    other
                )))
            }
        };
        drop(pipe);

        let (shutdown, _) = watch::channel(false);
        let element = Element {
            name: name.to_owned(),
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            client,
            conn,
            pool,
            codecs: Mutex::new(CodecRegistry::new()),
            handlers: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashSet::new()),
            response_last_id: Mutex::new(response_last_id),
            command_last_id: Mutex::new(command_last_id),
            reference_sha: Mutex::new(None),
            shutdown,
        };

        element.register_builtins();
        element.load_reference_script().await;
        element
            .try_log(LogLevel::Info, "Element initialized.")
            .await?;
        info!(element = %element.name, "element initialized");
        Ok(element)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS nodename captured at init, carried on log frames.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn register_builtins(&self) {
        let mut handlers = lock(&self.handlers);
        handlers.insert(
            VERSION_COMMAND.to_owned(),
            CommandEntry::builtin(CommandKind::Version),
        );
        handlers.insert(
            COMMAND_LIST_COMMAND.to_owned(),
            CommandEntry::builtin(CommandKind::CommandList),
        );
        // Default healthcheck: everything is fine unless overridden.
        let default_healthcheck: crate::commands::CommandFn =
            Arc::new(|_| Box::pin(async { Ok(Response::ok()) }));
        handlers.insert(
            HEALTHCHECK_COMMAND.to_owned(),
            CommandEntry::healthcheck(default_healthcheck),
        );
    }

    async fn load_reference_script(&self) {
        let mut pipe = self.pool.acquire().await;
        pipe.pipeline()
            .cmd("SCRIPT")
            .arg("LOAD")
            .arg(crate::reference::STREAM_REFERENCE_SCRIPT);
        match pipe.execute::<Vec<String>>().await {
            Ok(shas) if shas.len() == 1 => {
                *lock(&self.reference_sha) = shas.into_iter().next();
            }
            Ok(_) | Err(_) => {
                error!(element = %self.name, "failed to load the stream reference script");
                self.log(
                    LogLevel::Err,
                    "Failed to load the stream reference script.",
                    false,
                )
                .await;
            }
        }
    }

    /// Register a custom payload codec under `tag`.
    pub fn serialization_register(&self, tag: &str, codec: Arc<dyn Codec>) -> Result<()> {
        lock(&self.codecs).register(tag, codec)
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Names of every element currently registered with the server.
    pub async fn get_all_elements(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.keys(protocol::response_key("*")).await?;
        Ok(keys
            .iter()
            .filter_map(|k| protocol::element_from_response_key(k))
            .map(str::to_owned)
            .collect())
    }

    /// Stream keys owned by `element` (`"*"` for every element).
    pub async fn get_all_streams(&self, element: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.keys(protocol::stream_key(element, "*")).await?)
    }

    // -----------------------------------------------------------------------
    // Log publisher
    // -----------------------------------------------------------------------

    /// Append a frame to the shared `log` stream, optionally echoing `msg`
    /// to standard output. Fire-and-forget: transport failures after init
    /// are swallowed.
    pub async fn log(&self, level: LogLevel, msg: &str, stdout: bool) {
        if let Err(e) = self.try_log(level, msg).await {
            warn!(element = %self.name, error = %e, "log stream write failed");
        }
        if stdout {
            println!("{}", msg);
        }
    }

    pub(crate) async fn try_log(&self, level: LogLevel, msg: &str) -> Result<()> {
        let frame = LogFrame {
            element: self.name.clone(),
            host: self.host.clone(),
            level,
            msg: msg.to_owned(),
        };
        let mut pipe = self.pool.acquire().await;
        {
            let p = pipe
                .pipeline()
                .cmd("XADD")
                .arg(protocol::LOG_STREAM)
                .arg("MAXLEN")
                .arg("~")
                .arg(STREAM_LEN)
                .arg("*");
            for (field, value) in frame.to_fields() {
                p.arg(field).arg(value);
            }
        }
        pipe.execute::<Vec<String>>().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Version / health
    // -----------------------------------------------------------------------

    /// Ask `element` for its `{language, version}` pair.
    pub async fn get_element_version(&self, element: &str) -> Result<crate::commands::CommandResponse> {
        self.command_send(
            element,
            VERSION_COMMAND,
            Value::Nil,
            true,
            ACK_TIMEOUT_MS,
            SERIALIZATION_MSGPACK,
        )
        .await
    }

    /// True when `element` answers `version` and satisfies the language /
    /// minimum-version gates.
    pub async fn check_element_version(
        &self,
        element: &str,
        supported_languages: Option<&[&str]>,
        min_version: Option<f64>,
    ) -> Result<bool> {
        let response = self.get_element_version(element).await?;
        if response.err_code != code::NO_ERROR {
            return Ok(false);
        }
        let Some(Value::Map(entries)) = response.data else {
            return Ok(false);
        };
        let Some(language) = map_str(&entries, "language") else {
            return Ok(false);
        };
        let Some(version) = map_f64(&entries, "version") else {
            return Ok(false);
        };
        if let Some(languages) = supported_languages {
            if !languages.contains(&language) {
                return Ok(false);
            }
        }
        if let Some(min) = min_version {
            if version < min {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Every command exposed by `element` (or by all peers), each prefixed
    /// with the element name. Peers that predate `command_list` support are
    /// skipped.
    pub async fn get_all_commands(
        &self,
        element: Option<&str>,
        ignore_caller: bool,
    ) -> Result<Vec<String>> {
        let mut elements = match element {
            Some(name) => vec![name.to_owned()],
            None => self.get_all_elements().await?,
        };
        if ignore_caller {
            elements.retain(|e| e != &self.name);
        }

        let mut commands = Vec::new();
        for element in elements {
            if !self
                .check_element_version(&element, Some(&[LANG]), Some(0.3))
                .await?
            {
                continue;
            }
            let response = self
                .command_send(
                    &element,
                    COMMAND_LIST_COMMAND,
                    Value::Nil,
                    true,
                    ACK_TIMEOUT_MS,
                    SERIALIZATION_MSGPACK,
                )
                .await?;
            if let Some(Value::Array(names)) = response.data {
                commands.extend(
                    names
                        .iter()
                        .filter_map(Value::as_str)
                        .map(|cmd| format!("{}:{}", element, cmd)),
                );
            }
        }
        Ok(commands)
    }

    /// Block until every element in `elements` passes a healthcheck.
    ///
    /// Per round: peers that are unreachable or too old to support
    /// healthchecks fail the round in `strict` mode and are assumed healthy
    /// otherwise; reachable peers are probed with `healthcheck`. Sleeps
    /// `retry_interval` between rounds.
    pub async fn wait_for_elements_healthy(
        &self,
        elements: &[&str],
        retry_interval: Duration,
        strict: bool,
    ) -> Result<()> {
        loop {
            let mut all_healthy = true;
            for element in elements {
                if !self
                    .check_element_version(element, Some(&[LANG]), Some(0.2))
                    .await?
                {
                    if strict {
                        warn!(element = %element, "failed healthcheck, retrying");
                        self.log(
                            LogLevel::Warning,
                            &format!("Failed healthcheck on {}, retrying...", element),
                            false,
                        )
                        .await;
                        all_healthy = false;
                        break;
                    }
                    continue;
                }

                let response = self
                    .command_send(
                        element,
                        HEALTHCHECK_COMMAND,
                        Value::Nil,
                        true,
                        ACK_TIMEOUT_MS,
                        SERIALIZATION_NONE,
                    )
                    .await?;
                if response.err_code != code::NO_ERROR {
                    warn!(element = %element, "failed healthcheck, retrying");
                    self.log(
                        LogLevel::Warning,
                        &format!("Failed healthcheck on {}, retrying...", element),
                        false,
                    )
                    .await;
                    all_healthy = false;
                    break;
                }
            }
            if all_healthy {
                return Ok(());
            }
            tokio::time::sleep(retry_interval).await;
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Stop the command loop and delete every key this element owns: its
    /// published streams, its command stream, and its response stream.
    pub async fn close(&self) -> Result<()> {
        self.command_loop_shutdown();

        let published: Vec<String> = lock(&self.streams).drain().collect();
        let mut conn = self.conn.clone();
        for stream in published {
            let _: i64 = conn.del(protocol::stream_key(&self.name, &stream)).await?;
        }
        let _: i64 = conn.del(protocol::response_key(&self.name)).await?;
        let _: i64 = conn.del(protocol::command_key(&self.name)).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal plumbing shared by the engines
    // -----------------------------------------------------------------------

    /// A fresh connection for loops that issue blocking reads; a blocked
    /// read would stall every user of the shared connection.
    pub(crate) async fn dedicated_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Server wall clock in milliseconds, used to seed read cursors so
    /// only future entries are delivered.
    pub(crate) async fn redis_time_ms(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let (secs, usecs): (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1000 + usecs / 1000)
    }

    pub(crate) fn codec_for(
        &self,
        tag: &str,
    ) -> Result<Arc<dyn Codec>> {
        lock(&self.codecs).get(tag)
    }

    /// The decode tag for a payload: the caller's tag under `force`,
    /// otherwise the tag embedded next to the payload when present.
    pub(crate) fn effective_tag<'a>(
        &self,
        embedded: Option<&'a str>,
        caller: &'a str,
        force: bool,
    ) -> &'a str {
        if force {
            caller
        } else {
            embedded.unwrap_or(caller)
        }
    }
}

fn map_lookup<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn map_str<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a str> {
    map_lookup(entries, key)?.as_str()
}

fn map_f64(entries: &[(Value, Value)], key: &str) -> Option<f64> {
    map_lookup(entries, key)?.as_f64()
}
