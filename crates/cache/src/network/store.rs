//! Network storage backend
//!
//! A record lives under two server keys. The metadata fields sit in a hash at
//! `KeyValue:<prefix>:<key>`; the value, deflated and base64-encoded, sits in
//! a string at `<that>:value`, written in chunks. Both carry the record's
//! expiry, and every write replaces both inside one transaction.

use super::codec;
use crate::clock::{Clock, SystemClock};
use crate::config::NetworkSettings;
use crate::envelope::{CreationSite, Envelope, Provenance, RawEnvelope};
use crate::key::CacheKey;
use crate::metrics::{Timed, TimingCollector};
use crate::prefix::{effective_prefix, sha256_hex};
use crate::storage::Storage;
use crate::wire::{format_error, Command, Reply, WireClient, EMPTY_PLACEHOLDER};
use kvcache_core::{
    Error, Result, TransactionPhase, CLEAR_BATCH_SIZE, KEY_NAMESPACE, LOCK_NAME_PREFIX,
    PAYLOAD_KEY_SUFFIX,
};
use kvcache_utils::{FileLockManager, KeyLock, LockManager};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const COMPONENT: &str = "NetworkStore";

// Protocol and transaction codes, one per call site
const CODE_BEGIN: u16 = 5;
const CODE_QUEUE_METADATA: u16 = 6;
const CODE_QUEUE_EXPIRY: u16 = 7;
const CODE_COMMIT: u16 = 8;
const CODE_DELETE: u16 = 9;
const CODE_TTL: u16 = 10;
const CODE_HGETALL: u16 = 11;
const CODE_HGETALL_FIELD: u16 = 12;
const CODE_REFRESH_BEGIN: u16 = 13;
const CODE_REFRESH_EXPIRY: u16 = 14;
const CODE_REFRESH_PAYLOAD_EXPIRY: u16 = 15;
const CODE_REFRESH_COMMIT: u16 = 16;
const CODE_QUEUE_PAYLOAD: u16 = 17;
const CODE_QUEUE_PAYLOAD_EXPIRY: u16 = 18;
const CODE_GET_PAYLOAD: u16 = 19;
const CODE_CLEAR_KEYS: u16 = 20;
const CODE_CLEAR_DELETE: u16 = 21;
const CODE_DISCARD: u16 = 22;

// Metadata hash fields
const FIELD_KEY: &str = "key";
const FIELD_TIME_CREATE: &str = "time_create";
const FIELD_ORIGIN_HOST: &str = "origin_host";
const FIELD_CREATION_FILE: &str = "creation_file";
const FIELD_CREATION_LINE: &str = "creation_line";
const FIELD_CREATION_PID: &str = "creation_pid";

/// Escape the glob metacharacters of a key pattern
fn glob_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Seconds since the epoch, rounded up, as sent with `EXPIREAT`
fn expire_at(time_expires: f64) -> i64 {
    time_expires.ceil() as i64
}

/// Stores records on a server speaking the inline protocol
pub struct NetworkStore {
    client: Mutex<WireClient>,
    prefix: String,
    chunk_size: usize,
    locks: Arc<dyn LockManager>,
    clock: Arc<dyn Clock>,
    provenance: Provenance,
    timings: Option<Arc<TimingCollector>>,
}

impl std::fmt::Debug for NetworkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkStore")
            .field("endpoint", &self.client.lock().endpoint())
            .field("prefix", &self.prefix)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl NetworkStore {
    /// Build a store from validated settings
    ///
    /// The connection is opened by the first operation.
    pub fn new(settings: NetworkSettings) -> Result<Self> {
        settings.validate()?;
        let locks: Arc<dyn LockManager> =
            Arc::new(FileLockManager::new(settings.common.resolved_lock_folder()));

        Ok(Self {
            client: Mutex::new(WireClient::from_settings(&settings)),
            prefix: effective_prefix(&settings.common),
            chunk_size: settings.chunk_size,
            locks,
            clock: Arc::new(SystemClock),
            provenance: Provenance::current(settings.common.environment.host.clone()),
            timings: None,
        })
    }

    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timings(mut self, timings: Arc<TimingCollector>) -> Self {
        self.timings = Some(timings);
        self
    }

    /// Server key of the metadata hash of `key`
    pub fn full_key_name(&self, key: &CacheKey) -> String {
        format!("{KEY_NAMESPACE}:{}:{}", self.prefix, key)
    }

    /// Server key of the payload string of `key`
    pub fn payload_key_name(&self, key: &CacheKey) -> String {
        format!("{}{PAYLOAD_KEY_SUFFIX}", self.full_key_name(key))
    }

    /// Lock name guarding `key`
    pub fn lock_name(&self, key: &CacheKey) -> String {
        format!("{LOCK_NAME_PREFIX}{}", sha256_hex(&self.full_key_name(key)))
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub fn is_connected(&self) -> bool {
        self.client.lock().is_connected()
    }

    /// Move the expiry of a live record to `ttl` from now without rewriting it
    ///
    /// Unlike [`Storage::set_expiry_time`] the creation time is kept. Returns
    /// `false` when the key is absent.
    pub fn refresh_expiry(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        key.validate()?;
        let _timed = self.timed("refresh_expiry");
        let full = self.full_key_name(key);
        let payload = self.payload_key_name(key);
        let expires = expire_at(self.clock.now() + ttl.as_secs_f64());

        self.with_key_lock(key, |client| {
            if remaining_ttl(client, &full)?.is_none() {
                return Ok(false);
            }
            begin(client, TransactionPhase::Refresh, CODE_REFRESH_BEGIN)?;
            queue(
                client,
                &Command::new("expireat").arg(&full).arg(expires.to_string()),
                TransactionPhase::Refresh,
                CODE_REFRESH_EXPIRY,
            )?;
            queue(
                client,
                &Command::new("expireat").arg(&payload).arg(expires.to_string()),
                TransactionPhase::Refresh,
                CODE_REFRESH_PAYLOAD_EXPIRY,
            )?;
            commit(client, TransactionPhase::Refresh, CODE_REFRESH_COMMIT)?;
            debug!(key = %key, expires, "expiry refreshed");
            Ok(true)
        })
    }

    fn timed(&self, action: &'static str) -> Timed<'_> {
        Timed::start(self.timings.as_ref(), COMPONENT, action)
    }

    /// Run `exchange` under the lock of `key`, releasing it on every path
    fn with_key_lock<T>(
        &self,
        key: &CacheKey,
        exchange: impl FnOnce(&mut WireClient) -> Result<T>,
    ) -> Result<T> {
        let lock = KeyLock::acquire(self.locks.as_ref(), &self.lock_name(key))?;
        let result = exchange(&mut *self.client.lock());
        let released = lock.release();
        let value = result?;
        released?;
        Ok(value)
    }

    fn read_record(
        &self,
        client: &mut WireClient,
        key: &CacheKey,
    ) -> Result<Option<RawEnvelope>> {
        let full = self.full_key_name(key);
        let Some(fields) = fetch_metadata(client, &full)? else {
            debug!(key = %key, "record missing");
            return Ok(None);
        };
        let Some(remaining) = remaining_ttl(client, &full)? else {
            debug!(key = %key, "record has no expiry");
            return Ok(None);
        };
        let value = fetch_payload(client, &self.payload_key_name(key))?;

        let time_expires = self.clock.now().floor() + remaining as f64;
        let time_create = match fields.get(FIELD_TIME_CREATE).map(|t| t.parse::<f64>()) {
            Some(Ok(time_create)) => time_create,
            _ => {
                warn!(key = %key, "record has no readable creation time");
                0.0
            }
        };
        let creation_site = match (
            fields.get(FIELD_CREATION_FILE),
            fields.get(FIELD_CREATION_LINE).and_then(|l| l.parse::<u32>().ok()),
        ) {
            (Some(file), Some(line)) if !file.is_empty() => Some(CreationSite::new(file, line)),
            _ => None,
        };

        Ok(Some(Envelope {
            key: key.clone(),
            value,
            time_create,
            time_expires,
            origin_host: fields
                .get(FIELD_ORIGIN_HOST)
                .filter(|host| !host.is_empty())
                .cloned(),
            creation_site,
            creation_pid: fields
                .get(FIELD_CREATION_PID)
                .and_then(|pid| pid.parse().ok()),
        }))
    }

    fn write_record(&self, client: &mut WireClient, record: &RawEnvelope) -> Result<()> {
        let full = self.full_key_name(&record.key);
        let payload = self.payload_key_name(&record.key);
        let expires = expire_at(record.time_expires).to_string();

        // Encode first so a failure leaves no transaction open
        let encoded = match &record.value {
            Some(serialized) => Some(
                codec::encode(serialized)
                    .map_err(|e| Error::serialization("encode payload", e.to_string()))?,
            ),
            None => None,
        };

        begin(client, TransactionPhase::Begin, CODE_BEGIN)?;
        queue(
            client,
            &metadata_command(&full, record),
            TransactionPhase::QueueMetadata,
            CODE_QUEUE_METADATA,
        )?;
        queue(
            client,
            &Command::new("expireat").arg(&full).arg(&expires),
            TransactionPhase::QueueExpiry,
            CODE_QUEUE_EXPIRY,
        )?;
        match &encoded {
            Some(encoded) => {
                let pieces = codec::chunks(encoded, self.chunk_size);
                for (index, piece) in pieces.iter().enumerate() {
                    let verb = if index == 0 { "set" } else { "append" };
                    queue(
                        client,
                        &Command::new(verb).arg(&payload).quoted(piece),
                        TransactionPhase::QueuePayload,
                        CODE_QUEUE_PAYLOAD,
                    )?;
                }
            }
            None => queue(
                client,
                &Command::new("del").arg(&payload),
                TransactionPhase::QueuePayload,
                CODE_QUEUE_PAYLOAD,
            )?,
        }
        queue(
            client,
            &Command::new("expireat").arg(&payload).arg(&expires),
            TransactionPhase::QueuePayloadExpiry,
            CODE_QUEUE_PAYLOAD_EXPIRY,
        )?;
        commit(client, TransactionPhase::Commit, CODE_COMMIT)
    }
}

/// `hmset` of every metadata field except the value and the expiry
fn metadata_command(full: &str, record: &RawEnvelope) -> Command {
    let (file, line) = match &record.creation_site {
        Some(site) => (site.file.clone(), site.line.to_string()),
        None => (String::new(), String::new()),
    };
    let fields = [
        (FIELD_KEY, record.key.to_string()),
        (FIELD_TIME_CREATE, record.time_create.to_string()),
        (FIELD_ORIGIN_HOST, record.origin_host.clone().unwrap_or_default()),
        (FIELD_CREATION_FILE, file),
        (FIELD_CREATION_LINE, line),
        (
            FIELD_CREATION_PID,
            record.creation_pid.map(|pid| pid.to_string()).unwrap_or_default(),
        ),
    ];
    fields
        .iter()
        .fold(Command::new("hmset").arg(full), |command, (field, value)| {
            command.arg(field).quoted(value)
        })
}

/// All metadata fields of `full`, or `None` when the hash does not exist
fn fetch_metadata(
    client: &mut WireClient,
    full: &str,
) -> Result<Option<HashMap<String, String>>> {
    let reply = client.call(&Command::new("hgetall").arg(full), CODE_HGETALL, "hgetall")?;
    let items = match reply {
        Reply::Array(items) if items.is_empty() => return Ok(None),
        Reply::Array(items) => items,
        other => {
            return Err(Error::protocol(
                CODE_HGETALL,
                "hgetall",
                format_error("server sent malformed response", &other.describe()),
            ))
        }
    };
    if items.len() % 2 != 0 {
        return Err(Error::protocol(
            CODE_HGETALL_FIELD,
            "hgetall",
            format!("odd number of hash elements: {}", items.len()),
        ));
    }

    let mut fields = HashMap::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(name), Some(value)) = (items.next(), items.next()) {
        let (Reply::Bulk(Some(name)), Reply::Bulk(Some(value))) = (name, value) else {
            return Err(Error::protocol(
                CODE_HGETALL_FIELD,
                "hgetall",
                "hash element is not a bulk string",
            ));
        };
        let value = String::from_utf8_lossy(&value).into_owned();
        let value = if value == EMPTY_PLACEHOLDER {
            String::new()
        } else {
            value
        };
        fields.insert(String::from_utf8_lossy(&name).into_owned(), value);
    }
    Ok(Some(fields))
}

/// Remaining lifetime of `name` in whole seconds
///
/// A missing key, a key without expiry and an unreadable reply all read as
/// `None`.
fn remaining_ttl(client: &mut WireClient, name: &str) -> Result<Option<i64>> {
    match client.call(&Command::new("ttl").arg(name), CODE_TTL, "ttl") {
        Ok(Reply::Integer(seconds)) if seconds >= 0 => Ok(Some(seconds)),
        Ok(other) => {
            debug!(reply = %other.describe(), "no usable ttl");
            Ok(None)
        }
        Err(e @ Error::Protocol { .. }) => {
            warn!(error = %e, "unreadable ttl reply");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Payload bytes of `name`, decoded back to the serialized value
///
/// Anything short of a decodable bulk string yields `None`.
fn fetch_payload(client: &mut WireClient, name: &str) -> Result<Option<Vec<u8>>> {
    let reply = match client.call(&Command::new("get").arg(name), CODE_GET_PAYLOAD, "get") {
        Ok(reply) => reply,
        Err(e @ Error::Protocol { .. }) => {
            warn!(error = %e, "unreadable payload reply");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    match reply {
        Reply::Bulk(Some(encoded)) => match codec::decode(&encoded) {
            Ok(serialized) => Ok(Some(serialized)),
            Err(e) => {
                warn!(key = name, error = %e, "payload does not decode");
                Ok(None)
            }
        },
        other => {
            debug!(key = name, reply = %other.describe(), "payload missing");
            Ok(None)
        }
    }
}

fn begin(client: &mut WireClient, phase: TransactionPhase, code: u16) -> Result<()> {
    let reply = client.call(&Command::new("multi"), code, "multi")?;
    if reply.is_ok() {
        Ok(())
    } else {
        Err(Error::transaction(
            phase,
            code,
            format_error("can not start transaction", &reply.describe()),
        ))
    }
}

/// Queue one command; anything but an acknowledgement aborts the transaction
fn queue(
    client: &mut WireClient,
    command: &Command,
    phase: TransactionPhase,
    code: u16,
) -> Result<()> {
    match client.call(command, code, command.name()) {
        Ok(reply) if reply.is_ack() => Ok(()),
        Ok(reply) => {
            abort(client);
            Err(Error::transaction(
                phase,
                code,
                format_error(&format!("can not queue {}", command.name()), &reply.describe()),
            ))
        }
        Err(e @ Error::Protocol { .. }) => {
            abort(client);
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Execute the transaction; every command must have succeeded
fn commit(client: &mut WireClient, phase: TransactionPhase, code: u16) -> Result<()> {
    let reply = client.call(&Command::new("exec"), code, "exec")?;
    let committed = match &reply {
        Reply::Array(results) => results
            .iter()
            .all(|result| result.is_ok() || matches!(result, Reply::Integer(_))),
        _ => false,
    };
    if committed {
        Ok(())
    } else {
        Err(Error::transaction(
            phase,
            code,
            format_error("can not commit transaction", &reply.describe()),
        ))
    }
}

/// Discard the open transaction, ignoring the outcome
fn abort(client: &mut WireClient) {
    if let Err(e) = client.call(&Command::new("discard"), CODE_DISCARD, "discard") {
        warn!(error = %e, "failed to discard transaction");
    }
}

fn expect_deleted(reply: Reply, code: u16, message: &str) -> Result<()> {
    match reply {
        Reply::Integer(_) => Ok(()),
        other => Err(Error::protocol(
            code,
            "del",
            format_error(message, &other.describe()),
        )),
    }
}

impl Storage for NetworkStore {
    fn fetch_record(&self, key: &CacheKey) -> Result<Option<RawEnvelope>> {
        let _timed = self.timed("get_full");
        self.with_key_lock(key, |client| self.read_record(client, key))
    }

    /// Asks the server for the remaining seconds only; an unusable reply
    /// reads as `None`
    fn expiry_time(&self, key: &CacheKey) -> Result<Option<f64>> {
        key.validate()?;
        let _timed = self.timed("expiry_time");
        let full = self.full_key_name(key);
        let remaining = self.with_key_lock(key, |client| remaining_ttl(client, &full))?;
        Ok(remaining.map(|seconds| self.clock.now().floor() + seconds as f64))
    }

    fn store_record(&self, record: &RawEnvelope) -> Result<()> {
        let _timed = self.timed("set_value");
        self.with_key_lock(&record.key, |client| self.write_record(client, record))?;
        debug!(key = %record.key, "record written");
        Ok(())
    }

    fn remove_record(&self, key: &CacheKey) -> Result<()> {
        let _timed = self.timed("delete_value");
        let names = [self.full_key_name(key), self.payload_key_name(key)];
        self.with_key_lock(key, |client| {
            for name in &names {
                let reply = client.call(&Command::new("del").arg(name), CODE_DELETE, "del")?;
                expect_deleted(reply, CODE_DELETE, "can not delete key")?;
            }
            Ok(())
        })?;
        debug!(key = %key, "record removed");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let _timed = self.timed("clear");
        let pattern = format!("{KEY_NAMESPACE}:{}:*", glob_escape(&self.prefix));
        let mut client = self.client.lock();

        let reply = client.call(&Command::new("keys").arg(&pattern), CODE_CLEAR_KEYS, "keys")?;
        let names = match reply {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(Some(name)) => Ok(String::from_utf8_lossy(&name).into_owned()),
                    other => Err(Error::protocol(
                        CODE_CLEAR_KEYS,
                        "keys",
                        format!("key name is not a bulk string: {}", other.describe()),
                    )),
                })
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(Error::protocol(
                    CODE_CLEAR_KEYS,
                    "keys",
                    format_error("can not list keys", &other.describe()),
                ))
            }
        };

        for batch in names.chunks(CLEAR_BATCH_SIZE) {
            let reply = client.call(&Command::new("del").args(batch), CODE_CLEAR_DELETE, "del")?;
            expect_deleted(reply, CODE_CLEAR_DELETE, "can not delete keys while clearing")?;
        }
        debug!(pattern = %pattern, removed = names.len(), "cleared keys");
        Ok(())
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn provenance(&self) -> &Provenance {
        &self.provenance
    }
}
