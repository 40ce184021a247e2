//! The stored record: a value wrapped with creation/expiry timestamps and
//! provenance.
//!
//! Backends move [`RawEnvelope`]s, whose payload is the JSON serialization of
//! the caller's value. Typed decoding happens in [`crate::storage`].

use crate::key::CacheKey;
use kvcache_core::{Error, Result, ENVELOPE_FORMAT_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::panic::Location;

/// A value with its timestamps and provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<V> {
    pub key: CacheKey,
    /// `None` when the stored payload could not be decoded
    pub value: Option<V>,
    /// Seconds since the epoch
    pub time_create: f64,
    /// Seconds since the epoch, never before `time_create`
    pub time_expires: f64,
    pub origin_host: Option<String>,
    pub creation_site: Option<CreationSite>,
    pub creation_pid: Option<u32>,
}

/// Envelope whose payload is still serialized
pub type RawEnvelope = Envelope<Vec<u8>>;

/// Source location that created a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationSite {
    pub file: String,
    pub line: u32,
}

impl CreationSite {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Location of the code calling this function
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self::new(location.file(), location.line())
    }
}

/// Host and process identity stamped on every record a backend writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub origin_host: Option<String>,
    pub creation_pid: Option<u32>,
}

impl Provenance {
    /// Identity of the current process on `host`
    pub fn current(host: Option<String>) -> Self {
        Self {
            origin_host: host.filter(|h| !h.is_empty()),
            creation_pid: Some(std::process::id()),
        }
    }
}

impl<V> Envelope<V> {
    /// Whether the record is still visible at `now`
    pub fn is_live(&self, now: f64) -> bool {
        now < self.time_expires
    }

    /// Same record with different timestamps, replacing nothing else
    pub fn with_times(mut self, time_create: f64, time_expires: f64) -> Self {
        self.time_create = time_create;
        self.time_expires = time_expires;
        self
    }

    fn map_value<U>(self, value: Option<U>) -> Envelope<U> {
        Envelope {
            key: self.key,
            value,
            time_create: self.time_create,
            time_expires: self.time_expires,
            origin_host: self.origin_host,
            creation_site: self.creation_site,
            creation_pid: self.creation_pid,
        }
    }
}

impl RawEnvelope {
    /// Build a record for `value`, serializing it
    ///
    /// Finite floats come back bit-exact. NaN and the infinities are written
    /// as `null`, so a plain float read back from such a record decodes to
    /// `None`.
    pub fn encode<V: Serialize>(
        key: CacheKey,
        value: &V,
        time_create: f64,
        time_expires: f64,
        provenance: &Provenance,
        creation_site: Option<CreationSite>,
    ) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Envelope {
            key,
            value: Some(payload),
            time_create,
            time_expires,
            origin_host: provenance.origin_host.clone(),
            creation_site,
            creation_pid: provenance.creation_pid,
        })
    }

    /// Decode the payload into `V`; an undecodable payload becomes `None`
    pub fn decode<V: DeserializeOwned>(self) -> Envelope<V> {
        let value = match self.value.as_deref().map(serde_json::from_slice::<V>) {
            Some(Ok(value)) => Some(value),
            Some(Err(e)) => {
                tracing::warn!(key = %self.key, error = %e, "stored payload does not decode");
                None
            }
            None => None,
        };
        self.map_value(value)
    }

    /// Frame the record for storage on disk
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(&(ENVELOPE_FORMAT_VERSION, self)).map_err(Error::from)
    }

    /// Parse a record framed by [`RawEnvelope::to_bytes`]; corrupt bytes or a
    /// foreign format version read as absent
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bincode::deserialize::<(u16, RawEnvelope)>(bytes) {
            Ok((ENVELOPE_FORMAT_VERSION, envelope)) => Some(envelope),
            Ok((version, _)) => {
                tracing::debug!(version, "ignoring record with foreign format version");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "ignoring corrupt record");
                None
            }
        }
    }
}
