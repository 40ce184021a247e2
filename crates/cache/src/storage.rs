//! The storage contract shared by every backend
//!
//! A backend implements the four medium operations of [`Storage`]; expiry
//! checks, key validation and the typed surface are layered on top here, so
//! both backends behave identically to readers:
//!
//! - a record is visible only while `now < time_expires`, and an expired
//!   record reads exactly like a missing one
//! - every public entry point rejects invalid keys before touching the medium
//! - read-path decode failures become "absent" or a `None` value, while write
//!   and delete failures propagate
//! - [`StorageExt::set`] is the only entry point that turns a write error
//!   into `false`

use crate::clock::Clock;
use crate::envelope::{CreationSite, Envelope, Provenance, RawEnvelope};
use crate::key::CacheKey;
use kvcache_core::{Result, DEFAULT_TTL_SECS};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

/// A medium that stores envelopes under keys
///
/// Implementors take the per-key lock inside each medium operation and
/// release it on every exit path. The medium operations see keys that were
/// already validated.
pub trait Storage: Send + Sync {
    /// Read the record for `key`, whether or not it has expired
    fn fetch_record(&self, key: &CacheKey) -> Result<Option<RawEnvelope>>;

    /// Write `record`, fully replacing any previous record for its key
    fn store_record(&self, record: &RawEnvelope) -> Result<()>;

    /// Remove the record for `key`; a missing record is not an error
    fn remove_record(&self, key: &CacheKey) -> Result<()>;

    /// Remove every record under this instance's namespace prefix
    fn clear(&self) -> Result<()>;

    /// Namespace prefix keeping this instance's records apart
    fn prefix(&self) -> &str;

    fn clock(&self) -> &dyn Clock;

    /// Identity stamped on records written by this instance
    fn provenance(&self) -> &Provenance;

    /// Live record for `key` with its payload still serialized
    fn get_full_raw(&self, key: &CacheKey) -> Result<Option<RawEnvelope>> {
        key.validate()?;
        let record = self.fetch_record(key)?;
        let now = self.clock().now();
        Ok(record.filter(|record| record.is_live(now)))
    }

    /// Whether a live record exists for `key`
    fn has(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get_full_raw(key)?.is_some())
    }

    /// Alias of [`Storage::has`]
    fn exists(&self, key: &CacheKey) -> Result<bool> {
        self.has(key)
    }

    /// Expiry timestamp of the live record for `key`
    fn expiry_time(&self, key: &CacheKey) -> Result<Option<f64>> {
        Ok(self.get_full_raw(key)?.map(|record| record.time_expires))
    }

    /// Creation timestamp of the live record for `key`
    fn change_time(&self, key: &CacheKey) -> Result<Option<f64>> {
        Ok(self.get_full_raw(key)?.map(|record| record.time_create))
    }

    /// Rewrite the live record for `key` with the same value and a new TTL
    /// counted from now; does nothing when the key is absent
    fn set_expiry_time(&self, key: &CacheKey, ttl: Duration) -> Result<()> {
        let Some(record) = self.get_full_raw(key)? else {
            return Ok(());
        };
        let now = self.clock().now();
        let provenance = self.provenance();
        let record = Envelope {
            origin_host: provenance.origin_host.clone(),
            creation_pid: provenance.creation_pid,
            ..record.with_times(now, now + ttl.as_secs_f64())
        };
        self.store_record(&record)
    }

    /// Remove the record for `key`
    fn delete_value(&self, key: &CacheKey) -> Result<()> {
        key.validate()?;
        self.remove_record(key)
    }

    /// Cache-surface name of [`Storage::delete_value`]
    fn delete(&self, key: &CacheKey) -> Result<()> {
        self.delete_value(key)
    }

    /// Delete every key in `keys`, stopping at the first failure
    fn delete_multiple(&self, keys: &[CacheKey]) -> Result<()> {
        keys.iter().try_for_each(|key| self.delete_value(key))
    }
}

/// Typed operations over any [`Storage`]
pub trait StorageExt: Storage {
    /// Live envelope for `key` with its value decoded into `V`
    fn get_full<V: DeserializeOwned>(
        &self,
        key: impl Into<CacheKey>,
    ) -> Result<Option<Envelope<V>>> {
        let key = key.into();
        Ok(self.get_full_raw(&key)?.map(RawEnvelope::decode))
    }

    /// Stored value, or `default` when the key is absent, expired or its
    /// value can not be decoded
    fn get_value<V: DeserializeOwned>(&self, key: impl Into<CacheKey>, default: V) -> Result<V> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Stored value if present
    fn get<V: DeserializeOwned>(&self, key: impl Into<CacheKey>) -> Result<Option<V>> {
        Ok(self.get_full::<V>(key)?.and_then(|envelope| envelope.value))
    }

    /// Store `value` under `key` for `ttl`, recording the caller's location
    #[track_caller]
    fn set_value<V: Serialize>(
        &self,
        key: impl Into<CacheKey>,
        value: &V,
        ttl: Duration,
    ) -> Result<()> {
        self.set_value_at(key, value, ttl, Some(CreationSite::caller()))
    }

    /// Store `value` under `key` for `ttl` with an explicit creation site
    fn set_value_at<V: Serialize>(
        &self,
        key: impl Into<CacheKey>,
        value: &V,
        ttl: Duration,
        creation_site: Option<CreationSite>,
    ) -> Result<()> {
        let key = key.into();
        key.validate()?;
        let now = self.clock().now();
        let record = RawEnvelope::encode(
            key,
            value,
            now,
            now + ttl.as_secs_f64(),
            self.provenance(),
            creation_site,
        )?;
        self.store_record(&record)
    }

    /// Store `value`, reporting write failures as `false`
    ///
    /// A missing `ttl` means ten years. Invalid keys are still an error.
    #[track_caller]
    fn set<V: Serialize>(
        &self,
        key: impl Into<CacheKey>,
        value: &V,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let key = key.into();
        key.validate()?;
        let ttl = ttl.unwrap_or_else(|| Duration::from_secs_f64(DEFAULT_TTL_SECS));
        match self.set_value_at(key.clone(), value, ttl, Some(CreationSite::caller())) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(key = %key, error = %e, category = e.category(), "set failed");
                Ok(false)
            }
        }
    }

    /// Value or `default` for each key, in input order
    fn get_multiple<V, K, I>(&self, keys: I, default: V) -> Result<Vec<(CacheKey, V)>>
    where
        V: DeserializeOwned + Clone,
        K: Into<CacheKey>,
        I: IntoIterator<Item = K>,
    {
        keys.into_iter()
            .map(|key| {
                let key = key.into();
                let value = self.get_value(key.clone(), default.clone())?;
                Ok((key, value))
            })
            .collect()
    }

    /// [`StorageExt::set`] for every entry; `false` if any write failed
    #[track_caller]
    fn set_multiple<V, K, I>(&self, entries: I, ttl: Option<Duration>) -> Result<bool>
    where
        V: Serialize,
        K: Into<CacheKey>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut all_stored = true;
        for (key, value) in entries {
            if !self.set(key, &value, ttl)? {
                all_stored = false;
            }
        }
        Ok(all_stored)
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}
