//! On-disk naming of records: shard folders, file names and lock names

use crate::key::CacheKey;
use crate::prefix::sha256_hex;
use kvcache_core::{
    Error, Result, FILE_EXTENSION, FILE_NAME_PREFIX, LOCK_NAME_PREFIX, SHARD_FANOUT,
};
use regex::Regex;
use sha2::{Digest, Sha512};
use std::path::{Path, PathBuf};

/// Lowercase hex SHA-512 digest of the key text
pub fn key_digest(key: &CacheKey) -> String {
    let mut hasher = Sha512::new();
    hasher.update(key.as_text().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Name of one shard level, `00` through `ff`
pub(crate) fn shard_name(index: usize) -> String {
    format!("{index:02x}")
}

/// Derives every path of one file backend instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPaths {
    folder: PathBuf,
    multi_folder: bool,
    prefix: String,
}

impl RecordPaths {
    pub fn new(folder: impl Into<PathBuf>, multi_folder: bool, prefix: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            multi_folder,
            prefix: prefix.into(),
        }
    }

    /// Root folder
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn is_sharded(&self) -> bool {
        self.multi_folder
    }

    /// Folder holding the record of `key`
    pub fn shard_folder(&self, key: &CacheKey) -> PathBuf {
        if !self.multi_folder {
            return self.folder.clone();
        }
        let digest = key_digest(key);
        self.folder.join(&digest[0..2]).join(&digest[2..4])
    }

    /// Full path of the record of `key`
    pub fn filename(&self, key: &CacheKey) -> PathBuf {
        self.shard_folder(key).join(format!(
            "{FILE_NAME_PREFIX}{}{}.{FILE_EXTENSION}",
            self.prefix,
            key_digest(key)
        ))
    }

    /// Lock name guarding the record of `key`
    pub fn lock_name(&self, key: &CacheKey) -> String {
        let filename = self.filename(key);
        format!(
            "{LOCK_NAME_PREFIX}{}",
            sha256_hex(&filename.to_string_lossy())
        )
    }

    /// Pattern matching the file names of this instance's records and nothing
    /// written under another prefix
    pub fn record_pattern(&self) -> Result<Regex> {
        let pattern = format!(
            r"^{}{}[a-f0-9]{{128}}\.{}$",
            regex::escape(FILE_NAME_PREFIX),
            regex::escape(&self.prefix),
            regex::escape(FILE_EXTENSION)
        );
        Regex::new(&pattern)
            .map_err(|e| Error::configuration(format!("prefix does not form a valid pattern: {e}")))
    }

    /// Every shard folder a sharded layout can use, in order
    pub fn all_shard_folders(&self) -> impl Iterator<Item = PathBuf> + '_ {
        (0..SHARD_FANOUT).flat_map(move |first| {
            let level_one = self.folder.join(shard_name(first));
            (0..SHARD_FANOUT).map(move |second| level_one.join(shard_name(second)))
        })
    }
}
