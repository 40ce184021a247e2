//! Backend settings with documented defaults and validation
//!
//! Settings are immutable once a backend is built from them. Every field
//! has a default, so a settings value can be written by hand, built with the
//! `with_*` helpers, or deserialized from JSON.

use kvcache_core::{
    Error, Result, DEFAULT_NETWORK_DATABASE, DEFAULT_NETWORK_HOST, DEFAULT_NETWORK_PORT,
    DEFAULT_NETWORK_TIMEOUT_SECS, DEFAULT_PAYLOAD_CHUNK_SIZE,
};
use kvcache_utils::XdgPaths;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Namespace breadth the key prefix is derived from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionScope {
    /// Only in the context of the current host name
    #[default]
    Domain,
    /// Shared by everything on the machine
    Server,
    /// Shared by hosts served from the same document root
    Folder,
}

/// Where file-backed data lives by default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Temporary,
    Persistent,
}

impl TryFrom<u8> for RegionScope {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Domain),
            1 => Ok(Self::Server),
            2 => Ok(Self::Folder),
            other => Err(Error::configuration(format!(
                "region type can not be equal {other}"
            ))),
        }
    }
}

impl FromStr for RegionScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "domain" => Ok(Self::Domain),
            "server" => Ok(Self::Server),
            "folder" => Ok(Self::Folder),
            other => match other.parse::<u8>() {
                Ok(code) => Self::try_from(code),
                Err(_) => Err(Error::configuration(format!(
                    "unknown region type '{other}'"
                ))),
            },
        }
    }
}

impl fmt::Display for RegionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Domain => "domain",
            Self::Server => "server",
            Self::Folder => "folder",
        })
    }
}

impl TryFrom<u8> for StorageTier {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Temporary),
            1 => Ok(Self::Persistent),
            other => Err(Error::configuration(format!(
                "storage type can not be equal {other}"
            ))),
        }
    }
}

impl FromStr for StorageTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "temporary" => Ok(Self::Temporary),
            "persistent" => Ok(Self::Persistent),
            other => match other.parse::<u8>() {
                Ok(code) => Self::try_from(code),
                Err(_) => Err(Error::configuration(format!(
                    "unknown storage type '{other}'"
                ))),
            },
        }
    }
}

/// Host identity used for prefix derivation and record provenance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostEnvironment {
    /// Host name the cache is used for, possibly with `www.` and a port
    pub host: Option<String>,
    /// Document root the host is served from
    pub document_root: Option<String>,
}

impl HostEnvironment {
    pub fn new(host: impl Into<String>, document_root: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            document_root: Some(document_root.into()),
        }
    }
}

/// Settings shared by both backends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonSettings {
    /// Defaults to [`RegionScope::Domain`]
    pub region: RegionScope,
    /// Defaults per backend: temporary for files, persistent for network
    pub tier: Option<StorageTier>,
    /// Explicit namespace prefix; skips derivation from `region`
    pub prefix: Option<String>,
    pub environment: HostEnvironment,
    /// Folder for lock files; defaults to `<temp>/kvcache-locks`
    pub lock_folder: Option<PathBuf>,
}

impl CommonSettings {
    /// Lock folder after defaults
    pub fn resolved_lock_folder(&self) -> PathBuf {
        self.lock_folder.clone().unwrap_or_else(XdgPaths::lock_dir)
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(json: &str, what: &str) -> Result<T> {
    serde_json::from_str(json)
        .map_err(|e| Error::configuration(format!("{what} settings are malformed: {e}")))
}

/// Settings of the filesystem backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    /// Root folder; defaults to the tier's folder
    pub folder: Option<PathBuf>,
    /// Spread files over a 256×256 two-level directory tree
    pub multi_folder: bool,
}

impl FileSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = parse_json(json, "file")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_multi_folder(mut self, multi_folder: bool) -> Self {
        self.multi_folder = multi_folder;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.common.prefix = Some(prefix.into());
        self
    }

    pub fn with_region(mut self, region: RegionScope) -> Self {
        self.common.region = region;
        self
    }

    pub fn with_tier(mut self, tier: StorageTier) -> Self {
        self.common.tier = Some(tier);
        self
    }

    pub fn with_environment(mut self, environment: HostEnvironment) -> Self {
        self.common.environment = environment;
        self
    }

    pub fn with_lock_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.common.lock_folder = Some(folder.into());
        self
    }

    /// Tier after defaults
    pub fn tier(&self) -> StorageTier {
        self.common.tier.unwrap_or(StorageTier::Temporary)
    }

    /// Root folder after defaults
    pub fn resolved_folder(&self) -> PathBuf {
        match &self.folder {
            Some(folder) => folder.clone(),
            None => match self.tier() {
                StorageTier::Temporary => XdgPaths::temporary_dir(),
                StorageTier::Persistent => XdgPaths::persistent_dir(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(folder) = &self.folder {
            if folder.as_os_str().is_empty() {
                return Err(Error::configuration("folder can not be empty"));
            }
        }
        Ok(())
    }
}

/// Settings of the network backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    #[serde(flatten)]
    pub common: CommonSettings,
    pub host: String,
    pub port: u16,
    pub database: u32,
    /// Per-wait receive timeout and connect timeout, in seconds
    pub timeout_secs: f64,
    /// Maximum payload bytes sent per `SET`/`APPEND` command
    pub chunk_size: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            common: CommonSettings::default(),
            host: DEFAULT_NETWORK_HOST.to_string(),
            port: DEFAULT_NETWORK_PORT,
            database: DEFAULT_NETWORK_DATABASE,
            timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS as f64,
            chunk_size: DEFAULT_PAYLOAD_CHUNK_SIZE,
        }
    }
}

impl NetworkSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = parse_json(json, "network")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.common.prefix = Some(prefix.into());
        self
    }

    pub fn with_region(mut self, region: RegionScope) -> Self {
        self.common.region = region;
        self
    }

    pub fn with_environment(mut self, environment: HostEnvironment) -> Self {
        self.common.environment = environment;
        self
    }

    pub fn with_lock_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.common.lock_folder = Some(folder.into());
        self
    }

    /// Tier after defaults
    pub fn tier(&self) -> StorageTier {
        self.common.tier.unwrap_or(StorageTier::Persistent)
    }

    /// Receive timeout; falls back to the default when `timeout_secs` is out
    /// of range, which [`NetworkSettings::validate`] reports
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_NETWORK_TIMEOUT_SECS))
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::configuration("host can not be empty"));
        }
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            return Err(Error::configuration(format!(
                "timeout must be a positive number of seconds, got {}",
                self.timeout_secs
            )));
        }
        if let Err(e) = Duration::try_from_secs_f64(self.timeout_secs) {
            return Err(Error::configuration(format!(
                "timeout of {} seconds is out of range: {e}",
                self.timeout_secs
            )));
        }
        if self.chunk_size == 0 {
            return Err(Error::configuration("chunk size can not be zero"));
        }
        Ok(())
    }
}
