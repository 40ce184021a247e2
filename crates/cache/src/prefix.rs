//! Namespace prefix resolution from an explicit host environment

use crate::config::{CommonSettings, HostEnvironment, RegionScope};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static HOST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(www\.)?([a-z0-9.-]+)(:[0-9]+)?").expect("host pattern is valid")
});

/// Lowercase hex SHA-256 digest of `text`
pub(crate) fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercase the host and strip one leading `www.` and a trailing port
fn normalize_host(host: &str) -> String {
    let lowered = host.to_lowercase();
    HOST_PATTERN.replace(&lowered, "$2").into_owned()
}

/// Prefix that keeps keys of different namespaces apart
pub fn resolve_prefix(scope: RegionScope, environment: &HostEnvironment) -> String {
    match scope {
        RegionScope::Server => String::new(),
        RegionScope::Domain => {
            let host = normalize_host(environment.host.as_deref().unwrap_or_default());
            format!("{}_", sha256_hex(&host))
        }
        RegionScope::Folder => {
            let root = environment
                .document_root
                .as_deref()
                .unwrap_or_default()
                .to_lowercase();
            format!("{}_", sha256_hex(&root))
        }
    }
}

/// Explicit prefix if configured, resolved prefix otherwise
pub fn effective_prefix(settings: &CommonSettings) -> String {
    match &settings.prefix {
        Some(prefix) => prefix.clone(),
        None => resolve_prefix(settings.region, &settings.environment),
    }
}
