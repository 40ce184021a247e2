//! Cache keys and their validation

use kvcache_core::{Error, Result, FORBIDDEN_KEY_CHARS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key under which a value is stored: either text or an integer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    Text(String),
    Integer(i64),
}

impl CacheKey {
    /// Reject keys containing any of `{ } ( ) / @ :`
    pub fn validate(&self) -> Result<()> {
        match self {
            CacheKey::Integer(_) => Ok(()),
            CacheKey::Text(text) => match text.chars().find(|c| FORBIDDEN_KEY_CHARS.contains(c)) {
                Some(c) => Err(Error::invalid_key(
                    text.as_str(),
                    format!("key contains forbidden symbol '{c}'"),
                )),
                None => Ok(()),
            },
        }
    }

    /// Textual form used for hashing, file names and wire arguments
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            CacheKey::Text(text) => std::borrow::Cow::Borrowed(text.as_str()),
            CacheKey::Integer(n) => std::borrow::Cow::Owned(n.to_string()),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Text(text) => f.write_str(text),
            CacheKey::Integer(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        CacheKey::Text(value.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        CacheKey::Text(value)
    }
}

impl From<&String> for CacheKey {
    fn from(value: &String) -> Self {
        CacheKey::Text(value.clone())
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(value: &CacheKey) -> Self {
        value.clone()
    }
}

impl From<i64> for CacheKey {
    fn from(value: i64) -> Self {
        CacheKey::Integer(value)
    }
}

impl From<i32> for CacheKey {
    fn from(value: i32) -> Self {
        CacheKey::Integer(i64::from(value))
    }
}

impl From<u32> for CacheKey {
    fn from(value: u32) -> Self {
        CacheKey::Integer(i64::from(value))
    }
}
