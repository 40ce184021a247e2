/// Constants used throughout the kvcache codebase
// Key validation
pub const FORBIDDEN_KEY_CHARS: &[char] = &['{', '}', '(', ')', '/', '@', ':'];

// Default time-to-live of the boolean `set` entry point: ten Julian years
pub const DEFAULT_TTL_SECS: f64 = 10.0 * 365.25 * 24.0 * 3600.0;

// File backend naming
pub const FILE_NAME_PREFIX: &str = "prefix_";
pub const FILE_EXTENSION: &str = "dat";
pub const SHARD_FANOUT: usize = 256;

// Lock names
pub const LOCK_NAME_PREFIX: &str = "kvlock_";
pub const LOCK_FILE_EXTENSION: &str = "lock";
pub const DEFAULT_LOCK_FOLDER_NAME: &str = "kvcache-locks";

// Record framing version written in front of every on-disk envelope
pub const ENVELOPE_FORMAT_VERSION: u16 = 1;

// Network backend defaults
pub const DEFAULT_NETWORK_HOST: &str = "127.0.0.1";
pub const DEFAULT_NETWORK_PORT: u16 = 6379;
pub const DEFAULT_NETWORK_DATABASE: u32 = 0;
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PAYLOAD_CHUNK_SIZE: usize = 30 * 1024;
pub const RECV_CHUNK_SIZE: usize = 4096;

// Network key layout
pub const KEY_NAMESPACE: &str = "KeyValue";
pub const PAYLOAD_KEY_SUFFIX: &str = ":value";

// Keys deleted per command by `clear`
pub const CLEAR_BATCH_SIZE: usize = 20;

// Application directory name under the XDG base directories
pub const APP_DIR_NAME: &str = "kvcache";
