//! Tuned defaults and on-disk naming constants.

/// Target byte size of a tree node before it is closed.
pub const DEFAULT_NODE_BYTES: usize = 10_000;
/// Number of decoded tree nodes kept per open tree.
pub const DEFAULT_NODE_CACHE: usize = 100;
/// Deepest tree accepted when reading a trailer.
pub const MAX_TREE_HEIGHT: i64 = 100;
/// The trailer marker must appear within this many bytes of the end of file.
pub const TRAILER_SCAN_BYTES: usize = 1000;

// Record prefix: "%08d&%08d" -> element count, payload byte length.
pub const RECORD_PREFIX_LEN: usize = 17;
/// Largest count or payload length an 8-digit prefix field holds.
pub const MAX_RECORD_FIELD: usize = 99_999_999;
pub const LEVEL_SENTINEL: u8 = b'$';
pub const TRAILER_MARKER: u8 = b'?';

pub const DEFAULT_BUCKET_BYTES: usize = 400_000;
pub const DEFAULT_MAX_SCATTER: usize = 100;
pub const DEFAULT_OVER_SAMPLE: usize = 10;
pub const DEFAULT_RECURSION_MINIMUM: usize = 100;
pub const DEFAULT_SCATTER_DEPTH: usize = 8;
pub const MIN_SCATTER: usize = 10;
/// Chains longer than this force every bucket out to the scratch file.
pub const HIBERNATE_CHAIN_LENGTH: usize = 3;

/// Recent buffers below this total are merged in memory during aggregation.
pub const DEFAULT_IN_MEMORY_MERGE_BYTES: u64 = 4_000_000;

pub const DEFAULT_MAX_BUFFER: usize = 10_000_000;
pub const DEFAULT_SWITCH_FACTOR: usize = 5000;
pub const DEFAULT_QUERY_TIME_LIMIT_MS: u64 = 20_000;
pub const DEFAULT_PROXIMITY_CHUNK: usize = 100;
pub const DEFAULT_PROXIMITY_DELTA: usize = 20;

/// Indexed attribute values are cut to this many characters.
pub const VALUE_TRUNCATION: usize = 80;
/// Indexed words are cut to this many characters.
pub const WORD_TRUNCATION: usize = 30;
/// Words of this length or shorter are not indexed.
pub const SHORT_WORD_LENGTH: usize = 2;

pub const SURROGATE_RETRY_LIMIT: u32 = 100;
pub const SURROGATE_RETRY_SLEEP_MS: u64 = 100;

pub const TREE_SUFFIX: &str = ".ktree";
pub const BUFFER_SUFFIX: &str = ".tiny";
pub const SCRATCH_SUFFIX: &str = ".merge";
pub const LOCK_SUFFIX: &str = ".lock";

/// Separator between components of a threaded identity.
pub const THREAD_SEPARATOR: &str = "\\";
/// Attribute name reserved for the entry identity.
pub const IDENTITY_ATTRIBUTE: &str = "i";
/// Attribute linking a parent to each threaded child.
pub const CHILD_ATTRIBUTE: &str = "[child]";
/// Attribute linking a threaded child to its parent.
pub const PARENT_ATTRIBUTE: &str = "[parent]";

pub const CATALOG_LOCK_RETRIES: u32 = 50;
pub const CATALOG_LOCK_SLEEP_MS: u64 = 100;

/// Words sampled per attribute when suggesting completions.
pub const SUGGESTION_SAMPLE_WORDS: usize = 3;
