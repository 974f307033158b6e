//! Tunable options for trees, sorting, archives, sessions and queries.
//!
//! Every struct deserializes from JSON with missing fields filled from
//! `Default`, so a host can persist only what it overrides.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BUCKET_BYTES, DEFAULT_IN_MEMORY_MERGE_BYTES, DEFAULT_MAX_BUFFER, DEFAULT_MAX_SCATTER,
    DEFAULT_NODE_BYTES, DEFAULT_NODE_CACHE, DEFAULT_OVER_SAMPLE, DEFAULT_PROXIMITY_CHUNK,
    DEFAULT_PROXIMITY_DELTA, DEFAULT_QUERY_TIME_LIMIT_MS, DEFAULT_RECURSION_MINIMUM,
    DEFAULT_SCATTER_DEPTH, DEFAULT_SWITCH_FACTOR,
};
use crate::error::Result;

/// Shape of sorted tree files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeOptions {
    /// Approximate encoded byte size of one node.
    pub node_bytes: usize,
    /// Decoded nodes cached per open tree.
    pub cache_limit: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            node_bytes: DEFAULT_NODE_BYTES,
            cache_limit: DEFAULT_NODE_CACHE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterOptions {
    pub bucket_bytes: usize,
    pub max_scatter: usize,
    pub over_sample: usize,
    /// Buckets with fewer chained segments than this are collapsed in memory.
    pub recursion_minimum: usize,
    pub max_depth: usize,
    /// Seed for pivot sampling. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SorterOptions {
    fn default() -> Self {
        Self {
            bucket_bytes: DEFAULT_BUCKET_BYTES,
            max_scatter: DEFAULT_MAX_SCATTER,
            over_sample: DEFAULT_OVER_SAMPLE,
            recursion_minimum: DEFAULT_RECURSION_MINIMUM,
            max_depth: DEFAULT_SCATTER_DEPTH,
            seed: None,
        }
    }
}

/// How aggregation combines recent buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AggregateMode {
    /// In memory below `in_memory_merge_bytes`, scatter sort above.
    #[default]
    Auto,
    InMemory,
    Scatter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveOptions {
    pub tree: TreeOptions,
    pub sorter: SorterOptions,
    pub aggregate_mode: AggregateMode,
    pub in_memory_merge_bytes: u64,
    /// Run a complete clean-up after every successful aggregation.
    pub auto_clean: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            tree: TreeOptions::default(),
            sorter: SorterOptions::default(),
            aggregate_mode: AggregateMode::Auto,
            in_memory_merge_bytes: DEFAULT_IN_MEMORY_MERGE_BYTES,
            auto_clean: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityOptions {
    pub chunk_size: usize,
    pub delta_size: usize,
}

impl Default for ProximityOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_PROXIMITY_CHUNK,
            delta_size: DEFAULT_PROXIMITY_DELTA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Largest candidate set an index probe may materialize.
    pub max_buffer: usize,
    /// Probe growth allowed relative to the current result size.
    pub switch_factor: usize,
    /// Cap on ids returned by a single probe; hitting it truncates the result.
    pub truncate_size: Option<usize>,
    /// Once the candidate set is at most this size, remaining filters test directly.
    pub materialize_size: Option<usize>,
    pub time_limit_ms: u64,
    pub proximity: ProximityOptions,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_buffer: DEFAULT_MAX_BUFFER,
            switch_factor: DEFAULT_SWITCH_FACTOR,
            truncate_size: None,
            materialize_size: None,
            time_limit_ms: DEFAULT_QUERY_TIME_LIMIT_MS,
            proximity: ProximityOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub read_only: bool,
    /// Identities use `\`-separated ancestry and results suppress descendants.
    pub threaded: bool,
    /// Store into `recent/waiting` instead of `recent/active`.
    pub lazy_store: bool,
    /// Give unseen attribute names short counter-based aliases.
    pub auto_abbreviate: bool,
    pub archive: ArchiveOptions,
    pub query: QueryOptions,
}

impl SessionOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    #[must_use]
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    #[must_use]
    pub fn lazy_store(mut self, lazy_store: bool) -> Self {
        self.lazy_store = lazy_store;
        self
    }

    #[must_use]
    pub fn auto_abbreviate(mut self, auto_abbreviate: bool) -> Self {
        self.auto_abbreviate = auto_abbreviate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let opts = SessionOptions::from_json(
            r#"{"threaded": true, "archive": {"tree": {"node_bytes": 512}}}"#,
        )
        .unwrap();
        assert!(opts.threaded);
        assert_eq!(opts.archive.tree.node_bytes, 512);
        assert_eq!(opts.archive.tree.cache_limit, DEFAULT_NODE_CACHE);
        assert_eq!(opts.query.switch_factor, DEFAULT_SWITCH_FACTOR);
    }
}
