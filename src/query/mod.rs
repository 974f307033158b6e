//! Boolean queries over a session's indexes.

pub mod boolean;
pub mod evaluate;
pub mod filter;
pub mod parse;
pub mod probe;
pub mod result;

pub use boolean::{boolean_result, node_matches};
pub use evaluate::{DEFAULT_DELIMITERS, FilterKey, Query, Suggestions};
pub use filter::{Annotations, Filter, Indexable, Test};
pub use parse::{QueryNode, parse_query};
pub use probe::{Probe, ProbeHits};
pub use result::{EvaluationStatus, QueryEntries, QueryResult};
