#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(
    test,
    allow(
        clippy::useless_vec,
        clippy::uninlined_format_args,
        clippy::cast_possible_truncation,
        clippy::float_cmp,
        clippy::cast_precision_loss
    )
)]
#![allow(clippy::module_name_repetitions)]
//
// Documentation lints: internal helpers are mostly self-describing.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Casts are bounded by file sizes and record counts.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_lossless)]
//
// Compaction and query evaluation read best as single functions.
#![allow(clippy::too_many_lines)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::similar_names)]
//
#![allow(clippy::manual_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::format_push_string)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::field_reassign_with_default)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::unused_self)]

//! Embedded, file-backed document index.
//!
//! A collection is a directory holding one layered archive per index. A
//! [`Session`] indexes [`Entry`] values into those archives, publishes its
//! changes with [`Session::store`], and answers attribute, word, proximity
//! and boolean queries through [`Query`] and [`Session::query`].

/// The framedex-core crate version (matches `Cargo.toml`).
pub const FRAMEDEX_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod archive;
pub mod constants;
pub mod error;
pub mod frames;
pub mod io;
pub mod query;
pub mod session;
pub mod text;
pub mod types;

pub use archive::{AggregateOutcome, LayeredArchive, SessionMapping};
pub use error::{FramedexError, Result};
pub use query::{
    EvaluationStatus, Filter, FilterKey, Probe, Query, QueryEntries, QueryNode, QueryResult,
    Suggestions, Test, boolean_result, node_matches, parse_query,
};
pub use session::{AttributeCatalog, Directive, IndexName, Session};
pub use text::{Annotator, normalize_word, parse_words};
pub use types::{
    AggregateMode, ArchiveOptions, AttrValue, Entry, Key, Pair, ProximityOptions, QueryOptions,
    Scalar, SessionOptions, SorterOptions, SpecialKind, SpecialValue, TreeOptions, Value,
    entries_from_xml,
};
