//! Public types exposed by the `framedex-core` crate.

pub mod entry;
pub mod key;
pub mod options;
pub mod value;

pub use entry::{AttrValue, Entry, SpecialKind, SpecialValue, entries_from_xml};
pub use key::{Key, Scalar};
pub use options::{
    AggregateMode, ArchiveOptions, ProximityOptions, QueryOptions, SessionOptions, SorterOptions,
    TreeOptions,
};
pub use value::Value;

/// A key/value pair as held in frames and buffers.
pub type Pair = (Key, Value);
