//! Sorted frames and the structures built from them.
//!
//! - `frame`: sorted key/value blocks with estimated bounds
//! - `heuristics`: compact separator keys for index levels
//! - `stream`: lazy merge/range/resize adapters over frame sequences
//! - `tree`: immutable file-backed sorted trees
//! - `shadow`: white-over-grey layering of frame sources
//! - `scatter`: external sample-pivot sort for unordered input

pub mod frame;
pub mod heuristics;
pub mod scatter;
pub mod shadow;
pub mod stream;
pub mod tree;

pub use frame::Frame;
pub use scatter::ScatterSorter;
pub use shadow::{FrameSource, Layer, ShadowTree, TinyBuffer};
pub use stream::FrameStream;
pub use tree::SortedTree;

pub(crate) mod codec {
    use bincode::config::{self, Config};
    use serde::Serialize;
    use serde::de::DeserializeOwned;

    use crate::error::Result;

    fn bincode_config() -> impl Config {
        config::standard()
            .with_little_endian()
            .with_variable_int_encoding()
    }

    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(value, bincode_config())?)
    }

    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode_config())?;
        Ok(value)
    }

    /// Decode a value and report how many bytes it used.
    pub fn decode_prefix<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize)> {
        Ok(bincode::serde::decode_from_slice(bytes, bincode_config())?)
    }
}
