//! Binary data encodings.
//!
//! - bincode: used for values in the key/value store and log entries.
//!
//! Storage keys use a hand-rolled order-preserving encoding, defined next to
//! the key types that need it (see e.g. the Raft log).

pub mod bincode;

use crate::error::Result;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A serializable value, encoded with Bincode. Values are considered
/// infallibly encodable, since this is an internal data structure issue.
pub trait Value: Serialize + DeserializeOwned {
    /// Encodes the value.
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }

    /// Decodes the value.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}
