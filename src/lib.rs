#![warn(clippy::all)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::type_complexity)]

pub mod encoding;
pub mod error;
pub mod raft;
pub mod storage;

pub use error::{Error, Result};
pub use raft::Server;
