#![warn(clippy::all)]

pub mod encoding;
pub mod error;
pub mod kv;
pub mod raft;

pub use kv::KvStore;
pub use raft::Server;
