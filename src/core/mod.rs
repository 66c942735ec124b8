//! Storage engine internals
//!
//! - [`cluster`] - clusters and the master cluster table
//! - [`file_space`] - per-stream extent lists
//! - [`version`] - storage versions and per-stream version containers
//! - [`state`] / [`error`] - cumulative state bits and typed errors
//! - [`mode`] - stream open flags and container buffer modes
//! - [`header`] - fixed container header
//! - [`medium`] - disk and memory backing
//! - [`allocator`] - cluster reuse policies
//! - [`catalog`] - stream registry and the catalog stream codec
//! - [`record`] - typed records over the byte protocol
//! - [`config`] - container configuration
//! - [`buffer`] - the buffering engine
//! - [`store`] - delete/truncate/detach/compact for the pooled engine

pub mod allocator;
pub mod buffer;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod error;
pub mod file_space;
pub mod header;
pub mod medium;
pub mod mode;
pub mod record;
pub mod state;
pub mod store;
pub mod version;

pub use buffer::{Direction, PooledBuffer, SeqBuffer, StreamBuffer, SEEK_END};
