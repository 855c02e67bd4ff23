#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! The shard layer of the cluster.
//!
//! A [`shard::ShardData`] owns a half-open time window of points replicated
//! on one or more servers. This crate maps time-tagged writes and queries
//! onto those replicas: writes are sequenced through the write-ahead log and
//! buffered to the local store and every remote replica, queries run locally
//! through a query processor or are forwarded to one healthy replica, and
//! destructive operations fan out to every replica with their response
//! streams merged back in order.
//!
//! The coordinator that creates shards, the storage engine, the WAL and the
//! cluster transport are external; they plug in through the traits in
//! [`store`], [`wal`] and [`server`].

pub mod config;
pub mod engine;
pub mod protocol;
pub mod query;
pub mod server;
pub mod shard;
pub mod store;
pub mod test_helpers;
pub mod time;
pub mod wal;
pub mod write_buffer;

/// An error from an external collaborator crossing a trait boundary.
pub type GenericError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use protocol::{Request, RequestType, Response, ResponseType, Series};
pub use query::QuerySpec;
pub use shard::{
    sort_shards_by_time_asc, sort_shards_by_time_desc, NewShardData, ShardData, ShardType,
};
