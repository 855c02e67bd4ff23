//! Seam to the write-ahead log.
//!
//! The log itself (segments, fsync policy, replay) lives elsewhere. The
//! shard layer only needs sequencing: every write is logged and assigned a
//! request number before it is disseminated, and the log is the source of
//! truth when a replica reconnects and replays.

use crate::protocol::Request;
use crate::shard::ShardData;
use crate::GenericError;
use async_trait::async_trait;

/// The write-ahead log consumed by the shard layer.
#[async_trait]
pub trait Wal: std::fmt::Debug + Send + Sync {
    /// Durably log `request` for `shard` and return the request number
    /// assigned to it. Request numbers are strictly increasing per shard.
    ///
    /// Sequence numbers for the individual points are assigned into the
    /// request, which is why it is taken mutably.
    async fn assign_sequence_numbers_and_log(
        &self,
        request: &mut Request,
        shard: &ShardData,
    ) -> Result<u32, GenericError>;
}
