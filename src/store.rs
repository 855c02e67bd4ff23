//! Seams to the local storage engine.
//!
//! The storage engine itself lives elsewhere; the shard layer drives it
//! through these traits and always accesses a backing shard through a
//! [`ShardCheckout`], which guarantees the handle is returned on every exit
//! path.

use crate::engine::QueryProcessor;
use crate::protocol::{Request, Series};
use crate::query::QuerySpec;
use crate::write_buffer::WriteBuffer;
use crate::GenericError;
use async_trait::async_trait;
use std::sync::Arc;

/// One backing shard inside the local store.
#[async_trait]
pub trait LocalShardDb: std::fmt::Debug + Send + Sync {
    async fn write(&self, database: &str, series: &Series) -> Result<(), GenericError>;

    async fn query(
        &self,
        spec: &QuerySpec,
        processor: &mut dyn QueryProcessor,
    ) -> Result<(), GenericError>;

    async fn drop_database(&self, database: &str) -> Result<(), GenericError>;

    fn is_closed(&self) -> bool;
}

/// The local store holding this server's shards.
///
/// `get_or_create_shard` and `return_shard` form an acquire/release pair and
/// must support concurrent callers.
pub trait LocalShardStore: std::fmt::Debug + Send + Sync {
    /// Synchronous write, used by WAL replay.
    fn write(&self, request: &Request) -> Result<(), GenericError>;

    /// Non-blocking write through the store's write buffer.
    fn buffer_write(&self, request: Request);

    fn set_write_buffer(&self, buffer: WriteBuffer);

    fn get_or_create_shard(&self, shard_id: u32) -> Result<Arc<dyn LocalShardDb>, GenericError>;

    fn return_shard(&self, shard_id: u32);

    fn delete_shard(&self, shard_id: u32) -> Result<(), GenericError>;
}

/// A checked-out backing shard. Returns the handle to the store when
/// dropped, so early returns and errors cannot leak it.
#[derive(Debug)]
pub struct ShardCheckout<'a> {
    store: &'a dyn LocalShardStore,
    shard_id: u32,
    db: Arc<dyn LocalShardDb>,
}

impl<'a> ShardCheckout<'a> {
    pub fn acquire(store: &'a dyn LocalShardStore, shard_id: u32) -> Result<Self, GenericError> {
        let db = store.get_or_create_shard(shard_id)?;
        Ok(Self {
            store,
            shard_id,
            db,
        })
    }

    pub fn db(&self) -> &Arc<dyn LocalShardDb> {
        &self.db
    }
}

impl Drop for ShardCheckout<'_> {
    fn drop(&mut self) {
        self.store.return_shard(self.shard_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MockShardStore;

    #[test]
    fn checkout_returns_shard_on_drop() {
        let store = MockShardStore::new();
        {
            let checkout = ShardCheckout::acquire(&store, 1).unwrap();
            assert!(!checkout.db().is_closed());
            assert_eq!(store.checkouts(), 1);
            assert_eq!(store.returns(), 0);
        }
        assert_eq!(store.returns(), 1);
    }

    #[test]
    fn failed_acquire_returns_nothing() {
        let store = MockShardStore::new();
        store.fail_next_open("no space");
        assert!(ShardCheckout::acquire(&store, 1).is_err());
        assert_eq!(store.checkouts(), 0);
        assert_eq!(store.returns(), 0);
    }
}
