//! Mock collaborators for tests: the WAL, remote servers and the local
//! store, each recording what the shard asked of them.

use crate::engine::QueryProcessor;
use crate::protocol::{Request, Response, Series};
use crate::query::QuerySpec;
use crate::server::ClusterServer;
use crate::shard::ShardData;
use crate::store::{LocalShardDb, LocalShardStore};
use crate::wal::Wal;
use crate::write_buffer::WriteBuffer;
use crate::GenericError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A WAL that hands out sequential request numbers and records every
/// logged request.
#[derive(Debug, Default)]
pub struct MockWal {
    sequence: AtomicU32,
    error: Mutex<Option<String>>,
    requests: Mutex<Vec<Request>>,
}

impl MockWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following log call fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
    }

    /// Requests logged so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// The request number most recently assigned.
    pub fn last_assigned(&self) -> u32 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Wal for MockWal {
    async fn assign_sequence_numbers_and_log(
        &self,
        request: &mut Request,
        _shard: &ShardData,
    ) -> Result<u32, GenericError> {
        if let Some(message) = self.error.lock().clone() {
            return Err(message.into());
        }
        self.requests.lock().push(request.clone());
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// A remote server that records buffered writes and requests, and answers
/// `make_request` by streaming a scripted list of frames from its own task.
#[derive(Debug)]
pub struct MockClusterServer {
    id: u32,
    up: AtomicBool,
    script: Mutex<Vec<Response>>,
    buffered_writes: Mutex<Vec<Request>>,
    requests: Mutex<Vec<Request>>,
}

impl MockClusterServer {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            up: AtomicBool::new(true),
            script: Mutex::new(vec![Response::end_stream()]),
            buffered_writes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replace the frames every `make_request` call streams back.
    pub fn with_responses(self, responses: Vec<Response>) -> Self {
        *self.script.lock() = responses;
        self
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn buffered_writes(&self) -> Vec<Request> {
        self.buffered_writes.lock().clone()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ClusterServer for MockClusterServer {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn buffer_write(&self, request: Request) {
        self.buffered_writes.lock().push(request);
    }

    async fn make_request(&self, request: Request, response: mpsc::Sender<Response>) {
        self.requests.lock().push(request);
        let frames = self.script.lock().clone();
        tokio::spawn(async move {
            for frame in frames {
                if response.send(frame).await.is_err() {
                    break;
                }
            }
        });
    }
}

/// A backing shard that yields scripted series into the processor.
#[derive(Debug, Default)]
pub struct MockShardDb {
    series: Mutex<Vec<Series>>,
    query_error: Mutex<Option<String>>,
    queries: Mutex<Vec<QuerySpec>>,
    writes: Mutex<Vec<(String, Series)>>,
    dropped_databases: Mutex<Vec<String>>,
    drop_error: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl MockShardDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn yield_series(&self, series: Vec<Series>) {
        *self.series.lock() = series;
    }

    pub fn fail_queries_with(&self, message: impl Into<String>) {
        *self.query_error.lock() = Some(message.into());
    }

    pub fn fail_drops_with(&self, message: impl Into<String>) {
        *self.drop_error.lock() = Some(message.into());
    }

    pub fn queries(&self) -> Vec<QuerySpec> {
        self.queries.lock().clone()
    }

    pub fn writes(&self) -> Vec<(String, Series)> {
        self.writes.lock().clone()
    }

    pub fn dropped_databases(&self) -> Vec<String> {
        self.dropped_databases.lock().clone()
    }
}

#[async_trait]
impl LocalShardDb for MockShardDb {
    async fn write(&self, database: &str, series: &Series) -> Result<(), GenericError> {
        self.writes.lock().push((database.to_owned(), series.clone()));
        Ok(())
    }

    async fn query(
        &self,
        spec: &QuerySpec,
        processor: &mut dyn QueryProcessor,
    ) -> Result<(), GenericError> {
        self.queries.lock().push(spec.clone());
        if let Some(message) = self.query_error.lock().clone() {
            return Err(message.into());
        }
        let series = self.series.lock().clone();
        for s in series {
            if !processor.yield_series(s).await {
                break;
            }
        }
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> Result<(), GenericError> {
        if let Some(message) = self.drop_error.lock().clone() {
            return Err(message.into());
        }
        self.dropped_databases.lock().push(database.to_owned());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A local store with one backing shard, counting checkouts and returns.
#[derive(Debug)]
pub struct MockShardStore {
    db: Arc<MockShardDb>,
    open_error: Mutex<Option<String>>,
    checkouts: AtomicUsize,
    returns: AtomicUsize,
    buffered_writes: Mutex<Vec<Request>>,
    writes: Mutex<Vec<Request>>,
    write_buffer: Mutex<Option<WriteBuffer>>,
    deleted_shards: Mutex<Vec<u32>>,
}

impl Default for MockShardStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockShardStore {
    pub fn new() -> Self {
        Self {
            db: Arc::new(MockShardDb::new()),
            open_error: Mutex::new(None),
            checkouts: AtomicUsize::new(0),
            returns: AtomicUsize::new(0),
            buffered_writes: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            write_buffer: Mutex::new(None),
            deleted_shards: Mutex::new(Vec::new()),
        }
    }

    pub fn db(&self) -> &Arc<MockShardDb> {
        &self.db
    }

    /// Make the next open fail with `message`; opens after that succeed
    /// again.
    pub fn fail_next_open(&self, message: impl Into<String>) {
        *self.open_error.lock() = Some(message.into());
    }

    pub fn checkouts(&self) -> usize {
        self.checkouts.load(Ordering::SeqCst)
    }

    pub fn returns(&self) -> usize {
        self.returns.load(Ordering::SeqCst)
    }

    pub fn buffered_writes(&self) -> Vec<Request> {
        self.buffered_writes.lock().clone()
    }

    pub fn writes(&self) -> Vec<Request> {
        self.writes.lock().clone()
    }

    pub fn deleted_shards(&self) -> Vec<u32> {
        self.deleted_shards.lock().clone()
    }
}

impl LocalShardStore for MockShardStore {
    fn write(&self, request: &Request) -> Result<(), GenericError> {
        self.writes.lock().push(request.clone());
        Ok(())
    }

    fn buffer_write(&self, request: Request) {
        self.buffered_writes.lock().push(request);
    }

    fn set_write_buffer(&self, buffer: WriteBuffer) {
        *self.write_buffer.lock() = Some(buffer);
    }

    fn get_or_create_shard(&self, _shard_id: u32) -> Result<Arc<dyn LocalShardDb>, GenericError> {
        if let Some(message) = self.open_error.lock().take() {
            return Err(message.into());
        }
        self.checkouts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.db) as Arc<dyn LocalShardDb>)
    }

    fn return_shard(&self, _shard_id: u32) {
        self.returns.fetch_add(1, Ordering::SeqCst);
    }

    fn delete_shard(&self, shard_id: u32) -> Result<(), GenericError> {
        self.deleted_shards.lock().push(shard_id);
        Ok(())
    }
}
