//! A bounded write buffer in front of a shard writer.
//!
//! Writes into a replica are fire-and-forget from the shard's point of view:
//! the buffer absorbs bursts, a background task drains it, and anything lost
//! to overflow or writer failure is recovered by WAL replay when the replica
//! reconnects. The buffer depth comes from `cluster.write-buffer-size`.

use crate::protocol::Request;
use crate::GenericError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// The destination a [`WriteBuffer`] drains into.
#[async_trait]
pub trait ShardWriter: std::fmt::Debug + Send + Sync {
    async fn write(&self, request: &Request) -> Result<(), GenericError>;
}

/// Bounded buffer with a draining task.
#[derive(Debug, Clone)]
pub struct WriteBuffer {
    name: Arc<str>,
    sender: mpsc::Sender<Request>,
}

impl WriteBuffer {
    /// Spawn the draining task and return the buffer handle. Must be called
    /// from within a tokio runtime.
    pub fn new(name: impl Into<String>, writer: Arc<dyn ShardWriter>, size: usize) -> Self {
        let name: Arc<str> = name.into().into();
        let (sender, receiver) = mpsc::channel(size.max(1));
        tokio::spawn(drain(Arc::clone(&name), writer, receiver));
        Self { name, sender }
    }

    /// Enqueue a write without blocking. A full buffer drops the request;
    /// the WAL replays it when the writer catches up.
    pub fn write(&self, request: Request) {
        if let Err(e) = self.sender.try_send(request) {
            warn!(buffer = %self.name, error = %e, "write buffer full, dropping request");
        }
    }
}

async fn drain(name: Arc<str>, writer: Arc<dyn ShardWriter>, mut receiver: mpsc::Receiver<Request>) {
    while let Some(request) = receiver.recv().await {
        if let Err(e) = writer.write(&request).await {
            error!(buffer = %name, request = %request.description(), error = %e, "buffered write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestType;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingWriter {
        requests: Mutex<Vec<Request>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl ShardWriter for RecordingWriter {
        async fn write(&self, request: &Request) -> Result<(), GenericError> {
            if *self.fail.lock() {
                return Err("writer down".into());
            }
            self.requests.lock().push(request.clone());
            Ok(())
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn drains_in_order() {
        let writer = Arc::new(RecordingWriter::default());
        let buffer = WriteBuffer::new("server 1", Arc::clone(&writer) as _, 8);

        for shard_id in 0..3 {
            let mut request = Request::new(RequestType::Write);
            request.shard_id = Some(shard_id);
            buffer.write(request);
        }
        settle().await;

        let written: Vec<Option<u32>> = writer
            .requests
            .lock()
            .iter()
            .map(|r| r.shard_id)
            .collect();
        assert_eq!(written, vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn writer_failure_does_not_stop_the_drain() {
        let writer = Arc::new(RecordingWriter::default());
        let buffer = WriteBuffer::new("server 1", Arc::clone(&writer) as _, 8);

        *writer.fail.lock() = true;
        buffer.write(Request::new(RequestType::Write));
        settle().await;
        *writer.fail.lock() = false;

        buffer.write(Request::new(RequestType::Write));
        settle().await;
        assert_eq!(writer.requests.lock().len(), 1);
    }
}
