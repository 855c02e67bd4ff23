//! Seam to the other servers in the cluster.

use crate::protocol::{Request, Response};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A remote server holding replicas of one or more shards.
///
/// Implemented by the cluster transport; mocked in tests.
#[async_trait]
pub trait ClusterServer: std::fmt::Debug + Send + Sync {
    fn id(&self) -> u32;

    /// Whether the server answered a heartbeat recently.
    fn is_up(&self) -> bool;

    /// Enqueue a write on this server's write buffer. Fire-and-forget;
    /// delivery is the buffer's responsibility and the WAL covers replay.
    fn buffer_write(&self, request: Request);

    /// Send a request and stream its responses into `response`.
    ///
    /// Must not block on the response channel: the transport feeds the
    /// channel from its own task and preserves the terminal
    /// [`Response::end_stream`] frame.
    async fn make_request(&self, request: Request, response: mpsc::Sender<Response>);
}
