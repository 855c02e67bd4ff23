//! The shard: a replicated, half-open time window of points.
//!
//! A shard maps a time-tagged write or query onto the replica servers that
//! hold it. Writes are sequenced through the write-ahead log and then
//! buffered to the local store and every remote replica; queries either run
//! locally through a query processor or are forwarded to one healthy
//! replica; deletes and drops fan out to every replica and their response
//! streams are merged back in order.
//!
//! Descriptors are created by the coordinator, wired up once through
//! [`ShardData::set_servers`] / [`ShardData::set_local_store`], and are
//! read-only afterwards: publish behind an `Arc` and never mutate.

use crate::engine::{
    AggregateEngine, FilteringEngine, ListSeriesEngine, PassthroughEngine, QueryProcessor,
};
use crate::protocol::{Request, RequestType, Response, ResponseType};
use crate::query::QuerySpec;
use crate::server::ClusterServer;
use crate::store::{LocalShardDb, LocalShardStore, ShardCheckout};
use crate::time::{NanoClock, WallClock};
use crate::wal::Wal;
use crate::GenericError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Point cap for the passthrough engine behind deletes, drops and
/// single-point queries.
const MAX_DELETE_RESULTS: usize = 10_000;

/// Point cap for passthrough engines on the regular select path.
const MAX_POINTS_BEFORE_SEND: usize = 1_000;

/// Depth of the private channel a local destructive query writes into.
const DESTRUCTIVE_RESPONSE_BUFFER: usize = 1_000;

/// Response-channel depth when a query has no group-by window. Shards are
/// queried sequentially in that case, so this only needs to be safe, not
/// tight.
const DEFAULT_RESPONSE_BUFFER: usize = 1_000;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("error logging write to the wal: {source}"))]
    WalLog { source: GenericError },

    #[snafu(display("error opening shard {shard_id} in the local store: {source}"))]
    StoreOpen {
        shard_id: u32,
        source: GenericError,
    },

    #[snafu(display("error writing shard {shard_id} to the local store: {source}"))]
    LocalWrite {
        shard_id: u32,
        source: GenericError,
    },

    #[snafu(display("error querying shard {shard_id} in the local store: {source}"))]
    LocalQuery {
        shard_id: u32,
        source: GenericError,
    },

    #[snafu(display("shard {shard_id} has no local store attached"))]
    NotLocal { shard_id: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether a shard holds recent, quickly-expiring data or long-lived
/// roll-ups. Series are routed to one of the two by the coordinator; the
/// shard only carries the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardType {
    LongTerm,
    ShortTerm,
}

/// The serialization form of a shard descriptor, used when shards travel
/// through Raft or are snapshotted in the log. Round-trips losslessly with
/// [`ShardData`] minus the runtime handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewShardData {
    pub id: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub shard_type: ShardType,
    pub server_ids: Vec<u32>,
    pub duration_is_split: bool,
}

/// A shard descriptor plus its replica set.
#[derive(Debug)]
pub struct ShardData {
    id: u32,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    start_micro: i64,
    end_micro: i64,
    shard_type: ShardType,
    duration_is_split: bool,
    shard_duration: Duration,
    shard_seconds: i64,
    wal: Arc<dyn Wal>,
    cluster_servers: Vec<Arc<dyn ClusterServer>>,
    store: Option<Arc<dyn LocalShardStore>>,
    server_ids: Vec<u32>,
    local_server_id: u32,
    is_local: bool,
    clock: Arc<dyn NanoClock>,
}

impl ShardData {
    pub fn new(
        id: u32,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        shard_type: ShardType,
        duration_is_split: bool,
        wal: Arc<dyn Wal>,
    ) -> Self {
        assert!(
            start_time < end_time,
            "shard {} window start {} must precede end {}",
            id,
            start_time,
            end_time
        );
        let start_micro = start_time.timestamp_micros();
        let end_micro = end_time.timestamp_micros();
        let duration_micros = (end_micro - start_micro) as u64;
        Self {
            id,
            start_time,
            end_time,
            start_micro,
            end_micro,
            shard_type,
            duration_is_split,
            shard_duration: Duration::from_micros(duration_micros),
            shard_seconds: (duration_micros / 1_000_000) as i64,
            wal,
            cluster_servers: Vec::new(),
            store: None,
            server_ids: Vec::new(),
            local_server_id: 0,
            is_local: false,
            clock: Arc::new(WallClock),
        }
    }

    /// Rebuild a descriptor from its serialization form. Runtime handles are
    /// re-attached by the coordinator via [`Self::set_servers`] /
    /// [`Self::set_local_store`] on a freshly constructed descriptor.
    pub fn from_new_shard_data(data: NewShardData, wal: Arc<dyn Wal>) -> Self {
        let mut shard = Self::new(
            data.id,
            data.start_time,
            data.end_time,
            data.shard_type,
            data.duration_is_split,
            wal,
        );
        shard.server_ids = data.server_ids;
        shard.sort_server_ids();
        shard
    }

    /// Replace the clock replica selection reads. Tests pin it to steer
    /// which replica a query lands on.
    pub fn with_clock(mut self, clock: Arc<dyn NanoClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn start_micro(&self) -> i64 {
        self.start_micro
    }

    pub fn end_micro(&self) -> i64 {
        self.end_micro
    }

    pub fn shard_type(&self) -> ShardType {
        self.shard_type
    }

    pub fn duration_is_split(&self) -> bool {
        self.duration_is_split
    }

    pub fn shard_duration(&self) -> Duration {
        self.shard_duration
    }

    pub fn shard_seconds(&self) -> i64 {
        self.shard_seconds
    }

    /// Ids of every server holding this shard, ascending.
    pub fn server_ids(&self) -> &[u32] {
        &self.server_ids
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Whether `t` (microseconds since the epoch) falls inside the shard's
    /// half-open `[start, end)` window.
    pub fn contains_microsecond(&self, t: i64) -> bool {
        self.start_micro <= t && t < self.end_micro
    }

    /// Record the remote servers holding this shard.
    pub fn set_servers(&mut self, servers: Vec<Arc<dyn ClusterServer>>) {
        for server in &servers {
            self.server_ids.push(server.id());
        }
        self.cluster_servers = servers;
        self.sort_server_ids();
    }

    /// Attach the local store. Probes the backing shard so a store that
    /// cannot open it fails the call before the shard advertises locality.
    pub fn set_local_store(
        &mut self,
        store: Arc<dyn LocalShardStore>,
        local_server_id: u32,
    ) -> Result<()> {
        self.server_ids.push(local_server_id);
        self.local_server_id = local_server_id;
        self.sort_server_ids();

        ShardCheckout::acquire(store.as_ref(), self.id).context(StoreOpenSnafu {
            shard_id: self.id,
        })?;
        self.store = Some(store);
        self.is_local = true;
        Ok(())
    }

    /// Durably log and disseminate a write confined to this shard.
    ///
    /// The request is stamped with the shard id and the request number the
    /// WAL assigned. A WAL failure aborts the write before anything is
    /// disseminated; buffer enqueues after that point are fire-and-forget
    /// and recovered by WAL replay.
    pub async fn write(&self, request: &mut Request) -> Result<()> {
        request.shard_id = Some(self.id);
        let request_number = self
            .wal
            .assign_sequence_numbers_and_log(request, self)
            .await
            .context(WalLogSnafu)?;
        request.request_number = Some(request_number);

        if let Some(store) = &self.store {
            store.buffer_write(request.clone());
        }
        for server in &self.cluster_servers {
            // fresh envelope: the receiving server assigns its own id
            let mut forwarded = Request::new(request.request_type);
            forwarded.database = request.database.clone();
            forwarded.series = request.series.clone();
            forwarded.shard_id = Some(self.id);
            forwarded.request_number = Some(request_number);
            server.buffer_write(forwarded);
        }
        Ok(())
    }

    /// Write straight into the local store, bypassing WAL and replication.
    /// Only used when replaying the WAL into the local store; logging the
    /// replay would regress into the WAL.
    pub fn write_local_only(&self, request: &Request) -> Result<()> {
        let store = self.store.as_ref().context(NotLocalSnafu {
            shard_id: self.id,
        })?;
        store.write(request).context(LocalWriteSnafu {
            shard_id: self.id,
        })
    }

    /// Stream the results of `spec` onto `response`.
    ///
    /// On the local and destructive paths the stream is terminated by
    /// exactly one [`Response::end_stream`] frame; on the remote path the
    /// transport owns termination.
    pub async fn query(&self, spec: &QuerySpec, response: mpsc::Sender<Response>) {
        // Deletes and drops touch every replica, not just this one or a
        // random peer. Only the server that received the original query sets
        // the flag.
        if spec.run_against_all_servers_in_shard() {
            if spec.is_delete_from_series() {
                self.handle_delete_query(spec, response).await;
                return;
            } else if spec.is_drop_series() {
                self.handle_drop_series_query(spec, response).await;
                return;
            }
        }

        if self.is_local {
            self.query_locally(spec, response).await;
        } else {
            self.query_remote(spec, response).await;
        }
    }

    async fn query_locally(&self, spec: &QuerySpec, response: mpsc::Sender<Response>) {
        let Some(store) = &self.store else {
            let message = Error::NotLocal { shard_id: self.id }.to_string();
            error!("{message}");
            self.send(&response, Response::error_end_stream(message)).await;
            return;
        };

        let mut processor: Box<dyn QueryProcessor> = if spec.is_list_series() {
            Box::new(ListSeriesEngine::new(response.clone()))
        } else if spec.is_delete_from_series() || spec.is_drop_series() || spec.is_single_point() {
            Box::new(PassthroughEngine::new(response.clone(), MAX_DELETE_RESULTS))
        } else {
            let query = spec.select_query();
            let inner: Box<dyn QueryProcessor> = if self.should_aggregate_locally(spec) {
                debug!(shard_id = self.id, "creating a local aggregation engine");
                match AggregateEngine::new(query, spec.group_by_interval(), response.clone()) {
                    Ok(mut engine) => {
                        engine.set_shard_info(self.id, self.is_local);
                        Box::new(engine)
                    }
                    Err(e) => {
                        error!(shard_id = self.id, error = %e, "error creating aggregation engine");
                        self.send(&response, Response::error_end_stream(e.to_string()))
                            .await;
                        return;
                    }
                }
            } else if query.has_aggregates() {
                debug!(shard_id = self.id, "creating a passthrough engine");
                Box::new(PassthroughEngine::new(
                    response.clone(),
                    MAX_POINTS_BEFORE_SEND,
                ))
            } else {
                debug!(shard_id = self.id, limit = ?query.limit(), "creating a passthrough engine with limit");
                Box::new(PassthroughEngine::with_limit(
                    response.clone(),
                    MAX_POINTS_BEFORE_SEND,
                    query.limit(),
                ))
            };
            Box::new(FilteringEngine::new(query.clone(), inner))
        };

        let checkout = match ShardCheckout::acquire(store.as_ref(), self.id) {
            Ok(checkout) => checkout,
            Err(e) => {
                error!(shard_id = self.id, error = %e, "error opening shard in the local store");
                self.send(&response, Response::error_end_stream(e.to_string()))
                    .await;
                return;
            }
        };

        let result = checkout.db().query(spec, processor.as_mut()).await;
        processor.close().await;
        drop(checkout);

        if let Err(e) = result {
            error!(shard_id = self.id, error = %e, "local shard query failed");
            self.send(&response, Response::error(e.to_string())).await;
        }
        self.send(&response, Response::end_stream()).await;
    }

    async fn query_remote(&self, spec: &QuerySpec, response: mpsc::Sender<Response>) {
        let healthy: Vec<_> = self
            .cluster_servers
            .iter()
            .filter(|server| server.is_up())
            .collect();
        if healthy.is_empty() {
            let message = format!("No servers up to query shard {}", self.id);
            error!("{message}");
            self.send(&response, Response::error_end_stream(message)).await;
            return;
        }

        // spread load over the healthy replicas; no affinity intended
        let index = self.clock.now_nanos().rem_euclid(healthy.len() as i64) as usize;
        let server = healthy[index];
        let request = self.create_query_request(spec);
        debug!(
            shard_id = self.id,
            server_id = server.id(),
            "forwarding query to replica"
        );
        server.make_request(request, response).await;
    }

    /// Run a delete-from-series query on every replica.
    pub async fn handle_delete_query(&self, spec: &QuerySpec, response: mpsc::Sender<Response>) {
        let mut request = self.create_query_request(spec);
        request.query = Some(spec.query_string_with_time_condition().to_owned());
        self.handle_destructive_query(spec, request, response, false)
            .await;
    }

    /// Run a drop-series query on every replica.
    pub async fn handle_drop_series_query(
        &self,
        spec: &QuerySpec,
        response: mpsc::Sender<Response>,
    ) {
        let request = self.create_query_request(spec);
        self.handle_destructive_query(spec, request, response, false)
            .await;
    }

    /// Run a destructive query locally (when this server holds a replica)
    /// and on every remote replica, merging the response streams back onto
    /// `response` in replica order.
    ///
    /// If any replica denied access, exactly one access-denied frame is
    /// emitted after all payload frames, before the terminal end-stream.
    pub async fn handle_destructive_query(
        &self,
        spec: &QuerySpec,
        mut request: Request,
        response: mpsc::Sender<Response>,
        run_local_only: bool,
    ) {
        assert!(
            self.is_local || !run_local_only,
            "destructive query restricted to the local replica of shard {}, which this server does not hold",
            self.id
        );

        let mut streams: Vec<(u32, mpsc::Receiver<Response>)> = Vec::new();

        if self.is_local {
            match self.delete_data_locally(spec).await {
                Ok(receiver) => streams.push((self.local_server_id, receiver)),
                Err(e) => {
                    error!(shard_id = self.id, error = %e, "local destructive query failed");
                    self.send(&response, Response::error_end_stream(e.to_string()))
                        .await;
                    return;
                }
            }
        }

        if !run_local_only {
            for server in &self.cluster_servers {
                let (sender, receiver) = mpsc::channel(1);
                // cleared so the receiving server assigns its own id
                request.id = None;
                debug!(
                    request = %request.description(),
                    server_id = server.id(),
                    "forwarding destructive query"
                );
                server.make_request(request.clone(), sender).await;
                streams.push((server.id(), receiver));
            }
        }

        let mut access_denied = false;
        for (server_id, mut receiver) in streams {
            debug!(
                request = %request.description(),
                server_id,
                "draining destructive query responses"
            );
            while let Some(frame) = receiver.recv().await {
                match frame.response_type {
                    ResponseType::EndStream => break,
                    // held back until every stream is drained so readers
                    // don't close out before the remaining responses
                    ResponseType::AccessDenied => access_denied = true,
                    _ => self.send(&response, frame).await,
                }
            }
        }

        if access_denied {
            self.send(&response, Response::access_denied()).await;
        }
        self.send(&response, Response::end_stream()).await;
    }

    async fn delete_data_locally(&self, spec: &QuerySpec) -> Result<mpsc::Receiver<Response>> {
        let store = self.store.as_ref().context(NotLocalSnafu {
            shard_id: self.id,
        })?;
        let (sender, receiver) = mpsc::channel(DESTRUCTIVE_RESPONSE_BUFFER);
        let mut processor = PassthroughEngine::new(sender, MAX_POINTS_BEFORE_SEND);

        let checkout = ShardCheckout::acquire(store.as_ref(), self.id).context(StoreOpenSnafu {
            shard_id: self.id,
        })?;
        let result = checkout.db().query(spec, &mut processor).await;
        processor.close().await;
        drop(checkout);

        result.context(LocalQuerySnafu { shard_id: self.id })?;
        Ok(receiver)
    }

    /// Drop `database` on this shard: locally when a replica is held, and on
    /// every remote replica when `send_to_servers` is set. Failures are
    /// logged but never block completion.
    pub async fn drop_database(&self, database: &str, send_to_servers: bool) {
        if self.is_local {
            if let Some(store) = &self.store {
                match ShardCheckout::acquire(store.as_ref(), self.id) {
                    Ok(checkout) => {
                        if let Err(e) = checkout.db().drop_database(database).await {
                            error!(
                                shard_id = self.id,
                                database,
                                error = %e,
                                "dropping database in the local store failed"
                            );
                        }
                    }
                    Err(e) => error!(
                        shard_id = self.id,
                        database,
                        error = %e,
                        "error opening shard to drop database"
                    ),
                }
            }
        }

        if !send_to_servers {
            return;
        }

        let mut drains = Vec::with_capacity(self.cluster_servers.len());
        for server in &self.cluster_servers {
            let (sender, receiver) = mpsc::channel(1);
            let mut request = Request::new(RequestType::DropDatabase);
            request.database = Some(database.to_owned());
            request.shard_id = Some(self.id);
            let server = Arc::clone(server);
            tokio::spawn(async move { server.make_request(request, sender).await });
            drains.push(receiver);
        }
        // drain every channel so no sender is left blocked
        for mut receiver in drains {
            if let Some(frame) = receiver.recv().await {
                if let Some(message) = frame.error_message {
                    error!(
                        shard_id = self.id,
                        database,
                        error = %message,
                        "drop database on replica failed"
                    );
                }
            }
        }
    }

    /// Whether aggregation for `spec` can run on this shard instead of at
    /// the coordinator.
    ///
    /// A split shard reading several series cannot aggregate locally (data
    /// for a series may live on sibling split-shards). Without a group-by
    /// window, aggregates span shards but a plain scan is cheapest here.
    /// With one, the window must divide the shard duration so every bucket
    /// is fully contained in this shard.
    pub fn should_aggregate_locally(&self, spec: &QuerySpec) -> bool {
        if self.duration_is_split && spec.reads_from_multiple_series() {
            return false;
        }
        let Some(group_by_interval) = spec.group_by_interval() else {
            return !spec.has_aggregates();
        };
        if group_by_interval.is_zero() {
            return false;
        }
        self.shard_duration.as_nanos() % group_by_interval.as_nanos() == 0
    }

    /// Estimate the response-channel depth for `spec` against this shard,
    /// from the number of group-by ticks the window covers.
    pub fn query_response_buffer_size(&self, spec: &QuerySpec, batch_point_size: usize) -> usize {
        let Some(group_by_interval) = spec.group_by_interval() else {
            return DEFAULT_RESPONSE_BUFFER;
        };
        let interval_seconds = group_by_interval.as_secs() as i64;
        if interval_seconds == 0 {
            return DEFAULT_RESPONSE_BUFFER;
        }

        let mut ticks = (self.shard_seconds / interval_seconds) as usize;
        if ticks < 10 {
            ticks = 100;
        } else if ticks > 1000 {
            // each response carries up to a batch of points, but keep a floor
            ticks = (ticks / batch_point_size.max(1)).max(1000);
        }
        if spec.group_by_column_count() > 1 {
            // column cardinality is unknown up front; scale the estimate
            ticks *= 100;
        }
        ticks
    }

    /// The serialization form used when shards travel through Raft or are
    /// snapshotted in the log.
    pub fn to_new_shard_data(&self) -> NewShardData {
        NewShardData {
            id: self.id,
            start_time: self.start_time,
            end_time: self.end_time,
            shard_type: self.shard_type,
            server_ids: self.server_ids.clone(),
            duration_is_split: self.duration_is_split,
        }
    }

    fn create_query_request(&self, spec: &QuerySpec) -> Request {
        let mut request = Request::new(RequestType::Query);
        request.shard_id = Some(self.id);
        request.query = Some(spec.query_string().to_owned());
        request.user_name = Some(spec.user().name().to_owned());
        request.database = Some(spec.database().to_owned());
        request.is_db_user = Some(!spec.user().is_cluster_admin());
        request
    }

    async fn send(&self, response: &mpsc::Sender<Response>, frame: Response) {
        if response.send(frame).await.is_err() {
            warn!(shard_id = self.id, "response receiver dropped");
        }
    }

    // server ids are always held in sorted order
    fn sort_server_ids(&mut self) {
        self.server_ids.sort_unstable();
    }
}

impl fmt::Display for ShardData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let servers: Vec<String> = self.server_ids.iter().map(|id| id.to_string()).collect();
        write!(
            f,
            "[ID: {}, START: {}, END: {}, LOCAL: {}, SERVERS: [{}]]",
            self.id,
            self.start_micro,
            self.end_micro,
            self.is_local,
            servers.join(",")
        )
    }
}

/// Sort ascending by start time, shard id as tie-break.
pub fn sort_shards_by_time_asc(shards: &mut [Arc<ShardData>]) {
    shards.sort_by_key(|shard| (shard.start_time.timestamp(), shard.id));
}

/// Sort descending by start time; the tie-break stays ascending id so the
/// order is canonical.
pub fn sort_shards_by_time_desc(shards: &mut [Arc<ShardData>]) {
    shards.sort_by(|a, b| {
        b.start_time
            .timestamp()
            .cmp(&a.start_time.timestamp())
            .then_with(|| a.id.cmp(&b.id))
    });
}
