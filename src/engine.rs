//! Query processors the shard layer attaches to a local query.
//!
//! A processor receives the points or whole series the storage engine yields
//! and turns them into [`Response`] frames on the caller's channel. The shard
//! picks the processor from the query shape: a straight passthrough with a
//! point cap (and optionally the query limit), the series-name listing, a
//! local aggregation engine when roll-up can happen on the shard, and a
//! filtering wrapper applying the query's time condition around any of them.

use crate::protocol::{FieldValue, Point, Response, Series};
use crate::query::{Aggregate, AggregateFunction, SelectQuery};
use async_trait::async_trait;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("group by interval must be positive"))]
    InvalidGroupByInterval,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Receives data yielded from a shard query.
///
/// The yield methods return `true` while the query should continue; `false`
/// stops it early, for example when a limit was hit or the receiving side
/// went away.
#[async_trait]
pub trait QueryProcessor: std::fmt::Debug + Send {
    async fn yield_point(&mut self, series_name: &str, column_names: &[String], point: Point)
        -> bool;

    async fn yield_series(&mut self, series: Series) -> bool;

    /// Flush any buffered state. Called exactly once, after the query
    /// returns, whether it succeeded or failed.
    async fn close(&mut self);

    /// Set by the shard so EXPLAIN can report which shard was measured and
    /// whether the processor ran locally.
    fn set_shard_info(&mut self, shard_id: u32, shard_local: bool);

    fn name(&self) -> &'static str;
}

/// Forwards series verbatim, batching points into response frames.
///
/// An optional limit truncates the stream; the cap bounds how many points a
/// single response frame accumulates before it is sent.
#[derive(Debug)]
pub struct PassthroughEngine {
    response: mpsc::Sender<Response>,
    max_points: usize,
    remaining: Option<usize>,
    current: Option<Series>,
}

impl PassthroughEngine {
    pub fn new(response: mpsc::Sender<Response>, max_points: usize) -> Self {
        Self::with_limit(response, max_points, None)
    }

    pub fn with_limit(
        response: mpsc::Sender<Response>,
        max_points: usize,
        limit: Option<usize>,
    ) -> Self {
        Self {
            response,
            max_points: max_points.max(1),
            remaining: limit,
            current: None,
        }
    }

    async fn flush(&mut self) -> bool {
        let Some(series) = self.current.take() else {
            return true;
        };
        if self.response.send(Response::query(series)).await.is_err() {
            warn!("response receiver dropped, stopping passthrough");
            return false;
        }
        true
    }
}

#[async_trait]
impl QueryProcessor for PassthroughEngine {
    async fn yield_point(
        &mut self,
        series_name: &str,
        column_names: &[String],
        point: Point,
    ) -> bool {
        self.yield_series(Series {
            name: series_name.to_owned(),
            columns: column_names.to_vec(),
            points: vec![point],
        })
        .await
    }

    async fn yield_series(&mut self, mut series: Series) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        if let Some(remaining) = self.remaining {
            series.points.truncate(remaining);
        }
        let incoming = series.points.len();

        match &mut self.current {
            Some(current) if current.name == series.name && current.columns == series.columns => {
                current.points.append(&mut series.points);
            }
            Some(_) => {
                if !self.flush().await {
                    return false;
                }
                self.current = Some(series);
            }
            None => self.current = Some(series),
        }

        if let Some(remaining) = &mut self.remaining {
            *remaining -= incoming;
        }

        let buffered = self.current.as_ref().map_or(0, |s| s.points.len());
        if buffered >= self.max_points && !self.flush().await {
            return false;
        }

        self.remaining != Some(0)
    }

    async fn close(&mut self) {
        self.flush().await;
    }

    fn set_shard_info(&mut self, _shard_id: u32, _shard_local: bool) {}

    fn name(&self) -> &'static str {
        "PassthroughEngine"
    }
}

/// The series name of the frame a list-series query produces.
pub const LIST_SERIES_RESULT: &str = "list_series_result";

/// Collects distinct series names and emits them as one frame on close.
#[derive(Debug)]
pub struct ListSeriesEngine {
    response: mpsc::Sender<Response>,
    seen: HashSet<String>,
    names: Vec<String>,
}

impl ListSeriesEngine {
    pub fn new(response: mpsc::Sender<Response>) -> Self {
        Self {
            response,
            seen: HashSet::new(),
            names: Vec::new(),
        }
    }

    fn record(&mut self, name: &str) {
        if self.seen.insert(name.to_owned()) {
            self.names.push(name.to_owned());
        }
    }
}

#[async_trait]
impl QueryProcessor for ListSeriesEngine {
    async fn yield_point(
        &mut self,
        series_name: &str,
        _column_names: &[String],
        _point: Point,
    ) -> bool {
        self.record(series_name);
        true
    }

    async fn yield_series(&mut self, series: Series) -> bool {
        self.record(&series.name);
        true
    }

    async fn close(&mut self) {
        let points = std::mem::take(&mut self.names)
            .into_iter()
            .map(|name| Point {
                timestamp: 0,
                values: vec![FieldValue::String(name)],
            })
            .collect();
        let listing = Series {
            name: LIST_SERIES_RESULT.to_owned(),
            columns: vec!["name".to_owned()],
            points,
        };
        if self.response.send(Response::query(listing)).await.is_err() {
            warn!("response receiver dropped before series listing was sent");
        }
    }

    fn set_shard_info(&mut self, _shard_id: u32, _shard_local: bool) {}

    fn name(&self) -> &'static str {
        "ListSeriesEngine"
    }
}

/// Applies the query's time condition before handing data to an inner
/// processor.
#[derive(Debug)]
pub struct FilteringEngine {
    query: SelectQuery,
    inner: Box<dyn QueryProcessor>,
}

impl FilteringEngine {
    pub fn new(query: SelectQuery, inner: Box<dyn QueryProcessor>) -> Self {
        Self { query, inner }
    }
}

#[async_trait]
impl QueryProcessor for FilteringEngine {
    async fn yield_point(
        &mut self,
        series_name: &str,
        column_names: &[String],
        point: Point,
    ) -> bool {
        if !self.query.time_matches(point.timestamp) {
            return true;
        }
        self.inner.yield_point(series_name, column_names, point).await
    }

    async fn yield_series(&mut self, mut series: Series) -> bool {
        let had_points = !series.points.is_empty();
        series
            .points
            .retain(|point| self.query.time_matches(point.timestamp));
        if had_points && series.points.is_empty() {
            return true;
        }
        self.inner.yield_series(series).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }

    fn set_shard_info(&mut self, shard_id: u32, shard_local: bool) {
        self.inner.set_shard_info(shard_id, shard_local);
    }

    fn name(&self) -> &'static str {
        "FilteringEngine"
    }
}

/// Running state for one aggregate over one group-by bucket.
#[derive(Debug, Clone)]
struct Accumulator {
    function: AggregateFunction,
    count: u64,
    numeric_count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
    first: Option<(i64, FieldValue)>,
    last: Option<(i64, FieldValue)>,
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        Self {
            function,
            count: 0,
            numeric_count: 0,
            sum: 0.0,
            min: None,
            max: None,
            first: None,
            last: None,
        }
    }

    fn update(&mut self, timestamp: i64, value: &FieldValue) {
        self.count += 1;
        if let Some(v) = value.as_f64() {
            self.numeric_count += 1;
            self.sum += v;
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
        match &self.first {
            Some((t, _)) if *t <= timestamp => {}
            _ => self.first = Some((timestamp, value.clone())),
        }
        match &self.last {
            Some((t, _)) if *t >= timestamp => {}
            _ => self.last = Some((timestamp, value.clone())),
        }
    }

    fn value(&self) -> FieldValue {
        match self.function {
            AggregateFunction::Count => FieldValue::Int(self.count as i64),
            AggregateFunction::Sum => FieldValue::Float(self.sum),
            AggregateFunction::Min => FieldValue::Float(self.min.unwrap_or(f64::NAN)),
            AggregateFunction::Max => FieldValue::Float(self.max.unwrap_or(f64::NAN)),
            AggregateFunction::Mean => {
                if self.numeric_count == 0 {
                    FieldValue::Float(f64::NAN)
                } else {
                    FieldValue::Float(self.sum / self.numeric_count as f64)
                }
            }
            AggregateFunction::First => self
                .first
                .as_ref()
                .map(|(_, v)| v.clone())
                .unwrap_or(FieldValue::Float(f64::NAN)),
            AggregateFunction::Last => self
                .last
                .as_ref()
                .map(|(_, v)| v.clone())
                .unwrap_or(FieldValue::Float(f64::NAN)),
        }
    }
}

/// Aggregates locally on the shard, optionally bucketed by the group-by
/// interval. Without aggregates it degrades to forwarding, which covers the
/// sequential-scan case where local execution is still the cheaper choice.
#[derive(Debug)]
pub struct AggregateEngine {
    response: mpsc::Sender<Response>,
    aggregates: Vec<Aggregate>,
    group_by_micros: Option<i64>,
    shard_info: Option<(u32, bool)>,
    state: BTreeMap<String, BTreeMap<i64, Vec<Accumulator>>>,
}

impl AggregateEngine {
    pub fn new(
        query: &SelectQuery,
        group_by_interval: Option<std::time::Duration>,
        response: mpsc::Sender<Response>,
    ) -> Result<Self> {
        let group_by_micros = match group_by_interval {
            Some(interval) => {
                let micros = interval.as_micros() as i64;
                if micros == 0 {
                    return InvalidGroupByIntervalSnafu.fail();
                }
                Some(micros)
            }
            None => None,
        };
        Ok(Self {
            response,
            aggregates: query.aggregates().to_vec(),
            group_by_micros,
            shard_info: None,
            state: BTreeMap::new(),
        })
    }

    /// The shard this engine was pinned to, once the shard reported it.
    pub fn shard_info(&self) -> Option<(u32, bool)> {
        self.shard_info
    }

    fn bucket(&self, timestamp: i64) -> i64 {
        match self.group_by_micros {
            Some(interval) => timestamp.div_euclid(interval) * interval,
            None => 0,
        }
    }

    fn accumulate(&mut self, series: &Series) {
        let columns: Vec<Option<usize>> = self
            .aggregates
            .iter()
            .map(|aggregate| series.columns.iter().position(|c| *c == aggregate.column))
            .collect();

        for point in &series.points {
            let bucket = self.bucket(point.timestamp);
            let aggregates = &self.aggregates;
            let accumulators = self
                .state
                .entry(series.name.clone())
                .or_default()
                .entry(bucket)
                .or_insert_with(|| {
                    aggregates
                        .iter()
                        .map(|aggregate| Accumulator::new(aggregate.function))
                        .collect()
                });
            for (accumulator, column) in accumulators.iter_mut().zip(&columns) {
                if let Some(index) = column {
                    if let Some(value) = point.values.get(*index) {
                        accumulator.update(point.timestamp, value);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl QueryProcessor for AggregateEngine {
    async fn yield_point(
        &mut self,
        series_name: &str,
        column_names: &[String],
        point: Point,
    ) -> bool {
        self.yield_series(Series {
            name: series_name.to_owned(),
            columns: column_names.to_vec(),
            points: vec![point],
        })
        .await
    }

    async fn yield_series(&mut self, series: Series) -> bool {
        if self.aggregates.is_empty() {
            // raw select that happens to be cheapest to run here
            return self.response.send(Response::query(series)).await.is_ok();
        }
        self.accumulate(&series);
        true
    }

    async fn close(&mut self) {
        let columns: Vec<String> = self
            .aggregates
            .iter()
            .map(|aggregate| aggregate.function.to_string())
            .collect();
        for (name, buckets) in std::mem::take(&mut self.state) {
            let points = buckets
                .into_iter()
                .map(|(bucket, accumulators)| Point {
                    timestamp: bucket,
                    values: accumulators.iter().map(Accumulator::value).collect(),
                })
                .collect();
            let series = Series {
                name,
                columns: columns.clone(),
                points,
            };
            if self.response.send(Response::query(series)).await.is_err() {
                warn!("response receiver dropped, discarding aggregated series");
                return;
            }
        }
    }

    fn set_shard_info(&mut self, shard_id: u32, shard_local: bool) {
        debug!(shard_id, shard_local, "aggregation engine pinned to shard");
        self.shard_info = Some((shard_id, shard_local));
    }

    fn name(&self) -> &'static str {
        "AggregateEngine"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseType;

    fn series(name: &str, points: Vec<(i64, f64)>) -> Series {
        Series {
            name: name.to_owned(),
            columns: vec!["value".to_owned()],
            points: points
                .into_iter()
                .map(|(timestamp, value)| Point {
                    timestamp,
                    values: vec![FieldValue::Float(value)],
                })
                .collect(),
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<Response>) -> Vec<Response> {
        let mut out = Vec::new();
        while let Ok(response) = rx.try_recv() {
            out.push(response);
        }
        out
    }

    #[tokio::test]
    async fn passthrough_batches_until_the_cap() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut engine = PassthroughEngine::new(tx, 3);

        assert!(engine.yield_series(series("cpu", vec![(1, 1.0), (2, 2.0)])).await);
        assert!(drain(&mut rx).await.is_empty());

        assert!(engine.yield_series(series("cpu", vec![(3, 3.0)])).await);
        let sent = drain(&mut rx).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].series.as_ref().map(|s| s.points.len()), Some(3));

        engine.close().await;
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn passthrough_flushes_on_series_change() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut engine = PassthroughEngine::new(tx, 100);

        assert!(engine.yield_series(series("cpu", vec![(1, 1.0)])).await);
        assert!(engine.yield_series(series("disk", vec![(2, 2.0)])).await);
        let sent = drain(&mut rx).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].series.as_ref().map(|s| s.name.as_str()), Some("cpu"));

        engine.close().await;
        let sent = drain(&mut rx).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].series.as_ref().map(|s| s.name.as_str()), Some("disk"));
    }

    #[tokio::test]
    async fn passthrough_limit_truncates_and_stops() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut engine = PassthroughEngine::with_limit(tx, 100, Some(2));

        assert!(!engine
            .yield_series(series("cpu", vec![(1, 1.0), (2, 2.0), (3, 3.0)]))
            .await);
        engine.close().await;

        let sent = drain(&mut rx).await;
        assert_eq!(sent.len(), 1);
        let points = &sent[0].series.as_ref().unwrap().points;
        assert_eq!(points.len(), 2);
        assert!(!engine.yield_series(series("cpu", vec![(4, 4.0)])).await);
    }

    #[tokio::test]
    async fn list_series_collects_distinct_names() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut engine = ListSeriesEngine::new(tx);

        assert!(engine.yield_series(series("cpu", vec![(1, 1.0)])).await);
        assert!(engine.yield_series(series("disk", vec![(2, 2.0)])).await);
        assert!(engine.yield_series(series("cpu", vec![(3, 3.0)])).await);
        engine.close().await;

        let sent = drain(&mut rx).await;
        assert_eq!(sent.len(), 1);
        let listing = sent[0].series.as_ref().unwrap();
        assert_eq!(listing.name, LIST_SERIES_RESULT);
        assert_eq!(
            listing.points,
            vec![
                Point {
                    timestamp: 0,
                    values: vec![FieldValue::String("cpu".into())]
                },
                Point {
                    timestamp: 0,
                    values: vec![FieldValue::String("disk".into())]
                },
            ]
        );
    }

    #[tokio::test]
    async fn filtering_drops_points_outside_the_time_condition() {
        let (tx, mut rx) = mpsc::channel(16);
        let inner = PassthroughEngine::new(tx, 1);
        let query = SelectQuery::new().with_time_range(10, 20);
        let mut engine = FilteringEngine::new(query, Box::new(inner));

        assert!(engine
            .yield_series(series("cpu", vec![(5, 1.0), (10, 2.0), (19, 3.0), (20, 4.0)]))
            .await);
        engine.close().await;

        let sent = drain(&mut rx).await;
        let timestamps: Vec<i64> = sent
            .iter()
            .flat_map(|r| r.series.as_ref().unwrap().points.iter().map(|p| p.timestamp))
            .collect();
        assert_eq!(timestamps, vec![10, 19]);
    }

    #[tokio::test]
    async fn filtering_skips_series_left_empty() {
        let (tx, mut rx) = mpsc::channel(16);
        let inner = PassthroughEngine::new(tx, 1);
        let query = SelectQuery::new().with_time_range(10, 20);
        let mut engine = FilteringEngine::new(query, Box::new(inner));

        assert!(engine.yield_series(series("cpu", vec![(5, 1.0)])).await);
        engine.close().await;
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn aggregate_engine_buckets_by_interval() {
        let (tx, mut rx) = mpsc::channel(16);
        let query = SelectQuery::new()
            .with_aggregate(AggregateFunction::Count, "value")
            .with_aggregate(AggregateFunction::Mean, "value");
        let mut engine = AggregateEngine::new(
            &query,
            Some(std::time::Duration::from_micros(10)),
            tx,
        )
        .unwrap();

        assert!(engine
            .yield_series(series("cpu", vec![(1, 2.0), (4, 4.0), (11, 6.0)]))
            .await);
        engine.close().await;

        let sent = drain(&mut rx).await;
        assert_eq!(sent.len(), 1);
        let aggregated = sent[0].series.as_ref().unwrap();
        assert_eq!(aggregated.columns, vec!["count", "mean"]);
        assert_eq!(
            aggregated.points,
            vec![
                Point {
                    timestamp: 0,
                    values: vec![FieldValue::Int(2), FieldValue::Float(3.0)]
                },
                Point {
                    timestamp: 10,
                    values: vec![FieldValue::Int(1), FieldValue::Float(6.0)]
                },
            ]
        );
    }

    #[tokio::test]
    async fn aggregate_engine_without_aggregates_forwards() {
        let (tx, mut rx) = mpsc::channel(16);
        let query = SelectQuery::new();
        let mut engine = AggregateEngine::new(&query, None, tx).unwrap();

        assert!(engine.yield_series(series("cpu", vec![(1, 2.0)])).await);
        engine.close().await;

        let sent = drain(&mut rx).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].response_type, ResponseType::Query);
        assert_eq!(sent[0].series.as_ref().map(|s| s.name.as_str()), Some("cpu"));
    }

    #[tokio::test]
    async fn aggregate_engine_rejects_zero_interval() {
        let (tx, _rx) = mpsc::channel(1);
        let query = SelectQuery::new().with_aggregate(AggregateFunction::Count, "value");
        let result = AggregateEngine::new(&query, Some(std::time::Duration::ZERO), tx);
        assert!(matches!(result, Err(Error::InvalidGroupByInterval)));
    }

    #[tokio::test]
    async fn aggregate_engine_records_shard_info() {
        let (tx, _rx) = mpsc::channel(1);
        let query = SelectQuery::new().with_aggregate(AggregateFunction::Sum, "value");
        let mut engine = AggregateEngine::new(&query, None, tx).unwrap();
        assert_eq!(engine.shard_info(), None);
        engine.set_shard_info(7, true);
        assert_eq!(engine.shard_info(), Some((7, true)));
    }
}
