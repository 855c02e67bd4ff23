//! Query specifications as the shard layer sees them.
//!
//! Parsing happens upstream; by the time a query reaches a shard it has been
//! reduced to a [`QuerySpec`]: a set of predicates, the derived query strings
//! for forwarding, and (for selects) the [`SelectQuery`] details that drive
//! processor selection.

use std::fmt;
use std::time::Duration;

/// The user a query runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    name: String,
    is_cluster_admin: bool,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_cluster_admin: false,
        }
    }

    pub fn cluster_admin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_cluster_admin: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cluster_admin(&self) -> bool {
        self.is_cluster_admin
    }
}

/// Aggregate functions a select query may apply to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Mean,
    First,
    Last,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Mean => "mean",
            Self::First => "first",
            Self::Last => "last",
        };
        f.write_str(name)
    }
}

/// One aggregate applied to one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub function: AggregateFunction,
    pub column: String,
}

/// The parts of a parsed select the shard layer consults: aggregates, the
/// row limit, and the time condition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    aggregates: Vec<Aggregate>,
    limit: Option<usize>,
    start_micro: Option<i64>,
    end_micro: Option<i64>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aggregate(mut self, function: AggregateFunction, column: impl Into<String>) -> Self {
        self.aggregates.push(Aggregate {
            function,
            column: column.into(),
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The half-open `[start, end)` microsecond window of the time condition.
    pub fn with_time_range(mut self, start_micro: i64, end_micro: i64) -> Self {
        self.start_micro = Some(start_micro);
        self.end_micro = Some(end_micro);
        self
    }

    pub fn aggregates(&self) -> &[Aggregate] {
        &self.aggregates
    }

    pub fn has_aggregates(&self) -> bool {
        !self.aggregates.is_empty()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Whether `timestamp` (microseconds) satisfies the time condition.
    pub fn time_matches(&self, timestamp: i64) -> bool {
        if let Some(start) = self.start_micro {
            if timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_micro {
            if timestamp >= end {
                return false;
            }
        }
        true
    }
}

/// What kind of statement the query is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    ListSeries,
    DeleteFromSeries,
    DropSeries,
    SinglePoint,
}

/// Everything the shard layer needs to know about a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    database: String,
    user: User,
    kind: QueryKind,
    query_string: String,
    query_string_with_time_condition: Option<String>,
    select: SelectQuery,
    group_by_interval: Option<Duration>,
    group_by_column_count: usize,
    reads_from_multiple_series: bool,
    run_against_all_servers_in_shard: bool,
}

impl QuerySpec {
    pub fn new(database: impl Into<String>, user: User) -> Self {
        Self {
            database: database.into(),
            user,
            kind: QueryKind::Select,
            query_string: String::new(),
            query_string_with_time_condition: None,
            select: SelectQuery::default(),
            group_by_interval: None,
            group_by_column_count: 0,
            reads_from_multiple_series: false,
            run_against_all_servers_in_shard: false,
        }
    }

    pub fn with_kind(mut self, kind: QueryKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_query_string(mut self, query_string: impl Into<String>) -> Self {
        self.query_string = query_string.into();
        self
    }

    pub fn with_query_string_with_time_condition(mut self, query_string: impl Into<String>) -> Self {
        self.query_string_with_time_condition = Some(query_string.into());
        self
    }

    pub fn with_select_query(mut self, select: SelectQuery) -> Self {
        self.select = select;
        self
    }

    pub fn with_group_by_interval(mut self, interval: Duration) -> Self {
        self.group_by_interval = Some(interval);
        self
    }

    pub fn with_group_by_column_count(mut self, count: usize) -> Self {
        self.group_by_column_count = count;
        self
    }

    pub fn with_reads_from_multiple_series(mut self) -> Self {
        self.reads_from_multiple_series = true;
        self
    }

    pub fn with_run_against_all_servers_in_shard(mut self) -> Self {
        self.run_against_all_servers_in_shard = true;
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn is_list_series(&self) -> bool {
        self.kind == QueryKind::ListSeries
    }

    pub fn is_delete_from_series(&self) -> bool {
        self.kind == QueryKind::DeleteFromSeries
    }

    pub fn is_drop_series(&self) -> bool {
        self.kind == QueryKind::DropSeries
    }

    pub fn is_single_point(&self) -> bool {
        self.kind == QueryKind::SinglePoint
    }

    pub fn has_aggregates(&self) -> bool {
        self.select.has_aggregates()
    }

    pub fn reads_from_multiple_series(&self) -> bool {
        self.reads_from_multiple_series
    }

    pub fn run_against_all_servers_in_shard(&self) -> bool {
        self.run_against_all_servers_in_shard
    }

    pub fn group_by_interval(&self) -> Option<Duration> {
        self.group_by_interval
    }

    pub fn group_by_column_count(&self) -> usize {
        self.group_by_column_count
    }

    pub fn select_query(&self) -> &SelectQuery {
        &self.select
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// The query string with the time condition folded in; falls back to the
    /// plain query string when the parser derived no separate form.
    pub fn query_string_with_time_condition(&self) -> &str {
        self.query_string_with_time_condition
            .as_deref()
            .unwrap_or(&self.query_string)
    }
}
