//! The typed records exchanged with replicas and returned to callers.
//!
//! The cluster transport (how these records move between servers) lives
//! elsewhere; this module only defines their shape and the constructors for
//! the response frames the shard layer emits itself.

use serde::{Deserialize, Serialize};

/// Tag identifying what a [`Request`] asks a replica to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Write,
    Query,
    DropDatabase,
    Heartbeat,
}

/// Tag identifying what a [`Response`] frame carries.
///
/// The shard layer itself only interprets [`ResponseType::EndStream`] and
/// [`ResponseType::AccessDenied`]; everything else is forwarded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    Query,
    EndStream,
    AccessDenied,
    WriteOk,
    Error,
    Heartbeat,
}

/// A single field value of a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
}

impl FieldValue {
    /// The value as a float, when it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Bool(_) | Self::String(_) => None,
        }
    }
}

/// A point in a series: a microsecond timestamp plus one value per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: i64,
    pub values: Vec<FieldValue>,
}

/// A named series with its column names and points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub columns: Vec<String>,
    pub points: Vec<Point>,
}

/// A request to a replica.
///
/// All fields other than the type are optional on the wire. `shard_id` and
/// `request_number` are stamped by the shard layer on outbound writes; the
/// per-hop `id` is assigned by each receiving server, so it is cleared before
/// every forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_type: RequestType,
    pub id: Option<u32>,
    pub database: Option<String>,
    pub series: Vec<Series>,
    pub query: Option<String>,
    pub user_name: Option<String>,
    pub is_db_user: Option<bool>,
    pub shard_id: Option<u32>,
    pub request_number: Option<u32>,
}

impl Request {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            request_type,
            id: None,
            database: None,
            series: Vec::new(),
            query: None,
            user_name: None,
            is_db_user: None,
            shard_id: None,
            request_number: None,
        }
    }

    /// Short description for log lines.
    pub fn description(&self) -> String {
        format!(
            "[id: {}, type: {:?}, database: {}]",
            self.id.map_or_else(|| "none".to_string(), |id| id.to_string()),
            self.request_type,
            self.database.as_deref().unwrap_or("none"),
        )
    }
}

/// A response frame from a replica or from the local query path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub response_type: ResponseType,
    pub series: Option<Series>,
    pub error_message: Option<String>,
}

impl Response {
    /// A payload frame carrying query results.
    pub fn query(series: Series) -> Self {
        Self {
            response_type: ResponseType::Query,
            series: Some(series),
            error_message: None,
        }
    }

    /// The terminal frame of a response stream.
    pub fn end_stream() -> Self {
        Self {
            response_type: ResponseType::EndStream,
            series: None,
            error_message: None,
        }
    }

    /// A terminal frame that also carries an error message.
    pub fn error_end_stream(message: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::EndStream,
            series: None,
            error_message: Some(message.into()),
        }
    }

    /// An in-stream error frame. The stream is still terminated by a
    /// separate [`Response::end_stream`] frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Error,
            series: None,
            error_message: Some(message.into()),
        }
    }

    pub fn access_denied() -> Self {
        Self {
            response_type: ResponseType::AccessDenied,
            series: None,
            error_message: None,
        }
    }

    pub fn write_ok() -> Self {
        Self {
            response_type: ResponseType::WriteOk,
            series: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_description_names_the_hop_id() {
        let mut request = Request::new(RequestType::Query);
        request.database = Some("metrics".into());
        assert_eq!(
            request.description(),
            "[id: none, type: Query, database: metrics]"
        );

        request.id = Some(7);
        assert_eq!(
            request.description(),
            "[id: 7, type: Query, database: metrics]"
        );
    }

    #[test]
    fn response_constructors_tag_frames() {
        assert_eq!(
            Response::end_stream().response_type,
            ResponseType::EndStream
        );
        assert_eq!(
            Response::access_denied().response_type,
            ResponseType::AccessDenied
        );

        let err = Response::error_end_stream("boom");
        assert_eq!(err.response_type, ResponseType::EndStream);
        assert_eq!(err.error_message.as_deref(), Some("boom"));

        let err = Response::error("boom");
        assert_eq!(err.response_type, ResponseType::Error);
        assert_eq!(err.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn field_value_numeric_projection() {
        assert_eq!(FieldValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(FieldValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(FieldValue::Bool(true).as_f64(), None);
        assert_eq!(FieldValue::String("x".into()).as_f64(), None);
    }
}
