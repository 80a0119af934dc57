//! JSON protocol spoken over WebSocket text frames.
//!
//! Client → server:
//! ```text
//! { "request_id": 7, "type": "place_cell", "identity": "…", "x": 5, "y": 5, "color": 2 }
//! { "request_id": 8, "type": "get_cells", "since": "2024-05-01T12:00:00Z" }
//! ```
//!
//! Server → client:
//! ```text
//! { "frame": "response", "request_id": 7,
//!   "result": { "ok": { "type": "placement", "next_allowed_at": 1714564805000, "placed_at": 1714564800000 } } }
//! { "frame": "response", "request_id": 9,
//!   "result": { "err": { "kind": "not_found", "message": "unknown identity: …" } } }
//! { "frame": "event", "event": { "kind": "cell_placed", "record": { "sequence": 42, … } } }
//! ```
//!
//! Responses answer exactly one request and carry its `request_id`. Events
//! are pushed to every connection subscribed to the event's channel, with no
//! request id.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use pixelwall_core::{
    Cell, ChangeRecord, ErrorKind, FeedEvent, IdentityId, PlaceCellRequest, PlacementError,
    PlacementOutcome, Timestamp,
};

/// Chosen by the client, echoed back on the matching response.
pub type RequestId = u64;

/// Lower bound for `get_cells`, as milliseconds or as an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Since {
    Millis(i64),
    Text(String),
}

impl Since {
    /// The form the engine parses.
    pub fn as_query(&self) -> String {
        match self {
            Since::Millis(ms) => ms.to_string(),
            Since::Text(text) => text.clone(),
        }
    }
}

impl From<Timestamp> for Since {
    fn from(ts: Timestamp) -> Self {
        Since::Millis(ts.as_millis())
    }
}

/// Operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBody {
    IssueIdentity,
    PlaceCell(PlaceCellRequest),
    GetCells {
        #[serde(default)]
        since: Option<Since>,
    },
    GetCooldown {
        identity: String,
    },
    ChangesSince {
        sequence: u64,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub body: RequestBody,
}

impl ClientRequest {
    pub fn new(request_id: RequestId, body: RequestBody) -> Self {
        Self { request_id, body }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a text frame.
    ///
    /// On failure, the error carries the frame's `request_id` when one could
    /// be recovered, so the server can still answer the right request.
    pub fn decode(text: &str) -> Result<Self, MalformedRequest> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| MalformedRequest {
            request_id: None,
            reason: e.to_string(),
        })?;
        let request_id = value.get("request_id").and_then(serde_json::Value::as_u64);
        serde_json::from_value(value).map_err(|e| MalformedRequest {
            request_id,
            reason: e.to_string(),
        })
    }
}

/// A text frame that did not parse as a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed request: {reason}")]
pub struct MalformedRequest {
    pub request_id: Option<RequestId>,
    pub reason: String,
}

/// Successful response payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    Identity {
        identity: IdentityId,
    },
    /// `placed_at` is `null` when the identity was still cooling down.
    Placement(PlacementOutcome),
    Cells {
        cells: Vec<Cell>,
    },
    Cooldown {
        next_allowed_at: Option<Timestamp>,
    },
    /// `records` is `null` when the window was trimmed from the feed.
    Changes {
        records: Option<Vec<ChangeRecord>>,
        latest_sequence: u64,
    },
    Pong {
        latest_sequence: u64,
    },
}

/// Wire form of a [`PlacementError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&PlacementError> for ErrorBody {
    fn from(err: &PlacementError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message().to_string(),
        }
    }
}

impl From<ErrorBody> for PlacementError {
    fn from(body: ErrorBody) -> Self {
        PlacementError::from_parts(body.kind, body.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok(ResponsePayload),
    Err(ErrorBody),
}

impl Outcome {
    pub fn into_result(self) -> Result<ResponsePayload, PlacementError> {
        match self {
            Outcome::Ok(payload) => Ok(payload),
            Outcome::Err(body) => Err(body.into()),
        }
    }
}

impl From<Result<ResponsePayload, PlacementError>> for Outcome {
    fn from(result: Result<ResponsePayload, PlacementError>) -> Self {
        match result {
            Ok(payload) => Outcome::Ok(payload),
            Err(err) => Outcome::Err(ErrorBody::from(&err)),
        }
    }
}

/// Everything the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ServerFrame {
    Response {
        request_id: RequestId,
        result: Outcome,
    },
    Event {
        event: FeedEvent,
    },
}

impl ServerFrame {
    pub fn response(request_id: RequestId, result: impl Into<Outcome>) -> Self {
        ServerFrame::Response {
            request_id,
            result: result.into(),
        }
    }

    pub fn error(request_id: RequestId, err: &PlacementError) -> Self {
        ServerFrame::Response {
            request_id,
            result: Outcome::Err(err.into()),
        }
    }

    pub fn event(event: FeedEvent) -> Self {
        ServerFrame::Event { event }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelwall_core::{Color, IdentityCreatedRecord, Position, Scalar};
    use serde_json::json;

    #[test]
    fn test_place_cell_request_shape() {
        let id = IdentityId::generate();
        let request = ClientRequest::new(
            7,
            RequestBody::PlaceCell(PlaceCellRequest::new(id, 5, 6, 2)),
        );
        let value: serde_json::Value = serde_json::from_str(&request.encode().unwrap()).unwrap();
        assert_eq!(value["request_id"], 7);
        assert_eq!(value["type"], "place_cell");
        assert_eq!(value["identity"], id.to_string());
        assert_eq!(value["x"], 5);
        assert_eq!(value["color"], 2);

        let decoded = ClientRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_place_cell_keeps_non_integer_operands() {
        let text = json!({
            "request_id": 1,
            "type": "place_cell",
            "identity": "abc",
            "x": "5",
            "y": 1.5,
            "color": 3.0,
        })
        .to_string();
        let RequestBody::PlaceCell(place) = ClientRequest::decode(&text).unwrap().body else {
            panic!("expected place_cell");
        };
        assert_eq!(place.x, Scalar::NotInteger("string \"5\"".into()));
        assert_eq!(place.y, Scalar::NotInteger("number 1.5".into()));
        assert_eq!(place.color, Scalar::Integer(3));
    }

    #[test]
    fn test_get_cells_since_forms() {
        let millis = ClientRequest::decode(r#"{"request_id":2,"type":"get_cells","since":1000}"#).unwrap();
        assert_eq!(
            millis.body,
            RequestBody::GetCells {
                since: Some(Since::Millis(1000))
            }
        );

        let text = ClientRequest::decode(
            r#"{"request_id":3,"type":"get_cells","since":"2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();
        let RequestBody::GetCells { since: Some(since) } = text.body else {
            panic!("expected since");
        };
        assert_eq!(since.as_query(), "2024-05-01T12:00:00Z");

        let none = ClientRequest::decode(r#"{"request_id":4,"type":"get_cells"}"#).unwrap();
        assert_eq!(none.body, RequestBody::GetCells { since: None });
    }

    #[test]
    fn test_malformed_request_keeps_request_id() {
        let err = ClientRequest::decode(r#"{"request_id":9,"type":"teleport"}"#).unwrap_err();
        assert_eq!(err.request_id, Some(9));

        let err = ClientRequest::decode("not json").unwrap_err();
        assert_eq!(err.request_id, None);
    }

    #[test]
    fn test_rate_limited_placement_has_null_placed_at() {
        let frame = ServerFrame::response(
            4,
            Ok(ResponsePayload::Placement(PlacementOutcome {
                next_allowed_at: Timestamp::from_millis(5_000),
                placed_at: None,
            })),
        );
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["frame"], "response");
        assert_eq!(value["result"]["ok"]["type"], "placement");
        assert_eq!(value["result"]["ok"]["next_allowed_at"], 5_000);
        assert!(value["result"]["ok"]["placed_at"].is_null());
    }

    #[test]
    fn test_error_frame_shape() {
        let err = PlacementError::NotFound("unknown identity".into());
        let frame = ServerFrame::error(11, &err);
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["result"]["err"]["kind"], "not_found");

        let ServerFrame::Response { result, .. } = ServerFrame::decode(&frame.encode().unwrap()).unwrap() else {
            panic!("expected response");
        };
        let back = result.into_result().unwrap_err();
        assert_eq!(back.kind(), ErrorKind::NotFound);
        assert_eq!(back.message(), "unknown identity");
    }

    #[test]
    fn test_event_frame_shape() {
        let record = ChangeRecord {
            sequence: 12,
            position: Position::new(1, 2).unwrap(),
            color: Color::new(3).unwrap(),
            placed_at: Timestamp::from_millis(99),
        };
        let frame = ServerFrame::event(FeedEvent::CellPlaced(record));
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["frame"], "event");
        assert_eq!(value["event"]["kind"], "cell_placed");
        assert_eq!(value["event"]["record"]["sequence"], 12);
        assert_eq!(ServerFrame::decode(&frame.encode().unwrap()).unwrap(), frame);

        let created = ServerFrame::event(FeedEvent::IdentityCreated(IdentityCreatedRecord {
            id: IdentityId::generate(),
        }));
        assert_eq!(ServerFrame::decode(&created.encode().unwrap()).unwrap(), created);
    }
}
