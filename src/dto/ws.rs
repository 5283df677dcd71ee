use serde::{Deserialize, Serialize, de::IgnoredAny};
use utoipa::ToSchema;

use crate::dto::{
    now_timestamp,
    scan::ScanRequest,
    session::{DeviceSummary, SessionSummary, TeamScoreSummary, TransactionSummary},
};

#[derive(Debug, Serialize)]
/// Uniform wrapper applied to every outbound event.
pub struct Envelope<'a, T> {
    pub event: &'a str,
    pub data: &'a T,
    pub timestamp: String,
}

impl<'a, T: Serialize> Envelope<'a, T> {
    /// Wrap `data` under `event`, stamped with the current server time.
    pub fn new(event: &'a str, data: &'a T) -> Self {
        Self {
            event,
            data,
            timestamp: now_timestamp(),
        }
    }
}

#[derive(Debug, Deserialize)]
/// Messages accepted from device WebSocket clients.
#[serde(tag = "event", content = "data")]
pub enum DeviceInboundMessage {
    /// First frame of every connection.
    #[serde(rename = "device:identify")]
    Identify(Identification),
    /// A single scan, answered with `transaction:result`.
    #[serde(rename = "transaction:submit")]
    SubmitScan(ScanRequest),
    /// Ask for a fresh `sync:full` snapshot. Any `data` is ignored.
    #[serde(rename = "sync:request")]
    SyncRequest(Option<IgnoredAny>),
    /// Liveness check, answered with `heartbeat:ack`. Any `data` is ignored.
    #[serde(rename = "heartbeat")]
    Heartbeat(Option<IgnoredAny>),
}

impl DeviceInboundMessage {
    /// Parse an inbound frame.
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Identity presented by a device when it connects.
pub struct Identification {
    pub device_id: String,
    pub device_type: String,
    /// Pre-shared token required from GM devices when configured.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Acknowledgement delivered to the device room once a batch is applied.
pub struct BatchAck {
    pub batch_id: String,
    pub processed_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Full-state snapshot sent on every connect, reconnect and resync request.
pub struct SyncPayload {
    pub device_id: String,
    /// True when the device was already known before this connection.
    pub reconnection: bool,
    pub session: Option<SessionSummary>,
    pub devices: Vec<DeviceSummary>,
    pub scores: Vec<TeamScoreSummary>,
    /// Tokens already scanned by the requesting GM device (never another device's).
    pub scanned_tokens: Vec<String>,
    pub recent_transactions: Vec<TransactionSummary>,
    pub server_time: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Reply to a heartbeat frame.
pub struct HeartbeatAck {
    pub server_time: String,
}

#[derive(Debug, Serialize, ToSchema)]
/// Error reported to a device over its connection.
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast when a device leaves.
pub struct DeviceDisconnectedEvent {
    pub device_id: String,
    pub device_type: crate::state::session::DeviceType,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast when a team completes a token group.
pub struct GroupCompletedEvent {
    pub team_id: String,
    pub group: String,
    pub bonus: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast whenever the session is created, reset or ended.
pub struct SessionUpdateEvent {
    pub session: Option<SessionSummary>,
    pub scores: Vec<TeamScoreSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identify_frame() {
        let msg = DeviceInboundMessage::from_json_str(
            r#"{"event":"device:identify","data":{"deviceId":"G1","deviceType":"gm"},"timestamp":"2026-10-16T12:00:00Z"}"#,
        )
        .unwrap();
        match msg {
            DeviceInboundMessage::Identify(id) => {
                assert_eq!(id.device_id, "G1");
                assert_eq!(id.device_type, "gm");
                assert!(id.token.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn parses_heartbeat_without_data() {
        let msg = DeviceInboundMessage::from_json_str(r#"{"event":"heartbeat"}"#).unwrap();
        assert!(matches!(msg, DeviceInboundMessage::Heartbeat(_)));
    }

    #[test]
    fn payload_free_events_accept_full_envelopes() {
        for raw in [
            r#"{"event":"heartbeat","data":{},"timestamp":"2026-10-16T12:00:00Z"}"#,
            r#"{"event":"heartbeat","data":null}"#,
            r#"{"event":"heartbeat","data":{"battery":87}}"#,
        ] {
            let msg = DeviceInboundMessage::from_json_str(raw).unwrap();
            assert!(matches!(msg, DeviceInboundMessage::Heartbeat(_)), "{raw}");
        }
        for raw in [
            r#"{"event":"sync:request","data":{}}"#,
            r#"{"event":"sync:request"}"#,
            r#"{"event":"sync:request","data":{},"timestamp":"2026-10-16T12:00:00Z"}"#,
        ] {
            let msg = DeviceInboundMessage::from_json_str(raw).unwrap();
            assert!(matches!(msg, DeviceInboundMessage::SyncRequest(_)), "{raw}");
        }
    }

    #[test]
    fn rejects_unknown_events() {
        assert!(DeviceInboundMessage::from_json_str(r#"{"event":"gm:command","data":{}}"#).is_err());
    }

    #[test]
    fn envelope_wraps_event_data_and_timestamp() {
        let ack = BatchAck {
            batch_id: "b1".into(),
            processed_count: 3,
            total_count: 3,
        };
        let value = serde_json::to_value(Envelope::new("batch:ack", &ack)).unwrap();
        assert_eq!(value["event"], "batch:ack");
        assert_eq!(value["data"]["batchId"], "b1");
        assert_eq!(value["data"]["processedCount"], 3);
        assert!(value["timestamp"].is_string());
    }
}
