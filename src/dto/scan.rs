//! Request/response payloads for scan submission over HTTP and WebSocket.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    dto::{
        session::TransactionSummary,
        validation::{
            missing, validate_batch_id, validate_device_id, validate_team_id, validate_token_id,
        },
    },
    state::session::{BatchResult, DeviceType},
};

/// A single scan as reported by a device.
///
/// Every field is optional on the wire so that omissions surface as
/// validation errors instead of opaque deserialization failures.
#[derive(Debug, Clone, Default, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub token_id: Option<String>,
    pub team_id: Option<String>,
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    /// RFC 3339 time at which the token was scanned.
    pub timestamp: Option<String>,
}

impl Validate for ScanRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        match self.token_id.as_deref().map(str::trim) {
            Some(id) => {
                if let Err(e) = validate_token_id(id) {
                    errors.add("tokenId", e);
                }
            }
            None => errors.add("tokenId", missing("tokenId")),
        }

        match self.device_id.as_deref().map(str::trim) {
            Some(id) => {
                if let Err(e) = validate_device_id(id) {
                    errors.add("deviceId", e);
                }
            }
            None => errors.add("deviceId", missing("deviceId")),
        }

        match self.device_type.as_deref() {
            Some(kind) => {
                if let Err(unknown) = kind.parse::<DeviceType>() {
                    let mut err = ValidationError::new("device_type");
                    err.message = Some(unknown.to_string().into());
                    errors.add("deviceType", err);
                }
            }
            None => errors.add("deviceType", missing("deviceType")),
        }

        match self.timestamp.as_deref() {
            Some(raw) => {
                if time::OffsetDateTime::parse(
                    raw.trim(),
                    &time::format_description::well_known::Rfc3339,
                )
                .is_err()
                {
                    let mut err = ValidationError::new("timestamp");
                    err.message = Some("timestamp must be an RFC 3339 date-time".into());
                    errors.add("timestamp", err);
                }
            }
            None => errors.add("timestamp", missing("timestamp")),
        }

        if let Some(team_id) = self.team_id.as_deref() {
            if let Err(e) = validate_team_id(team_id.trim()) {
                errors.add("teamId", e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A group of offline-collected scans identified by a client-generated id.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub batch_id: Option<String>,
    pub device_id: Option<String>,
    #[serde(default)]
    pub entries: Vec<ScanRequest>,
    /// RFC 3339 time at which the client submitted the batch.
    #[serde(default)]
    pub submitted_at: Option<String>,
}

impl Validate for BatchRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        match self.batch_id.as_deref().map(str::trim) {
            Some(id) => {
                if let Err(e) = validate_batch_id(id) {
                    errors.add("batchId", e);
                }
            }
            None => errors.add("batchId", missing("batchId")),
        }

        match self.device_id.as_deref().map(str::trim) {
            Some(id) => {
                if let Err(e) = validate_device_id(id) {
                    errors.add("deviceId", e);
                }
            }
            None => errors.add("deviceId", missing("deviceId")),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Result of processing a single scan.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub transaction: TransactionSummary,
    /// Team score after the scan, when the scan targeted a known team.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_score: Option<i64>,
}

/// Response returned when a batch submission has been applied (or replayed).
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchSubmissionResponse {
    /// True when the batch id was already processed and the cached result is returned.
    pub replayed: bool,
    pub result: BatchResult,
}
