//! DTOs describing the session, its teams and devices on the wire.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::{
    dto::{format_timestamp, validation::validate_team_id},
    state::session::{
        DeviceInfo, DeviceType, Session, SessionStatus, Team, Transaction, TransactionStatus,
    },
};

/// Public projection of the active session.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: Uuid,
    pub name: String,
    pub status: SessionStatus,
    /// Team identifiers in declaration order.
    pub teams: Vec<String>,
    pub device_count: usize,
    pub transaction_count: usize,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            name: session.name.clone(),
            status: session.status,
            teams: session.team_ids().map(str::to_string).collect(),
            device_count: session.devices.len(),
            transaction_count: session.transactions.len(),
            created_at: format_timestamp(session.created_at),
            updated_at: format_timestamp(session.updated_at),
            ended_at: session.ended_at.map(format_timestamp),
        }
    }
}

/// Score line for one team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TeamScoreSummary {
    pub team_id: String,
    pub score: i64,
    pub multiplier: u32,
    pub completed_groups: Vec<String>,
}

impl From<(&String, &Team)> for TeamScoreSummary {
    fn from((team_id, team): (&String, &Team)) -> Self {
        Self {
            team_id: team_id.clone(),
            score: team.score,
            multiplier: team.multiplier,
            completed_groups: team.completed_groups.iter().cloned().collect(),
        }
    }
}

impl TeamScoreSummary {
    /// Scores of every team in declaration order.
    pub fn all(session: &Session) -> Vec<Self> {
        session.teams.iter().map(Self::from).collect()
    }
}

/// Public projection of a known device.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: String,
    pub device_type: DeviceType,
    pub connected: bool,
    pub connected_at: String,
    pub last_seen: String,
}

impl From<&DeviceInfo> for DeviceSummary {
    fn from(device: &DeviceInfo) -> Self {
        Self {
            device_id: device.device_id.clone(),
            device_type: device.device_type,
            connected: device.connected,
            connected_at: format_timestamp(device.connected_at),
            last_seen: format_timestamp(device.last_seen),
        }
    }
}

/// Wire representation of a transaction log entry.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub id: Uuid,
    pub token_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub device_id: String,
    pub device_type: DeviceType,
    pub timestamp: String,
    pub status: TransactionStatus,
    pub points: i64,
    pub bonus: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&Transaction> for TransactionSummary {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            token_id: tx.token_id.clone(),
            team_id: tx.team_id.clone(),
            device_id: tx.device_id.clone(),
            device_type: tx.device_type,
            timestamp: format_timestamp(tx.timestamp),
            status: tx.status,
            points: tx.points,
            bonus: tx.bonus,
            reason: tx.reason.clone(),
        }
    }
}

/// Session together with the current scoreboard.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStateResponse {
    pub session: Option<SessionSummary>,
    pub scores: Vec<TeamScoreSummary>,
}

/// Team definition supplied by an administrator.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TeamInput {
    pub id: String,
    /// Scoring multiplier applied to GM scans for this team (defaults to 1).
    #[serde(default)]
    pub multiplier: Option<u32>,
}

impl Validate for TeamInput {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(e) = validate_team_id(self.id.trim()) {
            errors.add("id", e);
        }

        if self.multiplier == Some(0) {
            let mut err = validator::ValidationError::new("multiplier");
            err.message = Some("multiplier must be at least 1".into());
            errors.add("multiplier", err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Payload used to start a brand-new session.
#[derive(Debug, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    #[serde(default)]
    #[validate(nested)]
    pub teams: Vec<TeamInput>,
}

/// Payload used to reset the active session.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResetSessionRequest {
    /// Keep the team list (scores are zeroed). Defaults to `true`.
    #[serde(default = "default_preserve_teams")]
    pub preserve_teams: bool,
}

impl Default for ResetSessionRequest {
    fn default() -> Self {
        Self {
            preserve_teams: default_preserve_teams(),
        }
    }
}

fn default_preserve_teams() -> bool {
    true
}
