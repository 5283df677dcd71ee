//! The single active game session: teams, devices, the per-device GM ledger,
//! the transaction log and the processed-batch cache.

use std::{collections::HashMap, fmt, str::FromStr};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

/// Kind of scanner reporting to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Staff console; scans score and are duplicate-suppressed per device.
    Gm,
    /// Public kiosk; scans are always accepted and never scored.
    Player,
    /// Embedded reader; behaves like a player kiosk.
    Esp32,
}

impl DeviceType {
    /// Wire name of the device type, also used as the type-scoped room name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Gm => "gm",
            DeviceType::Player => "player",
            DeviceType::Esp32 => "esp32",
        }
    }

    /// Every known device type, in room declaration order.
    pub fn all() -> [DeviceType; 3] {
        [DeviceType::Gm, DeviceType::Player, DeviceType::Esp32]
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a device type string is not one of the known variants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device type `{0}` (expected gm, player or esp32)")]
pub struct UnknownDeviceType(pub String);

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gm" => Ok(DeviceType::Gm),
            "player" => Ok(DeviceType::Player),
            "esp32" => Ok(DeviceType::Esp32),
            _ => Err(UnknownDeviceType(value.to_string())),
        }
    }
}

/// Whether the session still accepts scoring scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Scans are processed and scored.
    Active,
    /// Session was closed by an administrator; GM scans are rejected.
    Ended,
}

/// Outcome recorded for a single scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Scan was recorded; GM scans scored.
    Accepted,
    /// GM device already scanned this token.
    Duplicate,
    /// Scan could not be scored (unknown token, team, or no active session).
    Rejected,
}

/// A device that identified itself during this session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: DeviceType,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub connected: bool,
    /// Room names resolved at the last join, in join order.
    pub rooms: Vec<String>,
}

/// Per-team scoring state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub score: i64,
    pub multiplier: u32,
    /// Token groups this team already completed (bonus awarded once).
    #[serde(default)]
    pub completed_groups: IndexSet<String>,
}

impl Team {
    /// Fresh team with a zero score.
    pub fn new(multiplier: u32) -> Self {
        Self {
            score: 0,
            multiplier: multiplier.max(1),
            completed_groups: IndexSet::new(),
        }
    }
}

/// One entry of the append-only transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub token_id: String,
    pub team_id: Option<String>,
    pub device_id: String,
    pub device_type: DeviceType,
    /// Time reported by the scanning device.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub status: TransactionStatus,
    /// Total points credited, group bonus included.
    pub points: i64,
    /// Part of `points` that came from completing a token group.
    #[serde(default)]
    pub bonus: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A batch entry that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    /// Position of the entry inside the submitted batch.
    pub index: usize,
    pub token_id: Option<String>,
    pub error: String,
}

/// Result of reconciling one offline batch, cached by batch id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub device_id: String,
    pub processed_count: usize,
    pub total_count: usize,
    pub failures: Vec<BatchFailure>,
}

/// Aggregated state for the active session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub name: String,
    pub status: SessionStatus,
    /// Teams in declaration order with their scores.
    pub teams: IndexMap<String, Team>,
    pub devices: IndexMap<String, DeviceInfo>,
    /// GM duplicate ledger, keyed by device id.
    pub ledger: HashMap<String, IndexSet<String>>,
    pub transactions: Vec<Transaction>,
    /// Reconciled batches, keyed by device id then batch id.
    pub batches: HashMap<String, HashMap<String, BatchResult>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
}

impl Session {
    /// Build a new active session with the given teams (id, multiplier) in order.
    pub fn new(name: String, teams: impl IntoIterator<Item = (String, u32)>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            name,
            status: SessionStatus::Active,
            teams: teams
                .into_iter()
                .map(|(id, multiplier)| (id, Team::new(multiplier)))
                .collect(),
            devices: IndexMap::new(),
            ledger: HashMap::new(),
            transactions: Vec::new(),
            batches: HashMap::new(),
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// True while scans may still be scored.
    pub fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Active)
    }

    /// Team identifiers in declaration order.
    pub fn team_ids(&self) -> impl Iterator<Item = &str> {
        self.teams.keys().map(String::as_str)
    }

    /// Current score of `team_id`, if the team exists.
    pub fn score(&self, team_id: &str) -> Option<i64> {
        self.teams.get(team_id).map(|team| team.score)
    }

    /// Register a team if it is not already part of the session.
    ///
    /// Returns `false` when the team already existed.
    pub fn add_team(&mut self, team_id: String, multiplier: u32) -> bool {
        if self.teams.contains_key(&team_id) {
            return false;
        }
        self.teams.insert(team_id, Team::new(multiplier));
        self.touch();
        true
    }

    /// Record that `device_id` connected, creating or updating its entry.
    ///
    /// An existing entry keeps its ledger and original connection timestamp.
    /// Returns whether the device was already known before this call.
    pub fn register_device(
        &mut self,
        device_id: &str,
        device_type: DeviceType,
        rooms: Vec<String>,
    ) -> bool {
        let now = OffsetDateTime::now_utc();
        let known = match self.devices.get_mut(device_id) {
            Some(device) => {
                device.device_type = device_type;
                device.last_seen = now;
                device.connected = true;
                device.rooms = rooms;
                true
            }
            None => {
                self.devices.insert(
                    device_id.to_string(),
                    DeviceInfo {
                        device_id: device_id.to_string(),
                        device_type,
                        connected_at: now,
                        last_seen: now,
                        connected: true,
                        rooms,
                    },
                );
                false
            }
        };
        self.touch();
        known
    }

    /// Make sure a device that only submitted scans over HTTP is known.
    pub fn ensure_device(&mut self, device_id: &str, device_type: DeviceType) {
        if let Some(device) = self.devices.get_mut(device_id) {
            device.last_seen = OffsetDateTime::now_utc();
            return;
        }
        let now = OffsetDateTime::now_utc();
        self.devices.insert(
            device_id.to_string(),
            DeviceInfo {
                device_id: device_id.to_string(),
                device_type,
                connected_at: now,
                last_seen: now,
                connected: false,
                rooms: Vec::new(),
            },
        );
    }

    /// Flag a device as disconnected without forgetting its ledger.
    pub fn mark_disconnected(&mut self, device_id: &str) {
        if let Some(device) = self.devices.get_mut(device_id) {
            device.connected = false;
            device.last_seen = OffsetDateTime::now_utc();
            self.touch();
        }
    }

    /// Whether `device_id` already scanned `token_id`.
    pub fn has_scanned(&self, device_id: &str, token_id: &str) -> bool {
        self.ledger
            .get(device_id)
            .is_some_and(|tokens| tokens.contains(token_id))
    }

    /// Insert a token into a device's ledger, returning `false` if it was present.
    pub fn record_scan(&mut self, device_id: &str, token_id: &str) -> bool {
        self.ledger
            .entry(device_id.to_string())
            .or_default()
            .insert(token_id.to_string())
    }

    /// Tokens scanned by `device_id`, in scan order.
    pub fn ledger_for(&self, device_id: &str) -> Vec<String> {
        self.ledger
            .get(device_id)
            .map(|tokens| tokens.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tokens a team was credited for through accepted GM transactions.
    pub fn team_tokens(&self, team_id: &str) -> IndexSet<&str> {
        self.transactions
            .iter()
            .filter(|tx| {
                tx.status == TransactionStatus::Accepted
                    && tx.device_type == DeviceType::Gm
                    && tx.team_id.as_deref() == Some(team_id)
            })
            .map(|tx| tx.token_id.as_str())
            .collect()
    }

    /// Append a transaction, crediting its points to the team when accepted.
    pub fn append_transaction(&mut self, transaction: Transaction) {
        if transaction.status == TransactionStatus::Accepted && transaction.points != 0 {
            if let Some(team) = transaction
                .team_id
                .as_deref()
                .and_then(|id| self.teams.get_mut(id))
            {
                team.score += transaction.points;
            }
        }
        self.transactions.push(transaction);
        self.touch();
    }

    /// Cached result of a batch previously reconciled for `device_id`.
    pub fn cached_batch(&self, device_id: &str, batch_id: &str) -> Option<&BatchResult> {
        self.batches.get(device_id)?.get(batch_id)
    }

    /// Remember a reconciled batch under its device and batch id.
    pub fn cache_batch(&mut self, result: BatchResult) {
        self.batches
            .entry(result.device_id.clone())
            .or_default()
            .insert(result.batch_id.clone(), result);
    }

    /// Clear devices, ledger, transactions and batch cache.
    ///
    /// Teams are kept (with scores zeroed) when `preserve_teams` is set.
    pub fn reset(&mut self, preserve_teams: bool) {
        self.devices.clear();
        self.ledger.clear();
        self.transactions.clear();
        self.batches.clear();
        if preserve_teams {
            for team in self.teams.values_mut() {
                team.score = 0;
                team.completed_groups.clear();
            }
        } else {
            self.teams.clear();
        }
        self.status = SessionStatus::Active;
        self.ended_at = None;
        self.touch();
    }

    /// Close the session; subsequent GM scans are rejected.
    pub fn end(&mut self) {
        let now = OffsetDateTime::now_utc();
        self.status = SessionStatus::Ended;
        self.ended_at = Some(now);
        self.updated_at = now;
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "Friday".into(),
            [("001".to_string(), 1), ("002".to_string(), 2)],
        )
    }

    #[test]
    fn device_type_parses_known_values_only() {
        assert_eq!("gm".parse::<DeviceType>(), Ok(DeviceType::Gm));
        assert_eq!(" ESP32 ".parse::<DeviceType>(), Ok(DeviceType::Esp32));
        assert!("scanner".parse::<DeviceType>().is_err());
    }

    #[test]
    fn register_device_reports_known_devices_and_keeps_ledger() {
        let mut session = session();
        assert!(!session.register_device("G1", DeviceType::Gm, vec!["device:G1".into()]));
        session.record_scan("G1", "kaa001");
        session.mark_disconnected("G1");

        assert!(session.register_device("G1", DeviceType::Gm, vec!["device:G1".into()]));
        assert!(session.devices["G1"].connected);
        assert_eq!(session.ledger_for("G1"), vec!["kaa001".to_string()]);
    }

    #[test]
    fn ledger_is_scoped_per_device() {
        let mut session = session();
        assert!(session.record_scan("G1", "kaa001"));
        assert!(!session.record_scan("G1", "kaa001"));
        assert!(session.record_scan("G2", "kaa001"));
        assert!(session.has_scanned("G2", "kaa001"));
        assert!(!session.has_scanned("G3", "kaa001"));
    }

    #[test]
    fn reset_can_preserve_teams() {
        let mut session = session();
        session.register_device("G1", DeviceType::Gm, Vec::new());
        session.record_scan("G1", "kaa001");
        session.teams.get_mut("001").unwrap().score = 300;
        session.cache_batch(BatchResult {
            batch_id: "b1".into(),
            device_id: "G1".into(),
            processed_count: 0,
            total_count: 0,
            failures: Vec::new(),
        });
        assert!(session.cached_batch("G1", "b1").is_some());
        assert!(session.cached_batch("G2", "b1").is_none());

        session.reset(true);

        assert!(session.devices.is_empty());
        assert!(session.ledger.is_empty());
        assert!(session.batches.is_empty());
        assert_eq!(session.team_ids().collect::<Vec<_>>(), vec!["001", "002"]);
        assert_eq!(session.score("001"), Some(0));

        session.reset(false);
        assert!(session.teams.is_empty());
    }

    #[test]
    fn session_round_trips_through_json_snapshot() {
        let mut session = session();
        session.register_device("G1", DeviceType::Gm, vec!["device:G1".into()]);
        session.record_scan("G1", "kaa001");
        session.end();

        let json = serde_json::to_string(&session).unwrap();
        let restored: Session = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.ledger_for("G1"), vec!["kaa001".to_string()]);
        assert_eq!(restored.status, SessionStatus::Ended);
        assert!(restored.ended_at.is_some());
    }
}
