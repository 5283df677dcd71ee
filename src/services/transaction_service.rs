//! Device-type-aware duplicate detection and scoring for single scans.

use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

use crate::{
    catalog::{TokenCatalog, normalize_token_id},
    config::ScoringConfig,
    dto::{
        scan::ScanRequest,
        session::{TeamScoreSummary, TransactionSummary},
        ws::GroupCompletedEvent,
    },
    error::ServiceError,
    state::{
        SharedState,
        events::DomainEvent,
        session::{DeviceType, Session, Transaction, TransactionStatus},
    },
};

/// A scan whose required fields have been validated and parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub token_id: String,
    pub team_id: Option<String>,
    pub device_id: String,
    pub device_type: DeviceType,
    pub timestamp: OffsetDateTime,
}

impl TryFrom<ScanRequest> for Scan {
    type Error = ServiceError;

    fn try_from(request: ScanRequest) -> Result<Self, Self::Error> {
        request.validate()?;

        let missing = |field: &str| ServiceError::Validation(format!("{field} is required"));
        let token_id = request.token_id.ok_or_else(|| missing("tokenId"))?;
        let device_id = request.device_id.ok_or_else(|| missing("deviceId"))?;
        let device_type = request
            .device_type
            .ok_or_else(|| missing("deviceType"))?
            .parse::<DeviceType>()
            .map_err(|err| ServiceError::Validation(err.to_string()))?;
        let timestamp = request
            .timestamp
            .ok_or_else(|| missing("timestamp"))
            .and_then(|raw| {
                OffsetDateTime::parse(raw.trim(), &Rfc3339)
                    .map_err(|err| ServiceError::Validation(format!("invalid timestamp: {err}")))
            })?;

        Ok(Self {
            token_id: normalize_token_id(&token_id),
            team_id: request
                .team_id
                .map(|team| team.trim().to_string())
                .filter(|team| !team.is_empty()),
            device_id: device_id.trim().to_string(),
            device_type,
            timestamp,
        })
    }
}

/// Result of applying one scan to the session.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub transaction: Transaction,
    /// Score of the credited team after the scan, for GM scans against a known team.
    pub team_score: Option<i64>,
    /// Group completed by this scan, if any.
    pub completed_group: Option<GroupCompletedEvent>,
    /// Whether the transaction was appended to the session log.
    pub logged: bool,
}

impl ScanOutcome {
    fn unlogged(transaction: Transaction) -> Self {
        Self {
            transaction,
            team_score: None,
            completed_group: None,
            logged: false,
        }
    }
}

/// Apply one validated scan to the session.
///
/// The duplicate check, ledger insert, log append and score credit all happen
/// against the same `&mut Session`, so callers holding the session lock get
/// an indivisible step per scan.
pub fn process(
    session: Option<&mut Session>,
    catalog: &TokenCatalog,
    scoring: &ScoringConfig,
    scan: &Scan,
) -> ScanOutcome {
    let mut transaction = Transaction {
        id: Uuid::new_v4(),
        token_id: scan.token_id.clone(),
        team_id: scan.team_id.clone(),
        device_id: scan.device_id.clone(),
        device_type: scan.device_type,
        timestamp: scan.timestamp,
        recorded_at: OffsetDateTime::now_utc(),
        status: TransactionStatus::Accepted,
        points: 0,
        bonus: 0,
        reason: None,
    };

    match scan.device_type {
        DeviceType::Player | DeviceType::Esp32 => {
            let Some(session) = session else {
                return ScanOutcome::unlogged(transaction);
            };
            session.ensure_device(&scan.device_id, scan.device_type);
            session.append_transaction(transaction.clone());
            ScanOutcome {
                transaction,
                team_score: None,
                completed_group: None,
                logged: true,
            }
        }
        DeviceType::Gm => {
            let Some(session) = session else {
                transaction.status = TransactionStatus::Rejected;
                transaction.reason = Some("no active session".into());
                return ScanOutcome::unlogged(transaction);
            };
            session.ensure_device(&scan.device_id, scan.device_type);
            process_gm(session, catalog, scoring, scan, transaction)
        }
    }
}

fn process_gm(
    session: &mut Session,
    catalog: &TokenCatalog,
    scoring: &ScoringConfig,
    scan: &Scan,
    mut transaction: Transaction,
) -> ScanOutcome {
    let rejection = if !session.is_active() {
        Some("session has ended".to_string())
    } else if session.has_scanned(&scan.device_id, &scan.token_id) {
        transaction.status = TransactionStatus::Duplicate;
        None
    } else {
        match scan.team_id.as_deref() {
            None => Some("teamId is required for GM scans".to_string()),
            Some(team) if !session.teams.contains_key(team) => {
                Some(format!("unknown team `{team}`"))
            }
            Some(_) if catalog.get(&scan.token_id).is_none() => {
                Some(format!("unknown token `{}`", scan.token_id))
            }
            Some(_) => None,
        }
    };

    if let Some(reason) = rejection {
        transaction.status = TransactionStatus::Rejected;
        transaction.reason = Some(reason);
    }

    let (Some(team_id), Some(token), TransactionStatus::Accepted) = (
        scan.team_id.as_deref(),
        catalog.get(&scan.token_id),
        transaction.status,
    ) else {
        let team_score = scan.team_id.as_deref().and_then(|team| session.score(team));
        session.append_transaction(transaction.clone());
        return ScanOutcome {
            transaction,
            team_score,
            completed_group: None,
            logged: true,
        };
    };

    session.record_scan(&scan.device_id, &scan.token_id);

    let team_multiplier = session
        .teams
        .get(team_id)
        .map(|team| i64::from(team.multiplier))
        .unwrap_or(1);
    let points = token.base_points(scoring) * team_multiplier;

    let completed_group = token.group.as_ref().and_then(|group| {
        let team = session.teams.get(team_id)?;
        if group.multiplier <= 1 || team.completed_groups.contains(&group.name) {
            return None;
        }
        let members = catalog.group_members(&group.name);
        let owned = session.team_tokens(team_id);
        let complete = members
            .iter()
            .all(|member| member.token_id == token.token_id || owned.contains(member.token_id.as_str()));
        if !complete {
            return None;
        }
        let group_base: i64 = members.iter().map(|member| member.base_points(scoring)).sum();
        Some(GroupCompletedEvent {
            team_id: team_id.to_string(),
            group: group.name.clone(),
            bonus: group_base * i64::from(group.multiplier - 1),
        })
    });

    if let Some(completed) = &completed_group {
        if let Some(team) = session.teams.get_mut(team_id) {
            team.completed_groups.insert(completed.group.clone());
        }
        transaction.bonus = completed.bonus;
    }
    transaction.points = points + transaction.bonus;

    session.append_transaction(transaction.clone());
    debug!(
        device_id = %scan.device_id,
        token_id = %scan.token_id,
        team_id,
        points = transaction.points,
        "gm scan accepted"
    );

    ScanOutcome {
        team_score: session.score(team_id),
        transaction,
        completed_group,
        logged: true,
    }
}

/// Announce the effects of `outcome` on the domain event channel.
///
/// Must be called with the session lock still held so events keep mutation order.
pub(crate) fn publish_outcome(state: &SharedState, session: &Session, outcome: &ScanOutcome) {
    if !outcome.logged {
        return;
    }

    let events = state.events();
    events.publish(DomainEvent::TransactionRecorded {
        session_id: session.id,
        transaction: TransactionSummary::from(&outcome.transaction),
    });

    if outcome.transaction.points != 0 {
        if let Some((team_id, team)) = outcome
            .transaction
            .team_id
            .as_deref()
            .and_then(|id| session.teams.get_key_value(id))
        {
            events.publish(DomainEvent::ScoreUpdated {
                session_id: session.id,
                score: TeamScoreSummary::from((team_id, team)),
            });
        }
    }

    if let Some(completed) = &outcome.completed_group {
        info!(
            team_id = %completed.team_id,
            group = %completed.group,
            bonus = completed.bonus,
            "token group completed"
        );
        events.publish(DomainEvent::GroupCompleted {
            session_id: session.id,
            completed: completed.clone(),
        });
    }
}

/// Notify the content subsystem about an accepted scan of a known token.
///
/// Must be called after the session lock is released.
pub(crate) fn trigger_content(state: &SharedState, outcome: &ScanOutcome) {
    if outcome.transaction.status != TransactionStatus::Accepted {
        return;
    }
    if let Some(token) = state.catalog().get(&outcome.transaction.token_id) {
        state.content().on_accepted(&outcome.transaction, token);
    }
}

/// Validate and apply a single scan submitted over HTTP or WebSocket.
pub async fn process_scan(
    state: &SharedState,
    request: ScanRequest,
) -> Result<ScanOutcome, ServiceError> {
    let scan = Scan::try_from(request)?;
    let config = state.config();

    let outcome = {
        let mut guard = state.lock_session().await;
        let outcome = process(guard.as_mut(), state.catalog(), config.scoring(), &scan);
        if let Some(session) = guard.as_ref() {
            if outcome.logged {
                publish_outcome(state, session, &outcome);
                state.mark_dirty();
            }
        }
        outcome
    };

    info!(
        device_id = %scan.device_id,
        device_type = %scan.device_type,
        token_id = %scan.token_id,
        status = ?outcome.transaction.status,
        points = outcome.transaction.points,
        "scan processed"
    );

    trigger_content(state, &outcome);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        catalog::{TokenDefinition, TokenGroup},
        config::AppConfig,
        services::content::ContentTrigger,
        state::AppState,
    };

    fn token(id: &str, rating: u8, kind: &str, group: Option<&str>) -> TokenDefinition {
        TokenDefinition {
            token_id: id.into(),
            value_rating: Some(rating),
            memory_type: Some(kind.into()),
            group: group.and_then(TokenGroup::parse),
            video: None,
        }
    }

    fn catalog() -> TokenCatalog {
        TokenCatalog::from_definitions([
            token("kaa001", 3, "Business", None),
            token("jaw001", 1, "Personal", Some("Pair (x2)")),
            token("jaw002", 2, "Personal", Some("Pair (x2)")),
        ])
    }

    fn session() -> Session {
        Session::new("Test".into(), [("001".to_string(), 1), ("002".to_string(), 2)])
    }

    fn scan(token: &str, team: Option<&str>, device: &str, kind: DeviceType) -> Scan {
        Scan {
            token_id: token.into(),
            team_id: team.map(str::to_string),
            device_id: device.into(),
            device_type: kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    fn apply(session: &mut Session, scan: &Scan) -> ScanOutcome {
        process(Some(session), &catalog(), &ScoringConfig::default(), scan)
    }

    #[test]
    fn gm_rescans_are_duplicates_and_score_once() {
        let mut session = session();
        let scan = scan("kaa001", Some("001"), "G1", DeviceType::Gm);

        let statuses: Vec<_> = (0..4)
            .map(|_| apply(&mut session, &scan).transaction.status)
            .collect();

        assert_eq!(
            statuses,
            vec![
                TransactionStatus::Accepted,
                TransactionStatus::Duplicate,
                TransactionStatus::Duplicate,
                TransactionStatus::Duplicate,
            ]
        );
        assert_eq!(session.score("001"), Some(3_000));
        assert_eq!(session.transactions.len(), 4);
    }

    #[test]
    fn player_and_esp32_scans_are_always_accepted_without_points() {
        let mut session = session();
        for kind in [DeviceType::Player, DeviceType::Esp32] {
            let scan = scan("kaa001", Some("001"), "P1", kind);
            for _ in 0..3 {
                let outcome = apply(&mut session, &scan);
                assert_eq!(outcome.transaction.status, TransactionStatus::Accepted);
                assert_eq!(outcome.transaction.points, 0);
            }
        }
        assert_eq!(session.score("001"), Some(0));
        assert!(session.ledger.is_empty());
        assert_eq!(session.transactions.len(), 6);
    }

    #[test]
    fn gm_ledger_is_scoped_per_device() {
        let mut session = session();
        let first = apply(&mut session, &scan("kaa001", Some("001"), "G1", DeviceType::Gm));
        let second = apply(&mut session, &scan("kaa001", Some("002"), "G2", DeviceType::Gm));
        assert_eq!(first.transaction.status, TransactionStatus::Accepted);
        assert_eq!(second.transaction.status, TransactionStatus::Accepted);
        assert_eq!(session.score("002"), Some(6_000));
    }

    #[test]
    fn gm_scan_without_session_is_rejected_and_not_logged() {
        let outcome = process(
            None,
            &catalog(),
            &ScoringConfig::default(),
            &scan("kaa001", Some("001"), "G1", DeviceType::Gm),
        );
        assert_eq!(outcome.transaction.status, TransactionStatus::Rejected);
        assert!(!outcome.logged);
    }

    #[test]
    fn rejected_gm_scans_leave_ledger_and_scores_untouched() {
        let mut session = session();
        let cases = [
            scan("kaa001", None, "G1", DeviceType::Gm),
            scan("kaa001", Some("999"), "G1", DeviceType::Gm),
            scan("zzz999", Some("001"), "G1", DeviceType::Gm),
        ];
        for case in &cases {
            let outcome = apply(&mut session, case);
            assert_eq!(outcome.transaction.status, TransactionStatus::Rejected);
            assert!(outcome.transaction.reason.is_some());
        }
        assert!(!session.has_scanned("G1", "kaa001"));
        assert_eq!(session.score("001"), Some(0));

        let retry = apply(&mut session, &scan("kaa001", Some("001"), "G1", DeviceType::Gm));
        assert_eq!(retry.transaction.status, TransactionStatus::Accepted);
    }

    #[test]
    fn ended_session_rejects_gm_scans() {
        let mut session = session();
        session.end();
        let outcome = apply(&mut session, &scan("kaa001", Some("001"), "G1", DeviceType::Gm));
        assert_eq!(outcome.transaction.status, TransactionStatus::Rejected);
        assert_eq!(session.score("001"), Some(0));
    }

    #[test]
    fn completing_a_group_awards_bonus_once() {
        let mut session = session();
        let first = apply(&mut session, &scan("jaw001", Some("001"), "G1", DeviceType::Gm));
        assert!(first.completed_group.is_none());
        assert_eq!(first.transaction.points, 100);

        let second = apply(&mut session, &scan("jaw002", Some("001"), "G2", DeviceType::Gm));
        let completed = second.completed_group.expect("group should complete");
        assert_eq!(completed.group, "Pair");
        assert_eq!(completed.bonus, 600);
        assert_eq!(second.transaction.points, 500 + 600);
        assert_eq!(session.score("001"), Some(100 + 500 + 600));

        // another station may still score the token, but the bonus is not repeated
        let third = apply(&mut session, &scan("jaw001", Some("001"), "G3", DeviceType::Gm));
        assert!(third.completed_group.is_none());
        assert_eq!(third.transaction.points, 100);
        assert_eq!(session.score("001"), Some(1_400));
    }

    #[test]
    fn score_is_sum_of_accepted_points() {
        let mut session = session();
        for (token, team, device) in [
            ("kaa001", "001", "G1"),
            ("kaa001", "001", "G1"),
            ("jaw001", "002", "G1"),
            ("jaw002", "002", "G1"),
        ] {
            apply(&mut session, &scan(token, Some(team), device, DeviceType::Gm));
        }
        for team in ["001", "002"] {
            let sum: i64 = session
                .transactions
                .iter()
                .filter(|tx| {
                    tx.status == TransactionStatus::Accepted && tx.team_id.as_deref() == Some(team)
                })
                .map(|tx| tx.points)
                .sum();
            assert_eq!(session.score(team), Some(sum));
        }
    }

    #[test]
    fn scan_conversion_rejects_incomplete_requests() {
        let err = Scan::try_from(ScanRequest {
            token_id: Some("kaa001".into()),
            ..ScanRequest::default()
        })
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = Scan::try_from(ScanRequest {
            token_id: Some("kaa001".into()),
            device_id: Some("G1".into()),
            device_type: Some("tablet".into()),
            timestamp: Some("2026-10-16T12:00:00Z".into()),
            team_id: None,
        })
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn scan_conversion_normalizes_token_id() {
        let scan = Scan::try_from(ScanRequest {
            token_id: Some(" KAA001 ".into()),
            device_id: Some("G1".into()),
            device_type: Some("GM".into()),
            timestamp: Some("2026-10-16T12:00:00Z".into()),
            team_id: Some("001".into()),
        })
        .unwrap();
        assert_eq!(scan.token_id, "kaa001");
        assert_eq!(scan.device_type, DeviceType::Gm);
    }

    #[derive(Default)]
    struct RecordingTrigger(Mutex<Vec<String>>);

    impl ContentTrigger for RecordingTrigger {
        fn on_accepted(&self, transaction: &Transaction, _token: &TokenDefinition) {
            self.0.lock().unwrap().push(transaction.token_id.clone());
        }
    }

    #[tokio::test]
    async fn process_scan_publishes_events_in_mutation_order() {
        let trigger = Arc::new(RecordingTrigger::default());
        let state = AppState::with_content_trigger(AppConfig::default(), catalog(), trigger.clone());
        state.replace_session(Some(session())).await;
        let mut events = state.events().subscribe();

        let request = ScanRequest {
            token_id: Some("kaa001".into()),
            team_id: Some("001".into()),
            device_id: Some("G1".into()),
            device_type: Some("gm".into()),
            timestamp: Some("2026-10-16T12:00:00Z".into()),
        };
        let outcome = process_scan(&state, request.clone()).await.unwrap();
        assert_eq!(outcome.team_score, Some(3_000));
        let duplicate = process_scan(&state, request).await.unwrap();
        assert_eq!(duplicate.transaction.status, TransactionStatus::Duplicate);

        assert!(matches!(
            events.recv().await.unwrap(),
            DomainEvent::TransactionRecorded { .. }
        ));
        match events.recv().await.unwrap() {
            DomainEvent::ScoreUpdated { score, .. } => assert_eq!(score.score, 3_000),
            other => panic!("unexpected event {other:?}"),
        }
        match events.recv().await.unwrap() {
            DomainEvent::TransactionRecorded { transaction, .. } => {
                assert_eq!(transaction.status, TransactionStatus::Duplicate)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(*trigger.0.lock().unwrap(), vec!["kaa001".to_string()]);
    }
}
