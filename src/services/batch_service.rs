//! Idempotent reconciliation of offline-collected scan batches.

use tracing::info;
use validator::Validate;

use crate::{
    catalog::TokenCatalog,
    config::ScoringConfig,
    dto::{
        scan::{BatchRequest, BatchSubmissionResponse, ScanRequest},
        ws::BatchAck,
    },
    error::ServiceError,
    services::transaction_service::{self, Scan, ScanOutcome},
    state::{
        SharedState,
        events::DomainEvent,
        session::{BatchFailure, BatchResult, Session},
    },
};

/// What happened to one batch submission.
#[derive(Debug)]
pub struct Reconciliation {
    pub result: BatchResult,
    /// Per-entry outcomes, empty on replay.
    pub outcomes: Vec<ScanOutcome>,
    /// True when the batch id was already cached and nothing was applied.
    pub replayed: bool,
}

/// Apply `entries` once per `(device_id, batch_id)`.
///
/// A cached result is returned unchanged on replay. Otherwise entries are
/// folded in order; a failing entry is recorded and the fold continues. The
/// result is cached even when it contains failures.
pub fn reconcile(
    session: &mut Session,
    catalog: &TokenCatalog,
    scoring: &ScoringConfig,
    batch_id: &str,
    device_id: &str,
    entries: Vec<ScanRequest>,
) -> Reconciliation {
    if let Some(cached) = session.cached_batch(device_id, batch_id) {
        return Reconciliation {
            result: cached.clone(),
            outcomes: Vec::new(),
            replayed: true,
        };
    }

    let total_count = entries.len();
    let mut failures = Vec::new();
    let mut outcomes = Vec::with_capacity(total_count);

    for (index, mut entry) in entries.into_iter().enumerate() {
        if entry.device_id.is_none() {
            entry.device_id = Some(device_id.to_string());
        }
        let token_id = entry.token_id.clone();
        match Scan::try_from(entry) {
            Ok(scan) => {
                outcomes.push(transaction_service::process(
                    Some(&mut *session),
                    catalog,
                    scoring,
                    &scan,
                ));
            }
            Err(err) => failures.push(BatchFailure {
                index,
                token_id,
                error: err.to_string(),
            }),
        }
    }

    let result = BatchResult {
        batch_id: batch_id.to_string(),
        device_id: device_id.to_string(),
        processed_count: outcomes.len(),
        total_count,
        failures,
    };
    session.cache_batch(result.clone());

    Reconciliation {
        result,
        outcomes,
        replayed: false,
    }
}

/// Validate and reconcile a batch, then acknowledge it to the device room.
pub async fn submit_batch(
    state: &SharedState,
    request: BatchRequest,
) -> Result<BatchSubmissionResponse, ServiceError> {
    request.validate()?;
    let config = state.config();

    let batch_id = request
        .batch_id
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let device_id = request
        .device_id
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    if request.entries.len() > config.max_batch_entries() {
        return Err(ServiceError::Validation(format!(
            "batch holds {} entries (limit {})",
            request.entries.len(),
            config.max_batch_entries()
        )));
    }

    let reconciliation = {
        let mut guard = state.lock_session().await;
        let session = guard.as_mut().ok_or(ServiceError::NoActiveSession)?;

        let reconciliation = reconcile(
            session,
            state.catalog(),
            config.scoring(),
            &batch_id,
            &device_id,
            request.entries,
        );

        for outcome in &reconciliation.outcomes {
            transaction_service::publish_outcome(state, session, outcome);
        }
        state.events().publish(DomainEvent::BatchProcessed {
            device_id: device_id.clone(),
            ack: BatchAck {
                batch_id: batch_id.clone(),
                processed_count: reconciliation.result.processed_count,
                total_count: reconciliation.result.total_count,
            },
        });
        if !reconciliation.replayed {
            state.mark_dirty();
        }
        reconciliation
    };

    info!(
        batch_id = %batch_id,
        device_id = %device_id,
        replayed = reconciliation.replayed,
        processed = reconciliation.result.processed_count,
        total = reconciliation.result.total_count,
        failures = reconciliation.result.failures.len(),
        "batch reconciled"
    );

    for outcome in &reconciliation.outcomes {
        transaction_service::trigger_content(state, outcome);
    }

    Ok(BatchSubmissionResponse {
        replayed: reconciliation.replayed,
        result: reconciliation.result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::TokenDefinition,
        config::AppConfig,
        state::{AppState, session::TransactionStatus},
    };

    fn catalog() -> TokenCatalog {
        TokenCatalog::from_definitions(["tok001", "tok002", "tok003"].map(|id| TokenDefinition {
            token_id: id.into(),
            value_rating: Some(2),
            memory_type: Some("Personal".into()),
            group: None,
            video: None,
        }))
    }

    fn entry(token: &str) -> ScanRequest {
        ScanRequest {
            token_id: Some(token.into()),
            team_id: Some("001".into()),
            device_id: None,
            device_type: Some("gm".into()),
            timestamp: Some("2026-10-16T12:00:00Z".into()),
        }
    }

    fn session() -> Session {
        Session::new("Test".into(), [("001".to_string(), 1)])
    }

    #[test]
    fn replay_returns_identical_result_without_reapplying() {
        let mut session = session();
        let entries = vec![entry("tok001"), entry("tok002"), entry("tok003")];
        let scoring = ScoringConfig::default();

        let first = reconcile(&mut session, &catalog(), &scoring, "b1", "G1", entries.clone());
        let score = session.score("001");
        let second = reconcile(&mut session, &catalog(), &scoring, "b1", "G1", entries);

        assert!(!first.replayed);
        assert!(second.replayed);
        assert!(second.outcomes.is_empty());
        assert_eq!(
            serde_json::to_vec(&first.result).unwrap(),
            serde_json::to_vec(&second.result).unwrap()
        );
        assert_eq!(session.score("001"), score);
        assert_eq!(score, Some(1_500));
        assert_eq!(session.transactions.len(), 3);
    }

    #[test]
    fn same_batch_id_from_another_device_is_applied() {
        let mut session = session();
        let scoring = ScoringConfig::default();

        let first = reconcile(&mut session, &catalog(), &scoring, "batch-1", "G1", vec![entry("tok001")]);
        let second = reconcile(&mut session, &catalog(), &scoring, "batch-1", "G2", vec![entry("tok002")]);

        assert!(!first.replayed);
        assert!(!second.replayed);
        assert_eq!(second.result.device_id, "G2");
        assert_eq!(second.outcomes.len(), 1);
        assert!(session.has_scanned("G2", "tok002"));
        assert_eq!(session.score("001"), Some(1_000));

        let replay = reconcile(&mut session, &catalog(), &scoring, "batch-1", "G2", vec![entry("tok002")]);
        assert!(replay.replayed);
        assert_eq!(replay.result, second.result);
    }

    #[test]
    fn invalid_entries_are_recorded_and_do_not_halt_the_fold() {
        let mut session = session();
        let mut broken = entry("tok002");
        broken.device_type = Some("tablet".into());
        let entries = vec![entry("tok001"), broken, ScanRequest::default(), entry("tok003")];

        let outcome = reconcile(
            &mut session,
            &catalog(),
            &ScoringConfig::default(),
            "b2",
            "G1",
            entries,
        );

        assert_eq!(outcome.result.total_count, 4);
        assert_eq!(outcome.result.processed_count, 2);
        let indices: Vec<_> = outcome.result.failures.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert_eq!(outcome.result.failures[0].token_id.as_deref(), Some("tok002"));
        assert!(session.cached_batch("G1", "b2").is_some());
    }

    #[test]
    fn entries_inherit_the_batch_device() {
        let mut session = session();
        let outcome = reconcile(
            &mut session,
            &catalog(),
            &ScoringConfig::default(),
            "b3",
            "G7",
            vec![entry("tok001")],
        );
        assert_eq!(outcome.outcomes[0].transaction.device_id, "G7");
        assert!(session.has_scanned("G7", "tok001"));
        assert!(session.devices.contains_key("G7"));
    }

    #[test]
    fn duplicates_inside_a_batch_count_as_processed() {
        let mut session = session();
        let outcome = reconcile(
            &mut session,
            &catalog(),
            &ScoringConfig::default(),
            "b4",
            "G1",
            vec![entry("tok001"), entry("tok001")],
        );
        assert_eq!(outcome.result.processed_count, 2);
        assert_eq!(
            outcome.outcomes[1].transaction.status,
            TransactionStatus::Duplicate
        );
    }

    fn request(batch_id: &str, entries: Vec<ScanRequest>) -> BatchRequest {
        BatchRequest {
            batch_id: Some(batch_id.into()),
            device_id: Some("G1".into()),
            entries,
            submitted_at: None,
        }
    }

    #[tokio::test]
    async fn submit_requires_a_session() {
        let state = AppState::new(AppConfig::default(), catalog());
        let err = submit_batch(&state, request("b1", vec![entry("tok001")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NoActiveSession));
    }

    #[tokio::test]
    async fn submit_rejects_oversized_batches() {
        let config = AppConfig::from_json_str(r#"{"maxBatchEntries":1}"#).unwrap();
        let state = AppState::new(config, catalog());
        state.replace_session(Some(session())).await;
        let err = submit_batch(&state, request("b1", vec![entry("tok001"), entry("tok002")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn replayed_submission_is_acknowledged_again() {
        let state = AppState::new(AppConfig::default(), catalog());
        state.replace_session(Some(session())).await;
        let mut events = state.events().subscribe();

        let first = submit_batch(&state, request("b1", vec![entry("tok001")]))
            .await
            .unwrap();
        let second = submit_batch(&state, request("b1", vec![entry("tok001")]))
            .await
            .unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.result, second.result);

        let mut acks = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DomainEvent::BatchProcessed { device_id, ack } = event {
                assert_eq!(device_id, "G1");
                acks.push(ack);
            }
        }
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0], acks[1]);
        assert_eq!(acks[0].processed_count, 1);
    }
}
