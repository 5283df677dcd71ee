use indexmap::IndexSet;
use tracing::{info, warn};
use validator::Validate;

use crate::{
    dto::{
        session::{
            CreateSessionRequest, ResetSessionRequest, SessionStateResponse, SessionSummary,
            TeamInput, TeamScoreSummary,
        },
        ws::SessionUpdateEvent,
    },
    error::ServiceError,
    services::room_service,
    state::{SharedState, events::DomainEvent, session::Session},
};

fn state_of(session: Option<&Session>) -> SessionStateResponse {
    SessionStateResponse {
        session: session.map(SessionSummary::from),
        scores: session.map(TeamScoreSummary::all).unwrap_or_default(),
    }
}

fn publish_update(state: &SharedState, session: &Session) {
    state
        .events()
        .publish(DomainEvent::SessionUpdated(SessionUpdateEvent {
            session: Some(SessionSummary::from(session)),
            scores: TeamScoreSummary::all(session),
        }));
}

/// Current session and scoreboard.
pub async fn current(state: &SharedState) -> SessionStateResponse {
    state.read_session(state_of).await
}

/// Start a new session, replacing any existing one, and resync every device.
pub async fn create_session(
    state: &SharedState,
    request: CreateSessionRequest,
) -> Result<SessionStateResponse, ServiceError> {
    request.validate()?;

    let mut seen = IndexSet::new();
    let mut teams = Vec::with_capacity(request.teams.len());
    for team in request.teams {
        let id = team.id.trim().to_string();
        if !seen.insert(id.clone()) {
            return Err(ServiceError::Validation(format!("duplicate team `{id}`")));
        }
        teams.push((id, team.multiplier.unwrap_or(1)));
    }

    let session = Session::new(request.name.trim().to_string(), teams);
    let response = {
        let mut guard = state.lock_session().await;
        if let Some(previous) = guard.as_ref() {
            warn!(previous = %previous.id, "replacing existing session");
        }
        publish_update(state, &session);
        let response = state_of(Some(&session));
        *guard = Some(session);
        state.mark_dirty();
        response
    };

    if let Some(summary) = &response.session {
        info!(session_id = %summary.id, name = %summary.name, teams = summary.teams.len(), "session created");
    }
    room_service::resync_all(state).await;
    Ok(response)
}

/// Clear devices, ledger, transactions and batch cache; optionally keep teams.
pub async fn reset_session(
    state: &SharedState,
    request: ResetSessionRequest,
) -> Result<SessionStateResponse, ServiceError> {
    let response = state
        .with_session_mut(|session| {
            session.reset(request.preserve_teams);
            publish_update(state, session);
            Ok(state_of(Some(session)))
        })
        .await?;

    info!(preserve_teams = request.preserve_teams, "session reset");
    room_service::resync_all(state).await;
    Ok(response)
}

/// Close the session; GM scans are rejected afterwards.
pub async fn end_session(state: &SharedState) -> Result<SessionStateResponse, ServiceError> {
    let response = state
        .with_session_mut(|session| {
            if !session.is_active() {
                return Err(ServiceError::InvalidState("session already ended".into()));
            }
            session.end();
            publish_update(state, session);
            Ok(state_of(Some(session)))
        })
        .await?;

    info!("session ended");
    Ok(response)
}

/// Add a team to the running session and rejoin devices to the new team room.
pub async fn add_team(
    state: &SharedState,
    team: TeamInput,
) -> Result<TeamScoreSummary, ServiceError> {
    team.validate()?;
    let team_id = team.id.trim().to_string();

    let summary = state
        .with_session_mut(|session| {
            if !session.add_team(team_id.clone(), team.multiplier.unwrap_or(1)) {
                return Err(ServiceError::InvalidState(format!(
                    "team `{team_id}` already exists"
                )));
            }
            publish_update(state, session);
            session
                .teams
                .get_key_value(&team_id)
                .map(TeamScoreSummary::from)
                .ok_or_else(|| ServiceError::NotFound(format!("team `{team_id}`")))
        })
        .await?;

    info!(team_id = %summary.team_id, "team added");
    room_service::resync_all(state).await;
    Ok(summary)
}
