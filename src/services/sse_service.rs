use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::{
    dto::{
        session::{SessionSummary, TeamScoreSummary},
        sse::{ScoreboardHandshake, ServerEvent},
        ws::SessionUpdateEvent,
    },
    services::broadcast::EVENT_SESSION_UPDATE,
    state::SharedState,
};

/// SSE event name of the handshake sent when no session is loaded.
pub const EVENT_HANDSHAKE: &str = "handshake";

/// Subscribe to the scoreboard stream together with the frame that should
/// open it: the current standings, or a handshake when no session exists.
///
/// The subscription is taken while the session is read so no update can fall
/// between the snapshot and the live stream.
pub async fn subscribe_scoreboard(
    state: &SharedState,
) -> (broadcast::Receiver<ServerEvent>, Option<ServerEvent>) {
    let guard = state.lock_session().await;
    let receiver = state.scoreboard_sse().subscribe();
    let initial = match guard.as_ref() {
        Some(session) => ServerEvent::json(
            Some(EVENT_SESSION_UPDATE.to_string()),
            &SessionUpdateEvent {
                session: Some(SessionSummary::from(session)),
                scores: TeamScoreSummary::all(session),
            },
        ),
        None => ServerEvent::json(
            Some(EVENT_HANDSHAKE.to_string()),
            &ScoreboardHandshake {
                message: "subscribed to scoreboard".into(),
                session_active: false,
            },
        ),
    };
    drop(guard);

    let initial = initial
        .inspect_err(|err| warn!(error = %err, "failed to serialize scoreboard snapshot"))
        .ok();
    (receiver, initial)
}

fn to_event(payload: ServerEvent) -> Event {
    let event = Event::default().data(payload.data);
    match payload.event {
        Some(name) => event.event(name),
        None => event,
    }
}

/// Convert a broadcast receiver into an SSE response, forwarding events until
/// the client disconnects.
pub fn to_sse_stream(
    mut receiver: broadcast::Receiver<ServerEvent>,
    initial: Option<ServerEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        if let Some(first) = initial {
            if tx.send(Ok(to_event(first))).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            if tx.send(Ok(to_event(payload))).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "scoreboard SSE subscriber lagged");
                            continue;
                        }
                    }
                }
            }
        }

        info!("scoreboard SSE stream disconnected");
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::TokenCatalog,
        config::AppConfig,
        state::{AppState, session::Session},
    };

    #[tokio::test]
    async fn opens_with_handshake_without_session() {
        let state = AppState::new(AppConfig::default(), TokenCatalog::default());
        let (_receiver, initial) = subscribe_scoreboard(&state).await;
        let initial = initial.unwrap();
        assert_eq!(initial.event.as_deref(), Some(EVENT_HANDSHAKE));
        let body: serde_json::Value = serde_json::from_str(&initial.data).unwrap();
        assert_eq!(body["sessionActive"], false);
    }

    #[tokio::test]
    async fn opens_with_standings_and_receives_updates() {
        let state = AppState::new(AppConfig::default(), TokenCatalog::default());
        state
            .replace_session(Some(Session::new(
                "Live".into(),
                [("001".to_string(), 1), ("002".to_string(), 1)],
            )))
            .await;

        let (mut receiver, initial) = subscribe_scoreboard(&state).await;
        let initial = initial.unwrap();
        assert_eq!(initial.event.as_deref(), Some(EVENT_SESSION_UPDATE));
        let body: serde_json::Value = serde_json::from_str(&initial.data).unwrap();
        assert_eq!(body["scores"].as_array().map(Vec::len), Some(2));

        state.scoreboard_sse().broadcast(ServerEvent {
            event: Some("score:updated".into()),
            data: "{}".into(),
        });
        assert_eq!(
            receiver.recv().await.unwrap().event.as_deref(),
            Some("score:updated")
        );
    }
}
