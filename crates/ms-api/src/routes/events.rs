use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream, StreamExt};

use crate::error::ApiError;
use crate::events::{EventStatus, ProgressEvent};
use crate::hub::Subscriber;
use crate::state::AppState;

/// One server-sent event before transport encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: String,
}

impl SseFrame {
    fn connected(subscriber: &Subscriber) -> Self {
        let data = serde_json::json!({
            "type": "connected",
            "clientId": subscriber.id().to_string(),
            "serverId": subscriber.filter().unwrap_or_default(),
            "message": "Connected to server build updates",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        Self {
            event: "connected",
            data: data.to_string(),
        }
    }

    fn progress(event: &ProgressEvent) -> Self {
        let kind = match event.status {
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Building | EventStatus::Running => "progress",
        };
        Self {
            event: kind,
            data: serde_json::to_string(event).unwrap_or_default(),
        }
    }
}

impl From<SseFrame> for Event {
    fn from(frame: SseFrame) -> Self {
        Event::default().event(frame.event).data(frame.data)
    }
}

/// `connected`, then one frame per event, ending after the first terminal event.
pub fn frames(subscriber: Subscriber) -> impl Stream<Item = SseFrame> {
    let connected = SseFrame::connected(&subscriber);

    let updates = stream::unfold(Some(subscriber), |state| async move {
        let mut subscriber = state?;
        let event = subscriber.recv().await?;
        let frame = SseFrame::progress(&event);
        let next = if event.is_terminal() {
            tracing::debug!(
                subscriber = %subscriber.id(),
                dropped = subscriber.dropped(),
                "terminal event sent, closing stream"
            );
            None
        } else {
            Some(subscriber)
        };
        Some((frame, next))
    });

    stream::once(async move { connected }).chain(updates)
}

fn sse(subscriber: Subscriber) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(frames(subscriber).map(|frame| Ok(Event::from(frame)))).keep_alive(KeepAlive::default())
}

/// Progress stream for one server.
pub async fn server_events(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscriber = state
        .hub
        .subscribe(Some(server_id.clone()))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    tracing::info!(%server_id, subscriber = %subscriber.id(), "event stream opened");
    Ok(sse(subscriber))
}

/// Progress stream for every server.
pub async fn all_events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscriber = state
        .hub
        .subscribe(None)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    tracing::info!(subscriber = %subscriber.id(), "event stream opened");
    Ok(sse(subscriber))
}
