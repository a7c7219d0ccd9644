//! `GET /notifications`: synchronization updates as server-sent events.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

use crate::server::AppState;

/// SSE event name of every update.
pub const EVENT_NAME: &str = "synchronization";

pub fn router() -> Router<AppState> {
    Router::new().route("/notifications", get(notifications))
}

async fn notifications(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let updates = BroadcastStream::new(state.events.subscribe()).filter_map(|update| match update {
        Ok(update) => Some(Event::default().event(EVENT_NAME).json_data(update)),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "notification subscriber lagged");
            None
        }
    });
    Sse::new(updates).keep_alive(KeepAlive::default())
}
