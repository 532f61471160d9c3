//! SSE endpoint
//!
//! `GET /api/stream?streams=<URL-encoded JSON array>` registers one
//! subscription per entry and holds the connection open until the client
//! goes away. Events are `event: <type>` / `data: <JSON>` pairs produced by
//! the stream manager.

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::{AppError, AppState};
use crate::stream::{StreamManager, StreamRequest};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub streams: Option<String>,
}

/// Unregisters the connection's subscriptions when the response stream is
/// dropped (client disconnect or server shutdown).
struct ConnectionGuard {
    manager: Arc<StreamManager>,
    connection_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister_connection(&self.connection_id);
    }
}

pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let raw = query
        .streams
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("streams query parameter is required"))?;

    let requests: Vec<StreamRequest> = serde_json::from_str(&raw)
        .map_err(|e| AppError::bad_request(format!("streams must be a JSON array: {e}")))?;

    let (connection_id, rx) = state.streams.register_connection(requests)?;
    let guard = ConnectionGuard {
        manager: state.streams.clone(),
        connection_id,
    };

    let stream = ReceiverStream::new(rx).map(move |outbound| {
        // Keep the guard alive for the lifetime of the stream
        let _ = &guard;
        Ok(Event::default()
            .event(outbound.event)
            .data(outbound.payload.to_string()))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
