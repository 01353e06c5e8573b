//! Live job event stream over WebSocket.
//!
//! On connect the server sends every persisted event after the optional
//! `after` cursor, then forwards live events. When the live feed lags, or a
//! live event skips past the next expected sequence (another process wrote
//! to the same store), the gap is re-read from the store using the last
//! sequence sent. Clients always see each sequence once, in order.

use std::sync::Arc;

use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ApiState;
use super::types::PageQuery;
use crate::error::{ApiError, QueueError};
use crate::ledger::EventUpdate;
use crate::ledger::events::MAX_PAGE_LIMIT;
use crate::queue::{QueueApi, QueueService};

/// GET /api/queue/jobs/{id}/events/ws?after
pub async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    id: Result<Path<Uuid>, PathRejection>,
    params: Result<Query<PageQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Path(job_id) = id.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if params.after.is_some_and(|a| a < 0) {
        return Err(QueueError::Validation("after must be >= 0".into()).into());
    }
    // 404 before upgrading.
    state.service.get_job(job_id).await?;

    info!(job_id = %job_id, "Event stream client connecting");
    let service = state.service.clone();
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, service, job_id, params.after))
        .into_response())
}

async fn handle_socket(
    mut socket: WebSocket,
    service: Arc<QueueService>,
    job_id: Uuid,
    after: Option<i64>,
) {
    // Subscribe before reading the backlog so nothing falls in between.
    let mut live = Box::pin(service.events().stream(job_id));
    let mut cursor = after;

    if let Err(e) = send_backlog(&mut socket, &service, job_id, &mut cursor).await {
        warn!(job_id = %job_id, error = %e, "Failed to send event backlog");
        return;
    }

    loop {
        tokio::select! {
            update = live.next() => {
                match update {
                    Some(EventUpdate::Event(event)) => {
                        if cursor.is_some_and(|c| event.sequence <= c) {
                            continue;
                        }
                        if event.sequence != cursor.unwrap_or(0) + 1 {
                            debug!(job_id = %job_id, sequence = event.sequence, cursor, "Sequence gap; re-reading from store");
                            if let Err(e) = send_backlog(&mut socket, &service, job_id, &mut cursor).await {
                                warn!(job_id = %job_id, error = %e, "Failed to re-sync events");
                                break;
                            }
                            continue;
                        }
                        cursor = Some(event.sequence);
                        if send_json(&mut socket, &event).await.is_err() {
                            debug!(job_id = %job_id, "Client disconnected during send");
                            break;
                        }
                    }
                    Some(EventUpdate::Lagged(missed)) => {
                        warn!(job_id = %job_id, missed, "Event stream lagged; re-reading from store");
                        if let Err(e) = send_backlog(&mut socket, &service, job_id, &mut cursor).await {
                            warn!(job_id = %job_id, error = %e, "Failed to re-sync events");
                            break;
                        }
                    }
                    None => {
                        debug!("Event bus closed");
                        break;
                    }
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(job_id = %job_id, "Event stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(job_id = %job_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    // Clients have nothing to say on this stream.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Send every stored event after `cursor`, advancing it.
async fn send_backlog(
    socket: &mut WebSocket,
    service: &QueueService,
    job_id: Uuid,
    cursor: &mut Option<i64>,
) -> Result<(), String> {
    loop {
        let page = service
            .list_events(job_id, *cursor, Some(MAX_PAGE_LIMIT))
            .await
            .map_err(|e| e.to_string())?;
        let full = page.len() >= MAX_PAGE_LIMIT as usize;
        for event in &page {
            send_json(socket, event).await?;
            *cursor = Some(event.sequence);
        }
        if !full {
            return Ok(());
        }
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), String> {
    let json = serde_json::to_string(value).map_err(|e| e.to_string())?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}
