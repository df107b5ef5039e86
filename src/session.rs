//! Coordinator side of the worker-session protocol.
//!
//! One WebSocket per worker, upgraded at `/ws/worker`. The first frame must
//! be `auth`; after that the session task owns the transport, pumps outbound
//! frames from the registry's channel, and routes inbound frames to the
//! scheduler.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::ledger::Ledger;
use crate::protocol::{Capabilities, Frame, WorkerStatus};
use crate::registry::{WorkerRegistry, WorkerSession};
use crate::scheduler::{DispatchSignal, Scheduler};

const AUTH_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SessionState {
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub ledger: Ledger,
    pub pool: SqlitePool,
}

pub fn router(state: SessionState) -> Router {
    Router::new()
        .route("/ws/worker", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SessionState>) -> Response {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: SessionState) {
    let (mut sink, mut stream) = socket.split();

    // The first frame must be `auth`, and it must arrive promptly.
    let first = match tokio::time::timeout(AUTH_DEADLINE, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        _ => {
            tracing::debug!("Connection closed before auth");
            return;
        }
    };
    let (account_id, secret, capabilities, presented_id) = match Frame::from_text(first.as_str()) {
        Ok(Frame::Auth {
            account_id,
            secret,
            capabilities,
            worker_id,
        }) => (account_id, secret, capabilities, worker_id),
        _ => {
            tracing::warn!("First frame was not auth; closing");
            return;
        }
    };

    if let Err(e) = crate::api::validate_account_id(&account_id) {
        tracing::warn!(account_id = %account_id, "Malformed account id in auth");
        if let Ok(text) = (Frame::AuthFail {
            reason: e.to_string(),
        })
        .to_text()
        {
            let _ = sink.send(Message::Text(text.into())).await;
        }
        return;
    }

    if let Err(e) = state.ledger.authenticate(&account_id, &secret).await {
        tracing::warn!(account_id = %account_id, "Worker authentication failed");
        let reason = match e {
            GridError::Unauthenticated(_) => "invalid credentials".to_string(),
            other => other.to_string(),
        };
        if let Ok(text) = (Frame::AuthFail { reason }).to_text() {
            let _ = sink.send(Message::Text(text.into())).await;
        }
        return;
    }

    let worker_id = match resolve_worker_id(&state.pool, presented_id, &account_id).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(error = %e, "Worker id resolution failed");
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let outbound_handle = outbound_tx.clone();
    state.registry.register(WorkerSession::new(
        worker_id,
        account_id.clone(),
        capabilities.clone(),
        outbound_tx,
    ));
    if let Err(e) = persist_worker(&state.pool, worker_id, &account_id, &capabilities).await {
        tracing::error!(worker_id = %worker_id, error = %e, "Failed to persist worker row");
    }

    match (Frame::AuthOk { worker_id }).to_text() {
        Ok(text) => {
            if sink.send(Message::Text(text.into())).await.is_err() {
                state.registry.deregister(worker_id);
                return;
            }
        }
        Err(_) => return,
    }
    tracing::info!(worker_id = %worker_id, account_id = %account_id, "Worker authenticated");
    state.scheduler.signal(DispatchSignal::WorkerIdle);

    // Outbound pump: frames queued by the registry go to the socket.
    let pump = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(text) = frame.to_text() else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame = match Frame::from_text(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!(worker_id = %worker_id, error = %e, "Unparseable frame ignored");
                        continue;
                    }
                };
                if let Err(e) = route_frame(&state, worker_id, &account_id, frame).await {
                    match e {
                        GridError::Protocol(reason) => {
                            tracing::warn!(worker_id = %worker_id, reason, "Protocol violation; closing session");
                            break;
                        }
                        other => {
                            tracing::error!(worker_id = %worker_id, error = %other, "Frame handling failed");
                        }
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Transport-level pings are answered by axum itself.
            Ok(_) => {}
        }
    }

    pump.abort();
    // A reconnect may already have replaced this session under the same id;
    // only tear down the entry if it is still ours.
    let still_ours = state
        .registry
        .get(worker_id)
        .map(|s| s.outbound.same_channel(&outbound_handle))
        .unwrap_or(false);
    if still_ours {
        let _ = state.registry.mark_offline(worker_id);
        if let Err(e) = persist_worker_status(&state.pool, worker_id, WorkerStatus::Offline).await {
            tracing::error!(worker_id = %worker_id, error = %e, "Failed to persist offline status");
        }
        if let Err(e) = state.scheduler.on_worker_lost(worker_id).await {
            tracing::error!(worker_id = %worker_id, error = %e, "Worker-loss handling failed");
        }
    }
    tracing::info!(worker_id = %worker_id, "Worker session closed");
}

/// Route one authenticated inbound frame. The match is total: every variant
/// either has a handler or is a violation of the session direction.
async fn route_frame(
    state: &SessionState,
    worker_id: Uuid,
    owner: &str,
    frame: Frame,
) -> Result<()> {
    match frame {
        Frame::Heartbeat { status, .. } => {
            state.registry.touch(worker_id);
            persist_worker_status(&state.pool, worker_id, status).await
        }
        Frame::Ack {
            job_id,
            accepted,
            reason,
        } => {
            state.registry.touch(worker_id);
            state
                .scheduler
                .on_ack(worker_id, job_id, accepted, reason)
                .await
        }
        Frame::Progress { job_id, .. } => {
            state.registry.touch(worker_id);
            state.scheduler.on_progress(job_id).await
        }
        Frame::Result {
            job_id,
            exit_code,
            stdout,
            stderr,
        } => {
            state.registry.touch(worker_id);
            state
                .scheduler
                .on_result(worker_id, owner, job_id, exit_code, &stdout, &stderr)
                .await
        }
        Frame::Pong { .. } => {
            state.registry.touch(worker_id);
            Ok(())
        }
        Frame::Auth { .. } => Err(GridError::Protocol("duplicate auth".into())),
        Frame::AuthOk { .. }
        | Frame::AuthFail { .. }
        | Frame::Assign { .. }
        | Frame::Cancel { .. }
        | Frame::Ping { .. } => Err(GridError::Protocol(
            "coordinator-bound frame received from worker".into(),
        )),
    }
}

/// A reconnecting worker resumes its session identity iff the presented id
/// was last owned by the same account; otherwise a fresh id is assigned.
async fn resolve_worker_id(
    pool: &SqlitePool,
    presented: Option<Uuid>,
    account_id: &str,
) -> Result<Uuid> {
    let Some(presented) = presented else {
        return Ok(Uuid::new_v4());
    };
    let row = sqlx::query("SELECT owner FROM workers WHERE id = ?")
        .bind(presented.to_string())
        .fetch_optional(pool)
        .await?;
    match row {
        None => Ok(presented),
        Some(row) if row.get::<String, _>("owner") == account_id => Ok(presented),
        Some(_) => {
            tracing::warn!(presented = %presented, account_id = %account_id, "Worker id owned by another account; assigning fresh id");
            Ok(Uuid::new_v4())
        }
    }
}

async fn persist_worker(
    pool: &SqlitePool,
    id: Uuid,
    owner: &str,
    capabilities: &Capabilities,
) -> Result<()> {
    let caps = serde_json::to_string(capabilities)
        .map_err(|e| GridError::Internal(format!("serializing capabilities: {e}")))?;
    sqlx::query(
        "INSERT INTO workers (id, owner, capabilities, status, last_seen) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
             owner = excluded.owner, \
             capabilities = excluded.capabilities, \
             status = excluded.status, \
             last_seen = excluded.last_seen",
    )
    .bind(id.to_string())
    .bind(owner)
    .bind(caps)
    .bind(WorkerStatus::Idle.to_string())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn persist_worker_status(
    pool: &SqlitePool,
    id: Uuid,
    status: WorkerStatus,
) -> Result<()> {
    sqlx::query("UPDATE workers SET status = ?, last_seen = ? WHERE id = ?")
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
