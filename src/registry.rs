//! In-memory registry of live worker sessions.
//!
//! All mutations serialize under a single lock, held only for the duration of
//! the map operation; frames go out through per-session unbounded senders so
//! nothing blocks under the lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::protocol::{Capabilities, Frame, JobLimits, WorkerStatus};

/// A live, authenticated worker session.
#[derive(Debug, Clone)]
pub struct WorkerSession {
    pub id: Uuid,
    pub owner: String,
    pub capabilities: Capabilities,
    pub status: WorkerStatus,
    pub last_seen: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    /// Outbound half of the session's transport, owned by the session task.
    pub outbound: mpsc::UnboundedSender<Frame>,
}

impl WorkerSession {
    pub fn new(
        id: Uuid,
        owner: String,
        capabilities: Capabilities,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner,
            capabilities,
            status: WorkerStatus::Idle,
            last_seen: now,
            connected_at: now,
            outbound,
        }
    }
}

/// Read-only view of a session for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: Uuid,
    pub owner: String,
    pub status: WorkerStatus,
    pub capabilities: Capabilities,
    pub last_seen: DateTime<Utc>,
}

/// Sessions touched by one sweep pass.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub went_offline: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

#[derive(Default)]
pub struct WorkerRegistry {
    sessions: Mutex<HashMap<Uuid, WorkerSession>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session. Reconnects reuse the same id and replace
    /// the dead entry.
    pub fn register(&self, session: WorkerSession) {
        let id = session.id;
        let owner = session.owner.clone();
        self.sessions.lock().unwrap().insert(id, session);
        tracing::info!(worker_id = %id, owner = %owner, "Worker session registered");
    }

    pub fn deregister(&self, id: Uuid) -> Option<WorkerSession> {
        self.sessions.lock().unwrap().remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<WorkerSession> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn owner_of(&self, id: Uuid) -> Option<String> {
        self.sessions.lock().unwrap().get(&id).map(|s| s.owner.clone())
    }

    /// Pick an idle session whose capabilities satisfy `limits`.
    /// Least-recently-seen candidates win to spread load across the fleet.
    pub fn pick_idle(&self, limits: &JobLimits) -> Option<Uuid> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .filter(|s| s.status == WorkerStatus::Idle && s.capabilities.satisfies(limits))
            .min_by_key(|s| (s.last_seen, s.connected_at))
            .map(|s| s.id)
    }

    pub fn mark_busy(&self, id: Uuid) -> Result<()> {
        self.set_status(id, WorkerStatus::Busy)
    }

    pub fn mark_idle(&self, id: Uuid) -> Result<()> {
        self.set_status(id, WorkerStatus::Idle)
    }

    pub fn mark_offline(&self, id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&id) {
            Some(s) => {
                s.status = WorkerStatus::Offline;
                Ok(())
            }
            None => Err(GridError::WorkerNotFound(id.to_string())),
        }
    }

    fn set_status(&self, id: Uuid, status: WorkerStatus) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&id) {
            Some(s) => {
                s.status = status;
                s.last_seen = Utc::now();
                Ok(())
            }
            None => Err(GridError::WorkerNotFound(id.to_string())),
        }
    }

    /// Refresh `last_seen`; revives an `offline` session that was merely
    /// slow to heartbeat.
    pub fn touch(&self, id: Uuid) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(s) = sessions.get_mut(&id) {
            s.last_seen = Utc::now();
            if s.status == WorkerStatus::Offline {
                s.status = WorkerStatus::Idle;
            }
        }
    }

    /// Queue a frame on the session's transport.
    pub fn send_frame(&self, id: Uuid, frame: Frame) -> Result<()> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get(&id)
            .ok_or_else(|| GridError::WorkerNotFound(id.to_string()))?;
        session
            .outbound
            .send(frame)
            .map_err(|_| GridError::WorkerLost(id.to_string()))
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let sessions = self.sessions.lock().unwrap();
        let mut snaps: Vec<WorkerSnapshot> = sessions
            .values()
            .map(|s| WorkerSnapshot {
                id: s.id,
                owner: s.owner.clone(),
                status: s.status,
                capabilities: s.capabilities.clone(),
                last_seen: s.last_seen,
            })
            .collect();
        snaps.sort_by_key(|s| s.id);
        snaps
    }

    /// Mark sessions silent past `stale` as offline; drop sessions silent
    /// past `reap` entirely.
    pub fn sweep(&self, stale: Duration, reap: Duration) -> SweepOutcome {
        let now = Utc::now();
        let stale = chrono::Duration::from_std(stale).unwrap_or(chrono::Duration::MAX);
        let reap = chrono::Duration::from_std(reap).unwrap_or(chrono::Duration::MAX);

        let mut outcome = SweepOutcome::default();
        let mut sessions = self.sessions.lock().unwrap();

        sessions.retain(|id, s| {
            if now - s.last_seen > reap {
                outcome.removed.push(*id);
                false
            } else {
                true
            }
        });
        for (id, s) in sessions.iter_mut() {
            if s.status != WorkerStatus::Offline && now - s.last_seen > stale {
                s.status = WorkerStatus::Offline;
                outcome.went_offline.push(*id);
            }
        }
        outcome
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}
