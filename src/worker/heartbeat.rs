use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::protocol::{Frame, WorkerStatus};

/// Periodically queues a `heartbeat` frame carrying the worker's current
/// status snapshot.
pub struct HeartbeatTicker {
    interval: Duration,
    status: Arc<Mutex<WorkerStatus>>,
}

impl HeartbeatTicker {
    pub fn new(interval: Duration, status: Arc<Mutex<WorkerStatus>>) -> Self {
        Self { interval, status }
    }

    /// Run until the receiving side of `tx` is dropped.
    pub async fn run(&self, tx: mpsc::UnboundedSender<Frame>) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            let status = *self.status.lock().unwrap();
            let frame = Frame::Heartbeat {
                timestamp: Utc::now(),
                status,
            };
            if tx.send(frame).is_err() {
                // Session loop is gone; stop ticking.
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_carry_current_status() {
        let status = Arc::new(Mutex::new(WorkerStatus::Idle));
        let ticker = HeartbeatTicker::new(Duration::from_secs(15), Arc::clone(&status));
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move { ticker.run(tx).await });

        // First tick fires immediately.
        let frame = rx.recv().await.unwrap();
        assert!(matches!(
            frame,
            Frame::Heartbeat {
                status: WorkerStatus::Idle,
                ..
            }
        ));

        *status.lock().unwrap() = WorkerStatus::Busy;
        tokio::time::advance(Duration::from_secs(15)).await;
        let frame = rx.recv().await.unwrap();
        assert!(matches!(
            frame,
            Frame::Heartbeat {
                status: WorkerStatus::Busy,
                ..
            }
        ));
    }
}
