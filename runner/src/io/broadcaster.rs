//! Per-session progress fan-out.
//!
//! Records are the source of truth; broadcast delivery is best effort and a
//! session with no subscribers silently drops events.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core::events::ProgressEvent;
use crate::io::config::RunnerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("broadcaster is shut down")]
    Closed,

    #[error("broadcast failed: {0}")]
    Internal(String),
}

#[async_trait]
pub trait EventBroadcaster: Send + Sync {
    async fn publish(&self, session_id: &str, event: ProgressEvent) -> Result<(), BroadcastError>;
}

/// In-process broadcaster: one tokio broadcast channel per session.
#[derive(Debug)]
pub struct SessionBroadcaster {
    channels: RwLock<Option<HashMap<String, broadcast::Sender<ProgressEvent>>>>,
    capacity: usize,
}

impl SessionBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(Some(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Broadcaster sized by `broadcast_capacity`.
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.broadcast_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe to one session's events, creating its channel on demand.
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<ProgressEvent>, BroadcastError> {
        let mut guard = self
            .channels
            .write()
            .map_err(|e| BroadcastError::Internal(e.to_string()))?;
        let channels = guard.as_mut().ok_or(BroadcastError::Closed)?;
        let sender = channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.subscribe())
    }

    /// Drop every channel; receivers observe `RecvError::Closed` once drained.
    pub fn shutdown(&self) {
        match self.channels.write() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
    }
}

impl Default for SessionBroadcaster {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

#[async_trait]
impl EventBroadcaster for SessionBroadcaster {
    async fn publish(&self, session_id: &str, event: ProgressEvent) -> Result<(), BroadcastError> {
        let guard = self
            .channels
            .read()
            .map_err(|e| BroadcastError::Internal(e.to_string()))?;
        let channels = guard.as_ref().ok_or(BroadcastError::Closed)?;
        if let Some(sender) = channels.get(session_id) {
            // No live receivers is not an error.
            let _ = sender.send(event);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{EventKind, EventSequencer};
    use chrono::Utc;

    fn step_result(sequencer: &mut EventSequencer, step_index: u32) -> ProgressEvent {
        sequencer.next_event(
            "task-1",
            EventKind::StepResult {
                step_index,
                success: true,
                confidence: 1.0,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn delivers_only_to_matching_session() {
        let broadcaster = SessionBroadcaster::new(8);
        let mut rx_a = broadcaster.subscribe("session-a").expect("subscribe");
        let mut rx_b = broadcaster.subscribe("session-b").expect("subscribe");
        let mut sequencer = EventSequencer::default();

        broadcaster
            .publish("session-a", step_result(&mut sequencer, 0))
            .await
            .expect("publish");

        let event = rx_a.recv().await.expect("event");
        assert_eq!(event.sequence_number, 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn capacity_follows_config() {
        let config = RunnerConfig {
            broadcast_capacity: 16,
            ..RunnerConfig::default()
        };
        assert_eq!(SessionBroadcaster::from_config(&config).capacity(), 16);
        assert_eq!(SessionBroadcaster::default().capacity(), 256);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let broadcaster = SessionBroadcaster::default();
        let mut sequencer = EventSequencer::default();
        broadcaster
            .publish("nobody", step_result(&mut sequencer, 0))
            .await
            .expect("publish");
    }

    #[tokio::test]
    async fn shutdown_closes_channels() {
        let broadcaster = SessionBroadcaster::new(4);
        let mut rx = broadcaster.subscribe("session-a").expect("subscribe");
        let mut sequencer = EventSequencer::default();

        broadcaster.shutdown();

        assert_eq!(
            broadcaster
                .publish("session-a", step_result(&mut sequencer, 0))
                .await,
            Err(BroadcastError::Closed)
        );
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            broadcaster.subscribe("session-a"),
            Err(BroadcastError::Closed)
        ));
    }
}
