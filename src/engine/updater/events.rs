//! Update Events
//!
//! Fire-and-forget lifecycle notifications. Subscribers get a tokio broadcast
//! receiver; the most recent event of each kind is kept for late subscribers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

use super::descriptor::VersionId;
use super::state::UpdatePhase;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateEvent {
    CheckStarted,
    DownloadProgress {
        downloaded: u64,
        total: Option<u64>,
    },
    Ready {
        version: VersionId,
    },
    NoUpdate {
        current: Option<VersionId>,
    },
    Busy,
    Failed {
        code: String,
        reason: String,
    },
    Cancelled,
    RolledBack {
        /// `None` when falling back to the embedded bundle
        version: Option<VersionId>,
        reason: String,
    },
    PhaseChanged {
        phase: UpdatePhase,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CheckStarted,
    DownloadProgress,
    Ready,
    NoUpdate,
    Busy,
    Failed,
    Cancelled,
    RolledBack,
    PhaseChanged,
}

impl UpdateEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CheckStarted => EventKind::CheckStarted,
            Self::DownloadProgress { .. } => EventKind::DownloadProgress,
            Self::Ready { .. } => EventKind::Ready,
            Self::NoUpdate { .. } => EventKind::NoUpdate,
            Self::Busy => EventKind::Busy,
            Self::Failed { .. } => EventKind::Failed,
            Self::Cancelled => EventKind::Cancelled,
            Self::RolledBack { .. } => EventKind::RolledBack,
            Self::PhaseChanged { .. } => EventKind::PhaseChanged,
        }
    }

    /// Short human-readable form for toasts and CLI output
    pub fn describe(&self) -> String {
        match self {
            Self::CheckStarted => "Checking for update".to_string(),
            Self::DownloadProgress { downloaded, total: Some(total) } => {
                format!("Downloaded {} of {} bytes", downloaded, total)
            }
            Self::DownloadProgress { downloaded, total: None } => {
                format!("Downloaded {} bytes", downloaded)
            }
            Self::Ready { version } => format!("Bundle {} is ready", version),
            Self::NoUpdate { .. } => "Already up to date".to_string(),
            Self::Busy => "An update is already in progress".to_string(),
            Self::Failed { reason, .. } => format!("Update failed: {}", reason),
            Self::Cancelled => "Update cancelled".to_string(),
            Self::RolledBack { version: Some(v), reason } => {
                format!("Rolled back to {} ({})", v, reason)
            }
            Self::RolledBack { version: None, reason } => {
                format!("Rolled back to embedded bundle ({})", reason)
            }
            Self::PhaseChanged { phase } => format!("Phase: {:?}", phase),
        }
    }
}

/// Broadcasts update events to any number of subscribers
#[derive(Debug)]
pub struct EventEmitter {
    sender: broadcast::Sender<UpdateEvent>,
    latest: Mutex<HashMap<EventKind, UpdateEvent>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Slow subscribers lag (and skip) once `capacity` events are queued
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            latest: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn emit(&self, event: UpdateEvent) {
        trace!(?event, "emit");
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.kind(), event.clone());
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Most recent event of `kind`, if any was emitted
    pub fn latest(&self, kind: EventKind) -> Option<UpdateEvent> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_all_subscribers() {
        let emitter = EventEmitter::new();
        let mut a = emitter.subscribe();
        let mut b = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        emitter.emit(UpdateEvent::CheckStarted);
        assert_eq!(a.recv().await.unwrap(), UpdateEvent::CheckStarted);
        assert_eq!(b.recv().await.unwrap(), UpdateEvent::CheckStarted);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::new();
        emitter.emit(UpdateEvent::Busy);
        assert_eq!(emitter.latest(EventKind::Busy), Some(UpdateEvent::Busy));
    }

    #[test]
    fn test_latest_per_kind() {
        let emitter = EventEmitter::new();
        emitter.emit(UpdateEvent::DownloadProgress { downloaded: 1, total: Some(4) });
        emitter.emit(UpdateEvent::DownloadProgress { downloaded: 4, total: Some(4) });
        emitter.emit(UpdateEvent::CheckStarted);

        assert_eq!(
            emitter.latest(EventKind::DownloadProgress),
            Some(UpdateEvent::DownloadProgress { downloaded: 4, total: Some(4) })
        );
        assert!(emitter.latest(EventKind::Ready).is_none());
    }

    #[test]
    fn test_event_serialization() {
        let event = UpdateEvent::Failed {
            code: "ChecksumMismatch".to_string(),
            reason: "bad bytes".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["code"], "ChecksumMismatch");

        let ready = UpdateEvent::Ready { version: VersionId::new("v2").unwrap() };
        assert_eq!(serde_json::to_value(&ready).unwrap()["version"], "v2");
    }
}
