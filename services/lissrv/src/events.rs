//! Engine output events
//!
//! The engine talks to its collaborators (persistence, telemetry)
//! exclusively through these events. Delivery is a best-effort handoff:
//! a slow consumer can never stall a read loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::protocols::ProtocolKind;

/// A fully reassembled instrument message, the engine's output artifact.
/// Emitted once; the engine holds no further reference to it.
#[derive(Debug, Clone, Serialize)]
pub struct ReassembledMessage {
    pub instrument_id: String,
    pub instrument_name: String,
    pub protocol: ProtocolKind,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// Link status transitions surfaced to the telemetry collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Disconnected,
    TransferStarted,
    TransferEnded,
    MessageTimedOut,
    MessageOversized,
    ReconnectExhausted,
}

/// Event emitted by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    Message(ReassembledMessage),
    Status {
        instrument_id: String,
        status: LinkStatus,
        detail: Option<String>,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn status(instrument_id: impl Into<String>, status: LinkStatus) -> Self {
        Self::Status {
            instrument_id: instrument_id.into(),
            status,
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn status_with_detail(
        instrument_id: impl Into<String>,
        status: LinkStatus,
        detail: impl Into<String>,
    ) -> Self {
        Self::Status {
            instrument_id: instrument_id.into(),
            status,
            detail: Some(detail.into()),
            at: Utc::now(),
        }
    }
}

/// Seam between the engine and its external collaborators.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Hand off one event. Implementations must not block the caller
    /// indefinitely.
    async fn publish(&self, event: EngineEvent);
}

/// Bounded channel sink. Events are dropped with a warning when the
/// consumer falls behind.
pub struct ChannelSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("event sink saturated, dropping event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (sink, mut rx) = ChannelSink::new(8);
        sink.publish(EngineEvent::status("a", LinkStatus::Connected))
            .await;
        sink.publish(EngineEvent::status("a", LinkStatus::Disconnected))
            .await;

        match rx.recv().await {
            Some(EngineEvent::Status { status, .. }) => assert_eq!(status, LinkStatus::Connected),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await {
            Some(EngineEvent::Status { status, .. }) => {
                assert_eq!(status, LinkStatus::Disconnected)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_saturated_sink_never_blocks() {
        let (sink, _rx) = ChannelSink::new(1);
        // Second publish overflows the bounded channel; it must return
        // immediately instead of waiting for the (absent) consumer.
        sink.publish(EngineEvent::status("a", LinkStatus::Connected))
            .await;
        sink.publish(EngineEvent::status("a", LinkStatus::Disconnected))
            .await;
    }
}
