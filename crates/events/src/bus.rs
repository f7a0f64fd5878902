//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans [`ModerationEvent`]s out to every subscriber. Share it
//! as `Arc<EventBus>`.

use chrono::Utc;
use modhist_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

pub const CHANGE_APPROVED: &str = "change.approved";
pub const CHANGE_MERGED: &str = "change.merged";
pub const CHANGE_APPLY_FAILED: &str = "change.apply_failed";
pub const CHANGE_REBASE_REQUIRED: &str = "change.rebase_required";
pub const CHANGE_SET_MERGED: &str = "change_set.merged";

// ---------------------------------------------------------------------------
// ModerationEvent
// ---------------------------------------------------------------------------

/// Something that happened to a change during moderation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationEvent {
    /// Dot-separated event name, e.g. `"change.merged"`.
    pub event_type: String,

    pub change_id: Option<DbId>,

    pub set_id: Option<DbId>,

    /// Type tag of the moderated record, e.g. `"quotes.quote"`.
    pub content_type: Option<String>,

    pub object_id: Option<DbId>,

    /// Moderator whose verdict triggered the event, if any.
    pub actor_user_id: Option<DbId>,

    pub payload: serde_json::Value,

    pub timestamp: Timestamp,
}

impl ModerationEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            change_id: None,
            set_id: None,
            content_type: None,
            object_id: None,
            actor_user_id: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_change(mut self, change_id: DbId) -> Self {
        self.change_id = Some(change_id);
        self
    }

    pub fn with_set(mut self, set_id: DbId) -> Self {
        self.set_id = Some(set_id);
        self
    }

    /// Attach the moderated record. `object_id` is absent for a change that
    /// has never been written.
    pub fn with_object(mut self, content_type: impl Into<String>, object_id: Option<DbId>) -> Self {
        self.content_type = Some(content_type.into());
        self.object_id = object_id;
        self
    }

    pub fn with_actor(mut self, user_id: Option<DbId>) -> Self {
        self.actor_user_id = user_id;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// When the buffer is full the oldest unread events are dropped and slow
/// receivers observe `RecvError::Lagged`.
///
/// ```rust
/// use modhist_events::bus::{EventBus, ModerationEvent, CHANGE_MERGED};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(ModerationEvent::new(CHANGE_MERGED).with_change(7));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<ModerationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped silently when nobody is
    /// listening.
    pub fn publish(&self, event: ModerationEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModerationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(
            ModerationEvent::new(CHANGE_MERGED)
                .with_change(42)
                .with_object("quotes.quote", Some(5))
                .with_actor(Some(7))
                .with_payload(serde_json::json!({"flagged_for_rebase": 1})),
        );

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.event_type, CHANGE_MERGED);
        assert_eq!(received.change_id, Some(42));
        assert_eq!(received.content_type.as_deref(), Some("quotes.quote"));
        assert_eq!(received.object_id, Some(5));
        assert_eq!(received.actor_user_id, Some(7));
        assert_eq!(received.payload["flagged_for_rebase"], 1);
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(ModerationEvent::new(CHANGE_APPROVED).with_set(3));

        assert_eq!(rx1.recv().await.unwrap().set_id, Some(3));
        assert_eq!(rx2.recv().await.unwrap().set_id, Some(3));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(ModerationEvent::new(CHANGE_REBASE_REQUIRED));
    }

    #[test]
    fn bare_event_has_empty_payload() {
        let event = ModerationEvent::new(CHANGE_APPLY_FAILED);
        assert!(event.change_id.is_none());
        assert!(event.content_type.is_none());
        assert!(event.payload.is_object());
    }
}
