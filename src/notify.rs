use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, Reminder};

const CHANNEL_CAPACITY: usize = 256;

/// What the notification collaborator consumes. Delivery is its business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReminderNotice {
    Scheduled(Reminder),
    Revoked { booking_id: Ulid },
}

impl ReminderNotice {
    pub fn booking_id(&self) -> Ulid {
        match self {
            ReminderNotice::Scheduled(r) => r.booking_id,
            ReminderNotice::Revoked { booking_id } => *booking_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Per-tenant broadcast hub: committed events per resource, plus one
/// reminder channel for the whole tenant.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    reminders: broadcast::Sender<ReminderNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            reminders: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to committed events touching a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_reminders(&self) -> broadcast::Receiver<ReminderNotice> {
        self.reminders.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn send_reminder(&self, notice: ReminderNotice) {
        let _ = self.reminders.send(notice);
    }
}
