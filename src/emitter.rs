//! In-memory notification list plus its side effects.
//!
//! `emit` stamps and prepends the event, raises a platform alert when
//! permitted, and appends an audit copy to the store. Alert and audit failures
//! are logged and swallowed. `mark_all_as_read` is local only: the persisted
//! copies keep `read = false`.

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::model::{NotificationDraft, NotificationEvent, NotificationKind};
use crate::notify::{AlertOptions, PermissionGate};
use crate::store::Store;

/// Panel tabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationFilter {
    #[default]
    All,
    Reminders,
    System,
}

impl NotificationFilter {
    pub fn matches(&self, event: &NotificationEvent) -> bool {
        match self {
            NotificationFilter::All => true,
            NotificationFilter::Reminders => event.kind == NotificationKind::Reminder,
            NotificationFilter::System => event.kind == NotificationKind::System,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationCenter {
    store: Store,
    gate: PermissionGate,
    icon: Option<String>,
    events: Vec<NotificationEvent>,
    last_id: i64,
}

impl NotificationCenter {
    pub fn new(store: Store, gate: PermissionGate, icon: Option<String>) -> Self {
        Self {
            store,
            gate,
            icon,
            events: Vec::new(),
            last_id: 0,
        }
    }

    /// Newest first.
    pub fn notifications(&self) -> &[NotificationEvent] {
        &self.events
    }

    pub fn filtered(&self, filter: NotificationFilter) -> Vec<&NotificationEvent> {
        self.events.iter().filter(|e| filter.matches(e)).collect()
    }

    pub fn unread_count(&self) -> usize {
        self.events.iter().filter(|e| !e.read).count()
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// Millisecond timestamp, bumped past the previous id when two events
    /// land in the same millisecond.
    fn next_id(&mut self, now_ms: i64) -> i64 {
        let id = now_ms.max(self.last_id + 1);
        self.last_id = id;
        id
    }

    #[instrument(skip_all, fields(kind = draft.kind.as_str(), title = %draft.title))]
    pub async fn emit(&mut self, draft: NotificationDraft) -> NotificationEvent {
        let now_ms = Utc::now().timestamp_millis();
        let event = NotificationEvent {
            id: self.next_id(now_ms),
            kind: draft.kind,
            title: draft.title,
            message: draft.message,
            time: draft.time,
            read: false,
        };
        self.events.insert(0, event.clone());
        info!(id = event.id, "notification emitted");

        let options = AlertOptions {
            body: event.message.clone(),
            icon: self.icon.clone(),
        };
        if let Err(err) = self.gate.send(&event.title, &options).await {
            warn!(?err, id = event.id, "platform alert failed");
        }

        if let Err(err) = self.store.append_notification(&event, now_ms).await {
            warn!(?err, id = event.id, "failed to store notification");
        }

        event
    }

    pub fn mark_all_as_read(&mut self) {
        for event in &mut self.events {
            event.read = true;
        }
    }
}
