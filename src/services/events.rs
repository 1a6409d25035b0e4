//! Event system for intake operations
//!
//! Services emit an event after their transaction commits. The logging
//! listener turns the stream into an audit trail.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Domain events emitted by services
#[derive(Debug, Clone)]
pub enum CivicEvent {
    // Directory events
    PrincipalRegistered {
        id: String,
        role: String,
    },
    PrincipalActivationChanged {
        id: String,
        active: bool,
    },
    InstitutionCreated {
        id: String,
        name: String,
    },
    DepartmentCreated {
        id: String,
        institution_id: String,
    },

    // Intake events
    ReportCreated {
        id: String,
        institution_id: Option<String>,
    },
    ReportStatusChanged {
        id: String,
        status: String,
        changed_by: String,
    },
    MessageCreated {
        id: String,
        institution_id: String,
    },
    MessageStatusChanged {
        id: String,
        status: String,
    },
    MessageDeleted {
        id: String,
    },
    ReplyCreated {
        id: String,
        message_id: String,
        sender_role: String,
    },

    // Poll and feed events
    PollCreated {
        id: String,
    },
    PollReplaced {
        id: String,
        options_replaced: bool,
    },
    PollDeleted {
        id: String,
    },
    VoteCast {
        poll_id: String,
        choices: usize,
    },
    FeedCreated {
        id: String,
        institution_id: Option<String>,
    },
    FeedDeleted {
        id: String,
    },
    FeedReacted {
        feed_id: String,
        reaction: String,
    },
    FeedShared {
        feed_id: String,
    },

    // Announcement events
    AnnouncementPublished {
        id: String,
    },
    AnnouncementDeleted {
        id: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &CivicEvent);
}

/// Event bus for broadcasting domain events
pub struct EventBus {
    sender: broadcast::Sender<CivicEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: CivicEvent) {
        trace!(event = ?event, "Emitting civic event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CivicEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Audit trail listener
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &CivicEvent) {
        match event {
            CivicEvent::PrincipalRegistered { id, role } => {
                info!(principal = %id, role = %role, "Principal registered");
            }
            CivicEvent::PrincipalActivationChanged { id, active } => {
                info!(principal = %id, active, "Principal activation changed");
            }
            CivicEvent::ReportStatusChanged { id, status, changed_by } => {
                info!(report = %id, status = %status, by = %changed_by, "Report status changed");
            }
            CivicEvent::MessageStatusChanged { id, status } => {
                info!(message = %id, status = %status, "Message status changed");
            }
            CivicEvent::MessageDeleted { id } => {
                info!(message = %id, "Message deleted");
            }
            CivicEvent::ReplyCreated { id, message_id, sender_role } => {
                debug!(reply = %id, message = %message_id, role = %sender_role, "Reply created");
            }
            CivicEvent::PollDeleted { id }
            | CivicEvent::FeedDeleted { id }
            | CivicEvent::AnnouncementDeleted { id } => {
                info!(id = %id, "Subject deleted");
            }
            _ => {
                trace!(event = ?event, "Civic event");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
