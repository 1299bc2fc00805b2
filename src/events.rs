//! Catalog of event tags hooks can subscribe to.

use serde::Serialize;

pub const TICKET_CREATED: &str = "ticket.created";
pub const TICKET_UPDATED: &str = "ticket.updated";
pub const TICKET_ASSIGNED: &str = "ticket.assigned";
pub const TICKET_CLOSED: &str = "ticket.closed";
pub const TICKET_REOPENED: &str = "ticket.reopened";
pub const MESSAGE_SENT: &str = "message.sent";
pub const USER_MENTIONED: &str = "user.mentioned";
pub const TOPIC_LINKED: &str = "topic.linked";
pub const TOPIC_UNLINKED: &str = "topic.unlinked";

/// Tag carried by synthetic test deliveries. Not subscribable.
pub const HOOK_TEST: &str = "hook.test";

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EventDescriptor {
    pub tag: &'static str,
    pub description: &'static str,
}

pub const SUPPORTED_EVENTS: &[EventDescriptor] = &[
    EventDescriptor {
        tag: TICKET_CREATED,
        description: "A ticket was opened",
    },
    EventDescriptor {
        tag: TICKET_UPDATED,
        description: "A ticket's fields changed",
    },
    EventDescriptor {
        tag: TICKET_ASSIGNED,
        description: "A ticket was assigned to a user",
    },
    EventDescriptor {
        tag: TICKET_CLOSED,
        description: "A ticket was closed",
    },
    EventDescriptor {
        tag: TICKET_REOPENED,
        description: "A closed ticket was reopened",
    },
    EventDescriptor {
        tag: MESSAGE_SENT,
        description: "A message was posted in a ticket topic",
    },
    EventDescriptor {
        tag: USER_MENTIONED,
        description: "A user was mentioned in a message",
    },
    EventDescriptor {
        tag: TOPIC_LINKED,
        description: "A chat topic was linked to a ticket",
    },
    EventDescriptor {
        tag: TOPIC_UNLINKED,
        description: "A chat topic was unlinked from a ticket",
    },
];

pub fn is_supported(tag: &str) -> bool {
    SUPPORTED_EVENTS.iter().any(|e| e.tag == tag)
}
