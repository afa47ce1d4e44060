//! Event bus
//!
//! One producer (the client), any number of subscribers. Delivery is
//! synchronous and in registration order on the caller's task.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::ClientError;
use crate::types::{Member, Message};

/// Notification emitted by the client
#[derive(Debug)]
pub enum Event {
    /// A QR ticket is ready to be scanned
    TicketReady(String),
    /// The scan was confirmed on the phone
    Authenticated,
    /// The member list was fetched and partitioned
    DirectoryReady(Vec<Member>),
    Text(Message),
    Image(Message),
    Voice(Message),
    Sticker(Message),
    StatusNotify(Message),
    VerifyRequest(Message),
    /// Fatal session error, followed by `SessionEnded`
    SessionError(ClientError),
    SessionEnded,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::TicketReady(_) => "ticket_ready",
            Event::Authenticated => "authenticated",
            Event::DirectoryReady(_) => "directory_ready",
            Event::Text(_) => "message.text",
            Event::Image(_) => "message.image",
            Event::Voice(_) => "message.voice",
            Event::Sticker(_) => "message.sticker",
            Event::StatusNotify(_) => "message.status_notify",
            Event::VerifyRequest(_) => "message.verify_request",
            Event::SessionError(_) => "session_error",
            Event::SessionEnded => "session_ended",
        }
    }
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}

#[derive(Default, Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn dispatch(&self, event: &Event) {
        // Snapshot so a handler may subscribe without deadlocking
        let handlers = self.handlers.read().clone();
        for handler in handlers.iter() {
            handler.handle_event(event);
        }
    }
}
