//! Event fan-out with per-subscriber filtering.
//!
//! Domains and the context publish [`DomainEvent`]s into one [`EventHub`].
//! Each subscriber registers a predicate together with its sink; an event
//! is pushed to every sink whose predicate accepts it.
//!
//! ```text
//!  Domain A ──┐                    ┌─ (peer 1 filter) ──► sink 1
//!  Domain B ──┼──► EventHub ───────┼─ (peer 2 filter) ──► sink 2
//!  Context  ──┘                    └─ (peer 3 filter) ──► sink 3
//! ```
//!
//! Events from one publisher reach each sink in publication order. Sinks
//! are unbounded, so a slow subscriber never blocks a domain dispatcher.

use crema_core::{
    DomainInfo, DomainLocationInfo, DomainMetaData, DomainRowInfo, DomainState, DomainUserInfo,
    DomainUserState, RemoveInfo, SignatureDate, TaskId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Which users an event concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Delivered to every subscriber.
    Everyone,
    /// Delivered only to peers hosting one of these users.
    Participants(Vec<String>),
}

/// The sixteen kinds of domain notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum DomainEventKind {
    DomainsCreated {
        metadatas: Vec<DomainMetaData>,
    },
    DomainsDeleted {
        domain_ids: Vec<Uuid>,
        is_canceleds: Vec<bool>,
    },
    DomainInfoChanged {
        domain_id: Uuid,
        domain_info: DomainInfo,
    },
    DomainStateChanged {
        domain_id: Uuid,
        domain_state: DomainState,
    },
    UserAdded {
        domain_id: Uuid,
        user_info: DomainUserInfo,
        user_state: DomainUserState,
        /// Content snapshot; only delivered to the entering user's peer.
        data: Option<Value>,
        task_id: TaskId,
    },
    UserRemoved {
        domain_id: Uuid,
        user_id: String,
        owner_id: Option<String>,
        remove_info: RemoveInfo,
        task_id: TaskId,
    },
    UserLocationChanged {
        domain_id: Uuid,
        location: DomainLocationInfo,
    },
    UserStateChanged {
        domain_id: Uuid,
        user_id: String,
        user_state: DomainUserState,
    },
    UserEditBegun {
        domain_id: Uuid,
        location: DomainLocationInfo,
        task_id: TaskId,
    },
    UserEditEnded {
        domain_id: Uuid,
        user_id: String,
        task_id: TaskId,
    },
    OwnerChanged {
        domain_id: Uuid,
        owner_id: String,
        task_id: TaskId,
    },
    RowAdded {
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
        task_id: TaskId,
    },
    RowChanged {
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
        task_id: TaskId,
    },
    RowRemoved {
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
        task_id: TaskId,
    },
    PropertyChanged {
        domain_id: Uuid,
        name: String,
        value: Value,
        task_id: TaskId,
    },
    TaskCompleted {
        task_ids: Vec<TaskId>,
    },
}

impl DomainEventKind {
    /// Domain the event refers to, if it refers to exactly one.
    pub fn domain_id(&self) -> Option<Uuid> {
        match self {
            DomainEventKind::DomainsCreated { .. }
            | DomainEventKind::DomainsDeleted { .. }
            | DomainEventKind::TaskCompleted { .. } => None,
            DomainEventKind::DomainInfoChanged { domain_id, .. }
            | DomainEventKind::DomainStateChanged { domain_id, .. }
            | DomainEventKind::UserAdded { domain_id, .. }
            | DomainEventKind::UserRemoved { domain_id, .. }
            | DomainEventKind::UserLocationChanged { domain_id, .. }
            | DomainEventKind::UserStateChanged { domain_id, .. }
            | DomainEventKind::UserEditBegun { domain_id, .. }
            | DomainEventKind::UserEditEnded { domain_id, .. }
            | DomainEventKind::OwnerChanged { domain_id, .. }
            | DomainEventKind::RowAdded { domain_id, .. }
            | DomainEventKind::RowChanged { domain_id, .. }
            | DomainEventKind::RowRemoved { domain_id, .. }
            | DomainEventKind::PropertyChanged { domain_id, .. } => Some(*domain_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEventKind::DomainsCreated { .. } => "DomainsCreated",
            DomainEventKind::DomainsDeleted { .. } => "DomainsDeleted",
            DomainEventKind::DomainInfoChanged { .. } => "DomainInfoChanged",
            DomainEventKind::DomainStateChanged { .. } => "DomainStateChanged",
            DomainEventKind::UserAdded { .. } => "UserAdded",
            DomainEventKind::UserRemoved { .. } => "UserRemoved",
            DomainEventKind::UserLocationChanged { .. } => "UserLocationChanged",
            DomainEventKind::UserStateChanged { .. } => "UserStateChanged",
            DomainEventKind::UserEditBegun { .. } => "UserEditBegun",
            DomainEventKind::UserEditEnded { .. } => "UserEditEnded",
            DomainEventKind::OwnerChanged { .. } => "OwnerChanged",
            DomainEventKind::RowAdded { .. } => "RowAdded",
            DomainEventKind::RowChanged { .. } => "RowChanged",
            DomainEventKind::RowRemoved { .. } => "RowRemoved",
            DomainEventKind::PropertyChanged { .. } => "PropertyChanged",
            DomainEventKind::TaskCompleted { .. } => "TaskCompleted",
        }
    }
}

/// A published notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub signature_date: SignatureDate,
    /// User whose action produced the event.
    pub user_id: String,
    pub audience: Audience,
    pub kind: DomainEventKind,
}

impl DomainEvent {
    pub fn new(signature_date: SignatureDate, audience: Audience, kind: DomainEventKind) -> Self {
        Self {
            user_id: signature_date.id.clone(),
            signature_date,
            audience,
            kind,
        }
    }

    pub fn everyone(signature_date: SignatureDate, kind: DomainEventKind) -> Self {
        Self::new(signature_date, Audience::Everyone, kind)
    }
}

pub type EventFilter = Arc<dyn Fn(&DomainEvent) -> bool + Send + Sync>;

struct Subscriber {
    id: u64,
    filter: EventFilter,
    sink: mpsc::UnboundedSender<Arc<DomainEvent>>,
}

/// Receiving end handed to a subscriber.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::UnboundedReceiver<Arc<DomainEvent>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub subscribers: usize,
}

#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (sink, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.push(Subscriber { id, filter, sink });
        }
        Subscription { id, receiver }
    }

    /// Subscribe without filtering.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(Arc::new(|_| true))
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        match self.subscribers.write() {
            Ok(mut subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|s| s.id != id);
                subscribers.len() != before
            }
            Err(_) => false,
        }
    }

    /// Push `event` to every accepting subscriber. Returns the delivery count.
    pub fn publish(&self, event: DomainEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut closed = Vec::new();
        if let Ok(subscribers) = self.subscribers.read() {
            for subscriber in subscribers.iter() {
                if !(subscriber.filter)(&event) {
                    continue;
                }
                if subscriber.sink.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(subscriber.id);
                }
            }
        }
        for id in closed {
            self.unsubscribe(id);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        log::trace!("{} delivered to {} subscriber(s)", event.kind.name(), delivered);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            events_published: self.published.load(Ordering::Relaxed),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
