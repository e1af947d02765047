//! # crema-core: shared data model for the Crema domain-session engine
//!
//! Everything that crosses the wire between a Crema server and its clients
//! lives here: identities, signatures, domain descriptions, row payloads,
//! and the errors-as-data result envelope.
//!
//! ```text
//! ┌──────────────┐   ResultBase<T>    ┌──────────────┐
//! │ client       │ ◄───────────────── │ server       │
//! │              │   CallbackInfo +   │ (crema-      │
//! │              │ ◄── callbacks ──── │  collab)     │
//! └──────────────┘                    └──────────────┘
//! ```

pub mod domain;
pub mod result;

pub use domain::{
    DomainAccessType, DomainContextMetaData, DomainInfo, DomainLocationInfo, DomainMetaData,
    DomainResultInfo, DomainRowInfo, DomainState, DomainUserInfo, DomainUserMetaData,
    DomainUserState, RemoveInfo,
    RemoveReason,
};
pub use result::{CallbackInfo, Fault, ResultBase};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Capability level of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Authority {
    Admin,
    Member,
    Guest,
}

impl Authority {
    pub fn is_admin(self) -> bool {
        self == Authority::Admin
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authority::Admin => write!(f, "Admin"),
            Authority::Member => write!(f, "Member"),
            Authority::Guest => write!(f, "Guest"),
        }
    }
}

/// Who did something, and when.
///
/// Attached to every result and every callback for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureDate {
    pub id: String,
    pub date_time: DateTime<Utc>,
}

impl SignatureDate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            date_time: Utc::now(),
        }
    }

    /// Signature used when no identity could be resolved.
    pub fn empty() -> Self {
        Self {
            id: String::new(),
            date_time: DateTime::<Utc>::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

impl Default for SignatureDate {
    fn default() -> Self {
        Self::empty()
    }
}

/// Identifier handed out for an asynchronous domain mutation.
///
/// Correlates a result with the later `TaskCompleted` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Why an authentication stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Logout,
    Kicked,
    Banned,
    Reconnected,
    Timeout,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Logout => "logged out",
            CloseReason::Kicked => "kicked",
            CloseReason::Banned => "banned",
            CloseReason::Reconnected => "reconnected elsewhere",
            CloseReason::Timeout => "timed out",
            CloseReason::Shutdown => "server shutdown",
        };
        f.write_str(text)
    }
}

/// Public description of a user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub name: String,
    pub authority: Authority,
}

/// Identifier for a database (a versioned set of tables).
pub type DataBaseId = Uuid;
