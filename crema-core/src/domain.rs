//! Domain model: the description of one collaboratively edited item and
//! the people editing it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{SignatureDate, TaskId};

/// Lifecycle state of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainState {
    /// Nobody has entered yet.
    Created,
    /// At least one participant is online.
    Active,
    /// Participants exist but all of them are offline.
    Inactive,
    /// Removed from the context.
    Deleted,
}

/// How a participant may interact with a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainAccessType {
    Read,
    ReadWrite,
}

impl DomainAccessType {
    pub fn can_write(self) -> bool {
        self == DomainAccessType::ReadWrite
    }
}

/// Static description of a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub domain_id: Uuid,
    pub data_base_id: Uuid,
    /// Path of the edited item inside its database, e.g. `/tables/Items`.
    pub item_path: String,
    /// Kind of item, e.g. `TableContent` or `TableTemplate`.
    pub item_type: String,
    pub domain_type: String,
    pub creation_info: SignatureDate,
    pub modification_info: SignatureDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainUserInfo {
    pub user_id: String,
    pub user_name: String,
    pub access_type: DomainAccessType,
}

/// Per-participant flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainUserState {
    pub is_online: bool,
    pub is_owner: bool,
    pub is_being_edited: bool,
}

/// Cursor position of a participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainLocationInfo {
    #[serde(default)]
    pub user_id: String,
    pub table_name: String,
    #[serde(default)]
    pub keys: Vec<Value>,
    #[serde(default)]
    pub column_name: String,
}

/// One row addressed by its key values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRowInfo {
    pub table_name: String,
    pub keys: Vec<Value>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl DomainRowInfo {
    pub fn new(table_name: impl Into<String>, keys: Vec<Value>) -> Self {
        Self {
            table_name: table_name.into(),
            keys,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Immediate outcome of a domain mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainResultInfo<T> {
    pub task_id: TaskId,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoveReason {
    Exit,
    Kick,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveInfo {
    pub reason: RemoveReason,
    pub message: String,
}

impl RemoveInfo {
    pub fn exit() -> Self {
        Self {
            reason: RemoveReason::Exit,
            message: String::new(),
        }
    }

    pub fn kick(comment: impl Into<String>) -> Self {
        Self {
            reason: RemoveReason::Kick,
            message: comment.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainUserMetaData {
    pub info: DomainUserInfo,
    pub state: DomainUserState,
    pub location: DomainLocationInfo,
}

/// Point-in-time snapshot of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainMetaData {
    pub domain_id: Uuid,
    pub domain_info: DomainInfo,
    pub domain_state: DomainState,
    pub is_modified: bool,
    pub owner_id: Option<String>,
    pub users: Vec<DomainUserMetaData>,
}

/// Point-in-time snapshot of a whole context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainContextMetaData {
    pub domains: Vec<DomainMetaData>,
}

impl DomainContextMetaData {
    pub fn find(&self, domain_id: Uuid) -> Option<&DomainMetaData> {
        self.domains.iter().find(|d| d.domain_id == domain_id)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
