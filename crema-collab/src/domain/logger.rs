//! Durable action log of one domain.
//!
//! ```text
//!  post(action) ──► CF "actions"   (domain_id ‖ post_id)
//!  complete()   ──► CF "completed" (domain_id ‖ post_id)
//!  restore      ◄── header + completed actions, in post order
//! ```

use crema_core::{
    DomainAccessType, DomainInfo, DomainLocationInfo, DomainRowInfo, SignatureDate,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::content::DomainContent;
use crate::storage::{DomainStore, StoreError};

/// One accepted mutation, as replayed on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum DomainAction {
    Enter {
        user_id: String,
        user_name: String,
        access_type: DomainAccessType,
    },
    Leave {
        user_id: String,
    },
    Kick {
        user_id: String,
        comment: String,
    },
    /// The participant's authentication expired.
    Detach {
        user_id: String,
    },
    SetOwner {
        user_id: String,
    },
    SetLocation {
        location: DomainLocationInfo,
    },
    BeginEdit {
        location: DomainLocationInfo,
    },
    EndEdit {
        user_id: String,
    },
    NewRow {
        rows: Vec<DomainRowInfo>,
    },
    SetRow {
        rows: Vec<DomainRowInfo>,
    },
    RemoveRow {
        rows: Vec<DomainRowInfo>,
    },
    SetProperty {
        name: String,
        value: Value,
    },
}

impl DomainAction {
    /// Whether the action changes content rather than participants.
    pub fn modifies_content(&self) -> bool {
        matches!(
            self,
            DomainAction::NewRow { .. }
                | DomainAction::SetRow { .. }
                | DomainAction::RemoveRow { .. }
                | DomainAction::SetProperty { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedAction {
    pub signature_date: SignatureDate,
    pub action: DomainAction,
}

/// What a domain was created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainHeader {
    pub info: DomainInfo,
    pub content: DomainContent,
}

pub struct DomainLogger {
    domain_id: Uuid,
    store: Arc<DomainStore>,
    next_post_id: u64,
}

impl DomainLogger {
    /// Persist the header of a new domain.
    pub fn create(store: Arc<DomainStore>, header: &DomainHeader) -> Result<Self, StoreError> {
        let bytes = serde_json::to_vec(header)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        store.save_domain(header.info.domain_id, &bytes)?;
        Ok(Self {
            domain_id: header.info.domain_id,
            store,
            next_post_id: 1,
        })
    }

    /// Load a stored domain: its header and every completed action.
    pub fn restore(
        store: Arc<DomainStore>,
        domain_id: Uuid,
    ) -> Result<(Self, DomainHeader, Vec<LoggedAction>), StoreError> {
        let header: DomainHeader = serde_json::from_slice(&store.load_domain(domain_id)?)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        let mut actions = Vec::new();
        for (post_id, bytes) in store.load_completed_actions(domain_id)? {
            let action: LoggedAction = serde_json::from_slice(&bytes).map_err(|e| {
                StoreError::DeserializationError(format!("action {post_id} of {domain_id}: {e}"))
            })?;
            actions.push(action);
        }
        let next_post_id = store.last_post_id(domain_id)?.map_or(1, |last| last + 1);
        let logger = Self {
            domain_id,
            store,
            next_post_id,
        };
        Ok((logger, header, actions))
    }

    pub fn post(&mut self, action: &LoggedAction) -> Result<u64, StoreError> {
        let bytes = serde_json::to_vec(action)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let post_id = self.next_post_id;
        self.store.post_action(self.domain_id, post_id, &bytes)?;
        self.next_post_id += 1;
        Ok(post_id)
    }

    pub fn complete(&self, post_id: u64) -> Result<(), StoreError> {
        self.store.complete_action(self.domain_id, post_id)
    }

    /// Post and complete in one step.
    pub fn record(&mut self, action: &LoggedAction) -> Result<u64, StoreError> {
        let post_id = self.post(action)?;
        self.complete(post_id)?;
        Ok(post_id)
    }

    /// Remove the header and the whole log.
    pub fn delete(&self) -> Result<(), StoreError> {
        self.store.delete_domain(self.domain_id)
    }

    pub fn next_post_id(&self) -> u64 {
        self.next_post_id
    }
}
