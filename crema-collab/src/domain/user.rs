//! A participant of a domain.

use crema_core::{
    DomainAccessType, DomainLocationInfo, DomainUserInfo, DomainUserMetaData, DomainUserState,
};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DomainUser {
    pub info: DomainUserInfo,
    pub state: DomainUserState,
    pub location: DomainLocationInfo,
    /// Authentication the participant is attached through while online.
    pub token: Option<Uuid>,
}

impl DomainUser {
    pub fn new(user_id: &str, user_name: &str, access_type: DomainAccessType) -> Self {
        Self {
            info: DomainUserInfo {
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                access_type,
            },
            state: DomainUserState {
                is_online: true,
                ..DomainUserState::default()
            },
            location: DomainLocationInfo {
                user_id: user_id.to_string(),
                ..DomainLocationInfo::default()
            },
            token: None,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.info.user_id
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online
    }

    pub fn can_write(&self) -> bool {
        self.info.access_type.can_write()
    }

    /// Go offline. An offline participant is never editing.
    pub fn detach(&mut self) {
        self.state.is_online = false;
        self.state.is_being_edited = false;
        self.token = None;
    }

    pub fn metadata(&self) -> DomainUserMetaData {
        DomainUserMetaData {
            info: self.info.clone(),
            state: self.state,
            location: self.location.clone(),
        }
    }
}
