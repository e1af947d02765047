//! Peers: one duplex connection hosting zero or more authentications.
//!
//! A peer answers one question for the event fan-out: "is this user
//! present on this connection right now?". Expired authentications never
//! count as present, even before they are removed, so containment can never
//! outlive a logout, kick or ban.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::auth::Authentication;

#[derive(Debug)]
pub struct Peer {
    token: Uuid,
    authentications: RwLock<HashMap<Uuid, Arc<Authentication>>>,
}

impl Peer {
    fn new(token: Uuid) -> Self {
        Self {
            token,
            authentications: RwLock::new(HashMap::new()),
        }
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn add(&self, authentication: Arc<Authentication>) {
        if let Ok(mut auths) = self.authentications.write() {
            auths.insert(authentication.token(), authentication);
        }
    }

    pub fn remove(&self, token: Uuid) -> Option<Arc<Authentication>> {
        self.authentications.write().ok()?.remove(&token)
    }

    /// Whether a live authentication for `user_id` is routed through this peer.
    pub fn contains(&self, user_id: &str) -> bool {
        self.authentications
            .read()
            .map(|auths| {
                auths
                    .values()
                    .any(|auth| auth.user_id() == user_id && !auth.is_expired())
            })
            .unwrap_or(false)
    }

    pub fn contains_any<S: AsRef<str>>(&self, user_ids: &[S]) -> bool {
        user_ids.iter().any(|id| self.contains(id.as_ref()))
    }

    pub fn contains_token(&self, token: Uuid) -> bool {
        self.authentications
            .read()
            .map(|auths| auths.contains_key(&token))
            .unwrap_or(false)
    }

    pub fn authentications(&self) -> Vec<Arc<Authentication>> {
        self.authentications
            .read()
            .map(|auths| auths.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return every authentication.
    pub fn drain(&self) -> Vec<Arc<Authentication>> {
        self.authentications
            .write()
            .map(|mut auths| auths.drain().map(|(_, auth)| auth).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.authentications.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide table of peers, owned by the server and injected where needed.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<Uuid, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> Arc<Peer> {
        let peer = Arc::new(Peer::new(Uuid::new_v4()));
        if let Ok(mut peers) = self.peers.write() {
            peers.insert(peer.token, peer.clone());
        }
        log::debug!("Peer {} created", peer.token);
        peer
    }

    pub fn get(&self, token: Uuid) -> Option<Arc<Peer>> {
        self.peers.read().ok()?.get(&token).cloned()
    }

    pub fn remove(&self, token: Uuid) -> Option<Arc<Peer>> {
        let peer = self.peers.write().ok()?.remove(&token);
        if peer.is_some() {
            log::debug!("Peer {} removed", token);
        }
        peer
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
