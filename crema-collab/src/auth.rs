//! Authentication registry: user accounts, login sessions and tokens.
//!
//! ```text
//!  login(user, password) ──► token ──► Arc<Authentication>
//!                                           │
//!        logout / kick / ban / idle timeout │ expire(reason)
//!                                           ▼
//!                     watch (per session) + broadcast (registry-wide)
//! ```
//!
//! A token resolves to exactly one live [`Authentication`]. Once a session
//! expires its token is gone from the registry, so every later call that
//! presents it fails with [`CremaError::InvalidToken`].

use chrono::{DateTime, Utc};
use crema_core::{Authority, CloseReason, SignatureDate, UserInfo};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock};
use uuid::Uuid;

use crate::error::{CremaError, Result};

/// Reserved identity used by server-internal operations.
pub const SYSTEM_USER_ID: &str = "system";

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Sessions without a keepalive for this long are expired.
    pub session_timeout: Duration,
    /// Salt mixed into stored password hashes.
    pub password_salt: String,
    /// Capacity of the expiry notice channel.
    pub notice_capacity: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(120),
            password_salt: "crema".to_string(),
            notice_capacity: 256,
        }
    }
}

impl AuthConfig {
    pub fn for_testing() -> Self {
        Self {
            session_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

/// A live login session.
#[derive(Debug)]
pub struct Authentication {
    token: Uuid,
    user: UserInfo,
    signed_in: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    expired: watch::Sender<Option<CloseReason>>,
}

impl Authentication {
    fn new(token: Uuid, user: UserInfo) -> Self {
        let (expired, _) = watch::channel(None);
        Self {
            token,
            user,
            signed_in: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            expired,
        }
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn user_id(&self) -> &str {
        &self.user.user_id
    }

    pub fn name(&self) -> &str {
        &self.user.name
    }

    pub fn authority(&self) -> Authority {
        self.user.authority
    }

    pub fn user_info(&self) -> &UserInfo {
        &self.user
    }

    pub fn is_admin(&self) -> bool {
        self.user.authority.is_admin()
    }

    pub fn is_system(&self) -> bool {
        self.user.user_id == SYSTEM_USER_ID
    }

    pub fn signed_in(&self) -> DateTime<Utc> {
        self.signed_in
    }

    /// Signature stamped on results and events produced by this session.
    pub fn signature_date(&self) -> SignatureDate {
        SignatureDate::new(self.user.user_id.clone())
    }

    pub fn is_expired(&self) -> bool {
        self.expired.borrow().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.expired.borrow()
    }

    /// Resolves once the session expires.
    pub async fn expired(&self) -> CloseReason {
        let mut rx = self.expired.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::Shutdown;
            }
        }
    }

    /// Fail with [`CremaError::AuthenticationExpired`] once expired.
    pub fn ensure_alive(&self) -> Result<()> {
        if self.is_expired() {
            return Err(CremaError::AuthenticationExpired(self.user.user_id.clone()));
        }
        Ok(())
    }

    fn touch(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|last_seen| last_seen.elapsed())
            .unwrap_or_default()
    }

    /// Returns `true` if this call performed the transition.
    fn expire(&self, reason: CloseReason) -> bool {
        self.expired.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }
}

/// Published on the registry-wide channel whenever a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredNotice {
    pub token: Uuid,
    pub user_id: String,
    pub reason: CloseReason,
}

#[derive(Debug, Clone)]
pub struct BanInfo {
    pub comment: String,
    pub signature_date: SignatureDate,
}

#[derive(Debug, Clone)]
struct UserAccount {
    info: UserInfo,
    password_hash: String,
    ban: Option<BanInfo>,
}

#[derive(Default)]
struct RegistryState {
    users: HashMap<String, UserAccount>,
    sessions: HashMap<Uuid, Arc<Authentication>>,
    /// user_id → token of its live session
    online: HashMap<String, Uuid>,
}

impl RegistryState {
    /// Remove the session and expire it before the lock is released, so a
    /// token is never absent from the registry while its session still
    /// looks alive. The returned notice is published after unlocking.
    fn end_session(&mut self, token: Uuid, reason: CloseReason) -> Option<ExpiredNotice> {
        let auth = self.sessions.remove(&token)?;
        if self.online.get(auth.user_id()) == Some(&token) {
            self.online.remove(auth.user_id());
        }
        Self::expire(&auth, reason)
    }

    fn expire(auth: &Authentication, reason: CloseReason) -> Option<ExpiredNotice> {
        auth.expire(reason).then(|| ExpiredNotice {
            token: auth.token,
            user_id: auth.user_id().to_string(),
            reason,
        })
    }
}

pub struct AuthenticationRegistry {
    config: AuthConfig,
    state: RwLock<RegistryState>,
    system: Arc<Authentication>,
    notices: broadcast::Sender<ExpiredNotice>,
}

impl AuthenticationRegistry {
    pub fn new(config: AuthConfig) -> Self {
        let system = Arc::new(Authentication::new(
            Uuid::new_v4(),
            UserInfo {
                user_id: SYSTEM_USER_ID.to_string(),
                name: "System".to_string(),
                authority: Authority::Admin,
            },
        ));
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
        Self {
            config,
            state: RwLock::new(RegistryState::default()),
            system,
            notices,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Token of the built-in system session. Never handed to clients.
    pub fn system_token(&self) -> Uuid {
        self.system.token
    }

    pub fn system(&self) -> Arc<Authentication> {
        self.system.clone()
    }

    /// Receive a notice for every session that ends from now on.
    pub fn subscribe_expired(&self) -> broadcast::Receiver<ExpiredNotice> {
        self.notices.subscribe()
    }

    // ─── Accounts ─────────────────────────────────────────────────────

    pub async fn add_user(
        &self,
        user_id: &str,
        name: &str,
        password: &str,
        authority: Authority,
    ) -> Result<()> {
        if user_id.is_empty() || user_id == SYSTEM_USER_ID {
            return Err(CremaError::InvalidArgument(format!("'{user_id}' is not a valid user id")));
        }
        let mut state = self.state.write().await;
        if state.users.contains_key(user_id) {
            return Err(CremaError::InvalidArgument(format!("user '{user_id}' already exists")));
        }
        state.users.insert(
            user_id.to_string(),
            UserAccount {
                info: UserInfo {
                    user_id: user_id.to_string(),
                    name: name.to_string(),
                    authority,
                },
                password_hash: self.hash_password(user_id, password),
                ban: None,
            },
        );
        log::debug!("User '{}' added as {}", user_id, authority);
        Ok(())
    }

    pub async fn users(&self) -> Vec<UserInfo> {
        let state = self.state.read().await;
        let mut users: Vec<UserInfo> = state.users.values().map(|u| u.info.clone()).collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub async fn online_users(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut users: Vec<String> = state.online.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn ban_info(&self, user_id: &str) -> Option<BanInfo> {
        let state = self.state.read().await;
        state.users.get(user_id).and_then(|u| u.ban.clone())
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Validate credentials and open a new session.
    ///
    /// A user that is already online loses its previous session with
    /// [`CloseReason::Reconnected`].
    pub async fn login(&self, user_id: &str, password: &str) -> Result<Arc<Authentication>> {
        let hash = self.hash_password(user_id, password);
        let (auth, replaced) = {
            let mut state = self.state.write().await;
            let account = state
                .users
                .get(user_id)
                .ok_or_else(|| CremaError::AuthenticationFailed("invalid user id or password".into()))?;
            if account.password_hash != hash {
                return Err(CremaError::AuthenticationFailed("invalid user id or password".into()));
            }
            if let Some(ban) = &account.ban {
                return Err(CremaError::AuthenticationFailed(format!(
                    "user '{user_id}' is banned: {}",
                    ban.comment
                )));
            }
            let info = account.info.clone();
            let replaced = state
                .online
                .get(user_id)
                .copied()
                .and_then(|token| state.end_session(token, CloseReason::Reconnected));

            let auth = Arc::new(Authentication::new(Uuid::new_v4(), info));
            state.sessions.insert(auth.token, auth.clone());
            state.online.insert(user_id.to_string(), auth.token);
            (auth, replaced)
        };

        if let Some(notice) = replaced {
            self.publish_expired(notice);
        }
        log::info!("User '{}' logged in", user_id);
        Ok(auth)
    }

    /// Resolve a token presented by a client.
    pub async fn authenticate(&self, token: Uuid) -> Result<Arc<Authentication>> {
        if token == self.system.token {
            return Ok(self.system.clone());
        }
        let state = self.state.read().await;
        match state.sessions.get(&token) {
            Some(auth) if !auth.is_expired() => {
                auth.touch();
                Ok(auth.clone())
            }
            _ => Err(CremaError::InvalidToken(token)),
        }
    }

    pub async fn logout(&self, authentication: &Authentication) -> Result<()> {
        if authentication.is_system() {
            return Err(CremaError::InvalidOperation("the system session cannot log out".into()));
        }
        let ended = self
            .state
            .write()
            .await
            .end_session(authentication.token, CloseReason::Logout);
        match ended {
            Some(notice) => {
                log::info!("User '{}' logged out", notice.user_id);
                self.publish_expired(notice);
                Ok(())
            }
            None => Err(CremaError::InvalidToken(authentication.token)),
        }
    }

    /// Whether `token` names a live session. Unlike [`Self::is_alive`] this
    /// does not count as a keepalive.
    pub async fn contains_session(&self, token: Uuid) -> bool {
        token == self.system.token || self.state.read().await.sessions.contains_key(&token)
    }

    /// Keepalive. Returns whether the token still names a live session.
    pub async fn is_alive(&self, token: Uuid) -> bool {
        self.authenticate(token).await.is_ok()
    }

    /// Expire every session idle for longer than the configured timeout.
    pub async fn expire_idle(&self) -> usize {
        let expired: Vec<ExpiredNotice> = {
            let mut state = self.state.write().await;
            let idle: Vec<Uuid> = state
                .sessions
                .values()
                .filter(|auth| auth.idle_for() > self.config.session_timeout)
                .map(|auth| auth.token)
                .collect();
            idle.into_iter()
                .filter_map(|token| state.end_session(token, CloseReason::Timeout))
                .collect()
        };
        let count = expired.len();
        for notice in expired {
            log::info!("Session of '{}' timed out", notice.user_id);
            self.publish_expired(notice);
        }
        count
    }

    /// Expire every session, e.g. on server shutdown.
    pub async fn close_all(&self) {
        let ended: Vec<ExpiredNotice> = {
            let mut state = self.state.write().await;
            state.online.clear();
            state
                .sessions
                .drain()
                .filter_map(|(_, auth)| RegistryState::expire(&auth, CloseReason::Shutdown))
                .collect()
        };
        for notice in ended {
            self.publish_expired(notice);
        }
    }

    // ─── Administration ───────────────────────────────────────────────

    /// Force a user offline.
    pub async fn kick(&self, authentication: &Authentication, user_id: &str, comment: &str) -> Result<()> {
        authentication.ensure_alive()?;
        Self::require_comment(comment)?;
        Self::require_admin(authentication, "kick")?;
        if authentication.user_id() == user_id {
            return Err(CremaError::InvalidOperation("cannot kick yourself".into()));
        }
        let ended = {
            let mut state = self.state.write().await;
            if !state.users.contains_key(user_id) {
                return Err(CremaError::UserNotFound(user_id.to_string()));
            }
            let token = state
                .online
                .get(user_id)
                .copied()
                .ok_or_else(|| CremaError::InvalidOperation(format!("user '{user_id}' is not online")))?;
            state.end_session(token, CloseReason::Kicked)
        };
        if let Some(notice) = ended {
            log::info!("User '{}' kicked by '{}': {}", user_id, authentication.user_id(), comment);
            self.publish_expired(notice);
        }
        Ok(())
    }

    /// Ban a user and end its session if it is online.
    pub async fn ban(&self, authentication: &Authentication, user_id: &str, comment: &str) -> Result<()> {
        authentication.ensure_alive()?;
        Self::require_comment(comment)?;
        Self::require_admin(authentication, "ban")?;
        if authentication.user_id() == user_id {
            return Err(CremaError::InvalidOperation("cannot ban yourself".into()));
        }
        let ended = {
            let mut state = self.state.write().await;
            let account = state
                .users
                .get_mut(user_id)
                .ok_or_else(|| CremaError::UserNotFound(user_id.to_string()))?;
            if account.ban.is_some() {
                return Err(CremaError::InvalidOperation(format!("user '{user_id}' is already banned")));
            }
            if account.info.authority.is_admin() {
                return Err(CremaError::PermissionDenied(format!("administrator '{user_id}' cannot be banned")));
            }
            account.ban = Some(BanInfo {
                comment: comment.to_string(),
                signature_date: authentication.signature_date(),
            });
            state
                .online
                .get(user_id)
                .copied()
                .and_then(|token| state.end_session(token, CloseReason::Banned))
        };
        log::info!("User '{}' banned by '{}': {}", user_id, authentication.user_id(), comment);
        if let Some(notice) = ended {
            self.publish_expired(notice);
        }
        Ok(())
    }

    pub async fn unban(&self, authentication: &Authentication, user_id: &str) -> Result<()> {
        authentication.ensure_alive()?;
        Self::require_admin(authentication, "unban")?;
        let mut state = self.state.write().await;
        let account = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| CremaError::UserNotFound(user_id.to_string()))?;
        if account.ban.take().is_none() {
            return Err(CremaError::InvalidOperation(format!("user '{user_id}' is not banned")));
        }
        log::info!("User '{}' unbanned by '{}'", user_id, authentication.user_id());
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn hash_password(&self, user_id: &str, password: &str) -> String {
        let digest = Sha256::digest(format!("{}:{}:{}", self.config.password_salt, user_id, password));
        format!("{digest:x}")
    }

    fn publish_expired(&self, notice: ExpiredNotice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    fn require_admin(authentication: &Authentication, action: &str) -> Result<()> {
        if !authentication.is_admin() {
            return Err(CremaError::PermissionDenied(format!(
                "'{}' is not allowed to {action} users",
                authentication.user_id()
            )));
        }
        Ok(())
    }

    fn require_comment(comment: &str) -> Result<()> {
        if comment.trim().is_empty() {
            return Err(CremaError::InvalidArgument("a comment is required".into()));
        }
        Ok(())
    }
}
