//! Per-connection login and administration service.
//!
//! A connection subscribes once to obtain its peer token, then logs users in
//! through it. Every authentication of the peer that ends for a reason other
//! than its own logout is reported with an `AuthenticationExpired` callback.

use crema_core::{CloseReason, ResultBase, SignatureDate};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{fault, respond, CallbackSender, Untracked};
use crate::auth::{Authentication, AuthenticationRegistry, ExpiredNotice};
use crate::error::{CremaError, Result};
use crate::peer::{Peer, PeerRegistry};
use crate::protocol::{Callback, CallbackMessage};

struct HostSubscription {
    peer: Arc<Peer>,
    watcher: JoinHandle<()>,
}

pub struct HostService {
    registry: Arc<AuthenticationRegistry>,
    peers: Arc<PeerRegistry>,
    callbacks: Arc<CallbackSender>,
    subscription: Mutex<Option<HostSubscription>>,
}

impl HostService {
    pub fn new(
        registry: Arc<AuthenticationRegistry>,
        peers: Arc<PeerRegistry>,
        sink: mpsc::UnboundedSender<CallbackMessage>,
    ) -> Self {
        Self {
            registry,
            peers,
            callbacks: Arc::new(CallbackSender::new(sink)),
            subscription: Mutex::new(None),
        }
    }

    /// The peer of this connection, once subscribed.
    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.subscription
            .lock()
            .ok()?
            .as_ref()
            .map(|s| s.peer.clone())
    }

    // ─── Subscription ─────────────────────────────────────────────────

    /// Create the peer of this connection. Allowed once.
    pub fn subscribe(&self) -> ResultBase<Uuid> {
        respond("Subscribe", SignatureDate::empty(), self.try_subscribe().map(Untracked))
    }

    fn try_subscribe(&self) -> Result<Uuid> {
        let mut subscription = self
            .subscription
            .lock()
            .map_err(|_| CremaError::InvalidOperation("host service is poisoned".into()))?;
        if subscription.is_some() {
            return Err(CremaError::InvalidOperation("already subscribed".into()));
        }
        let peer = self.peers.create();
        let watcher = tokio::spawn(forward_expiry(
            self.registry.subscribe_expired(),
            peer.clone(),
            self.callbacks.clone(),
        ));
        let token = peer.token();
        *subscription = Some(HostSubscription { peer, watcher });
        Ok(token)
    }

    /// Log out every authentication of the peer and drop it.
    pub async fn unsubscribe(&self, peer_token: Uuid) -> ResultBase<()> {
        let result = match self.take_subscription(Some(peer_token)) {
            Ok(subscription) => {
                self.release(subscription).await;
                Ok(Untracked(()))
            }
            Err(e) => Err(e),
        };
        respond("Unsubscribe", SignatureDate::empty(), result)
    }

    /// Unsubscribe whatever is subscribed. Used when the connection drops.
    pub async fn close(&self) {
        if let Ok(subscription) = self.take_subscription(None) {
            self.release(subscription).await;
        }
    }

    fn take_subscription(&self, peer_token: Option<Uuid>) -> Result<HostSubscription> {
        let mut subscription = self
            .subscription
            .lock()
            .map_err(|_| CremaError::InvalidOperation("host service is poisoned".into()))?;
        match subscription.as_ref() {
            None => Err(CremaError::InvalidOperation("not subscribed".into())),
            Some(current) if peer_token.is_some_and(|t| t != current.peer.token()) => Err(
                CremaError::InvalidArgument("peer token does not belong to this connection".into()),
            ),
            Some(_) => subscription
                .take()
                .ok_or_else(|| CremaError::InvalidOperation("not subscribed".into())),
        }
    }

    async fn release(&self, subscription: HostSubscription) {
        subscription.watcher.abort();
        for auth in subscription.peer.drain() {
            if let Err(e) = self.registry.logout(&auth).await {
                log::debug!("Logout of '{}' on disconnect: {}", auth.user_id(), e);
            }
        }
        self.peers.remove(subscription.peer.token());
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    pub async fn login(&self, user_id: &str, password: &str) -> ResultBase<Uuid> {
        let result = async {
            let peer = self
                .peer()
                .ok_or_else(|| CremaError::InvalidOperation("subscribe before logging in".into()))?;
            let auth = self.registry.login(user_id, password).await?;
            peer.add(auth.clone());
            Ok(Untracked(auth.token()))
        }
        .await;
        respond("Login", SignatureDate::new(user_id), result)
    }

    pub async fn logout(&self, token: Uuid) -> ResultBase<()> {
        self.call("Logout", token, |auth| async move {
            let peer = self.owning_peer(&auth)?;
            self.registry.logout(&auth).await?;
            peer.remove(auth.token());
            Ok(Untracked(()))
        })
        .await
    }

    /// Keepalive. A dead token yields `false`, not a fault.
    pub async fn is_alive(&self, token: Uuid) -> ResultBase<bool> {
        let signature_date = match self.registry.authenticate(token).await {
            Ok(auth) => auth.signature_date(),
            Err(_) => SignatureDate::empty(),
        };
        ResultBase::ok(!signature_date.is_empty(), signature_date)
    }

    // ─── Administration ───────────────────────────────────────────────

    pub async fn kick_user(&self, token: Uuid, user_id: &str, comment: &str) -> ResultBase<()> {
        self.call("KickUser", token, |auth| async move {
            self.registry.kick(&auth, user_id, comment).await.map(Untracked)
        })
        .await
    }

    pub async fn ban_user(&self, token: Uuid, user_id: &str, comment: &str) -> ResultBase<()> {
        self.call("BanUser", token, |auth| async move {
            self.registry.ban(&auth, user_id, comment).await.map(Untracked)
        })
        .await
    }

    pub async fn unban_user(&self, token: Uuid, user_id: &str) -> ResultBase<()> {
        self.call("UnbanUser", token, |auth| async move {
            self.registry.unban(&auth, user_id).await.map(Untracked)
        })
        .await
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn call<T, F, Fut>(&self, method: &str, token: Uuid, f: F) -> ResultBase<T>
    where
        F: FnOnce(Arc<Authentication>) -> Fut,
        Fut: std::future::Future<Output = Result<Untracked<T>>>,
    {
        let auth = match self.registry.authenticate(token).await {
            Ok(auth) => auth,
            Err(e) => return fault(method, SignatureDate::empty(), &e),
        };
        let signature_date = auth.signature_date();
        respond(method, signature_date, f(auth).await)
    }

    fn owning_peer(&self, auth: &Authentication) -> Result<Arc<Peer>> {
        self.peer()
            .filter(|peer| peer.contains_token(auth.token()))
            .ok_or_else(|| {
                CremaError::InvalidArgument(format!(
                    "'{}' is not logged in on this connection",
                    auth.user_id()
                ))
            })
    }
}

impl Drop for HostService {
    fn drop(&mut self) {
        if let Ok(mut subscription) = self.subscription.lock() {
            if let Some(subscription) = subscription.take() {
                subscription.watcher.abort();
            }
        }
    }
}

/// Drop expired authentications from `peer` and report them.
async fn forward_expiry(
    mut notices: broadcast::Receiver<ExpiredNotice>,
    peer: Arc<Peer>,
    callbacks: Arc<CallbackSender>,
) {
    loop {
        match notices.recv().await {
            Ok(notice) => {
                if peer.remove(notice.token).is_none() || notice.reason == CloseReason::Logout {
                    continue;
                }
                let delivered = callbacks.send(
                    SignatureDate::new(notice.user_id),
                    Callback::AuthenticationExpired {
                        token: notice.token,
                        reason: notice.reason,
                    },
                );
                if !delivered {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Peer {} missed {} expiry notice(s)", peer.token(), missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
