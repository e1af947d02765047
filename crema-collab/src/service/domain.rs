//! Per-connection façade over the [`DomainContext`].
//!
//! Subscribing returns a metadata snapshot and starts forwarding the events
//! that concern this connection: lifecycle and presence events always, and
//! participant-only events when one of the connection's users takes part in
//! the domain. A content snapshot inside `UserAdded` only reaches the peer of
//! the entering user.

use crema_core::{
    DataBaseId, DomainAccessType, DomainContextMetaData, DomainLocationInfo, DomainMetaData,
    DomainRowInfo, ResultBase, SignatureDate,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{fault, respond, CallbackSender, Reply, Untracked};
use crate::auth::Authentication;
use crate::broadcast::{Audience, DomainEvent, DomainEventKind, EventFilter};
use crate::context::{CreateDomain, DomainContext};
use crate::error::{CremaError, Result};
use crate::peer::{Peer, PeerRegistry};
use crate::protocol::{Callback, CallbackMessage};

struct DomainSubscription {
    peer_token: Uuid,
    hub_id: u64,
    forwarder: JoinHandle<()>,
}

pub struct DomainContextService {
    context: Arc<DomainContext>,
    peers: Arc<PeerRegistry>,
    callbacks: Arc<CallbackSender>,
    subscription: Mutex<Option<DomainSubscription>>,
}

impl DomainContextService {
    pub fn new(
        context: Arc<DomainContext>,
        peers: Arc<PeerRegistry>,
        sink: mpsc::UnboundedSender<CallbackMessage>,
    ) -> Self {
        Self {
            context,
            peers,
            callbacks: Arc::new(CallbackSender::new(sink)),
            subscription: Mutex::new(None),
        }
    }

    // ─── Subscription ─────────────────────────────────────────────────

    pub async fn subscribe(&self, peer_token: Uuid) -> ResultBase<DomainContextMetaData> {
        let result = self.try_subscribe(peer_token).await.map(Untracked);
        respond("SubscribeDomains", SignatureDate::new(peer_token.to_string()), result)
    }

    async fn try_subscribe(&self, peer_token: Uuid) -> Result<DomainContextMetaData> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Err(CremaError::InvalidOperation("already subscribed to domains".into()));
        }
        let peer = self
            .peers
            .get(peer_token)
            .ok_or_else(|| CremaError::InvalidArgument(format!("unknown peer {peer_token}")))?;

        let (metadata, hub_subscription) = self.context.subscribe(peer_filter(peer.clone())).await?;
        let forwarder = tokio::spawn(forward_events(
            hub_subscription.receiver,
            peer,
            self.callbacks.clone(),
        ));
        *subscription = Some(DomainSubscription {
            peer_token,
            hub_id: hub_subscription.id,
            forwarder,
        });
        log::debug!("Peer {} subscribed to {} domain(s)", peer_token, metadata.len());
        Ok(metadata)
    }

    pub async fn unsubscribe(&self, peer_token: Uuid) -> ResultBase<()> {
        let result = {
            let mut subscription = self.subscription.lock().await;
            match subscription.as_ref() {
                None => Err(CremaError::InvalidOperation("not subscribed to domains".into())),
                Some(current) if current.peer_token != peer_token => Err(CremaError::InvalidArgument(
                    "peer token does not belong to this connection".into(),
                )),
                Some(_) => {
                    if let Some(current) = subscription.take() {
                        self.release(current);
                    }
                    Ok(Untracked(()))
                }
            }
        };
        respond("UnsubscribeDomains", SignatureDate::new(peer_token.to_string()), result)
    }

    /// Drop the subscription, if any. Used when the connection drops.
    pub async fn close(&self) {
        if let Some(current) = self.subscription.lock().await.take() {
            self.release(current);
        }
    }

    fn release(&self, subscription: DomainSubscription) {
        self.context.hub().unsubscribe(subscription.hub_id);
        subscription.forwarder.abort();
        log::debug!("Peer {} unsubscribed from domains", subscription.peer_token);
    }

    // ─── Context ──────────────────────────────────────────────────────

    pub async fn get_metadata(
        &self,
        token: Uuid,
        data_base_id: Option<DataBaseId>,
    ) -> ResultBase<DomainContextMetaData> {
        self.call("GetMetaData", token, |auth| async move {
            auth.ensure_alive()?;
            let metadata = match data_base_id {
                Some(id) => self.context.get_metadata_for(id).await?,
                None => self.context.get_metadata().await?,
            };
            Ok(Untracked(metadata))
        })
        .await
    }

    pub async fn create_domain(&self, token: Uuid, request: CreateDomain) -> ResultBase<DomainMetaData> {
        self.call("CreateDomain", token, |auth| async move {
            self.context.create_domain(&auth, request).await
        })
        .await
    }

    pub async fn delete_domain(&self, token: Uuid, domain_id: Uuid, force: bool) -> ResultBase<()> {
        self.call("DeleteDomain", token, |auth| async move {
            self.context.delete_domain(&auth, domain_id, force).await
        })
        .await
    }

    pub async fn delete_domains(&self, token: Uuid, data_base_id: DataBaseId) -> ResultBase<Vec<Uuid>> {
        self.call("DeleteDomains", token, |auth| async move {
            self.context.delete_domains(&auth, data_base_id).await
        })
        .await
    }

    // ─── Participation ────────────────────────────────────────────────

    pub async fn enter_domain(
        &self,
        token: Uuid,
        domain_id: Uuid,
        access_type: DomainAccessType,
    ) -> ResultBase<Value> {
        self.call("EnterDomain", token, |auth| async move {
            self.context.domain(domain_id).await?.enter(&auth, access_type).await
        })
        .await
    }

    pub async fn leave_domain(&self, token: Uuid, domain_id: Uuid) -> ResultBase<()> {
        self.call("LeaveDomain", token, |auth| async move {
            self.context.domain(domain_id).await?.leave(&auth).await
        })
        .await
    }

    pub async fn begin_user_edit(
        &self,
        token: Uuid,
        domain_id: Uuid,
        location: DomainLocationInfo,
    ) -> ResultBase<()> {
        self.call("BeginUserEdit", token, |auth| async move {
            self.context
                .domain(domain_id)
                .await?
                .begin_user_edit(&auth, location)
                .await
        })
        .await
    }

    pub async fn end_user_edit(&self, token: Uuid, domain_id: Uuid) -> ResultBase<()> {
        self.call("EndUserEdit", token, |auth| async move {
            self.context.domain(domain_id).await?.end_user_edit(&auth).await
        })
        .await
    }

    pub async fn set_user_location(
        &self,
        token: Uuid,
        domain_id: Uuid,
        location: DomainLocationInfo,
    ) -> ResultBase<()> {
        self.call("SetUserLocation", token, |auth| async move {
            self.context
                .domain(domain_id)
                .await?
                .set_user_location(&auth, location)
                .await
        })
        .await
    }

    // ─── Content ──────────────────────────────────────────────────────

    pub async fn new_row(
        &self,
        token: Uuid,
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
    ) -> ResultBase<Vec<DomainRowInfo>> {
        self.call("NewRow", token, |auth| async move {
            self.context.domain(domain_id).await?.new_row(&auth, rows).await
        })
        .await
    }

    pub async fn set_row(
        &self,
        token: Uuid,
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
    ) -> ResultBase<Vec<DomainRowInfo>> {
        self.call("SetRow", token, |auth| async move {
            self.context.domain(domain_id).await?.set_row(&auth, rows).await
        })
        .await
    }

    pub async fn remove_row(
        &self,
        token: Uuid,
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
    ) -> ResultBase<Vec<DomainRowInfo>> {
        self.call("RemoveRow", token, |auth| async move {
            self.context.domain(domain_id).await?.remove_row(&auth, rows).await
        })
        .await
    }

    pub async fn set_property(
        &self,
        token: Uuid,
        domain_id: Uuid,
        name: String,
        value: Value,
    ) -> ResultBase<()> {
        self.call("SetProperty", token, |auth| async move {
            self.context
                .domain(domain_id)
                .await?
                .set_property(&auth, name, value)
                .await
        })
        .await
    }

    // ─── Moderation ───────────────────────────────────────────────────

    pub async fn kick(&self, token: Uuid, domain_id: Uuid, user_id: &str, comment: &str) -> ResultBase<()> {
        self.call("Kick", token, |auth| async move {
            self.context
                .domain(domain_id)
                .await?
                .kick(&auth, user_id, comment)
                .await
        })
        .await
    }

    pub async fn set_owner(&self, token: Uuid, domain_id: Uuid, user_id: &str) -> ResultBase<()> {
        self.call("SetOwner", token, |auth| async move {
            self.context.domain(domain_id).await?.set_owner(&auth, user_id).await
        })
        .await
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Resolve `token`, run `f` and wrap its outcome.
    ///
    /// The result is signed by the resolved user; an unknown token yields an
    /// unsigned `InvalidToken` fault.
    async fn call<R, F, Fut>(&self, method: &str, token: Uuid, f: F) -> ResultBase<R::Value>
    where
        R: Reply,
        F: FnOnce(Arc<Authentication>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let auth = match self.context.registry().authenticate(token).await {
            Ok(auth) => auth,
            Err(e) => return fault(method, SignatureDate::empty(), &e),
        };
        let signature_date = auth.signature_date();
        respond(method, signature_date, f(auth).await)
    }
}

impl Drop for DomainContextService {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            self.context.hub().unsubscribe(subscription.hub_id);
            subscription.forwarder.abort();
        }
    }
}

fn peer_filter(peer: Arc<Peer>) -> EventFilter {
    Arc::new(move |event: &DomainEvent| match &event.audience {
        Audience::Everyone => true,
        Audience::Participants(user_ids) => peer.contains_any(user_ids),
    })
}

/// Strip content the peer is not entitled to.
fn redact(kind: &DomainEventKind, peer: &Peer) -> DomainEventKind {
    let mut kind = kind.clone();
    if let DomainEventKind::UserAdded { user_info, data, .. } = &mut kind {
        if data.is_some() && !peer.contains(&user_info.user_id) {
            *data = None;
        }
    }
    kind
}

async fn forward_events(
    mut receiver: mpsc::UnboundedReceiver<Arc<DomainEvent>>,
    peer: Arc<Peer>,
    callbacks: Arc<CallbackSender>,
) {
    while let Some(event) = receiver.recv().await {
        let callback = Callback::Domain(redact(&event.kind, &peer));
        if !callbacks.send(event.signature_date.clone(), callback) {
            break;
        }
    }
}
