//! The live collection of domains of one server process.
//!
//! ```text
//!                  ┌──────────── DomainContext ────────────┐
//!  create/delete ─►│ Dispatcher<ContextData>               │
//!                  │   domains: id → Arc<Domain>           │──► EventHub
//!                  └───────────────────────────────────────┘      ▲
//!  registry expiry ──► watcher ──► Domain::detach(token)          │
//!  TaskTracker ──────► aggregator ──► TaskCompleted ──────────────┘
//! ```
//!
//! Structural changes (create, delete) run as jobs on the context dispatcher
//! and publish their lifecycle event from inside the same job, so a domain
//! becomes visible to snapshots and to subscribers at the same instant.

use crema_core::{
    Authority, DataBaseId, DomainContextMetaData, DomainInfo, DomainMetaData, DomainResultInfo,
    DomainState, SignatureDate, TaskId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{Authentication, AuthenticationRegistry, ExpiredNotice};
use crate::broadcast::{DomainEvent, DomainEventKind, EventFilter, EventHub, Subscription};
use crate::dispatcher::Dispatcher;
use crate::domain::host::item_directory;
use crate::domain::{Domain, DomainContent, DomainHeader, DomainHost, DomainRuntime, TaskTracker};
use crate::error::{CremaError, Result};
use crate::storage::DomainStore;

/// Context configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// How long the aggregator waits for more completions before it
    /// publishes one `TaskCompleted`.
    pub completion_window: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            completion_window: Duration::from_millis(10),
        }
    }
}

impl ContextConfig {
    pub fn for_testing() -> Self {
        Self {
            completion_window: Duration::ZERO,
        }
    }
}

/// Arguments of [`DomainContext::create_domain`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateDomain {
    pub data_base_id: DataBaseId,
    pub item_path: String,
    pub item_type: String,
    pub domain_type: String,
    #[serde(default)]
    pub content: DomainContent,
}

struct ContextData {
    runtime: DomainRuntime,
    domains: HashMap<Uuid, Arc<Domain>>,
}

impl ContextData {
    fn find(&self, domain_id: Uuid) -> Result<Arc<Domain>> {
        self.domains
            .get(&domain_id)
            .cloned()
            .ok_or(CremaError::DomainNotFound(domain_id))
    }

    /// Snapshot of every live domain, ordered by item path.
    fn snapshot(&self, data_base_id: Option<DataBaseId>) -> DomainContextMetaData {
        let mut domains: Vec<DomainMetaData> = self
            .domains
            .values()
            .filter(|d| data_base_id.map_or(true, |id| d.data_base_id() == id))
            .map(|d| d.metadata())
            .filter(|m| m.domain_state != DomainState::Deleted)
            .collect();
        domains.sort_by(|a, b| a.domain_info.item_path.cmp(&b.domain_info.item_path));
        DomainContextMetaData { domains }
    }

    fn remove(&mut self, domain_ids: &[Uuid], is_canceleds: Vec<bool>, signature_date: SignatureDate) {
        for domain_id in domain_ids {
            self.domains.remove(domain_id);
        }
        self.runtime.hub.publish(DomainEvent::everyone(
            signature_date,
            DomainEventKind::DomainsDeleted {
                domain_ids: domain_ids.to_vec(),
                is_canceleds,
            },
        ));
    }
}

pub struct DomainContext {
    dispatcher: Dispatcher<ContextData>,
    runtime: DomainRuntime,
    registry: Arc<AuthenticationRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DomainContext {
    /// Restore the stored domains and start the background tasks.
    ///
    /// Must be called inside a tokio runtime. A domain whose log cannot be
    /// replayed is skipped with an error in the log.
    pub fn open(
        config: ContextConfig,
        registry: Arc<AuthenticationRegistry>,
        store: Arc<DomainStore>,
        host: Option<Arc<dyn DomainHost>>,
    ) -> Result<Self> {
        let hub = Arc::new(EventHub::new());
        let (tasks, completed) = TaskTracker::new();
        let runtime = DomainRuntime {
            hub: hub.clone(),
            store: store.clone(),
            tasks,
            host,
        };

        let mut domains = HashMap::new();
        for domain_id in store.list_domains()? {
            match Domain::restore(&runtime, domain_id) {
                Ok(domain) => {
                    domains.insert(domain_id, domain);
                }
                Err(e) => log::error!("Failed to restore domain {}: {}", domain_id, e),
            }
        }
        log::info!("Domain context opened with {} domain(s)", domains.len());

        let dispatcher = Dispatcher::spawn(
            "domain-context",
            ContextData {
                runtime: runtime.clone(),
                domains,
            },
        );
        let aggregator = tokio::spawn(aggregate_completions(
            completed,
            hub,
            registry.system().user_id().to_string(),
            config.completion_window,
        ));
        let watcher = tokio::spawn(watch_expiry(
            registry.subscribe_expired(),
            registry.clone(),
            dispatcher.clone(),
        ));

        Ok(Self {
            dispatcher,
            runtime,
            registry,
            tasks: Mutex::new(vec![aggregator, watcher]),
        })
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.runtime.hub
    }

    pub fn registry(&self) -> &Arc<AuthenticationRegistry> {
        &self.registry
    }

    /// Server-wide monotonic task id.
    pub fn next_task_id(&self) -> TaskId {
        self.runtime.tasks.next()
    }

    pub async fn domain(&self, domain_id: Uuid) -> Result<Arc<Domain>> {
        self.dispatcher.invoke(move |data| data.find(domain_id)).await?
    }

    pub async fn domains(&self) -> Result<Vec<Arc<Domain>>> {
        self.dispatcher
            .invoke(|data| data.domains.values().cloned().collect())
            .await
    }

    pub async fn get_metadata(&self) -> Result<DomainContextMetaData> {
        self.dispatcher.invoke(|data| data.snapshot(None)).await
    }

    pub async fn get_metadata_for(&self, data_base_id: DataBaseId) -> Result<DomainContextMetaData> {
        self.dispatcher
            .invoke(move |data| data.snapshot(Some(data_base_id)))
            .await
    }

    /// Take a metadata snapshot and register `filter` on the hub as one step.
    ///
    /// Every domain's metadata lock is held while the subscription is
    /// registered, so each event is either reflected in the snapshot or
    /// delivered to the subscription, never both and never neither.
    pub async fn subscribe(&self, filter: EventFilter) -> Result<(DomainContextMetaData, Subscription)> {
        self.dispatcher
            .invoke(move |data| {
                let mut domains: Vec<&Arc<Domain>> = data.domains.values().collect();
                domains.sort_by(|a, b| a.item_path().cmp(b.item_path()));
                let guards: Vec<_> = domains.iter().map(|d| d.metadata_guard()).collect();
                let subscription = data.runtime.hub.subscribe(filter);
                let metadata = DomainContextMetaData {
                    domains: guards
                        .iter()
                        .map(|guard| DomainMetaData::clone(guard))
                        .filter(|m| m.domain_state != DomainState::Deleted)
                        .collect(),
                };
                (metadata, subscription)
            })
            .await
    }

    /// Create a domain for an item. One domain may exist per item.
    pub async fn create_domain(
        &self,
        auth: &Arc<Authentication>,
        request: CreateDomain,
    ) -> Result<DomainResultInfo<DomainMetaData>> {
        auth.ensure_alive()?;
        if auth.authority() == Authority::Guest {
            return Err(CremaError::PermissionDenied(format!(
                "guest '{}' cannot create domains",
                auth.user_id()
            )));
        }
        item_directory(&request.item_path)?;
        request.content.validate()?;
        let signature_date = auth.signature_date();
        self.dispatcher
            .invoke(move |data| {
                // A deleted domain may linger until its removal job runs.
                if let Some(existing) = data.domains.values().find(|d| {
                    d.data_base_id() == request.data_base_id
                        && d.item_path() == request.item_path
                        && d.metadata_guard().domain_state != DomainState::Deleted
                }) {
                    return Err(CremaError::InvalidOperation(format!(
                        "'{}' is already being edited in domain {}",
                        request.item_path,
                        existing.id()
                    )));
                }
                let header = DomainHeader {
                    info: DomainInfo {
                        domain_id: Uuid::new_v4(),
                        data_base_id: request.data_base_id,
                        item_path: request.item_path,
                        item_type: request.item_type,
                        domain_type: request.domain_type,
                        creation_info: signature_date.clone(),
                        modification_info: signature_date.clone(),
                    },
                    content: request.content,
                };
                let domain = Domain::create(&data.runtime, header)?;
                let metadata = domain.metadata();
                data.domains.insert(domain.id(), domain);

                let task_id = data.runtime.tasks.next();
                data.runtime.hub.publish(DomainEvent::everyone(
                    signature_date,
                    DomainEventKind::DomainsCreated {
                        metadatas: vec![metadata.clone()],
                    },
                ));
                data.runtime.tasks.complete(task_id);
                Ok(DomainResultInfo {
                    task_id,
                    value: metadata,
                })
            })
            .await?
    }

    /// Delete one domain and remove it from the context.
    pub async fn delete_domain(
        &self,
        auth: &Arc<Authentication>,
        domain_id: Uuid,
        force: bool,
    ) -> Result<DomainResultInfo<()>> {
        let domain = self.domain(domain_id).await?;
        let result = domain.delete(auth, force).await?;
        let signature_date = auth.signature_date();
        self.dispatcher
            .invoke(move |data| data.remove(&[domain_id], vec![force], signature_date))
            .await?;
        Ok(result)
    }

    /// Force-delete every domain of a database, e.g. when it goes offline.
    /// Administrators only. Returns the ids of the deleted domains.
    pub async fn delete_domains(
        &self,
        auth: &Arc<Authentication>,
        data_base_id: DataBaseId,
    ) -> Result<DomainResultInfo<Vec<Uuid>>> {
        auth.ensure_alive()?;
        if !auth.is_admin() {
            return Err(CremaError::PermissionDenied(format!(
                "'{}' cannot delete the domains of a database",
                auth.user_id()
            )));
        }
        let domains: Vec<Arc<Domain>> = self
            .domains()
            .await?
            .into_iter()
            .filter(|d| d.data_base_id() == data_base_id)
            .collect();

        let mut deleted = Vec::with_capacity(domains.len());
        for domain in &domains {
            match domain.delete(auth, true).await {
                Ok(_) | Err(CremaError::DomainNotFound(_)) => deleted.push(domain.id()),
                Err(e) => return Err(e),
            }
        }

        let task_id = self.runtime.tasks.next();
        if !deleted.is_empty() {
            let ids = deleted.clone();
            let signature_date = auth.signature_date();
            self.dispatcher
                .invoke(move |data| {
                    let is_canceleds = vec![true; ids.len()];
                    data.remove(&ids, is_canceleds, signature_date)
                })
                .await?;
        }
        self.runtime.tasks.complete(task_id);
        log::info!("{} domain(s) of database {} deleted", deleted.len(), data_base_id);
        Ok(DomainResultInfo {
            task_id,
            value: deleted,
        })
    }

    /// Stop the background tasks. Domains stay reachable until dropped.
    pub fn dispose(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for DomainContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Coalesce completed task ids into `TaskCompleted` events.
async fn aggregate_completions(
    mut completed: mpsc::UnboundedReceiver<TaskId>,
    hub: Arc<EventHub>,
    system_id: String,
    window: Duration,
) {
    while let Some(first) = completed.recv().await {
        if !window.is_zero() {
            tokio::time::sleep(window).await;
        }
        let mut task_ids = vec![first];
        while let Ok(task_id) = completed.try_recv() {
            task_ids.push(task_id);
        }
        hub.publish(DomainEvent::everyone(
            SignatureDate::new(system_id.clone()),
            DomainEventKind::TaskCompleted { task_ids },
        ));
    }
}

/// Detach expired authentications from every domain.
async fn watch_expiry(
    mut notices: broadcast::Receiver<ExpiredNotice>,
    registry: Arc<AuthenticationRegistry>,
    dispatcher: Dispatcher<ContextData>,
) {
    loop {
        match notices.recv().await {
            Ok(notice) => {
                let token = notice.token;
                let result = dispatcher
                    .invoke(move |data| {
                        for domain in data.domains.values() {
                            if let Err(e) = domain.detach(token) {
                                log::warn!("Detach from domain {} failed: {}", domain.id(), e);
                            }
                        }
                    })
                    .await;
                if result.is_err() {
                    break;
                }
                log::debug!("Authentication of '{}' detached ({})", notice.user_id, notice.reason);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Expiry watcher missed {} notice(s), sweeping domains", missed);
                match detach_stale(&registry, &dispatcher).await {
                    Ok(count) => log::info!("Detached {} stale participant(s)", count),
                    Err(_) => break,
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Detach every online participant whose session no longer exists.
/// Tokens are never reused, so a missing token stays missing.
async fn detach_stale(
    registry: &AuthenticationRegistry,
    dispatcher: &Dispatcher<ContextData>,
) -> Result<usize> {
    let domains: Vec<Arc<Domain>> = dispatcher
        .invoke(|data| data.domains.values().cloned().collect())
        .await?;
    let mut detached = 0;
    for domain in domains {
        let Ok(tokens) = domain.online_tokens().await else {
            continue;
        };
        for token in tokens {
            if registry.contains_session(token).await {
                continue;
            }
            match domain.detach(token) {
                Ok(()) => detached += 1,
                Err(e) => log::warn!("Detach from domain {} failed: {}", domain.id(), e),
            }
        }
    }
    Ok(detached)
}
