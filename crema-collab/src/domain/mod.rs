//! Domains: collaboratively edited items.
//!
//! ```text
//!            ┌──────────────── Domain ─────────────────┐
//!  call ───► │ Dispatcher<DomainData> (FIFO, one task) │
//!            │   check ─► log (post+complete) ─► apply │──► EventHub
//!            │   metadata cache ◄── updated per job    │──► TaskTracker
//!            └─────────────────────────────────────────┘
//! ```
//!
//! Every read and write of a domain's state runs as one job on the domain's
//! dispatcher, so mutations of one domain are applied strictly in admission
//! order and never interleave. Accepted mutations are written to the domain
//! log before they are applied; restoring a domain replays that log onto the
//! content it was created with.

pub mod content;
pub mod host;
pub mod logger;
pub mod user;

pub use content::{DomainContent, DomainRow, DomainTable};
pub use host::{open_repository_host, DomainHost, RepositoryDomainHost};
pub use logger::{DomainAction, DomainHeader, DomainLogger, LoggedAction};
pub use user::DomainUser;

use crema_core::{
    Authority, DomainAccessType, DomainInfo, DomainLocationInfo, DomainMetaData,
    DomainResultInfo, DomainRowInfo, DomainState, RemoveInfo, SignatureDate, TaskId,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Authentication;
use crate::broadcast::{Audience, DomainEvent, DomainEventKind, EventHub};
use crate::dispatcher::Dispatcher;
use crate::error::{CremaError, Result};
use crate::storage::DomainStore;

// ─── Shared runtime ───────────────────────────────────────────────────

/// Hands out task ids and reports their completion.
#[derive(Debug, Clone)]
pub struct TaskTracker {
    next: Arc<AtomicU64>,
    completed: mpsc::UnboundedSender<TaskId>,
}

impl TaskTracker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskId>) {
        let (completed, receiver) = mpsc::unbounded_channel();
        let tracker = Self {
            next: Arc::new(AtomicU64::new(0)),
            completed,
        };
        (tracker, receiver)
    }

    /// Server-wide monotonic id.
    pub fn next(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn complete(&self, task_id: TaskId) {
        if self.completed.send(task_id).is_err() {
            log::debug!("Completion of {} dropped, no aggregator", task_id);
        }
    }
}

/// Services shared by every domain of a context.
#[derive(Clone)]
pub struct DomainRuntime {
    pub hub: Arc<EventHub>,
    pub store: Arc<DomainStore>,
    pub tasks: TaskTracker,
    /// Where content goes on a non-forced delete. `None` discards it.
    pub host: Option<Arc<dyn DomainHost>>,
}

// ─── Dispatcher-owned state ───────────────────────────────────────────

/// Effects of one applied action.
struct Applied {
    events: Vec<(Audience, DomainEventKind)>,
    rows: Vec<DomainRowInfo>,
}

impl Applied {
    fn event(audience: Audience, kind: DomainEventKind) -> Self {
        Self {
            events: vec![(audience, kind)],
            rows: Vec::new(),
        }
    }
}

struct DomainData {
    info: DomainInfo,
    content: DomainContent,
    users: Vec<DomainUser>,
    owner_id: Option<String>,
    is_modified: bool,
    has_entered: bool,
    deleting: bool,
    deleted: bool,
    replaying: bool,
    logger: DomainLogger,
    hub: Arc<EventHub>,
    tasks: TaskTracker,
    cache: Arc<RwLock<DomainMetaData>>,
}

impl DomainData {
    fn domain_id(&self) -> Uuid {
        self.info.domain_id
    }

    fn state(&self) -> DomainState {
        if self.deleted {
            DomainState::Deleted
        } else if self.users.iter().any(DomainUser::is_online) {
            DomainState::Active
        } else if self.has_entered {
            DomainState::Inactive
        } else {
            DomainState::Created
        }
    }

    fn metadata(&self) -> DomainMetaData {
        DomainMetaData {
            domain_id: self.domain_id(),
            domain_info: self.info.clone(),
            domain_state: self.state(),
            is_modified: self.is_modified,
            owner_id: self.owner_id.clone(),
            users: self.users.iter().map(DomainUser::metadata).collect(),
        }
    }

    fn participants(&self) -> Audience {
        Audience::Participants(self.users.iter().map(|u| u.user_id().to_string()).collect())
    }

    fn user(&self, user_id: &str) -> Result<&DomainUser> {
        self.users
            .iter()
            .find(|u| u.user_id() == user_id)
            .ok_or_else(|| self.not_participant(user_id))
    }

    fn user_mut(&mut self, user_id: &str) -> Result<&mut DomainUser> {
        let domain_id = self.domain_id();
        self.users
            .iter_mut()
            .find(|u| u.user_id() == user_id)
            .ok_or_else(|| CremaError::UserNotFound(format!("'{user_id}' is not in domain {domain_id}")))
    }

    fn not_participant(&self, user_id: &str) -> CremaError {
        CremaError::UserNotFound(format!("'{}' is not in domain {}", user_id, self.domain_id()))
    }

    // ─── Caller checks ────────────────────────────────────────────────

    fn ensure_available(&self) -> Result<()> {
        if self.deleted {
            return Err(CremaError::DomainNotFound(self.domain_id()));
        }
        if self.deleting {
            return Err(CremaError::InvalidOperation(format!(
                "domain {} is being deleted",
                self.domain_id()
            )));
        }
        Ok(())
    }

    /// The caller must be alive and an online participant.
    fn online_caller(&self, auth: &Authentication) -> Result<&DomainUser> {
        self.ensure_available()?;
        auth.ensure_alive()?;
        match self.user(auth.user_id()) {
            Ok(user) if user.is_online() => Ok(user),
            _ => Err(self.not_participant(auth.user_id())),
        }
    }

    fn writing_caller(&self, auth: &Authentication) -> Result<&DomainUser> {
        let user = self.online_caller(auth)?;
        if !user.can_write() {
            return Err(CremaError::PermissionDenied(format!(
                "'{}' has read-only access to domain {}",
                auth.user_id(),
                self.domain_id()
            )));
        }
        Ok(user)
    }

    /// The caller must own the domain or be an administrator.
    fn owner_or_admin(&self, auth: &Authentication, action: &str) -> Result<()> {
        self.ensure_available()?;
        auth.ensure_alive()?;
        if auth.is_admin() || self.owner_id.as_deref() == Some(auth.user_id()) {
            return Ok(());
        }
        Err(CremaError::PermissionDenied(format!(
            "'{}' is not allowed to {action} in domain {}",
            auth.user_id(),
            self.domain_id()
        )))
    }

    // ─── Actions ──────────────────────────────────────────────────────

    /// Preconditions of an action, without side effects.
    fn check(&self, action: &DomainAction) -> Result<()> {
        match action {
            DomainAction::Enter { user_id, .. } => match self.user(user_id) {
                Ok(user) if user.is_online() => Err(CremaError::InvalidOperation(format!(
                    "'{user_id}' is already in domain {}",
                    self.domain_id()
                ))),
                _ => Ok(()),
            },
            DomainAction::Leave { user_id }
            | DomainAction::Kick { user_id, .. }
            | DomainAction::Detach { user_id } => self.user(user_id).map(|_| ()),
            DomainAction::SetOwner { user_id } => {
                if !self.user(user_id)?.is_online() {
                    return Err(CremaError::InvalidOperation(format!("'{user_id}' is offline")));
                }
                Ok(())
            }
            DomainAction::SetLocation { location } => self.user(&location.user_id).map(|_| ()),
            DomainAction::BeginEdit { location } => {
                if self.user(&location.user_id)?.state.is_being_edited {
                    return Err(CremaError::InvalidOperation(format!(
                        "'{}' is already editing",
                        location.user_id
                    )));
                }
                Ok(())
            }
            DomainAction::EndEdit { user_id } => {
                if !self.user(user_id)?.state.is_being_edited {
                    return Err(CremaError::InvalidOperation(format!("'{user_id}' is not editing")));
                }
                Ok(())
            }
            DomainAction::NewRow { rows } => self.content.check_new_rows(rows),
            DomainAction::SetRow { rows } => self.content.check_set_rows(rows),
            DomainAction::RemoveRow { rows } => self.content.check_remove_rows(rows),
            DomainAction::SetProperty { name, .. } => self.content.check_property(name),
        }
    }

    /// Apply an action that passed [`check`](Self::check).
    fn apply(&mut self, entry: &LoggedAction, task_id: TaskId) -> Result<Applied> {
        self.check(&entry.action)?;
        let domain_id = self.domain_id();
        let state_before = self.state();
        let owner_before = self.owner_id.clone();
        let modified_before = self.is_modified;

        let mut applied = match &entry.action {
            DomainAction::Enter {
                user_id,
                user_name,
                access_type,
            } => {
                match self.users.iter_mut().find(|u| u.user_id() == user_id) {
                    Some(user) => {
                        user.state.is_online = true;
                        user.info.access_type = *access_type;
                    }
                    None => self.users.push(DomainUser::new(user_id, user_name, *access_type)),
                }
                self.has_entered = true;
                if self.owner_id.is_none() {
                    self.assign_owner(Some(user_id.clone()));
                }
                let user = self.user(user_id)?;
                let data = (!self.replaying).then(|| self.content.to_value());
                Applied::event(
                    Audience::Everyone,
                    DomainEventKind::UserAdded {
                        domain_id,
                        user_info: user.info.clone(),
                        user_state: user.state,
                        data,
                        task_id,
                    },
                )
            }
            DomainAction::Leave { user_id } => self.remove_user(user_id, RemoveInfo::exit(), task_id),
            DomainAction::Kick { user_id, comment } => {
                self.remove_user(user_id, RemoveInfo::kick(comment.clone()), task_id)
            }
            DomainAction::Detach { user_id } => {
                self.user_mut(user_id)?.detach();
                if self.owner_id.as_deref() == Some(user_id.as_str()) {
                    self.reassign_owner();
                }
                let user_state = self.user(user_id)?.state;
                Applied::event(
                    Audience::Everyone,
                    DomainEventKind::UserStateChanged {
                        domain_id,
                        user_id: user_id.clone(),
                        user_state,
                    },
                )
            }
            DomainAction::SetOwner { user_id } => {
                self.assign_owner(Some(user_id.clone()));
                Applied {
                    events: Vec::new(),
                    rows: Vec::new(),
                }
            }
            DomainAction::SetLocation { location } => {
                self.user_mut(&location.user_id)?.location = location.clone();
                Applied::event(
                    self.participants(),
                    DomainEventKind::UserLocationChanged {
                        domain_id,
                        location: location.clone(),
                    },
                )
            }
            DomainAction::BeginEdit { location } => {
                let user = self.user_mut(&location.user_id)?;
                user.location = location.clone();
                user.state.is_being_edited = true;
                Applied::event(
                    self.participants(),
                    DomainEventKind::UserEditBegun {
                        domain_id,
                        location: location.clone(),
                        task_id,
                    },
                )
            }
            DomainAction::EndEdit { user_id } => {
                self.user_mut(user_id)?.state.is_being_edited = false;
                Applied::event(
                    self.participants(),
                    DomainEventKind::UserEditEnded {
                        domain_id,
                        user_id: user_id.clone(),
                        task_id,
                    },
                )
            }
            DomainAction::NewRow { rows } => {
                let rows = self.content.new_rows(rows)?;
                self.rows_event(rows, |rows| DomainEventKind::RowAdded { domain_id, rows, task_id })
            }
            DomainAction::SetRow { rows } => {
                let rows = self.content.set_rows(rows)?;
                self.rows_event(rows, |rows| DomainEventKind::RowChanged { domain_id, rows, task_id })
            }
            DomainAction::RemoveRow { rows } => {
                let rows = self.content.remove_rows(rows)?;
                self.rows_event(rows, |rows| DomainEventKind::RowRemoved { domain_id, rows, task_id })
            }
            DomainAction::SetProperty { name, value } => {
                self.content.set_property(name, value.clone())?;
                Applied::event(
                    self.participants(),
                    DomainEventKind::PropertyChanged {
                        domain_id,
                        name: name.clone(),
                        value: value.clone(),
                        task_id,
                    },
                )
            }
        };

        if entry.action.modifies_content() {
            self.is_modified = true;
            self.info.modification_info = entry.signature_date.clone();
        }

        if self.owner_id != owner_before {
            if let Some(owner_id) = &self.owner_id {
                applied.events.push((
                    Audience::Everyone,
                    DomainEventKind::OwnerChanged {
                        domain_id,
                        owner_id: owner_id.clone(),
                        task_id,
                    },
                ));
            }
        }
        if self.is_modified && !modified_before {
            applied.events.push((
                Audience::Everyone,
                DomainEventKind::DomainInfoChanged {
                    domain_id,
                    domain_info: self.info.clone(),
                },
            ));
        }
        let state = self.state();
        if state != state_before {
            applied.events.push((
                Audience::Everyone,
                DomainEventKind::DomainStateChanged {
                    domain_id,
                    domain_state: state,
                },
            ));
        }
        Ok(applied)
    }

    fn rows_event(
        &self,
        rows: Vec<DomainRowInfo>,
        kind: impl FnOnce(Vec<DomainRowInfo>) -> DomainEventKind,
    ) -> Applied {
        Applied {
            events: vec![(self.participants(), kind(rows.clone()))],
            rows,
        }
    }

    fn remove_user(&mut self, user_id: &str, remove_info: RemoveInfo, task_id: TaskId) -> Applied {
        self.users.retain(|u| u.user_id() != user_id);
        if self.owner_id.as_deref() == Some(user_id) {
            self.reassign_owner();
        }
        Applied::event(
            Audience::Everyone,
            DomainEventKind::UserRemoved {
                domain_id: self.domain_id(),
                user_id: user_id.to_string(),
                owner_id: self.owner_id.clone(),
                remove_info,
                task_id,
            },
        )
    }

    fn assign_owner(&mut self, owner_id: Option<String>) {
        for user in &mut self.users {
            user.state.is_owner = owner_id.as_deref() == Some(user.user_id());
        }
        self.owner_id = owner_id;
    }

    /// Ownership passes to the earliest participant still online.
    fn reassign_owner(&mut self) {
        let next = self
            .users
            .iter()
            .find(|u| u.is_online() && self.owner_id.as_deref() != Some(u.user_id()))
            .map(|u| u.user_id().to_string());
        self.assign_owner(next);
    }

    /// Check, log, apply and publish one action.
    fn execute(&mut self, signature_date: SignatureDate, action: DomainAction) -> Result<(TaskId, Applied)> {
        self.check(&action)?;
        let entry = LoggedAction {
            signature_date,
            action,
        };
        self.logger.record(&entry)?;
        let task_id = self.tasks.next();
        let applied = self.apply(&entry, task_id)?;
        self.publish(&entry.signature_date, &applied.events);
        self.tasks.complete(task_id);
        Ok((task_id, applied))
    }

    /// Refresh the metadata cache and publish, holding the cache lock so a
    /// snapshot taken under the same lock never misses or repeats an event.
    fn publish(&self, signature_date: &SignatureDate, events: &[(Audience, DomainEventKind)]) {
        let metadata = self.metadata();
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        *cache = metadata;
        for (audience, kind) in events {
            self.hub.publish(DomainEvent::new(signature_date.clone(), audience.clone(), kind.clone()));
        }
    }

    // ─── Deletion ─────────────────────────────────────────────────────

    fn begin_delete(&mut self, auth: &Authentication, force: bool) -> Result<(DomainInfo, DomainContent)> {
        self.ensure_available()?;
        auth.ensure_alive()?;
        let is_creator = self.owner_id.is_none() && self.info.creation_info.id == auth.user_id();
        if !is_creator {
            self.owner_or_admin(auth, "delete")?;
        }
        if !force {
            if let Some(other) = self
                .users
                .iter()
                .find(|u| u.is_online() && u.user_id() != auth.user_id())
            {
                return Err(CremaError::InvalidOperation(format!(
                    "domain {} is in use by '{}'",
                    self.domain_id(),
                    other.user_id()
                )));
            }
            if let Some(editor) = self.users.iter().find(|u| u.state.is_being_edited) {
                return Err(CremaError::InvalidOperation(format!(
                    "'{}' is editing domain {}",
                    editor.user_id(),
                    self.domain_id()
                )));
            }
        }
        self.deleting = true;
        Ok((self.info.clone(), self.content.clone()))
    }

    fn finish_delete(&mut self, signature_date: &SignatureDate) -> Result<TaskId> {
        self.logger.delete()?;
        self.deleting = false;
        self.deleted = true;
        let task_id = self.tasks.next();
        self.publish(
            signature_date,
            &[(
                Audience::Everyone,
                DomainEventKind::DomainStateChanged {
                    domain_id: self.domain_id(),
                    domain_state: DomainState::Deleted,
                },
            )],
        );
        self.tasks.complete(task_id);
        Ok(task_id)
    }
}

// ─── Domain ───────────────────────────────────────────────────────────

pub struct Domain {
    info: DomainInfo,
    dispatcher: Dispatcher<DomainData>,
    cache: Arc<RwLock<DomainMetaData>>,
    host: Option<Arc<dyn DomainHost>>,
}

impl Domain {
    /// Persist the header of a new domain and start its dispatcher.
    pub fn create(runtime: &DomainRuntime, header: DomainHeader) -> Result<Arc<Self>> {
        let logger = DomainLogger::create(runtime.store.clone(), &header)?;
        let data = Self::new_data(runtime, header, logger);
        log::info!("Domain {} created for {}", data.info.domain_id, data.info.item_path);
        Ok(Self::spawn(runtime, data))
    }

    /// Rebuild a stored domain by replaying its log.
    ///
    /// Participants come back offline and the domain has no owner until
    /// someone enters.
    pub fn restore(runtime: &DomainRuntime, domain_id: Uuid) -> Result<Arc<Self>> {
        let (logger, header, actions) = DomainLogger::restore(runtime.store.clone(), domain_id)?;
        let mut data = Self::new_data(runtime, header, logger);
        data.replaying = true;
        for entry in &actions {
            if let Err(e) = data.apply(entry, TaskId(0)) {
                log::warn!("Skipping action of domain {} on restore: {}", domain_id, e);
            }
        }
        data.replaying = false;
        for user in &mut data.users {
            user.detach();
        }
        data.assign_owner(None);
        if let Ok(mut cache) = data.cache.write() {
            *cache = data.metadata();
        }
        log::info!("Domain {} restored ({} action(s))", domain_id, actions.len());
        Ok(Self::spawn(runtime, data))
    }

    fn new_data(runtime: &DomainRuntime, header: DomainHeader, logger: DomainLogger) -> DomainData {
        let metadata = DomainMetaData {
            domain_id: header.info.domain_id,
            domain_info: header.info.clone(),
            domain_state: DomainState::Created,
            is_modified: false,
            owner_id: None,
            users: Vec::new(),
        };
        DomainData {
            info: header.info,
            content: header.content,
            users: Vec::new(),
            owner_id: None,
            is_modified: false,
            has_entered: false,
            deleting: false,
            deleted: false,
            replaying: false,
            logger,
            hub: runtime.hub.clone(),
            tasks: runtime.tasks.clone(),
            cache: Arc::new(RwLock::new(metadata)),
        }
    }

    fn spawn(runtime: &DomainRuntime, data: DomainData) -> Arc<Self> {
        let info = data.info.clone();
        let cache = data.cache.clone();
        let dispatcher = Dispatcher::spawn(format!("domain-{}", info.domain_id), data);
        Arc::new(Self {
            info,
            dispatcher,
            cache,
            host: runtime.host.clone(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.info.domain_id
    }

    pub fn data_base_id(&self) -> Uuid {
        self.info.data_base_id
    }

    pub fn item_path(&self) -> &str {
        &self.info.item_path
    }

    /// Last published snapshot.
    pub fn metadata(&self) -> DomainMetaData {
        self.metadata_guard().clone()
    }

    /// Read access to the metadata cache. While held, the domain cannot
    /// publish.
    pub(crate) fn metadata_guard(&self) -> std::sync::RwLockReadGuard<'_, DomainMetaData> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn content(&self) -> Result<DomainContent> {
        self.dispatcher.invoke(|data| data.content.clone()).await
    }

    // ─── Participants ─────────────────────────────────────────────────

    /// Join the domain. Returns a snapshot of the content.
    pub async fn enter(
        &self,
        auth: &Arc<Authentication>,
        access_type: DomainAccessType,
    ) -> Result<DomainResultInfo<Value>> {
        let auth = auth.clone();
        self.dispatcher
            .invoke(move |data| {
                data.ensure_available()?;
                auth.ensure_alive()?;
                if auth.authority() == Authority::Guest && access_type.can_write() {
                    return Err(CremaError::PermissionDenied(format!(
                        "guest '{}' cannot edit",
                        auth.user_id()
                    )));
                }
                let (task_id, _) = data.execute(
                    auth.signature_date(),
                    DomainAction::Enter {
                        user_id: auth.user_id().to_string(),
                        user_name: auth.name().to_string(),
                        access_type,
                    },
                )?;
                data.user_mut(auth.user_id())?.token = Some(auth.token());
                Ok(DomainResultInfo {
                    task_id,
                    value: data.content.to_value(),
                })
            })
            .await?
    }

    pub async fn leave(&self, auth: &Arc<Authentication>) -> Result<DomainResultInfo<()>> {
        let auth = auth.clone();
        self.run(move |data| {
            data.online_caller(&auth)?;
            let action = DomainAction::Leave {
                user_id: auth.user_id().to_string(),
            };
            data.execute(auth.signature_date(), action)
        })
        .await
        .map(|(task_id, _)| DomainResultInfo { task_id, value: () })
    }

    pub async fn begin_user_edit(
        &self,
        auth: &Arc<Authentication>,
        location: DomainLocationInfo,
    ) -> Result<DomainResultInfo<()>> {
        let auth = auth.clone();
        self.run(move |data| {
            data.writing_caller(&auth)?;
            let location = DomainLocationInfo {
                user_id: auth.user_id().to_string(),
                ..location
            };
            data.execute(auth.signature_date(), DomainAction::BeginEdit { location })
        })
        .await
        .map(|(task_id, _)| DomainResultInfo { task_id, value: () })
    }

    pub async fn end_user_edit(&self, auth: &Arc<Authentication>) -> Result<DomainResultInfo<()>> {
        let auth = auth.clone();
        self.run(move |data| {
            data.writing_caller(&auth)?;
            let action = DomainAction::EndEdit {
                user_id: auth.user_id().to_string(),
            };
            data.execute(auth.signature_date(), action)
        })
        .await
        .map(|(task_id, _)| DomainResultInfo { task_id, value: () })
    }

    pub async fn set_user_location(
        &self,
        auth: &Arc<Authentication>,
        location: DomainLocationInfo,
    ) -> Result<DomainResultInfo<()>> {
        let auth = auth.clone();
        self.run(move |data| {
            data.online_caller(&auth)?;
            let location = DomainLocationInfo {
                user_id: auth.user_id().to_string(),
                ..location
            };
            data.execute(auth.signature_date(), DomainAction::SetLocation { location })
        })
        .await
        .map(|(task_id, _)| DomainResultInfo { task_id, value: () })
    }

    // ─── Content ──────────────────────────────────────────────────────

    pub async fn new_row(
        &self,
        auth: &Arc<Authentication>,
        rows: Vec<DomainRowInfo>,
    ) -> Result<DomainResultInfo<Vec<DomainRowInfo>>> {
        self.row_operation(auth, rows, |rows| DomainAction::NewRow { rows }).await
    }

    pub async fn set_row(
        &self,
        auth: &Arc<Authentication>,
        rows: Vec<DomainRowInfo>,
    ) -> Result<DomainResultInfo<Vec<DomainRowInfo>>> {
        self.row_operation(auth, rows, |rows| DomainAction::SetRow { rows }).await
    }

    pub async fn remove_row(
        &self,
        auth: &Arc<Authentication>,
        rows: Vec<DomainRowInfo>,
    ) -> Result<DomainResultInfo<Vec<DomainRowInfo>>> {
        self.row_operation(auth, rows, |rows| DomainAction::RemoveRow { rows }).await
    }

    async fn row_operation(
        &self,
        auth: &Arc<Authentication>,
        rows: Vec<DomainRowInfo>,
        action: fn(Vec<DomainRowInfo>) -> DomainAction,
    ) -> Result<DomainResultInfo<Vec<DomainRowInfo>>> {
        if rows.is_empty() {
            return Err(CremaError::InvalidArgument("no rows given".into()));
        }
        let auth = auth.clone();
        let (task_id, applied) = self
            .run(move |data| {
                data.writing_caller(&auth)?;
                data.execute(auth.signature_date(), action(rows))
            })
            .await?;
        Ok(DomainResultInfo {
            task_id,
            value: applied.rows,
        })
    }

    pub async fn set_property(
        &self,
        auth: &Arc<Authentication>,
        name: String,
        value: Value,
    ) -> Result<DomainResultInfo<()>> {
        let auth = auth.clone();
        self.run(move |data| {
            data.writing_caller(&auth)?;
            data.execute(auth.signature_date(), DomainAction::SetProperty { name, value })
        })
        .await
        .map(|(task_id, _)| DomainResultInfo { task_id, value: () })
    }

    // ─── Administration ───────────────────────────────────────────────

    /// Remove another participant. Owner or administrator only.
    pub async fn kick(
        &self,
        auth: &Arc<Authentication>,
        user_id: &str,
        comment: &str,
    ) -> Result<DomainResultInfo<()>> {
        let auth = auth.clone();
        let user_id = user_id.to_string();
        let comment = comment.to_string();
        self.run(move |data| {
            data.owner_or_admin(&auth, "kick")?;
            data.user(&user_id)?;
            if user_id == auth.user_id() {
                return Err(CremaError::InvalidOperation("cannot kick yourself".into()));
            }
            if data.owner_id.as_deref() == Some(user_id.as_str()) {
                return Err(CremaError::InvalidOperation(format!(
                    "'{user_id}' owns domain {} and cannot be kicked",
                    data.domain_id()
                )));
            }
            log::info!("'{}' kicked from domain {} by '{}'", user_id, data.domain_id(), auth.user_id());
            data.execute(auth.signature_date(), DomainAction::Kick { user_id, comment })
        })
        .await
        .map(|(task_id, _)| DomainResultInfo { task_id, value: () })
    }

    /// Hand ownership to another online participant.
    pub async fn set_owner(&self, auth: &Arc<Authentication>, user_id: &str) -> Result<DomainResultInfo<()>> {
        let auth = auth.clone();
        let user_id = user_id.to_string();
        self.run(move |data| {
            data.owner_or_admin(&auth, "change the owner")?;
            if data.owner_id.as_deref() == Some(user_id.as_str()) {
                return Err(CremaError::InvalidOperation(format!("'{user_id}' already owns the domain")));
            }
            data.execute(auth.signature_date(), DomainAction::SetOwner { user_id })
        })
        .await
        .map(|(task_id, _)| DomainResultInfo { task_id, value: () })
    }

    /// Tokens of the participants currently online.
    pub async fn online_tokens(&self) -> Result<Vec<Uuid>> {
        self.dispatcher
            .invoke(|data| data.users.iter().filter_map(|u| u.token).collect())
            .await
    }

    /// Mark the participant attached through `token` offline.
    ///
    /// Used when an authentication expires; unknown tokens are ignored.
    pub fn detach(&self, token: Uuid) -> Result<()> {
        self.dispatcher.post(move |data| {
            if data.deleted {
                return;
            }
            let Some(user_id) = data
                .users
                .iter()
                .find(|u| u.token == Some(token))
                .map(|u| u.user_id().to_string())
            else {
                return;
            };
            let signature_date = SignatureDate::new(user_id.clone());
            if let Err(e) = data.execute(signature_date, DomainAction::Detach { user_id }) {
                log::error!("Failed to detach {} from domain {}: {}", token, data.domain_id(), e);
            }
        })
    }

    /// Delete the domain.
    ///
    /// Without `force` the domain must not be in use by anyone else and its
    /// content is committed through the host first. With `force` the content
    /// is discarded. Afterwards every call fails with `DomainNotFound`.
    pub async fn delete(&self, auth: &Arc<Authentication>, force: bool) -> Result<DomainResultInfo<()>> {
        let caller = auth.clone();
        let (info, content) = self
            .dispatcher
            .invoke(move |data| data.begin_delete(&caller, force))
            .await??;

        if !force {
            if let Some(host) = self.host.clone() {
                let author = auth.user_id().to_string();
                let committed = tokio::task::spawn_blocking(move || host.commit(&info, &content, &author))
                    .await
                    .map_err(|e| CremaError::InvalidOperation(format!("commit task failed: {e}")))
                    .and_then(|result| result);
                if let Err(e) = committed {
                    self.dispatcher.invoke(|data| data.deleting = false).await?;
                    return Err(e);
                }
            }
        }

        let signature_date = auth.signature_date();
        let task_id = self
            .dispatcher
            .invoke(move |data| data.finish_delete(&signature_date))
            .await??;
        log::info!("Domain {} deleted by '{}' (force: {})", self.id(), auth.user_id(), force);
        Ok(DomainResultInfo { task_id, value: () })
    }

    async fn run<F>(&self, f: F) -> Result<(TaskId, Applied)>
    where
        F: FnOnce(&mut DomainData) -> Result<(TaskId, Applied)> + Send + 'static,
    {
        self.dispatcher.invoke(f).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, AuthenticationRegistry};
    use crate::broadcast::Subscription;
    use crate::repository::fake::FakeBackend;
    use crate::repository::Repository;
    use crate::storage::StoreConfig;
    use crema_core::RemoveReason;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        registry: AuthenticationRegistry,
        runtime: DomainRuntime,
        completed: mpsc::UnboundedReceiver<TaskId>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DomainStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let registry = AuthenticationRegistry::new(AuthConfig::default());
        registry.add_user("admin", "Admin", "admin", Authority::Admin).await.unwrap();
        registry.add_user("alice", "Alice", "pw", Authority::Member).await.unwrap();
        registry.add_user("bob", "Bob", "pw", Authority::Member).await.unwrap();
        registry.add_user("guest", "Guest", "pw", Authority::Guest).await.unwrap();
        let (tasks, completed) = TaskTracker::new();
        let runtime = DomainRuntime {
            hub: Arc::new(EventHub::new()),
            store,
            tasks,
            host: None,
        };
        Fixture {
            dir,
            registry,
            runtime,
            completed,
        }
    }

    fn header(creator: &str) -> DomainHeader {
        let signature = SignatureDate::new(creator);
        DomainHeader {
            info: DomainInfo {
                domain_id: Uuid::new_v4(),
                data_base_id: Uuid::new_v4(),
                item_path: "/tables/Items".into(),
                item_type: "TableContent".into(),
                domain_type: "TableContentDomain".into(),
                creation_info: signature.clone(),
                modification_info: signature,
            },
            content: DomainContent::new().with_table(
                "Items",
                DomainTable::new(vec!["Name".into(), "Price".into()], vec!["Id".into()]),
            ),
        }
    }

    fn item(id: i64, name: &str) -> DomainRowInfo {
        DomainRowInfo::new("Items", vec![json!(id)]).with_field("Name", json!(name))
    }

    fn drain(subscription: &mut Subscription) -> Vec<Arc<DomainEvent>> {
        let mut events = Vec::new();
        while let Ok(event) = subscription.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_participant_becomes_owner() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        assert_eq!(domain.metadata().domain_state, DomainState::Created);

        let alice = f.registry.login("alice", "pw").await.unwrap();
        let bob = f.registry.login("bob", "pw").await.unwrap();
        let entered = domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        assert!(entered.value["tables"]["Items"].is_object());
        domain.enter(&bob, DomainAccessType::ReadWrite).await.unwrap();

        let metadata = domain.metadata();
        assert_eq!(metadata.owner_id.as_deref(), Some("alice"));
        assert_eq!(metadata.domain_state, DomainState::Active);
        assert_eq!(metadata.users.len(), 2);
        assert!(metadata.users[0].state.is_owner);
        assert!(!metadata.users[1].state.is_owner);

        let err = domain.enter(&bob, DomainAccessType::Read).await.unwrap_err();
        assert!(matches!(err, CremaError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_owner_leaving_passes_ownership() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        let bob = f.registry.login("bob", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        domain.enter(&bob, DomainAccessType::ReadWrite).await.unwrap();

        let mut events = f.runtime.hub.subscribe_all();
        domain.leave(&alice).await.unwrap();
        assert_eq!(domain.metadata().owner_id.as_deref(), Some("bob"));

        let events = drain(&mut events);
        assert!(events.iter().any(|e| matches!(
            &e.kind,
            DomainEventKind::UserRemoved { user_id, owner_id, .. }
                if user_id == "alice" && owner_id.as_deref() == Some("bob")
        )));
        assert!(events
            .iter()
            .any(|e| matches!(&e.kind, DomainEventKind::OwnerChanged { owner_id, .. } if owner_id == "bob")));

        let err = domain.leave(&alice).await.unwrap_err();
        assert!(matches!(err, CremaError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn test_row_operations_require_write_access() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        let guest = f.registry.login("guest", "pw").await.unwrap();

        let err = domain.new_row(&alice, vec![item(1, "apple")]).await.unwrap_err();
        assert!(matches!(err, CremaError::UserNotFound(_)));

        assert!(matches!(
            domain.enter(&guest, DomainAccessType::ReadWrite).await.unwrap_err(),
            CremaError::PermissionDenied(_)
        ));
        domain.enter(&guest, DomainAccessType::Read).await.unwrap();
        let err = domain.new_row(&guest, vec![item(1, "apple")]).await.unwrap_err();
        assert!(matches!(err, CremaError::PermissionDenied(_)));

        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        let added = domain.new_row(&alice, vec![item(1, "apple")]).await.unwrap();
        assert_eq!(added.value.len(), 1);
        let changed = domain
            .set_row(&alice, vec![DomainRowInfo::new("Items", vec![json!(1)]).with_field("Price", json!(4))])
            .await
            .unwrap();
        assert_eq!(changed.value[0].fields["Name"], json!("apple"));
        assert!(changed.task_id > added.task_id);
        assert!(domain.metadata().is_modified);

        assert!(matches!(
            domain.new_row(&alice, Vec::new()).await.unwrap_err(),
            CremaError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_mutations_are_serialized() {
        let mut f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();

        let mut handles = Vec::new();
        for id in 0..20 {
            let domain = domain.clone();
            let alice = alice.clone();
            handles.push(tokio::spawn(async move {
                domain.new_row(&alice, vec![item(id, "row")]).await.unwrap().task_id
            }));
        }
        let mut task_ids = Vec::new();
        for handle in handles {
            task_ids.push(handle.await.unwrap());
        }
        task_ids.sort();
        task_ids.dedup();
        assert_eq!(task_ids.len(), 20);
        assert_eq!(domain.content().await.unwrap().table("Items").unwrap().len(), 20);

        let mut completed = Vec::new();
        while let Ok(id) = f.completed.try_recv() {
            completed.push(id);
        }
        assert_eq!(completed.len(), 21);
        assert!(completed.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_row_events_reach_participants_only() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();

        let mut events = f.runtime.hub.subscribe_all();
        domain.new_row(&alice, vec![item(1, "apple")]).await.unwrap();
        domain.set_property(&alice, "Comment".into(), json!("draft")).await.unwrap();
        let events = drain(&mut events);
        let row = events.iter().find(|e| e.kind.name() == "RowAdded").unwrap();
        assert_eq!(row.audience, Audience::Participants(vec!["alice".into()]));
        assert_eq!(row.user_id, "alice");
        assert!(events.iter().any(|e| e.kind.name() == "PropertyChanged"));
        assert!(events.iter().any(|e| e.kind.name() == "DomainInfoChanged"));
    }

    #[tokio::test]
    async fn test_edit_and_location() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();

        let location = DomainLocationInfo {
            table_name: "Items".into(),
            keys: vec![json!(1)],
            column_name: "Name".into(),
            ..DomainLocationInfo::default()
        };
        domain.set_user_location(&alice, location.clone()).await.unwrap();
        domain.begin_user_edit(&alice, location.clone()).await.unwrap();
        assert!(domain.begin_user_edit(&alice, location).await.is_err());

        let metadata = domain.metadata();
        let user = &metadata.users[0];
        assert!(user.state.is_being_edited);
        assert_eq!(user.location.user_id, "alice");
        assert_eq!(user.location.column_name, "Name");

        domain.end_user_edit(&alice).await.unwrap();
        assert!(!domain.metadata().users[0].state.is_being_edited);
        assert!(domain.end_user_edit(&alice).await.is_err());
    }

    #[tokio::test]
    async fn test_kick_rules() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let admin = f.registry.login("admin", "admin").await.unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        let bob = f.registry.login("bob", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        domain.enter(&bob, DomainAccessType::ReadWrite).await.unwrap();

        let err = domain.kick(&bob, "alice", "out").await.unwrap_err();
        assert!(matches!(err, CremaError::PermissionDenied(_)));
        let err = domain.kick(&alice, "alice", "me").await.unwrap_err();
        assert!(matches!(err, CremaError::InvalidOperation(_)));
        let err = domain.kick(&admin, "alice", "owner").await.unwrap_err();
        assert!(matches!(err, CremaError::InvalidOperation(_)));
        let err = domain.kick(&alice, "nobody", "who").await.unwrap_err();
        assert!(matches!(err, CremaError::UserNotFound(_)));

        let mut events = f.runtime.hub.subscribe_all();
        domain.kick(&alice, "bob", "idle").await.unwrap();
        let events = drain(&mut events);
        match &events[0].kind {
            DomainEventKind::UserRemoved { user_id, remove_info, .. } => {
                assert_eq!(user_id, "bob");
                assert_eq!(remove_info.reason, RemoveReason::Kick);
                assert_eq!(remove_info.message, "idle");
            }
            other => panic!("unexpected event {}", other.name()),
        }
        assert_eq!(domain.metadata().users.len(), 1);
    }

    #[tokio::test]
    async fn test_set_owner() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        let bob = f.registry.login("bob", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();

        assert!(matches!(
            domain.set_owner(&alice, "bob").await.unwrap_err(),
            CremaError::UserNotFound(_)
        ));
        domain.enter(&bob, DomainAccessType::ReadWrite).await.unwrap();
        assert!(matches!(
            domain.set_owner(&bob, "bob").await.unwrap_err(),
            CremaError::PermissionDenied(_)
        ));
        domain.set_owner(&alice, "bob").await.unwrap();

        let metadata = domain.metadata();
        assert_eq!(metadata.owner_id.as_deref(), Some("bob"));
        assert!(metadata.users.iter().filter(|u| u.state.is_owner).count() == 1);
    }

    #[tokio::test]
    async fn test_delete_guard_and_force() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        let bob = f.registry.login("bob", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        domain.enter(&bob, DomainAccessType::ReadWrite).await.unwrap();

        let err = domain.delete(&alice, false).await.unwrap_err();
        assert!(matches!(err, CremaError::InvalidOperation(_)));
        let err = domain.delete(&bob, true).await.unwrap_err();
        assert!(matches!(err, CremaError::PermissionDenied(_)));

        domain.new_row(&alice, vec![item(1, "apple")]).await.unwrap();
        domain.delete(&alice, true).await.unwrap();
        assert_eq!(domain.metadata().domain_state, DomainState::Deleted);
        let err = domain.new_row(&alice, vec![item(2, "pear")]).await.unwrap_err();
        assert!(matches!(err, CremaError::DomainNotFound(_)));
        assert!(!f.runtime.store.domain_exists(domain.id()).unwrap());
    }

    #[tokio::test]
    async fn test_delete_rejects_open_edit() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        domain.begin_user_edit(&alice, DomainLocationInfo::default()).await.unwrap();

        assert!(domain.delete(&alice, false).await.is_err());
        domain.end_user_edit(&alice).await.unwrap();
        domain.delete(&alice, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_commits_through_host() {
        let mut f = fixture().await;
        let root = f.dir.path().join("wc");
        std::fs::create_dir_all(&root).unwrap();
        let repository = Repository::open(FakeBackend::new(&root), f.dir.path().join("tx")).unwrap();
        let host = Arc::new(RepositoryDomainHost::new(repository));
        f.runtime.host = Some(host.clone());

        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        domain.new_row(&alice, vec![item(1, "apple")]).await.unwrap();

        host.with_repository(|r| r.backend().fail_next_commits(1)).unwrap();
        assert!(matches!(
            domain.delete(&alice, false).await.unwrap_err(),
            CremaError::Repository(_)
        ));
        domain.set_property(&alice, "Retry".into(), json!(true)).await.unwrap();

        domain.delete(&alice, false).await.unwrap();
        host.with_repository(|r| {
            let table = r.backend().committed_file("tables/Items/Items.json").unwrap();
            assert!(table.contains("apple"));
            assert!(r.backend().committed_file("tables/Items/_properties.json").is_some());
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_detach_marks_offline_and_reassigns_owner() {
        let f = fixture().await;
        let domain = Domain::create(&f.runtime, header("alice")).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        let bob = f.registry.login("bob", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        domain.enter(&bob, DomainAccessType::ReadWrite).await.unwrap();

        let mut events = f.runtime.hub.subscribe_all();
        domain.detach(alice.token()).unwrap();
        domain.detach(Uuid::new_v4()).unwrap();
        domain.content().await.unwrap();

        let metadata = domain.metadata();
        assert_eq!(metadata.owner_id.as_deref(), Some("bob"));
        assert!(!metadata.users[0].state.is_online);
        let events = drain(&mut events);
        assert!(matches!(
            &events[0].kind,
            DomainEventKind::UserStateChanged { user_id, user_state, .. }
                if user_id == "alice" && !user_state.is_online
        ));

        f.registry.logout(&alice).await.unwrap();
        let err = domain.set_property(&alice, "x".into(), json!(1)).await.unwrap_err();
        assert!(matches!(err, CremaError::AuthenticationExpired(_)));

        let alice = f.registry.login("alice", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        let metadata = domain.metadata();
        assert_eq!(metadata.users.len(), 2);
        assert_eq!(metadata.owner_id.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_restore_replays_log() {
        let f = fixture().await;
        let header = header("alice");
        let id = header.info.domain_id;
        let domain = Domain::create(&f.runtime, header).unwrap();
        let alice = f.registry.login("alice", "pw").await.unwrap();
        let bob = f.registry.login("bob", "pw").await.unwrap();
        domain.enter(&alice, DomainAccessType::ReadWrite).await.unwrap();
        domain.enter(&bob, DomainAccessType::Read).await.unwrap();
        domain.new_row(&alice, vec![item(1, "apple"), item(2, "pear")]).await.unwrap();
        domain.remove_row(&alice, vec![DomainRowInfo::new("Items", vec![json!(2)])]).await.unwrap();
        domain.set_property(&alice, "Comment".into(), json!("draft")).await.unwrap();

        let restored = Domain::restore(&f.runtime, id).unwrap();
        let content = restored.content().await.unwrap();
        assert_eq!(content.table("Items").unwrap().len(), 1);
        assert_eq!(content.properties["Comment"], json!("draft"));

        let metadata = restored.metadata();
        assert_eq!(metadata.users.len(), 2);
        assert!(metadata.users.iter().all(|u| !u.state.is_online));
        assert_eq!(metadata.owner_id, None);
        assert_eq!(metadata.domain_state, DomainState::Inactive);
        assert!(metadata.is_modified);

        restored.enter(&bob, DomainAccessType::ReadWrite).await.unwrap();
        assert_eq!(restored.metadata().owner_id.as_deref(), Some("bob"));
    }
}
