//! WebSocket RPC server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                     ┌── HostService ──────────┐
//!            ├── connection task ──┤                         ├── AuthenticationRegistry
//! Client B ──┘   (one per socket)  └── DomainContextService ─┤
//!                      ▲                                     └── DomainContext
//!                      │                                            │
//!                      └──────── callbacks (mpsc) ◄── EventHub ◄────┘
//! ```
//!
//! Each connection owns one pair of services. Requests on a connection are
//! answered in arrival order; callbacks queued while a request runs are sent
//! after its response. When the socket closes both services unsubscribe and
//! every authentication of the connection is logged out.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crema_core::{Fault, ResultBase, SignatureDate};

use crate::auth::{AuthConfig, AuthenticationRegistry};
use crate::context::{ContextConfig, DomainContext};
use crate::domain::open_repository_host;
use crate::error::{CremaError, Result};
use crate::peer::PeerRegistry;
use crate::protocol::{CallbackMessage, Frame, FrameType, ProtocolError, Request, Response};
use crate::repository::RepositoryConfig;
use crate::service::{DomainContextService, HostService};
use crate::storage::{DomainStore, StoreConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Idle-session sweep interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Sessions without a keepalive for this long are expired
    pub session_timeout_secs: u64,
    /// Domain log storage
    pub store: StoreConfig,
    /// Repository that receives committed domains (None = discard on delete)
    pub repository: Option<RepositoryConfig>,
    /// Completion aggregation window in milliseconds
    pub completion_window_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
            session_timeout_secs: 120,
            store: StoreConfig::default(),
            repository: None,
            completion_window_ms: 10,
        }
    }
}

impl ServerConfig {
    /// Small caches, no repository, no aggregation delay.
    pub fn for_testing(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            heartbeat_interval_secs: 1,
            store: StoreConfig::for_testing(storage_path),
            completion_window_ms: 0,
            ..Self::default()
        }
    }

    fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            ..AuthConfig::default()
        }
    }

    fn context_config(&self) -> ContextConfig {
        ContextConfig {
            completion_window: Duration::from_millis(self.completion_window_ms),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_callbacks: u64,
}

pub struct CremaServer {
    config: ServerConfig,
    registry: Arc<AuthenticationRegistry>,
    peers: Arc<PeerRegistry>,
    context: Arc<DomainContext>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CremaServer {
    /// Open the store and the repository, then restore the domain context.
    ///
    /// Must be called inside a tokio runtime. Fails when the repository
    /// working copy has local modifications.
    pub fn open(config: ServerConfig) -> Result<Self> {
        let store = Arc::new(DomainStore::open(config.store.clone())?);
        let host = config
            .repository
            .as_ref()
            .map(open_repository_host)
            .transpose()?;
        let registry = Arc::new(AuthenticationRegistry::new(config.auth_config()));
        let context = Arc::new(DomainContext::open(
            config.context_config(),
            registry.clone(),
            store,
            host,
        )?);
        Ok(Self {
            config,
            registry,
            peers: Arc::new(PeerRegistry::new()),
            context,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    pub fn registry(&self) -> &Arc<AuthenticationRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<DomainContext> {
        &self.context
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Crema server listening on {}", self.config.bind_addr);

        let heartbeat = tokio::spawn(expire_idle_sessions(
            self.registry.clone(),
            Duration::from_secs(self.config.heartbeat_interval_secs.max(1)),
        ));

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    heartbeat.abort();
                    return Err(e.into());
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let peers = self.peers.clone();
            let context = self.context.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, peers, context, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Stop background work and end every session.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
        self.context.dispose();
        log::info!("Crema server stopped");
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<AuthenticationRegistry>,
        peers: Arc<PeerRegistry>,
        context: Arc<DomainContext>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> std::result::Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (callback_tx, mut callback_rx) = mpsc::unbounded_channel::<CallbackMessage>();
        let host = HostService::new(registry, peers.clone(), callback_tx.clone());
        let domains = DomainContextService::new(context, peers, callback_tx);

        let result: std::result::Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let frame = match Frame::decode(&bytes) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let reply = match frame.frame_type {
                                    FrameType::Request => {
                                        stats.write().await.total_requests += 1;
                                        let response = match frame.to_request() {
                                            Ok(request) => dispatch(&host, &domains, request).await,
                                            Err(e) => protocol_fault(e),
                                        };
                                        Frame::response(frame.id, &response)?
                                    }
                                    FrameType::Ping => Frame::pong(frame.id),
                                    other => {
                                        log::debug!("Unexpected {other:?} frame from {addr}");
                                        continue;
                                    }
                                };
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    Some(message) = callback_rx.recv() => {
                        let encoded = Frame::callback(&message)?.encode()?;
                        ws_sender.send(Message::Binary(encoded.into())).await?;
                        stats.write().await.total_callbacks += 1;
                    }
                }
            }
            Ok(())
        }
        .await;

        domains.close().await;
        host.close().await;
        stats.write().await.active_connections -= 1;
        result
    }
}

/// Route one request to its service and serialize the result.
async fn dispatch(host: &HostService, domains: &DomainContextService, request: Request) -> Response {
    log::trace!("Dispatching {}", request.method());
    match request {
        Request::Subscribe => to_wire(host.subscribe()),
        Request::Unsubscribe { peer_token } => to_wire(host.unsubscribe(peer_token).await),
        Request::Login { user_id, password } => to_wire(host.login(&user_id, &password).await),
        Request::Logout { token } => to_wire(host.logout(token).await),
        Request::IsAlive { token } => to_wire(host.is_alive(token).await),
        Request::KickUser { token, user_id, comment } => {
            to_wire(host.kick_user(token, &user_id, &comment).await)
        }
        Request::BanUser { token, user_id, comment } => {
            to_wire(host.ban_user(token, &user_id, &comment).await)
        }
        Request::UnbanUser { token, user_id } => to_wire(host.unban_user(token, &user_id).await),

        Request::SubscribeDomains { peer_token } => to_wire(domains.subscribe(peer_token).await),
        Request::UnsubscribeDomains { peer_token } => to_wire(domains.unsubscribe(peer_token).await),
        Request::GetMetaData { token, data_base_id } => {
            to_wire(domains.get_metadata(token, data_base_id).await)
        }
        Request::CreateDomain { token, domain } => to_wire(domains.create_domain(token, domain).await),
        Request::EnterDomain { token, domain_id, access_type } => {
            to_wire(domains.enter_domain(token, domain_id, access_type).await)
        }
        Request::LeaveDomain { token, domain_id } => to_wire(domains.leave_domain(token, domain_id).await),
        Request::BeginUserEdit { token, domain_id, location } => {
            to_wire(domains.begin_user_edit(token, domain_id, location).await)
        }
        Request::EndUserEdit { token, domain_id } => {
            to_wire(domains.end_user_edit(token, domain_id).await)
        }
        Request::SetUserLocation { token, domain_id, location } => {
            to_wire(domains.set_user_location(token, domain_id, location).await)
        }
        Request::NewRow { token, domain_id, rows } => to_wire(domains.new_row(token, domain_id, rows).await),
        Request::SetRow { token, domain_id, rows } => to_wire(domains.set_row(token, domain_id, rows).await),
        Request::RemoveRow { token, domain_id, rows } => {
            to_wire(domains.remove_row(token, domain_id, rows).await)
        }
        Request::SetProperty { token, domain_id, name, value } => {
            to_wire(domains.set_property(token, domain_id, name, value).await)
        }
        Request::Kick { token, domain_id, user_id, comment } => {
            to_wire(domains.kick(token, domain_id, &user_id, &comment).await)
        }
        Request::SetOwner { token, domain_id, user_id } => {
            to_wire(domains.set_owner(token, domain_id, &user_id).await)
        }
        Request::DeleteDomain { token, domain_id, force } => {
            to_wire(domains.delete_domain(token, domain_id, force).await)
        }
        Request::DeleteDomains { token, data_base_id } => {
            to_wire(domains.delete_domains(token, data_base_id).await)
        }
    }
}

fn to_wire<T: Serialize>(result: ResultBase<T>) -> Response {
    let ResultBase {
        value,
        fault,
        signature_date,
        task_id,
    } = result;
    match value.map(serde_json::to_value).transpose() {
        Ok(value) => ResultBase {
            value,
            fault,
            signature_date,
            task_id,
        },
        Err(e) => protocol_fault(ProtocolError::SerializationError(e.to_string())),
    }
}

fn protocol_fault(error: ProtocolError) -> Response {
    ResultBase::fault(Fault::from(CremaError::from(error)), SignatureDate::empty())
}

async fn expire_idle_sessions(registry: Arc<AuthenticationRegistry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let expired = registry.expire_idle().await;
        if expired > 0 {
            log::info!("Heartbeat expired {expired} idle session(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crema_core::TaskId;
    use serde_json::{json, Value};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.session_timeout_secs, 120);
        assert!(config.repository.is_none());
        assert_eq!(config.auth_config().session_timeout, Duration::from_secs(120));
        assert_eq!(config.context_config().completion_window, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_server_open() {
        let dir = tempfile::tempdir().unwrap();
        let server = CremaServer::open(ServerConfig::for_testing(dir.path().join("db"))).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.context().get_metadata().await.unwrap().is_empty());
        assert!(server.peers().is_empty());

        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn test_to_wire_keeps_envelope() {
        let result = ResultBase::ok(vec![1, 2], SignatureDate::new("alice")).with_task_id(TaskId(9));
        let wire = to_wire(result);
        assert_eq!(wire.value, Some(json!([1, 2])));
        assert_eq!(wire.task_id, Some(TaskId(9)));
        assert_eq!(wire.signature_date.id, "alice");

        let failed: ResultBase<Value> = to_wire(ResultBase::<u8>::fault(
            Fault::new("InvalidToken", "gone"),
            SignatureDate::empty(),
        ));
        assert_eq!(failed.fault_type(), Some("InvalidToken"));
        assert!(failed.value.is_none());
    }

    #[test]
    fn test_protocol_fault() {
        let response = protocol_fault(ProtocolError::InvalidFrameType(FrameType::Callback));
        assert_eq!(response.fault_type(), Some("ProtocolError"));
    }
}
