//! WebSocket RPC client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Request/response correlation by frame id
//! - Typed helpers for every service method
//! - A callback receiver for server notifications

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crema_core::{
    DataBaseId, DomainAccessType, DomainContextMetaData, DomainLocationInfo, DomainMetaData,
    DomainRowInfo, ResultBase,
};

use crate::context::CreateDomain;
use crate::protocol::{CallbackMessage, Frame, FrameType, ProtocolError, Request, Response};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Frame>>>>;

pub struct CremaClient {
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    pending: Pending,
    next_id: AtomicU64,
    callback_rx: Option<mpsc::UnboundedReceiver<CallbackMessage>>,
    request_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl CremaClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9090`).
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
        let (ws_writer, mut ws_reader) = futures_util::StreamExt::split(ws_stream);

        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();

        // Writer task: forward outgoing channel to WebSocket
        let writer = tokio::spawn(async move {
            use futures_util::SinkExt;
            let mut ws_writer = ws_writer;
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route responses to their callers, callbacks to the receiver
        let reader_state = state.clone();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = match Frame::decode(&bytes) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("Failed to decode frame: {e}");
                                continue;
                            }
                        };
                        match frame.frame_type {
                            FrameType::Response | FrameType::Pong => {
                                if let Some(waiter) = reader_pending.lock().await.remove(&frame.id) {
                                    let _ = waiter.send(frame);
                                }
                            }
                            FrameType::Callback => match frame.to_callback() {
                                Ok(message) => {
                                    let _ = callback_tx.send(message);
                                }
                                Err(e) => log::warn!("Malformed callback: {e}"),
                            },
                            other => log::debug!("Unexpected {other:?} frame from server"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost: fail every waiting request
            *reader_state.write().await = ConnectionState::Disconnected;
            reader_pending.lock().await.clear();
        });

        Ok(Self {
            state,
            outgoing_tx: out_tx,
            pending,
            next_id: AtomicU64::new(1),
            callback_rx: Some(callback_rx),
            request_timeout: Duration::from_secs(10),
            tasks: vec![writer, reader],
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the callback receiver (can only be called once).
    pub fn take_callback_rx(&mut self) -> Option<mpsc::UnboundedReceiver<CallbackMessage>> {
        self.callback_rx.take()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Close the socket and stop the background tasks.
    pub async fn disconnect(&mut self) {
        *self.state.write().await = ConnectionState::Disconnected;
        self.pending.lock().await.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Send a raw request and wait for its response.
    pub async fn call(&self, request: &Request) -> Result<Response, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::request(id, request)?;
        self.exchange(frame).await?.to_response()
    }

    /// Round-trip a heartbeat frame.
    pub async fn ping(&self) -> Result<Duration, ProtocolError> {
        let started = std::time::Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pong = self.exchange(Frame::ping(id)).await?;
        if pong.frame_type != FrameType::Pong {
            return Err(ProtocolError::InvalidFrameType(pong.frame_type));
        }
        Ok(started.elapsed())
    }

    async fn exchange(&self, frame: Frame) -> Result<Frame, ProtocolError> {
        if self.state().await == ConnectionState::Disconnected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let id = frame.id;
        let encoded = frame.encode()?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outgoing_tx.send(encoded).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ProtocolError::ConnectionClosed);
        }
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Send a request and decode the value of its result.
    async fn request<T: DeserializeOwned>(&self, request: Request) -> Result<ResultBase<T>, ProtocolError> {
        let response = self.call(&request).await?;
        let ResultBase {
            value,
            fault,
            signature_date,
            task_id,
        } = response;
        // A unit value travels as `null`, which deserializes as no value.
        let value = match fault {
            Some(_) => None,
            None => Some(
                serde_json::from_value(value.unwrap_or(Value::Null))
                    .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?,
            ),
        };
        Ok(ResultBase {
            value,
            fault,
            signature_date,
            task_id,
        })
    }

    // ─── HostService ──────────────────────────────────────────────────

    pub async fn subscribe(&self) -> Result<ResultBase<Uuid>, ProtocolError> {
        self.request(Request::Subscribe).await
    }

    pub async fn unsubscribe(&self, peer_token: Uuid) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::Unsubscribe { peer_token }).await
    }

    pub async fn login(&self, user_id: &str, password: &str) -> Result<ResultBase<Uuid>, ProtocolError> {
        self.request(Request::Login {
            user_id: user_id.to_string(),
            password: password.to_string(),
        })
        .await
    }

    pub async fn logout(&self, token: Uuid) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::Logout { token }).await
    }

    pub async fn is_alive(&self, token: Uuid) -> Result<ResultBase<bool>, ProtocolError> {
        self.request(Request::IsAlive { token }).await
    }

    pub async fn kick_user(
        &self,
        token: Uuid,
        user_id: &str,
        comment: &str,
    ) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::KickUser {
            token,
            user_id: user_id.to_string(),
            comment: comment.to_string(),
        })
        .await
    }

    pub async fn ban_user(
        &self,
        token: Uuid,
        user_id: &str,
        comment: &str,
    ) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::BanUser {
            token,
            user_id: user_id.to_string(),
            comment: comment.to_string(),
        })
        .await
    }

    pub async fn unban_user(&self, token: Uuid, user_id: &str) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::UnbanUser {
            token,
            user_id: user_id.to_string(),
        })
        .await
    }

    // ─── DomainContextService ─────────────────────────────────────────

    pub async fn subscribe_domains(
        &self,
        peer_token: Uuid,
    ) -> Result<ResultBase<DomainContextMetaData>, ProtocolError> {
        self.request(Request::SubscribeDomains { peer_token }).await
    }

    pub async fn unsubscribe_domains(&self, peer_token: Uuid) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::UnsubscribeDomains { peer_token }).await
    }

    pub async fn get_metadata(
        &self,
        token: Uuid,
        data_base_id: Option<DataBaseId>,
    ) -> Result<ResultBase<DomainContextMetaData>, ProtocolError> {
        self.request(Request::GetMetaData { token, data_base_id }).await
    }

    pub async fn create_domain(
        &self,
        token: Uuid,
        domain: CreateDomain,
    ) -> Result<ResultBase<DomainMetaData>, ProtocolError> {
        self.request(Request::CreateDomain { token, domain }).await
    }

    pub async fn enter_domain(
        &self,
        token: Uuid,
        domain_id: Uuid,
        access_type: DomainAccessType,
    ) -> Result<ResultBase<Value>, ProtocolError> {
        self.request(Request::EnterDomain {
            token,
            domain_id,
            access_type,
        })
        .await
    }

    pub async fn leave_domain(&self, token: Uuid, domain_id: Uuid) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::LeaveDomain { token, domain_id }).await
    }

    pub async fn begin_user_edit(
        &self,
        token: Uuid,
        domain_id: Uuid,
        location: DomainLocationInfo,
    ) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::BeginUserEdit {
            token,
            domain_id,
            location,
        })
        .await
    }

    pub async fn end_user_edit(&self, token: Uuid, domain_id: Uuid) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::EndUserEdit { token, domain_id }).await
    }

    pub async fn set_user_location(
        &self,
        token: Uuid,
        domain_id: Uuid,
        location: DomainLocationInfo,
    ) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::SetUserLocation {
            token,
            domain_id,
            location,
        })
        .await
    }

    pub async fn new_row(
        &self,
        token: Uuid,
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
    ) -> Result<ResultBase<Vec<DomainRowInfo>>, ProtocolError> {
        self.request(Request::NewRow { token, domain_id, rows }).await
    }

    pub async fn set_row(
        &self,
        token: Uuid,
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
    ) -> Result<ResultBase<Vec<DomainRowInfo>>, ProtocolError> {
        self.request(Request::SetRow { token, domain_id, rows }).await
    }

    pub async fn remove_row(
        &self,
        token: Uuid,
        domain_id: Uuid,
        rows: Vec<DomainRowInfo>,
    ) -> Result<ResultBase<Vec<DomainRowInfo>>, ProtocolError> {
        self.request(Request::RemoveRow { token, domain_id, rows }).await
    }

    pub async fn set_property(
        &self,
        token: Uuid,
        domain_id: Uuid,
        name: &str,
        value: Value,
    ) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::SetProperty {
            token,
            domain_id,
            name: name.to_string(),
            value,
        })
        .await
    }

    pub async fn kick(
        &self,
        token: Uuid,
        domain_id: Uuid,
        user_id: &str,
        comment: &str,
    ) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::Kick {
            token,
            domain_id,
            user_id: user_id.to_string(),
            comment: comment.to_string(),
        })
        .await
    }

    pub async fn set_owner(
        &self,
        token: Uuid,
        domain_id: Uuid,
        user_id: &str,
    ) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::SetOwner {
            token,
            domain_id,
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn delete_domain(
        &self,
        token: Uuid,
        domain_id: Uuid,
        force: bool,
    ) -> Result<ResultBase<()>, ProtocolError> {
        self.request(Request::DeleteDomain {
            token,
            domain_id,
            force,
        })
        .await
    }

    pub async fn delete_domains(
        &self,
        token: Uuid,
        data_base_id: DataBaseId,
    ) -> Result<ResultBase<Vec<Uuid>>, ProtocolError> {
        self.request(Request::DeleteDomains { token, data_base_id }).await
    }
}

impl Drop for CremaClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = CremaClient::connect(&format!("ws://127.0.0.1:{port}")).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionFailed(_))));
    }
}
