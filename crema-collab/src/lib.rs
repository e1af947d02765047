//! # crema-collab: collaborative domain-session engine for Crema
//!
//! Hosts editable "domains" of tabular data that several users edit at once,
//! the authentication registry that says who those users are, and the
//! repository transaction manager that commits finished domains.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────────────────┐
//! │ CremaClient │ ◄─────────────────► │ CremaServer                  │
//! │ (per user)  │   Frame (bincode)   │  HostService                 │
//! └─────────────┘                     │  DomainContextService        │
//!                                     └──────────────┬───────────────┘
//!                                                    │
//!                      ┌─────────────────────────────┼───────────────────┐
//!                      ▼                             ▼                   ▼
//!            ┌──────────────────┐        ┌───────────────────┐   ┌──────────────┐
//!            │ Authentication   │ expiry │ DomainContext     │   │ EventHub     │
//!            │ Registry + Peers │ ─────► │  Dispatcher       │──►│ (fan-out)    │
//!            └──────────────────┘        │  Domain × N       │   └──────────────┘
//!                                        └────────┬──────────┘
//!                                                 │
//!                                   ┌─────────────┴─────────────┐
//!                                   ▼                           ▼
//!                           ┌──────────────┐           ┌──────────────────┐
//!                           │ DomainStore  │           │ Repository<B>    │
//!                           │ (RocksDB)    │           │ (svn / git)      │
//!                           └──────────────┘           └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: authentication registry: login, keepalive, kick and ban
//! - [`peer`]: which users are present on which connection
//! - [`dispatcher`]: single-task executor that owns mutable state
//! - [`broadcast`]: domain events and filtered fan-out
//! - [`domain`]: one collaboratively edited unit of tabular data
//! - [`context`]: the live set of domains of a server
//! - [`service`]: per-connection RPC façades (errors become data)
//! - [`protocol`]: wire frames, requests and callbacks
//! - [`server`] / [`client`]: WebSocket transport
//! - [`storage`]: RocksDB-backed domain log
//! - [`repository`]: transactional commit/revert over a working copy

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod context;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod repository;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthConfig, Authentication, AuthenticationRegistry, ExpiredNotice, SYSTEM_USER_ID};
pub use broadcast::{Audience, DomainEvent, DomainEventKind, EventHub, Subscription};
pub use client::{ConnectionState, CremaClient};
pub use context::{ContextConfig, CreateDomain, DomainContext};
pub use dispatcher::Dispatcher;
pub use domain::{Domain, DomainContent, DomainHost, DomainTable, RepositoryDomainHost};
pub use error::{CremaError, Result};
pub use peer::{Peer, PeerRegistry};
pub use protocol::{Callback, CallbackMessage, Frame, FrameType, ProtocolError, Request, Response};
pub use repository::{BackendKind, Repository, RepositoryConfig, RepositoryError};
pub use server::{CremaServer, ServerConfig, ServerStats};
pub use service::{DomainContextService, HostService};
pub use storage::{DomainStore, StoreConfig, StoreError};
