//! Persistent storage for domains.
//!
//! ```text
//! ┌──────────────┐   post / complete   ┌───────────────────────────────┐
//! │ DomainLogger │ ──────────────────► │ DomainStore (RocksDB)         │
//! │ (per domain) │                     │ CF "domains":   headers       │
//! └──────────────┘                     │ CF "actions":   posted log    │
//!        ▲                             │ CF "completed": applied ids   │
//!        │ replay on startup           └───────────────────────────────┘
//! ┌──────────────┐
//! │DomainContext │
//! └──────────────┘
//! ```

pub mod rocks;

pub use rocks::{DomainStore, StoreConfig, StoreError};
