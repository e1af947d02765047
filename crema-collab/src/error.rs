//! Engine-wide error taxonomy.
//!
//! Everything below the service façade returns [`CremaError`]; the façade
//! converts it into a [`Fault`] so that failures reach clients as data.

use crema_core::Fault;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ProtocolError;
use crate::repository::RepositoryError;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum CremaError {
    /// Bad credentials or a banned account.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Unknown or already expired token.
    #[error("invalid authentication token: {0}")]
    InvalidToken(Uuid),

    /// The acting authentication expired while the call was in flight.
    #[error("authentication of '{0}' has expired")]
    AuthenticationExpired(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("domain not found: {0}")]
    DomainNotFound(Uuid),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("category not found: {0}")]
    CategoryNotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The owning dispatcher has shut down.
    #[error("dispatcher '{0}' is closed")]
    DispatcherClosed(String),
}

impl CremaError {
    /// Stable name placed into [`Fault::exception_type`].
    pub fn exception_type(&self) -> &'static str {
        match self {
            CremaError::AuthenticationFailed(_) => "AuthenticationFailed",
            CremaError::InvalidToken(_) => "InvalidToken",
            CremaError::AuthenticationExpired(_) => "AuthenticationExpired",
            CremaError::PermissionDenied(_) => "PermissionDenied",
            CremaError::DomainNotFound(_) => "DomainNotFound",
            CremaError::UserNotFound(_) => "UserNotFound",
            CremaError::ItemNotFound(_) => "ItemNotFound",
            CremaError::CategoryNotFound(_) => "CategoryNotFound",
            CremaError::InvalidOperation(_) => "InvalidOperation",
            CremaError::InvalidArgument(_) => "InvalidArgument",
            CremaError::Repository(_) => "RepositoryError",
            CremaError::Store(_) => "StoreError",
            CremaError::Protocol(_) => "ProtocolError",
            CremaError::DispatcherClosed(_) => "DispatcherClosed",
        }
    }

    pub fn is_authentication_error(&self) -> bool {
        matches!(
            self,
            CremaError::AuthenticationFailed(_)
                | CremaError::InvalidToken(_)
                | CremaError::AuthenticationExpired(_)
        )
    }
}

impl From<&CremaError> for Fault {
    fn from(error: &CremaError) -> Self {
        Fault::new(error.exception_type(), error.to_string())
    }
}

impl From<CremaError> for Fault {
    fn from(error: CremaError) -> Self {
        Fault::from(&error)
    }
}

pub type Result<T, E = CremaError> = std::result::Result<T, E>;
