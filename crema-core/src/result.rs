//! Errors-as-data envelope used at the RPC boundary.
//!
//! Server code returns `Result<T, E>` internally; only the service façade
//! turns the outcome into a [`ResultBase`] so that a failure travels to the
//! client as a [`Fault`] instead of tearing down the connection.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{SignatureDate, TaskId};

/// A failure carried across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub exception_type: String,
    pub message: String,
}

impl Fault {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.message)
    }
}

impl std::error::Error for Fault {}

/// Outcome of one remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBase<T> {
    pub value: Option<T>,
    pub fault: Option<Fault>,
    pub signature_date: SignatureDate,
    pub task_id: Option<TaskId>,
}

impl<T> ResultBase<T> {
    pub fn ok(value: T, signature_date: SignatureDate) -> Self {
        Self {
            value: Some(value),
            fault: None,
            signature_date,
            task_id: None,
        }
    }

    pub fn fault(fault: Fault, signature_date: SignatureDate) -> Self {
        Self {
            value: None,
            fault: Some(fault),
            signature_date,
            task_id: None,
        }
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.fault.is_none()
    }

    /// Exception type of the fault, if any.
    pub fn fault_type(&self) -> Option<&str> {
        self.fault.as_ref().map(|f| f.exception_type.as_str())
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ResultBase<U> {
        ResultBase {
            value: self.value.map(f),
            fault: self.fault,
            signature_date: self.signature_date,
            task_id: self.task_id,
        }
    }

    /// Unwrap the envelope back into a `Result`.
    ///
    /// A result with neither a value nor a fault is reported as a fault of
    /// type `EmptyResult`.
    pub fn into_result(self) -> Result<T, Fault> {
        match (self.fault, self.value) {
            (Some(fault), _) => Err(fault),
            (None, Some(value)) => Ok(value),
            (None, None) => Err(Fault::new("EmptyResult", "result carried no value")),
        }
    }
}

/// Header of every server → client callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackInfo {
    /// Strictly increasing per service instance.
    pub index: i64,
    pub signature_date: SignatureDate,
}
