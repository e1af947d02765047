//! RPC façades: the only place where engine errors become data.
//!
//! ```text
//!  connection ──► HostService ────────────► AuthenticationRegistry, Peer
//!             └─► DomainContextService ───► DomainContext ──► Domain
//!                        │
//!                        └── EventHub subscription ──► CallbackSender ──► connection
//! ```
//!
//! One pair of services exists per connection. Every call returns a
//! [`ResultBase`]; a failure is carried as its [`Fault`]. Each service numbers
//! its own callbacks with a strictly increasing [`CallbackInfo::index`].

pub mod domain;
pub mod host;

pub use domain::DomainContextService;
pub use host::HostService;

use crema_core::{CallbackInfo, DomainResultInfo, Fault, ResultBase, SignatureDate, TaskId};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::{CremaError, Result};
use crate::protocol::{Callback, CallbackMessage};

/// Numbers and forwards the callbacks of one service instance.
#[derive(Debug)]
pub struct CallbackSender {
    index: Mutex<i64>,
    sink: mpsc::UnboundedSender<CallbackMessage>,
}

impl CallbackSender {
    pub fn new(sink: mpsc::UnboundedSender<CallbackMessage>) -> Self {
        Self {
            index: Mutex::new(0),
            sink,
        }
    }

    /// Returns `false` once the connection is gone.
    pub fn send(&self, signature_date: SignatureDate, callback: Callback) -> bool {
        // The lock spans numbering and sending so indices leave in order.
        let Ok(mut index) = self.index.lock() else {
            return false;
        };
        *index += 1;
        let message = CallbackMessage {
            info: CallbackInfo {
                index: *index,
                signature_date,
            },
            callback,
        };
        self.sink.send(message).is_ok()
    }

    pub fn last_index(&self) -> i64 {
        self.index.lock().map(|i| *i).unwrap_or(0)
    }
}

/// Value of a successful call, plus the task id when the call has one.
pub(crate) trait Reply {
    type Value;

    fn into_parts(self) -> (Self::Value, Option<TaskId>);
}

impl<T> Reply for DomainResultInfo<T> {
    type Value = T;

    fn into_parts(self) -> (T, Option<TaskId>) {
        (self.value, Some(self.task_id))
    }
}

/// A reply without a task id.
pub(crate) struct Untracked<T>(pub T);

impl<T> Reply for Untracked<T> {
    type Value = T;

    fn into_parts(self) -> (T, Option<TaskId>) {
        (self.0, None)
    }
}

/// Convert an engine outcome into the wire envelope.
pub(crate) fn respond<R: Reply>(
    method: &str,
    signature_date: SignatureDate,
    result: Result<R>,
) -> ResultBase<R::Value> {
    match result {
        Ok(reply) => {
            let (value, task_id) = reply.into_parts();
            let result = ResultBase::ok(value, signature_date);
            match task_id {
                Some(task_id) => result.with_task_id(task_id),
                None => result,
            }
        }
        Err(e) => fault(method, signature_date, &e),
    }
}

pub(crate) fn fault<T>(method: &str, signature_date: SignatureDate, error: &CremaError) -> ResultBase<T> {
    log::debug!("{} by '{}' failed: {}", method, signature_date.id, error);
    ResultBase::fault(Fault::from(error), signature_date)
}
