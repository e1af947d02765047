//! Single-owner executor for shared mutable state.
//!
//! A [`Dispatcher`] owns a value on its own tokio task. Callers never touch
//! the value directly: they submit closures which run one at a time in
//! submission order, so every job observes the effects of all earlier jobs
//! and nothing else.
//!
//! ```text
//!  caller A ──┐
//!  caller B ──┼──► mpsc (FIFO) ──► task { state: S } ──► oneshot reply
//!  caller C ──┘
//! ```

use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CremaError, Result};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

pub struct Dispatcher<S> {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<S> fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl<S: Send + 'static> Dispatcher<S> {
    /// Move `state` onto a new task. Must be called inside a tokio runtime.
    pub fn spawn(name: impl Into<String>, mut state: S) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job<S>>();
        let task_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                job(&mut state);
            }
            log::debug!("Dispatcher '{}' stopped", task_name);
        });
        Self { name, sender }
    }

    /// Run `f` on the owned state and wait for its result.
    pub async fn invoke<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(Box::new(move |state: &mut S| {
                let _ = reply_tx.send(f(state));
            }))
            .map_err(|_| self.closed())?;
        reply_rx.await.map_err(|_| self.closed())
    }

    /// Queue `f` without waiting for it.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.sender.send(Box::new(f)).map_err(|_| self.closed())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn closed(&self) -> CremaError {
        CremaError::DispatcherClosed(self.name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invoke_returns_value() {
        let dispatcher = Dispatcher::spawn("test", 10u32);
        let value = dispatcher.invoke(|n| *n * 2).await.unwrap();
        assert_eq!(value, 20);
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let dispatcher = Dispatcher::spawn("order", Vec::<u32>::new());
        for i in 0..100 {
            dispatcher.post(move |v| v.push(i)).unwrap();
        }
        let seen = dispatcher.invoke(|v| v.clone()).await.unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrent_invokes_are_serialized() {
        let dispatcher = Dispatcher::spawn("counter", 0u64);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let d = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    d.invoke(|n| {
                        let before = *n;
                        *n = before + 1;
                    })
                    .await
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(dispatcher.invoke(|n| *n).await.unwrap(), 800);
    }

    #[tokio::test]
    async fn test_panicking_job_closes_dispatcher() {
        let dispatcher = Dispatcher::spawn("fragile", ());
        let result = dispatcher.invoke(|_| -> u8 { panic!("boom") }).await;
        assert!(matches!(result, Err(CremaError::DispatcherClosed(_))));
        assert!(dispatcher.invoke(|_| 1).await.is_err());
    }
}
