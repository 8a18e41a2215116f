//! Forward steps with compensating rollback.
//!
//! Each completed step may register a compensation. When a later step fails,
//! registered compensations run in reverse order and the step's error is
//! returned. Compensations are best effort: their failures are logged and
//! never replace the original error.

use std::future::Future;

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::error::{OperatorError, Result};

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

pub struct Saga {
    name: String,
    compensations: Vec<(&'static str, Compensation)>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compensations: Vec::new(),
        }
    }

    /// Run a forward step. On failure every registered compensation runs
    /// before the error is returned, prefixed with `label`.
    pub async fn step<T, F>(&mut self, label: &'static str, action: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match action.await {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(saga = %self.name, step = label, error = %err, "Step failed, rolling back");
                self.unwind().await;
                Err(OperatorError::Reconciliation(format!("{}: {}", label, err)))
            }
        }
    }

    /// Register the undo action for a step that has completed.
    pub fn compensate<F, Fut>(&mut self, label: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensations
            .push((label, Box::new(move || Box::pin(undo()))));
    }

    /// Run every registered compensation, most recent first.
    pub async fn unwind(&mut self) {
        while let Some((label, undo)) = self.compensations.pop() {
            match undo().await {
                Ok(()) => info!(saga = %self.name, step = label, "Rolled back"),
                Err(err) => {
                    warn!(saga = %self.name, step = label, error = %err, "Rollback failed")
                }
            }
        }
    }

    /// Labels of the compensations that would run on failure, oldest first.
    #[cfg(test)]
    pub fn pending(&self) -> Vec<&'static str> {
        self.compensations.iter().map(|(label, _)| *label).collect()
    }

    /// Drop the compensations once every step succeeded.
    pub fn finish(mut self) {
        self.compensations.clear();
    }
}
