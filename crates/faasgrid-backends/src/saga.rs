//! Compensating-action sagas.
//!
//! A [`Saga`] runs the steps of one multi-step operation in order. After a
//! step commits, the driver registers the action that undoes it. When a
//! later step fails, the registered compensations run in reverse order and
//! the failing step's error is returned unchanged; compensation failures
//! are only logged.
//!
//! Rollbacks run on a spawned task: dropping the caller's future, or the
//! saga itself, does not interrupt a rollback that has started.

use std::fmt::Display;
use std::future::Future;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use crate::error::{BackendError, BackendResult};

type Compensation = (&'static str, BoxFuture<'static, BackendResult<()>>);

pub struct Saga {
    operation: &'static str,
    service: String,
    compensations: Vec<Compensation>,
}

impl Saga {
    pub fn new(operation: &'static str, service: &str) -> Self {
        Self {
            operation,
            service: service.to_string(),
            compensations: Vec::new(),
        }
    }

    /// Await `action`. On failure, roll back every registered compensation
    /// and return the action's error.
    pub async fn step<T, E>(&mut self, action: impl Future<Output = Result<T, E>>) -> BackendResult<T>
    where
        E: Into<BackendError>,
    {
        match action.await {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = e.into();
                self.rollback(&err).await;
                Err(err)
            }
        }
    }

    /// Register the undo action of the step that just committed.
    pub fn compensate<F, E>(&mut self, label: &'static str, undo: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BackendError>,
    {
        self.compensations
            .push((label, Box::pin(async move { undo.await.map_err(Into::into) })));
    }

    /// Every step succeeded; forget the compensations.
    pub fn commit(mut self) {
        self.compensations.clear();
        debug!(operation = self.operation, service = %self.service, "saga committed");
    }

    pub fn pending(&self) -> usize {
        self.compensations.len()
    }

    async fn rollback(&mut self, cause: &BackendError) {
        if self.compensations.is_empty() {
            return;
        }
        warn!(
            operation = self.operation,
            service = %self.service,
            error = %cause,
            compensations = self.compensations.len(),
            "rolling back"
        );
        let task = tokio::spawn(run_compensations(
            self.operation,
            self.service.clone(),
            std::mem::take(&mut self.compensations),
        ));
        if let Err(e) = task.await {
            error!(operation = self.operation, service = %self.service, error = %e, "rollback task failed");
        }
    }
}

async fn run_compensations(
    operation: &'static str,
    service: String,
    compensations: Vec<Compensation>,
) {
    for (label, undo) in compensations.into_iter().rev() {
        match undo.await {
            Ok(()) => debug!(operation, service = %service, step = label, "compensated"),
            Err(e) => warn!(
                operation,
                service = %service,
                step = label,
                error = %e,
                "compensation failed"
            ),
        }
    }
}

impl Drop for Saga {
    fn drop(&mut self) {
        if self.compensations.is_empty() {
            return;
        }
        warn!(
            operation = self.operation,
            service = %self.service,
            "saga dropped before commit, rolling back"
        );
        let compensations = std::mem::take(&mut self.compensations);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(run_compensations(
                    self.operation,
                    self.service.clone(),
                    compensations,
                ));
            }
            Err(_) => error!(service = %self.service, "no runtime to roll back on"),
        }
    }
}

/// Await a cleanup step whose failure must not fail the operation.
pub async fn best_effort<T, E: Display>(
    step: &'static str,
    service: &str,
    action: impl Future<Output = Result<T, E>>,
) -> Option<T> {
    match action.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(service = %service, step, error = %e, "best-effort cleanup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn undo(
        log: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        fail: bool,
    ) -> impl Future<Output = BackendResult<()>> + Send + 'static {
        async move {
            log.lock().unwrap().push(label);
            if fail {
                Err(BackendError::BackendUnavailable(format!("{label} failed")))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn compensations_run_in_reverse() {
        let log = recorder();
        let mut saga = Saga::new("create", "s1");
        saga.step(async { Ok::<_, BackendError>(()) }).await.unwrap();
        saga.compensate("first", undo(log.clone(), "first", false));
        saga.step(async { Ok::<_, BackendError>(()) }).await.unwrap();
        saga.compensate("second", undo(log.clone(), "second", false));

        let err = saga
            .step(async { Err::<(), _>(BackendError::BackendUnavailable("boom".to_string())) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backend unavailable: boom");
        assert_eq!(*log.lock().unwrap(), ["second", "first"]);
        assert_eq!(saga.pending(), 0);
    }

    #[tokio::test]
    async fn compensation_failure_does_not_mask_the_cause() {
        let log = recorder();
        let mut saga = Saga::new("create", "s1");
        saga.compensate("a", undo(log.clone(), "a", false));
        saga.compensate("b", undo(log.clone(), "b", true));

        let err = saga
            .step(async { Err::<(), _>(BackendError::NotFound("gone".to_string())) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "gone");
        assert_eq!(*log.lock().unwrap(), ["b", "a"]);
    }

    #[tokio::test]
    async fn commit_discards_compensations() {
        let log = recorder();
        let mut saga = Saga::new("update", "s1");
        saga.compensate("restore", undo(log.clone(), "restore", false));
        saga.commit();
        tokio::task::yield_now().await;
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_saga_rolls_back() {
        let log = recorder();
        {
            let mut saga = Saga::new("create", "s1");
            saga.compensate("only", undo(log.clone(), "only", false));
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock().unwrap(), ["only"]);
    }

    #[tokio::test]
    async fn best_effort_swallows_errors() {
        let ok = best_effort("noop", "s1", async { Ok::<_, BackendError>(3) }).await;
        assert_eq!(ok, Some(3));
        let failed = best_effort("noop", "s1", async {
            Err::<(), _>(BackendError::BackendUnavailable("down".to_string()))
        })
        .await;
        assert!(failed.is_none());
    }
}
