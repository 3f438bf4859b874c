//! Background tasks with an explicit cancel step and an explicit await step.

use std::{future::Future, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

/// How a managed task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    /// The task returned on its own.
    Completed,
    /// The task observed cancellation and returned.
    Cancelled,
    /// The task ignored cancellation for the whole grace period.
    Aborted,
    Panicked,
}

/// A spawned task paired with the token it watches for cancellation.
#[derive(Debug)]
pub struct ManagedTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ManagedTask {
    /// Spawns `f` in the current span, handing it the task's cancellation token.
    pub fn spawn<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(f(token.clone()).in_current_span());
        Self {
            name,
            token,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Requests cancellation without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task to end.
    pub async fn join(self) -> TaskExit {
        match self.handle.await {
            Ok(()) if self.token.is_cancelled() => TaskExit::Cancelled,
            Ok(()) => TaskExit::Completed,
            Err(e) if e.is_panic() => {
                warn!(task = self.name, "Task panicked.");
                TaskExit::Panicked
            }
            Err(_) => TaskExit::Cancelled,
        }
    }

    /// Cancels the task if it is still running and waits up to `grace` for it
    /// to finish, aborting it after that. A finished task is only joined.
    pub async fn shutdown(self, grace: Duration) -> TaskExit {
        let name = self.name;
        if self.is_finished() {
            return self.join().await;
        }
        self.cancel();
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(grace, self.join()).await {
            Ok(exit) => {
                debug!(task = name, ?exit, "Task shut down.");
                exit
            }
            Err(_) => {
                warn!(task = name, "Task ignored cancellation. Aborting.");
                abort.abort();
                TaskExit::Aborted
            }
        }
    }
}
