//! Per-connection session state and the registry of active sessions.

use crate::ws::task::ManagedTask;
use parking_lot::Mutex;
use relay_core::{ResponseModality, UpstreamHandle, UpstreamSession};
use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session {0} is already registered")]
    Duplicate(Uuid),
}

/// Concurrency-safe store of active sessions, keyed by connection id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<SessionState>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session. Fails if `id` is already present.
    pub fn create(&self, id: Uuid) -> Result<Arc<SessionState>, RegistryError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        let session = Arc::new(SessionState::new(id));
        sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Removes a session. Returns whether it was present.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.sessions.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// The tool call currently running for a session.
#[derive(Debug)]
struct ToolExecution {
    call_id: String,
    name: String,
    token: CancellationToken,
    finished: watch::Receiver<bool>,
}

/// Everything the relay tracks for one client connection.
///
/// The turn's audio buffer is not stored here: it is owned outright by the
/// session's content processor, its only writer.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: Uuid,
    modality: OnceLock<ResponseModality>,
    upstream: OnceLock<UpstreamHandle>,
    is_receiving_response: AtomicBool,
    received_model_response: AtomicBool,
    current_tool_execution: Mutex<Option<ToolExecution>>,
    resumption_handle: Mutex<Option<String>>,
    tool_worker: Mutex<Option<ManagedTask>>,
    cleaned_up: AtomicBool,
}

impl SessionState {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            modality: OnceLock::new(),
            upstream: OnceLock::new(),
            is_receiving_response: AtomicBool::new(false),
            received_model_response: AtomicBool::new(false),
            current_tool_execution: Mutex::new(None),
            resumption_handle: Mutex::new(None),
            tool_worker: Mutex::new(None),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Records the negotiated modality. Only the first call has an effect.
    pub fn set_modality(&self, modality: ResponseModality) {
        if self.modality.set(modality).is_err() {
            warn!("Response modality is already set; ignoring.");
        }
    }

    pub fn modality(&self) -> ResponseModality {
        self.modality.get().copied().unwrap_or_default()
    }

    /// Takes ownership of the session's upstream handle. A second handle is
    /// handed back to the caller.
    pub fn attach_upstream(&self, handle: UpstreamHandle) -> Result<(), UpstreamHandle> {
        self.upstream.set(handle)
    }

    pub fn upstream(&self) -> Option<&UpstreamHandle> {
        self.upstream.get()
    }

    pub fn upstream_session(&self) -> Option<Arc<dyn UpstreamSession>> {
        self.upstream.get().map(UpstreamHandle::session)
    }

    pub fn is_receiving_response(&self) -> bool {
        self.is_receiving_response.load(Ordering::SeqCst)
    }

    pub fn set_receiving_response(&self, receiving: bool) {
        self.is_receiving_response.store(receiving, Ordering::SeqCst);
    }

    pub fn received_model_response(&self) -> bool {
        self.received_model_response.load(Ordering::SeqCst)
    }

    /// Marks the upstream as mid-turn.
    pub fn mark_model_response(&self) {
        self.received_model_response.store(true, Ordering::SeqCst);
        self.is_receiving_response.store(true, Ordering::SeqCst);
    }

    pub fn reset_turn_flags(&self) {
        self.received_model_response.store(false, Ordering::SeqCst);
        self.is_receiving_response.store(false, Ordering::SeqCst);
    }

    pub fn resumption_handle(&self) -> Option<String> {
        self.resumption_handle.lock().clone()
    }

    pub fn set_resumption_handle(&self, handle: String) {
        *self.resumption_handle.lock() = Some(handle);
    }

    /// Records `call_id` as the running tool call until the guard is dropped.
    pub fn begin_tool_execution(
        &self,
        call_id: &str,
        name: &str,
        token: CancellationToken,
    ) -> ToolExecutionGuard<'_> {
        let (finished_tx, finished) = watch::channel(false);
        let previous = self.current_tool_execution.lock().replace(ToolExecution {
            call_id: call_id.to_string(),
            name: name.to_string(),
            token,
            finished,
        });
        if let Some(previous) = previous {
            warn!(call_id = %previous.call_id, "Previous tool execution was never cleared.");
        }
        ToolExecutionGuard {
            session: self,
            call_id: call_id.to_string(),
            finished_tx,
        }
    }

    pub fn current_tool_call(&self) -> Option<String> {
        self.current_tool_execution
            .lock()
            .as_ref()
            .map(|exec| exec.call_id.clone())
    }

    fn take_tool_execution(&self) -> Option<ToolExecution> {
        self.current_tool_execution.lock().take()
    }

    /// Cancels the running tool call, if any, and waits until it has stopped.
    /// The tool worker is cancelled too, so no later call of the batch starts
    /// and no batch response is sent.
    ///
    /// Returns `true` only for the caller that performed the cancellation.
    pub async fn cancel_tool_execution(&self) -> bool {
        let execution = self.take_tool_execution();
        if let Some(worker) = self.tool_worker.lock().as_ref() {
            worker.cancel();
        }
        let Some(mut execution) = execution else {
            return false;
        };
        debug!(call_id = %execution.call_id, tool = %execution.name, "Cancelling tool execution.");
        execution.token.cancel();
        // The sender is dropped with the guard, which also ends the wait.
        let _ = execution.finished.wait_for(|finished| *finished).await;
        true
    }

    /// Cancels the running tool call if the upstream withdrew its id.
    pub fn cancel_tool_calls(&self, ids: &[String]) -> bool {
        let current = self.current_tool_execution.lock();
        match current.as_ref() {
            Some(exec) if ids.contains(&exec.call_id) => {
                debug!(call_id = %exec.call_id, "Upstream withdrew the running tool call.");
                exec.token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn set_tool_worker(&self, worker: ManagedTask) {
        if let Some(previous) = self.tool_worker.lock().replace(worker) {
            warn!("Replacing an existing tool worker.");
            previous.cancel();
        }
    }

    pub fn take_tool_worker(&self) -> Option<ManagedTask> {
        self.tool_worker.lock().take()
    }

    /// Returns `true` the first time it is called.
    pub fn begin_cleanup(&self) -> bool {
        !self.cleaned_up.swap(true, Ordering::SeqCst)
    }
}

/// Clears the running tool call and signals that it finished when dropped.
pub struct ToolExecutionGuard<'a> {
    session: &'a SessionState,
    call_id: String,
    finished_tx: watch::Sender<bool>,
}

impl Drop for ToolExecutionGuard<'_> {
    fn drop(&mut self) {
        let mut current = self.session.current_tool_execution.lock();
        if current
            .as_ref()
            .is_some_and(|exec| exec.call_id == self.call_id)
        {
            *current = None;
        }
        drop(current);
        self.finished_tx.send_replace(true);
    }
}
