//! Manages the WebSocket connection lifecycle for a relay session.

use super::{
    client_pump::ClientPump,
    outbound::{ClientChannel, OUTBOUND_CAPACITY, forward_to_client},
    protocol::{ServerMessage, parse_setup},
    supervisor::{SHUTDOWN_GRACE, Supervisor},
    task::ManagedTask,
    tool_queue::tool_call_queue,
    upstream_pump::UpstreamPump,
};
use crate::{
    error::{ErrorClass, RelayError},
    registry::{SessionRegistry, SessionState},
    state::AppState,
};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Sink, Stream, StreamExt};
use relay_core::{SessionOptions, UpstreamError};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (socket_tx, socket_rx) = socket.split();
    run_connection(state, socket_rx, socket_tx).await;
}

/// Drives one connection from accept to cleanup.
///
/// `INITIAL → AWAIT_SETUP → ACTIVE → CLEANUP → CLOSED`; a missing, invalid or
/// late setup message skips straight to cleanup without opening an upstream
/// session.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
pub async fn run_connection<S, W>(state: Arc<AppState>, stream: S, sink: W)
where
    S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
    W: Sink<Message> + Send + Unpin + 'static,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", &session_id.to_string());
    let session = match state.registry.create(session_id) {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Failed to register session.");
            return;
        }
    };
    info!(active_sessions = state.registry.len(), "New WebSocket connection.");

    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer = tokio::spawn(forward_to_client(rx, sink).in_current_span());
    let client = ClientChannel::new(tx);

    if let Err(e) = run_session(&state, &session, &client, stream).await {
        report_failure(&client, &e).await;
    }

    let report = cleanup(&state.registry, &session).await;
    debug!(?report, "Cleanup finished.");
    drop(client);
    if let Err(e) = writer.await {
        warn!(error = %e, "Client writer task failed.");
    }
    info!("WebSocket connection closed.");
}

async fn run_session<S>(
    state: &AppState,
    session: &Arc<SessionState>,
    client: &ClientChannel,
    mut stream: S,
) -> Result<(), RelayError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
{
    client.send(ServerMessage::Ready).await?;
    let options = await_setup(&mut stream, state.config.setup_timeout).await?;
    session.set_modality(options.modality);
    info!(
        modality = %options.modality,
        input_transcription = options.input_transcription,
        output_transcription = options.output_transcription,
        resuming = options.resumption_handle.is_some(),
        "Setup received. Opening upstream session."
    );

    let handle = state
        .upstream_factory
        .open(&options)
        .await
        .map_err(|e| match e {
            UpstreamError::Configuration(reason) => RelayError::Configuration(reason),
            other => other.into(),
        })?;
    let upstream = handle.session();
    if session.attach_upstream(handle).is_err() {
        return Err(RelayError::Unexpected(anyhow::anyhow!(
            "session already has an upstream handle"
        )));
    }
    info!("Upstream session open.");

    let (tool_queue, worker) = tool_call_queue(
        session.clone(),
        client.clone(),
        upstream.clone(),
        state.tool_executor.clone(),
    );
    session.set_tool_worker(ManagedTask::spawn("tool_worker", |token| worker.run(token)));

    let client_pump = ClientPump::new(stream, upstream.clone(), state.config.idle_timeout);
    let upstream_pump = UpstreamPump::new(
        session.clone(),
        upstream,
        tool_queue,
        client.clone(),
        state.audio_sink.clone(),
    );
    Supervisor::new(client.clone())
        .run(client_pump, upstream_pump)
        .await
}

/// Waits for the one-time setup message.
async fn await_setup<S>(stream: &mut S, limit: Duration) -> Result<SessionOptions, RelayError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let text = tokio::time::timeout(limit, next_text(stream))
        .await
        .map_err(|_| {
            RelayError::Timeout(format!("no setup message within {}s", limit.as_secs_f32()))
        })??;
    parse_setup(&text)
}

async fn next_text<S>(stream: &mut S) -> Result<String, RelayError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
            Some(Ok(Message::Binary(_))) => {
                return Err(RelayError::Setup("setup must be a text message".to_string()));
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(RelayError::ConnectionClosed(
                    "client disconnected before setup".to_string(),
                ));
            }
            Some(Err(e)) => {
                return Err(RelayError::ConnectionClosed(format!(
                    "client connection closed before setup: {e}"
                )));
            }
        }
    }
}

/// Logs a session failure and tells the client, if it is still there.
async fn report_failure(client: &ClientChannel, err: &RelayError) {
    let class = err.classify();
    match class {
        ErrorClass::ConnectionClosed => info!(reason = %err, "Client connection closed."),
        ErrorClass::Setup | ErrorClass::Configuration | ErrorClass::Timeout => {
            warn!(?class, error = %err, "Session ended.")
        }
        _ => error!(?class, error = ?err, "Session failed."),
    }
    if let Err(e) = client.send_error(class).await {
        debug!(error = %e, "Could not deliver the error to the client.");
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub tool_cancelled: bool,
    pub upstream_closed: bool,
}

/// Releases everything a session holds. Runs once per session; later calls
/// return an empty report. Never fails.
pub async fn cleanup(registry: &SessionRegistry, session: &SessionState) -> CleanupReport {
    if !session.begin_cleanup() {
        debug!("Session already cleaned up.");
        return CleanupReport::default();
    }

    let tool_cancelled = session.cancel_tool_execution().await;
    if let Some(worker) = session.take_tool_worker() {
        worker.shutdown(SHUTDOWN_GRACE).await;
    }

    let upstream_closed = match session.upstream() {
        Some(handle) => match handle.close().await {
            Ok(closed) => closed,
            Err(e) => {
                warn!(error = %e, "Failed to close upstream session.");
                true
            }
        },
        None => false,
    };

    registry.remove(&session.session_id);
    info!(tool_cancelled, upstream_closed, "Session cleaned up.");
    CleanupReport {
        tool_cancelled,
        upstream_closed,
    }
}
