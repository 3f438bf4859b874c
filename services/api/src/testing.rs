//! Test doubles shared by the relay's unit tests.

use crate::{
    config::{Config, FunctionUrls},
    registry::SessionRegistry,
    state::AppState,
};
use async_trait::async_trait;
use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{
    StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
};
use mockall::mock;
use parking_lot::Mutex;
use relay_core::{
    AudioSink, AudioSinkError, SessionOptions, ToolError, ToolExecutor, UpstreamError,
    UpstreamFactory, UpstreamHandle, UpstreamInput, UpstreamResponse, UpstreamSession,
};
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Notify, mpsc};
use tracing::Level;

pub(crate) const WAIT: Duration = Duration::from_secs(2);

type ResponseItem = Result<UpstreamResponse, UpstreamError>;

/// An upstream session whose responses are fed by the test and whose sends
/// are recorded.
pub(crate) struct FakeUpstream {
    sent: Mutex<Vec<(UpstreamInput, bool)>>,
    sent_notify: Notify,
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<ResponseItem>>,
    close_calls: AtomicUsize,
}

impl FakeUpstream {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedSender<ResponseItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fake = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
            responses: tokio::sync::Mutex::new(rx),
            close_calls: AtomicUsize::new(0),
        });
        (fake, tx)
    }

    pub(crate) fn sent(&self) -> Vec<(UpstreamInput, bool)> {
        self.sent.lock().clone()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` inputs were sent, then returns them all.
    pub(crate) async fn wait_for_sends(&self, count: usize) -> Vec<(UpstreamInput, bool)> {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.sent_notify.notified();
                let sent = self.sent();
                if sent.len() >= count {
                    return sent;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} upstream sends, got {:?}", self.sent()))
    }
}

#[async_trait]
impl UpstreamSession for FakeUpstream {
    async fn send(&self, input: UpstreamInput, end_of_turn: bool) -> Result<(), UpstreamError> {
        self.sent.lock().push((input, end_of_turn));
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> Option<ResponseItem> {
        self.responses.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens handles onto one shared [`FakeUpstream`], or fails on demand.
pub(crate) struct FakeFactory {
    upstream: Arc<FakeUpstream>,
    fail_with: Option<fn() -> UpstreamError>,
    opens: AtomicUsize,
    options: Mutex<Vec<SessionOptions>>,
}

impl FakeFactory {
    pub(crate) fn new(upstream: Arc<FakeUpstream>) -> Self {
        Self {
            upstream,
            fail_with: None,
            opens: AtomicUsize::new(0),
            options: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(upstream: Arc<FakeUpstream>, fail_with: fn() -> UpstreamError) -> Self {
        Self {
            fail_with: Some(fail_with),
            ..Self::new(upstream)
        }
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn options(&self) -> Vec<SessionOptions> {
        self.options.lock().clone()
    }
}

#[async_trait]
impl UpstreamFactory for FakeFactory {
    async fn open(&self, options: &SessionOptions) -> Result<UpstreamHandle, UpstreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.options.lock().push(options.clone());
        if let Some(fail_with) = self.fail_with {
            return Err(fail_with());
        }
        Ok(UpstreamHandle::new(self.upstream.clone()))
    }
}

mock! {
    pub Executor {}

    #[async_trait]
    impl ToolExecutor for Executor {
        async fn execute(&self, name: &str, args: &Value) -> Result<Value, ToolError>;
    }
}

/// A tool executor that never returns.
pub(crate) struct BlockingExecutor {
    pub(crate) started: Notify,
    calls: AtomicUsize,
}

impl BlockingExecutor {
    pub(crate) fn new() -> Self {
        Self {
            started: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolExecutor for BlockingExecutor {
    async fn execute(&self, _name: &str, _args: &Value) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        std::future::pending().await
    }
}

/// Records every flush as the session id and the joined audio bytes.
#[derive(Default)]
pub(crate) struct RecordingSink {
    flushes: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingSink {
    pub(crate) fn flushes(&self) -> Vec<(String, Vec<u8>)> {
        self.flushes.lock().clone()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn flush(&self, session_id: &str, chunks: &[Bytes]) -> Result<(), AudioSinkError> {
        let joined = chunks.iter().flat_map(|chunk| chunk.to_vec()).collect();
        self.flushes.lock().push((session_id.to_string(), joined));
        Ok(())
    }
}

pub(crate) fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().expect("valid address"),
        log_level: Level::DEBUG,
        google_api_key: None,
        live_endpoint: "ws://127.0.0.1:9".to_string(),
        model: "models/test".to_string(),
        voice: "Puck".to_string(),
        system_instructions_path: "missing/system-instructions.txt".into(),
        audio_output_dir: std::env::temp_dir(),
        setup_timeout: Duration::from_millis(200),
        idle_timeout: Duration::from_secs(5),
        function_urls: FunctionUrls::default(),
    }
}

pub(crate) fn test_state(
    config: Config,
    factory: Arc<dyn UpstreamFactory>,
    executor: Arc<dyn ToolExecutor>,
    sink: Arc<dyn AudioSink>,
) -> Arc<AppState> {
    Arc::new(AppState {
        config: Arc::new(config),
        registry: Arc::new(SessionRegistry::new()),
        upstream_factory: factory,
        tool_executor: executor,
        audio_sink: sink,
    })
}

/// The client side of a connection driven without a real socket.
pub(crate) struct FakeClient {
    pub(crate) tx: UnboundedSender<Result<Message, axum::Error>>,
    pub(crate) rx: UnboundedReceiver<Message>,
}

impl FakeClient {
    /// Returns the client and the (stream, sink) pair to hand to the relay.
    pub(crate) fn new() -> (
        Self,
        UnboundedReceiver<Result<Message, axum::Error>>,
        UnboundedSender<Message>,
    ) {
        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        (Self { tx: in_tx, rx: out_rx }, in_rx, out_tx)
    }

    pub(crate) fn send(&self, value: Value) {
        self.tx
            .unbounded_send(Ok(Message::Text(value.to_string().into())))
            .expect("relay dropped the client stream");
    }

    /// The next JSON message from the relay, or `None` once it hung up.
    pub(crate) async fn next(&mut self) -> Option<Value> {
        let frame = tokio::time::timeout(WAIT, self.rx.next())
            .await
            .expect("timed out waiting for the relay")?;
        match frame {
            Message::Text(text) => Some(serde_json::from_str(text.as_str()).expect("valid JSON")),
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
