//! Runs a session's two pumps side by side and decides how the session ends.

use super::{outbound::ClientChannel, task::ManagedTask};
use crate::error::{ErrorClass, RelayError};
use anyhow::anyhow;
use async_trait::async_trait;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Quota failures a session may recover from before the next one is fatal.
pub const MAX_QUOTA_RECOVERIES: u32 = 3;

/// How long a pump gets to observe cancellation before it is aborted.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A long-running loop that moves messages in one direction.
///
/// `run` returns `Ok` when its source ends or `token` is cancelled.
#[async_trait]
pub trait Pump: Send + 'static {
    const NAME: &'static str;

    async fn run(&mut self, token: &CancellationToken) -> Result<(), RelayError>;

    /// Discards in-flight state before the pump is restarted.
    fn reset(&mut self) {}
}

#[derive(Debug)]
struct PumpExit {
    pump: &'static str,
    result: Result<(), RelayError>,
}

/// Reports a pump's exit into the fan-in channel, even if the pump panics
/// or is aborted.
struct ExitReporter {
    pump: &'static str,
    tx: mpsc::Sender<PumpExit>,
    result: Option<Result<(), RelayError>>,
}

impl ExitReporter {
    fn report(mut self, result: Result<(), RelayError>) {
        self.result = Some(result);
    }
}

impl Drop for ExitReporter {
    fn drop(&mut self) {
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(anyhow!("{} stopped without reporting", self.pump).into()));
        // Only the first exit is read; later ones may find the receiver gone.
        let _ = self.tx.try_send(PumpExit {
            pump: self.pump,
            result,
        });
    }
}

/// Supervises the client and upstream pumps of one session.
pub struct Supervisor {
    client: ClientChannel,
    quota_recoveries: Arc<AtomicU32>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(client: ClientChannel) -> Self {
        Self {
            client,
            quota_recoveries: Arc::new(AtomicU32::new(0)),
            grace: SHUTDOWN_GRACE,
        }
    }

    /// Runs both pumps until the first one exits, then stops the other.
    ///
    /// A normal exit or a closed connection ends the session with `Ok`; any
    /// other failure is returned for the caller to report.
    pub async fn run<A: Pump, B: Pump>(&self, first: A, second: B) -> Result<(), RelayError> {
        let (tx, mut exits) = mpsc::channel(2);
        let tasks = [
            self.spawn(first, tx.clone()),
            self.spawn(second, tx),
        ];

        let outcome = match exits.recv().await {
            Some(PumpExit { pump, result: Ok(()) }) => {
                info!(pump, "Pump finished. Ending session.");
                Ok(())
            }
            Some(PumpExit {
                pump,
                result: Err(e),
            }) => match e.classify() {
                ErrorClass::ConnectionClosed => {
                    info!(pump, reason = %e, "Connection closed. Ending session.");
                    Ok(())
                }
                class => {
                    error!(pump, ?class, error = ?e, "Pump failed.");
                    Err(e)
                }
            },
            None => Err(anyhow!("pumps exited without reporting").into()),
        };

        for task in tasks {
            let name = task.name();
            let exit = task.shutdown(self.grace).await;
            info!(task = name, ?exit, "Pump stopped.");
        }
        outcome
    }

    fn spawn<P: Pump>(&self, pump: P, tx: mpsc::Sender<PumpExit>) -> ManagedTask {
        let client = self.client.clone();
        let recoveries = self.quota_recoveries.clone();
        ManagedTask::spawn(P::NAME, move |token| drive(pump, token, client, recoveries, tx))
    }
}

/// Runs `pump`, restarting it after a recoverable quota failure.
async fn drive<P: Pump>(
    mut pump: P,
    token: CancellationToken,
    client: ClientChannel,
    recoveries: Arc<AtomicU32>,
    tx: mpsc::Sender<PumpExit>,
) {
    let reporter = ExitReporter {
        pump: P::NAME,
        tx,
        result: None,
    };
    let result = loop {
        match pump.run(&token).await {
            Err(e) if e.classify() == ErrorClass::QuotaExceeded && !token.is_cancelled() => {
                let attempt = recoveries.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > MAX_QUOTA_RECOVERIES {
                    error!(pump = P::NAME, error = %e, "Quota still exhausted. Giving up.");
                    break Err(RelayError::Unexpected(anyhow!(
                        "upstream quota recovery limit of {MAX_QUOTA_RECOVERIES} reached"
                    )));
                }
                warn!(pump = P::NAME, attempt, error = %e, "Quota exceeded. Notifying client and continuing.");
                if let Err(e) = client.send_error(ErrorClass::QuotaExceeded).await {
                    break Err(e);
                }
                pump.reset();
            }
            other => break other,
        }
    };
    reporter.report(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::QUOTA_EXCEEDED_TEXT, ws::protocol::ServerMessage};
    use relay_core::UpstreamError;
    use std::{collections::VecDeque, sync::atomic::AtomicBool};

    /// Returns scripted results one per run, then waits for cancellation.
    struct ScriptedPump {
        results: VecDeque<Result<(), RelayError>>,
        resets: Arc<AtomicU32>,
    }

    impl ScriptedPump {
        fn new(results: Vec<Result<(), RelayError>>) -> (Self, Arc<AtomicU32>) {
            let resets = Arc::new(AtomicU32::new(0));
            (
                Self {
                    results: results.into(),
                    resets: resets.clone(),
                },
                resets,
            )
        }
    }

    #[async_trait]
    impl Pump for ScriptedPump {
        const NAME: &'static str = "scripted";

        async fn run(&mut self, token: &CancellationToken) -> Result<(), RelayError> {
            match self.results.pop_front() {
                Some(result) => result,
                None => {
                    token.cancelled().await;
                    Ok(())
                }
            }
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Runs until cancelled and records that it saw the cancellation.
    struct IdlePump {
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Pump for IdlePump {
        const NAME: &'static str = "idle";

        async fn run(&mut self, token: &CancellationToken) -> Result<(), RelayError> {
            token.cancelled().await;
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn idle() -> (IdlePump, Arc<AtomicBool>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            IdlePump {
                cancelled: cancelled.clone(),
            },
            cancelled,
        )
    }

    fn quota() -> Result<(), RelayError> {
        Err(UpstreamError::Closed {
            code: 1011,
            reason: "Quota exceeded for requests per minute".to_string(),
        }
        .into())
    }

    fn supervisor() -> (Supervisor, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(32);
        (Supervisor::new(ClientChannel::new(tx)), rx)
    }

    #[tokio::test]
    async fn normal_exit_cancels_the_other_pump() {
        let (supervisor, _rx) = supervisor();
        let (pump, _) = ScriptedPump::new(vec![Ok(())]);
        let (other, cancelled) = idle();

        supervisor.run(pump, other).await.unwrap();

        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closed_connection_ends_gracefully() {
        let (supervisor, mut rx) = supervisor();
        let (pump, _) = ScriptedPump::new(vec![Err(RelayError::ConnectionClosed(
            "client went away".to_string(),
        ))]);
        let (other, cancelled) = idle();

        supervisor.run(other, pump).await.unwrap();

        assert!(cancelled.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn quota_is_reported_and_the_pump_restarts() {
        let (supervisor, mut rx) = supervisor();
        let (pump, resets) = ScriptedPump::new(vec![quota(), Ok(())]);
        let (other, _) = idle();

        supervisor.run(pump, other).await.unwrap();

        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Error(p)) if p.error_type == "quota_exceeded"));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::Text(QUOTA_EXCEEDED_TEXT.to_string())
        );
    }

    #[tokio::test]
    async fn repeated_quota_failures_become_fatal() {
        let (supervisor, _rx) = supervisor();
        let (pump, resets) = ScriptedPump::new(vec![quota(), quota(), quota(), quota()]);
        let (other, cancelled) = idle();

        let err = supervisor.run(pump, other).await.unwrap_err();

        assert_eq!(err.classify(), ErrorClass::Unexpected);
        assert_eq!(resets.load(Ordering::SeqCst), MAX_QUOTA_RECOVERIES);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn timeout_propagates() {
        let (supervisor, _rx) = supervisor();
        let (pump, _) = ScriptedPump::new(vec![Err(RelayError::Timeout("idle".to_string()))]);
        let (other, _) = idle();

        let err = supervisor.run(pump, other).await.unwrap_err();

        assert_eq!(err.classify(), ErrorClass::Timeout);
    }
}
