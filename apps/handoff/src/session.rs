//! One user-initiated attempt from first code to delivered snapshot, and the
//! controller that keeps at most one of them alive.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bootstrap::{BootstrapState, ConnectionBootstrap, Role};
use crate::config::TransferConfig;
use crate::error::{HandoffError, Result};
use crate::progress::ProgressTracker;
use crate::snapshot::{Snapshot, SnapshotSink};
use crate::transfer::{ReceiveReport, SendReport, receive_snapshot, send_snapshot};
use crate::transport::{DataChannel, PeerConnector};

/// Attempt-scoped identifiers for the user-facing layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub role: Role,
    pub state: BootstrapState,
    pub started_at: OffsetDateTime,
    pub file_name: Option<String>,
    pub total_bytes: Option<u64>,
    pub progress: u8,
    pub last_error: Option<String>,
}

pub struct TransferSession {
    id: Uuid,
    role: Role,
    started_at: OffsetDateTime,
    config: TransferConfig,
    bootstrap: ConnectionBootstrap,
    progress: ProgressTracker,
    details: Mutex<(Option<String>, Option<u64>)>,
}

impl TransferSession {
    pub fn new(role: Role, connector: Arc<dyn PeerConnector>, config: TransferConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            started_at: OffsetDateTime::now_utc(),
            bootstrap: ConnectionBootstrap::new(role, connector, config.clone()),
            config,
            progress: ProgressTracker::new(),
            details: Mutex::new((None, None)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn bootstrap(&self) -> &ConnectionBootstrap {
        &self.bootstrap
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.bootstrap.state().is_terminal()
    }

    pub fn info(&self) -> SessionInfo {
        let (file_name, total_bytes) = self.details.lock().clone();
        SessionInfo {
            id: self.id,
            role: self.role,
            state: self.bootstrap.state(),
            started_at: self.started_at,
            file_name,
            total_bytes,
            progress: self.progress.current(),
            last_error: self.bootstrap.last_error(),
        }
    }

    pub async fn start_offer(&self) -> Result<String> {
        self.bootstrap.start_offer().await
    }

    pub async fn accept_answer(&self, text: &str) -> Result<()> {
        self.bootstrap.accept_answer(text).await
    }

    pub async fn accept_offer(&self, text: &str) -> Result<String> {
        self.bootstrap.accept_offer(text).await
    }

    /// Receiver: waits for the channel, reassembles the snapshot, hands it to
    /// `sink` and releases the connection.
    pub async fn receive(&self, sink: &dyn SnapshotSink) -> Result<ReceiveReport> {
        let channel = self.bootstrap.wait_channel().await?;
        let cancel = self.bootstrap.cancellation();
        let result = receive_snapshot(channel.as_ref(), sink, &self.progress, &cancel).await;
        if let Ok(report) = &result {
            *self.details.lock() = (Some(report.file_name.clone()), Some(report.bytes as u64));
        }
        self.finish(result).await
    }

    /// Sender: waits for the channel, streams `snapshot`, waits for it to
    /// leave the local buffer and releases the connection.
    pub async fn send(&self, snapshot: &Snapshot) -> Result<SendReport> {
        *self.details.lock() = (Some(snapshot.file_name.clone()), Some(snapshot.len() as u64));
        let channel = self.bootstrap.wait_channel().await?;
        let cancel = self.bootstrap.cancellation();
        let mut result =
            send_snapshot(channel.as_ref(), snapshot, &self.config, &self.progress, &cancel).await;
        if result.is_ok() {
            if let Err(err) = cancel.guard(self.drain(channel.as_ref())).await {
                result = Err(err);
            }
        }
        self.finish(result).await
    }

    pub async fn cancel(&self) {
        self.bootstrap.cancel().await;
    }

    async fn drain(&self, channel: &dyn DataChannel) -> Result<()> {
        let limit = self.config.channel_open_timeout;
        let drained = tokio::time::timeout(limit, async {
            while channel.is_open() && channel.buffered_amount().await > 0 {
                tokio::time::sleep(self.config.buffered_poll_interval).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                target = "handoff::session",
                session_id = %self.id,
                after = ?limit,
                "channel still buffered at close"
            );
        }
        Ok(())
    }

    async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                info!(
                    target = "handoff::session",
                    session_id = %self.id,
                    role = %self.role,
                    elapsed = ?elapsed_since(self.started_at),
                    "transfer finished"
                );
                self.bootstrap.close().await;
            }
            Err(HandoffError::UserCancelled) => self.bootstrap.close().await,
            Err(err) => self.bootstrap.abort(err).await,
        }
        result
    }
}

fn elapsed_since(started_at: OffsetDateTime) -> Duration {
    let elapsed = OffsetDateTime::now_utc() - started_at;
    elapsed.try_into().unwrap_or_default()
}

/// Hands out sessions, tearing down the previous one first.
pub struct SessionController {
    connector: Arc<dyn PeerConnector>,
    config: TransferConfig,
    active: Mutex<Option<Arc<TransferSession>>>,
    /// Held across the whole of `begin` so overlapping calls cannot both
    /// install a session.
    handover: AsyncMutex<()>,
}

impl SessionController {
    pub fn new(connector: Arc<dyn PeerConnector>, config: TransferConfig) -> Self {
        Self {
            connector,
            config,
            active: Mutex::new(None),
            handover: AsyncMutex::new(()),
        }
    }

    pub async fn begin(&self, role: Role) -> Arc<TransferSession> {
        let _handover = self.handover.lock().await;
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            if !previous.is_finished() {
                debug!(
                    target = "handoff::session",
                    session_id = %previous.id(),
                    "tearing down active session"
                );
            }
            previous.cancel().await;
        }
        let session = Arc::new(TransferSession::new(
            role,
            self.connector.clone(),
            self.config.clone(),
        ));
        let displaced = self.active.lock().replace(session.clone());
        if let Some(displaced) = displaced {
            displaced.cancel().await;
        }
        debug!(
            target = "handoff::session",
            session_id = %session.id(),
            role = %role,
            "session started"
        );
        session
    }

    /// The current session, unless it has already ended.
    pub fn active(&self) -> Option<Arc<TransferSession>> {
        self.active
            .lock()
            .as_ref()
            .filter(|session| !session.is_finished())
            .cloned()
    }

    pub async fn cancel_active(&self) {
        let session = self.active.lock().take();
        if let Some(session) = session {
            session.cancel().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySink;
    use crate::transport::loopback::LoopbackConnector;

    fn controller(connector: &LoopbackConnector) -> SessionController {
        SessionController::new(Arc::new(connector.clone()), TransferConfig::default())
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn beginning_a_session_tears_down_the_previous_one() {
        let connector = LoopbackConnector::new();
        let controller = controller(&connector);
        let first = controller.begin(Role::Receiver).await;
        first.start_offer().await.expect("offer");
        assert_eq!(connector.pending_offers(), 1);

        let second = controller.begin(Role::Receiver).await;
        assert_eq!(first.bootstrap().state(), BootstrapState::Closed);
        assert_eq!(connector.pending_offers(), 0);
        assert_eq!(controller.active().map(|s| s.id()), Some(second.id()));
        assert_ne!(first.id(), second.id());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn overlapping_begins_leave_one_live_session() {
        let connector = LoopbackConnector::new().with_close_delay(Duration::from_millis(5));
        let controller = controller(&connector);
        let first = controller.begin(Role::Receiver).await;
        first.start_offer().await.expect("offer");

        let (a, b) = tokio::join!(controller.begin(Role::Receiver), controller.begin(Role::Receiver));
        let (a_offer, b_offer) = tokio::join!(a.start_offer(), b.start_offer());
        let live = [&a, &b].iter().filter(|session| !session.is_finished()).count();
        assert_eq!(live, 1);
        assert_eq!(connector.pending_offers(), 1);
        assert_eq!(a_offer.is_ok() as u8 + b_offer.is_ok() as u8, 1);
        assert!(first.is_finished());
        let active = controller.active().expect("active session");
        assert!(active.id() == a.id() || active.id() == b.id());
        assert!(!active.is_finished());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn cancelled_receive_never_reaches_sink() {
        let connector = LoopbackConnector::new();
        let controller = controller(&connector);
        let receiver = controller.begin(Role::Receiver).await;
        let sender = TransferSession::new(
            Role::Sender,
            Arc::new(connector.clone()),
            TransferConfig::default(),
        );
        let offer = receiver.start_offer().await.expect("offer");
        let answer = sender.accept_offer(&offer).await.expect("answer");
        receiver.accept_answer(&answer).await.expect("attach");

        let sink = MemorySink::new();
        // the sender never sends, so only the cancel ends the receive
        let (result, _) = tokio::join!(receiver.receive(&sink), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            controller.cancel_active().await;
        });
        assert!(matches!(result, Err(HandoffError::UserCancelled)));
        assert!(sink.delivered().is_empty());
        assert_eq!(receiver.info().state, BootstrapState::Closed);
        assert!(controller.active().is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn info_reports_attempt_details() {
        let connector = LoopbackConnector::new();
        let controller = controller(&connector);
        let receiver = controller.begin(Role::Receiver).await;
        let info = receiver.info();
        assert_eq!(info.role, Role::Receiver);
        assert_eq!(info.state, BootstrapState::Idle);
        assert_eq!(info.progress, 0);
        assert!(info.file_name.is_none());
    }
}
