//! Drives one side of the offer/answer exchange up to an open channel.
//!
//! The receiving device is the offerer: it creates the channel, gathers its
//! candidates and shows its offer as a code. The sending device scans that
//! code, answers, and shows the answer as a second code which the receiver
//! scans back with [`ConnectionBootstrap::accept_answer`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cancel::Cancellation;
use crate::config::TransferConfig;
use crate::error::{HandoffError, Result};
use crate::handshake::{self, SdpKind};
use crate::transport::{DataChannel, PeerConnection, PeerConnector};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Receiver,
    Sender,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Receiver => "receiver",
            Role::Sender => "sender",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    CreatingLocalDescription,
    GatheringCandidates,
    LocalDescriptionReady,
    AwaitingRemoteDescription,
    Attached,
    ChannelOpen,
    Failed,
    Closed,
}

impl BootstrapState {
    pub fn name(self) -> &'static str {
        match self {
            BootstrapState::Idle => "Idle",
            BootstrapState::CreatingLocalDescription => "CreatingLocalDescription",
            BootstrapState::GatheringCandidates => "GatheringCandidates",
            BootstrapState::LocalDescriptionReady => "LocalDescriptionReady",
            BootstrapState::AwaitingRemoteDescription => "AwaitingRemoteDescription",
            BootstrapState::Attached => "Attached",
            BootstrapState::ChannelOpen => "ChannelOpen",
            BootstrapState::Failed => "Failed",
            BootstrapState::Closed => "Closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BootstrapState::Failed | BootstrapState::Closed)
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Default)]
struct Resources {
    connection: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<dyn DataChannel>>,
    last_error: Option<String>,
}

pub struct ConnectionBootstrap {
    role: Role,
    connector: Arc<dyn PeerConnector>,
    config: TransferConfig,
    state: watch::Sender<BootstrapState>,
    resources: Mutex<Resources>,
    cancel: Cancellation,
}

impl ConnectionBootstrap {
    pub fn new(role: Role, connector: Arc<dyn PeerConnector>, config: TransferConfig) -> Self {
        let (state, _) = watch::channel(BootstrapState::Idle);
        Self {
            role,
            connector,
            config,
            state,
            resources: Mutex::new(Resources::default()),
            cancel: Cancellation::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    /// Human-readable reason of the failure that moved this bootstrap to
    /// `Failed`.
    pub fn last_error(&self) -> Option<String> {
        self.resources.lock().last_error.clone()
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.resources.lock().channel.clone()
    }

    /// Receiver: creates the channel and the offer, waits for gathering, and
    /// returns the offer as handshake text.
    pub async fn start_offer(&self) -> Result<String> {
        self.require(Role::Receiver, BootstrapState::Idle)?;
        self.step(async {
            self.transition(BootstrapState::CreatingLocalDescription);
            let connection = self.connector.connect().await?;
            self.resources.lock().connection = Some(connection.clone());
            let channel = connection.create_channel(&self.config.channel_label).await?;
            self.resources.lock().channel = Some(channel);
            connection.create_local_description(SdpKind::Offer).await?;

            let text = self.gather(connection.as_ref()).await?;
            self.transition(BootstrapState::AwaitingRemoteDescription);
            Ok(text)
        })
        .await
    }

    /// Receiver: attaches the sender's answer.
    pub async fn accept_answer(&self, text: &str) -> Result<()> {
        self.require(Role::Receiver, BootstrapState::AwaitingRemoteDescription)?;
        self.step(async {
            let payload =
                handshake::decode_expecting(text, SdpKind::Answer, self.config.payload_max_age)?;
            let connection = self.connection()?;
            connection.set_remote_description(payload.description).await?;
            self.transition(BootstrapState::Attached);
            Ok(())
        })
        .await
    }

    /// Sender: attaches the receiver's offer and returns the answer as
    /// handshake text.
    pub async fn accept_offer(&self, text: &str) -> Result<String> {
        self.require(Role::Sender, BootstrapState::Idle)?;
        self.step(async {
            let payload =
                handshake::decode_expecting(text, SdpKind::Offer, self.config.payload_max_age)?;
            let connection = self.connector.connect().await?;
            self.resources.lock().connection = Some(connection.clone());
            connection.set_remote_description(payload.description).await?;
            self.transition(BootstrapState::Attached);

            self.transition(BootstrapState::CreatingLocalDescription);
            connection.create_local_description(SdpKind::Answer).await?;
            self.gather(connection.as_ref()).await
        })
        .await
    }

    /// Waits for the channel to open. On the sender this also adopts the
    /// channel the receiver created.
    pub async fn wait_channel(&self) -> Result<Arc<dyn DataChannel>> {
        let ready = match self.role {
            Role::Receiver => BootstrapState::Attached,
            Role::Sender => BootstrapState::LocalDescriptionReady,
        };
        self.require(self.role, ready)?;
        let timeout = self.config.channel_open_timeout;
        self.step(async {
            let connection = self.connection()?;
            let opening = async {
                let channel = match self.channel() {
                    Some(channel) => channel,
                    None => {
                        let channel = connection.incoming_channel().await?;
                        debug!(
                            target = "handoff::bootstrap",
                            role = %self.role,
                            label = channel.label(),
                            "adopted remote channel"
                        );
                        self.resources.lock().channel = Some(channel.clone());
                        channel
                    }
                };
                channel.wait_open().await?;
                Ok::<_, HandoffError>(channel)
            };
            let channel = tokio::time::timeout(timeout, opening)
                .await
                .map_err(|_| HandoffError::BootstrapTimeout(timeout))??;
            self.transition(BootstrapState::ChannelOpen);
            Ok(channel)
        })
        .await
    }

    /// Abandons the attempt. Safe to call any number of times from any state;
    /// always leaves the bootstrap `Closed`.
    pub async fn cancel(&self) {
        if self.cancel.cancel() {
            debug!(target = "handoff::bootstrap", role = %self.role, "cancelled");
        }
        self.close().await;
    }

    /// Releases the channel and connection and moves to `Closed`.
    pub async fn close(&self) {
        self.release().await;
        let previous = self.state.send_replace(BootstrapState::Closed);
        if previous != BootstrapState::Closed {
            debug!(
                target = "handoff::bootstrap",
                role = %self.role,
                from = %previous,
                "closed"
            );
        }
    }

    async fn gather(&self, connection: &dyn PeerConnection) -> Result<String> {
        self.transition(BootstrapState::GatheringCandidates);
        let timeout = self.config.gather_timeout;
        let description = tokio::time::timeout(timeout, connection.gathered_local_description())
            .await
            .map_err(|_| HandoffError::BootstrapTimeout(timeout))??;
        let text = handshake::encode(&description)?;
        self.transition(BootstrapState::LocalDescriptionReady);
        debug!(
            target = "handoff::bootstrap",
            role = %self.role,
            kind = %description.kind,
            encoded_len = text.len(),
            "local description ready"
        );
        Ok(text)
    }

    fn connection(&self) -> Result<Arc<dyn PeerConnection>> {
        self.resources
            .lock()
            .connection
            .clone()
            .ok_or(HandoffError::ChannelNotReady)
    }

    fn require(&self, role: Role, state: BootstrapState) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(HandoffError::UserCancelled);
        }
        if role != self.role {
            return Err(HandoffError::InvalidState {
                expected: role.name(),
                actual: self.role.to_string(),
            });
        }
        let current = self.state();
        if current != state {
            return Err(HandoffError::InvalidState {
                expected: state.name(),
                actual: current.to_string(),
            });
        }
        Ok(())
    }

    fn transition(&self, next: BootstrapState) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(target = "handoff::bootstrap", role = %self.role, state = %next, "transition");
        }
    }

    /// Runs one externally triggered step. Failures end the attempt and
    /// release its resources; cancellation wins over anything in flight.
    async fn step<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        match self.cancel.guard(work).await {
            Ok(value) => Ok(value),
            Err(HandoffError::UserCancelled) => {
                self.close().await;
                Err(HandoffError::UserCancelled)
            }
            Err(err) => {
                self.abort(&err).await;
                Err(err)
            }
        }
    }

    /// Records `err`, releases the connection and moves to `Failed`.
    pub async fn abort(&self, err: &HandoffError) {
        warn!(
            target = "handoff::bootstrap",
            role = %self.role,
            state = %self.state(),
            error = %err,
            "bootstrap failed"
        );
        self.resources.lock().last_error = Some(err.user_message());
        self.release().await;
        self.state.send_if_modified(|state| {
            if *state == BootstrapState::Closed {
                return false;
            }
            *state = BootstrapState::Failed;
            true
        });
    }

    async fn release(&self) {
        let (channel, connection) = {
            let mut resources = self.resources.lock();
            (resources.channel.take(), resources.connection.take())
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::loopback::LoopbackConnector;

    fn pair(connector: &LoopbackConnector) -> (ConnectionBootstrap, ConnectionBootstrap) {
        let config = TransferConfig::default();
        (
            ConnectionBootstrap::new(Role::Receiver, Arc::new(connector.clone()), config.clone()),
            ConnectionBootstrap::new(Role::Sender, Arc::new(connector.clone()), config),
        )
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn both_roles_reach_channel_open() {
        let connector = LoopbackConnector::new();
        let (receiver, sender) = pair(&connector);

        let offer = receiver.start_offer().await.expect("offer");
        assert_eq!(receiver.state(), BootstrapState::AwaitingRemoteDescription);

        let answer = sender.accept_offer(&offer).await.expect("answer");
        assert_eq!(sender.state(), BootstrapState::LocalDescriptionReady);

        receiver.accept_answer(&answer).await.expect("attach answer");
        assert_eq!(receiver.state(), BootstrapState::Attached);

        let (rx, tx) = tokio::join!(receiver.wait_channel(), sender.wait_channel());
        let rx = rx.expect("receiver channel");
        let tx = tx.expect("sender channel");
        assert_eq!(rx.label(), "fileTransfer");
        assert_eq!(tx.label(), "fileTransfer");
        assert_eq!(receiver.state(), BootstrapState::ChannelOpen);
        assert_eq!(sender.state(), BootstrapState::ChannelOpen);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn cancel_twice_stays_closed() {
        let connector = LoopbackConnector::new();
        let (receiver, _) = pair(&connector);
        receiver.start_offer().await.expect("offer");
        assert_eq!(connector.pending_offers(), 1);

        receiver.cancel().await;
        assert_eq!(receiver.state(), BootstrapState::Closed);
        receiver.cancel().await;
        assert_eq!(receiver.state(), BootstrapState::Closed);
        assert_eq!(connector.pending_offers(), 0);
        assert!(matches!(
            receiver.accept_answer("anything").await,
            Err(HandoffError::UserCancelled)
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn gathering_is_bounded() {
        let connector = LoopbackConnector::new().with_gather_delay(Duration::from_secs(5));
        let config = TransferConfig::default().with_gather_timeout(Duration::from_millis(20));
        let receiver = ConnectionBootstrap::new(Role::Receiver, Arc::new(connector), config);
        let err = receiver.start_offer().await.expect_err("timeout");
        assert!(matches!(err, HandoffError::BootstrapTimeout(after) if after == Duration::from_millis(20)));
        assert_eq!(receiver.state(), BootstrapState::Failed);
        assert!(receiver.last_error().is_some());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn channel_open_wait_is_bounded() {
        let connector = LoopbackConnector::new();
        let config = TransferConfig {
            channel_open_timeout: Duration::from_millis(30),
            ..TransferConfig::default()
        };
        let receiver =
            ConnectionBootstrap::new(Role::Receiver, Arc::new(connector.clone()), config.clone());
        let sender = ConnectionBootstrap::new(Role::Sender, Arc::new(connector), config);
        let offer = receiver.start_offer().await.expect("offer");
        sender.accept_offer(&offer).await.expect("answer");

        // the answer never reaches the receiver, so the channel never opens
        let err = sender.wait_channel().await.err().expect("timeout");
        assert!(matches!(err, HandoffError::BootstrapTimeout(after) if after == Duration::from_millis(30)));
        assert_eq!(sender.state(), BootstrapState::Failed);
        assert!(sender.last_error().is_some());
        assert_eq!(receiver.state(), BootstrapState::AwaitingRemoteDescription);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn cancel_interrupts_gathering() {
        let connector = LoopbackConnector::new().with_gather_delay(Duration::from_secs(5));
        let receiver =
            ConnectionBootstrap::new(Role::Receiver, Arc::new(connector), TransferConfig::default());
        let (result, _) = tokio::join!(receiver.start_offer(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            receiver.cancel().await;
        });
        assert!(matches!(result, Err(HandoffError::UserCancelled)));
        assert_eq!(receiver.state(), BootstrapState::Closed);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn platform_rejection_fails_the_attempt() {
        let connector = LoopbackConnector::new();
        let receiver = ConnectionBootstrap::new(
            Role::Receiver,
            Arc::new(connector.clone()),
            TransferConfig::default(),
        );
        let sender = ConnectionBootstrap::new(
            Role::Sender,
            Arc::new(connector.rejecting_remote_descriptions()),
            TransferConfig::default(),
        );
        let offer = receiver.start_offer().await.expect("offer");
        let err = sender.accept_offer(&offer).await.expect_err("rejected");
        assert!(matches!(err, HandoffError::PlatformNegotiationFailure(_)));
        assert_eq!(sender.state(), BootstrapState::Failed);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn malformed_or_mismatched_codes_fail() {
        let connector = LoopbackConnector::new();
        let (receiver, sender) = pair(&connector);
        let err = sender.accept_offer("%%% not base64 %%%").await.expect_err("garbage");
        assert!(matches!(err, HandoffError::MalformedPayload(_)));
        assert_eq!(sender.state(), BootstrapState::Failed);

        let offer = receiver.start_offer().await.expect("offer");
        let err = receiver.accept_answer(&offer).await.expect_err("offer is not an answer");
        assert!(matches!(err, HandoffError::MalformedPayload(_)));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn steps_out_of_order_are_rejected() {
        let connector = LoopbackConnector::new();
        let (receiver, sender) = pair(&connector);
        assert!(matches!(
            receiver.accept_offer("x").await,
            Err(HandoffError::InvalidState { .. })
        ));
        assert!(matches!(
            sender.wait_channel().await,
            Err(HandoffError::InvalidState { .. })
        ));
        assert_eq!(receiver.state(), BootstrapState::Idle);
        assert_eq!(sender.state(), BootstrapState::Idle);
    }
}
