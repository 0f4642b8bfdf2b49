//! In-process implementation of the connection capability. Offers and
//! answers are matched through a shared hub the way two browsers would match
//! them through ICE, and the channel only opens once the offerer has
//! attached the answer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use uuid::Uuid;

use super::{ChannelMessage, DataChannel, PeerConnection, PeerConnector, TransportError};
use crate::handshake::{SdpKind, SessionDescription};

const ORIGIN_PREFIX: &str = "o=loopback ";
const HOST_CANDIDATE: &str = "a=candidate:0 1 udp 2130706431 127.0.0.1 9 typ host\r\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkState {
    Pending,
    Open,
    Closed,
}

struct PendingOffer {
    remote_end: Arc<LoopbackChannel>,
    link: Arc<watch::Sender<LinkState>>,
}

#[derive(Default)]
struct Hub {
    pending: Mutex<HashMap<String, PendingOffer>>,
}

/// Connector whose connections can only reach other connections made by the
/// same connector (or a clone of it).
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    hub: Arc<Hub>,
    gather_delay: Option<Duration>,
    close_delay: Option<Duration>,
    reject_remote: bool,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidate gathering takes `delay` on every connection.
    pub fn with_gather_delay(mut self, delay: Duration) -> Self {
        self.gather_delay = Some(delay);
        self
    }

    /// Closing a connection takes `delay`, as tearing down a real one does.
    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = Some(delay);
        self
    }

    /// Every `set_remote_description` fails as if the platform rejected it.
    pub fn rejecting_remote_descriptions(mut self) -> Self {
        self.reject_remote = true;
        self
    }

    pub fn pending_offers(&self) -> usize {
        self.hub.pending.lock().len()
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(&self) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let (incoming, _) = watch::channel(None);
        Ok(Arc::new(LoopbackConnection {
            hub: self.hub.clone(),
            gather_delay: self.gather_delay,
            close_delay: self.close_delay,
            reject_remote: self.reject_remote,
            state: Mutex::new(ConnectionState::default()),
            incoming,
        }))
    }
}

#[derive(Default)]
struct ConnectionState {
    session_id: Option<String>,
    local: Option<SessionDescription>,
    channel: Option<(Arc<LoopbackChannel>, Arc<LoopbackChannel>)>,
    link: Option<Arc<watch::Sender<LinkState>>>,
    closed: bool,
}

pub struct LoopbackConnection {
    hub: Arc<Hub>,
    gather_delay: Option<Duration>,
    close_delay: Option<Duration>,
    reject_remote: bool,
    state: Mutex<ConnectionState>,
    incoming: watch::Sender<Option<Arc<LoopbackChannel>>>,
}

fn origin_id(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.strip_prefix(ORIGIN_PREFIX))
        .and_then(|rest| rest.split_whitespace().next())
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        let (link, _) = watch::channel(LinkState::Pending);
        let link = Arc::new(link);
        let (local, remote) = LoopbackChannel::pair(label, link.clone());
        state.channel = Some((local.clone(), remote));
        state.link = Some(link);
        Ok(local)
    }

    async fn create_local_description(&self, kind: SdpKind) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        let session_id = match kind {
            SdpKind::Offer => {
                let id = Uuid::new_v4().simple().to_string();
                if let (Some((_, remote)), Some(link)) = (&state.channel, &state.link) {
                    self.hub.pending.lock().insert(
                        id.clone(),
                        PendingOffer {
                            remote_end: remote.clone(),
                            link: link.clone(),
                        },
                    );
                }
                id
            }
            SdpKind::Answer => state.session_id.clone().ok_or_else(|| {
                TransportError::Setup("cannot answer without a remote offer".into())
            })?,
        };
        let sdp = format!(
            "v=0\r\n{ORIGIN_PREFIX}{session_id} 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n"
        );
        state.session_id = Some(session_id);
        state.local = Some(SessionDescription { kind, sdp });
        Ok(())
    }

    async fn gathered_local_description(&self) -> Result<SessionDescription, TransportError> {
        if let Some(delay) = self.gather_delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock();
        let mut description = state
            .local
            .clone()
            .ok_or_else(|| TransportError::Setup("missing local description".into()))?;
        description.sdp.push_str(HOST_CANDIDATE);
        description.sdp.push_str("a=end-of-candidates\r\n");
        Ok(description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.reject_remote {
            return Err(TransportError::Setup("remote description rejected".into()));
        }
        let id = origin_id(&description.sdp)
            .ok_or_else(|| TransportError::Setup("description has no origin line".into()))?
            .to_string();
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::ChannelClosed);
        }
        match description.kind {
            SdpKind::Offer => {
                let offer = self
                    .hub
                    .pending
                    .lock()
                    .remove(&id)
                    .ok_or_else(|| TransportError::Setup(format!("no reachable peer for {id}")))?;
                state.session_id = Some(id);
                state.link = Some(offer.link);
                self.incoming.send_replace(Some(offer.remote_end));
            }
            SdpKind::Answer => {
                if state.session_id.as_deref() != Some(id.as_str()) {
                    return Err(TransportError::Setup(
                        "answer does not match local offer".into(),
                    ));
                }
                if let Some(link) = &state.link {
                    link.send_replace(LinkState::Open);
                }
            }
        }
        Ok(())
    }

    async fn incoming_channel(&self) -> Result<Arc<dyn DataChannel>, TransportError> {
        let mut incoming = self.incoming.subscribe();
        let channel = incoming
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| TransportError::ChannelClosed)?
            .clone();
        channel
            .map(|channel| channel as Arc<dyn DataChannel>)
            .ok_or(TransportError::ChannelClosed)
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(link) = state.link.take() {
                link.send_replace(LinkState::Closed);
            }
            if let Some(id) = state.session_id.as_deref() {
                self.hub.pending.lock().remove(id);
            }
        }
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

/// One end of an in-memory ordered channel.
pub struct LoopbackChannel {
    label: String,
    link: Arc<watch::Sender<LinkState>>,
    outbound: mpsc::UnboundedSender<ChannelMessage>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    /// Bytes this end sent that the peer has not read yet.
    unread_outbound: Arc<AtomicUsize>,
    unread_inbound: Arc<AtomicUsize>,
}

impl LoopbackChannel {
    fn pair(label: &str, link: Arc<watch::Sender<LinkState>>) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_to_b = Arc::new(AtomicUsize::new(0));
        let b_to_a = Arc::new(AtomicUsize::new(0));
        let a = Arc::new(Self {
            label: label.to_string(),
            link: link.clone(),
            outbound: a_tx,
            inbound: AsyncMutex::new(a_rx),
            unread_outbound: a_to_b.clone(),
            unread_inbound: b_to_a.clone(),
        });
        let b = Arc::new(Self {
            label: label.to_string(),
            link,
            outbound: b_tx,
            inbound: AsyncMutex::new(b_rx),
            unread_outbound: b_to_a,
            unread_inbound: a_to_b,
        });
        (a, b)
    }

    fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    fn push(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if self.link_state() != LinkState::Open {
            return Err(TransportError::ChannelClosed);
        }
        let len = message.len();
        self.unread_outbound.fetch_add(len, Ordering::AcqRel);
        self.outbound.send(message).map_err(|_| {
            self.unread_outbound.fetch_sub(len, Ordering::AcqRel);
            TransportError::ChannelClosed
        })
    }

    fn take(&self, message: ChannelMessage) -> ChannelMessage {
        self.unread_inbound.fetch_sub(message.len(), Ordering::AcqRel);
        message
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.link_state() == LinkState::Open
    }

    async fn wait_open(&self) -> Result<(), TransportError> {
        let mut link = self.link.subscribe();
        let state = *link
            .wait_for(|state| *state != LinkState::Pending)
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        match state {
            LinkState::Open => Ok(()),
            _ => Err(TransportError::ChannelClosed),
        }
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.push(ChannelMessage::Text(text.to_string()))
    }

    async fn send_binary(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.push(ChannelMessage::Binary(bytes))
    }

    async fn buffered_amount(&self) -> usize {
        self.unread_outbound.load(Ordering::Acquire)
    }

    async fn recv(&self) -> Option<ChannelMessage> {
        let mut inbound = self.inbound.lock().await;
        let mut link = self.link.subscribe();
        loop {
            // drain what was already delivered before honoring a close
            if let Ok(message) = inbound.try_recv() {
                return Some(self.take(message));
            }
            if *link.borrow_and_update() == LinkState::Closed {
                return None;
            }
            tokio::select! {
                message = inbound.recv() => return message.map(|message| self.take(message)),
                changed = link.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn close(&self) {
        self.link.send_replace(LinkState::Closed);
    }
}
