//! The connection capability on top of the `webrtc` crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{ChannelMessage, DataChannel, PeerConnection, PeerConnector, TransportError};
use crate::config::IceConfig;
use crate::handshake::{SdpKind, SessionDescription};

const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(3);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(10);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

pub struct WebRtcConnector {
    api: API,
    ice: IceConfig,
}

impl WebRtcConnector {
    pub fn new(ice: IceConfig) -> Self {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );
        let api = APIBuilder::new().with_setting_engine(setting).build();
        Self { api, ice }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice.servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice.servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await
                .map_err(to_setup_error)?,
        );

        let (incoming, _) = watch::channel(None);
        let incoming = Arc::new(incoming);
        let slot = incoming.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = slot.clone();
            Box::pin(async move {
                tracing::debug!(
                    target = "handoff::transport",
                    label = dc.label(),
                    "remote data channel announced"
                );
                if slot.borrow().is_none() {
                    slot.send_replace(Some(WebRtcChannel::adopt(dc)));
                }
            })
        }));

        Ok(Arc::new(WebRtcConnection {
            pc,
            incoming,
            gathering: AsyncMutex::new(None),
        }))
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    incoming: Arc<watch::Sender<Option<Arc<WebRtcChannel>>>>,
    gathering: AsyncMutex<Option<mpsc::Receiver<()>>>,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_setup_error)?;
        Ok(WebRtcChannel::adopt(dc))
    }

    async fn create_local_description(&self, kind: SdpKind) -> Result<(), TransportError> {
        let description = match kind {
            SdpKind::Offer => self.pc.create_offer(None).await,
            SdpKind::Answer => self.pc.create_answer(None).await,
        }
        .map_err(to_setup_error)?;
        // must be armed before the local description starts gathering
        let gathering = self.pc.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(gathering);
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn gathered_local_description(&self) -> Result<SessionDescription, TransportError> {
        let gathering = self.gathering.lock().await.take();
        if let Some(mut gathering) = gathering {
            let _ = gathering.recv().await;
        }
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("missing local description".into()))?;
        from_rtc_description(&local)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let rtc = to_rtc_description(description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(to_setup_error)
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
        if let Some(channel) = self.incoming.borrow().clone() {
            channel.mark(ChannelState::Closed);
        }
        if let Err(err) = self.pc.close().await {
            tracing::warn!(
                target = "handoff::transport",
                error = %err,
                "peer connection close failed"
            );
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelState {
    Connecting,
    Open,
    Closed,
}

pub struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    state: Arc<watch::Sender<ChannelState>>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    closed_once: Mutex<bool>,
}

impl WebRtcChannel {
    fn adopt(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let initial = match dc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        };
        let (state, _) = watch::channel(initial);
        let state = Arc::new(state);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let open_state = state.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                tracing::debug!(target = "handoff::transport", "data channel opened");
                open_state.send_replace(ChannelState::Open);
            })
        }));

        let close_state = state.clone();
        dc.on_close(Box::new(move || {
            let state = close_state.clone();
            Box::pin(async move {
                tracing::debug!(target = "handoff::transport", "data channel closed");
                state.send_replace(ChannelState::Closed);
            })
        }));

        dc.on_error(Box::new(move |err| {
            Box::pin(async move {
                tracing::warn!(target = "handoff::transport", error = %err, "data channel error");
            })
        }));

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sender = inbound_tx.clone();
            Box::pin(async move {
                let message = if msg.is_string {
                    ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelMessage::Binary(msg.data)
                };
                if sender.send(message).is_err() {
                    tracing::warn!(target = "handoff::transport", "inbound queue dropped");
                }
            })
        }));

        Arc::new(Self {
            label: dc.label().to_string(),
            dc,
            state,
            inbound: AsyncMutex::new(inbound_rx),
            closed_once: Mutex::new(false),
        })
    }

    fn mark(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn current(&self) -> ChannelState {
        *self.state.borrow()
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.current() == ChannelState::Open
    }

    async fn wait_open(&self) -> Result<(), TransportError> {
        let mut state = self.state.subscribe();
        let reached = *state
            .wait_for(|state| *state != ChannelState::Connecting)
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        match reached {
            ChannelState::Open => Ok(()),
            _ => Err(TransportError::ChannelClosed),
        }
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(to_setup_error)
    }

    async fn send_binary(&self, bytes: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.dc.send(&bytes).await.map(|_| ()).map_err(to_setup_error)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn recv(&self) -> Option<ChannelMessage> {
        let mut inbound = self.inbound.lock().await;
        let mut state = self.state.subscribe();
        loop {
            if let Ok(message) = inbound.try_recv() {
                return Some(message);
            }
            if *state.borrow_and_update() == ChannelState::Closed {
                return None;
            }
            tokio::select! {
                message = inbound.recv() => return message,
                changed = state.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    async fn close(&self) {
        {
            let mut closed = self.closed_once.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.mark(ChannelState::Closed);
        if let Err(err) = self.dc.close().await {
            tracing::warn!(
                target = "handoff::transport",
                error = %err,
                "data channel close failed"
            );
        }
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(to_setup_error)
}

fn from_rtc_description(
    description: &RTCSessionDescription,
) -> Result<SessionDescription, TransportError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported sdp type {other}"
            )));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp.clone(),
    })
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
