//! The platform peer-connection capability, as seen by the bootstrap and the
//! transfer protocol. ICE/NAT traversal lives behind these traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::handshake::{SdpKind, SessionDescription};

pub mod loopback;
pub mod webrtc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("transport timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Creates the ordered, reliable channel on the initiating side.
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Creates an offer or answer and installs it as the local description.
    async fn create_local_description(&self, kind: SdpKind) -> Result<(), TransportError>;

    /// Suspends until candidate gathering completes, then returns the
    /// finalized local description.
    async fn gathered_local_description(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Suspends until the remote peer's channel appears on this side.
    async fn incoming_channel(&self) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn wait_open(&self) -> Result<(), TransportError>;

    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    async fn send_binary(&self, bytes: Bytes) -> Result<(), TransportError>;

    /// Bytes queued locally but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Next inbound message in arrival order; `None` once the channel closed.
    async fn recv(&self) -> Option<ChannelMessage>;

    async fn close(&self);
}
