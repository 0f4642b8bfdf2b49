use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{HandoffError, Result};
use crate::transport::ChannelMessage;

/// Text-encoded control messages. The `type` tag and camelCase fields match
/// what the web client puts on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Metadata {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
    },
    Complete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferFrame {
    Control(ControlFrame),
    Data(Bytes),
}

impl TransferFrame {
    pub fn metadata(file_name: impl Into<String>, file_size: u64) -> Self {
        TransferFrame::Control(ControlFrame::Metadata {
            file_name: file_name.into(),
            file_size,
        })
    }

    pub fn complete() -> Self {
        TransferFrame::Control(ControlFrame::Complete)
    }

    pub fn encode(&self) -> Result<ChannelMessage> {
        match self {
            TransferFrame::Control(control) => serde_json::to_string(control)
                .map(ChannelMessage::Text)
                .map_err(|err| HandoffError::MalformedFrame(err.to_string())),
            TransferFrame::Data(bytes) => Ok(ChannelMessage::Binary(bytes.clone())),
        }
    }

    pub fn decode(message: ChannelMessage) -> Result<Self> {
        match message {
            ChannelMessage::Text(text) => serde_json::from_str(&text)
                .map(TransferFrame::Control)
                .map_err(|err| HandoffError::MalformedFrame(err.to_string())),
            ChannelMessage::Binary(bytes) => Ok(TransferFrame::Data(bytes)),
        }
    }
}
