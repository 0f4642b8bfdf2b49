//! Showing handshake text as a scannable code and picking a handshake out of
//! a stream of captured frames.

use std::time::Duration;

use qrcode::render::unicode;
use qrcode::{EcLevel, QrCode};
use tracing::{debug, trace};

use crate::error::{HandoffError, Result};
use crate::handshake::{self, HandshakePayload, SdpKind};

/// Payloads up to this length are short identifiers and get more error
/// correction; full session descriptions need the density of level L.
pub const SHORT_PAYLOAD_LEN: usize = 64;

pub fn error_correction_for(text: &str) -> EcLevel {
    if text.len() > SHORT_PAYLOAD_LEN {
        EcLevel::L
    } else {
        EcLevel::M
    }
}

/// Renders `text` as a block-character code for a terminal.
pub fn render(text: &str) -> Result<String> {
    let code = QrCode::with_error_correction_level(text.as_bytes(), error_correction_for(text))
        .map_err(|err| HandoffError::Render(err.to_string()))?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

/// Turns one captured frame into the text of a code, if one is visible.
pub trait FrameDecoder {
    type Frame;

    fn decode(&mut self, frame: &Self::Frame) -> Option<String>;
}

/// Treats every line of input as a captured frame. Blank lines mean nothing
/// was visible.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineDecoder;

impl FrameDecoder for LineDecoder {
    type Frame = String;

    fn decode(&mut self, frame: &String) -> Option<String> {
        let text = frame.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedCode {
    pub text: String,
    pub payload: HandshakePayload,
}

/// Feeds frames through `decoder` until one carries a fresh handshake of the
/// `expected` kind. Empty frames and unrelated or stale codes are skipped.
pub fn scan_handshake<D, I>(
    decoder: &mut D,
    frames: I,
    expected: SdpKind,
    max_age: Duration,
) -> Option<ScannedCode>
where
    D: FrameDecoder,
    I: IntoIterator<Item = D::Frame>,
{
    for (index, frame) in frames.into_iter().enumerate() {
        let Some(text) = decoder.decode(&frame) else {
            trace!(target = "handoff::optical", frame = index, "no code in frame");
            continue;
        };
        match handshake::decode_expecting(&text, expected, max_age) {
            Ok(payload) => {
                debug!(
                    target = "handoff::optical",
                    frame = index,
                    kind = %expected,
                    "handshake scanned"
                );
                return Some(ScannedCode { text, payload });
            }
            Err(err) => {
                debug!(target = "handoff::optical", frame = index, error = %err, "ignoring code");
            }
        }
    }
    None
}
