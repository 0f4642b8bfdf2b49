use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::frame::{ControlFrame, TransferFrame};
use crate::cancel::Cancellation;
use crate::error::{HandoffError, Result};
use crate::progress::{ProgressTracker, receiver_estimate};
use crate::snapshot::{Snapshot, SnapshotSink, SnapshotSummary, summarize};
use crate::transport::DataChannel;

#[derive(Debug)]
enum Phase {
    AwaitingMetadata,
    Receiving {
        file_name: String,
        announced_bytes: u64,
        chunks: Vec<Bytes>,
        received_bytes: usize,
    },
    Completed,
}

/// Rebuilds one blob from frames in arrival order. There are no sequence
/// numbers; the channel's ordering is what makes the output correct.
#[derive(Debug)]
pub struct Reassembler {
    phase: Phase,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingMetadata,
        }
    }

    pub fn chunks_received(&self) -> usize {
        match &self.phase {
            Phase::Receiving { chunks, .. } => chunks.len(),
            _ => 0,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        match &self.phase {
            Phase::Receiving { file_name, .. } => Some(file_name),
            _ => None,
        }
    }

    pub fn announced_bytes(&self) -> Option<u64> {
        match &self.phase {
            Phase::Receiving {
                announced_bytes, ..
            } => Some(*announced_bytes),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Completed)
    }

    /// Returns the finished snapshot when `frame` is the `complete` marker.
    pub fn ingest(&mut self, frame: TransferFrame) -> Result<Option<Snapshot>> {
        if self.is_complete() {
            return Err(HandoffError::UnexpectedFrameAfterCompletion);
        }
        match frame {
            TransferFrame::Control(ControlFrame::Metadata {
                file_name,
                file_size,
            }) => {
                if let Some(previous) = self.file_name() {
                    debug!(
                        target = "handoff::transfer",
                        previous,
                        file_name = %file_name,
                        "metadata restarted accumulation"
                    );
                }
                self.phase = Phase::Receiving {
                    file_name,
                    announced_bytes: file_size,
                    chunks: Vec::new(),
                    received_bytes: 0,
                };
                Ok(None)
            }
            TransferFrame::Data(bytes) => match &mut self.phase {
                Phase::Receiving {
                    chunks,
                    received_bytes,
                    ..
                } => {
                    *received_bytes += bytes.len();
                    chunks.push(bytes);
                    trace!(
                        target = "handoff::transfer",
                        chunk = chunks.len(),
                        bytes = *received_bytes,
                        "chunk received"
                    );
                    Ok(None)
                }
                _ => Err(HandoffError::MalformedFrame(
                    "data frame before metadata".into(),
                )),
            },
            TransferFrame::Control(ControlFrame::Complete) => {
                let (file_name, announced_bytes, chunks, received_bytes) =
                    match std::mem::replace(&mut self.phase, Phase::Completed) {
                        Phase::Receiving {
                            file_name,
                            announced_bytes,
                            chunks,
                            received_bytes,
                        } => (file_name, announced_bytes, chunks, received_bytes),
                        other => {
                            self.phase = other;
                            return Err(HandoffError::MalformedFrame(
                                "complete frame before metadata".into(),
                            ));
                        }
                    };
                let mut combined = BytesMut::with_capacity(received_bytes);
                for chunk in &chunks {
                    combined.extend_from_slice(chunk);
                }
                if combined.len() as u64 != announced_bytes {
                    warn!(
                        target = "handoff::transfer",
                        file_name = %file_name,
                        announced = announced_bytes,
                        received = combined.len(),
                        "received size differs from announced size"
                    );
                }
                Ok(Some(Snapshot::new(file_name, combined.freeze())))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiveReport {
    pub file_name: String,
    pub bytes: usize,
    pub chunks: usize,
    pub dropped_frames: usize,
    pub saved_to: Option<PathBuf>,
    pub summary: Option<SnapshotSummary>,
    pub elapsed: Duration,
}

/// Reads frames until `complete`, hands the blob to `sink` once and returns.
/// Malformed frames are dropped; anything else ends the attempt without
/// touching the sink.
pub async fn receive_snapshot(
    channel: &dyn DataChannel,
    sink: &dyn SnapshotSink,
    progress: &ProgressTracker,
    cancel: &Cancellation,
) -> Result<ReceiveReport> {
    let started = Instant::now();
    let mut reassembler = Reassembler::new();
    let mut dropped_frames = 0;
    let mut chunks = 0;
    progress.reset();

    let snapshot = loop {
        let message = cancel
            .guard(async { channel.recv().await.ok_or(HandoffError::ChannelNotReady) })
            .await?;
        let frame = TransferFrame::decode(message).and_then(|frame| reassembler.ingest(frame));
        match frame {
            Ok(Some(snapshot)) => break snapshot,
            Ok(None) => {
                chunks = reassembler.chunks_received();
                progress.advance(receiver_estimate(chunks));
            }
            Err(err) if err.is_recoverable() => {
                dropped_frames += 1;
                warn!(target = "handoff::transfer", error = %err, "dropping frame");
            }
            Err(err) => return Err(err),
        }
    };

    if cancel.is_cancelled() {
        return Err(HandoffError::UserCancelled);
    }
    let saved_to = sink.persist(&snapshot).await?;
    progress.complete();
    let summary = summarize(&snapshot.bytes);
    debug!(
        target = "handoff::transfer",
        file_name = %snapshot.file_name,
        bytes = snapshot.len(),
        chunks,
        dropped_frames,
        students = summary.as_ref().map(|summary| summary.students),
        attendance = summary.as_ref().map(|summary| summary.attendance),
        "snapshot received"
    );
    Ok(ReceiveReport {
        file_name: snapshot.file_name.clone(),
        bytes: snapshot.len(),
        chunks,
        dropped_frames,
        saved_to,
        summary,
        elapsed: started.elapsed(),
    })
}
