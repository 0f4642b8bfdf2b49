use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::frame::TransferFrame;
use crate::cancel::Cancellation;
use crate::config::TransferConfig;
use crate::error::{HandoffError, Result};
use crate::progress::{ProgressTracker, sender_percent};
use crate::snapshot::Snapshot;
use crate::transport::{ChannelMessage, DataChannel};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReport {
    pub file_name: String,
    pub bytes: usize,
    pub chunks: usize,
    pub elapsed: Duration,
}

async fn send_frame(channel: &dyn DataChannel, frame: TransferFrame) -> Result<()> {
    match frame.encode()? {
        ChannelMessage::Text(text) => channel.send_text(&text).await?,
        ChannelMessage::Binary(bytes) => channel.send_binary(bytes).await?,
    }
    Ok(())
}

/// Holds the next chunk back while the channel has more than the configured
/// watermark queued.
async fn pace(channel: &dyn DataChannel, config: &TransferConfig) -> Result<()> {
    loop {
        if !channel.is_open() {
            return Err(HandoffError::ChannelNotReady);
        }
        let buffered = channel.buffered_amount().await;
        if buffered <= config.buffered_high_watermark {
            tokio::task::yield_now().await;
            return Ok(());
        }
        trace!(
            target = "handoff::transfer",
            buffered,
            watermark = config.buffered_high_watermark,
            "waiting for channel to drain"
        );
        tokio::time::sleep(config.buffered_poll_interval).await;
    }
}

/// Emits `metadata`, the blob in `chunk_bytes` slices and `complete`, in that
/// order, over an open channel.
pub async fn send_snapshot(
    channel: &dyn DataChannel,
    snapshot: &Snapshot,
    config: &TransferConfig,
    progress: &ProgressTracker,
    cancel: &Cancellation,
) -> Result<SendReport> {
    if !channel.is_open() {
        return Err(HandoffError::ChannelNotReady);
    }
    let started = Instant::now();
    let chunk_bytes = config.chunk_bytes.max(1);
    let total_chunks = config.chunk_count(snapshot.len());
    progress.reset();

    debug!(
        target = "handoff::transfer",
        file_name = %snapshot.file_name,
        bytes = snapshot.len(),
        chunks = total_chunks,
        "sending snapshot"
    );
    cancel
        .guard(send_frame(
            channel,
            TransferFrame::metadata(snapshot.file_name.clone(), snapshot.len() as u64),
        ))
        .await?;

    let mut offset = 0;
    for index in 0..total_chunks {
        cancel.guard(pace(channel, config)).await?;
        let end = (offset + chunk_bytes).min(snapshot.len());
        let chunk = snapshot.bytes.slice(offset..end);
        cancel
            .guard(send_frame(channel, TransferFrame::Data(chunk)))
            .await?;
        offset = end;
        let percent = progress.advance(sender_percent(index + 1, total_chunks));
        trace!(
            target = "handoff::transfer",
            chunk = index + 1,
            bytes = offset,
            percent,
            "chunk sent"
        );
    }

    cancel
        .guard(send_frame(channel, TransferFrame::complete()))
        .await?;
    progress.complete();

    Ok(SendReport {
        file_name: snapshot.file_name.clone(),
        bytes: snapshot.len(),
        chunks: total_chunks,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::handshake::SdpKind;
    use crate::transport::loopback::LoopbackConnector;
    use crate::transport::PeerConnector;

    async fn open_pair() -> (Arc<dyn DataChannel>, Arc<dyn DataChannel>) {
        let connector = LoopbackConnector::new();
        let offerer = connector.connect().await.expect("connect");
        let answerer = connector.connect().await.expect("connect");
        let channel = offerer.create_channel("fileTransfer").await.expect("channel");
        offerer
            .create_local_description(SdpKind::Offer)
            .await
            .expect("offer");
        let offer = offerer.gathered_local_description().await.expect("gather");
        answerer.set_remote_description(offer).await.expect("attach");
        answerer
            .create_local_description(SdpKind::Answer)
            .await
            .expect("answer");
        let answer = answerer.gathered_local_description().await.expect("gather");
        offerer.set_remote_description(answer).await.expect("attach");
        let incoming = answerer.incoming_channel().await.expect("incoming");
        channel.wait_open().await.expect("open");
        (channel, incoming)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn emits_metadata_chunks_complete() {
        let (tx, rx) = open_pair().await;
        let snapshot = Snapshot::new("a.json", vec![7u8; 40_000]);
        let progress = ProgressTracker::new();
        let report = send_snapshot(
            tx.as_ref(),
            &snapshot,
            &TransferConfig::default(),
            &progress,
            &Cancellation::new(),
        )
        .await
        .expect("send");
        assert_eq!(report.chunks, 3);
        assert_eq!(progress.current(), 100);

        let ChannelMessage::Text(first) = rx.recv().await.expect("metadata") else {
            panic!("metadata must be text");
        };
        assert!(first.contains("\"fileSize\":40000"));
        let sizes: Vec<usize> = [
            rx.recv().await.expect("chunk"),
            rx.recv().await.expect("chunk"),
            rx.recv().await.expect("chunk"),
        ]
        .iter()
        .map(ChannelMessage::len)
        .collect();
        assert_eq!(sizes, vec![16_384, 16_384, 7_232]);
        assert_eq!(
            rx.recv().await,
            Some(ChannelMessage::Text(r#"{"type":"complete"}"#.into()))
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn refuses_closed_channel() {
        let (tx, _rx) = open_pair().await;
        tx.close().await;
        let err = send_snapshot(
            tx.as_ref(),
            &Snapshot::new("a.json", vec![1u8; 10]),
            &TransferConfig::default(),
            &ProgressTracker::new(),
            &Cancellation::new(),
        )
        .await
        .expect_err("closed");
        assert!(matches!(err, HandoffError::ChannelNotReady));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn waits_for_buffer_to_drain() {
        let (tx, rx) = open_pair().await;
        let config = TransferConfig {
            buffered_high_watermark: 2048,
            buffered_poll_interval: Duration::from_millis(1),
            ..TransferConfig::default()
        }
        .with_chunk_bytes(1024);
        let snapshot = Snapshot::new("a.json", vec![3u8; 8 * 1024]);
        let progress = ProgressTracker::new();
        let cancel = Cancellation::new();

        let reader = tokio::spawn(async move {
            let mut seen = 0;
            while let Some(message) = rx.recv().await {
                seen += 1;
                if message == ChannelMessage::Text(r#"{"type":"complete"}"#.into()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            seen
        });
        let probe = tx.clone();
        let sending = send_snapshot(tx.as_ref(), &snapshot, &config, &progress, &cancel);
        let report = sending.await.expect("send");
        assert_eq!(report.chunks, 8);
        assert!(probe.buffered_amount().await <= 2048 + 1024 + 64);
        assert_eq!(reader.await.expect("reader"), 10);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn cancellation_stops_sending() {
        let (tx, _rx) = open_pair().await;
        let config = TransferConfig {
            buffered_high_watermark: 1024,
            ..TransferConfig::default()
        }
        .with_chunk_bytes(1024);
        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        // nobody reads, so the sender parks on the watermark until cancelled
        let err = send_snapshot(
            tx.as_ref(),
            &Snapshot::new("a.json", vec![0u8; 16 * 1024]),
            &config,
            &ProgressTracker::new(),
            &cancel,
        )
        .await
        .expect_err("cancelled");
        assert!(matches!(err, HandoffError::UserCancelled));
    }
}
