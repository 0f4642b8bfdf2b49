use std::env;
use std::ops::RangeInclusive;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;
pub const DEFAULT_BUFFERED_WATERMARK: usize = 1024 * 1024;
pub const DEFAULT_BUFFERED_POLL: Duration = Duration::from_millis(5);
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PAYLOAD_MAX_AGE: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CHANNEL_LABEL: &str = "fileTransfer";

const MIN_CHUNK_BYTES: usize = 1024;

/// Knobs for one transfer attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_bytes: usize,
    /// Sender waits until the channel's buffered amount is at or below this.
    pub buffered_high_watermark: usize,
    pub buffered_poll_interval: Duration,
    pub gather_timeout: Duration,
    pub channel_open_timeout: Duration,
    pub payload_max_age: Duration,
    pub channel_label: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            buffered_high_watermark: DEFAULT_BUFFERED_WATERMARK,
            buffered_poll_interval: DEFAULT_BUFFERED_POLL,
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            channel_open_timeout: DEFAULT_OPEN_TIMEOUT,
            payload_max_age: DEFAULT_PAYLOAD_MAX_AGE,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
        }
    }
}

impl TransferConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk_bytes: parse_usize_env(
                "HANDOFF_CHUNK_BYTES",
                DEFAULT_CHUNK_BYTES,
                MIN_CHUNK_BYTES..=DEFAULT_CHUNK_BYTES,
            ),
            buffered_high_watermark: parse_usize_env(
                "HANDOFF_BUFFERED_WATERMARK",
                DEFAULT_BUFFERED_WATERMARK,
                MIN_CHUNK_BYTES..=usize::MAX,
            ),
            gather_timeout: parse_millis_env("HANDOFF_GATHER_TIMEOUT_MS", DEFAULT_GATHER_TIMEOUT),
            channel_open_timeout: parse_millis_env("HANDOFF_OPEN_TIMEOUT_MS", DEFAULT_OPEN_TIMEOUT),
            payload_max_age: Duration::from_secs(parse_usize_env(
                "HANDOFF_PAYLOAD_MAX_AGE_SECS",
                DEFAULT_PAYLOAD_MAX_AGE.as_secs() as usize,
                1..=usize::MAX,
            ) as u64),
            ..defaults
        }
    }

    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    /// Data frames never exceed `DEFAULT_CHUNK_BYTES`; larger values are
    /// clamped down to it.
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.clamp(1, DEFAULT_CHUNK_BYTES);
        self
    }

    /// Number of data frames a blob of `len` bytes is split into.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_bytes.max(1))
    }
}

/// ICE servers handed to the platform connection. Empty means host
/// candidates only, which is what a fully offline exchange needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IceConfig {
    pub servers: Vec<String>,
}

impl IceConfig {
    pub fn from_env() -> Self {
        let servers = env::var("HANDOFF_ICE_SERVERS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self { servers }
    }
}

fn parse_millis_env(var: &str, default: Duration) -> Duration {
    let millis = parse_usize_env(var, default.as_millis() as usize, 1..=usize::MAX);
    Duration::from_millis(millis as u64)
}

fn parse_usize_env(var: &str, default: usize, bounds: RangeInclusive<usize>) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if bounds.contains(&parsed) => parsed,
            Ok(parsed) => {
                warn!(
                    target = "handoff::config",
                    var,
                    parsed,
                    min = *bounds.start(),
                    max = *bounds.end(),
                    default,
                    "config value out of range; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "handoff::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
