//! The blob that travels over the channel, where it comes from on the sending
//! device and where it lands on the receiving one.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use time::Date;
use tracing::{debug, info};

use crate::error::Result;

pub const FALLBACK_FILE_NAME: &str = "database-backup.json";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub file_name: String,
    pub bytes: Bytes,
}

pub fn backup_file_name(date: Date) -> String {
    format!(
        "database-backup-{:04}-{:02}-{:02}.json",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

impl Snapshot {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    /// Serializes an export the way the storage layer writes backups:
    /// pretty-printed with two-space indentation.
    pub fn from_export(export: &Value, date: Date) -> Result<Self> {
        let bytes = serde_json::to_vec_pretty(export).map_err(io::Error::from)?;
        Ok(Self::new(backup_file_name(date), bytes))
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice::<serde::de::IgnoredAny>(&bytes).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a JSON export: {err}", path.display()),
            )
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
        Ok(Self::new(file_name, bytes))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub students: usize,
    pub attendance: usize,
    pub export_date: Option<String>,
    pub version: Option<String>,
}

/// Best-effort look inside a received export. `None` when the blob is not a
/// JSON object; the transfer itself does not care.
pub fn summarize(bytes: &[u8]) -> Option<SnapshotSummary> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let object = value.as_object()?;
    let count = |key: &str| object.get(key).and_then(Value::as_array).map_or(0, Vec::len);
    let text = |key: &str| {
        object.get(key).and_then(|value| match value {
            Value::String(text) => Some(text.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    };
    Some(SnapshotSummary {
        students: count("students"),
        attendance: count("attendance"),
        export_date: text("exportDate"),
        version: text("version"),
    })
}

/// Receives the reassembled blob. Called at most once per completed transfer.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Returns where the snapshot ended up, if it has a location.
    async fn persist(&self, snapshot: &Snapshot) -> Result<Option<PathBuf>>;
}

/// Writes snapshots into a download directory.
#[derive(Clone, Debug)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Strips any directory components a peer put in the name.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match last {
        "" | "." | ".." => FALLBACK_FILE_NAME.to_string(),
        name => name.to_string(),
    }
}

#[async_trait]
impl SnapshotSink for DirectorySink {
    async fn persist(&self, snapshot: &Snapshot) -> Result<Option<PathBuf>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(sanitize_file_name(&snapshot.file_name));
        tokio::fs::write(&path, &snapshot.bytes).await?;
        info!(
            target = "handoff::snapshot",
            path = %path.display(),
            bytes = snapshot.len(),
            "snapshot saved"
        );
        Ok(Some(path))
    }
}

/// Keeps delivered snapshots in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Snapshot>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<Snapshot> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn persist(&self, snapshot: &Snapshot) -> Result<Option<PathBuf>> {
        debug!(
            target = "handoff::snapshot",
            file_name = %snapshot.file_name,
            bytes = snapshot.len(),
            "snapshot kept in memory"
        );
        self.delivered.lock().push(snapshot.clone());
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempdir::TempDir;
    use time::macros::date;

    #[test]
    fn export_is_named_by_date_and_pretty_printed() {
        let export = json!({"students": [{"id": 1}], "attendance": [], "version": "1.0"});
        let snapshot = Snapshot::from_export(&export, date!(2025 - 01 - 01)).expect("export");
        assert_eq!(snapshot.file_name, "database-backup-2025-01-01.json");
        let text = std::str::from_utf8(&snapshot.bytes).expect("utf8");
        assert!(text.starts_with("{\n  \"students\""));
    }

    #[test]
    fn summary_counts_records() {
        let export = json!({
            "students": [{"id": 1}, {"id": 2}],
            "attendance": [{"studentId": 1}],
            "exportDate": "2025-01-01T08:00:00.000Z",
            "version": 1
        });
        let summary = summarize(&serde_json::to_vec(&export).unwrap()).expect("summary");
        assert_eq!(summary.students, 2);
        assert_eq!(summary.attendance, 1);
        assert_eq!(summary.export_date.as_deref(), Some("2025-01-01T08:00:00.000Z"));
        assert_eq!(summary.version.as_deref(), Some("1"));
        assert!(summarize(b"\x00\x01").is_none());
    }

    #[test]
    fn sanitize_keeps_only_the_last_component() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\backup.json"), "backup.json");
        assert_eq!(sanitize_file_name("dir/"), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name(".."), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name(" "), FALLBACK_FILE_NAME);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn directory_sink_writes_under_received_name() {
        let dir = TempDir::new("handoff-sink").expect("tempdir");
        let sink = DirectorySink::new(dir.path().join("downloads"));
        let snapshot = Snapshot::new("../database-backup-2025-01-01.json", &b"{}"[..]);
        let path = sink.persist(&snapshot).await.expect("persist").expect("path");
        assert_eq!(path, dir.path().join("downloads/database-backup-2025-01-01.json"));
        assert_eq!(tokio::fs::read(&path).await.expect("read"), b"{}");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn from_file_rejects_non_json() {
        let dir = TempDir::new("handoff-source").expect("tempdir");
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"not json").await.expect("write");
        assert!(Snapshot::from_file(&path).await.is_err());

        let path = dir.path().join("export.json");
        tokio::fs::write(&path, b"{\"students\":[]}").await.expect("write");
        let snapshot = Snapshot::from_file(&path).await.expect("read");
        assert_eq!(snapshot.file_name, "export.json");
    }
}
