//! JSON-lines file sink.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{DeadLetterRecord, DeadLetterSink, Result, WriteOutcome};

/// Appends each record as one JSON line.
///
/// Writes are serialized through a mutex so concurrent workers never
/// interleave partial lines. The source keys already in the file are loaded
/// on the first write, so a record redelivered after a restart is not
/// appended twice.
pub struct JsonlDeadLetterSink {
    path: PathBuf,
    seen: Mutex<Option<HashSet<String>>>,
}

impl JsonlDeadLetterSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seen: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn load_seen(&self) -> Result<HashSet<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(e.into()),
        };
        let mut seen = HashSet::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DeadLetterRecord>(line) {
                Ok(record) => {
                    seen.insert(record.source_key());
                }
                Err(e) => tracing::warn!(
                    "Ignoring unreadable line {} of {}: {}",
                    number + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(seen)
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetterSink {
    async fn write(&self, record: &DeadLetterRecord) -> Result<WriteOutcome> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let key = record.source_key();

        let mut guard = self.seen.lock().await;
        let loaded = match guard.take() {
            Some(seen) => seen,
            None => self.load_seen().await?,
        };
        let seen = guard.insert(loaded);
        if seen.contains(&key) {
            tracing::debug!("Dead letter {} already in {}", key, self.path.display());
            return Ok(WriteOutcome::Duplicate);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        seen.insert(key);
        tracing::debug!(
            "Wrote dead letter for {} at {} to {}",
            record.partition,
            record.position,
            self.path.display()
        );
        Ok(WriteOutcome::Stored)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
