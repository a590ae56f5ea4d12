//! JSON-lines delivery journal.
//!
//! Every appended attempt snapshot becomes one line. The file is replayed
//! into memory on open, so a restarted relay sees the attempts of previous
//! runs and can resume unfinished deliveries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use hookrelay_webhooks::{
    AttemptFilter, AttemptLog, DeliveryAttempt, DeliveryStore, WebhookError, WebhookResult,
};

struct JournalState {
    file: File,
    log: AttemptLog,
}

/// File-backed [`DeliveryStore`].
pub struct JournalStore {
    path: PathBuf,
    state: Mutex<JournalState>,
}

impl JournalStore {
    /// Opens (or creates) a journal, replaying existing records.
    ///
    /// Lines that fail to parse are skipped with a warning.
    pub async fn open(path: impl AsRef<Path>) -> WebhookResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(storage_error)?;
        }

        let mut log = AttemptLog::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<DeliveryAttempt>(line) {
                        Ok(attempt) => log.append(attempt),
                        Err(e) => tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %e,
                            "Skipping unreadable journal line"
                        ),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(storage_error(e)),
        }

        let file = open_append(&path).await?;
        tracing::debug!(path = %path.display(), attempts = log.len(), "Opened delivery journal");

        Ok(Self {
            path,
            state: Mutex::new(JournalState { file, log }),
        })
    }

    /// Journal location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of distinct attempts in the journal.
    pub async fn len(&self) -> usize {
        self.state.lock().await.log.len()
    }

    /// Whether the journal holds no attempts.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn open_append(path: &Path) -> WebhookResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(storage_error)
}

fn storage_error(e: std::io::Error) -> WebhookError {
    WebhookError::Storage(e.to_string())
}

fn encode(attempt: &DeliveryAttempt) -> WebhookResult<Vec<u8>> {
    let mut line = serde_json::to_vec(attempt)?;
    line.push(b'\n');
    Ok(line)
}

#[async_trait]
impl DeliveryStore for JournalStore {
    async fn append(&self, attempt: &DeliveryAttempt) -> WebhookResult<()> {
        let line = encode(attempt)?;
        let mut state = self.state.lock().await;
        state.file.write_all(&line).await.map_err(storage_error)?;
        state.file.flush().await.map_err(storage_error)?;
        state.log.append(attempt.clone());
        Ok(())
    }

    async fn query(&self, filter: &AttemptFilter) -> WebhookResult<Vec<DeliveryAttempt>> {
        Ok(self.state.lock().await.log.query(filter))
    }

    async fn history(&self, attempt_id: &str) -> WebhookResult<Vec<DeliveryAttempt>> {
        Ok(self.state.lock().await.log.history(attempt_id))
    }

    /// Rewrites the journal without the pruned attempts.
    async fn prune(&self, older_than: DateTime<Utc>) -> WebhookResult<usize> {
        let mut state = self.state.lock().await;
        let removed = state.log.prune(older_than);
        if removed == 0 {
            return Ok(0);
        }

        let mut content = Vec::new();
        for attempt in state.log.snapshots() {
            content.extend(encode(attempt)?);
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, &content).await.map_err(storage_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(storage_error)?;
        state.file = open_append(&self.path).await?;

        tracing::info!(path = %self.path.display(), removed, "Pruned delivery journal");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookrelay_webhooks::{AttemptState, Event, Webhook};

    fn attempt(event_id: &str) -> DeliveryAttempt {
        let webhook = Webhook::new("t1", "https://example.com/hook", "s").with_id("w1");
        let event = Event::new("order.updated", "t1", serde_json::json!({ "n": 1 })).with_id(event_id);
        DeliveryAttempt::first(&webhook, event.envelope(), Utc::now())
    }

    #[tokio::test]
    async fn test_replays_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("journal.jsonl");

        let mut a = attempt("e1");
        {
            let journal = JournalStore::open(&path).await.unwrap();
            journal.append(&a).await.unwrap();
            a.start(Utc::now()).unwrap();
            journal.append(&a).await.unwrap();
        }

        let journal = JournalStore::open(&path).await.unwrap();
        let all = journal.query(&AttemptFilter::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, AttemptState::InFlight);
        assert_eq!(all[0].envelope.data["n"], 1);
        assert_eq!(journal.history(&a.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let good = attempt("e1");
        let content = format!(
            "{}\nnot json\n\n",
            serde_json::to_string(&good).unwrap()
        );
        tokio::fs::write(&path, content).await.unwrap();

        let journal = JournalStore::open(&path).await.unwrap();
        assert_eq!(journal.len().await, 1);

        journal.append(&attempt("e2")).await.unwrap();
        assert_eq!(journal.len().await, 2);
    }

    #[tokio::test]
    async fn test_prune_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = JournalStore::open(&path).await.unwrap();

        let mut old = attempt("old");
        old.scheduled_at = Utc::now() - chrono::Duration::days(60);
        journal.append(&old).await.unwrap();
        journal.append(&attempt("fresh")).await.unwrap();

        let removed = journal
            .prune(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        journal.append(&attempt("after")).await.unwrap();
        drop(journal);

        let reopened = JournalStore::open(&path).await.unwrap();
        let events: Vec<String> = reopened
            .query(&AttemptFilter::new())
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.event_id)
            .collect();
        assert_eq!(events, vec!["fresh".to_string(), "after".to_string()]);
    }
}
