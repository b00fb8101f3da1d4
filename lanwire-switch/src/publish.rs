//! Publish sinks for neighbor and point records.
//!
//! Publishing is fire-and-forget: a sink never blocks the caller and never
//! reports failure back to it. Failures are logged by the sink.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Field map of one published record.
pub type Fields = Map<String, Value>;

/// Records buffered for the file writer.
const PUBLISH_QUEUE: usize = 1024;

#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, key: &str, fields: Fields);

    /// Flush buffered records.
    async fn close(&self) {}
}

/// Writes records to the log.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    fn publish(&self, key: &str, fields: Fields) {
        debug!(key, fields = %serde_json::Value::Object(fields), "Published");
    }
}

/// Appends records as JSON lines to a file from a background task.
pub struct FilePublisher {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FilePublisher {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let (tx, mut rx) = mpsc::channel::<String>(PUBLISH_QUEUE);
        let path_display = path.display().to_string();
        let task = tokio::spawn(async move {
            while let Some(mut line) = rx.recv().await {
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(path = %path_display, error = %e, "Failed to write published record");
                }
            }
            if let Err(e) = file.flush().await {
                warn!(path = %path_display, error = %e, "Failed to flush published records");
            }
        });
        info!(path = %path.display(), "Publishing records to file");
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        })
    }
}

#[async_trait]
impl Publisher for FilePublisher {
    fn publish(&self, key: &str, fields: Fields) {
        let Some(tx) = self.tx.lock().ok().and_then(|tx| tx.clone()) else {
            return;
        };
        let line = json!({
            "key": key,
            "time": Utc::now().to_rfc3339(),
            "fields": fields,
        })
        .to_string();
        if tx.try_send(line).is_err() {
            debug!(key, "Publish queue full, record dropped");
        }
    }

    async fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_publisher_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let publisher = FilePublisher::open(&path).await.unwrap();

        let mut fields = Fields::new();
        fields.insert("ipaddr".into(), json!("10.0.0.5"));
        publisher.publish("neighbor:aa-bb-cc-dd-ee-ff", fields);
        publisher.publish("neighbor:aa-bb-cc-dd-ee-00", Fields::new());
        publisher.close().await;

        let data = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = data
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key"], "neighbor:aa-bb-cc-dd-ee-ff");
        assert_eq!(lines[0]["fields"]["ipaddr"], "10.0.0.5");
    }

    #[tokio::test]
    async fn test_publish_after_close_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = FilePublisher::open(&dir.path().join("r.jsonl")).await.unwrap();
        publisher.close().await;
        publisher.publish("late", Fields::new());
    }
}
