//! Call detail records.
//!
//! One record per multimedia dialog, pushed over a bounded channel to
//! a writer task that appends `;`-separated lines. On startup an
//! existing file is rotated away with its modification timestamp.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const CDR_FILENAME: &str = "cdrs_current.txt";
const CDR_BUFFER: usize = 1024;

const FIELDS: [&str; 11] = [
    "callId",
    "callerNumber",
    "calledNumber",
    "translatedCalledNumber",
    "callStartTime",
    "callEndTime",
    "durationSeconds",
    "callStatus",
    "callDirection",
    "callerIp",
    "terminationCause",
];

/// One finished call.
#[derive(Debug, Clone, Default)]
pub struct CdrRecord {
    pub call_id: String,
    pub caller_number: String,
    pub called_number: String,
    pub translated_called_number: String,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub status: String,
    pub direction: String,
    pub caller_ip: String,
    pub termination_cause: String,
}

fn format_time(time: Option<SystemTime>) -> String {
    match time {
        Some(t) => DateTime::<Utc>::from(t).format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        None => String::new(),
    }
}

impl CdrRecord {
    fn render(&self) -> String {
        let duration = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => end
                .duration_since(start)
                .map(|d| d.as_secs().to_string())
                .unwrap_or_default(),
            _ => String::new(),
        };
        [
            self.call_id.as_str(),
            self.caller_number.as_str(),
            self.called_number.as_str(),
            self.translated_called_number.as_str(),
            &format_time(self.start_time),
            &format_time(self.end_time),
            &duration,
            self.status.as_str(),
            self.direction.as_str(),
            self.caller_ip.as_str(),
            self.termination_cause.as_str(),
        ]
        .join(";")
    }
}

/// Handle used by the stack to emit records. A disabled writer (tests)
/// swallows them.
#[derive(Clone, Default)]
pub struct CdrWriter {
    tx: Option<mpsc::Sender<CdrRecord>>,
}

impl CdrWriter {
    /// A writer that drops every record.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Rotates any current file and starts the writer task in `dir`.
    pub async fn start(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(CDR_FILENAME);
        rotate_existing(&path).await;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(FIELDS.join(";").as_bytes()).await?;
        file.write_all(b"\n").await?;

        let (tx, mut rx) = mpsc::channel::<CdrRecord>(CDR_BUFFER);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let line = record.render();
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    tracing::warn!(%err, "error writing CDR line");
                    continue;
                }
                let _ = file.write_all(b"\n").await;
                let _ = file.flush().await;
            }
        });

        Ok(CdrWriter { tx: Some(tx) })
    }

    pub fn push(&self, record: CdrRecord) {
        if let Some(tx) = &self.tx {
            if tx.try_send(record).is_err() {
                tracing::warn!("CDR buffer full - record dropped");
            }
        }
    }
}

async fn rotate_existing(path: &PathBuf) {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return;
    };
    let stamp = meta
        .modified()
        .map(|t| DateTime::<Utc>::from(t).format("%Y%m%dT%H%M%S").to_string())
        .unwrap_or_else(|_| "old".to_string());
    let rotated = path.with_file_name(CDR_FILENAME.replace("current", &stamp));
    if let Err(err) = tokio::fs::rename(path, &rotated).await {
        tracing::warn!(%err, "error renaming existing CDR file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn render_joins_fields_in_order() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let record = CdrRecord {
            call_id: "cid".into(),
            caller_number: "alice".into(),
            called_number: "+12025550101".into(),
            translated_called_number: "12025550101".into(),
            start_time: Some(start),
            end_time: Some(start + Duration::from_secs(65)),
            status: "Cleared".into(),
            direction: "Inbound".into(),
            caller_ip: "192.0.2.4:5060".into(),
            termination_cause: "Caller cleared the call".into(),
        };
        let line = record.render();
        let fields: Vec<&str> = line.split(';').collect();
        assert_eq!(fields.len(), FIELDS.len());
        assert_eq!(fields[0], "cid");
        assert_eq!(fields[6], "65");
        assert_eq!(fields[7], "Cleared");
    }

    #[tokio::test]
    async fn writer_appends_lines() {
        let dir = std::env::temp_dir().join(format!("cdr-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let writer = CdrWriter::start(&dir).await.unwrap();
        writer.push(CdrRecord {
            call_id: "abc".into(),
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let content = tokio::fs::read_to_string(dir.join(CDR_FILENAME)).await.unwrap();
        assert!(content.starts_with("callId;"));
        assert!(content.contains("abc;"));
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
