//! Daily JSONL log files
//!
//! Each record is appended as one JSON line to `<dir>/YYYY-MM-DD.jsonl`.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// One log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    /// Selects the daily file; not written to the line itself.
    #[serde(skip)]
    pub date: String,
    pub session_id: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl LogRecord {
    pub fn new(session_id: impl Into<String>, level: impl Into<String>, message: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        Self {
            date: timestamp.format("%Y-%m-%d").to_string(),
            timestamp,
            session_id: session_id.into(),
            level: level.into(),
            target: String::new(),
            message: message.into(),
            fields: serde_json::Map::new(),
            file: None,
            line: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogWriter {
    logs_dir: PathBuf,
}

impl LogWriter {
    pub fn new(logs_dir: PathBuf) -> io::Result<Self> {
        if !logs_dir.exists() {
            fs::create_dir_all(&logs_dir)?;
        }

        Ok(Self { logs_dir })
    }

    pub fn get_log_file_path(&self, date: &str) -> PathBuf {
        self.logs_dir.join(format!("{}.jsonl", date))
    }

    /// Append one record under an exclusive file lock, so several proxy
    /// processes can share a log directory without interleaving lines.
    pub fn write_sync(&self, record: &LogRecord) -> io::Result<()> {
        let log_file_path = self.get_log_file_path(&record.date);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)?;
        file.lock_exclusive()?;

        let mut writer = BufWriter::with_capacity(8192, file);
        serde_json::to_writer(&mut writer, record)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        Ok(())
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }
}
