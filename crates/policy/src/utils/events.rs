use chrono::{Datelike, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only JSONL trail of policy decisions and updates, one file per month.
///
/// Write failures are logged and swallowed; the trail must never fail a job.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    dir: Option<PathBuf>,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// `$POSTLOOP_DATA/events`.
    pub fn in_data_dir() -> Self {
        Self::new(postloop_core::db::data_dir().join("events"))
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn write(&self, event_type: &str, payload: &Value) {
        let Some(dir) = &self.dir else {
            return;
        };
        let now = Utc::now();
        if let Err(err) = std::fs::create_dir_all(dir) {
            warn!(error = %err, "failed to create events directory");
            return;
        }

        let file_name = format!("{:04}-{:02}.jsonl", now.year(), now.month());
        let path = dir.join(file_name);

        let entry = json!({
            "ts": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            "event": event_type,
            "payload": payload,
        });

        match serde_json::to_string(&entry) {
            Ok(line) => {
                if let Err(err) = append_line(&path, &line) {
                    warn!(path = %path.display(), error = %err, "failed to write event line");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize event payload"),
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}
