use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::diff::diff_json;
use crate::types::DeviceId;

/// How response bodies are journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    /// Every response body in full.
    Full,
    /// First body per endpoint in full, then only the JSON paths that changed.
    Diffed,
}

/// Append-only NDJSON journal of API traffic. Never sees login bodies.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
    previous: HashMap<String, Value>,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            previous: HashMap::new(),
        })
    }

    pub fn log_request(&mut self, method: &str, path: &str) {
        self.write_line(&json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "req",
            "method": method,
            "path": path,
        }));
    }

    pub fn log_command(&mut self, action: &str, device: Option<&DeviceId>, body: &Value) {
        self.write_line(&json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "cmd",
            "action": action,
            "device": device,
            "body": body,
        }));
    }

    pub fn log_response(&mut self, status: u16, path: &str, body: &Value) {
        let ts = Utc::now().to_rfc3339();
        let entry = match self.mode {
            MessageLogMode::Full => json!({
                "ts": ts,
                "dir": "resp",
                "status": status,
                "path": path,
                "body": body,
            }),
            MessageLogMode::Diffed => match self.previous.insert(path.to_string(), body.clone()) {
                None => json!({
                    "ts": ts,
                    "dir": "resp",
                    "status": status,
                    "path": path,
                    "full": true,
                    "body": body,
                }),
                Some(prev) => {
                    let mut changes = Vec::new();
                    diff_json(&prev, body, "", &mut changes);
                    let changes: Vec<Value> = changes
                        .into_iter()
                        .map(|(p, old, new)| json!({ "path": p, "old": old, "new": new }))
                        .collect();
                    json!({
                        "ts": ts,
                        "dir": "resp",
                        "status": status,
                        "path": path,
                        "changes": changes,
                    })
                }
            },
        };
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write journal entry: {e}");
        }
    }
}
