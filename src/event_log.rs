use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Append-only JSON-lines audit trail of lock, swap and refresh events.
/// Writes are best-effort: a broken log never fails the operation it describes.
pub struct EventLog {
    log_dir: PathBuf,
    log_file: PathBuf,
    max_log_bytes: u64,
}

impl EventLog {
    pub fn new(log_dir: PathBuf) -> Self {
        let log_file = log_dir.join("events.log");
        Self {
            log_dir,
            log_file,
            max_log_bytes: 5 * 1024 * 1024,
        }
    }

    pub fn write(&self, event: &str, fields: &[(&str, Option<String>)]) {
        if let Err(err) = self.write_inner(event, fields) {
            tracing::debug!(event, error = %err, "event log write failed");
        }
    }

    fn write_inner(&self, event: &str, fields: &[(&str, Option<String>)]) -> std::io::Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        self.rotate_if_needed()?;

        let mut payload = Map::new();
        payload.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        payload.insert("event".to_string(), Value::String(event.to_string()));
        payload.insert("pid".to_string(), Value::from(std::process::id()));
        for (key, value) in fields {
            let Some(value) = value else { continue };
            let trimmed = value.trim();
            if trimmed.is_empty() {
                continue;
            }
            payload.insert((*key).to_string(), Value::String(trimmed.to_string()));
        }

        let line = format!("{}\n", Value::Object(payload));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
        file.write_all(line.as_bytes())
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let size = match fs::metadata(&self.log_file) {
            Ok(metadata) => metadata.len(),
            Err(_) => return Ok(()),
        };
        if size <= self.max_log_bytes {
            return Ok(());
        }

        let rotated = self.log_dir.join("events.log.1");
        if rotated.exists() {
            let _ = fs::remove_file(&rotated);
        }
        fs::rename(&self.log_file, rotated)
    }
}

pub fn short_hash_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)[..16].to_string()
}

/// Stable, non-reversible label for a token so logs can correlate rotations.
pub fn token_fingerprint(token: Option<&str>) -> Option<String> {
    let raw = token?.trim();
    if raw.is_empty() {
        return None;
    }
    Some(short_hash_hex(raw.as_bytes()))
}

pub fn next_trace_id() -> String {
    let counter = TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| Utc::now().timestamp_micros() * 1_000);
    let seed = format!("{}:{}:{}", now, std::process::id(), counter);
    short_hash_hex(seed.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_one_json_object_per_line_and_skips_blank_fields() {
        let temp = TempDir::new().expect("temp dir");
        let log = EventLog::new(temp.path().join("logs"));
        log.write(
            "lock_acquired",
            &[
                ("trace_id", Some("t-1".to_string())),
                ("account", Some("work".to_string())),
                ("owner", Some("   ".to_string())),
                ("reason", None),
            ],
        );
        log.write("lock_released", &[("trace_id", Some("t-1".to_string()))]);

        let content = fs::read_to_string(temp.path().join("logs/events.log")).expect("read log");
        let lines: Vec<Value> = content
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "lock_acquired");
        assert_eq!(lines[0]["account"], "work");
        assert!(lines[0].get("owner").is_none());
        assert!(lines[0].get("reason").is_none());
        assert_eq!(lines[1]["event"], "lock_released");
    }

    #[test]
    fn rotates_when_over_size_limit() {
        let temp = TempDir::new().expect("temp dir");
        let mut log = EventLog::new(temp.path().to_path_buf());
        log.max_log_bytes = 10;
        log.write("first", &[("detail", Some("x".repeat(32)))]);
        log.write("second", &[]);

        assert!(temp.path().join("events.log.1").exists());
        let current = fs::read_to_string(temp.path().join("events.log")).expect("read");
        assert!(current.contains("\"second\""));
        assert!(!current.contains("\"first\""));
    }

    #[test]
    fn fingerprints_are_short_and_never_echo_the_token() {
        let fp = token_fingerprint(Some("rt-secret")).expect("fingerprint");
        assert_eq!(fp.len(), 16);
        assert!(!fp.contains("secret"));
        assert!(token_fingerprint(Some("  ")).is_none());
        assert_ne!(next_trace_id(), next_trace_id());
    }
}
