//! Per-user, per-slot experiment logs under `<root>/<user>/<slot>.log`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use wsn_common::{Telemetry, MAX_PAYLOAD};

use crate::images::is_plain_component;

/// Slot whose telemetry is currently being persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentInfo {
    pub slot_id: String,
    pub user_id: String,
}

/// One telemetry line as written to a log.
pub fn log_line(telemetry: &Telemetry) -> String {
    format!(
        "{} | {:35} | {}\n",
        telemetry.timestamp(),
        telemetry.node_id(),
        telemetry.data_text()
    )
}

pub struct ExperimentLog {
    root: PathBuf,
}

impl ExperimentLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Log file of `slot_id`. Both ids must be plain path components.
    pub fn path(&self, user_id: &str, slot_id: &str) -> io::Result<PathBuf> {
        for part in [user_id, slot_id] {
            if !is_plain_component(part) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid log path component: {:?}", part),
                ));
            }
        }
        Ok(self.root.join(user_id).join(format!("{}.log", slot_id)))
    }

    fn open(&self, user_id: &str, slot_id: &str, truncate: bool) -> io::Result<fs::File> {
        let path = self.path(user_id, slot_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        options.open(path)
    }

    /// Create the log if missing, keeping existing content.
    pub fn init(&self, info: &ExperimentInfo) -> io::Result<()> {
        self.open(&info.user_id, &info.slot_id, false).map(drop)
    }

    pub fn append(&self, info: &ExperimentInfo, telemetry: &Telemetry) -> io::Result<()> {
        let mut file = self.open(&info.user_id, &info.slot_id, false)?;
        file.write_all(log_line(telemetry).as_bytes())
    }

    pub fn clear(&self, user_id: &str, slot_id: &str) -> io::Result<()> {
        self.open(user_id, slot_id, true).map(drop)
    }

    /// Log contents for streaming, cut to what a 16-bit size prefix can describe.
    pub fn read(&self, user_id: &str, slot_id: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(user_id, slot_id)?) {
            Ok(mut data) => {
                data.truncate(MAX_PAYLOAD);
                Ok(Some(data))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete logs not modified for longer than `max_age`. Returns how many went.
    pub fn sweep(&self, max_age: Duration) -> io::Result<usize> {
        if !self.root.is_dir() {
            return Ok(0);
        }
        sweep_dir(&self.root, SystemTime::now(), max_age)
    }
}

fn sweep_dir(dir: &Path, now: SystemTime, max_age: Duration) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            removed += sweep_dir(&path, now, max_age)?;
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), "Failed to remove old log: {}", e),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info() -> ExperimentInfo {
        ExperimentInfo {
            slot_id: "slot-1".to_string(),
            user_id: "ada@example.com".to_string(),
        }
    }

    fn telemetry(node: &str, data: &str) -> Telemetry {
        Telemetry("2026-03-01T10:00:00Z".to_string(), node.to_string(), json!(data))
    }

    #[test]
    fn test_log_line_pads_node_column() {
        let line = log_line(&telemetry("node-1", "temp=21"));
        assert_eq!(
            line,
            format!("2026-03-01T10:00:00Z | node-1{} | temp=21\n", " ".repeat(29))
        );
    }

    #[test]
    fn test_init_append_read_clear() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExperimentLog::new(dir.path());
        let info = info();

        logs.init(&info).unwrap();
        assert_eq!(logs.read(&info.user_id, &info.slot_id).unwrap(), Some(vec![]));

        logs.append(&info, &telemetry("n1", "a")).unwrap();
        logs.append(&info, &telemetry("n2", "b")).unwrap();
        let data = logs.read(&info.user_id, &info.slot_id).unwrap().unwrap();
        assert_eq!(String::from_utf8(data).unwrap().lines().count(), 2);

        // init must not wipe an existing log
        logs.init(&info).unwrap();
        assert!(!logs.read(&info.user_id, &info.slot_id).unwrap().unwrap().is_empty());

        logs.clear(&info.user_id, &info.slot_id).unwrap();
        assert_eq!(logs.read(&info.user_id, &info.slot_id).unwrap(), Some(vec![]));
    }

    #[test]
    fn test_read_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExperimentLog::new(dir.path());
        assert_eq!(logs.read("ada", "nope").unwrap(), None);
    }

    #[test]
    fn test_traversing_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("experiments");
        let outside = dir.path().join("x").join("slot-1.log");
        fs::create_dir_all(outside.parent().unwrap()).unwrap();
        fs::write(&outside, b"keep").unwrap();

        let logs = ExperimentLog::new(&root);
        let err = logs.clear("../x", "slot-1").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(logs.read("ada", "../../x/slot-1").is_err());
        assert_eq!(fs::read(&outside).unwrap(), b"keep");
    }

    #[test]
    fn test_read_truncates_to_prefix_limit() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExperimentLog::new(dir.path());
        let path = logs.path("ada", "big").unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![b'x'; MAX_PAYLOAD + 100]).unwrap();

        assert_eq!(logs.read("ada", "big").unwrap().unwrap().len(), MAX_PAYLOAD);
    }

    #[test]
    fn test_sweep_removes_only_old_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExperimentLog::new(dir.path());
        logs.init(&info()).unwrap();

        assert_eq!(logs.sweep(Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(logs.sweep(Duration::from_millis(1)).unwrap(), 1);
        assert!(!logs.path("ada@example.com", "slot-1").unwrap().exists());
    }

    #[test]
    fn test_sweep_without_root() {
        let dir = tempfile::tempdir().unwrap();
        let logs = ExperimentLog::new(dir.path().join("missing"));
        assert_eq!(logs.sweep(Duration::ZERO).unwrap(), 0);
    }
}
