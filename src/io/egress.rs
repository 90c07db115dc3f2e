//! Alert journal - appends every alert snapshot to a JSONL file
//!
//! Registered as a hub observer, so each status change produces one line.

use crate::domain::alert::Alert;
use crate::services::hub::AlertObserver;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub struct AlertJournal {
    file_path: PathBuf,
    device_id: String,
}

impl AlertJournal {
    pub fn new<P: AsRef<Path>>(file_path: P, device_id: &str) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        info!(file_path = %file_path.display(), "alert_journal_initialized");
        Self { file_path, device_id: device_id.to_string() }
    }

    /// Returns true if the snapshot was written
    pub fn write_alert(&self, alert: &Alert) -> bool {
        let json = alert.to_json_with_device(&self.device_id);
        match self.append_line(&json) {
            Ok(()) => {
                debug!(alert_id = %alert.id, status = %alert.status.as_str(), "alert_journaled");
                true
            }
            Err(e) => {
                error!(alert_id = %alert.id, error = %e, "alert_journal_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        writeln!(file, "{}", line)
    }
}

impl AlertObserver for AlertJournal {
    fn on_alert(&self, alert: &Alert) {
        self.write_alert(alert);
    }
}
