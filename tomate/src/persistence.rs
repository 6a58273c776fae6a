use crate::recorder::{
    CompletedSession, NewSession, RecordId, RecorderError, SessionHistory, SessionRecorder,
};
use anyhow::Result;
use chrono::{DateTime, Local};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Default, Serialize, Deserialize)]
struct StoreFile {
    next_id: RecordId,
    sessions: Vec<CompletedSession>,
}

/// Session history kept as one JSON document in the data directory.
pub struct JsonSessionStore {
    path: PathBuf,
    file: Mutex<StoreFile>,
}

impl JsonSessionStore {
    pub fn default_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "tomate", "tomate")
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

        let data_dir = proj_dirs.data_dir();
        fs::create_dir_all(data_dir)?;

        Ok(data_dir.join("sessions.json"))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RecorderError> {
        let path = path.into();
        let file = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            StoreFile::default()
        };
        info!(path = %path.display(), sessions = file.sessions.len(), "session store opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, file: &StoreFile) -> Result<(), RecorderError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(file)?;
        // write-then-rename so a crash never leaves a truncated history
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreFile> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionRecorder for JsonSessionStore {
    fn record_completed_session(&self, session: &NewSession) -> Result<RecordId, RecorderError> {
        let mut file = self.lock();
        let id = file.next_id + 1;
        let record = session.clone().into_record(id)?;
        file.sessions.push(record);
        file.next_id = id;
        if let Err(err) = self.save(&file) {
            file.sessions.pop();
            file.next_id = id - 1;
            return Err(err);
        }
        debug!(id, kind = %session.kind, "session recorded");
        Ok(id)
    }
}

impl SessionHistory for JsonSessionStore {
    fn sessions(&self) -> Result<Vec<CompletedSession>, RecorderError> {
        Ok(self.lock().sessions.clone())
    }

    fn purge_started_before(&self, cutoff: DateTime<Local>) -> Result<usize, RecorderError> {
        let mut file = self.lock();
        let before = file.sessions.len();
        let kept: Vec<CompletedSession> = file
            .sessions
            .iter()
            .filter(|s| s.start_time >= cutoff)
            .cloned()
            .collect();
        let purged = before - kept.len();
        if purged > 0 {
            let previous = std::mem::replace(&mut file.sessions, kept);
            if let Err(err) = self.save(&file) {
                file.sessions = previous;
                return Err(err);
            }
            info!(purged, "expired sessions removed");
        }
        Ok(purged)
    }
}
