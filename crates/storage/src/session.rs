use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use qqgate_core::{Paths, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Everything a gateway needs to resume instead of re-identify, persisted
/// per account so a restart can re-attach to the old session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_seq: Option<u64>,
    #[serde(default)]
    pub last_connected_at: i64,
    #[serde(default)]
    pub intent_level_index: usize,
    #[serde(default)]
    pub last_successful_intent_level: Option<usize>,
    #[serde(default)]
    pub saved_at: i64,
}

impl SessionState {
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.last_seq.is_some()
    }
}

#[derive(Debug, Default)]
struct Entry {
    state: SessionState,
    dirty: bool,
}

/// On-disk session store keyed by account id. `last_seq` advances on every
/// dispatch frame, so writes go through a dirty flag and a periodic flusher
/// instead of hitting the filesystem per frame; READY/RESUMED and session
/// clears flush immediately.
pub struct SessionStore {
    paths: Paths,
    inner: Mutex<HashMap<String, Entry>>,
}

impl SessionStore {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Load the persisted state for an account into memory. Missing or
    /// corrupt files are treated as absent.
    pub fn load(&self, account_id: &str) -> Option<SessionState> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get(account_id) {
            return Some(entry.state.clone());
        }
        let path = self.paths.session_file(account_id);
        if !path.exists() {
            return None;
        }
        let state: SessionState = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(s) => s,
                Err(e) => {
                    warn!(account = %account_id, error = %e, "Corrupt session file, ignoring");
                    return None;
                }
            },
            Err(e) => {
                warn!(account = %account_id, error = %e, "Failed to read session file");
                return None;
            }
        };
        inner.insert(
            account_id.to_string(),
            Entry {
                state: state.clone(),
                dirty: false,
            },
        );
        Some(state)
    }

    /// Mutate the in-memory state and mark it dirty for the next flush.
    pub fn update<F>(&self, account_id: &str, f: F)
    where
        F: FnOnce(&mut SessionState),
    {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(account_id.to_string()).or_default();
        f(&mut entry.state);
        entry.dirty = true;
    }

    /// Record a dispatch sequence number (lazy-persisted).
    pub fn update_seq(&self, account_id: &str, seq: u64) {
        self.update(account_id, |s| s.last_seq = Some(seq));
    }

    /// Drop session identity (unresumable invalid-session path) and persist
    /// immediately so a crash cannot resurrect the dead session.
    pub fn clear_session(&self, account_id: &str) -> Result<()> {
        self.update(account_id, |s| {
            s.session_id = None;
            s.last_seq = None;
        });
        self.save_now(account_id)
    }

    pub fn get(&self, account_id: &str) -> Option<SessionState> {
        self.inner
            .lock()
            .unwrap()
            .get(account_id)
            .map(|e| e.state.clone())
    }

    /// Write one account's state to disk now.
    pub fn save_now(&self, account_id: &str) -> Result<()> {
        let state = {
            let mut inner = self.inner.lock().unwrap();
            match inner.get_mut(account_id) {
                Some(entry) => {
                    entry.dirty = false;
                    entry.state.saved_at = chrono::Utc::now().timestamp_millis();
                    entry.state.clone()
                }
                None => return Ok(()),
            }
        };
        self.write_file(account_id, &state)
    }

    /// Write every dirty account. Called by the flusher task.
    pub fn flush_dirty(&self) -> Result<()> {
        let dirty: Vec<(String, SessionState)> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .iter_mut()
                .filter(|(_, e)| e.dirty)
                .map(|(id, e)| {
                    e.dirty = false;
                    e.state.saved_at = chrono::Utc::now().timestamp_millis();
                    (id.clone(), e.state.clone())
                })
                .collect()
        };
        for (id, state) in dirty {
            self.write_file(&id, &state)?;
        }
        Ok(())
    }

    fn write_file(&self, account_id: &str, state: &SessionState) -> Result<()> {
        let path = self.paths.session_file(account_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(state)?)?;
        debug!(account = %account_id, seq = ?state.last_seq, "Session state saved");
        Ok(())
    }

    /// Background flusher: coalesces seq updates into at most one write per
    /// second per account. Exits on shutdown after a final flush.
    pub async fn run_flusher(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.flush_dirty() {
                        warn!(error = %e, "Session flush failed");
                    }
                }
                _ = shutdown.recv() => {
                    if let Err(e) = self.flush_dirty() {
                        warn!(error = %e, "Final session flush failed");
                    }
                    break;
                }
            }
        }
    }
}
