//! On-disk layout for saved agent state and session metadata.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::naming::parse_container_name;

/// `session_id` is opaque and globally unique; generated fresh for a new
/// session and reused verbatim across resumes.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMetadata {
    pub session_id: String,
    pub container_name: String,
    pub persistent: bool,
    pub workspace: PathBuf,
    pub saved_at: DateTime<Utc>,
    /// Which tool (agent) this session belongs to — lets a saved-session
    /// directory self-describe without consulting its parent subdir name.
    pub tool_name: String,
}

pub struct SessionStore {
    /// `<base>/<sessions-subdir>` — tool-specific so multiple agents coexist.
    root: PathBuf,
}

impl SessionStore {
    pub fn new(base: &Path, sessions_subdir: &str) -> Self {
        Self {
            root: base.join(sessions_subdir),
        }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn metadata_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("metadata.json")
    }

    pub fn config_dir_path(&self, session_id: &str, config_dir_name: &str) -> PathBuf {
        self.session_dir(session_id).join(config_dir_name)
    }

    /// Metadata is written early — at session start, before any agent state
    /// exists — so listings show correct persistent/ephemeral classification
    /// even for a session that is still running.
    pub fn write_metadata(&self, metadata: &SessionMetadata) -> Result<(), SessionError> {
        let dir = self.session_dir(&metadata.session_id);
        fs::create_dir_all(&dir)?;
        let path = self.metadata_path(&metadata.session_id);
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(&path, json)?;
        debug!(session_id = %metadata.session_id, ?path, "wrote session metadata");
        Ok(())
    }

    pub fn load_metadata(&self, session_id: &str) -> Result<SessionMetadata, SessionError> {
        let path = self.metadata_path(session_id);
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(SessionError::Json)
    }

    /// "Has the agent's config subdirectory actually been saved at least
    /// once" — distinct from "does the session directory / metadata exist".
    pub fn session_exists(&self, session_id: &str, config_dir_name: &str) -> bool {
        self.config_dir_path(session_id, config_dir_name).is_dir()
    }

    /// Among all saved sessions whose `container_name` encodes this
    /// workspace's hash, return the id with the most recent `saved_at`.
    /// Sessions with missing or malformed metadata are skipped silently —
    /// one corrupt save must not block resume for every other session.
    pub fn latest_session_for_workspace(&self, workspace: &Path) -> Option<String> {
        let target_hash = crate::naming::workspace_hash(workspace);
        let mut best: Option<(String, DateTime<Utc>)> = None;

        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return None,
        };

        for entry in entries.flatten() {
            let session_id = entry.file_name().to_string_lossy().into_owned();
            let metadata = match self.load_metadata(&session_id) {
                Ok(m) => m,
                Err(e) => {
                    warn!(session_id, error = %e, "skipping session with unreadable metadata");
                    continue;
                }
            };

            let Some((hash, _slot)) = parse_container_name(&metadata.container_name) else {
                continue;
            };
            if hash != target_hash {
                continue;
            }

            if best.as_ref().map(|(_, t)| metadata.saved_at > *t).unwrap_or(true) {
                best = Some((session_id, metadata.saved_at));
            }
        }

        best.map(|(id, _)| id)
    }

    pub fn all_session_ids(&self) -> Vec<String> {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().is_dir())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(id: &str, container_name: &str, saved_at: DateTime<Utc>) -> SessionMetadata {
        SessionMetadata {
            session_id: id.to_string(),
            container_name: container_name.to_string(),
            persistent: false,
            workspace: PathBuf::from("/tmp/proj"),
            saved_at,
            tool_name: "claude".to_string(),
        }
    }

    #[test]
    fn metadata_round_trips() {
        let base = tempdir().unwrap();
        let store = SessionStore::new(base.path(), "sessions-claude");
        let m = meta("abc", "coi-deadbeef-1", Utc::now());
        store.write_metadata(&m).unwrap();
        let loaded = store.load_metadata("abc").unwrap();
        assert_eq!(loaded, m);
    }

    #[test]
    fn latest_session_picks_most_recent_for_same_workspace_hash() {
        let base = tempdir().unwrap();
        let store = SessionStore::new(base.path(), "sessions-claude");
        let workspace = PathBuf::from("/tmp/proj");
        let hash = crate::naming::workspace_hash(&workspace);

        let older = Utc::now() - chrono::Duration::hours(1);
        let newer = Utc::now();

        store
            .write_metadata(&meta("old", &format!("coi-{}-1", hash), older))
            .unwrap();
        store
            .write_metadata(&meta("new", &format!("coi-{}-2", hash), newer))
            .unwrap();

        // A session for a *different* workspace hash but coincidentally
        // newer must not be picked.
        let other_hash = crate::naming::workspace_hash(&PathBuf::from("/tmp/other"));
        store
            .write_metadata(&meta(
                "other",
                &format!("coi-{}-1", other_hash),
                newer + chrono::Duration::hours(2),
            ))
            .unwrap();

        let latest = store.latest_session_for_workspace(&workspace).unwrap();
        assert_eq!(latest, "new");
    }

    #[test]
    fn malformed_metadata_is_skipped_not_fatal() {
        let base = tempdir().unwrap();
        let store = SessionStore::new(base.path(), "sessions-claude");
        let broken_dir = base.path().join("sessions-claude").join("broken");
        fs::create_dir_all(&broken_dir).unwrap();
        fs::write(broken_dir.join("metadata.json"), "not json").unwrap();

        let workspace = PathBuf::from("/tmp/proj");
        assert!(store.latest_session_for_workspace(&workspace).is_none());
    }

    #[test]
    fn session_exists_requires_config_dir_present() {
        let base = tempdir().unwrap();
        let store = SessionStore::new(base.path(), "sessions-claude");
        assert!(!store.session_exists("abc", ".claude"));

        fs::create_dir_all(store.config_dir_path("abc", ".claude")).unwrap();
        assert!(store.session_exists("abc", ".claude"));
    }
}
