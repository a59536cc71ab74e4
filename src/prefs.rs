//! Device-scoped preferences.
//!
//! A small JSON file holding the user's display name, group label, the
//! installation identity and avatar paths. Every read goes back to disk so
//! edits made while the sync loop runs are picked up on the next call.

use crate::peer::DEFAULT_LABEL;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Avatar key for the local device.
pub const OWN_AVATAR: &str = "own";

/// Anonymous document-store session kept across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub uid: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PrefsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    avatars: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session: Option<StoredSession>,
}

pub struct Preferences {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl Preferences {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        Preferences {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        non_empty_or_default(self.read().name)
    }

    pub fn group(&self) -> String {
        non_empty_or_default(self.read().group)
    }

    pub fn avatar_path(&self, identity: &str) -> Option<PathBuf> {
        self.read().avatars.get(identity).map(PathBuf::from)
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.update(|prefs| prefs.name = Some(name.to_string()))
    }

    pub fn set_group(&self, group: &str) -> Result<()> {
        self.update(|prefs| prefs.group = Some(group.to_string()))
    }

    pub fn set_avatar_path(&self, identity: &str, path: &Path) -> Result<()> {
        self.update(|prefs| {
            prefs
                .avatars
                .insert(identity.to_string(), path.to_string_lossy().into_owned());
        })
    }

    /// Installation identity, generated and persisted on first use.
    pub fn uid(&self) -> Result<String> {
        let _guard = self.lock();
        let mut prefs = self.read();
        if let Some(uid) = prefs.uid.as_ref().filter(|uid| !uid.is_empty()) {
            return Ok(uid.clone());
        }

        let uid = uuid::Uuid::new_v4().to_string();
        prefs.uid = Some(uid.clone());
        self.write(&prefs)?;
        info!("[Prefs] Generated installation id {}", uid);
        Ok(uid)
    }

    /// Every identity this device may appear under in a backend: the
    /// installation uid and the document-store session uid once signed in.
    pub fn own_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(2);
        match self.uid() {
            Ok(uid) => ids.push(uid),
            Err(e) => warn!("[Prefs] Could not read installation id: {:#}", e),
        }
        if let Some(session) = self.session() {
            if !session.uid.is_empty() && !ids.contains(&session.uid) {
                ids.push(session.uid);
            }
        }
        ids
    }

    pub fn session(&self) -> Option<StoredSession> {
        self.read().session
    }

    pub fn set_session(&self, session: Option<StoredSession>) -> Result<()> {
        self.update(|prefs| prefs.session = session)
    }

    fn update<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut PrefsFile),
    {
        let _guard = self.lock();
        let mut prefs = self.read();
        apply(&mut prefs);
        self.write(&prefs)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded data is (), a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> PrefsFile {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PrefsFile::default(),
            Err(e) => {
                warn!("[Prefs] Failed to read {}: {}", self.path.display(), e);
                return PrefsFile::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(prefs) => prefs,
            Err(e) => {
                warn!("[Prefs] Ignoring corrupt {}: {}", self.path.display(), e);
                PrefsFile::default()
            }
        }
    }

    fn write(&self, prefs: &PrefsFile) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(prefs)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

fn non_empty_or_default(value: Option<String>) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LABEL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_reads_defaults() {
        let dir = tempdir().unwrap();
        let prefs = Preferences::open(dir.path().join("prefs.json"));
        assert_eq!(prefs.name(), "Guest");
        assert_eq!(prefs.group(), "Guest");
        assert!(prefs.session().is_none());
        assert!(prefs.avatar_path(OWN_AVATAR).is_none());
    }

    #[test]
    fn test_uid_is_generated_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let first = Preferences::open(&path).uid().unwrap();
        let second = Preferences::open(&path).uid().unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_own_ids_include_session_uid() {
        let dir = tempdir().unwrap();
        let prefs = Preferences::open(dir.path().join("prefs.json"));
        let uid = prefs.uid().unwrap();
        assert_eq!(prefs.own_ids(), vec![uid.clone()]);

        prefs
            .set_session(Some(StoredSession {
                uid: "anon-1".to_string(),
                refresh_token: "refresh".to_string(),
            }))
            .unwrap();
        assert_eq!(prefs.own_ids(), vec![uid, "anon-1".to_string()]);
    }

    #[test]
    fn test_changes_are_visible_to_other_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        let reader = Preferences::open(&path);
        let writer = Preferences::open(&path);

        writer.set_name("Testing Test").unwrap();
        writer.set_group("test").unwrap();
        assert_eq!(reader.name(), "Testing Test");
        assert_eq!(reader.group(), "test");

        writer.set_group("   ").unwrap();
        assert_eq!(reader.group(), "Guest");
    }

    #[test]
    fn test_avatars_and_session_persist() {
        let dir = tempdir().unwrap();
        let prefs = Preferences::open(dir.path().join("nested/prefs.json"));

        prefs
            .set_avatar_path(OWN_AVATAR, Path::new("/tmp/own.jpg"))
            .unwrap();
        let session = StoredSession {
            uid: "abc".to_string(),
            refresh_token: "refresh".to_string(),
        };
        prefs.set_session(Some(session.clone())).unwrap();

        assert_eq!(
            prefs.avatar_path(OWN_AVATAR),
            Some(PathBuf::from("/tmp/own.jpg"))
        );
        assert_eq!(prefs.session(), Some(session));

        prefs.set_session(None).unwrap();
        assert!(prefs.session().is_none());
    }

    #[test]
    fn test_corrupt_file_reads_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, "not json").unwrap();

        let prefs = Preferences::open(&path);
        assert_eq!(prefs.name(), "Guest");
        prefs.set_name("Recovered").unwrap();
        assert_eq!(prefs.name(), "Recovered");
    }
}
