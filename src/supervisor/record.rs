//! Persisted process records and launch claims.
//!
//! One JSON record per port at `<dir>/browser-<port>.json`, written
//! atomically (temp file + rename). Before spawning, a launcher creates
//! `<dir>/browser-<port>.claim` with `create_new`, so two launchers for the
//! same port cannot both spawn. Each claim carries a random token so a
//! launcher only ever releases its own claim.

// ============================================================================
// Imports
// ============================================================================

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::supervisor::process::process_alive;

// ============================================================================
// ProcessRecord
// ============================================================================

/// Metadata of a supervised browser process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Process id.
    pub pid: u32,

    /// Remote debugging port; the record key.
    pub port: u16,

    /// Start time, seconds since the Unix epoch.
    pub started_at: u64,

    /// Profile directory passed to the browser.
    pub profile_dir: PathBuf,

    /// The profile directory was generated and is removed at shutdown.
    #[serde(default)]
    pub temporary_profile: bool,

    /// Executable that was launched.
    #[serde(default)]
    pub executable: Option<PathBuf>,
}

impl ProcessRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(pid: u32, port: u16, profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            port,
            started_at: unix_now(),
            profile_dir: profile_dir.into(),
            temporary_profile: false,
            executable: None,
        }
    }

    /// Marks the profile directory as generated.
    #[must_use]
    pub fn with_temporary_profile(mut self, temporary: bool) -> Self {
        self.temporary_profile = temporary;
        self
    }

    /// Records the executable path.
    #[must_use]
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = Some(executable.into());
        self
    }

    /// Removes the profile directory if it was generated.
    pub fn remove_temporary_profile(&self) {
        if !self.temporary_profile {
            return;
        }
        match fs::remove_dir_all(&self.profile_dir) {
            Ok(()) => debug!(path = %self.profile_dir.display(), "Removed temporary profile"),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.profile_dir.display(), error = %e, "Failed to remove temporary profile");
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// ============================================================================
// RecordStore
// ============================================================================

/// Directory of process records, keyed by port.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Creates a store rooted at `dir`. The directory is created lazily.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the store directory.
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `port`.
    #[must_use]
    pub fn path_for(&self, port: u16) -> PathBuf {
        self.dir.join(format!("browser-{port}.json"))
    }

    /// Path of the launch claim for `port`.
    #[must_use]
    pub fn claim_path(&self, port: u16) -> PathBuf {
        self.dir.join(format!("browser-{port}.claim"))
    }

    /// Loads the record for `port`.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file exists but cannot be read
    /// - [`Error::Json`] if it is corrupt
    pub fn load(&self, port: u16) -> Result<Option<ProcessRecord>> {
        read_record(&self.path_for(port))
    }

    /// Writes the record atomically, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] / [`Error::Json`] on failure.
    pub fn save(&self, record: &ProcessRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut file = NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(file.as_file_mut(), record)?;
        file.as_file_mut().flush()?;
        file.persist(self.path_for(record.port))
            .map_err(|e| Error::Io(e.error))?;

        debug!(pid = record.pid, port = record.port, "Process record saved");
        Ok(())
    }

    /// Deletes the record for `port`. Returns `true` if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file exists but cannot be removed.
    pub fn remove(&self, port: u16) -> Result<bool> {
        match fs::remove_file(self.path_for(port)) {
            Ok(()) => {
                debug!(port, "Process record removed");
                Ok(true)
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns every readable record, sorted by port.
    ///
    /// Corrupt record files are deleted and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<ProcessRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("browser-") && name.ends_with(".json"));
            if !is_record {
                continue;
            }

            match read_record(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Removing unreadable process record");
                    if let Err(e) = fs::remove_file(&path)
                        && e.kind() != IoErrorKind::NotFound
                    {
                        warn!(path = %path.display(), error = %e, "Failed to remove unreadable process record");
                    }
                }
            }
        }

        records.sort_by_key(|record| record.port);
        Ok(records)
    }
}

fn read_record(path: &Path) -> Result<Option<ProcessRecord>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Launch Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ClaimBody {
    pid: u32,
    created_at: u64,
    #[serde(default)]
    token: u64,
}

fn read_claim(path: &Path) -> Option<ClaimBody> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

impl RecordStore {
    /// Claims `port` for a launch.
    ///
    /// An existing claim is taken over when its owner is dead or it is older
    /// than `stale_after`.
    ///
    /// # Errors
    ///
    /// - [`Error::Process`] if another live launcher holds the claim
    /// - [`Error::Io`] on filesystem failure
    pub fn claim(&self, port: u16, stale_after: Duration) -> Result<LaunchClaim> {
        fs::create_dir_all(&self.dir)?;
        let path = self.claim_path(port);

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let token = rand::random::<u64>();
                    let body = ClaimBody {
                        pid: std::process::id(),
                        created_at: unix_now(),
                        token,
                    };
                    let claim = LaunchClaim { path, token };
                    serde_json::to_writer(&mut file, &body)?;
                    file.flush()?;
                    debug!(port, "Launch claim acquired");
                    return Ok(claim);
                }
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                    if let Some(owner) = self.live_claim_owner(&path, stale_after) {
                        return Err(Error::process(format!(
                            "port {port} is already being launched by pid {owner}"
                        )));
                    }
                    debug!(port, "Reclaiming stale launch claim");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == IoErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::process(format!("could not claim port {port} for launch")))
    }

    /// Returns `true` if a live launcher currently holds the claim for `port`.
    #[must_use]
    pub fn is_claimed(&self, port: u16, stale_after: Duration) -> bool {
        self.live_claim_owner(&self.claim_path(port), stale_after)
            .is_some()
    }

    /// Returns the owning pid if the claim at `path` is still valid.
    fn live_claim_owner(&self, path: &Path, stale_after: Duration) -> Option<u32> {
        // Half-written claim: treat as held by the creator for now.
        let Some(body) = read_claim(path) else {
            let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
            let age = modified.elapsed().unwrap_or_default();
            return (age < stale_after).then_some(0);
        };

        let age = Duration::from_secs(unix_now().saturating_sub(body.created_at));
        (age < stale_after && process_alive(body.pid)).then_some(body.pid)
    }
}

/// Held launch claim; the claim file is removed on drop if it is still ours.
#[derive(Debug)]
pub struct LaunchClaim {
    path: PathBuf,
    token: u64,
}

impl LaunchClaim {
    /// Path of the claim file.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LaunchClaim {
    /// Returns `true` while the file on disk still carries this claim's token.
    #[must_use]
    pub fn is_held(&self) -> bool {
        read_claim(&self.path).is_some_and(|body| body.token == self.token)
    }
}

impl Drop for LaunchClaim {
    fn drop(&mut self) {
        if !self.is_held() {
            debug!(path = %self.path.display(), "Launch claim was taken over, leaving it");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Launch claim released"),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to release launch claim"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn store() -> (TempDir, RecordStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = RecordStore::new(dir.path().join("records"));
        (dir, store)
    }

    #[test]
    fn test_save_load_remove() {
        let (_dir, store) = store();
        assert_eq!(store.load(9222).expect("load"), None);

        let record = ProcessRecord::new(4242, 9222, "/tmp/profile")
            .with_temporary_profile(true)
            .with_executable("/usr/bin/chromium");
        store.save(&record).expect("save");

        assert!(store.path_for(9222).ends_with("browser-9222.json"));
        assert_eq!(store.load(9222).expect("load"), Some(record));

        assert!(store.remove(9222).expect("remove"));
        assert!(!store.remove(9222).expect("remove again"));
        assert_eq!(store.load(9222).expect("load"), None);
    }

    #[test]
    fn test_record_json_shape() {
        let record = ProcessRecord::new(1, 9333, "/p");
        let value = serde_json::to_value(&record).expect("json");
        for key in ["pid", "port", "started_at", "profile_dir", "temporary_profile", "executable"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_list_skips_and_removes_corrupt() {
        let (_dir, store) = store();
        store.save(&ProcessRecord::new(10, 9300, "/a")).expect("save");
        store.save(&ProcessRecord::new(11, 9200, "/b")).expect("save");
        fs::write(store.dir().join("browser-9999.json"), b"{not json").expect("write");
        fs::write(store.dir().join("unrelated.txt"), b"x").expect("write");

        let ports: Vec<u16> = store.list().expect("list").iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![9200, 9300]);
        assert!(!store.dir().join("browser-9999.json").exists());
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let (_dir, store) = store();
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn test_claim_is_exclusive_and_released_on_drop() {
        let (_dir, store) = store();
        let stale_after = Duration::from_secs(60);

        let claim = store.claim(9222, stale_after).expect("claim");
        assert!(claim.path().exists());
        assert!(store.is_claimed(9222, stale_after));

        let err = store.claim(9222, stale_after).unwrap_err();
        assert!(err.is_process_error());

        drop(claim);
        assert!(!store.is_claimed(9222, stale_after));
        assert!(store.claim(9222, stale_after).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_claim_of_dead_owner_is_reclaimed() {
        let (_dir, store) = store();
        fs::create_dir_all(store.dir()).expect("mkdir");

        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead_pid = child.id();
        child.wait().expect("wait");

        let body = ClaimBody {
            pid: dead_pid,
            created_at: unix_now(),
            token: 7,
        };
        fs::write(store.claim_path(9222), serde_json::to_vec(&body).expect("json")).expect("write");

        let claim = store.claim(9222, Duration::from_secs(60)).expect("reclaim");
        let body: ClaimBody =
            serde_json::from_slice(&fs::read(claim.path()).expect("read")).expect("parse");
        assert_eq!(body.pid, std::process::id());
    }

    #[test]
    fn test_expired_claim_is_reclaimed() {
        let (_dir, store) = store();
        fs::create_dir_all(store.dir()).expect("mkdir");

        let body = ClaimBody {
            pid: std::process::id(),
            created_at: unix_now().saturating_sub(600),
            token: 7,
        };
        fs::write(store.claim_path(9222), serde_json::to_vec(&body).expect("json")).expect("write");

        assert!(store.claim(9222, Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_superseded_claim_survives_previous_holder_drop() {
        let (_dir, store) = store();

        let first = store.claim(9222, Duration::from_secs(60)).expect("first claim");
        let second = store.claim(9222, Duration::ZERO).expect("stale takeover");
        assert!(!first.is_held());
        assert!(second.is_held());

        drop(first);
        assert!(second.path().exists());
        assert!(second.is_held());

        drop(second);
        assert!(!store.claim_path(9222).exists());
    }

    #[test]
    fn test_claim_without_token_is_not_ours() {
        let (_dir, store) = store();
        let claim = store.claim(9222, Duration::from_secs(60)).expect("claim");
        fs::write(
            claim.path(),
            format!(r#"{{"pid":{},"created_at":{}}}"#, std::process::id(), unix_now()),
        )
        .expect("overwrite");

        assert!(!claim.is_held());
        drop(claim);
        assert!(store.claim_path(9222).exists());
    }

    #[test]
    fn test_remove_temporary_profile() {
        let dir = TempDir::new().expect("tempdir");
        let profile = dir.path().join("profile");
        fs::create_dir_all(profile.join("Default")).expect("mkdir");

        ProcessRecord::new(1, 9222, &profile).remove_temporary_profile();
        assert!(profile.exists());

        ProcessRecord::new(1, 9222, &profile)
            .with_temporary_profile(true)
            .remove_temporary_profile();
        assert!(!profile.exists());
    }
}
