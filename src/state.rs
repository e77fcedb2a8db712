//! Durable record of launched processes.
//!
//! A later invocation (`stop`, `ps`) reads this file to find processes started by
//! an earlier one. A recorded pid is only trusted while the live command line of that
//! pid still contains the fingerprint recorded at launch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::platform::ProcessControl;
use crate::process::ProcessHandle;

const STATE_FILE_NAME: &str = "process-state.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub service: String,
    pub pid: u32,
    pub pgid: u32,
    pub cwd: String,
    /// Fingerprint matched against the live command line.
    pub cmdline: String,
}

impl From<&ProcessHandle> for ProcessEntry {
    fn from(handle: &ProcessHandle) -> Self {
        Self {
            service: handle.service.clone(),
            pid: handle.pid,
            pgid: handle.pgid,
            cwd: handle.cwd.display().to_string(),
            cmdline: handle.fingerprint.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub entries: BTreeMap<String, ProcessEntry>,
}

#[derive(Debug, Clone)]
pub struct ProcessStore {
    path: PathBuf,
}

impl ProcessStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `FLOPPY_STATE_FILE` or the per-user cache location.
    pub fn from_env() -> Self {
        match std::env::var_os("FLOPPY_STATE_FILE").filter(|v| !v.is_empty()) {
            Some(path) => Self::new(path),
            None => Self::new(cache_dir().join(STATE_FILE_NAME)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the state file; detached logs live under it.
    pub fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Loads the state file. A missing file is an empty state.
    pub fn load(&self) -> Result<StateFile> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateFile::default())
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        if content.trim().is_empty() {
            return Ok(StateFile::default());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    pub fn save(&self, state: &StateFile) -> Result<()> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let content = serde_json::to_string_pretty(state)?;
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        tracing::debug!(path = %self.path.display(), entries = state.entries.len(), "saved process state");
        Ok(())
    }

    /// Adds or replaces entries keyed by service.
    pub fn record(&self, entries: impl IntoIterator<Item = ProcessEntry>) -> Result<()> {
        let mut state = self.load()?;
        for entry in entries {
            state.entries.insert(entry.service.clone(), entry);
        }
        self.save(&state)
    }

    pub fn remove(&self, services: &[String]) -> Result<()> {
        let mut state = self.load()?;
        let before = state.entries.len();
        state.entries.retain(|name, _| !services.contains(name));
        if state.entries.len() != before {
            self.save(&state)?;
        }
        Ok(())
    }
}

/// Per-user cache directory for floppy's state and logs.
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("floppy")
}

/// True when `expected` is a substring of `actual`. Blank input never matches.
pub fn command_contains_expected(actual: &str, expected: &str) -> bool {
    let actual = actual.trim();
    let expected = expected.trim();
    if actual.is_empty() || expected.is_empty() {
        return false;
    }
    actual.contains(expected)
}

/// Whether the recorded process is still the one that was launched.
pub fn entry_is_live(control: &dyn ProcessControl, entry: &ProcessEntry) -> bool {
    if entry.pid == 0 || !control.is_alive(entry.pid) {
        return false;
    }
    control
        .command_line(entry.pid)
        .map(|actual| command_contains_expected(&actual, &entry.cmdline))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingControl;
    use tempfile::tempdir;

    fn entry(service: &str, pid: u32) -> ProcessEntry {
        ProcessEntry {
            service: service.to_string(),
            pid,
            pgid: pid,
            cwd: "/srv/api".to_string(),
            cmdline: "poetry run dev".to_string(),
        }
    }

    #[test]
    fn contains_expected_matches_substrings_only() {
        assert!(command_contains_expected(
            "poetry run dev-server",
            "poetry run dev-server"
        ));
        assert!(command_contains_expected(
            "/usr/bin/python3 /home/me/.local/bin/poetry run dev",
            "poetry run dev"
        ));
        assert!(!command_contains_expected("bun dev", "poetry run dev"));
        assert!(!command_contains_expected("", "poetry run dev"));
        assert!(!command_contains_expected("poetry run dev", "   "));
    }

    #[test]
    fn round_trips_entries() {
        let dir = tempdir().unwrap();
        let store = ProcessStore::new(dir.path().join("nested").join("state.json"));
        store.record([entry("api", 4242), entry("worker", 5151)]).unwrap();
        let loaded = store.load().unwrap();
        let api = &loaded.entries["api"];
        assert_eq!((api.service.as_str(), api.pid, api.pgid), ("api", 4242, 4242));
        assert_eq!(loaded.entries.len(), 2);
    }

    #[test]
    fn missing_file_is_empty_and_remove_prunes() {
        let dir = tempdir().unwrap();
        let store = ProcessStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().entries.is_empty());
        store.record([entry("api", 1), entry("web", 2)]).unwrap();
        store.remove(&["api".to_string()]).unwrap();
        let names: Vec<_> = store.load().unwrap().entries.into_keys().collect();
        assert_eq!(names, vec!["web"]);
    }

    #[test]
    fn reads_state_written_with_the_documented_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"entries":{"api":{"service":"api","pid":7,"pgid":7,"cwd":"/x","cmdline":"poetry run dev"}}}"#,
        )
        .unwrap();
        let loaded = ProcessStore::new(&path).load().unwrap();
        assert_eq!(loaded.entries["api"].pid, 7);
    }

    #[test]
    fn reused_pid_is_not_live() {
        let mut control = RecordingControl::default();
        control
            .command_lines
            .insert(4242, "/usr/bin/python poetry run dev".to_string());
        control.command_lines.insert(5151, "bun dev".to_string());
        assert!(entry_is_live(&control, &entry("api", 4242)));
        assert!(!entry_is_live(&control, &entry("api", 5151)));
        assert!(!entry_is_live(&control, &entry("api", 6000)));
    }
}
