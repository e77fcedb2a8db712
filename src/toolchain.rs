//! Locating the external executables services are run with.
//!
//! Each tool can be pinned with an environment variable; otherwise the newest
//! asdf install wins, and the bare name (a `PATH` lookup) is the last resort.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// An external executable and the variable that overrides its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tool {
    pub name: &'static str,
    pub env_key: &'static str,
}

pub const POETRY: Tool = Tool {
    name: "poetry",
    env_key: "FLOPPY_POETRY",
};
pub const BUN: Tool = Tool {
    name: "bun",
    env_key: "FLOPPY_BUN",
};
pub const PYTHON: Tool = Tool {
    name: "python",
    env_key: "FLOPPY_PYTHON",
};

#[derive(Debug, Clone, Default)]
pub struct ToolResolver {
    overrides: HashMap<&'static str, String>,
    asdf_roots: Vec<PathBuf>,
}

impl ToolResolver {
    pub fn new(overrides: HashMap<&'static str, String>, asdf_roots: Vec<PathBuf>) -> Self {
        Self {
            overrides,
            asdf_roots,
        }
    }

    /// Reads overrides and asdf locations from the current environment.
    pub fn from_env() -> Self {
        let mut overrides = HashMap::new();
        for tool in [POETRY, BUN, PYTHON] {
            if let Ok(value) = std::env::var(tool.env_key) {
                let value = value.trim().to_string();
                if !value.is_empty() {
                    overrides.insert(tool.env_key, value);
                }
            }
        }
        let mut asdf_roots = Vec::new();
        if let Some(dir) = std::env::var_os("ASDF_DIR").filter(|v| !v.is_empty()) {
            asdf_roots.push(PathBuf::from(dir));
        }
        if let Some(home) = dirs::home_dir() {
            asdf_roots.push(home.join(".asdf"));
        }
        Self::new(overrides, asdf_roots)
    }

    /// Returns the program to execute for `tool`.
    pub fn resolve(&self, tool: Tool) -> String {
        if let Some(path) = self.overrides.get(tool.env_key) {
            return path.clone();
        }
        self.asdf_roots
            .iter()
            .find_map(|root| latest_install(root, tool.name))
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|| tool.name.to_string())
    }
}

/// Finds `<root>/installs/<tool>/<highest version>/bin/<tool>`.
pub fn latest_install(root: &Path, tool: &str) -> Option<PathBuf> {
    let installs = root.join("installs").join(tool);
    let entries = std::fs::read_dir(&installs).ok()?;
    let mut best: Option<([u64; 3], PathBuf)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(version) = version_key(&name) else {
            continue;
        };
        let bin = entry.path().join("bin").join(tool);
        if !bin.is_file() {
            continue;
        }
        if best.as_ref().map_or(true, |(current, _)| version > *current) {
            best = Some((version, bin));
        }
    }
    best.map(|(_, path)| path)
}

/// Extracts up to three numeric components from a version directory name.
pub fn version_key(name: &str) -> Option<[u64; 3]> {
    let mut parts = [0u64; 3];
    let mut found = 0;
    for run in name.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty()) {
        if found == parts.len() {
            break;
        }
        parts[found] = run.parse().ok()?;
        found += 1;
    }
    if found == 0 {
        None
    } else {
        Some(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(root: &Path, tool: &str, version: &str) {
        let bin = root.join("installs").join(tool).join(version).join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join(tool), "").unwrap();
    }

    #[test]
    fn version_key_reads_numeric_runs() {
        assert_eq!(version_key("1.8.3"), Some([1, 8, 3]));
        assert_eq!(version_key("v2.0"), Some([2, 0, 0]));
        assert_eq!(version_key("3.11.4rc1"), Some([3, 11, 4]));
        assert_eq!(version_key("system"), None);
    }

    #[test]
    fn picks_highest_semantic_version() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "poetry", "1.8.3");
        install(dir.path(), "poetry", "1.10.0");
        install(dir.path(), "poetry", "1.9.9");
        let found = latest_install(dir.path(), "poetry").unwrap();
        assert!(found.ends_with("1.10.0/bin/poetry"));
    }

    #[test]
    fn override_beats_asdf_and_fallback_is_bare_name() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "bun", "1.1.0");
        let mut overrides = HashMap::new();
        overrides.insert(BUN.env_key, "/opt/bun".to_string());
        let resolver = ToolResolver::new(overrides, vec![dir.path().to_path_buf()]);
        assert_eq!(resolver.resolve(BUN), "/opt/bun");
        assert_eq!(resolver.resolve(POETRY), "poetry");

        let resolver = ToolResolver::new(HashMap::new(), vec![dir.path().to_path_buf()]);
        assert!(resolver.resolve(BUN).ends_with("1.1.0/bin/bun"));
    }
}
