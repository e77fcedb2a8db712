//! Configuration management for floppy.
//!
//! This module defines the structure of the `floppy.toml` file, locates it, and
//! resolves service and bundle names into `ServiceSpec`s.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::error::UpError;
use crate::process::{ServiceKind, ServiceSpec};

/// File name looked up in the default locations.
pub const CONFIG_FILE_NAME: &str = "floppy.toml";

/// Top-level configuration structure corresponding to `floppy.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Environment applied to every service.
    #[serde(default)]
    pub env: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    /// Named groups of services.
    #[serde(default)]
    pub bundles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub stats: StatsConfig,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub port: Option<u16>,
    /// Directory relative to the services root. Defaults to the service name.
    pub path: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, toml::Value>,
    pub repo: Option<String>,
    pub command: Option<String>,
    pub worker_command: Option<String>,
    pub docker_command: Option<String>,
    pub hmr_port: Option<u16>,
    pub ws_port: Option<u16>,
}

/// Sources for the optional dashboard side panels.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsConfig {
    /// Postgres connection URL; enables the database panel.
    pub database_url: Option<String>,
    /// Enables the container resource panel.
    #[serde(default)]
    pub docker: bool,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Finds the config file: explicit path, `FLOPPY_CONFIG`, then the default locations.
pub fn find_config(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os("FLOPPY_CONFIG").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let candidates = default_candidates(std::env::var_os("SERVICES_ROOT").map(PathBuf::from));
    if let Some(found) = candidates.iter().find(|path| path.is_file()) {
        return Ok(found.clone());
    }
    let tried = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    bail!("no {} found (tried {})", CONFIG_FILE_NAME, tried)
}

fn default_candidates(services_root: Option<PathBuf>) -> Vec<PathBuf> {
    let mut candidates = vec![
        PathBuf::from(CONFIG_FILE_NAME),
        Path::new("dev-env").join(CONFIG_FILE_NAME),
        Path::new("..").join("dev-env").join(CONFIG_FILE_NAME),
    ];
    if let Some(root) = services_root {
        candidates.push(root.join("dev-env").join(CONFIG_FILE_NAME));
    }
    candidates
}

/// The directory service paths are relative to: `SERVICES_ROOT`, else the config's directory.
pub fn services_root(config_path: &Path) -> PathBuf {
    if let Some(root) = std::env::var_os("SERVICES_ROOT").filter(|v| !v.is_empty()) {
        return PathBuf::from(root);
    }
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

impl Config {
    /// Expands service and bundle names into a sorted, de-duplicated list of services.
    ///
    /// An empty request selects every configured service.
    pub fn expand(&self, names: &[String]) -> Result<Vec<String>, UpError> {
        let mut selected = BTreeSet::new();
        if names.is_empty() {
            selected.extend(self.services.keys().cloned());
        }
        for name in names {
            if let Some(members) = self.bundles.get(name) {
                for member in members {
                    if !self.services.contains_key(member) {
                        return Err(UpError::UnknownService(member.clone()));
                    }
                    selected.insert(member.clone());
                }
            } else if self.services.contains_key(name) {
                selected.insert(name.clone());
            } else {
                return Err(UpError::UnknownService(name.clone()));
            }
        }
        if selected.is_empty() {
            return Err(UpError::NoServices);
        }
        Ok(selected.into_iter().collect())
    }

    /// Resolves the named services against `root`. Names must come from `expand`.
    pub fn resolve(&self, names: &[String], root: &Path) -> Result<Vec<ServiceSpec>, UpError> {
        names
            .iter()
            .map(|name| {
                let service = self
                    .services
                    .get(name)
                    .ok_or_else(|| UpError::UnknownService(name.clone()))?;
                Ok(self.spec_for(name, service, root))
            })
            .collect()
    }

    /// Resolves every configured service.
    pub fn all_specs(&self, root: &Path) -> Vec<ServiceSpec> {
        self.services
            .iter()
            .map(|(name, service)| self.spec_for(name, service, root))
            .collect()
    }

    fn spec_for(&self, name: &str, service: &ServiceConfig, root: &Path) -> ServiceSpec {
        let mut env: BTreeMap<String, String> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), env_value(v)))
            .collect();
        for (key, value) in &service.env {
            env.insert(key.clone(), env_value(value));
        }
        ServiceSpec {
            name: name.to_string(),
            kind: service.kind,
            port: service.port,
            hmr_port: service.hmr_port,
            ws_port: service.ws_port,
            dir: service_dir(root, name, service.path.as_deref()),
            command: non_empty(service.command.as_deref()),
            worker_command: non_empty(service.worker_command.as_deref()),
            docker_command: non_empty(service.docker_command.as_deref()),
            env,
            repo: service.repo.clone(),
        }
    }
}

/// `root/path`, or `root/name` when no path is configured.
pub fn service_dir(root: &Path, name: &str, path: Option<&str>) -> PathBuf {
    match path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => root.join(path),
        None => root.join(name),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn env_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
