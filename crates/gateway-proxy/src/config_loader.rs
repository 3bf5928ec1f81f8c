use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;

/// TOML loader for interceptor settings.
///
/// Relative paths are searched in order:
/// 1) `RUSTY_INTERCEPTOR_CONFIG_DIR/<relative_path>`
/// 2) `./<relative_path>`
/// 3) `<repo_root>/config/<relative_path>`
///
/// Absolute paths are read as given.
pub struct ConfigLoader;

impl ConfigLoader {
    pub const DIR_ENV: &'static str = "RUSTY_INTERCEPTOR_CONFIG_DIR";

    pub fn parse_from_file<T: DeserializeOwned>(relative_path: &str) -> anyhow::Result<T> {
        let path = Self::resolve_path(relative_path)?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse_from_string(text)
            .with_context(|| format!("Invalid config at {}", path.display()))
    }

    pub fn parse_from_string<T: DeserializeOwned>(text: String) -> anyhow::Result<T> {
        toml::from_str(&text).with_context(|| "Failed to parse TOML")
    }

    /// Resolves a companion file (catalog, key material) with the same search order.
    pub fn resolve_path(relative_path: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(relative_path);
        if rel.is_absolute() {
            if rel.is_file() {
                return Ok(rel.to_path_buf());
            }
            anyhow::bail!("Config file not found at {}", rel.display());
        }

        if let Some(root) = env::var_os(Self::DIR_ENV) {
            let candidate = PathBuf::from(root).join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        if let Ok(cwd) = env::current_dir() {
            let candidate = cwd.join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        // This crate lives at <repo_root>/crates/gateway-proxy.
        let candidate = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)
            .ok_or_else(|| anyhow::anyhow!("CARGO_MANIFEST_DIR has insufficient ancestors"))?
            .join("config")
            .join(rel);
        if candidate.is_file() {
            return Ok(candidate);
        }

        anyhow::bail!("Config file not found for {:?}", rel);
    }
}
