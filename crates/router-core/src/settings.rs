//! Router settings document.

use std::path::{Path, PathBuf};

use fv_types::config::RouterConfig;

use crate::error::RouterResult;

/// Default location of the router settings document.
pub fn settings_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("farview")
        .join("router.json")
}

/// Where the router's public key is published for host operators.
pub fn public_key_file_path() -> PathBuf {
    settings_file_path().with_file_name("router.pub")
}

pub fn load(path: &Path) -> RouterResult<RouterConfig> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

pub fn save(path: &Path, config: &RouterConfig) -> RouterResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(config)?)?;
    Ok(())
}
