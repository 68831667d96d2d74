//! Host settings document: load, save, import, export.
//!
//! The on-disk form wraps the settings in an envelope with a SHA-256 checksum
//! over the canonical settings JSON. The checksum is verified on every load;
//! the startup integrity check and settings import both refuse documents that
//! fail it.

use std::path::{Path, PathBuf};

use fv_types::config::HostConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{HostError, HostResult};

/// Everything the host service persists about itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(flatten)]
    pub config: HostConfig,
    /// Host identity private key, hex. Its public half's digest is how the
    /// Router knows this machine.
    #[serde(default)]
    pub private_key: String,
}

#[derive(Serialize, Deserialize)]
struct SettingsEnvelope {
    settings: HostSettings,
    checksum: String,
}

/// Default location of the host settings document.
pub fn settings_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("farview")
        .join("host.json")
}

fn checksum_of(settings: &HostSettings) -> HostResult<String> {
    let canonical = serde_json::to_vec(settings)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Load and verify a settings document.
pub fn load(path: &Path) -> HostResult<HostSettings> {
    let raw = std::fs::read(path)?;
    let envelope: SettingsEnvelope = serde_json::from_slice(&raw)?;
    let expected = checksum_of(&envelope.settings)?;
    if envelope.checksum != expected {
        return Err(HostError::SettingsIntegrity(format!(
            "checksum mismatch in {}",
            path.display()
        )));
    }
    Ok(envelope.settings)
}

/// Write a settings document with a fresh checksum.
pub fn save(path: &Path, settings: &HostSettings) -> HostResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let envelope = SettingsEnvelope {
        settings: settings.clone(),
        checksum: checksum_of(settings)?,
    };
    std::fs::write(path, serde_json::to_vec_pretty(&envelope)?)?;
    Ok(())
}

/// Verify the settings document at `path` without keeping it.
/// A missing file passes: first run has nothing to verify yet.
pub fn integrity_check(path: &Path) -> HostResult<()> {
    if !path.exists() {
        return Ok(());
    }
    load(path).map(|_| ())
}

/// Replace the live settings with a verified external document.
pub fn import_from_file(source: &Path, target: &Path) -> HostResult<()> {
    let settings = load(source)?;
    save(target, &settings)?;
    info!(source = %source.display(), "imported settings");
    Ok(())
}

/// Copy the live settings out for backup or transfer.
pub fn export_to_file(source: &Path, target: &Path) -> HostResult<()> {
    let settings = load(source)?;
    save(target, &settings)?;
    info!(target = %target.display(), "exported settings");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_settings() -> HostSettings {
        HostSettings {
            config: HostConfig {
                router_server_endpoint: "router.example:8060".into(),
                attach_timeout_ms: 5_000,
                ..HostConfig::default()
            },
            private_key: "ab".repeat(32),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");

        let settings = sample_settings();
        save(&path, &settings).unwrap();
        assert_eq!(load(&path).unwrap(), settings);
        integrity_check(&path).unwrap();
    }

    #[test]
    fn export_then_import_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("host.json");
        let backup = dir.path().join("backup.json");
        let restored = dir.path().join("restored.json");

        let settings = sample_settings();
        save(&live, &settings).unwrap();
        export_to_file(&live, &backup).unwrap();
        import_from_file(&backup, &restored).unwrap();
        assert_eq!(load(&restored).unwrap(), settings);
    }

    #[test]
    fn tampered_document_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        save(&path, &sample_settings()).unwrap();

        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw = raw.replace("router.example", "intruder.example");
        std::fs::write(&path, raw).unwrap();

        assert!(matches!(load(&path), Err(HostError::SettingsIntegrity(_))));
        assert!(integrity_check(&path).is_err());
    }

    #[test]
    fn missing_file_passes_integrity_check() {
        let dir = tempfile::tempdir().unwrap();
        integrity_check(&dir.path().join("absent.json")).unwrap();
    }
}
