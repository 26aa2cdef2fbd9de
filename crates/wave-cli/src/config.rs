//! CLI configuration resolution.

use std::path::{Path, PathBuf};

/// Resolved file locations and environment for one invocation.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Path to `wave-config.json`.
    pub domain_config_path: PathBuf,
    /// Path to `config/rlm.json`.
    pub rlm_config_path: PathBuf,
    /// Directory lock files live in.
    pub lock_dir: PathBuf,
    /// Redis URL from `REDIS_URL` (default localhost).
    pub redis_url: String,
}

impl CliConfig {
    /// Resolve config paths, preferring an explicit `--config` path.
    pub fn resolve(explicit: Option<&str>) -> Self {
        let domain_config_path = explicit
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("wave-config.json"));

        Self {
            domain_config_path,
            rlm_config_path: PathBuf::from("config/rlm.json"),
            lock_dir: PathBuf::from(".wave"),
            redis_url: wave_bus::client::redis_url_from_env(),
        }
    }

    /// Path of a named lock file under the lock directory.
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.lock_dir.join(name)
    }

    /// Ensure the lock directory exists.
    pub fn ensure_lock_dir(&self) -> anyhow::Result<()> {
        if !self.lock_dir.exists() {
            std::fs::create_dir_all(&self.lock_dir)?;
        }
        Ok(())
    }

    /// Whether the domain config file is present.
    pub fn has_domain_config(&self) -> bool {
        Path::new(&self.domain_config_path).exists()
    }
}
