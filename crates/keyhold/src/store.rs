use crate::{
    config::KeyholdConfig,
    paths::KeyholdPaths,
    storage::{ensure_private_dir, write_atomic_restrictive, MODE_FILE_PRIVATE},
};
use eyre::Context as _;
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

/// Apply environment variable overrides to the config. Unparseable values are ignored.
fn apply_env_overrides(cfg: &mut KeyholdConfig) {
    /// Helper: if an env var is set and parses, apply `setter` with the value.
    fn apply_env<T: std::str::FromStr>(var: &str, setter: impl FnOnce(T)) {
        if let Ok(u) = std::env::var(var) {
            let t = u.trim();
            if t.is_empty() {
                return;
            }
            if let Ok(v) = t.parse::<T>() {
                setter(v);
            } else {
                tracing::warn!(var, "ignoring unparseable environment override");
            }
        }
    }

    apply_env("KEYHOLD_SESSION_TTL_SECONDS", |n: u64| {
        if n > 0 {
            cfg.session_ttl_seconds = n;
        }
    });
    apply_env("KEYHOLD_COIN_TYPE", |n: u32| {
        if n < crate::derivation::HARDENED_OFFSET {
            cfg.coin_type = n;
        }
    });
    apply_env("KEYHOLD_HYDRATION_TIMEOUT_MS", |n: u64| {
        if n > 0 {
            cfg.hydration_timeout_ms = n;
        }
    });
}

impl ConfigStore {
    pub fn new(paths: &KeyholdPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads `config.toml`, writing the defaults on first run. Env overrides apply on top and
    /// are never written back.
    pub fn load_or_init_default(&self) -> eyre::Result<KeyholdConfig> {
        let mut cfg = if self.path.exists() {
            let s = fs::read_to_string(&self.path).context("read config.toml")?;
            toml::from_str(&s).context("parse config.toml")?
        } else {
            let cfg = KeyholdConfig::default();
            self.save(&cfg)?;
            cfg
        };
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    pub fn save(&self, cfg: &KeyholdConfig) -> eyre::Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_private_dir(parent)?;
        }
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        write_atomic_restrictive(&self.path, s.as_bytes(), MODE_FILE_PRIVATE)
            .context("write config.toml")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_defaults_and_reload_reads_edits() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ConfigStore {
            path: dir.path().join("config.toml"),
        };
        assert!(!store.path().exists(), "fresh dir");

        let cfg = store.load_or_init_default()?;
        assert!(store.path().exists(), "defaults written on first run");
        assert_eq!(cfg.coin_type, 501);

        let edited = KeyholdConfig {
            mnemonic_strength_bits: 256,
            ..cfg
        };
        store.save(&edited)?;
        let reread: KeyholdConfig = toml::from_str(&fs::read_to_string(store.path())?)?;
        assert_eq!(reread.mnemonic_strength_bits, 256);
        Ok(())
    }

    #[test]
    fn garbage_config_is_an_error() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(&path, "session_ttl_seconds = \"soon\"")?;
        assert!(ConfigStore { path }.load_or_init_default().is_err());
        Ok(())
    }
}
