use crate::{
    config::KeyholdConfig,
    observable::PersistedShape,
    paths::KeyholdPaths,
    session::MetaState,
    storage::{META_KEY, SALT_KEY, VAULT_KEY},
};
use eyre::Context as _;
use serde_json::json;
use std::{fs, path::Path, path::PathBuf};

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn try_parse_config(path: &Path) -> eyre::Result<KeyholdConfig> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KeyholdConfig = toml::from_str(&s).context("parse config.toml")?;
    Ok(cfg)
}

fn read_opt(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

struct ConfigReport {
    path: PathBuf,
    exists: bool,
    parse_ok: bool,
    error: Option<String>,
    cfg: Option<KeyholdConfig>,
}

struct VaultReport {
    store_dir: PathBuf,
    salt_present: bool,
    ciphertext_present: bool,
    envelope_version: Option<String>,
    main_account_set: bool,
}

pub struct DoctorReport {
    version: &'static str,
    paths: KeyholdPaths,
    config: ConfigReport,
    vault: VaultReport,
    env: serde_json::Value,
}

/// Reads only file presence, the envelope version tag and plaintext metadata.
pub fn collect(paths: &KeyholdPaths) -> DoctorReport {
    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    let (parse_ok, error, cfg) = if config_exists {
        match try_parse_config(&config_path) {
            Ok(cfg) => (true, None, Some(cfg)),
            Err(e) => (false, Some(format!("{e:#}")), None),
        }
    } else {
        (false, None, None)
    };

    let store_dir = paths.store_dir();
    let vault_raw = read_opt(&store_dir.join(VAULT_KEY));
    let envelope_version = vault_raw
        .as_deref()
        .map(|raw| PersistedShape::migrate(raw).version_tag());
    let main_account_set = read_opt(&store_dir.join(META_KEY))
        .and_then(|raw| serde_json::from_str::<MetaState>(&raw).ok())
        .is_some_and(|m| m.main_account.is_some());

    let env = json!({
      "KEYHOLD_CONFIG_DIR": env_opt("KEYHOLD_CONFIG_DIR"),
      "KEYHOLD_DATA_DIR": env_opt("KEYHOLD_DATA_DIR"),
      "KEYHOLD_SESSION_TTL_SECONDS": env_opt("KEYHOLD_SESSION_TTL_SECONDS"),
      "KEYHOLD_COIN_TYPE": env_opt("KEYHOLD_COIN_TYPE"),
      "KEYHOLD_HYDRATION_TIMEOUT_MS": env_opt("KEYHOLD_HYDRATION_TIMEOUT_MS"),
      "KEYHOLD_PASSWORD_set": std::env::var("KEYHOLD_PASSWORD").is_ok(),
    });

    DoctorReport {
        version: env!("CARGO_PKG_VERSION"),
        paths: paths.clone(),
        config: ConfigReport {
            path: config_path,
            exists: config_exists,
            parse_ok,
            error,
            cfg,
        },
        vault: VaultReport {
            salt_present: store_dir.join(SALT_KEY).exists(),
            ciphertext_present: vault_raw.is_some(),
            envelope_version,
            main_account_set,
            store_dir,
        },
        env,
    }
}

fn print_json(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(&json!({
      "ok": true,
      "version": r.version,
      "paths": {
        "config_dir": r.paths.config_dir,
        "data_dir": r.paths.data_dir,
        "log_file": r.paths.log_file,
      },
      "config": {
        "path": r.config.path,
        "exists": r.config.exists,
        "parse_ok": r.config.parse_ok,
        "error": r.config.error,
        "session_ttl_seconds": r.config.cfg.as_ref().map(|c| c.session_ttl_seconds),
        "coin_type": r.config.cfg.as_ref().map(|c| c.coin_type),
        "mnemonic_strength_bits": r.config.cfg.as_ref().map(|c| c.mnemonic_strength_bits),
        "hydration_timeout_ms": r.config.cfg.as_ref().map(|c| c.hydration_timeout_ms),
      },
      "vault": {
        "store_dir": r.vault.store_dir,
        "salt_present": r.vault.salt_present,
        "ciphertext_present": r.vault.ciphertext_present,
        "envelope_version": r.vault.envelope_version,
        "main_account_set": r.vault.main_account_set,
      },
      "env": r.env,
      "hints": [
        "If vault.ciphertext_present is false, run: keyhold init",
        "The doctor never decrypts the vault; use `keyhold unlock-check` to test a password.",
      ]
    }))
    .context("serialize doctor json")?;
    writeln!(out, "{s}").context("write doctor json")?;
    Ok(())
}

fn print_human(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    writeln!(out, "Keyhold doctor (v{})", r.version).context("write header")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Paths:").context("write paths header")?;
    writeln!(out, "  config_dir: {}", r.paths.config_dir.display()).context("write paths")?;
    writeln!(out, "  data_dir:   {}", r.paths.data_dir.display()).context("write paths")?;
    writeln!(out, "  log_file:   {}", r.paths.log_file.display()).context("write paths")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Config:").context("write config header")?;
    writeln!(out, "  config.toml: {}", r.config.path.display()).context("write config")?;
    match (&r.config.cfg, &r.config.error) {
        (Some(c), _) => {
            writeln!(
                out,
                "  status: ok (session_ttl_seconds={}, coin_type={}, mnemonic_strength_bits={})",
                c.session_ttl_seconds, c.coin_type, c.mnemonic_strength_bits
            )
            .context("write config")?;
        }
        (None, Some(e)) => {
            writeln!(out, "  status: parse failed").context("write config")?;
            let first = e.lines().next().unwrap_or("parse error");
            writeln!(out, "  error: {first}").context("write config")?;
        }
        (None, None) => {
            writeln!(out, "  status: missing (will be created on first run)")
                .context("write config")?;
        }
    }
    writeln!(out).context("write newline")?;

    writeln!(out, "Vault:").context("write vault header")?;
    writeln!(out, "  store_dir: {}", r.vault.store_dir.display()).context("write vault")?;
    writeln!(out, "  salt_present: {}", r.vault.salt_present).context("write vault")?;
    writeln!(out, "  ciphertext_present: {}", r.vault.ciphertext_present)
        .context("write vault")?;
    writeln!(
        out,
        "  envelope_version: {}",
        r.vault.envelope_version.as_deref().unwrap_or("-")
    )
    .context("write vault")?;
    writeln!(out, "  main_account_set: {}", r.vault.main_account_set).context("write vault")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Env (redacted):").context("write env header")?;
    for key in ["KEYHOLD_CONFIG_DIR", "KEYHOLD_DATA_DIR"] {
        writeln!(
            out,
            "  {key}: {:?}",
            r.env.get(key).and_then(|v| v.as_str())
        )
        .context("write env")?;
    }
    writeln!(
        out,
        "  KEYHOLD_PASSWORD_set: {}",
        r.env
            .get("KEYHOLD_PASSWORD_set")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    )
    .context("write env")?;
    Ok(())
}

pub fn run(paths: &KeyholdPaths, as_json: bool) -> eyre::Result<()> {
    let report = collect(paths);
    let mut out = std::io::stdout().lock();
    if as_json {
        print_json(&mut out, &report)?;
    } else {
        print_human(&mut out, &report)?;
    }
    Ok(())
}
