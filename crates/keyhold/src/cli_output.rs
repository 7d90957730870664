//! Centralised helpers for CLI input and output. Machine-readable results go to stdout as
//! JSON; human notices and prompts go to stderr.

use eyre::Context as _;
use secrecy::SecretString;
use std::io::{IsTerminal as _, Write as _};
use zeroize::Zeroizing;

pub const PASSWORD_ENV: &str = "KEYHOLD_PASSWORD";
pub const IMPORT_SECRET_ENV: &str = "KEYHOLD_IMPORT_SECRET";

fn stderr_writeln(s: &str) {
    let mut stderr = std::io::stderr().lock();
    if stderr.write_all(s.as_bytes()).is_err() {
        return;
    }
    if stderr.write_all(b"\n").is_err() {
        return;
    }
    let _flush = stderr.flush();
}

pub fn print_json(v: &serde_json::Value) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(v).context("serialize output")?;
    writeln!(std::io::stdout().lock(), "{s}").context("write output")?;
    Ok(())
}

/// Shown once, right after a wallet is generated.
pub fn print_mnemonic_notice() {
    stderr_writeln(
        "Keyhold: this recovery phrase is shown once. Write it down and keep it offline; anyone who has it controls the wallet.",
    );
}

fn env_secret(var: &str) -> Option<Zeroizing<String>> {
    std::env::var(var)
        .ok()
        .map(Zeroizing::new)
        .filter(|s| !s.is_empty())
}

fn prompt_hidden(prompt: &str) -> eyre::Result<Zeroizing<String>> {
    if !std::io::stdin().is_terminal() {
        eyre::bail!("no terminal to prompt on; set {PASSWORD_ENV} / {IMPORT_SECRET_ENV}");
    }
    Ok(Zeroizing::new(
        rpassword::prompt_password(prompt).context("read from terminal")?,
    ))
}

fn to_secret(s: &str) -> SecretString {
    SecretString::new(s.into())
}

/// `KEYHOLD_PASSWORD`, or a hidden prompt.
pub fn read_password() -> eyre::Result<SecretString> {
    let pw = match env_secret(PASSWORD_ENV) {
        Some(p) => p,
        None => prompt_hidden("Keyhold password: ")?,
    };
    Ok(to_secret(&pw))
}

/// Like [`read_password`], but an interactive user types it twice.
pub fn read_new_password() -> eyre::Result<SecretString> {
    if let Some(p) = env_secret(PASSWORD_ENV) {
        return Ok(to_secret(&p));
    }
    let first = prompt_hidden("New keyhold password: ")?;
    if first.trim().is_empty() {
        eyre::bail!("password must not be empty");
    }
    let second = prompt_hidden("Repeat password: ")?;
    if first.as_str() != second.as_str() {
        eyre::bail!("passwords do not match");
    }
    Ok(to_secret(&first))
}

/// `KEYHOLD_IMPORT_SECRET`, or a hidden prompt.
pub fn read_import_secret(prompt: &str) -> eyre::Result<Zeroizing<String>> {
    match env_secret(IMPORT_SECRET_ENV) {
        Some(s) => Ok(s),
        None => prompt_hidden(prompt),
    }
}
