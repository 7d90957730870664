#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use eyre::Context as _;
use keyhold::{
    context::SessionContext,
    doctor,
    errors::{kind, ErrorReport},
    paths::KeyholdPaths,
    store::ConfigStore,
};
use serde_json::json;
use std::time::Duration;
use tracing_subscriber::prelude::*;

mod cli_output;

#[derive(Parser, Debug)]
#[command(name = "keyhold", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print resolved paths (useful for debugging).
    Paths,

    /// Print a quick self-diagnostic report (safe to paste; contains no secrets).
    Doctor {
        /// Emit JSON to stdout (machine-readable).
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Create the encrypted vault and its password.
    Init,

    /// Check that the password unlocks the vault.
    UnlockCheck {
        /// Session length for this check.
        #[arg(long)]
        ttl_seconds: Option<u64>,
    },

    /// Manage wallets inside the vault (each command unlocks, acts, then locks).
    Wallet {
        #[command(subcommand)]
        cmd: WalletCommand,
    },
}

#[derive(Subcommand, Debug)]
enum WalletCommand {
    #[command(flatten)]
    Vault(VaultCommand),

    /// Print the designated main account. Needs no password.
    ShowMain,
}

/// Wallet commands that run inside an unlocked session.
#[derive(Subcommand, Debug)]
enum VaultCommand {
    /// Generate a new recovery phrase and store it as a wallet.
    Create {
        name: String,
        /// Mnemonic entropy: 128 (12 words) to 256 (24 words). Defaults to the config value.
        #[arg(long)]
        strength_bits: Option<usize>,
    },

    /// Import a BIP39 phrase (read from `KEYHOLD_IMPORT_SECRET` or a hidden prompt).
    ImportMnemonic { name: String },

    /// Import a raw ed25519 secret: base58, hex, or a JSON byte array.
    ImportSecret { name: String },

    /// Derive the next account of a phrase-backed wallet.
    AddAccount { name: String },

    /// List wallets and their public keys.
    List,
}

fn init_logging(paths: &KeyholdPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("keyhold.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

/// Typed failures become their user-facing report; wrong password and a damaged vault read
/// the same.
fn user_facing(e: eyre::Report) -> eyre::Report {
    match kind(&e) {
        Some(k) => {
            let r = ErrorReport::from(k);
            eyre::eyre!("{} ({})", r.message, r.code)
        }
        None => e,
    }
}

async fn unlocked_context(paths: &KeyholdPaths, ttl: Option<Duration>) -> eyre::Result<SessionContext> {
    let cfg = ConfigStore::new(paths).load_or_init_default()?;
    let ctx = SessionContext::open(paths, cfg)?;
    let password = cli_output::read_password()?;
    ctx.unlock(password, ttl).await?;
    Ok(ctx)
}

async fn show_main(paths: &KeyholdPaths) -> eyre::Result<()> {
    let cfg = ConfigStore::new(paths).load_or_init_default()?;
    let ctx = SessionContext::open(paths, cfg)?;
    let main = ctx.main_account().await?;
    cli_output::print_json(&json!({ "ok": true, "main_account": main }))
}

async fn run_vault(paths: &KeyholdPaths, cmd: VaultCommand) -> eyre::Result<()> {
    let ctx = unlocked_context(paths, None).await?;
    let out = match cmd {
        VaultCommand::Create {
            name,
            strength_bits,
        } => {
            let created = ctx.create_wallet(&name, strength_bits).await?;
            cli_output::print_mnemonic_notice();
            json!({
                "ok": true,
                "wallet": created.summary,
                "mnemonic": created.mnemonic.as_str(),
            })
        }
        VaultCommand::ImportMnemonic { name } => {
            let phrase = cli_output::read_import_secret("Recovery phrase: ")?;
            json!({ "ok": true, "wallet": ctx.import_mnemonic(&name, &phrase).await? })
        }
        VaultCommand::ImportSecret { name } => {
            let secret = cli_output::read_import_secret("Secret key: ")?;
            json!({ "ok": true, "wallet": ctx.import_secret(&name, &secret).await? })
        }
        VaultCommand::AddAccount { name } => {
            json!({ "ok": true, "account": ctx.add_account(&name).await? })
        }
        VaultCommand::List => json!({ "ok": true, "wallets": ctx.list_wallets()? }),
    };
    ctx.lock();
    cli_output::print_json(&out)
}

async fn run(paths: &KeyholdPaths, cmd: Command) -> eyre::Result<()> {
    match cmd {
        Command::Paths => cli_output::print_json(&json!({
          "config_dir": paths.config_dir,
          "data_dir": paths.data_dir,
          "log_file": paths.log_file,
          "store_dir": paths.store_dir(),
        })),
        Command::Doctor { json } => doctor::run(paths, json).context("doctor failed"),
        Command::Init => {
            let cfg = ConfigStore::new(paths).load_or_init_default()?;
            let ctx = SessionContext::open(paths, cfg)?;
            let password = cli_output::read_new_password()?;
            ctx.create_vault(password).await?;
            ctx.lock();
            cli_output::print_json(&json!({ "ok": true, "vault": "created" }))
        }
        Command::UnlockCheck { ttl_seconds } => {
            let ctx = unlocked_context(paths, ttl_seconds.map(Duration::from_secs)).await?;
            let remaining = ctx.session().remaining().map(|d| d.as_secs());
            let unlocked = ctx.is_unlocked();
            ctx.lock();
            cli_output::print_json(&json!({
                "ok": true,
                "unlocked": unlocked,
                "session_seconds_remaining": remaining,
            }))
        }
        Command::Wallet {
            cmd: WalletCommand::ShowMain,
        } => show_main(paths).await,
        Command::Wallet {
            cmd: WalletCommand::Vault(cmd),
        } => run_vault(paths, cmd).await,
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = KeyholdPaths::discover()?;
    paths.ensure_private_dirs()?;
    let _log_guard = init_logging(&paths);

    run(&paths, cli.cmd).await.map_err(user_facing)
}
