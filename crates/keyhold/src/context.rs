//! The process-wide session context and the wallet request handlers built on it.
//!
//! One [`SessionContext`] is constructed at startup and passed to every handler; there is no
//! ambient global state.

use crate::{
    config::KeyholdConfig,
    derivation::{self, KeyDerivationEngine},
    errors::KeyholdError,
    keystore::{crypto::KdfParams, PasswordKeyDerivation},
    paths::KeyholdPaths,
    session::SessionManager,
    storage::{FileStorage, KvStorage},
    vault::{EncryptedStore, VaultGate as _},
    wallet::{AccountRef, DerivedAccount, WalletSummary},
};
use ed25519_dalek::SigningKey;
use eyre::Context as _;
use secrecy::SecretString;
use std::{fmt, sync::Arc, time::Duration};
use tracing::info;
use zeroize::Zeroizing;

/// A freshly generated wallet. The phrase is handed out exactly once.
pub struct CreatedWallet {
    pub summary: WalletSummary,
    pub mnemonic: Zeroizing<String>,
}

impl fmt::Debug for CreatedWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedWallet")
            .field("summary", &self.summary)
            .field("mnemonic", &"<redacted>")
            .finish()
    }
}

/// Accepts base58 (Solana CLI / wallet export), a JSON byte array (Solana keypair file), or hex.
pub fn decode_secret(input: &str) -> eyre::Result<Zeroizing<Vec<u8>>> {
    let s = input.trim();
    if s.starts_with('[') {
        let bytes: Vec<u8> =
            serde_json::from_str(s).map_err(|_e| KeyholdError::InvalidSecretKey)?;
        return Ok(Zeroizing::new(bytes));
    }
    let hex_body = s.strip_prefix("0x").unwrap_or(s);
    if matches!(hex_body.len(), 64 | 128) && hex_body.bytes().all(|b| b.is_ascii_hexdigit()) {
        let bytes = hex::decode(hex_body).map_err(|_e| KeyholdError::InvalidSecretKey)?;
        return Ok(Zeroizing::new(bytes));
    }
    let bytes = bs58::decode(s)
        .into_vec()
        .map_err(|_e| KeyholdError::InvalidSecretKey)?;
    Ok(Zeroizing::new(bytes))
}

#[derive(Debug)]
pub struct SessionContext {
    cfg: KeyholdConfig,
    engine: KeyDerivationEngine,
    session: SessionManager<EncryptedStore>,
}

impl SessionContext {
    pub fn new(
        storage: Arc<dyn KvStorage>,
        cfg: KeyholdConfig,
        kdf: KdfParams,
    ) -> eyre::Result<Self> {
        let engine = KeyDerivationEngine::new(cfg.coin_type)?;
        let vault = Arc::new(EncryptedStore::new(Arc::clone(&storage)));
        let kdf = PasswordKeyDerivation::new(Arc::clone(&storage), kdf);
        let session = SessionManager::new(vault, kdf, storage)
            .with_default_ttl(cfg.session_ttl())
            .with_hydration_timeout(cfg.hydration_timeout());
        Ok(Self {
            cfg,
            engine,
            session,
        })
    }

    /// File-backed context under `<data_dir>/store`.
    pub fn open(paths: &KeyholdPaths, cfg: KeyholdConfig) -> eyre::Result<Self> {
        paths.ensure_private_dirs()?;
        let storage = FileStorage::open(paths.store_dir()).context("open store")?;
        Self::new(Arc::new(storage), cfg, KdfParams::default())
    }

    pub const fn config(&self) -> &KeyholdConfig {
        &self.cfg
    }

    pub const fn engine(&self) -> &KeyDerivationEngine {
        &self.engine
    }

    pub const fn session(&self) -> &SessionManager<EncryptedStore> {
        &self.session
    }

    pub async fn create_vault(&self, password: SecretString) -> eyre::Result<()> {
        self.session.create_vault(password, None).await
    }

    pub async fn unlock(&self, password: SecretString, ttl: Option<Duration>) -> eyre::Result<()> {
        self.session.unlock(password, ttl).await
    }

    pub fn lock(&self) {
        self.session.lock();
    }

    pub fn extend(&self, ttl: Option<Duration>) -> bool {
        self.session.extend(ttl)
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.is_unlocked()
    }

    /// Flushes the vault, then makes sure a main account is designated.
    async fn commit(&self) -> eyre::Result<()> {
        self.session.vault().flush().await.context("persist vault")?;
        self.session.backfill_main_account().await;
        Ok(())
    }

    pub async fn create_wallet(
        &self,
        name: &str,
        strength_bits: Option<usize>,
    ) -> eyre::Result<CreatedWallet> {
        self.session.require_unlocked()?;
        let phrase =
            derivation::generate_mnemonic(strength_bits.unwrap_or(self.cfg.mnemonic_strength_bits))?;
        let summary = self
            .session
            .vault()
            .mutate(|v| v.add_mnemonic_wallet(&self.engine, name, &phrase))?;
        self.commit().await?;
        info!(wallet = %summary.id, "wallet created");
        Ok(CreatedWallet {
            summary,
            mnemonic: phrase,
        })
    }

    pub async fn import_mnemonic(&self, name: &str, phrase: &str) -> eyre::Result<WalletSummary> {
        self.session.require_unlocked()?;
        let summary = self
            .session
            .vault()
            .mutate(|v| v.add_mnemonic_wallet(&self.engine, name, phrase))?;
        self.commit().await?;
        info!(wallet = %summary.id, kind = "mnemonic", "wallet imported");
        Ok(summary)
    }

    pub async fn import_secret(&self, name: &str, secret: &str) -> eyre::Result<WalletSummary> {
        self.session.require_unlocked()?;
        let bytes = decode_secret(secret)?;
        let summary = self
            .session
            .vault()
            .mutate(|v| v.add_imported_wallet(name, &bytes))?;
        self.commit().await?;
        info!(wallet = %summary.id, kind = "imported", "wallet imported");
        Ok(summary)
    }

    pub async fn add_account(&self, wallet: &str) -> eyre::Result<DerivedAccount> {
        self.session.require_unlocked()?;
        let account = self
            .session
            .vault()
            .mutate(|v| v.add_account(&self.engine, wallet))?;
        self.commit().await?;
        info!(index = account.index, "account added");
        Ok(account)
    }

    pub fn list_wallets(&self) -> eyre::Result<Vec<WalletSummary>> {
        self.session.require_unlocked()?;
        Ok(self.session.vault().get_state().summaries())
    }

    /// Re-derives the signing key on demand; callers should drop it as soon as they are done.
    pub fn account_keypair(&self, wallet: &str, index: u32) -> eyre::Result<SigningKey> {
        self.session.require_unlocked()?;
        self.session
            .vault()
            .get_state()
            .account_keypair(&self.engine, wallet, index)
    }

    /// The designated main account. Plaintext metadata, so no unlock is required.
    pub async fn main_account(&self) -> eyre::Result<Option<AccountRef>> {
        self.session.hydrate().await?;
        Ok(self.session.main_account())
    }
}
