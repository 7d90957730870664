//! The encrypted vault store: an [`ObservableStore`] that can only be read or written while
//! it holds an [`EncryptionAdapter`].

use crate::{
    errors::KeyholdError,
    keystore::crypto::EncryptionAdapter,
    observable::{ObservableStore, PersistedShape, StoreCodec},
    storage::{KvStorage, VAULT_KEY},
    wallet::Vault,
};
use eyre::Context as _;
use std::{
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// What the session layer is allowed to do with the vault.
pub trait VaultGate: Send + Sync + 'static {
    /// Encrypts and persists an empty vault under `adapter`, leaving it unlocked.
    fn initialize(&self, adapter: EncryptionAdapter) -> impl Future<Output = eyre::Result<()>> + Send;
    fn unlock(&self, adapter: EncryptionAdapter) -> eyre::Result<()>;
    fn lock(&self);
    fn is_locked(&self) -> bool;
    fn has_ciphertext(&self) -> eyre::Result<bool>;
    fn get_state(&self) -> Vault;
    fn mutate<R>(&self, f: impl FnOnce(&mut Vault) -> eyre::Result<R>) -> eyre::Result<R>;
    fn flush(&self) -> impl Future<Output = eyre::Result<()>> + Send;
}

/// Serializes the vault through the current adapter; refuses to work without one.
#[derive(Debug, Default)]
pub struct VaultCodec {
    adapter: RwLock<Option<Arc<EncryptionAdapter>>>,
}

impl VaultCodec {
    fn current(&self) -> eyre::Result<Arc<EncryptionAdapter>> {
        self.adapter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| KeyholdError::StoreLocked.into())
    }

    fn set(&self, adapter: Option<EncryptionAdapter>) {
        *self.adapter.write().unwrap_or_else(PoisonError::into_inner) = adapter.map(Arc::new);
    }

    fn is_set(&self) -> bool {
        self.adapter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

fn decode_vault(adapter: &EncryptionAdapter, payload: &str) -> eyre::Result<Vault> {
    let plaintext = adapter.decrypt(payload)?;
    serde_json::from_str(&plaintext).context("parse decrypted vault")
}

impl StoreCodec<Vault> for VaultCodec {
    fn serialize(&self, state: &Vault) -> eyre::Result<String> {
        let adapter = self.current()?;
        let plaintext = Zeroizing::new(serde_json::to_string(state).context("serialize vault")?);
        adapter.encrypt(&plaintext)
    }

    fn deserialize(&self, payload: &str) -> eyre::Result<Vault> {
        decode_vault(&*self.current()?, payload)
    }
}

/// Starts Locked. Reads while Locked return the empty vault.
#[derive(Debug)]
pub struct EncryptedStore {
    store: ObservableStore<Vault, VaultCodec>,
}

impl EncryptedStore {
    pub fn new(storage: Arc<dyn KvStorage>) -> Self {
        Self {
            store: ObservableStore::with_persistence(
                VAULT_KEY,
                Vault::default(),
                storage,
                VaultCodec::default(),
                false,
            ),
        }
    }

    fn read_ciphertext(&self) -> eyre::Result<Option<String>> {
        self.store
            .storage()
            .get(VAULT_KEY)
            .context("read vault ciphertext")
    }

}

impl VaultGate for EncryptedStore {
    async fn initialize(&self, adapter: EncryptionAdapter) -> eyre::Result<()> {
        if self.read_ciphertext()?.is_some() {
            return Err(KeyholdError::VaultAlreadyInitialized.into());
        }
        self.store.codec().set(Some(adapter));
        self.store.reset_to_fallback();
        self.store.set_persisting(true);
        if let Err(e) = self.store.flush().await {
            self.lock();
            return Err(e);
        }
        info!("vault initialized");
        Ok(())
    }

    fn unlock(&self, adapter: EncryptionAdapter) -> eyre::Result<()> {
        let decoded = self.read_ciphertext().and_then(|raw| {
            let raw = raw.ok_or(KeyholdError::VaultNotInitialized)?;
            decode_vault(&adapter, &PersistedShape::migrate(&raw).into_payload())
        });
        let vault = match decoded {
            Ok(v) => v,
            Err(e) => {
                // A failed re-entry must not leave a previous session reachable.
                self.lock();
                return Err(e);
            }
        };

        self.store.codec().set(Some(adapter));
        self.store.replace_state(vault);
        self.store.set_persisting(true);
        debug!("vault unlocked");
        Ok(())
    }

    fn lock(&self) {
        self.store.set_persisting(false);
        self.store.codec().set(None);
        self.store.reset_to_fallback();
    }

    fn is_locked(&self) -> bool {
        !self.store.codec().is_set()
    }

    fn has_ciphertext(&self) -> eyre::Result<bool> {
        Ok(self.read_ciphertext()?.is_some())
    }

    fn get_state(&self) -> Vault {
        if self.is_locked() {
            return self.store.fallback().clone();
        }
        self.store.get_state()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vault) -> eyre::Result<R>) -> eyre::Result<R> {
        if self.is_locked() {
            return Err(KeyholdError::StoreLocked.into());
        }
        self.store.try_update(f)
    }

    async fn flush(&self) -> eyre::Result<()> {
        self.store.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        derivation::KeyDerivationEngine,
        errors::kind,
        keystore::crypto::EncryptionKey,
        storage::MemoryStorage,
    };

    fn adapter(byte: u8) -> EncryptionAdapter {
        EncryptionAdapter::new(EncryptionKey::from_bytes_for_test([byte; 32]))
    }

    async fn initialized() -> eyre::Result<(Arc<dyn KvStorage>, EncryptedStore)> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let vault = EncryptedStore::new(Arc::clone(&storage));
        vault.initialize(adapter(1)).await?;
        Ok((storage, vault))
    }

    #[tokio::test]
    async fn starts_locked_and_refuses_work() -> eyre::Result<()> {
        let vault = EncryptedStore::new(Arc::new(MemoryStorage::new()));
        assert!(vault.is_locked(), "initial state is Locked");
        assert_eq!(vault.get_state(), Vault::default());

        let err = vault.mutate(|_v| Ok(())).err().ok_or_else(|| eyre::eyre!("mutated"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::StoreLocked));
        let err = vault.flush().await.err().ok_or_else(|| eyre::eyre!("flushed"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::StoreLocked));

        let err = vault.unlock(adapter(1)).err().ok_or_else(|| eyre::eyre!("unlocked"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::VaultNotInitialized));
        Ok(())
    }

    #[tokio::test]
    async fn only_ciphertext_reaches_storage() -> eyre::Result<()> {
        let (storage, vault) = initialized().await?;
        vault.mutate(|v| {
            v.add_mnemonic_wallet(
                &KeyDerivationEngine::default(),
                "main",
                "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
            )
        })?;
        vault.flush().await?;

        let raw = storage.get(VAULT_KEY)?.ok_or_else(|| eyre::eyre!("no vault"))?;
        assert!(raw.starts_with("v1:"), "stored value must be an envelope");
        assert!(!raw.contains("abandon"), "plaintext reached storage");
        assert_eq!(PersistedShape::migrate(&raw).version_tag(), "v1");
        Ok(())
    }

    #[tokio::test]
    async fn wrong_key_stays_locked_and_right_key_restores_state() -> eyre::Result<()> {
        let (_storage, vault) = initialized().await?;
        vault.mutate(|v| v.add_imported_wallet("imp", &[4_u8; 32]))?;
        vault.flush().await?;
        vault.lock();
        assert!(vault.is_locked(), "lock() must lock");
        assert_eq!(vault.get_state(), Vault::default(), "locked reads see fallback");

        let err = vault.unlock(adapter(2)).err().ok_or_else(|| eyre::eyre!("wrong key"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::AuthenticationFailure));
        assert!(vault.is_locked(), "no partial unlock");

        vault.unlock(adapter(1))?;
        assert!(!vault.is_locked(), "right key unlocks");
        assert_eq!(vault.get_state().wallets.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_reentry_locks_an_unlocked_store() -> eyre::Result<()> {
        let (_storage, vault) = initialized().await?;
        assert!(!vault.is_locked(), "initialize leaves it unlocked");
        assert!(vault.unlock(adapter(9)).is_err(), "wrong key must fail");
        assert!(vault.is_locked(), "failed re-entry must lock");

        vault.lock();
        vault.lock();
        assert!(vault.is_locked(), "lock is idempotent");
        Ok(())
    }

    #[tokio::test]
    async fn tampered_vault_is_indistinguishable_from_wrong_password() -> eyre::Result<()> {
        let (storage, vault) = initialized().await?;
        vault.lock();
        let raw = storage.get(VAULT_KEY)?.ok_or_else(|| eyre::eyre!("no vault"))?;
        let mut env = crate::keystore::crypto::CipherEnvelope::parse(&raw)?;
        if let Some(b) = env.ciphertext.first_mut() {
            *b ^= 0x80;
        }
        storage.set(VAULT_KEY, &env.encode())?;

        let err = vault.unlock(adapter(1)).err().ok_or_else(|| eyre::eyre!("tamper"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::AuthenticationFailure));
        Ok(())
    }

    #[tokio::test]
    async fn initialize_twice_is_rejected() -> eyre::Result<()> {
        let (_storage, vault) = initialized().await?;
        let err = vault
            .initialize(adapter(3))
            .await
            .err()
            .ok_or_else(|| eyre::eyre!("re-initialized"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::VaultAlreadyInitialized));
        Ok(())
    }

    #[tokio::test]
    async fn legacy_quoted_envelope_still_unlocks() -> eyre::Result<()> {
        let (storage, vault) = initialized().await?;
        vault.lock();
        let raw = storage.get(VAULT_KEY)?.ok_or_else(|| eyre::eyre!("no vault"))?;
        storage.set(VAULT_KEY, &serde_json::to_string(&raw)?)?;
        vault.unlock(adapter(1))?;
        assert!(!vault.is_locked(), "quoted envelope must be accepted");
        Ok(())
    }
}
