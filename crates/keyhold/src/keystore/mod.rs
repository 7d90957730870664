pub mod crypto;

use crate::storage::{KvStorage, SALT_KEY};
use base64::Engine as _;
use crypto::{EncryptionAdapter, EncryptionKey, KdfParams, SALT_LEN};
use eyre::Context as _;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::info;

/// Turns a password into the session's encryption key using the per-installation salt.
#[derive(Clone)]
pub struct PasswordKeyDerivation {
    storage: Arc<dyn KvStorage>,
    params: KdfParams,
}

impl std::fmt::Debug for PasswordKeyDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordKeyDerivation")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl PasswordKeyDerivation {
    pub fn new(storage: Arc<dyn KvStorage>, params: KdfParams) -> Self {
        Self { storage, params }
    }

    pub const fn params(&self) -> KdfParams {
        self.params
    }

    pub fn salt_exists(&self) -> eyre::Result<bool> {
        Ok(self.storage.get(SALT_KEY)?.is_some())
    }

    /// Returns the persisted salt, generating and persisting one on first use.
    ///
    /// The same salt backs every password derivation for this installation.
    pub fn get_or_create_salt(&self) -> eyre::Result<[u8; SALT_LEN]> {
        if let Some(s) = self.storage.get(SALT_KEY)? {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s.trim())
                .context("decode passphrase salt")?;
            return <[u8; SALT_LEN]>::try_from(bytes.as_slice())
                .map_err(|_e| eyre::eyre!("passphrase salt must decode to {SALT_LEN} bytes"));
        }

        let salt = crypto::random_salt16();
        self.storage
            .set(
                SALT_KEY,
                &base64::engine::general_purpose::STANDARD.encode(salt),
            )
            .context("persist passphrase salt")?;
        info!("generated passphrase salt");
        Ok(salt)
    }

    /// Key stretching runs on the blocking pool so it never stalls other queued work.
    pub async fn derive_key(&self, password: SecretString) -> eyre::Result<EncryptionKey> {
        let salt = self.get_or_create_salt()?;
        let params = self.params;
        tokio::task::spawn_blocking(move || crypto::derive_passphrase_key(&password, &salt, params))
            .await
            .context("key derivation task")?
    }

    pub async fn adapter_for(&self, password: SecretString) -> eyre::Result<EncryptionAdapter> {
        Ok(EncryptionAdapter::new(self.derive_key(password).await?))
    }
}
