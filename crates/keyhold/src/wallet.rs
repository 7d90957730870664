//! The vault's plaintext model and the pure mutations wallet flows apply to it.
//!
//! Only the mnemonic of a derived wallet is durable secret material; account keys are
//! re-derived from `(mnemonic, index)` whenever they are needed.

use crate::{
    derivation::{self, KeyDerivationEngine},
    errors::KeyholdError,
};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A secret string stored inside the vault (a phrase or an encoded secret key).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretText(String);

impl SecretText {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretText(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAccount {
    pub index: u32,
    pub public_key: String,
    pub derivation_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedAccount {
    pub public_key: String,
    /// Base58 of the 64-byte `seed || public key` keypair.
    pub secret_key: SecretText,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalletBacking {
    Mnemonic {
        mnemonic: SecretText,
        accounts: Vec<DerivedAccount>,
    },
    Imported {
        accounts: Vec<ImportedAccount>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub name: String,
    pub created_at: String,
    #[serde(flatten)]
    pub backing: WalletBacking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    Mnemonic,
    Imported,
}

impl Wallet {
    pub const fn kind(&self) -> WalletKind {
        match self.backing {
            WalletBacking::Mnemonic { .. } => WalletKind::Mnemonic,
            WalletBacking::Imported { .. } => WalletKind::Imported,
        }
    }

    pub fn public_keys(&self) -> Vec<String> {
        match &self.backing {
            WalletBacking::Mnemonic { accounts, .. } => {
                accounts.iter().map(|a| a.public_key.clone()).collect()
            }
            WalletBacking::Imported { accounts } => {
                accounts.iter().map(|a| a.public_key.clone()).collect()
            }
        }
    }

    pub fn summary(&self) -> WalletSummary {
        let accounts = match &self.backing {
            WalletBacking::Mnemonic { accounts, .. } => accounts
                .iter()
                .map(|a| AccountSummary {
                    index: a.index,
                    public_key: a.public_key.clone(),
                    fingerprint: fingerprint_b58(&a.public_key),
                    derivation_path: Some(a.derivation_path.clone()),
                })
                .collect(),
            WalletBacking::Imported { accounts } => accounts
                .iter()
                .zip(0_u32..)
                .map(|(a, index)| AccountSummary {
                    index,
                    public_key: a.public_key.clone(),
                    fingerprint: fingerprint_b58(&a.public_key),
                    derivation_path: None,
                })
                .collect(),
        };
        WalletSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind(),
            created_at: self.created_at.clone(),
            accounts,
        }
    }
}

fn fingerprint_b58(public_key: &str) -> String {
    bs58::decode(public_key)
        .into_vec()
        .ok()
        .and_then(|v| <[u8; 32]>::try_from(v.as_slice()).ok())
        .map_or_else(|| public_key.to_owned(), |pk| derivation::fingerprint(&pk))
}

/// Everything that is encrypted at rest.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    #[serde(default)]
    pub wallets: Vec<Wallet>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("wallets", &self.wallets.len())
            .finish()
    }
}

/// Public, secret-free view of a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSummary {
    pub id: String,
    pub name: String,
    pub kind: WalletKind,
    pub created_at: String,
    pub accounts: Vec<AccountSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub index: u32,
    pub public_key: String,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,
}

/// Points at one account; kept outside the vault because it holds no secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    pub wallet_id: String,
    pub index: u32,
    pub public_key: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn derived_account(
    engine: &KeyDerivationEngine,
    phrase: &str,
    index: u32,
) -> eyre::Result<DerivedAccount> {
    let kp = engine.derive_account(phrase, index)?;
    Ok(DerivedAccount {
        index,
        public_key: kp.address(),
        derivation_path: kp.derivation_path.to_string(),
    })
}

impl Vault {
    pub fn find(&self, name: &str) -> Option<&Wallet> {
        self.wallets.iter().find(|w| w.name == name)
    }

    fn find_mut(&mut self, name: &str) -> eyre::Result<&mut Wallet> {
        self.wallets
            .iter_mut()
            .find(|w| w.name == name)
            .ok_or_else(|| KeyholdError::WalletNotFound(name.to_owned()).into())
    }

    fn ensure_name_free(&self, name: &str) -> eyre::Result<()> {
        if name.trim().is_empty() {
            eyre::bail!("wallet name must not be empty");
        }
        if self.find(name).is_some() {
            return Err(KeyholdError::WalletNameTaken(name.to_owned()).into());
        }
        Ok(())
    }

    /// Adds a mnemonic-backed wallet with account 0 derived.
    pub fn add_mnemonic_wallet(
        &mut self,
        engine: &KeyDerivationEngine,
        name: &str,
        phrase: &str,
    ) -> eyre::Result<WalletSummary> {
        self.ensure_name_free(name)?;
        let mnemonic = derivation::parse_mnemonic(phrase)?;
        let normalized = SecretText::new(mnemonic.to_string());
        let first = derived_account(engine, normalized.expose(), 0)?;
        let wallet = Wallet {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            created_at: now_rfc3339(),
            backing: WalletBacking::Mnemonic {
                mnemonic: normalized,
                accounts: vec![first],
            },
        };
        let summary = wallet.summary();
        self.wallets.push(wallet);
        Ok(summary)
    }

    pub fn add_imported_wallet(&mut self, name: &str, secret: &[u8]) -> eyre::Result<WalletSummary> {
        self.ensure_name_free(name)?;
        let sk = derivation::keypair_from_secret(secret)?;
        let pair = zeroize::Zeroizing::new(sk.to_keypair_bytes());
        let account = ImportedAccount {
            public_key: derivation::encode_public_key(&sk.verifying_key().to_bytes()),
            secret_key: SecretText::new(bs58::encode(pair.as_slice()).into_string()),
        };
        let wallet = Wallet {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            created_at: now_rfc3339(),
            backing: WalletBacking::Imported {
                accounts: vec![account],
            },
        };
        let summary = wallet.summary();
        self.wallets.push(wallet);
        Ok(summary)
    }

    /// Appends the next derived account. Accounts are never removed, so the next index is
    /// the current count.
    pub fn add_account(
        &mut self,
        engine: &KeyDerivationEngine,
        name: &str,
    ) -> eyre::Result<DerivedAccount> {
        let wallet = self.find_mut(name)?;
        let WalletBacking::Mnemonic { mnemonic, accounts } = &mut wallet.backing else {
            return Err(KeyholdError::NotMnemonicWallet(name.to_owned()).into());
        };
        let next = u32::try_from(accounts.len()).map_err(|_e| KeyholdError::AccountIndexOutOfRange)?;
        let account = derived_account(engine, mnemonic.expose(), next)?;
        accounts.push(account.clone());
        Ok(account)
    }

    /// Re-derives (or decodes) the signing key for one account.
    pub fn account_keypair(
        &self,
        engine: &KeyDerivationEngine,
        name: &str,
        index: u32,
    ) -> eyre::Result<SigningKey> {
        let wallet = self
            .find(name)
            .ok_or_else(|| KeyholdError::WalletNotFound(name.to_owned()))?;
        match &wallet.backing {
            WalletBacking::Mnemonic { mnemonic, accounts } => {
                if !accounts.iter().any(|a| a.index == index) {
                    return Err(KeyholdError::AccountIndexOutOfRange.into());
                }
                Ok(engine.derive_account(mnemonic.expose(), index)?.signing_key().clone())
            }
            WalletBacking::Imported { accounts } => {
                let account = usize::try_from(index)
                    .ok()
                    .and_then(|i| accounts.get(i))
                    .ok_or(KeyholdError::AccountIndexOutOfRange)?;
                let bytes = zeroize::Zeroizing::new(
                    bs58::decode(account.secret_key.expose())
                        .into_vec()
                        .map_err(|_e| KeyholdError::InvalidSecretKey)?,
                );
                derivation::keypair_from_secret(&bytes)
            }
        }
    }

    /// The first account of the first wallet, if there is one.
    pub fn first_account_ref(&self) -> Option<AccountRef> {
        let w = self.wallets.first()?;
        let public_key = w.public_keys().into_iter().next()?;
        Some(AccountRef {
            wallet_id: w.id.clone(),
            index: 0,
            public_key,
        })
    }

    pub fn summaries(&self) -> Vec<WalletSummary> {
        self.wallets.iter().map(Wallet::summary).collect()
    }
}
