use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured error suitable for printing to a CLI user or returning to a request handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
}

impl ErrorReport {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_owned(),
            message: message.into(),
        }
    }

    /// Build a report for any error. Typed errors keep their code; anything else is `internal`.
    pub fn from_report(e: &eyre::Report) -> Self {
        e.downcast_ref::<KeyholdError>()
            .map_or_else(|| Self::new("internal", format!("{e:#}")), Self::from)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyholdError {
    #[error("invalid mnemonic")]
    InvalidMnemonic,

    #[error("invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    #[error("invalid ciphertext format")]
    InvalidCiphertextFormat,

    #[error("authentication failure")]
    AuthenticationFailure,

    #[error("store locked")]
    StoreLocked,

    #[error("hydration timed out")]
    HydrationTimeout,

    #[error("vault not initialized")]
    VaultNotInitialized,

    #[error("vault already initialized")]
    VaultAlreadyInitialized,

    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    #[error("wallet name already exists: {0}")]
    WalletNameTaken(String),

    #[error("account index out of range")]
    AccountIndexOutOfRange,

    #[error("wallet is not mnemonic-backed: {0}")]
    NotMnemonicWallet(String),

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("session ttl must be at most {max_secs} seconds")]
    SessionTtlTooLong { max_secs: u64 },
}

impl From<&KeyholdError> for ErrorReport {
    fn from(e: &KeyholdError) -> Self {
        match e {
            KeyholdError::AuthenticationFailure | KeyholdError::InvalidCiphertextFormat => {
                Self::new("unlock_failed", "unlock failed")
            }
            KeyholdError::InvalidMnemonic => Self::new("invalid_mnemonic", "invalid mnemonic"),
            KeyholdError::InvalidDerivationPath(p) => Self::new(
                "invalid_derivation_path",
                format!("invalid derivation path: {p}"),
            ),
            KeyholdError::StoreLocked => Self::new("locked", "wallet is locked; unlock first"),
            KeyholdError::HydrationTimeout => {
                Self::new("hydration_timeout", "startup timed out; retry the operation")
            }
            KeyholdError::VaultNotInitialized => Self::new(
                "vault_not_initialized",
                "no vault exists yet; run `keyhold init` first",
            ),
            KeyholdError::VaultAlreadyInitialized => {
                Self::new("vault_already_initialized", "a vault already exists")
            }
            KeyholdError::WalletNotFound(name) => {
                Self::new("wallet_not_found", format!("wallet not found: {name}"))
            }
            KeyholdError::WalletNameTaken(name) => Self::new(
                "wallet_name_taken",
                format!("wallet name already exists: {name}"),
            ),
            KeyholdError::AccountIndexOutOfRange => {
                Self::new("account_index_out_of_range", "account index out of range")
            }
            KeyholdError::NotMnemonicWallet(name) => Self::new(
                "not_mnemonic_wallet",
                format!("cannot derive accounts for imported key wallet: {name}"),
            ),
            KeyholdError::InvalidSecretKey => {
                Self::new("invalid_secret_key", "invalid secret key")
            }
            KeyholdError::SessionTtlTooLong { max_secs } => Self::new(
                "session_ttl_too_long",
                format!("session ttl must be at most {max_secs} seconds"),
            ),
        }
    }
}

/// Returns the typed error carried by `e`, if any.
pub fn kind(e: &eyre::Report) -> Option<&KeyholdError> {
    e.downcast_ref::<KeyholdError>()
}
