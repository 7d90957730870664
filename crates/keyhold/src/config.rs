use crate::{
    derivation::{DEFAULT_COIN_TYPE, DEFAULT_STRENGTH_BITS},
    session::{DEFAULT_HYDRATION_TIMEOUT, DEFAULT_SESSION_TTL, MAX_SESSION_TTL},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyholdConfig {
    /// How long an unlocked session stays open without `extend` (seconds). Default 3 minutes.
    pub session_ttl_seconds: u64,

    /// SLIP-44 coin type used in `m/44'/<coin_type>'/<index>'`. Default 501 (Solana).
    ///
    /// Changing this after wallets exist changes every derived address; existing accounts keep
    /// the path they were derived with.
    pub coin_type: u32,

    /// Entropy for newly generated mnemonics: 128 (12 words) up to 256 (24 words).
    pub mnemonic_strength_bits: usize,

    /// Upper bound on loading the on-disk stores at startup (milliseconds).
    pub hydration_timeout_ms: u64,
}

impl Default for KeyholdConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: DEFAULT_SESSION_TTL.as_secs(),
            coin_type: DEFAULT_COIN_TYPE,
            mnemonic_strength_bits: DEFAULT_STRENGTH_BITS,
            hydration_timeout_ms: u64::try_from(DEFAULT_HYDRATION_TIMEOUT.as_millis())
                .unwrap_or(5_000),
        }
    }
}

impl KeyholdConfig {
    /// Clamped to `1..=MAX_SESSION_TTL`; zero would lock immediately.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(
            self.session_ttl_seconds
                .clamp(1, MAX_SESSION_TTL.as_secs()),
        )
    }

    pub fn hydration_timeout(&self) -> Duration {
        Duration::from_millis(self.hydration_timeout_ms.max(1))
    }
}
