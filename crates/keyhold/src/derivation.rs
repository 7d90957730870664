//! Hardened-only SLIP-0010 key derivation for ed25519.
//!
//! ed25519 has no safe non-hardened child derivation, so every step of a path must be
//! hardened. Unhardened segments and raw indices at or above `2^31` are rejected with
//! [`KeyholdError::InvalidDerivationPath`]; they are never coerced.
//!
//! Accounts live at `m/44'/<coin_type>'/<index>'`. Index 0 of the first wallet is the
//! "main account" other components rely on.

use crate::errors::KeyholdError;
use bip39::{Language, Mnemonic};
use ed25519_dalek::SigningKey;
use eyre::Context as _;
use hmac::{Hmac, Mac as _};
use sha2::Sha512;
use std::{fmt, str::FromStr};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type HmacSha512 = Hmac<Sha512>;

pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// SLIP-44 coin type used by default (Solana).
pub const DEFAULT_COIN_TYPE: u32 = 501;

pub const DEFAULT_STRENGTH_BITS: usize = 128;

const ED25519_CURVE_KEY: &[u8] = b"ed25519 seed";

/// One node of the derivation tree. Wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExtendedKey {
    key: [u8; 32],
    chain_code: [u8; 32],
}

impl ExtendedKey {
    fn from_hmac_output(mut out: [u8; 64]) -> Self {
        let mut ek = Self {
            key: [0_u8; 32],
            chain_code: [0_u8; 32],
        };
        let (l, r) = out.split_at(32);
        ek.key.copy_from_slice(l);
        ek.chain_code.copy_from_slice(r);
        out.zeroize();
        ek
    }

    pub const fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub const fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExtendedKey(<redacted>)")
    }
}

/// A fully hardened path. Segments are stored without the hardened offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivationPath {
    segments: Vec<u32>,
}

impl DerivationPath {
    /// `m/44'/<coin_type>'/<index>'`
    pub fn for_account(coin_type: u32, index: u32) -> eyre::Result<Self> {
        for v in [coin_type, index] {
            if v >= HARDENED_OFFSET {
                return Err(KeyholdError::InvalidDerivationPath(format!(
                    "index {v} is not representable as a hardened index"
                ))
                .into());
            }
        }
        Ok(Self {
            segments: vec![44, coin_type, index],
        })
    }

    pub fn segments(&self) -> &[u32] {
        &self.segments
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for s in &self.segments {
            write!(f, "/{s}'")?;
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| -> eyre::Report {
            KeyholdError::InvalidDerivationPath(format!("{s}: {why}")).into()
        };

        let mut parts = s.split('/');
        if parts.next() != Some("m") {
            return Err(invalid("path must start with `m`"));
        }

        let mut segments = vec![];
        for part in parts {
            let Some(digits) = part.strip_suffix('\'').or_else(|| part.strip_suffix('h')) else {
                return Err(invalid("every segment must be hardened"));
            };
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("segment must be a non-negative integer"));
            }
            let v: u32 = digits
                .parse()
                .map_err(|e| invalid(&format!("segment out of range: {e}")))?;
            if v >= HARDENED_OFFSET {
                return Err(invalid("segment exceeds the hardened index range"));
            }
            segments.push(v);
        }
        Ok(Self { segments })
    }
}

/// A derived account keypair. The secret never leaves this struct except through
/// [`AccountKeypair::signing_key`]; it is wiped on drop by `ed25519-dalek`.
pub struct AccountKeypair {
    pub public_key: [u8; 32],
    pub derivation_path: DerivationPath,
    pub index: u32,
    signing_key: SigningKey,
}

impl AccountKeypair {
    pub const fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Base58 rendering of the public key.
    pub fn address(&self) -> String {
        encode_public_key(&self.public_key)
    }
}

impl fmt::Debug for AccountKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKeypair")
            .field("public_key", &self.address())
            .field("derivation_path", &self.derivation_path.to_string())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Generate a fresh English BIP39 phrase with `strength_bits` of entropy.
pub fn generate_mnemonic(strength_bits: usize) -> eyre::Result<Zeroizing<String>> {
    if !(128..=256).contains(&strength_bits) || strength_bits % 32 != 0 {
        eyre::bail!("unsupported mnemonic strength: {strength_bits} bits");
    }
    let words = strength_bits / 32 * 3;
    let mnemonic = Mnemonic::generate_in(Language::English, words).context("generate mnemonic")?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

pub fn parse_mnemonic(phrase: &str) -> eyre::Result<Mnemonic> {
    Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|_e| KeyholdError::InvalidMnemonic.into())
}

pub fn validate_mnemonic(phrase: &str) -> bool {
    parse_mnemonic(phrase).is_ok()
}

/// BIP39 seed with an empty passphrase.
pub fn derive_seed(phrase: &str) -> eyre::Result<Zeroizing<[u8; 64]>> {
    let mnemonic = parse_mnemonic(phrase)?;
    Ok(Zeroizing::new(mnemonic.to_seed_normalized("")))
}

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> eyre::Result<[u8; 64]> {
    let mut mac = HmacSha512::new_from_slice(key).map_err(|e| eyre::eyre!("hmac init: {e}"))?;
    for p in parts {
        mac.update(p);
    }
    let mut out = [0_u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

pub fn master_key(seed: &[u8]) -> eyre::Result<ExtendedKey> {
    Ok(ExtendedKey::from_hmac_output(hmac_sha512(
        ED25519_CURVE_KEY,
        &[seed],
    )?))
}

/// Hardened child `index'` of `parent`. `index` is the unhardened number; the offset is
/// added here.
pub fn child_key(parent: &ExtendedKey, index: u32) -> eyre::Result<ExtendedKey> {
    if index >= HARDENED_OFFSET {
        return Err(KeyholdError::InvalidDerivationPath(format!(
            "raw index {index} is outside the hardened range"
        ))
        .into());
    }
    let hardened = index + HARDENED_OFFSET;
    let out = hmac_sha512(
        &parent.chain_code,
        &[&[0x00], &parent.key, &hardened.to_be_bytes()],
    )?;
    Ok(ExtendedKey::from_hmac_output(out))
}

pub fn derive_path(seed: &[u8], path: &DerivationPath) -> eyre::Result<ExtendedKey> {
    let mut node = master_key(seed)?;
    for &i in path.segments() {
        node = child_key(&node, i)?;
    }
    Ok(node)
}

/// Parses an externally supplied secret: a 32-byte ed25519 seed, or a 64-byte
/// `seed || public key` keypair whose halves must agree.
pub fn keypair_from_secret(secret: &[u8]) -> eyre::Result<SigningKey> {
    match secret.len() {
        32 => {
            let mut seed = Zeroizing::new([0_u8; 32]);
            seed.copy_from_slice(secret);
            Ok(SigningKey::from_bytes(&seed))
        }
        64 => {
            let mut bytes = Zeroizing::new([0_u8; 64]);
            bytes.copy_from_slice(secret);
            SigningKey::from_keypair_bytes(&bytes)
                .map_err(|_e| KeyholdError::InvalidSecretKey.into())
        }
        _ => Err(KeyholdError::InvalidSecretKey.into()),
    }
}

pub fn public_key_from_secret(secret: &[u8]) -> eyre::Result<[u8; 32]> {
    Ok(keypair_from_secret(secret)?.verifying_key().to_bytes())
}

pub fn encode_public_key(public_key: &[u8; 32]) -> String {
    bs58::encode(public_key).into_string()
}

/// Short display label such as `GjJy…7AhL`.
///
/// Not collision resistant; never use it to identify or verify a key.
pub fn fingerprint(public_key: &[u8; 32]) -> String {
    let s = encode_public_key(public_key);
    let head: String = s.chars().take(4).collect();
    let tail: String = s
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{head}…{tail}")
}

/// Derivation entry point used by wallet flows; carries the coin type so callers only pass
/// `(mnemonic, index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDerivationEngine {
    coin_type: u32,
}

impl Default for KeyDerivationEngine {
    fn default() -> Self {
        Self {
            coin_type: DEFAULT_COIN_TYPE,
        }
    }
}

impl KeyDerivationEngine {
    pub fn new(coin_type: u32) -> eyre::Result<Self> {
        if coin_type >= HARDENED_OFFSET {
            return Err(KeyholdError::InvalidDerivationPath(format!(
                "coin type {coin_type} is not representable as a hardened index"
            ))
            .into());
        }
        Ok(Self { coin_type })
    }

    pub const fn coin_type(&self) -> u32 {
        self.coin_type
    }

    pub fn account_path(&self, index: u32) -> eyre::Result<DerivationPath> {
        DerivationPath::for_account(self.coin_type, index)
    }

    pub fn derive_account(&self, phrase: &str, index: u32) -> eyre::Result<AccountKeypair> {
        let derivation_path = self.account_path(index)?;
        let seed = derive_seed(phrase)?;
        let node = derive_path(seed.as_slice(), &derivation_path)?;
        let signing_key = SigningKey::from_bytes(node.key());
        Ok(AccountKeypair {
            public_key: signing_key.verifying_key().to_bytes(),
            derivation_path,
            index,
            signing_key,
        })
    }
}
