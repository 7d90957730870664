use crate::errors::KeyholdError;
use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use eyre::Context as _;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

pub const ENVELOPE_VERSION: &str = "v1";
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// PBKDF2-HMAC-SHA256 parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

pub fn random_salt16() -> [u8; SALT_LEN] {
    let mut s = [0_u8; SALT_LEN];
    fill_random(&mut s);
    s
}

/// A 256-bit AES key. There is deliberately no way to read the bytes back out.
pub struct EncryptionKey(Zeroizing<[u8; 32]>);

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

#[cfg(test)]
impl EncryptionKey {
    pub(crate) fn from_bytes_for_test(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }
}

pub fn derive_passphrase_key(
    passphrase: &SecretString,
    salt16: &[u8; SALT_LEN],
    params: KdfParams,
) -> eyre::Result<EncryptionKey> {
    if params.iterations == 0 {
        eyre::bail!("invalid kdf params: iterations=0");
    }
    let mut out = Zeroizing::new([0_u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        passphrase.expose_secret().as_bytes(),
        salt16,
        params.iterations,
        out.as_mut_slice(),
    );
    Ok(EncryptionKey(out))
}

/// The persisted form of an encrypted value: `v1:<b64 nonce>:<b64 ciphertext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl CipherEnvelope {
    pub fn parse(s: &str) -> eyre::Result<Self> {
        let fields: Vec<&str> = s.split(':').collect();
        let [version, nonce_b64, ct_b64] = fields.as_slice() else {
            return Err(KeyholdError::InvalidCiphertextFormat.into());
        };
        if *version != ENVELOPE_VERSION {
            return Err(KeyholdError::InvalidCiphertextFormat.into());
        }
        let b64 = base64::engine::general_purpose::STANDARD;
        let nonce = b64
            .decode(nonce_b64)
            .map_err(|_e| KeyholdError::InvalidCiphertextFormat)?;
        let nonce = <[u8; NONCE_LEN]>::try_from(nonce.as_slice())
            .map_err(|_e| KeyholdError::InvalidCiphertextFormat)?;
        let ciphertext = b64
            .decode(ct_b64)
            .map_err(|_e| KeyholdError::InvalidCiphertextFormat)?;
        Ok(Self { nonce, ciphertext })
    }

    pub fn encode(&self) -> String {
        let b64 = base64::engine::general_purpose::STANDARD;
        format!(
            "{ENVELOPE_VERSION}:{}:{}",
            b64.encode(self.nonce),
            b64.encode(&self.ciphertext)
        )
    }
}

/// Authenticated encryption of strings under one session key.
#[derive(Debug)]
pub struct EncryptionAdapter {
    key: EncryptionKey,
}

impl EncryptionAdapter {
    pub const fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> eyre::Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.0.as_slice()).context("aes init")
    }

    /// Encrypts with a fresh random nonce per call.
    pub fn encrypt(&self, plaintext: &str) -> eyre::Result<String> {
        let cipher = self.cipher()?;
        let mut nonce = [0_u8; NONCE_LEN];
        fill_random(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| eyre::eyre!("aes encrypt: {e}"))?;
        Ok(CipherEnvelope { nonce, ciphertext }.encode())
    }

    /// A wrong key and a tampered ciphertext both surface as `AuthenticationFailure`.
    pub fn decrypt(&self, envelope: &str) -> eyre::Result<Zeroizing<String>> {
        let env = CipherEnvelope::parse(envelope)?;
        let cipher = self.cipher()?;
        let pt = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&env.nonce), env.ciphertext.as_ref())
                .map_err(|_e| KeyholdError::AuthenticationFailure)?,
        );
        let s = std::str::from_utf8(&pt).map_err(|_e| KeyholdError::InvalidCiphertextFormat)?;
        Ok(Zeroizing::new(s.to_owned()))
    }
}
