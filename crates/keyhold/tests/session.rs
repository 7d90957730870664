use keyhold::{
    config::KeyholdConfig,
    context::SessionContext,
    derivation::{self, KeyDerivationEngine},
    errors::{kind, ErrorReport, KeyholdError},
    keystore::{crypto::KdfParams, PasswordKeyDerivation},
    session::SessionManager,
    storage::{KvStorage, MemoryStorage},
    vault::{EncryptedStore, VaultGate as _},
    wallet::Vault,
};
use secrecy::SecretString;
use std::{sync::Arc, time::Duration};

const ABANDON_ABOUT: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn pw(s: &str) -> SecretString {
    SecretString::new(s.into())
}

fn fast_kdf() -> KdfParams {
    KdfParams { iterations: 1_000 }
}

fn manager(storage: &Arc<dyn KvStorage>) -> SessionManager {
    SessionManager::new(
        Arc::new(EncryptedStore::new(Arc::clone(storage))),
        PasswordKeyDerivation::new(Arc::clone(storage), fast_kdf()),
        Arc::clone(storage),
    )
}

#[test]
fn scenario_a_known_public_key_for_account_zero() -> eyre::Result<()> {
    let engine = KeyDerivationEngine::default();
    let kp = engine.derive_account(ABANDON_ABOUT, 0)?;
    assert_eq!(kp.address(), "GjJyeC1r2RgkuoCWMyPYkCWSGSGLcz266EaAkLA27AhL");
    assert_eq!(kp.derivation_path.to_string(), "m/44'/501'/0'");

    let again = engine.derive_account(ABANDON_ABOUT, 0)?;
    assert_eq!(
        kp.signing_key().to_bytes(),
        again.signing_key().to_bytes(),
        "derivation is deterministic"
    );
    Ok(())
}

#[tokio::test]
async fn scenario_b_empty_vault_roundtrip_and_wrong_password() -> eyre::Result<()> {
    let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
    let m = manager(&storage);
    m.create_vault(pw("P"), None).await?;
    m.lock();

    m.unlock(pw("P"), None).await?;
    assert_eq!(m.vault().get_state(), Vault::default());
    m.lock();

    let err = m
        .unlock(pw("P2"), None)
        .await
        .err()
        .ok_or_else(|| eyre::eyre!("P2 unlocked the vault"))?;
    assert_eq!(kind(&err), Some(&KeyholdError::AuthenticationFailure));
    assert_eq!(ErrorReport::from_report(&err).code, "unlock_failed");
    assert!(m.vault().is_locked(), "store remains locked");
    assert!(!m.is_unlocked(), "session remains locked");
    Ok(())
}

#[tokio::test]
async fn scenario_c_extend_while_locked() -> eyre::Result<()> {
    let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
    let m = manager(&storage);
    assert!(!m.extend(Some(Duration::from_secs(60))), "extend must fail");
    assert!(!m.has_pending_timer(), "no timer created");

    m.create_vault(pw("P"), None).await?;
    m.lock();
    assert!(!m.extend(None), "extend after lock must fail too");
    assert!(!m.has_pending_timer(), "still no timer");
    Ok(())
}

#[test]
fn scenario_d_sibling_accounts_differ() -> eyre::Result<()> {
    let engine = KeyDerivationEngine::default();
    let a = engine.derive_account(ABANDON_ABOUT, 0)?;
    let b = engine.derive_account(ABANDON_ABOUT, 1)?;
    assert_ne!(a.public_key, b.public_key);
    assert_eq!(b.address(), "ANf3TEKFL6jPWjzkndo4CbnNdUNkBk4KHPggJs2nu8Xi");

    let differing = a
        .public_key
        .iter()
        .zip(b.public_key.iter())
        .filter(|(x, y)| x != y)
        .count();
    assert!(differing > 16, "sibling keys share too many bytes: {differing}");
    Ok(())
}

#[tokio::test]
async fn session_ttl_expires_in_real_time() -> eyre::Result<()> {
    let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
    let m = manager(&storage);
    m.create_vault(pw("P"), None).await?;
    m.lock();

    m.unlock(pw("P"), Some(Duration::from_millis(200))).await?;
    assert!(m.is_unlocked(), "open immediately after unlock");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!m.is_unlocked(), "locked once the ttl has passed");
    assert!(m.vault().is_locked(), "timer locked the store");
    Ok(())
}

#[tokio::test]
async fn lock_is_idempotent() -> eyre::Result<()> {
    let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
    let m = manager(&storage);
    m.lock();
    m.lock();
    assert!(!m.is_unlocked(), "never unlocked");

    m.create_vault(pw("P"), None).await?;
    m.lock();
    m.lock();
    assert!(!m.is_unlocked(), "locked twice");
    assert!(!m.has_pending_timer(), "no timer survives lock");
    Ok(())
}

#[tokio::test]
async fn context_handlers_end_to_end() -> eyre::Result<()> {
    let ctx = SessionContext::new(
        Arc::new(MemoryStorage::new()),
        KeyholdConfig::default(),
        fast_kdf(),
    )?;
    ctx.create_vault(pw("P")).await?;
    let w = ctx.import_mnemonic("main", ABANDON_ABOUT).await?;
    let acct = ctx.add_account("main").await?;
    assert_eq!(acct.derivation_path, "m/44'/501'/1'");

    let sk = ctx.account_keypair("main", 0)?;
    let main = ctx
        .main_account()
        .await?
        .ok_or_else(|| eyre::eyre!("main account not designated"))?;
    assert_eq!(main.wallet_id, w.id);
    assert_eq!(
        derivation::encode_public_key(&sk.verifying_key().to_bytes()),
        main.public_key
    );

    assert!(ctx.extend(None), "extend while unlocked");
    ctx.lock();
    assert!(!ctx.extend(None), "extend after lock");
    Ok(())
}
