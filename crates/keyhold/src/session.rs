//! Time-boxed access to the vault.
//!
//! A session is the window during which the vault's encryption adapter is held in memory.
//! Every `unlock`/`extend` re-arms a single auto-lock timer; when it fires the vault is
//! locked again.

use crate::{
    errors::{ErrorReport, KeyholdError},
    keystore::PasswordKeyDerivation,
    observable::{JsonCodec, ObservableStore},
    storage::{KvStorage, META_KEY},
    vault::{EncryptedStore, VaultGate},
    wallet::AccountRef,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::OnceCell, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(180);
pub const DEFAULT_HYDRATION_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest window a single `unlock`/`extend` may request.
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Non-sensitive state kept next to the vault in plaintext.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaState {
    #[serde(default)]
    pub main_account: Option<AccountRef>,
}

/// Owns at most one pending timer task. Scheduling replaces (and aborts) the previous one.
#[derive(Debug, Default)]
pub struct CancellableTimer {
    handle: Option<JoinHandle<()>>,
}

impl CancellableTimer {
    /// Runs `on_fire` after `delay`. Outside a tokio runtime nothing is scheduled.
    pub fn schedule(&mut self, delay: Duration, on_fire: impl FnOnce() + Send + 'static) {
        self.cancel();
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            debug!("no async runtime; auto-lock timer not armed");
            return;
        };
        self.handle = Some(rt.spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        }));
    }

    /// Returns whether a timer was pending.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(h) => {
                let pending = !h.is_finished();
                h.abort();
                pending
            }
            None => false,
        }
    }

    /// Forgets the handle without aborting; used by the firing task itself.
    fn disarm(&mut self) {
        self.handle = None;
    }

    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug)]
struct Session {
    expires_at: Instant,
    epoch: u64,
    timer: CancellableTimer,
}

/// Orchestrates unlock, lock, extend and auto-lock over a [`VaultGate`].
///
/// Calls are not serialized internally; two concurrent `unlock` calls with different
/// passwords race and the caller must prevent that.
pub struct SessionManager<G = EncryptedStore> {
    vault: Arc<G>,
    kdf: PasswordKeyDerivation,
    meta: ObservableStore<MetaState>,
    default_ttl: Duration,
    hydration_timeout: Duration,
    session: Arc<Mutex<Option<Session>>>,
    epoch: AtomicU64,
    hydrated: OnceCell<()>,
}

impl<G> std::fmt::Debug for SessionManager<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("default_ttl", &self.default_ttl)
            .field("hydration_timeout", &self.hydration_timeout)
            .field("hydrated", &self.hydrated.initialized())
            .finish_non_exhaustive()
    }
}

fn expire<G: VaultGate>(slot: &Mutex<Option<Session>>, vault: &G, epoch: u64) {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if guard.as_ref().map(|s| s.epoch) != Some(epoch) {
        return;
    }
    if let Some(mut s) = guard.take() {
        s.timer.disarm();
    }
    vault.lock();
    info!(reason = "ttl_expired", "session locked");
}

impl<G: VaultGate> SessionManager<G> {
    pub fn new(vault: Arc<G>, kdf: PasswordKeyDerivation, storage: Arc<dyn KvStorage>) -> Self {
        Self {
            vault,
            kdf,
            meta: ObservableStore::new(META_KEY, MetaState::default(), storage, JsonCodec),
            default_ttl: DEFAULT_SESSION_TTL,
            hydration_timeout: DEFAULT_HYDRATION_TIMEOUT,
            session: Arc::new(Mutex::new(None)),
            epoch: AtomicU64::new(0),
            hydrated: OnceCell::new(),
        }
    }

    /// Clamped to [`MAX_SESSION_TTL`].
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl.min(MAX_SESSION_TTL);
        self
    }

    #[must_use]
    pub fn with_hydration_timeout(mut self, timeout: Duration) -> Self {
        self.hydration_timeout = timeout;
        self
    }

    pub fn vault(&self) -> &G {
        &self.vault
    }

    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn main_account(&self) -> Option<AccountRef> {
        self.meta.get_state().main_account
    }

    /// Loads the session-adjacent stores once. Concurrent callers wait on the same
    /// in-flight load; a timeout leaves it incomplete so a later call retries.
    pub async fn hydrate(&self) -> eyre::Result<()> {
        self.hydrated
            .get_or_try_init(|| async {
                let vault = Arc::clone(&self.vault);
                let probe = tokio::task::spawn_blocking(move || vault.has_ciphertext());
                let work = async { tokio::join!(self.meta.hydrate_from_storage(), probe) };
                let (meta, probe) = tokio::time::timeout(self.hydration_timeout, work)
                    .await
                    .map_err(|_elapsed| {
                        warn!(timeout = ?self.hydration_timeout, "hydration timed out");
                        KeyholdError::HydrationTimeout
                    })?;
                let has_vault = probe??;
                debug!(?meta, has_vault, "hydrated");
                Ok::<(), eyre::Report>(())
            })
            .await?;
        Ok(())
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated.initialized()
    }

    /// Encrypts and persists an empty vault, leaving the session unlocked.
    pub async fn create_vault(
        &self,
        password: SecretString,
        ttl: Option<Duration>,
    ) -> eyre::Result<()> {
        let ttl = self.resolve_ttl(ttl)?;
        self.hydrate().await?;
        if self.vault.has_ciphertext()? {
            return Err(KeyholdError::VaultAlreadyInitialized.into());
        }
        self.retire_session();
        let adapter = self.kdf.adapter_for(password).await?;
        self.vault.initialize(adapter).await?;
        let armed = self.arm(&mut self.slot(), ttl);
        if let Err(e) = armed {
            self.force_lock();
            return Err(e);
        }
        info!(ttl_secs = ttl.as_secs(), "vault created; session unlocked");
        Ok(())
    }

    /// Derives the key, unlocks the vault, backfills the main account, then arms the timer.
    ///
    /// Any failure leaves the session Locked, including when it was Unlocked before. A live
    /// session's timer is cancelled before the vault is reopened so it cannot fire mid-unlock.
    pub async fn unlock(&self, password: SecretString, ttl: Option<Duration>) -> eyre::Result<()> {
        let ttl = self.resolve_ttl(ttl)?;
        self.hydrate().await?;
        self.retire_session();
        if let Err(e) = self.open_vault(password).await {
            self.force_lock();
            warn!(code = %ErrorReport::from_report(&e).code, "unlock failed");
            return Err(e);
        }

        self.backfill_main_account().await;
        let armed = self.arm(&mut self.slot(), ttl);
        if let Err(e) = armed {
            self.force_lock();
            return Err(e);
        }
        info!(ttl_secs = ttl.as_secs(), "session unlocked");
        Ok(())
    }

    async fn open_vault(&self, password: SecretString) -> eyre::Result<()> {
        if !self.vault.has_ciphertext()? {
            return Err(KeyholdError::VaultNotInitialized.into());
        }
        let adapter = self.kdf.adapter_for(password).await?;
        self.vault.unlock(adapter)
    }

    /// Resets the auto-lock window. Returns `false`, touching nothing, when not unlocked.
    pub fn extend(&self, ttl: Option<Duration>) -> bool {
        let Ok(ttl) = self.resolve_ttl(ttl) else {
            warn!(?ttl, "extend: ttl out of range");
            return false;
        };
        let mut slot = self.slot();
        if !self.unlocked_in(slot.as_ref()) {
            return false;
        }
        if self.arm(&mut slot, ttl).is_err() {
            return false;
        }
        debug!(ttl_secs = ttl.as_secs(), "session extended");
        true
    }

    /// Cancels the timer and locks the vault. Safe to call when already locked.
    pub fn lock(&self) {
        let had_session = self.force_lock();
        if had_session {
            info!(reason = "manual", "session locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked_in(self.slot().as_ref())
    }

    /// Fails with `StoreLocked` unless a session is live.
    pub fn require_unlocked(&self) -> eyre::Result<()> {
        if self.is_unlocked() {
            Ok(())
        } else {
            Err(KeyholdError::StoreLocked.into())
        }
    }

    pub fn has_pending_timer(&self) -> bool {
        self.slot().as_ref().is_some_and(|s| s.timer.is_pending())
    }

    /// Time left in the current session, if one is live.
    pub fn remaining(&self) -> Option<Duration> {
        let slot = self.slot();
        if !self.unlocked_in(slot.as_ref()) {
            return None;
        }
        slot.as_ref()
            .map(|s| s.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Points the main account at the vault's first account when none is set yet.
    pub async fn backfill_main_account(&self) {
        if self.meta.get_state().main_account.is_some() {
            return;
        }
        let Some(first) = self.vault.get_state().first_account_ref() else {
            return;
        };
        info!(public_key = %first.public_key, "designated main account");
        self.meta.update(|m| m.main_account = Some(first));
        if let Err(e) = self.meta.flush().await {
            warn!(error = %e, "persisting main account failed");
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlocked_in(&self, session: Option<&Session>) -> bool {
        !self.vault.is_locked() && session.is_some_and(|s| Instant::now() < s.expires_at)
    }

    fn resolve_ttl(&self, ttl: Option<Duration>) -> eyre::Result<Duration> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if ttl > MAX_SESSION_TTL {
            return Err(KeyholdError::SessionTtlTooLong {
                max_secs: MAX_SESSION_TTL.as_secs(),
            }
            .into());
        }
        Ok(ttl)
    }

    /// Replaces any session with a fresh one. Leaves `slot` untouched on error.
    fn arm(&self, slot: &mut Option<Session>, ttl: Duration) -> eyre::Result<()> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or(KeyholdError::SessionTtlTooLong {
                max_secs: MAX_SESSION_TTL.as_secs(),
            })?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut timer = slot.take().map(|s| s.timer).unwrap_or_default();
        let session = Arc::clone(&self.session);
        let vault = Arc::clone(&self.vault);
        timer.schedule(ttl, move || expire(&session, &*vault, epoch));
        *slot = Some(Session {
            expires_at,
            epoch,
            timer,
        });
        Ok(())
    }

    /// Drops the current session (cancelling its timer) without locking the vault.
    fn retire_session(&self) {
        let retired = self.slot().take();
        if let Some(mut s) = retired {
            s.timer.cancel();
        }
    }

    fn force_lock(&self) -> bool {
        let mut slot = self.slot();
        let had_session = slot.take().is_some();
        self.vault.lock();
        had_session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        derivation::KeyDerivationEngine,
        errors::kind,
        keystore::crypto::KdfParams,
        storage::{MemoryStorage, VAULT_KEY},
    };
    use std::sync::atomic::AtomicUsize;

    fn pw(s: &str) -> SecretString {
        SecretString::new(s.to_owned().into())
    }

    fn manager(storage: &Arc<dyn KvStorage>) -> SessionManager {
        let vault = Arc::new(EncryptedStore::new(Arc::clone(storage)));
        let kdf = PasswordKeyDerivation::new(Arc::clone(storage), KdfParams { iterations: 1_000 });
        SessionManager::new(vault, kdf, Arc::clone(storage))
    }

    #[derive(Debug, Default)]
    struct SlowStorage {
        inner: MemoryStorage,
        delay_ms: AtomicU64,
        meta_write_delay_ms: AtomicU64,
        meta_reads: AtomicUsize,
    }

    impl KvStorage for SlowStorage {
        fn get(&self, key: &str) -> eyre::Result<Option<String>> {
            if key == META_KEY {
                self.meta_reads.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> eyre::Result<()> {
            if key == META_KEY {
                let ms = self.meta_write_delay_ms.load(Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(ms));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> eyre::Result<()> {
            self.inner.remove(key)
        }
    }

    #[tokio::test]
    async fn extend_while_locked_is_a_no_op() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage);
        assert!(!m.extend(None), "extend must refuse while locked");
        assert!(!m.has_pending_timer(), "no timer may be created");
        assert!(!m.is_unlocked(), "still locked");
        Ok(())
    }

    #[tokio::test]
    async fn unlock_without_vault_is_reported() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage);
        let err = m
            .unlock(pw("pw"), None)
            .await
            .err()
            .ok_or_else(|| eyre::eyre!("unlocked nothing"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::VaultNotInitialized));
        Ok(())
    }

    #[tokio::test]
    async fn create_unlock_lock_cycle() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage);
        m.create_vault(pw("correct horse"), None).await?;
        assert!(m.is_unlocked(), "create leaves the session open");
        assert!(m.has_pending_timer(), "auto-lock armed");

        m.lock();
        assert!(!m.is_unlocked(), "lock closes the session");
        assert!(!m.has_pending_timer(), "lock cancels the timer");
        m.lock();
        assert!(!m.is_unlocked(), "second lock is harmless");

        let err = m
            .unlock(pw("wrong"), None)
            .await
            .err()
            .ok_or_else(|| eyre::eyre!("wrong password accepted"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::AuthenticationFailure));
        assert_eq!(ErrorReport::from_report(&err).message, "unlock failed");
        assert!(!m.is_unlocked(), "failed unlock stays locked");
        assert!(!m.has_pending_timer(), "failed unlock arms nothing");

        m.unlock(pw("correct horse"), None).await?;
        assert!(m.is_unlocked(), "right password unlocks");
        Ok(())
    }

    #[tokio::test]
    async fn failed_reentry_locks_a_live_session() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage);
        m.create_vault(pw("pw"), None).await?;
        assert!(m.unlock(pw("nope"), None).await.is_err(), "wrong password");
        assert!(!m.is_unlocked(), "session closed");
        assert!(!m.has_pending_timer(), "timer cancelled");
        Ok(())
    }

    #[tokio::test]
    async fn timer_locks_after_ttl() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage);
        m.create_vault(pw("pw"), None).await?;
        m.lock();

        m.unlock(pw("pw"), Some(Duration::from_millis(150))).await?;
        assert!(m.is_unlocked(), "open right after unlock");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!m.is_unlocked(), "ttl elapsed");
        assert!(m.vault().is_locked(), "timer locked the vault");
        assert!(!m.has_pending_timer(), "fired timer is gone");
        Ok(())
    }

    #[tokio::test]
    async fn extend_resets_the_window() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage);
        m.create_vault(pw("pw"), Some(Duration::from_millis(200))).await?;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(m.extend(Some(Duration::from_millis(400))), "extend while unlocked");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(m.is_unlocked(), "old timer must not fire after extend");
        assert!(m.remaining().is_some(), "remaining time reported");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!m.is_unlocked(), "extended window elapsed");
        Ok(())
    }

    #[tokio::test]
    async fn unlock_backfills_main_account_once() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage);
        m.create_vault(pw("pw"), None).await?;
        m.vault().mutate(|v| v.add_imported_wallet("imp", &[5_u8; 32]))?;
        m.vault().flush().await?;
        assert_eq!(m.main_account(), None);
        m.lock();

        m.unlock(pw("pw"), None).await?;
        let main = m.main_account().ok_or_else(|| eyre::eyre!("no backfill"))?;
        assert_eq!(main.index, 0);

        m.vault().mutate(|v| {
            v.add_mnemonic_wallet(
                &KeyDerivationEngine::default(),
                "second",
                "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
            )
        })?;
        m.lock();
        m.unlock(pw("pw"), None).await?;
        assert_eq!(m.main_account(), Some(main), "backfill is not repeated");
        assert!(storage.get(META_KEY)?.is_some(), "main account persisted");
        Ok(())
    }

    #[tokio::test]
    async fn hydration_timeout_surfaces_and_can_be_retried() -> eyre::Result<()> {
        let slow = Arc::new(SlowStorage::default());
        slow.delay_ms.store(300, Ordering::SeqCst);
        let storage: Arc<dyn KvStorage> = Arc::clone(&slow) as Arc<dyn KvStorage>;
        let m = manager(&storage).with_hydration_timeout(Duration::from_millis(50));

        let err = m.hydrate().await.err().ok_or_else(|| eyre::eyre!("no timeout"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::HydrationTimeout));
        assert!(!m.is_hydrated(), "timeout leaves hydration incomplete");

        slow.delay_ms.store(0, Ordering::SeqCst);
        m.hydrate().await?;
        assert!(m.is_hydrated(), "retry completes");
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_hydrate_calls_share_one_load() -> eyre::Result<()> {
        let slow = Arc::new(SlowStorage::default());
        slow.delay_ms.store(30, Ordering::SeqCst);
        let storage: Arc<dyn KvStorage> = Arc::clone(&slow) as Arc<dyn KvStorage>;
        let m = manager(&storage);

        let (a, b) = tokio::join!(m.hydrate(), m.hydrate());
        a?;
        b?;
        m.hydrate().await?;
        assert_eq!(slow.meta_reads.load(Ordering::SeqCst), 1, "one load for all callers");
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_meta_degrades_to_fallback() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        storage.set(META_KEY, "not json at all {")?;
        let m = manager(&storage);
        m.hydrate().await?;
        assert_eq!(m.main_account(), None);
        Ok(())
    }

    #[tokio::test]
    async fn create_twice_is_rejected() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage);
        m.create_vault(pw("pw"), None).await?;
        let before = storage.get(VAULT_KEY)?;
        let err = m
            .create_vault(pw("other"), None)
            .await
            .err()
            .ok_or_else(|| eyre::eyre!("re-created"))?;
        assert_eq!(kind(&err), Some(&KeyholdError::VaultAlreadyInitialized));
        assert_eq!(storage.get(VAULT_KEY)?, before, "existing vault untouched");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reunlock_outlives_the_previous_sessions_timer() -> eyre::Result<()> {
        let slow = Arc::new(SlowStorage::default());
        slow.meta_write_delay_ms.store(500, Ordering::SeqCst);
        let storage: Arc<dyn KvStorage> = Arc::clone(&slow) as Arc<dyn KvStorage>;
        let m = manager(&storage);

        m.create_vault(pw("pw"), Some(Duration::from_millis(250))).await?;
        m.vault().mutate(|v| v.add_imported_wallet("imp", &[6_u8; 32]))?;
        m.vault().flush().await?;

        // The main-account write keeps unlock busy well past the first session's deadline.
        m.unlock(pw("pw"), Some(Duration::from_secs(60))).await?;
        assert!(m.is_unlocked(), "unlock returned Ok, so the session must be open");
        assert!(!m.vault().is_locked(), "old timer must not lock the new session");
        assert!(m.has_pending_timer(), "new timer armed");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(m.is_unlocked(), "still open after the old deadline");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_ttl_is_rejected_before_unlocking() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage);
        m.create_vault(pw("pw"), None).await?;
        m.lock();

        let err = m
            .unlock(pw("pw"), Some(Duration::from_secs(u64::MAX)))
            .await
            .err()
            .ok_or_else(|| eyre::eyre!("oversized ttl accepted"))?;
        assert_eq!(
            kind(&err),
            Some(&KeyholdError::SessionTtlTooLong {
                max_secs: MAX_SESSION_TTL.as_secs()
            })
        );
        assert!(m.vault().is_locked(), "vault never opened");
        assert!(!m.has_pending_timer(), "no timer");

        m.unlock(pw("pw"), Some(MAX_SESSION_TTL)).await?;
        assert!(m.is_unlocked(), "the maximum itself is allowed");
        assert!(!m.extend(Some(Duration::MAX)), "oversized extend refused");
        assert!(m.is_unlocked(), "refused extend leaves the session alone");
        Ok(())
    }

    #[tokio::test]
    async fn default_ttl_is_clamped() -> eyre::Result<()> {
        let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::new());
        let m = manager(&storage).with_default_ttl(Duration::MAX);
        assert_eq!(m.default_ttl(), MAX_SESSION_TTL);
        m.create_vault(pw("pw"), None).await?;
        assert!(m.is_unlocked(), "clamped default arms normally");
        Ok(())
    }

    #[test]
    fn timer_outside_runtime_is_inert() {
        let mut t = CancellableTimer::default();
        t.schedule(Duration::from_millis(1), || {});
        assert!(!t.is_pending(), "nothing scheduled without a runtime");
        assert!(!t.cancel(), "nothing to cancel");
    }
}
