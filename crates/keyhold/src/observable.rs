//! In-memory state containers that persist themselves into a [`KvStorage`].
//!
//! `update` is synchronous for the caller and schedules a best-effort background write;
//! `flush` writes before returning for callers that need durability. When several writes
//! race, the newest committed state wins.

use crate::storage::KvStorage;
use eyre::Context as _;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Serialization hooks for a store.
pub trait StoreCodec<S>: Send + Sync + 'static {
    fn serialize(&self, state: &S) -> eyre::Result<String>;
    fn deserialize(&self, payload: &str) -> eyre::Result<S>;
}

/// Plain JSON, the default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<S: Serialize + DeserializeOwned> StoreCodec<S> for JsonCodec {
    fn serialize(&self, state: &S) -> eyre::Result<String> {
        serde_json::to_string(state).context("serialize store state")
    }

    fn deserialize(&self, payload: &str) -> eyre::Result<S> {
        serde_json::from_str(payload).context("parse store state")
    }
}

/// Shapes a stored value may have on disk.
///
/// Older writers stored the state object directly, sometimes wrapped as `{"state": ..}`;
/// current writers store the codec's string, which may itself have been JSON-quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedShape {
    Unversioned(serde_json::Value),
    V1(String),
}

impl PersistedShape {
    /// The single place legacy shapes are recognised; runs once per hydration.
    pub fn migrate(raw: &str) -> Self {
        let Ok(v) = serde_json::from_str::<serde_json::Value>(raw) else {
            return Self::V1(raw.to_owned());
        };
        let v = match v {
            serde_json::Value::Object(mut m) if m.len() == 1 && m.contains_key("state") => {
                m.remove("state").unwrap_or(serde_json::Value::Null)
            }
            other => other,
        };
        match v {
            serde_json::Value::String(s) => Self::V1(s),
            other => Self::Unversioned(other),
        }
    }

    /// Leading tag of the stored payload (`v1` for current envelopes). Never decodes.
    pub fn version_tag(&self) -> String {
        match self {
            Self::Unversioned(_) => "unversioned".to_owned(),
            Self::V1(s) => s.split(':').next().unwrap_or_default().to_owned(),
        }
    }

    /// The string handed to [`StoreCodec::deserialize`].
    pub fn into_payload(self) -> String {
        match self {
            Self::Unversioned(v) => v.to_string(),
            Self::V1(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrateOutcome {
    Loaded,
    Missing,
    /// Storage or decoding failed; the fallback state was kept.
    Fallback,
}

struct Inner<S, C> {
    key: String,
    fallback: S,
    state: watch::Sender<S>,
    storage: Arc<dyn KvStorage>,
    codec: C,
    persisting: AtomicBool,
    generation: AtomicU64,
    written: Mutex<u64>,
}

/// Cheap to clone; clones share one state.
pub struct ObservableStore<S, C = JsonCodec> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for ObservableStore<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, C> std::fmt::Debug for ObservableStore<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableStore")
            .field("key", &self.inner.key)
            .field("persisting", &self.inner.persisting.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<S, C> ObservableStore<S, C>
where
    S: Clone + Send + Sync + 'static,
    C: StoreCodec<S>,
{
    /// A store with its persistence subscription active.
    pub fn new(key: &str, fallback: S, storage: Arc<dyn KvStorage>, codec: C) -> Self {
        Self::with_persistence(key, fallback, storage, codec, true)
    }

    pub(crate) fn with_persistence(
        key: &str,
        fallback: S,
        storage: Arc<dyn KvStorage>,
        codec: C,
        persisting: bool,
    ) -> Self {
        let (state, _rx) = watch::channel(fallback.clone());
        Self {
            inner: Arc::new(Inner {
                key: key.to_owned(),
                fallback,
                state,
                storage,
                codec,
                persisting: AtomicBool::new(persisting),
                generation: AtomicU64::new(0),
                written: Mutex::new(0),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn fallback(&self) -> &S {
        &self.inner.fallback
    }

    pub(crate) fn storage(&self) -> &Arc<dyn KvStorage> {
        &self.inner.storage
    }

    pub(crate) fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn get_state(&self) -> S {
        self.inner.state.borrow().clone()
    }

    /// Observers see every committed state, including resets.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.inner.state.subscribe()
    }

    pub fn is_persisting(&self) -> bool {
        self.inner.persisting.load(Ordering::SeqCst)
    }

    pub(crate) fn set_persisting(&self, on: bool) {
        self.inner.persisting.store(on, Ordering::SeqCst);
    }

    /// Replaces the state without scheduling a write.
    pub(crate) fn replace_state(&self, state: S) {
        self.inner.state.send_replace(state);
    }

    pub(crate) fn reset_to_fallback(&self) {
        self.replace_state(self.inner.fallback.clone());
    }

    /// Applies `reducer` in memory, then schedules a best-effort write.
    pub fn update(&self, reducer: impl FnOnce(&mut S)) {
        self.inner.state.send_modify(reducer);
        self.schedule_persist();
    }

    /// Like [`Self::update`], but `f` runs against a draft that is only committed on `Ok`.
    pub fn try_update<R>(&self, f: impl FnOnce(&mut S) -> eyre::Result<R>) -> eyre::Result<R> {
        let mut outcome = None;
        let committed = self.inner.state.send_if_modified(|s| {
            let mut draft = s.clone();
            match f(&mut draft) {
                Ok(r) => {
                    *s = draft;
                    outcome = Some(Ok(r));
                    true
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    false
                }
            }
        });
        if committed {
            self.schedule_persist();
        }
        outcome.unwrap_or_else(|| Err(eyre::eyre!("store update did not run")))
    }

    fn schedule_persist(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.is_persisting() {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(key = %self.inner.key, "no async runtime; write deferred until flush");
            return;
        };
        let this = self.clone();
        handle.spawn(async move {
            if let Err(e) = this.write_if_stale(generation).await {
                warn!(key = %this.inner.key, error = %e, "background persist failed");
            }
        });
    }

    async fn write_if_stale(&self, generation: u64) -> eyre::Result<()> {
        let mut written = self.inner.written.lock().await;
        if *written >= generation || !self.is_persisting() {
            return Ok(());
        }
        *written = self.write_current().await?;
        Ok(())
    }

    /// Encodes and writes on the blocking pool; the codec may encrypt and storage may fsync.
    async fn write_current(&self) -> eyre::Result<u64> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let generation = this.inner.generation.load(Ordering::SeqCst);
            let snapshot = this.get_state();
            let payload = this.inner.codec.serialize(&snapshot)?;
            this.inner
                .storage
                .set(&this.inner.key, &payload)
                .with_context(|| format!("persist {}", this.inner.key))?;
            Ok::<u64, eyre::Report>(generation)
        })
        .await
        .with_context(|| format!("persist task for {}", self.inner.key))?
    }

    /// Serializes and writes the current state before returning.
    pub async fn flush(&self) -> eyre::Result<()> {
        let mut written = self.inner.written.lock().await;
        *written = self.write_current().await?;
        Ok(())
    }

    /// Loads state from storage. Failures are logged and leave the current state in place.
    pub async fn hydrate_from_storage(&self) -> HydrateOutcome {
        let storage = Arc::clone(&self.inner.storage);
        let key = self.inner.key.clone();
        let raw = match tokio::task::spawn_blocking(move || storage.get(&key)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return HydrateOutcome::Missing,
            Ok(Err(e)) => {
                warn!(key = %self.inner.key, error = %e, "hydrate: storage read failed; keeping fallback");
                return HydrateOutcome::Fallback;
            }
            Err(e) => {
                warn!(key = %self.inner.key, error = %e, "hydrate: read task failed; keeping fallback");
                return HydrateOutcome::Fallback;
            }
        };

        let payload = PersistedShape::migrate(&raw).into_payload();
        match self.inner.codec.deserialize(&payload) {
            Ok(state) => {
                self.replace_state(state);
                HydrateOutcome::Loaded
            }
            Err(e) => {
                warn!(key = %self.inner.key, error = %e, "hydrate: undecodable value; keeping fallback");
                HydrateOutcome::Fallback
            }
        }
    }
}
