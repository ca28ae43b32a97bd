//! Resident model set
//!
//! One cache service per process, passed to whoever needs models. Each slot
//! holds at most one model. Loads of a slot are serialised by a per-slot
//! lock, so concurrent callers asking for the same model wait for the one
//! in-flight load and share its result. Replacing a slot's model releases
//! the old one before the new one loads.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::ModelLoadError;
use crate::modules::memory::Evict;

/// Number of adapter slots
pub const ADAPTER_SLOTS: usize = 3;

/// Key of a resident model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelSlot {
    TextEncoder,
    VisionEncoder,
    Vae,
    PreviewDecoder,
    Diffusion,
    /// Adapter slot `0..ADAPTER_SLOTS`
    Adapter(usize),
}

impl fmt::Display for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSlot::TextEncoder => write!(f, "text_encoder"),
            ModelSlot::VisionEncoder => write!(f, "clip_vision"),
            ModelSlot::Vae => write!(f, "vae"),
            ModelSlot::PreviewDecoder => write!(f, "taehv"),
            ModelSlot::Diffusion => write!(f, "diffusion_model"),
            ModelSlot::Adapter(i) => write!(f, "lora_{}", i + 1),
        }
    }
}

/// A freshly loaded model and the device memory it holds
pub struct Loaded<T> {
    pub value: T,
    pub size_bytes: u64,
}

impl<T> Loaded<T> {
    pub fn new(value: T, size_bytes: u64) -> Self {
        Self { value, size_bytes }
    }
}

struct Entry {
    identity: String,
    value: Arc<dyn Any + Send + Sync>,
    size_bytes: u64,
    last_used: u64,
    pinned: bool,
}

type Slot = Arc<Mutex<Option<Entry>>>;

/// Process-wide cache of loaded models
#[derive(Default)]
pub struct ResidentModels {
    slots: Mutex<HashMap<ModelSlot, Slot>>,
    tick: AtomicU64,
}

impl ResidentModels {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: ModelSlot) -> Slot {
        self.slots.lock().entry(key).or_default().clone()
    }

    fn touch(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Model resident under `key` with the given identity, loading it if needed
    ///
    /// A different identity in the slot is released before `load` runs. If
    /// `load` fails the slot is left empty.
    pub fn get_or_load<T, F>(&self, key: ModelSlot, identity: &str, load: F) -> Result<Arc<T>, ModelLoadError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<Loaded<T>, ModelLoadError>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock();

        if let Some(entry) = guard.as_mut() {
            if entry.identity == identity {
                entry.last_used = self.touch();
                return entry
                    .value
                    .clone()
                    .downcast::<T>()
                    .map_err(|_| ModelLoadError::TypeMismatch(key.to_string()));
            }
        }

        if let Some(previous) = guard.take() {
            info!("Releasing {} ({}) to load {}", key, previous.identity, identity);
            drop(previous);
        }

        let loaded = load()?;
        let value = Arc::new(loaded.value);
        info!(
            "Loaded {} ({}, {:.2} GB)",
            key,
            identity,
            loaded.size_bytes as f64 / 1e9
        );
        *guard = Some(Entry {
            identity: identity.to_string(),
            value: value.clone(),
            size_bytes: loaded.size_bytes,
            last_used: self.touch(),
            pinned: false,
        });
        Ok(value)
    }

    /// Model resident under `key`, if any
    pub fn get<T: Send + Sync + 'static>(&self, key: ModelSlot) -> Option<Arc<T>> {
        let slot = self.slot(key);
        let mut guard = slot.lock();
        let entry = guard.as_mut()?;
        entry.last_used = self.touch();
        entry.value.clone().downcast::<T>().ok()
    }

    /// Identity of the model resident under `key`
    pub fn identity(&self, key: ModelSlot) -> Option<String> {
        let slot = self.slot(key);
        let guard = slot.lock();
        guard.as_ref().map(|entry| entry.identity.clone())
    }

    pub fn contains(&self, key: ModelSlot) -> bool {
        self.identity(key).is_some()
    }

    /// Exclude `key` from eviction under memory pressure
    pub fn set_pinned(&self, key: ModelSlot, pinned: bool) {
        let slot = self.slot(key);
        let mut guard = slot.lock();
        if let Some(entry) = guard.as_mut() {
            entry.pinned = pinned;
        }
    }

    /// Pin `key` until the returned guard is dropped
    pub fn pin(&self, key: ModelSlot) -> Pinned<'_> {
        self.set_pinned(key, true);
        Pinned { models: self, key }
    }

    /// Release the model under `key`
    pub fn release(&self, key: ModelSlot) -> Option<u64> {
        let slot = self.slot(key);
        let previous = slot.lock().take()?;
        info!("Released {} ({})", key, previous.identity);
        Some(previous.size_bytes)
    }

    /// Release every resident model, pinned or not
    pub fn unload_all(&self) -> u64 {
        let slots: Vec<(ModelSlot, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(key, slot)| (*key, slot.clone()))
            .collect();
        let mut freed = 0;
        for (key, slot) in slots {
            if let Some(entry) = slot.lock().take() {
                debug!("Unloading {} ({})", key, entry.identity);
                freed += entry.size_bytes;
            }
        }
        info!("Unloaded all models, {:.2} GB released", freed as f64 / 1e9);
        freed
    }

    /// Device bytes held by resident models
    pub fn resident_bytes(&self) -> u64 {
        let slots: Vec<Slot> = self.slots.lock().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| slot.lock().as_ref().map(|entry| entry.size_bytes))
            .sum()
    }

    pub fn resident_slots(&self) -> Vec<ModelSlot> {
        let slots: Vec<(ModelSlot, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(key, slot)| (*key, slot.clone()))
            .collect();
        let mut keys: Vec<ModelSlot> = slots
            .into_iter()
            .filter(|(_, slot)| slot.lock().is_some())
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys
    }
}

/// Scoped pin from [`ResidentModels::pin`]
pub struct Pinned<'a> {
    models: &'a ResidentModels,
    key: ModelSlot,
}

impl Drop for Pinned<'_> {
    fn drop(&mut self) {
        self.models.set_pinned(self.key, false);
    }
}

impl Evict for ResidentModels {
    /// Slots busy with a load are skipped rather than waited on
    fn evict_one(&self) -> Option<u64> {
        let slots: Vec<(ModelSlot, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(key, slot)| (*key, slot.clone()))
            .collect();

        let (key, slot, tick) = slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let tick = {
                    let guard = slot.try_lock()?;
                    let entry = guard.as_ref()?;
                    if entry.pinned {
                        return None;
                    }
                    entry.last_used
                };
                Some((key, slot, tick))
            })
            .min_by_key(|(_, _, tick)| *tick)?;

        let mut guard = slot.try_lock()?;
        if guard.as_ref().map(|entry| entry.last_used) != Some(tick) {
            return None;
        }
        let entry = guard.take()?;
        info!(
            "Evicted {} ({}), {:.2} GB released",
            key,
            entry.identity,
            entry.size_bytes as f64 / 1e9
        );
        Some(entry.size_bytes)
    }
}
