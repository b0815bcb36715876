//! Cache of objects fetched from or stored on the device.
//!
//! The catalog itself never talks to the device. [`Session::catalog`]
//! wraps it in a [`CatalogHandle`] that fills misses with DIR + DUMP and
//! caches what `put` writes once the device acknowledges it.
//!
//! [`Session::catalog`]: crate::Session::catalog

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{JsonCodec, MsgPackCodec};
use crate::error::{K2Error, Result};
use crate::message::ObjectKind;
use crate::session::Session;

/// One cached object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub kind: ObjectKind,
    pub slot: u16,
    pub name: String,
    pub in_ram: bool,
    pub data: Bytes,
}

impl ObjectEntry {
    pub fn new(kind: ObjectKind, slot: u16, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            slot,
            name: name.into(),
            in_ram: true,
            data: data.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// In-memory object cache, shared between the read loop and callers.
#[derive(Debug, Default)]
pub struct ObjectCatalog {
    entries: RwLock<HashMap<(ObjectKind, u16), Arc<ObjectEntry>>>,
    /// Bumped under the write lock whenever entries are dropped or replaced.
    generation: AtomicU64,
}

impl ObjectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entry, without asking the device.
    pub fn cached(&self, kind: ObjectKind, slot: u16) -> Option<Arc<ObjectEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, slot))
            .cloned()
    }

    /// Cache an entry, replacing any previous one for its slot.
    pub fn insert(&self, entry: ObjectEntry) -> Arc<ObjectEntry> {
        let entry = Arc::new(entry);
        debug!(
            "Caching {} {} ({} bytes)",
            entry.kind,
            entry.slot,
            entry.size()
        );
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((entry.kind, entry.slot), entry.clone());
        entry
    }

    /// Current generation. A fetch started at this generation may only be
    /// cached through [`insert_if_current`](Self::insert_if_current).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Cache an entry unless anything was invalidated since `generation`.
    /// The entry is returned either way.
    pub fn insert_if_current(&self, entry: ObjectEntry, generation: u64) -> Arc<ObjectEntry> {
        let entry = Arc::new(entry);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) == generation {
            debug!("Caching {} {} ({} bytes)", entry.kind, entry.slot, entry.size());
            entries.insert((entry.kind, entry.slot), entry.clone());
        } else {
            debug!(
                "Not caching {} {}: catalog changed during the fetch",
                entry.kind, entry.slot
            );
        }
        entry
    }

    /// Drop one cached entry. Returns whether there was one.
    pub fn invalidate(&self, kind: ObjectKind, slot: u16) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.remove(&(kind, slot)).is_some()
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every object type the device stores.
    pub fn kinds(&self) -> &'static [ObjectKind] {
        &ObjectKind::ALL
    }

    /// Slot numbers valid for `kind`.
    pub fn slots_for(&self, kind: ObjectKind) -> RangeInclusive<u16> {
        kind.slots()
    }

    /// Copy of every cached entry, ordered by type and slot.
    pub fn snapshot(&self) -> CatalogSnapshot {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut objects: Vec<SnapshotEntry> = entries
            .values()
            .map(|entry| SnapshotEntry {
                kind: entry.kind,
                slot: entry.slot,
                name: entry.name.clone(),
                in_ram: entry.in_ram,
                data: entry.data.to_vec(),
            })
            .collect();
        objects.sort_by_key(|entry| (entry.kind, entry.slot));
        CatalogSnapshot {
            version: CatalogSnapshot::VERSION,
            objects,
        }
    }

    /// Replace the cache with a snapshot's contents.
    pub fn restore(&self, snapshot: &CatalogSnapshot) -> Result<()> {
        snapshot.check_version()?;
        let restored: HashMap<_, _> = snapshot
            .objects
            .iter()
            .map(|entry| {
                let object = ObjectEntry {
                    kind: entry.kind,
                    slot: entry.slot,
                    name: entry.name.clone(),
                    in_ram: entry.in_ram,
                    data: Bytes::from(entry.data.clone()),
                };
                ((entry.kind, entry.slot), Arc::new(object))
            })
            .collect();
        debug!("Restored {} catalog entries", restored.len());
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        *entries = restored;
        Ok(())
    }
}

/// The catalog of one session: cache hits are answered locally, misses
/// are fetched from the device.
pub struct CatalogHandle<'a> {
    session: &'a Session,
    catalog: &'a ObjectCatalog,
}

impl<'a> CatalogHandle<'a> {
    pub(crate) fn new(session: &'a Session, catalog: &'a ObjectCatalog) -> Self {
        Self { session, catalog }
    }

    /// Cached entry, or DIR + DUMP from the device. `None` when the slot is
    /// empty. A fetch that overlaps an invalidation is returned but not
    /// cached.
    pub async fn get(&self, kind: ObjectKind, slot: u16) -> Result<Option<Arc<ObjectEntry>>> {
        kind.check_slot(slot)?;
        if let Some(entry) = self.catalog.cached(kind, slot) {
            debug!("Catalog hit for {} {}", kind, slot);
            return Ok(Some(entry));
        }
        let generation = self.catalog.generation();
        Ok(self
            .session
            .dump(kind, slot)
            .await?
            .map(|entry| self.catalog.insert_if_current(entry, generation)))
    }

    /// Write an object to the device and cache it once acknowledged.
    /// Slot 0 lets the device pick.
    pub async fn put(
        &self,
        kind: ObjectKind,
        slot: u16,
        name: &str,
        data: impl Into<Bytes>,
    ) -> Result<Arc<ObjectEntry>> {
        let data = data.into();
        let written = self
            .session
            .write_object(kind, slot, name, data.clone())
            .await?;
        Ok(self
            .catalog
            .insert(ObjectEntry::new(kind, written, name, data)))
    }

    pub fn cached(&self, kind: ObjectKind, slot: u16) -> Option<Arc<ObjectEntry>> {
        self.catalog.cached(kind, slot)
    }

    pub fn invalidate(&self, kind: ObjectKind, slot: u16) -> bool {
        self.catalog.invalidate(kind, slot)
    }

    pub fn invalidate_all(&self) {
        self.catalog.invalidate_all()
    }

    pub fn kinds(&self) -> &'static [ObjectKind] {
        self.catalog.kinds()
    }

    pub fn slots_for(&self, kind: ObjectKind) -> RangeInclusive<u16> {
        self.catalog.slots_for(kind)
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        self.catalog.snapshot()
    }

    pub fn restore(&self, snapshot: &CatalogSnapshot) -> Result<()> {
        self.catalog.restore(snapshot)
    }
}

/// Serializable form of a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub version: u32,
    pub objects: Vec<SnapshotEntry>,
}

/// One object in a [`CatalogSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub kind: ObjectKind,
    pub slot: u16,
    pub name: String,
    pub in_ram: bool,
    pub data: Vec<u8>,
}

impl CatalogSnapshot {
    pub const VERSION: u32 = 1;

    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self = MsgPackCodec::decode(bytes)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String> {
        JsonCodec::encode(self)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let snapshot: Self = JsonCodec::decode(text)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    fn check_version(&self) -> Result<()> {
        if self.version != Self::VERSION {
            return Err(K2Error::Validation(format!(
                "Unsupported catalog snapshot version {} (expected {})",
                self.version,
                Self::VERSION
            )));
        }
        Ok(())
    }
}
