//! Loaded collections: descriptor, searchable index and storage backend in
//! one map, so the three can never drift apart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use akidb_core::{
    CollectionDescriptor, CollectionId, CoreError, CoreResult, Tier, VectorDocument, VectorIndex,
};
use akidb_storage::{PreparedTransition, StorageBackend, TierMaterializer, TierTransition};

/// One loaded collection.
pub struct CollectionEntry {
    pub descriptor: CollectionDescriptor,
    /// Populated only while the collection is Hot
    pub index: Arc<dyn VectorIndex>,
    pub backend: Arc<StorageBackend>,
    /// Writers hold it shared across the index and storage writes; a tier
    /// commit holds it exclusively so the index matches the tier it lands in.
    pub(crate) write_gate: tokio::sync::RwLock<()>,
}

impl CollectionEntry {
    pub fn new(
        descriptor: CollectionDescriptor,
        index: Arc<dyn VectorIndex>,
        backend: Arc<StorageBackend>,
    ) -> Self {
        Self {
            descriptor,
            index,
            backend,
            write_gate: tokio::sync::RwLock::new(()),
        }
    }

    pub fn collection_id(&self) -> CollectionId {
        self.descriptor.collection_id
    }

    /// Reloads the index from every live document of the backend.
    ///
    /// Documents whose dimension does not match the collection are skipped
    /// and logged. Returns the number of indexed documents.
    pub(crate) async fn rebuild_index(&self) -> CoreResult<usize> {
        let dimension = self.descriptor.dimension as usize;
        let (valid, invalid): (Vec<VectorDocument>, Vec<VectorDocument>) = self
            .backend
            .all_documents()
            .await?
            .into_iter()
            .partition(|doc| doc.vector.len() == dimension);

        for doc in &invalid {
            tracing::error!(
                collection_id = %self.collection_id(),
                doc_id = %doc.doc_id,
                expected = dimension,
                actual = doc.vector.len(),
                "Skipping document with mismatched dimension during index rebuild"
            );
        }

        let indexed = valid.len();
        self.index.clear().await?;
        self.index.insert_batch(valid).await?;
        Ok(indexed)
    }
}

enum Slot {
    /// Reserved by a load that is still opening the backend
    Loading { name: String },
    Loaded(Arc<CollectionEntry>),
}

impl Slot {
    fn name(&self) -> &str {
        match self {
            Slot::Loading { name } => name,
            Slot::Loaded(entry) => &entry.descriptor.name,
        }
    }

    fn loaded(&self) -> Option<&Arc<CollectionEntry>> {
        match self {
            Slot::Loaded(entry) => Some(entry),
            Slot::Loading { .. } => None,
        }
    }
}

/// Loaded collections by id.
///
/// A load first [reserves](Self::reserve) the id and name, so a second load
/// of the same collection fails before it opens any file.
#[derive(Default)]
pub struct CollectionRegistry {
    slots: RwLock<HashMap<CollectionId, Slot>>,
}

/// Claim on a collection id and name held while the collection loads.
///
/// Dropping it without [`LoadReservation::fulfil`] releases the claim.
pub struct LoadReservation<'a> {
    registry: &'a CollectionRegistry,
    collection_id: CollectionId,
    fulfilled: bool,
}

impl LoadReservation<'_> {
    /// Publishes the loaded entry under the reserved id.
    ///
    /// # Errors
    ///
    /// `CoreError::InvalidState` if the reservation was dropped from the
    /// registry meanwhile (the registry was drained by a shutdown), or the
    /// entry has another id.
    pub fn fulfil(mut self, entry: Arc<CollectionEntry>) -> CoreResult<()> {
        if entry.collection_id() != self.collection_id {
            return Err(CoreError::invalid_state(format!(
                "reservation for collection {} cannot hold collection {}",
                self.collection_id,
                entry.collection_id()
            )));
        }

        let mut slots = self.registry.slots.write();
        match slots.get_mut(&self.collection_id) {
            Some(slot) if matches!(slot, Slot::Loading { .. }) => {
                *slot = Slot::Loaded(entry);
                self.fulfilled = true;
                Ok(())
            }
            _ => Err(CoreError::invalid_state(format!(
                "collection {} is no longer reserved",
                self.collection_id
            ))),
        }
    }
}

impl Drop for LoadReservation<'_> {
    fn drop(&mut self) {
        if self.fulfilled {
            return;
        }
        let mut slots = self.registry.slots.write();
        if matches!(slots.get(&self.collection_id), Some(Slot::Loading { .. })) {
            slots.remove(&self.collection_id);
        }
    }
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, collection_id: CollectionId) -> CoreResult<Arc<CollectionEntry>> {
        self.slots
            .read()
            .get(&collection_id)
            .and_then(Slot::loaded)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Collection", collection_id.to_string()))
    }

    /// Claims `collection_id` and `name` for a load.
    ///
    /// # Errors
    ///
    /// `CoreError::AlreadyExists` if the id or the name is loaded or being
    /// loaded.
    pub fn reserve(&self, collection_id: CollectionId, name: &str) -> CoreResult<LoadReservation<'_>> {
        let mut slots = self.slots.write();
        if slots.contains_key(&collection_id) {
            return Err(CoreError::already_exists(
                "Collection",
                collection_id.to_string(),
            ));
        }
        if slots.values().any(|slot| slot.name() == name) {
            return Err(CoreError::already_exists("Collection", name));
        }
        slots.insert(
            collection_id,
            Slot::Loading {
                name: name.to_string(),
            },
        );
        Ok(LoadReservation {
            registry: self,
            collection_id,
            fulfilled: false,
        })
    }

    /// Registers an already opened entry in one step.
    ///
    /// # Errors
    ///
    /// `CoreError::AlreadyExists` if the id or the name is taken.
    pub fn insert(&self, entry: Arc<CollectionEntry>) -> CoreResult<()> {
        let name = entry.descriptor.name.clone();
        self.reserve(entry.collection_id(), &name)?.fulfil(entry)
    }

    /// Unregisters a loaded collection. In-flight loads are left alone.
    pub fn remove(&self, collection_id: CollectionId) -> Option<Arc<CollectionEntry>> {
        let mut slots = self.slots.write();
        if slots.get(&collection_id).and_then(Slot::loaded).is_none() {
            return None;
        }
        match slots.remove(&collection_id) {
            Some(Slot::Loaded(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Empties the registry, returning every loaded entry. Pending loads
    /// lose their reservation and fail to publish.
    pub fn drain(&self) -> Vec<Arc<CollectionEntry>> {
        self.slots
            .write()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Loaded(entry) => Some(entry),
                Slot::Loading { .. } => None,
            })
            .collect()
    }

    /// Whether a loaded or loading collection uses `name`.
    pub fn contains_name(&self, name: &str) -> bool {
        self.slots.read().values().any(|slot| slot.name() == name)
    }

    pub fn descriptors(&self) -> Vec<CollectionDescriptor> {
        let mut descriptors: Vec<_> = self
            .slots
            .read()
            .values()
            .filter_map(Slot::loaded)
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Loaded collections per tier: (hot, warm, cold).
    pub fn tier_counts(&self) -> (usize, usize, usize) {
        self.slots
            .read()
            .values()
            .filter_map(Slot::loaded)
            .fold((0, 0, 0), |(hot, warm, cold), entry| match entry.backend.tier() {
                Tier::Hot => (hot + 1, warm, cold),
                Tier::Warm => (hot, warm + 1, cold),
                Tier::Cold => (hot, warm, cold + 1),
            })
    }

    pub fn len(&self) -> usize {
        self.slots.read().values().filter_map(Slot::loaded).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TierMaterializer for CollectionRegistry {
    async fn prepare(
        &self,
        collection_id: CollectionId,
        transition: TierTransition,
    ) -> CoreResult<PreparedTransition> {
        self.get(collection_id)?
            .backend
            .prepare_transition(transition)
            .await
    }

    async fn commit(
        &self,
        collection_id: CollectionId,
        prepared: PreparedTransition,
    ) -> CoreResult<()> {
        let entry = self.get(collection_id)?;
        let transition = prepared.transition();

        let _gate = entry.write_gate.write().await;
        entry.backend.commit_transition(prepared).await?;

        // The tier switch is committed; index trouble from here on is logged,
        // never reported as a failed transition.
        match transition {
            TierTransition::PromoteToHot => match entry.rebuild_index().await {
                Ok(indexed) => tracing::info!(
                    collection_id = %collection_id,
                    indexed,
                    "Index rebuilt after promotion to hot"
                ),
                Err(e) => tracing::error!(
                    collection_id = %collection_id,
                    error = %e,
                    "Failed to rebuild index after promotion to hot"
                ),
            },
            TierTransition::DemoteToWarm => {
                if let Err(e) = entry.index.clear().await {
                    tracing::error!(
                        collection_id = %collection_id,
                        error = %e,
                        "Failed to clear index after demotion"
                    );
                }
            }
            TierTransition::DemoteToCold | TierTransition::PromoteToWarm => {}
        }
        Ok(())
    }

    async fn abort(&self, collection_id: CollectionId, prepared: PreparedTransition) {
        match self.get(collection_id) {
            Ok(entry) => entry.backend.abort_transition(prepared).await,
            Err(e) => tracing::warn!(
                collection_id = %collection_id,
                error = %e,
                "Collection unloaded before its transition was aborted"
            ),
        }
    }
}
