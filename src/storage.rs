use crate::interfaces::{DocumentId, StorageAdapter, StorageError, StorageId, StorageKey};
use automerge::{sync, Automerge, ChangeHash};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const SNAPSHOT: &str = "snapshot";
const INCREMENTAL: &str = "incremental";
const SYNC_STATE: &str = "sync-state";

/// How many incremental chunks may accumulate before a save compacts
/// the document into a fresh snapshot.
pub(crate) const DEFAULT_COMPACTION_THRESHOLD: usize = 32;

/// A document rebuilt from storage, together with the chunk keys that
/// produced it, for the subsystem's bookkeeping.
pub(crate) struct LoadedDoc {
    pub(crate) doc: Automerge,
    pub(crate) chunk_keys: Vec<StorageKey>,
}

/// Content-addressed persistence on top of a [`StorageAdapter`].
///
/// Every newly observed change is written under
/// `(documentId, "incremental", changeHash)`, which makes re-saving a
/// change a no-op on the adapter. Once the incremental set outgrows the
/// compaction threshold, a save writes one snapshot chunk and removes the
/// chunks it covers. Loading applies snapshot and incrementals in any
/// order.
///
/// The methods return futures for the repo's event loop to drive; local
/// bookkeeping advances through the `note_*` callbacks once a future has
/// completed.
pub(crate) struct StorageSubsystem {
    adapter: Arc<dyn StorageAdapter>,
    compaction_threshold: usize,
    docs: HashMap<DocumentId, DocStorageState>,
}

#[derive(Default)]
struct DocStorageState {
    saved_heads: Vec<ChangeHash>,
    stored_chunks: HashSet<StorageKey>,
}

impl StorageSubsystem {
    pub(crate) fn new(adapter: Arc<dyn StorageAdapter>, compaction_threshold: usize) -> Self {
        StorageSubsystem {
            adapter,
            compaction_threshold,
            docs: HashMap::new(),
        }
    }

    pub(crate) fn id(&self) -> StorageId {
        self.adapter.id()
    }

    /// Load a document by combining its snapshot and incremental chunks.
    pub(crate) fn load_doc(
        &self,
        document_id: DocumentId,
    ) -> BoxFuture<'static, Result<Option<LoadedDoc>, StorageError>> {
        let adapter = self.adapter.clone();
        async move {
            let chunks = adapter.load_range(StorageKey::from(&document_id)).await?;
            if chunks.is_empty() {
                return Ok(None);
            }
            let mut doc = Automerge::new();
            let mut chunk_keys = Vec::with_capacity(chunks.len());
            for (key, bytes) in chunks {
                // Chunks commute, so application order does not matter.
                doc.load_incremental(&bytes)
                    .map_err(|err| StorageError::Backend(err.to_string()))?;
                chunk_keys.push(key);
            }
            Ok(Some(LoadedDoc { doc, chunk_keys }))
        }
        .boxed()
    }

    /// Record the outcome of a completed [`StorageSubsystem::load_doc`].
    pub(crate) fn note_loaded(&mut self, document_id: DocumentId, loaded: &LoadedDoc) {
        let state = self.docs.entry(document_id).or_default();
        state.saved_heads = loaded.doc.get_heads();
        state.stored_chunks = loaded.chunk_keys.iter().cloned().collect();
    }

    /// Persist everything in `doc` not yet saved. Incremental by default;
    /// compacts into a snapshot once enough incrementals accumulate.
    ///
    /// Bookkeeping advances immediately: the writes are idempotent, so a
    /// failed save is retried in full by the next one.
    pub(crate) fn save_doc(
        &mut self,
        document_id: DocumentId,
        doc: &Automerge,
    ) -> Option<BoxFuture<'static, Result<(), StorageError>>> {
        let adapter = self.adapter.clone();
        let compaction_threshold = self.compaction_threshold;
        let state = self.docs.entry(document_id).or_default();
        let changes = doc.get_changes(&state.saved_heads);
        if changes.is_empty() {
            return None;
        }
        let heads = doc.get_heads();
        let incremental_count = state
            .stored_chunks
            .iter()
            .filter(|key| key.components().get(1).map(String::as_str) == Some(INCREMENTAL))
            .count();

        let doc_key = StorageKey::from(&document_id);
        if incremental_count + changes.len() <= compaction_threshold {
            let mut writes = Vec::with_capacity(changes.len());
            for change in changes {
                let key = doc_key
                    .with_component(INCREMENTAL)
                    .with_component(change.hash().to_string());
                if state.stored_chunks.insert(key.clone()) {
                    writes.push((key, change.raw_bytes().to_vec()));
                }
            }
            state.saved_heads = heads;
            Some(
                async move {
                    for (key, bytes) in writes {
                        adapter.save(key, bytes).await?;
                    }
                    Ok(())
                }
                .boxed(),
            )
        } else {
            let snapshot = doc.save();
            let snapshot_key = doc_key
                .with_component(SNAPSHOT)
                .with_component(snapshot_name(&heads));
            let stale: Vec<StorageKey> = state
                .stored_chunks
                .iter()
                .filter(|key| **key != snapshot_key)
                .cloned()
                .collect();
            state.stored_chunks = [snapshot_key.clone()].into_iter().collect();
            state.saved_heads = heads;
            Some(
                async move {
                    adapter.save(snapshot_key, snapshot).await?;
                    for key in stale {
                        adapter.remove(key).await?;
                    }
                    Ok(())
                }
                .boxed(),
            )
        }
    }

    /// Delete every key stored under the document.
    pub(crate) fn remove_doc(
        &mut self,
        document_id: DocumentId,
    ) -> BoxFuture<'static, Result<(), StorageError>> {
        self.docs.remove(&document_id);
        let adapter = self.adapter.clone();
        async move { adapter.remove_range(StorageKey::from(&document_id)).await }.boxed()
    }

    pub(crate) fn load_sync_state(
        &self,
        document_id: DocumentId,
        storage_id: StorageId,
    ) -> BoxFuture<'static, Result<Option<sync::State>, StorageError>> {
        let adapter = self.adapter.clone();
        let key = StorageKey::from(&document_id)
            .with_component(SYNC_STATE)
            .with_component(storage_id.0.clone());
        async move {
            let Some(bytes) = adapter.load(key).await? else {
                return Ok(None);
            };
            match sync::State::decode(&bytes) {
                Ok(state) => Ok(Some(state)),
                Err(err) => {
                    tracing::warn!(%document_id, %storage_id, %err, "discarding corrupt stored sync state");
                    Ok(None)
                }
            }
        }
        .boxed()
    }

    pub(crate) fn save_sync_state(
        &self,
        document_id: DocumentId,
        storage_id: &StorageId,
        state: &sync::State,
    ) -> BoxFuture<'static, Result<(), StorageError>> {
        let adapter = self.adapter.clone();
        let key = StorageKey::from(&document_id)
            .with_component(SYNC_STATE)
            .with_component(storage_id.0.clone());
        let bytes = state.encode();
        async move { adapter.save(key, bytes).await }.boxed()
    }
}

fn snapshot_name(heads: &[ChangeHash]) -> String {
    let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
    for head in heads {
        ctx.update(head.as_ref());
    }
    hex::encode(ctx.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::transaction::Transactable;
    use futures::executor::block_on;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    #[derive(Clone, Default)]
    struct MemoryAdapter {
        data: Arc<Mutex<BTreeMap<StorageKey, Vec<u8>>>>,
        id: String,
    }

    impl MemoryAdapter {
        fn new() -> Self {
            MemoryAdapter {
                data: Arc::default(),
                id: "memory".to_string(),
            }
        }

        fn keys(&self) -> Vec<StorageKey> {
            self.data.lock().keys().cloned().collect()
        }
    }

    impl StorageAdapter for MemoryAdapter {
        fn load(
            &self,
            key: StorageKey,
        ) -> BoxFuture<'static, Result<Option<Vec<u8>>, StorageError>> {
            let data = self.data.clone();
            async move { Ok(data.lock().get(&key).cloned()) }.boxed()
        }

        fn load_range(
            &self,
            prefix: StorageKey,
        ) -> BoxFuture<'static, Result<Vec<(StorageKey, Vec<u8>)>, StorageError>> {
            let data = self.data.clone();
            async move {
                Ok(data
                    .lock()
                    .iter()
                    .filter(|(key, _)| prefix.is_prefix_of(key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect())
            }
            .boxed()
        }

        fn save(
            &self,
            key: StorageKey,
            value: Vec<u8>,
        ) -> BoxFuture<'static, Result<(), StorageError>> {
            let data = self.data.clone();
            async move {
                data.lock().insert(key, value);
                Ok(())
            }
            .boxed()
        }

        fn remove(&self, key: StorageKey) -> BoxFuture<'static, Result<(), StorageError>> {
            let data = self.data.clone();
            async move {
                data.lock().remove(&key);
                Ok(())
            }
            .boxed()
        }

        fn remove_range(&self, prefix: StorageKey) -> BoxFuture<'static, Result<(), StorageError>> {
            let data = self.data.clone();
            async move {
                data.lock().retain(|key, _| !prefix.is_prefix_of(key));
                Ok(())
            }
            .boxed()
        }

        fn id(&self) -> StorageId {
            StorageId(self.id.clone())
        }
    }

    fn commit(doc: &mut Automerge, key: &str, value: i64) {
        let mut tx = doc.transaction();
        tx.put(automerge::ROOT, key, value).unwrap();
        tx.commit();
    }

    #[test]
    fn incremental_save_and_load_round_trip() {
        let adapter = MemoryAdapter::new();
        let mut storage = StorageSubsystem::new(Arc::new(adapter.clone()), 32);
        let id = DocumentId::random();

        let mut doc = Automerge::new();
        commit(&mut doc, "a", 1);
        block_on(storage.save_doc(id, &doc).unwrap()).unwrap();
        commit(&mut doc, "b", 2);
        block_on(storage.save_doc(id, &doc).unwrap()).unwrap();

        assert_eq!(adapter.keys().len(), 2);

        let loaded = block_on(storage.load_doc(id)).unwrap().unwrap();
        assert_eq!(loaded.doc.get_heads(), doc.get_heads());
        assert_eq!(loaded.chunk_keys.len(), 2);
    }

    #[test]
    fn saving_twice_is_a_no_op() {
        let adapter = MemoryAdapter::new();
        let mut storage = StorageSubsystem::new(Arc::new(adapter.clone()), 32);
        let id = DocumentId::random();

        let mut doc = Automerge::new();
        commit(&mut doc, "a", 1);
        block_on(storage.save_doc(id, &doc).unwrap()).unwrap();
        let keys = adapter.keys();
        assert!(storage.save_doc(id, &doc).is_none());
        assert_eq!(adapter.keys(), keys);
    }

    #[test]
    fn compaction_collapses_incrementals_into_a_snapshot() {
        let adapter = MemoryAdapter::new();
        let mut storage = StorageSubsystem::new(Arc::new(adapter.clone()), 3);
        let id = DocumentId::random();

        let mut doc = Automerge::new();
        for i in 0..3 {
            commit(&mut doc, "n", i);
            block_on(storage.save_doc(id, &doc).unwrap()).unwrap();
        }
        assert_eq!(adapter.keys().len(), 3);

        // The fourth change crosses the threshold.
        commit(&mut doc, "n", 99);
        block_on(storage.save_doc(id, &doc).unwrap()).unwrap();
        let keys = adapter.keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].components()[1], SNAPSHOT);

        let loaded = block_on(storage.load_doc(id)).unwrap().unwrap();
        assert_eq!(loaded.doc.get_heads(), doc.get_heads());
    }

    #[test]
    fn remove_doc_clears_the_prefix() {
        let adapter = MemoryAdapter::new();
        let mut storage = StorageSubsystem::new(Arc::new(adapter.clone()), 32);
        let id = DocumentId::random();
        let other = DocumentId::random();

        let mut doc = Automerge::new();
        commit(&mut doc, "a", 1);
        block_on(storage.save_doc(id, &doc).unwrap()).unwrap();
        block_on(storage.save_doc(other, &doc).unwrap()).unwrap();

        block_on(storage.remove_doc(id)).unwrap();
        let keys = adapter.keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].components()[0], other.to_string());
    }

    #[test]
    fn sync_states_round_trip_and_tolerate_corruption() {
        let adapter = MemoryAdapter::new();
        let storage = StorageSubsystem::new(Arc::new(adapter.clone()), 32);
        let id = DocumentId::random();
        let storage_id = StorageId::from("peer-storage");

        assert!(block_on(storage.load_sync_state(id, storage_id.clone()))
            .unwrap()
            .is_none());

        let state = sync::State::new();
        block_on(storage.save_sync_state(id, &storage_id, &state)).unwrap();
        assert!(block_on(storage.load_sync_state(id, storage_id.clone()))
            .unwrap()
            .is_some());

        // Corrupt the stored bytes; loading falls back to a fresh state.
        let key = StorageKey::from(&id)
            .with_component(SYNC_STATE)
            .with_component(storage_id.0.clone());
        adapter.data.lock().insert(key, vec![0xde, 0xad]);
        assert!(block_on(storage.load_sync_state(id, storage_id))
            .unwrap()
            .is_none());
    }
}
