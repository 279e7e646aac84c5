mod doc;

pub(crate) use doc::{DocSynchronizer, SyncEvent};

use crate::dochandle::DocHandle;
use crate::interfaces::{DocumentId, PeerId};
use crate::message::RepoMessage;
use automerge::sync;
use std::collections::{HashMap, HashSet};

/// An event produced by the collection, consumed by the repo: a
/// [`SyncEvent`] stamped with the document it belongs to.
#[derive(Debug)]
pub(crate) struct CollectionEvent {
    pub(crate) document_id: DocumentId,
    pub(crate) event: SyncEvent,
}

/// A (peer, document) pair the repo must run the share policy for, and
/// begin sync on a positive answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ShareCandidate {
    pub(crate) peer_id: PeerId,
    pub(crate) document_id: DocumentId,
}

/// Owns the set of peers and the per-document synchronizers, and fans
/// peer and document events into them. The share policy itself lives
/// with the repo (it is async); the collection reports the candidate
/// pairs that need a policy answer.
pub(crate) struct CollectionSynchronizer {
    local_peer_id: PeerId,
    peers: HashSet<PeerId>,
    doc_synchronizers: HashMap<DocumentId, DocSynchronizer>,
    doc_set_up: HashSet<DocumentId>,
}

impl CollectionSynchronizer {
    pub(crate) fn new(local_peer_id: PeerId) -> Self {
        CollectionSynchronizer {
            local_peer_id,
            peers: HashSet::new(),
            doc_synchronizers: HashMap::new(),
            doc_set_up: HashSet::new(),
        }
    }

    /// Register a peer. Returns the (peer, document) pairs the repo must
    /// query the share policy for. Idempotent.
    pub(crate) fn add_peer(&mut self, peer_id: PeerId) -> Vec<ShareCandidate> {
        if !self.peers.insert(peer_id.clone()) {
            return Vec::new();
        }
        self.doc_synchronizers
            .iter()
            .filter(|(_, sync)| !sync.has_peer(&peer_id))
            .map(|(document_id, _)| ShareCandidate {
                peer_id: peer_id.clone(),
                document_id: *document_id,
            })
            .collect()
    }

    /// Drop a peer from every document synchronizer.
    pub(crate) fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
        for sync in self.doc_synchronizers.values_mut() {
            sync.end_sync(peer_id);
        }
    }

    pub(crate) fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    /// Register a document, creating its synchronizer on first sight.
    /// Returns the (peer, document) pairs to query. Idempotent via the
    /// set-up flag.
    pub(crate) fn add_document(
        &mut self,
        document_id: DocumentId,
        handle: DocHandle,
    ) -> Vec<ShareCandidate> {
        if !self.doc_set_up.insert(document_id) {
            return Vec::new();
        }
        self.doc_synchronizers
            .entry(document_id)
            .or_insert_with(|| DocSynchronizer::new(handle, self.local_peer_id.clone()));
        self.peers
            .iter()
            .map(|peer_id| ShareCandidate {
                peer_id: peer_id.clone(),
                document_id,
            })
            .collect()
    }

    /// Drop a document's synchronizer and setup flag. The repo discards
    /// any pending outbound debounces for it.
    pub(crate) fn remove_document(&mut self, document_id: &DocumentId) {
        // TODO: notify peers with an explicit tombstone once the wire
        // protocol grows one; for now remote requesters time out.
        self.doc_synchronizers.remove(document_id);
        self.doc_set_up.remove(document_id);
    }

    pub(crate) fn has_document(&self, document_id: &DocumentId) -> bool {
        self.doc_synchronizers.contains_key(document_id)
    }

    /// Feed one inbound document message. The repo has already ensured a
    /// handle and synchronizer exist. Returns the synchronizer's events
    /// plus any peers that are new to this document and need a policy
    /// answer before they catch up.
    pub(crate) fn receive_message(
        &mut self,
        message: RepoMessage,
    ) -> (Vec<CollectionEvent>, Vec<ShareCandidate>) {
        let Some(document_id) = message.document_id().copied() else {
            tracing::warn!(
                message_type = message.type_name(),
                "collection synchronizer received a non-document message"
            );
            return (Vec::new(), Vec::new());
        };
        let Some(sync) = self.doc_synchronizers.get_mut(&document_id) else {
            return (Vec::new(), Vec::new());
        };
        let events = sync
            .receive_message(message)
            .into_iter()
            .map(|event| CollectionEvent { document_id, event })
            .collect();
        // Late subscribers catch up: peers connected after this document
        // was set up may not have been offered it yet.
        let candidates = self
            .peers
            .iter()
            .filter(|peer_id| !self.doc_synchronizers[&document_id].has_peer(peer_id))
            .map(|peer_id| ShareCandidate {
                peer_id: peer_id.clone(),
                document_id,
            })
            .collect();
        (events, candidates)
    }

    /// The share policy said yes for this pair: begin sync, seeded with a
    /// persisted sync state when the repo loaded one.
    pub(crate) fn begin_sync(
        &mut self,
        document_id: DocumentId,
        peer_id: PeerId,
        stored: Option<sync::State>,
    ) -> Vec<CollectionEvent> {
        let Some(sync) = self.doc_synchronizers.get_mut(&document_id) else {
            return Vec::new();
        };
        sync.begin_sync(peer_id, stored)
            .into_iter()
            .map(|event| CollectionEvent { document_id, event })
            .collect()
    }

    /// Fan a handle state change into its synchronizer.
    pub(crate) fn document_state_changed(&mut self, document_id: &DocumentId) -> Vec<CollectionEvent> {
        let Some(sync) = self.doc_synchronizers.get_mut(document_id) else {
            return Vec::new();
        };
        sync.handle_state_changed()
            .into_iter()
            .map(|event| CollectionEvent {
                document_id: *document_id,
                event,
            })
            .collect()
    }

    /// Fan a local document change into its synchronizer.
    pub(crate) fn document_changed(&mut self, document_id: &DocumentId) -> Vec<CollectionEvent> {
        let Some(sync) = self.doc_synchronizers.get_mut(document_id) else {
            return Vec::new();
        };
        sync.note_local_change()
            .into_iter()
            .map(|event| CollectionEvent {
                document_id: *document_id,
                event,
            })
            .collect()
    }

    pub(crate) fn request_timed_out(&mut self, document_id: &DocumentId) -> Vec<CollectionEvent> {
        let Some(sync) = self.doc_synchronizers.get_mut(document_id) else {
            return Vec::new();
        };
        sync.note_request_timeout()
            .into_iter()
            .map(|event| CollectionEvent {
                document_id: *document_id,
                event,
            })
            .collect()
    }

    pub(crate) fn produce_sync_message(
        &mut self,
        document_id: &DocumentId,
        peer_id: &PeerId,
    ) -> Option<RepoMessage> {
        self.doc_synchronizers
            .get_mut(document_id)?
            .produce_sync_message(peer_id)
    }

    pub(crate) fn sync_state_for(
        &self,
        document_id: &DocumentId,
        peer_id: &PeerId,
    ) -> Option<&sync::State> {
        self.doc_synchronizers
            .get(document_id)?
            .sync_state_for(peer_id)
    }

    /// The peers currently syncing the given document.
    pub(crate) fn document_peers(&self, document_id: &DocumentId) -> Vec<PeerId> {
        self.doc_synchronizers
            .get(document_id)
            .map(|sync| sync.peers().to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dochandle::DocHandle;
    use automerge::Automerge;

    fn collection() -> (CollectionSynchronizer, crossbeam_channel::Sender<crate::repo::RepoEvent>)
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        // Handle notifications are fire-and-forget; the tests do not
        // observe them.
        drop(rx);
        (CollectionSynchronizer::new(PeerId::from("local")), tx)
    }

    fn ready_handle(
        tx: &crossbeam_channel::Sender<crate::repo::RepoEvent>,
    ) -> DocHandle {
        let handle = DocHandle::new(tx.clone(), DocumentId::random(), PeerId::from("local"));
        handle.setup_ready(Automerge::new());
        handle
    }

    #[test]
    fn add_peer_reports_existing_documents_once() {
        let (mut collection, tx) = collection();
        let handle = ready_handle(&tx);
        let id = handle.document_id();
        assert!(collection.add_document(id, handle.clone()).is_empty());
        // Re-adding is a no-op.
        assert!(collection.add_document(id, handle).is_empty());

        let candidates = collection.add_peer(PeerId::from("p1"));
        assert_eq!(
            candidates,
            vec![ShareCandidate {
                peer_id: PeerId::from("p1"),
                document_id: id
            }]
        );
        assert!(collection.add_peer(PeerId::from("p1")).is_empty());
    }

    #[test]
    fn add_document_reports_existing_peers() {
        let (mut collection, tx) = collection();
        collection.add_peer(PeerId::from("p1"));
        let handle = ready_handle(&tx);
        let id = handle.document_id();
        let candidates = collection.add_document(id, handle);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].peer_id, PeerId::from("p1"));
    }

    #[test]
    fn remove_peer_ends_sync_everywhere() {
        let (mut collection, tx) = collection();
        let handle = ready_handle(&tx);
        let id = handle.document_id();
        collection.add_document(id, handle);
        collection.add_peer(PeerId::from("p1"));
        collection.begin_sync(id, PeerId::from("p1"), None);
        assert_eq!(collection.document_peers(&id), vec![PeerId::from("p1")]);

        collection.remove_peer(&PeerId::from("p1"));
        assert!(collection.document_peers(&id).is_empty());
    }

    #[test]
    fn remove_document_drops_the_synchronizer() {
        let (mut collection, tx) = collection();
        let handle = ready_handle(&tx);
        let id = handle.document_id();
        collection.add_document(id, handle);
        assert!(collection.has_document(&id));
        collection.remove_document(&id);
        assert!(!collection.has_document(&id));
    }
}
