use crate::interfaces::{DocumentId, PeerId, StorageId};
use crate::message::TimestampedHeads;
use std::collections::{HashMap, HashSet};

/// An event produced by the subscription graph, consumed by the repo.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RemoteHeadsEvent {
    /// Our subscription set changed; tell the named peers the deltas.
    ChangeRemoteSubs {
        peers: Vec<PeerId>,
        add: Vec<StorageId>,
        remove: Vec<StorageId>,
    },
    /// Forward heads we know about to a subscribed peer.
    NotifyRemoteHeads {
        target: PeerId,
        document_id: DocumentId,
        storage_id: StorageId,
        heads: TimestampedHeads,
    },
    /// A remote storage's view of a document moved; apply to the handle.
    RemoteHeadsChanged {
        document_id: DocumentId,
        storage_id: StorageId,
        heads: TimestampedHeads,
    },
}

/// Who wants to hear about which remote storages' heads, and the newest
/// heads we have seen for each `(document, storage)` pair.
///
/// Pure in-memory state: every mutation returns the events the repo
/// should act on, and nothing else observes the tables directly.
#[derive(Default)]
pub(crate) struct RemoteHeadsSubscriptions {
    /// Storages we want heads advertisements for.
    our_subscriptions: HashSet<StorageId>,
    /// Peers that asked us for heads of the given storage.
    subscribers: HashMap<StorageId, HashSet<PeerId>>,
    /// Peers that receive every advertisement for documents we share.
    generous_peers: HashSet<PeerId>,
    /// Peers syncing the given document, subscribed to it on their
    /// first successful exchange.
    doc_peers: HashMap<DocumentId, HashSet<PeerId>>,
    /// Newest observed heads per document per storage.
    known_heads: HashMap<DocumentId, HashMap<StorageId, TimestampedHeads>>,
}

impl RemoteHeadsSubscriptions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start following heads advertisements for `storage_ids`.
    pub(crate) fn subscribe_to_remotes(
        &mut self,
        storage_ids: Vec<StorageId>,
    ) -> Vec<RemoteHeadsEvent> {
        let added: Vec<StorageId> = storage_ids
            .into_iter()
            .filter(|id| self.our_subscriptions.insert(id.clone()))
            .collect();
        if added.is_empty() || self.generous_peers.is_empty() {
            return Vec::new();
        }
        vec![RemoteHeadsEvent::ChangeRemoteSubs {
            peers: self.generous_peers.iter().cloned().collect(),
            add: added,
            remove: Vec::new(),
        }]
    }

    pub(crate) fn unsubscribe_from_remotes(
        &mut self,
        storage_ids: Vec<StorageId>,
    ) -> Vec<RemoteHeadsEvent> {
        let removed: Vec<StorageId> = storage_ids
            .into_iter()
            .filter(|id| self.our_subscriptions.remove(id))
            .collect();
        if removed.is_empty() || self.generous_peers.is_empty() {
            return Vec::new();
        }
        vec![RemoteHeadsEvent::ChangeRemoteSubs {
            peers: self.generous_peers.iter().cloned().collect(),
            add: Vec::new(),
            remove: removed,
        }]
    }

    /// Mark a peer as generous: it receives every advertisement for the
    /// documents we share with it, and learns our subscription set.
    pub(crate) fn add_generous_peer(&mut self, peer_id: PeerId) -> Vec<RemoteHeadsEvent> {
        if !self.generous_peers.insert(peer_id.clone()) || self.our_subscriptions.is_empty() {
            return Vec::new();
        }
        vec![RemoteHeadsEvent::ChangeRemoteSubs {
            peers: vec![peer_id],
            add: self.our_subscriptions.iter().cloned().collect(),
            remove: Vec::new(),
        }]
    }

    pub(crate) fn remove_peer(&mut self, peer_id: &PeerId) {
        self.generous_peers.remove(peer_id);
        for subscribers in self.subscribers.values_mut() {
            subscribers.remove(peer_id);
        }
        for peers in self.doc_peers.values_mut() {
            peers.remove(peer_id);
        }
    }

    /// Forget a document's subscribers and observed heads.
    pub(crate) fn remove_document(&mut self, document_id: &DocumentId) {
        self.doc_peers.remove(document_id);
        self.known_heads.remove(document_id);
    }

    /// A peer completed its first exchange on a document: it now hears
    /// about that document's remote heads, starting with everything we
    /// already know.
    pub(crate) fn subscribe_peer_to_doc(
        &mut self,
        peer_id: PeerId,
        document_id: DocumentId,
    ) -> Vec<RemoteHeadsEvent> {
        if !self
            .doc_peers
            .entry(document_id)
            .or_default()
            .insert(peer_id.clone())
        {
            return Vec::new();
        }
        let Some(by_storage) = self.known_heads.get(&document_id) else {
            return Vec::new();
        };
        by_storage
            .iter()
            .map(|(storage_id, heads)| RemoteHeadsEvent::NotifyRemoteHeads {
                target: peer_id.clone(),
                document_id,
                storage_id: storage_id.clone(),
                heads: heads.clone(),
            })
            .collect()
    }

    /// A peer changed what it wants to hear about through us. Newly added
    /// subscriptions are caught up with everything we already know.
    pub(crate) fn handle_control_message(
        &mut self,
        peer_id: PeerId,
        add: Vec<StorageId>,
        remove: Vec<StorageId>,
    ) -> Vec<RemoteHeadsEvent> {
        let mut events = Vec::new();
        for storage_id in add {
            let newly = self
                .subscribers
                .entry(storage_id.clone())
                .or_default()
                .insert(peer_id.clone());
            if !newly {
                continue;
            }
            for (document_id, by_storage) in &self.known_heads {
                if let Some(heads) = by_storage.get(&storage_id) {
                    events.push(RemoteHeadsEvent::NotifyRemoteHeads {
                        target: peer_id.clone(),
                        document_id: *document_id,
                        storage_id: storage_id.clone(),
                        heads: heads.clone(),
                    });
                }
            }
        }
        for storage_id in remove {
            if let Some(subscribers) = self.subscribers.get_mut(&storage_id) {
                subscribers.remove(&peer_id);
            }
        }
        events
    }

    /// A peer advertised heads it observed on behalf of some storages.
    /// The newest timestamp per `(document, storage)` wins.
    pub(crate) fn handle_remote_heads(
        &mut self,
        document_id: DocumentId,
        from_peer: &PeerId,
        new_heads: HashMap<StorageId, TimestampedHeads>,
    ) -> Vec<RemoteHeadsEvent> {
        let mut events = Vec::new();
        for (storage_id, heads) in new_heads {
            if !self.record(document_id, storage_id.clone(), heads.clone()) {
                tracing::trace!(%document_id, %storage_id, "dropping stale remote heads");
                continue;
            }
            if self.our_subscriptions.contains(&storage_id) {
                events.push(RemoteHeadsEvent::RemoteHeadsChanged {
                    document_id,
                    storage_id: storage_id.clone(),
                    heads: heads.clone(),
                });
            }
            // Relay to everyone else interested in this storage or
            // syncing this document.
            for target in self.recipients_for(&document_id, &storage_id) {
                if target == *from_peer {
                    continue;
                }
                events.push(RemoteHeadsEvent::NotifyRemoteHeads {
                    target,
                    document_id,
                    storage_id: storage_id.clone(),
                    heads: heads.clone(),
                });
            }
        }
        events
    }

    /// We observed heads for a storage ourselves, via a sync-state update
    /// with one of that storage's peers.
    pub(crate) fn handle_immediate_remote_heads(
        &mut self,
        document_id: DocumentId,
        storage_id: StorageId,
        heads: TimestampedHeads,
    ) -> Vec<RemoteHeadsEvent> {
        if !self.record(document_id, storage_id.clone(), heads.clone()) {
            return Vec::new();
        }
        self.recipients_for(&document_id, &storage_id)
            .into_iter()
            .map(|target| RemoteHeadsEvent::NotifyRemoteHeads {
                target,
                document_id,
                storage_id: storage_id.clone(),
                heads: heads.clone(),
            })
            .collect()
    }

    /// Returns false when the incoming entry is not newer than what we
    /// already hold.
    fn record(
        &mut self,
        document_id: DocumentId,
        storage_id: StorageId,
        heads: TimestampedHeads,
    ) -> bool {
        let by_storage = self.known_heads.entry(document_id).or_default();
        if let Some(existing) = by_storage.get(&storage_id) {
            if existing.timestamp >= heads.timestamp {
                return false;
            }
        }
        by_storage.insert(storage_id, heads);
        true
    }

    fn recipients_for(&self, document_id: &DocumentId, storage_id: &StorageId) -> Vec<PeerId> {
        let mut recipients: HashSet<PeerId> = self.generous_peers.clone();
        if let Some(subscribers) = self.subscribers.get(storage_id) {
            recipients.extend(subscribers.iter().cloned());
        }
        if let Some(peers) = self.doc_peers.get(document_id) {
            recipients.extend(peers.iter().cloned());
        }
        recipients.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heads_at(timestamp: i64) -> TimestampedHeads {
        TimestampedHeads {
            heads: Vec::new(),
            timestamp,
        }
    }

    #[test]
    fn newer_timestamps_win_and_stale_ones_drop() {
        let mut subs = RemoteHeadsSubscriptions::new();
        let doc = DocumentId::random();
        let storage = StorageId::from("s1");
        subs.subscribe_to_remotes(vec![storage.clone()]);

        let events =
            subs.handle_remote_heads(doc, &PeerId::from("p1"), [(storage.clone(), heads_at(10))].into());
        assert!(events
            .iter()
            .any(|e| matches!(e, RemoteHeadsEvent::RemoteHeadsChanged { .. })));

        // Equal timestamp: dropped.
        let events =
            subs.handle_remote_heads(doc, &PeerId::from("p1"), [(storage.clone(), heads_at(10))].into());
        assert!(events.is_empty());

        // Older: dropped.
        let events =
            subs.handle_remote_heads(doc, &PeerId::from("p1"), [(storage.clone(), heads_at(5))].into());
        assert!(events.is_empty());

        // Newer: recorded.
        let events = subs.handle_remote_heads(doc, &PeerId::from("p1"), [(storage, heads_at(11))].into());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn generous_peers_learn_our_subscriptions() {
        let mut subs = RemoteHeadsSubscriptions::new();
        let storage = StorageId::from("s1");
        assert!(subs.subscribe_to_remotes(vec![storage.clone()]).is_empty());

        let events = subs.add_generous_peer(PeerId::from("p1"));
        match &events[..] {
            [RemoteHeadsEvent::ChangeRemoteSubs { peers, add, remove }] => {
                assert_eq!(peers, &[PeerId::from("p1")]);
                assert_eq!(add, &[storage.clone()]);
                assert!(remove.is_empty());
            }
            other => panic!("unexpected events: {other:?}"),
        }

        // Later subscriptions reach the already-known generous peer.
        let events = subs.subscribe_to_remotes(vec![StorageId::from("s2")]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn new_subscribers_catch_up_on_known_heads() {
        let mut subs = RemoteHeadsSubscriptions::new();
        let doc = DocumentId::random();
        let storage = StorageId::from("s1");
        subs.handle_immediate_remote_heads(doc, storage.clone(), heads_at(42));

        let events = subs.handle_control_message(
            PeerId::from("p2"),
            vec![storage.clone()],
            Vec::new(),
        );
        match &events[..] {
            [RemoteHeadsEvent::NotifyRemoteHeads {
                target,
                document_id,
                storage_id,
                heads,
            }] => {
                assert_eq!(target, &PeerId::from("p2"));
                assert_eq!(document_id, &doc);
                assert_eq!(storage_id, &storage);
                assert_eq!(heads.timestamp, 42);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn opening_a_document_subscribes_the_peer_and_catches_it_up() {
        let mut subs = RemoteHeadsSubscriptions::new();
        let doc = DocumentId::random();
        let other_doc = DocumentId::random();
        let storage = StorageId::from("s1");
        subs.handle_immediate_remote_heads(doc, storage.clone(), heads_at(7));

        // First exchange: the peer is caught up on what we know.
        let events = subs.subscribe_peer_to_doc(PeerId::from("p1"), doc);
        match &events[..] {
            [RemoteHeadsEvent::NotifyRemoteHeads {
                target,
                document_id,
                heads,
                ..
            }] => {
                assert_eq!(target, &PeerId::from("p1"));
                assert_eq!(document_id, &doc);
                assert_eq!(heads.timestamp, 7);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        // Re-opening is a no-op.
        assert!(subs.subscribe_peer_to_doc(PeerId::from("p1"), doc).is_empty());

        // Later observations for the opened document reach the peer,
        // but other documents' do not.
        let events = subs.handle_immediate_remote_heads(doc, storage.clone(), heads_at(8));
        assert_eq!(events.len(), 1);
        let events = subs.handle_immediate_remote_heads(other_doc, storage, heads_at(9));
        assert!(events.is_empty());
    }

    #[test]
    fn removing_a_document_drops_its_subscribers() {
        let mut subs = RemoteHeadsSubscriptions::new();
        let doc = DocumentId::random();
        let storage = StorageId::from("s1");
        subs.subscribe_peer_to_doc(PeerId::from("p1"), doc);
        subs.remove_document(&doc);
        let events = subs.handle_immediate_remote_heads(doc, storage, heads_at(1));
        assert!(events.is_empty());
    }

    #[test]
    fn our_observations_notify_subscribers_but_not_after_removal() {
        let mut subs = RemoteHeadsSubscriptions::new();
        let doc = DocumentId::random();
        let storage = StorageId::from("s1");
        subs.handle_control_message(PeerId::from("p2"), vec![storage.clone()], Vec::new());

        let events = subs.handle_immediate_remote_heads(doc, storage.clone(), heads_at(1));
        assert_eq!(events.len(), 1);

        subs.remove_peer(&PeerId::from("p2"));
        let events = subs.handle_immediate_remote_heads(doc, storage, heads_at(2));
        assert!(events.is_empty());
    }
}
