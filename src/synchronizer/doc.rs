use crate::dochandle::{DocHandle, HandleState};
use crate::interfaces::PeerId;
use crate::message::RepoMessage;
use automerge::sync;
use automerge::ChangeHash;
use std::collections::{HashMap, HashSet, VecDeque};

/// What we know about a peer's relationship to this document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerDocStatus {
    Unknown,
    Has,
    Wants,
    Unavailable,
}

/// An event produced by a [`DocSynchronizer`], consumed by the repo.
#[derive(Debug)]
pub(crate) enum SyncEvent {
    /// Send this message now.
    Message(RepoMessage),
    /// Arm the per-(document, peer) debounce for an outbound sync.
    ScheduleSync { peer_id: PeerId },
    /// A peer interaction moved its sync state; persist it (debounced)
    /// and gossip the peer's heads.
    SyncStateChanged {
        peer_id: PeerId,
        their_heads: Vec<ChangeHash>,
    },
    /// First successful exchange with this peer for this document.
    OpenDoc { peer_id: PeerId },
}

/// The sync protocol engine for one document: one automerge sync state
/// per peer, plus the bookkeeping that decides between `sync`,
/// `request`, and `doc-unavailable` messages.
pub(crate) struct DocSynchronizer {
    handle: DocHandle,
    local_peer_id: PeerId,
    peers: Vec<PeerId>,
    sync_states: HashMap<PeerId, sync::State>,
    peer_doc_status: HashMap<PeerId, PeerDocStatus>,
    /// Inbound messages held back while the handle is still loading,
    /// replayed in arrival order.
    pending_messages: VecDeque<RepoMessage>,
    opened_peers: HashSet<PeerId>,
    announced_unavailable: HashSet<PeerId>,
}

impl DocSynchronizer {
    pub(crate) fn new(handle: DocHandle, local_peer_id: PeerId) -> Self {
        DocSynchronizer {
            handle,
            local_peer_id,
            peers: Vec::new(),
            sync_states: HashMap::new(),
            peer_doc_status: HashMap::new(),
            pending_messages: VecDeque::new(),
            opened_peers: HashSet::new(),
            announced_unavailable: HashSet::new(),
        }
    }

    pub(crate) fn handle(&self) -> &DocHandle {
        &self.handle
    }

    pub(crate) fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.contains(peer_id)
    }

    pub(crate) fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    fn can_sync(&self) -> bool {
        matches!(
            self.handle.state(),
            HandleState::Ready | HandleState::Requesting | HandleState::Unavailable
        )
    }

    /// Start syncing with a peer, seeded from a persisted sync state when
    /// the repo found one. Idempotent per peer.
    pub(crate) fn begin_sync(
        &mut self,
        peer_id: PeerId,
        stored: Option<sync::State>,
    ) -> Vec<SyncEvent> {
        if self.has_peer(&peer_id) {
            return Vec::new();
        }
        tracing::debug!(document_id = %self.handle.document_id(), %peer_id, "beginning sync");
        self.peers.push(peer_id.clone());
        self.sync_states
            .insert(peer_id.clone(), stored.unwrap_or_else(sync::State::new));
        self.peer_doc_status
            .insert(peer_id.clone(), PeerDocStatus::Unknown);
        if self.can_sync() {
            vec![SyncEvent::ScheduleSync { peer_id }]
        } else {
            Vec::new()
        }
    }

    /// Discard a peer's sync state and status.
    pub(crate) fn end_sync(&mut self, peer_id: &PeerId) {
        self.peers.retain(|p| p != peer_id);
        self.sync_states.remove(peer_id);
        self.peer_doc_status.remove(peer_id);
        self.opened_peers.remove(peer_id);
        self.announced_unavailable.remove(peer_id);
    }

    /// A local change (or merge) moved the document; every peer gets a
    /// debounced sync.
    pub(crate) fn note_local_change(&mut self) -> Vec<SyncEvent> {
        if !self.can_sync() {
            return Vec::new();
        }
        self.peers
            .iter()
            .cloned()
            .map(|peer_id| SyncEvent::ScheduleSync { peer_id })
            .collect()
    }

    /// The handle moved to a state from which sync can proceed: replay
    /// buffered messages and kick every peer.
    pub(crate) fn handle_state_changed(&mut self) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        if self.can_sync() {
            let pending: Vec<RepoMessage> = self.pending_messages.drain(..).collect();
            for msg in pending {
                events.extend(self.receive_message(msg));
            }
            events.extend(self.note_local_change());
        }
        if self.handle.state() == HandleState::Unavailable {
            events.extend(self.announce_unavailable());
        }
        events
    }

    /// The REQUESTING timeout fired without any peer supplying the doc.
    pub(crate) fn note_request_timeout(&mut self) -> Vec<SyncEvent> {
        if self.handle.state() != HandleState::Requesting {
            return Vec::new();
        }
        tracing::debug!(document_id = %self.handle.document_id(), "request timed out");
        self.handle.mark_unavailable();
        self.announce_unavailable()
    }

    /// Tell every peer that asked us for this document that we do not
    /// have it, at most once per peer.
    fn announce_unavailable(&mut self) -> Vec<SyncEvent> {
        let document_id = self.handle.document_id();
        let mut events = Vec::new();
        for peer_id in &self.peers {
            if self.peer_doc_status.get(peer_id) != Some(&PeerDocStatus::Wants) {
                continue;
            }
            if !self.announced_unavailable.insert(peer_id.clone()) {
                continue;
            }
            events.push(SyncEvent::Message(RepoMessage::DocUnavailable {
                sender_id: self.local_peer_id.clone(),
                target_id: peer_id.clone(),
                document_id,
            }));
        }
        events
    }

    /// Dispatch one inbound message for this document.
    pub(crate) fn receive_message(&mut self, message: RepoMessage) -> Vec<SyncEvent> {
        if !self.can_sync() {
            // Still loading; hold the message for replay.
            self.pending_messages.push_back(message);
            return Vec::new();
        }
        match message {
            RepoMessage::Sync {
                sender_id, data, ..
            } => self.receive_sync_message(sender_id, data, false),
            RepoMessage::Request {
                sender_id, data, ..
            } => self.receive_sync_message(sender_id, data, true),
            RepoMessage::DocUnavailable { sender_id, .. } => {
                self.peer_doc_status
                    .insert(sender_id, PeerDocStatus::Unavailable);
                if self.handle.state() == HandleState::Requesting
                    && !self.peers.is_empty()
                    && self.peers.iter().all(|p| {
                        self.peer_doc_status.get(p) == Some(&PeerDocStatus::Unavailable)
                    })
                {
                    self.handle.mark_unavailable();
                    return self.announce_unavailable();
                }
                Vec::new()
            }
            RepoMessage::Ephemeral {
                sender_id, data, ..
            } => {
                self.handle.receive_ephemeral(sender_id, data);
                Vec::new()
            }
            other => {
                tracing::warn!(
                    message_type = other.type_name(),
                    "document synchronizer received a non-document message"
                );
                Vec::new()
            }
        }
    }

    fn receive_sync_message(
        &mut self,
        sender_id: PeerId,
        data: Vec<u8>,
        is_request: bool,
    ) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        if !self.has_peer(&sender_id) {
            // A peer we have not begun sync with; start from scratch.
            events.extend(self.begin_sync(sender_id.clone(), None));
        }
        self.peer_doc_status.insert(
            sender_id.clone(),
            if is_request {
                PeerDocStatus::Wants
            } else {
                PeerDocStatus::Has
            },
        );
        let Some(state) = self.sync_states.get_mut(&sender_id) else {
            return events;
        };
        let heads_moved = match self.handle.apply_sync_message(state, &data) {
            Ok(heads_moved) => heads_moved,
            Err(err) => {
                tracing::warn!(
                    document_id = %self.handle.document_id(),
                    peer_id = %sender_id,
                    %err,
                    "failed to apply sync message"
                );
                return events;
            }
        };
        events.push(SyncEvent::SyncStateChanged {
            peer_id: sender_id.clone(),
            their_heads: state.their_heads.clone().unwrap_or_default(),
        });
        if self.opened_peers.insert(sender_id.clone()) {
            events.push(SyncEvent::OpenDoc {
                peer_id: sender_id.clone(),
            });
        }

        // A sync (as opposed to request) message means the sender has
        // the document, even an empty one; a waiting handle can come up.
        if !is_request
            && matches!(
                self.handle.state(),
                HandleState::Requesting | HandleState::Unavailable
            )
        {
            self.handle.promote_to_ready();
        }

        if self.handle.state() == HandleState::Unavailable && is_request {
            // We cannot help this peer either.
            let document_id = self.handle.document_id();
            if self.announced_unavailable.insert(sender_id.clone()) {
                events.push(SyncEvent::Message(RepoMessage::DocUnavailable {
                    sender_id: self.local_peer_id.clone(),
                    target_id: sender_id,
                    document_id,
                }));
            }
            return events;
        }

        // The sender always gets a (debounced) reply; everyone else only
        // when the message moved our heads.
        if heads_moved {
            events.extend(self.note_local_change());
        } else {
            events.push(SyncEvent::ScheduleSync { peer_id: sender_id });
        }
        events
    }

    /// Called when the per-(document, peer) debounce fires: produce the
    /// next outbound message for this peer, if the protocol has one.
    pub(crate) fn produce_sync_message(&mut self, peer_id: &PeerId) -> Option<RepoMessage> {
        if !self.can_sync() {
            return None;
        }
        let state = self.sync_states.get_mut(peer_id)?;
        let data = self.handle.generate_sync_message(state)?;
        let document_id = self.handle.document_id();
        let requesting = self.handle.state() == HandleState::Requesting
            && self.peer_doc_status.get(peer_id) != Some(&PeerDocStatus::Has);
        let message = if requesting {
            RepoMessage::Request {
                sender_id: self.local_peer_id.clone(),
                target_id: peer_id.clone(),
                document_id,
                data,
            }
        } else {
            RepoMessage::Sync {
                sender_id: self.local_peer_id.clone(),
                target_id: peer_id.clone(),
                document_id,
                data,
            }
        };
        Some(message)
    }

    /// The current sync state for a peer, for persistence.
    pub(crate) fn sync_state_for(&self, peer_id: &PeerId) -> Option<&sync::State> {
        self.sync_states.get(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::DocumentId;
    use crate::repo::RepoEvent;
    use automerge::transaction::Transactable;
    use automerge::Automerge;
    use crossbeam_channel::Receiver;

    fn ready_handle_with(n: i64) -> (DocHandle, Receiver<RepoEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = DocHandle::new(tx, DocumentId::random(), PeerId::from("local"));
        let mut doc = Automerge::new();
        let mut tx2 = doc.transaction();
        tx2.put(automerge::ROOT, "n", n).unwrap();
        tx2.commit();
        handle.setup_ready(doc);
        (handle, rx)
    }

    fn requesting_handle() -> (DocHandle, Receiver<RepoEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = DocHandle::new(tx, DocumentId::random(), PeerId::from("local"));
        handle.begin_load();
        handle.begin_request();
        (handle, rx)
    }

    /// Pump messages between two synchronizers until neither produces
    /// anything more. Returns how many messages flowed.
    fn converge(a: &mut DocSynchronizer, b: &mut DocSynchronizer) -> usize {
        let peer_a = PeerId::from("a");
        let peer_b = PeerId::from("b");
        let mut carried = 0;
        loop {
            let mut progressed = false;
            if let Some(msg) = a.produce_sync_message(&peer_b) {
                b.receive_message(msg);
                carried += 1;
                progressed = true;
            }
            if let Some(msg) = b.produce_sync_message(&peer_a) {
                a.receive_message(msg);
                carried += 1;
                progressed = true;
            }
            if !progressed {
                return carried;
            }
        }
    }

    #[test]
    fn two_ready_documents_converge() {
        let (handle_a, _rx_a) = ready_handle_with(1);
        let (handle_b, _rx_b) = ready_handle_with(2);
        let mut sync_a = DocSynchronizer::new(handle_a.clone(), PeerId::from("a"));
        let mut sync_b = DocSynchronizer::new(handle_b.clone(), PeerId::from("b"));
        sync_a.begin_sync(PeerId::from("b"), None);
        sync_b.begin_sync(PeerId::from("a"), None);
        converge(&mut sync_a, &mut sync_b);
        assert_eq!(handle_a.heads().unwrap(), handle_b.heads().unwrap());
    }

    #[test]
    fn requesting_handle_sends_request_and_promotes_on_answer() {
        let (source, _rx_a) = ready_handle_with(5);
        let (requester, _rx_b) = requesting_handle();
        let mut sync_source = DocSynchronizer::new(source.clone(), PeerId::from("a"));
        let mut sync_requester = DocSynchronizer::new(requester.clone(), PeerId::from("b"));
        sync_source.begin_sync(PeerId::from("b"), None);
        sync_requester.begin_sync(PeerId::from("a"), None);

        let first = sync_requester
            .produce_sync_message(&PeerId::from("a"))
            .unwrap();
        assert!(matches!(first, RepoMessage::Request { .. }));
        sync_source.receive_message(first);
        converge(&mut sync_source, &mut sync_requester);

        assert!(requester.is_ready());
        assert_eq!(requester.heads().unwrap(), source.heads().unwrap());
    }

    #[test]
    fn an_empty_document_can_still_be_requested() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let source = DocHandle::new(tx, DocumentId::random(), PeerId::from("local"));
        source.setup_ready(Automerge::new());
        let (requester, _rx2) = requesting_handle();
        let mut sync_source = DocSynchronizer::new(source, PeerId::from("a"));
        let mut sync_requester = DocSynchronizer::new(requester.clone(), PeerId::from("b"));
        sync_source.begin_sync(PeerId::from("b"), None);
        sync_requester.begin_sync(PeerId::from("a"), None);

        converge(&mut sync_source, &mut sync_requester);

        // The peer answered with a sync message, so the handle comes up
        // even though there are no heads to merge.
        assert!(requester.is_ready());
        assert!(requester.heads().unwrap().is_empty());
    }

    #[test]
    fn messages_buffer_until_the_handle_leaves_loading() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handle = DocHandle::new(tx, DocumentId::random(), PeerId::from("local"));
        handle.begin_load();
        let mut sync = DocSynchronizer::new(handle.clone(), PeerId::from("local"));

        // Build a real sync message from a ready source.
        let (source, _rx2) = ready_handle_with(7);
        let mut source_state = automerge::sync::State::new();
        let data = source.generate_sync_message(&mut source_state).unwrap();
        let msg = RepoMessage::Sync {
            sender_id: PeerId::from("peer"),
            target_id: PeerId::from("local"),
            document_id: handle.document_id(),
            data,
        };
        assert!(sync.receive_message(msg).is_empty());

        // Storage had nothing; the handle moves on to requesting and the
        // buffered message replays.
        handle.begin_request();
        let events = sync.handle_state_changed();
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::SyncStateChanged { .. })));
    }

    #[test]
    fn all_peers_unavailable_marks_the_handle() {
        let (handle, _rx) = requesting_handle();
        let document_id = handle.document_id();
        let mut sync = DocSynchronizer::new(handle.clone(), PeerId::from("local"));
        sync.begin_sync(PeerId::from("p1"), None);
        sync.begin_sync(PeerId::from("p2"), None);

        sync.receive_message(RepoMessage::DocUnavailable {
            sender_id: PeerId::from("p1"),
            target_id: PeerId::from("local"),
            document_id,
        });
        assert!(!handle.is_unavailable());

        sync.receive_message(RepoMessage::DocUnavailable {
            sender_id: PeerId::from("p2"),
            target_id: PeerId::from("local"),
            document_id,
        });
        assert!(handle.is_unavailable());
    }

    #[test]
    fn end_sync_discards_peer_state() {
        let (handle, _rx) = ready_handle_with(1);
        let mut sync = DocSynchronizer::new(handle, PeerId::from("local"));
        sync.begin_sync(PeerId::from("p1"), None);
        assert!(sync.has_peer(&PeerId::from("p1")));
        sync.end_sync(&PeerId::from("p1"));
        assert!(!sync.has_peer(&PeerId::from("p1")));
        assert!(sync.sync_state_for(&PeerId::from("p1")).is_none());
    }
}
