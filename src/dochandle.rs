use crate::events::{Listeners, SubscriptionToken};
use crate::interfaces::{DocumentId, PeerId, StorageId};
use crate::repo::{new_repo_future_with_resolver, RepoEvent, RepoFuture, RepoFutureResolver};
use automerge::sync::{self, SyncDoc};
use automerge::{Automerge, ChangeHash, Patch};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// The lifecycle state of a document handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// Created, but loading has not started.
    Idle,
    /// Loading from storage.
    Loading,
    /// Not in storage, waiting for a peer to supply the document.
    Requesting,
    /// The document is available for reading and writing.
    Ready,
    /// Unloaded by the repo; the last-known document is retained.
    Unloaded,
    /// Deleted. Terminal.
    Deleted,
    /// No peer could supply the document.
    Unavailable,
}

/// The error returned by document handle operations.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("document is not ready (state: {0:?})")]
    NotReady(HandleState),
    #[error("document has been deleted")]
    Deleted,
    #[error("document is unavailable")]
    Unavailable,
    #[error("malformed sync message: {0}")]
    BadSyncMessage(String),
    #[error("repo stopped")]
    Shutdown,
    #[error(transparent)]
    Automerge(#[from] automerge::AutomergeError),
}

/// An event emitted by a document handle.
#[derive(Debug, Clone)]
pub enum DocHandleEvent {
    /// A change was committed through this repo's copy of the document.
    Change { heads: Vec<ChangeHash> },
    /// The document's heads moved, by a local change, a merge, or an
    /// inbound sync message.
    HeadsChanged { heads: Vec<ChangeHash> },
    /// The handle was deleted.
    Delete,
    /// No peer could supply the document.
    Unavailable,
    /// An ephemeral broadcast arrived from a peer.
    EphemeralMessage { sender_id: PeerId, data: Vec<u8> },
    /// A remote storage's view of the document moved.
    RemoteHeads {
        storage_id: StorageId,
        heads: Vec<ChangeHash>,
    },
}

/// A document shared between the handles onto it and the repo.
pub(crate) struct SharedDocument {
    state: HandleState,
    automerge: Automerge,
    last_heads: Vec<ChangeHash>,
    remote_heads: HashMap<StorageId, Vec<ChangeHash>>,
    listeners: Listeners<DocHandleEvent>,
    state_waiters: Vec<StateWaiter>,
    change_waiters: Vec<RepoFutureResolver<Result<(), DocError>>>,
}

struct StateWaiter {
    states: Vec<HandleState>,
    resolver: RepoFutureResolver<Result<(), DocError>>,
}

impl SharedDocument {
    fn new() -> Self {
        SharedDocument {
            state: HandleState::Idle,
            automerge: Automerge::new(),
            last_heads: Vec::new(),
            remote_heads: HashMap::new(),
            listeners: Listeners::new(),
            state_waiters: Vec::new(),
            change_waiters: Vec::new(),
        }
    }

    fn ensure_ready(&self) -> Result<(), DocError> {
        match self.state {
            HandleState::Ready => Ok(()),
            HandleState::Deleted => Err(DocError::Deleted),
            HandleState::Unavailable => Err(DocError::Unavailable),
            state => Err(DocError::NotReady(state)),
        }
    }

    /// Reconcile `last_heads` with the document, firing events and change
    /// waiters when the heads moved. Returns the new heads if they did.
    fn note_heads(&mut self, fire_change: bool) -> Option<Vec<ChangeHash>> {
        let heads = self.automerge.get_heads();
        if heads == self.last_heads {
            return None;
        }
        self.last_heads = heads.clone();
        if fire_change {
            self.listeners.emit(DocHandleEvent::Change {
                heads: heads.clone(),
            });
        }
        self.listeners.emit(DocHandleEvent::HeadsChanged {
            heads: heads.clone(),
        });
        for waiter in self.change_waiters.drain(..) {
            waiter.resolve(Ok(()));
        }
        Some(heads)
    }

    fn transition(&mut self, state: HandleState) {
        self.state = state;
        let mut kept = Vec::new();
        for waiter in self.state_waiters.drain(..) {
            if waiter.states.contains(&state) {
                waiter.resolver.resolve(Ok(()));
            } else if state == HandleState::Deleted {
                waiter.resolver.resolve(Err(DocError::Deleted));
            } else {
                kept.push(waiter);
            }
        }
        self.state_waiters = kept;
        if state == HandleState::Deleted {
            for waiter in self.change_waiters.drain(..) {
                waiter.resolve(Err(DocError::Deleted));
            }
        }
    }
}

/// A handle to a document, held by the client(s).
///
/// The handle is the only way to read or mutate a document, and every
/// access is gated on the handle's [`HandleState`]. Handles are cheap to
/// clone; all clones share one underlying document.
#[derive(Clone)]
pub struct DocHandle {
    /// Document state shared between all clones and the repo.
    shared: Arc<RwLock<SharedDocument>>,
    /// Channel used to send events back to the repo.
    repo_sender: Sender<RepoEvent>,
    document_id: DocumentId,
    local_peer_id: PeerId,
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("document_id", &self.document_id)
            .field("state", &self.state())
            .finish()
    }
}

impl DocHandle {
    pub(crate) fn new(
        repo_sender: Sender<RepoEvent>,
        document_id: DocumentId,
        local_peer_id: PeerId,
    ) -> Self {
        DocHandle {
            shared: Arc::new(RwLock::new(SharedDocument::new())),
            repo_sender,
            document_id,
            local_peer_id,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id.clone()
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    /// The `automerge:<base58check>` URL of this document.
    pub fn url(&self) -> String {
        self.document_id.as_url()
    }

    pub fn state(&self) -> HandleState {
        self.shared.read().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == HandleState::Ready
    }

    pub fn is_deleted(&self) -> bool {
        self.state() == HandleState::Deleted
    }

    pub fn is_unavailable(&self) -> bool {
        self.state() == HandleState::Unavailable
    }

    /// Run a closure over an immutable reference to the document.
    /// Requires the handle to be ready.
    pub fn with_doc<F, T>(&self, f: F) -> Result<T, DocError>
    where
        F: FnOnce(&Automerge) -> T,
    {
        let shared = self.shared.read();
        shared.ensure_ready()?;
        Ok(f(&shared.automerge))
    }

    /// Run a closure over a mutable reference to the document, committing
    /// whatever transactions it leaves behind as local changes.
    ///
    /// If the closure moved the document's heads, `change` and
    /// `heads-changed` fire, in that order, before this returns.
    pub fn with_doc_mut<F, T>(&self, f: F) -> Result<T, DocError>
    where
        F: FnOnce(&mut Automerge) -> T,
    {
        let (res, changed) = {
            let mut shared = self.shared.write();
            shared.ensure_ready()?;
            let res = f(&mut shared.automerge);
            let changed = shared.note_heads(true);
            (res, changed)
        };
        if changed.is_some() {
            let _ = self
                .repo_sender
                .send(RepoEvent::DocChange(self.document_id));
        }
        Ok(res)
    }

    /// As [`DocHandle::with_doc_mut`], but the closure sees the document
    /// as it was at `heads`; the commit lands as a change concurrent with
    /// everything after that point. Returns the closure result and the
    /// heads of the concurrent change.
    pub fn with_doc_mut_at<F, T>(
        &self,
        heads: &[ChangeHash],
        f: F,
    ) -> Result<(T, Vec<ChangeHash>), DocError>
    where
        F: FnOnce(&mut Automerge) -> T,
    {
        let (res, new_heads, changed) = {
            let mut shared = self.shared.write();
            shared.ensure_ready()?;
            let mut view = shared.automerge.fork_at(heads)?;
            let res = f(&mut view);
            let new_heads = view.get_heads();
            shared.automerge.merge(&mut view)?;
            let changed = shared.note_heads(true);
            (res, new_heads, changed)
        };
        if changed.is_some() {
            let _ = self
                .repo_sender
                .send(RepoEvent::DocChange(self.document_id));
        }
        Ok((res, new_heads))
    }

    /// The current heads of the document. Requires the handle to be ready.
    pub fn heads(&self) -> Result<Vec<ChangeHash>, DocError> {
        let shared = self.shared.read();
        shared.ensure_ready()?;
        Ok(shared.last_heads.clone())
    }

    /// A read-only copy of the document as it was at `heads`.
    pub fn view_at(&self, heads: &[ChangeHash]) -> Result<Automerge, DocError> {
        let shared = self.shared.read();
        shared.ensure_ready()?;
        Ok(shared.automerge.fork_at(heads)?)
    }

    /// The patches that take the document from `from` to `to`
    /// (the current heads if `to` is `None`).
    pub fn diff(
        &self,
        from: &[ChangeHash],
        to: Option<&[ChangeHash]>,
    ) -> Result<Vec<Patch>, DocError> {
        let shared = self.shared.write();
        shared.ensure_ready()?;
        let to = match to {
            Some(heads) => heads.to_vec(),
            None => shared.last_heads.clone(),
        };
        let from = from.to_vec();
        Ok(shared
            .automerge
            .diff(&from, &to, automerge::patches::TextRepresentation::default()))
    }

    /// Apply everything in `other`'s document into this one.
    /// Both handles must be ready.
    pub fn merge(&self, other: &DocHandle) -> Result<(), DocError> {
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return Ok(());
        }
        let mut fork = other.with_doc(|doc| doc.fork())?;
        let changed = {
            let mut shared = self.shared.write();
            shared.ensure_ready()?;
            shared.automerge.merge(&mut fork)?;
            shared.note_heads(true)
        };
        if changed.is_some() {
            let _ = self
                .repo_sender
                .send(RepoEvent::DocChange(self.document_id));
        }
        Ok(())
    }

    /// Broadcast an ephemeral payload to every peer this document is
    /// shared with. The payload is not persisted in the document.
    pub fn broadcast(&self, data: Vec<u8>) -> Result<(), DocError> {
        self.shared.read().ensure_ready()?;
        let _ = self.repo_sender.send(RepoEvent::Broadcast {
            document_id: self.document_id,
            data,
        });
        Ok(())
    }

    /// Subscribe to this handle's events.
    pub fn subscribe(&self) -> DocSubscription {
        let (token, receiver) = self.shared.write().listeners.subscribe();
        DocSubscription {
            token,
            receiver,
            shared: self.shared.clone(),
        }
    }

    /// A future resolving once the handle enters one of `states`, or
    /// erring once it is deleted. A handle that never reaches a matching
    /// state leaves the future pending.
    pub fn when_state(&self, states: &[HandleState]) -> RepoFuture<Result<(), DocError>> {
        let (fut, resolver) = new_repo_future_with_resolver();
        let mut shared = self.shared.write();
        if states.contains(&shared.state) {
            resolver.resolve(Ok(()));
        } else if shared.state == HandleState::Deleted {
            resolver.resolve(Err(DocError::Deleted));
        } else {
            shared.state_waiters.push(StateWaiter {
                states: states.to_vec(),
                resolver,
            });
        }
        fut
    }

    /// A future resolving once the handle is ready.
    pub fn when_ready(&self) -> RepoFuture<Result<(), DocError>> {
        self.when_state(&[HandleState::Ready])
    }

    /// Returns a future that will resolve when the document has changed,
    /// either via another handle, or by applying a sync message.
    pub fn changed(&self) -> RepoFuture<Result<(), DocError>> {
        let (fut, resolver) = new_repo_future_with_resolver();
        let mut shared = self.shared.write();
        if shared.state == HandleState::Deleted {
            resolver.resolve(Err(DocError::Deleted));
        } else {
            shared.change_waiters.push(resolver);
        }
        fut
    }

    /// The last known heads of a remote storage's copy of this document.
    pub fn remote_heads(&self, storage_id: &StorageId) -> Option<Vec<ChangeHash>> {
        self.shared.read().remote_heads.get(storage_id).cloned()
    }

    // --- transitions, driven by the repo ---

    pub(crate) fn setup_ready(&self, doc: Automerge) {
        let mut shared = self.shared.write();
        if shared.state != HandleState::Idle {
            return;
        }
        shared.last_heads = doc.get_heads();
        shared.automerge = doc;
        shared.transition(HandleState::Ready);
    }

    pub(crate) fn begin_load(&self) {
        let mut shared = self.shared.write();
        if shared.state == HandleState::Idle {
            shared.transition(HandleState::Loading);
        }
    }

    pub(crate) fn done_loading(&self, doc: Automerge) {
        let mut shared = self.shared.write();
        if shared.state != HandleState::Loading {
            return;
        }
        shared.automerge = doc;
        shared.note_heads(false);
        shared.transition(HandleState::Ready);
    }

    pub(crate) fn begin_request(&self) {
        let mut shared = self.shared.write();
        if shared.state == HandleState::Loading {
            shared.transition(HandleState::Requesting);
        }
    }

    /// REQUESTING (or a revisited UNAVAILABLE) became READY because a peer
    /// supplied the document.
    pub(crate) fn promote_to_ready(&self) {
        let mut shared = self.shared.write();
        if matches!(
            shared.state,
            HandleState::Requesting | HandleState::Unavailable
        ) {
            shared.transition(HandleState::Ready);
        }
    }

    pub(crate) fn mark_unavailable(&self) {
        let mut shared = self.shared.write();
        if shared.state == HandleState::Requesting {
            shared.transition(HandleState::Unavailable);
            shared.listeners.emit(DocHandleEvent::Unavailable);
        }
    }

    /// Re-announce unavailability to (new) subscribers of a cached handle.
    pub(crate) fn emit_unavailable(&self) {
        let mut shared = self.shared.write();
        if shared.state == HandleState::Unavailable {
            shared.listeners.emit(DocHandleEvent::Unavailable);
        }
    }

    pub(crate) fn unload(&self) {
        let mut shared = self.shared.write();
        if matches!(shared.state, HandleState::Ready | HandleState::Unavailable) {
            shared.transition(HandleState::Unloaded);
        }
    }

    pub(crate) fn reload(&self) {
        let mut shared = self.shared.write();
        if shared.state == HandleState::Unloaded {
            // The document was retained on unload.
            shared.transition(HandleState::Ready);
        }
    }

    pub(crate) fn mark_deleted(&self) {
        let mut shared = self.shared.write();
        shared.transition(HandleState::Deleted);
        shared.listeners.emit(DocHandleEvent::Delete);
    }

    pub(crate) fn set_remote_heads(&self, storage_id: StorageId, heads: Vec<ChangeHash>) {
        let mut shared = self.shared.write();
        if shared.remote_heads.get(&storage_id) == Some(&heads) {
            return;
        }
        shared
            .remote_heads
            .insert(storage_id.clone(), heads.clone());
        shared
            .listeners
            .emit(DocHandleEvent::RemoteHeads { storage_id, heads });
    }

    pub(crate) fn receive_ephemeral(&self, sender_id: PeerId, data: Vec<u8>) {
        self.shared
            .write()
            .listeners
            .emit(DocHandleEvent::EphemeralMessage { sender_id, data });
    }

    // --- sync plumbing, driven by the synchronizer ---

    pub(crate) fn generate_sync_message(&self, state: &mut sync::State) -> Option<Vec<u8>> {
        let shared = self.shared.read();
        shared
            .automerge
            .generate_sync_message(state)
            .map(|msg| msg.encode())
    }

    /// Feed an inbound sync message into the document. Returns whether the
    /// heads moved. Permitted while ready, requesting, or unavailable
    /// (a late peer may still supply the document).
    pub(crate) fn apply_sync_message(
        &self,
        state: &mut sync::State,
        data: &[u8],
    ) -> Result<bool, DocError> {
        let changed = {
            let mut shared = self.shared.write();
            match shared.state {
                HandleState::Ready | HandleState::Requesting | HandleState::Unavailable => {}
                HandleState::Deleted => return Err(DocError::Deleted),
                state => return Err(DocError::NotReady(state)),
            }
            let message = sync::Message::decode(data)
                .map_err(|err| DocError::BadSyncMessage(err.to_string()))?;
            shared.automerge.receive_sync_message(state, message)?;
            shared.note_heads(true)
        };
        if changed.is_some() {
            let _ = self
                .repo_sender
                .send(RepoEvent::DocChange(self.document_id));
        }
        Ok(changed.is_some())
    }

    pub(crate) fn document_is_empty(&self) -> bool {
        self.shared.read().last_heads.is_empty()
    }

    /// A fork of the document for persistence, in the states where the
    /// document value is defined.
    pub(crate) fn fork_for_save(&self) -> Option<Automerge> {
        let shared = self.shared.read();
        match shared.state {
            HandleState::Ready | HandleState::Unloaded => Some(shared.automerge.fork()),
            _ => None,
        }
    }

    /// The repo stopped; wake up anything still waiting on this handle.
    pub(crate) fn fail_waiters_on_shutdown(&self) {
        let mut shared = self.shared.write();
        for waiter in shared.state_waiters.drain(..) {
            waiter.resolver.resolve(Err(DocError::Shutdown));
        }
        for waiter in shared.change_waiters.drain(..) {
            waiter.resolve(Err(DocError::Shutdown));
        }
    }
}

/// A live subscription to a handle's events. Unsubscribes on drop.
pub struct DocSubscription {
    token: SubscriptionToken,
    receiver: Receiver<DocHandleEvent>,
    shared: Arc<RwLock<SharedDocument>>,
}

impl DocSubscription {
    pub fn try_recv(&self) -> Option<DocHandleEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<DocHandleEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn receiver(&self) -> &Receiver<DocHandleEvent> {
        &self.receiver
    }
}

impl Drop for DocSubscription {
    fn drop(&mut self) {
        self.shared.write().listeners.unsubscribe(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::transaction::Transactable;
    use futures::executor::block_on;

    fn handle() -> (DocHandle, Receiver<RepoEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = DocHandle::new(tx, DocumentId::random(), PeerId::from("test-peer"));
        (handle, rx)
    }

    #[test]
    fn mutation_requires_ready() {
        let (handle, _rx) = handle();
        handle.begin_load();
        let err = handle.with_doc_mut(|_| ()).unwrap_err();
        assert!(matches!(err, DocError::NotReady(HandleState::Loading)));
        handle.done_loading(Automerge::new());
        assert!(handle.with_doc_mut(|_| ()).is_ok());
    }

    #[test]
    fn change_emits_change_then_heads_changed() {
        let (handle, rx) = handle();
        handle.setup_ready(Automerge::new());
        let sub = handle.subscribe();
        handle
            .with_doc_mut(|doc| {
                let mut tx = doc.transaction();
                tx.put(automerge::ROOT, "n", 1).unwrap();
                tx.commit();
            })
            .unwrap();
        let heads = handle.heads().unwrap();
        assert_eq!(heads.len(), 1);
        match sub.try_recv().unwrap() {
            DocHandleEvent::Change { heads: h } => assert_eq!(h, heads),
            other => panic!("expected change, got {other:?}"),
        }
        match sub.try_recv().unwrap() {
            DocHandleEvent::HeadsChanged { heads: h } => assert_eq!(h, heads),
            other => panic!("expected heads-changed, got {other:?}"),
        }
        // The repo was told exactly once.
        assert!(matches!(rx.try_recv().unwrap(), RepoEvent::DocChange(_)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn no_events_when_heads_do_not_move() {
        let (handle, rx) = handle();
        handle.setup_ready(Automerge::new());
        let sub = handle.subscribe();
        handle.with_doc_mut(|_| ()).unwrap();
        assert!(sub.try_recv().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn change_at_produces_concurrent_heads() {
        let (handle, _rx) = handle();
        handle.setup_ready(Automerge::new());
        handle
            .with_doc_mut(|doc| {
                let mut tx = doc.transaction();
                tx.put(automerge::ROOT, "a", 1).unwrap();
                tx.commit();
            })
            .unwrap();
        let first = handle.heads().unwrap();
        handle
            .with_doc_mut(|doc| {
                let mut tx = doc.transaction();
                tx.put(automerge::ROOT, "b", 2).unwrap();
                tx.commit();
            })
            .unwrap();
        let (_, at_heads) = handle
            .with_doc_mut_at(&first, |doc| {
                let mut tx = doc.transaction();
                tx.put(automerge::ROOT, "c", 3).unwrap();
                tx.commit();
            })
            .unwrap();
        assert_ne!(at_heads, handle.heads().unwrap());
        // Both branches are in the merged document.
        assert_eq!(handle.heads().unwrap().len(), 2);
    }

    #[test]
    fn when_ready_resolves_on_transition() {
        let (handle, _rx) = handle();
        handle.begin_load();
        let fut = handle.when_ready();
        handle.done_loading(Automerge::new());
        block_on(fut).unwrap();
        // Already-ready resolves immediately.
        block_on(handle.when_ready()).unwrap();
    }

    #[test]
    fn delete_errors_waiters() {
        let (handle, _rx) = handle();
        handle.begin_load();
        let fut = handle.when_ready();
        let changed = handle.changed();
        handle.mark_deleted();
        assert!(matches!(block_on(fut), Err(DocError::Deleted)));
        assert!(matches!(block_on(changed), Err(DocError::Deleted)));
        assert!(handle.is_deleted());
    }

    #[test]
    fn merge_applies_other_documents_changes() {
        let (a, _rx_a) = handle();
        let (b, _rx_b) = handle();
        a.setup_ready(Automerge::new());
        let mut seed = Automerge::new();
        {
            let mut tx = seed.transaction();
            tx.put(automerge::ROOT, "from-b", 1).unwrap();
            tx.commit();
        }
        b.setup_ready(seed);
        a.merge(&b).unwrap();
        assert_eq!(a.heads().unwrap(), b.heads().unwrap());
    }

    #[test]
    fn unload_retains_document_for_reload() {
        let (handle, _rx) = handle();
        let mut seed = Automerge::new();
        {
            let mut tx = seed.transaction();
            tx.put(automerge::ROOT, "n", 1).unwrap();
            tx.commit();
        }
        handle.setup_ready(seed);
        let heads = handle.heads().unwrap();
        handle.unload();
        assert!(matches!(
            handle.with_doc(|_| ()).unwrap_err(),
            DocError::NotReady(HandleState::Unloaded)
        ));
        handle.reload();
        assert_eq!(handle.heads().unwrap(), heads);
    }

    #[test]
    fn sync_apply_promotes_requesting_handle() {
        let (source, _rx) = handle();
        let mut seed = Automerge::new();
        {
            let mut tx = seed.transaction();
            tx.put(automerge::ROOT, "n", 1).unwrap();
            tx.commit();
        }
        source.setup_ready(seed);

        let (requester, _rx2) = handle();
        requester.begin_load();
        requester.begin_request();

        // Run the sync protocol to completion between the two documents.
        let mut source_state = sync::State::new();
        let mut requester_state = sync::State::new();
        loop {
            let mut progressed = false;
            if let Some(data) = source.generate_sync_message(&mut source_state) {
                requester
                    .apply_sync_message(&mut requester_state, &data)
                    .unwrap();
                progressed = true;
            }
            if let Some(data) = requester.generate_sync_message(&mut requester_state) {
                source
                    .apply_sync_message(&mut source_state, &data)
                    .unwrap();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
        assert!(!requester.document_is_empty());
        requester.promote_to_ready();
        assert!(requester.is_ready());
        assert_eq!(requester.heads().unwrap(), source.heads().unwrap());
    }
}
