use crate::debounce::KeyedDebouncer;
use crate::dochandle::{DocError, DocHandle, HandleState};
use crate::interfaces::{
    DocumentId, InvalidDocumentId, NetworkAdapter, PeerId, PeerMetadata, StorageAdapter,
    StorageError, StorageId,
};
use crate::message::{RepoMessage, TimestampedHeads};
use crate::network::{InboundEvent, NetworkSubsystem};
use crate::remote_heads::{RemoteHeadsEvent, RemoteHeadsSubscriptions};
use crate::share_policy::{Permissive, SharePolicy};
use crate::storage::{LoadedDoc, StorageSubsystem, DEFAULT_COMPACTION_THRESHOLD};
use crate::synchronizer::{CollectionEvent, CollectionSynchronizer, SyncEvent};
use automerge::{sync, Automerge};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use futures::future::BoxFuture;
use futures::task::{waker, ArcWake};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// The default trailing-edge debounce for storage saves.
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(100);
/// The default trailing-edge debounce for outbound sync messages.
pub const DEFAULT_SYNC_DEBOUNCE: Duration = Duration::from_millis(100);

const IDLE_TICK: Duration = Duration::from_secs(60);

/// The error returned by repo operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("repo is shutting down")]
    Shutdown,
    #[error("document is unavailable")]
    Unavailable,
    #[error("cannot clone an empty document")]
    Empty,
    #[error(transparent)]
    BadDocumentId(#[from] InvalidDocumentId),
    #[error(transparent)]
    Doc(#[from] DocError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to load document: {0}")]
    Load(#[from] automerge::AutomergeError),
}

// --- one-shot futures fulfilled by the repo ---

struct FutureShared<T> {
    result: Option<T>,
    waker: Option<Waker>,
}

/// A one-shot future resolved by the repo's event loop (or by a handle
/// transition).
pub struct RepoFuture<T> {
    shared: Arc<Mutex<FutureShared<T>>>,
}

impl<T> Future for RepoFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut shared = self.shared.lock();
        match shared.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// The resolving end of a [`RepoFuture`].
pub(crate) struct RepoFutureResolver<T> {
    shared: Arc<Mutex<FutureShared<T>>>,
}

impl<T> RepoFutureResolver<T> {
    pub(crate) fn resolve(self, result: T) {
        let mut shared = self.shared.lock();
        shared.result = Some(result);
        if let Some(waker) = shared.waker.take() {
            waker.wake();
        }
    }
}

pub(crate) fn new_repo_future_with_resolver<T>() -> (RepoFuture<T>, RepoFutureResolver<T>) {
    let shared = Arc::new(Mutex::new(FutureShared {
        result: None,
        waker: None,
    }));
    (
        RepoFuture {
            shared: shared.clone(),
        },
        RepoFutureResolver { shared },
    )
}

// --- events and wake signals ---

/// Events sent to the repo's event loop by handles and repo handles.
pub(crate) enum RepoEvent {
    /// A freshly created (or imported) document was put in the cache.
    NewDoc(DocumentId),
    /// A find put a loading handle in the cache, or hit a cached one.
    FindDoc(DocumentId, Option<Duration>),
    /// A handle's heads moved.
    DocChange(DocumentId),
    Broadcast {
        document_id: DocumentId,
        data: Vec<u8>,
    },
    Delete(DocumentId),
    RemoveFromCache(DocumentId),
    Flush {
        document_ids: Option<Vec<DocumentId>>,
        resolver: RepoFutureResolver<Result<(), RepoError>>,
    },
    AddAdapter(Box<dyn NetworkAdapter>),
    SubscribeRemotes(Vec<StorageId>),
    UnsubscribeRemotes(Vec<StorageId>),
    Stop,
}

#[derive(Debug, Clone, Copy)]
enum WakeSignal {
    Network(usize),
    Storage(u64),
    SharePolicy(u64),
}

struct RepoWaker {
    sender: Sender<WakeSignal>,
    signal: WakeSignal,
}

impl ArcWake for RepoWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let _ = arc_self.sender.send(arc_self.signal);
    }
}

enum TaskResult {
    DocLoaded {
        document_id: DocumentId,
        result: Result<Option<LoadedDoc>, StorageError>,
    },
    SaveDone {
        document_id: DocumentId,
        result: Result<(), StorageError>,
    },
    RemoveDone {
        document_id: DocumentId,
        result: Result<(), StorageError>,
    },
    SyncStateLoaded {
        document_id: DocumentId,
        peer_id: PeerId,
        result: Result<Option<sync::State>, StorageError>,
    },
    SyncStateSaved {
        result: Result<(), StorageError>,
    },
}

struct StorageTask {
    fut: BoxFuture<'static, TaskResult>,
    waker: Waker,
}

#[derive(Debug, Clone)]
enum PolicyPurpose {
    BeginSync {
        document_id: DocumentId,
        peer_id: PeerId,
    },
    Generous {
        peer_id: PeerId,
    },
}

struct PolicyTask {
    fut: BoxFuture<'static, bool>,
    waker: Waker,
    purpose: PolicyPurpose,
}

struct FlushWaiter {
    pending: HashSet<u64>,
    failed: Option<StorageError>,
    resolver: RepoFutureResolver<Result<(), RepoError>>,
}

/// The document coordinator: owns the handle cache and, for each handle,
/// orchestrates storage, peer discovery, and per-document sync.
///
/// Construct, configure with the `with_*` methods, then [`Repo::run`] to
/// obtain a cloneable [`RepoHandle`] while the event loop runs on its own
/// thread.
pub struct Repo {
    local_peer_id: PeerId,
    handles: Arc<RwLock<HashMap<DocumentId, DocHandle>>>,
    repo_sender: Sender<RepoEvent>,
    repo_receiver: Receiver<RepoEvent>,
    wake_sender: Sender<WakeSignal>,
    wake_receiver: Receiver<WakeSignal>,
    storage: Option<StorageSubsystem>,
    network: NetworkSubsystem,
    network_wakers: Vec<Waker>,
    collection: CollectionSynchronizer,
    remote_heads: RemoteHeadsSubscriptions,
    share_policy: Box<dyn SharePolicy>,
    peer_metadata: HashMap<PeerId, PeerMetadata>,
    is_ephemeral: bool,
    gossip_enabled: bool,
    request_timeout: Option<Duration>,

    save_debouncer: KeyedDebouncer<DocumentId>,
    sync_debouncer: KeyedDebouncer<(DocumentId, PeerId)>,
    sync_state_debouncer: KeyedDebouncer<StorageId>,
    pending_sync_state_saves: HashMap<StorageId, HashSet<(DocumentId, PeerId)>>,

    request_deadlines: HashMap<DocumentId, Instant>,
    request_timeouts: HashMap<DocumentId, Duration>,
    pending_network_ready: Vec<DocumentId>,

    next_task_id: u64,
    storage_tasks: HashMap<u64, StorageTask>,
    policy_tasks: HashMap<u64, PolicyTask>,
    flush_waiters: Vec<FlushWaiter>,
    stopping: bool,
}

impl Repo {
    /// Create a repo with an optional peer id (a random one otherwise)
    /// and an optional storage backend.
    pub fn new(peer_id: Option<String>, storage: Option<Box<dyn StorageAdapter>>) -> Self {
        let local_peer_id = peer_id.map(PeerId).unwrap_or_else(PeerId::random);
        let (repo_sender, repo_receiver) = unbounded();
        let (wake_sender, wake_receiver) = unbounded();
        Repo {
            collection: CollectionSynchronizer::new(local_peer_id.clone()),
            network: NetworkSubsystem::new(local_peer_id.clone()),
            network_wakers: Vec::new(),
            local_peer_id,
            handles: Arc::new(RwLock::new(HashMap::new())),
            repo_sender,
            repo_receiver,
            wake_sender,
            wake_receiver,
            storage: storage
                .map(|adapter| StorageSubsystem::new(adapter.into(), DEFAULT_COMPACTION_THRESHOLD)),
            remote_heads: RemoteHeadsSubscriptions::new(),
            share_policy: Box::new(Permissive),
            peer_metadata: HashMap::new(),
            is_ephemeral: false,
            gossip_enabled: true,
            request_timeout: None,
            save_debouncer: KeyedDebouncer::new(DEFAULT_SAVE_DEBOUNCE),
            sync_debouncer: KeyedDebouncer::new(DEFAULT_SYNC_DEBOUNCE),
            sync_state_debouncer: KeyedDebouncer::new(DEFAULT_SAVE_DEBOUNCE),
            pending_sync_state_saves: HashMap::new(),
            request_deadlines: HashMap::new(),
            request_timeouts: HashMap::new(),
            pending_network_ready: Vec::new(),
            next_task_id: 0,
            storage_tasks: HashMap::new(),
            policy_tasks: HashMap::new(),
            flush_waiters: Vec::new(),
            stopping: false,
        }
    }

    pub fn with_share_policy(mut self, policy: impl SharePolicy) -> Self {
        self.share_policy = Box::new(policy);
        self
    }

    pub fn with_save_debounce_rate(mut self, rate: Duration) -> Self {
        self.save_debouncer = KeyedDebouncer::new(rate);
        self.sync_state_debouncer = KeyedDebouncer::new(rate);
        self
    }

    pub fn with_sync_debounce_rate(mut self, rate: Duration) -> Self {
        self.sync_debouncer = KeyedDebouncer::new(rate);
        self
    }

    /// Default REQUESTING timeout applied to every find that does not
    /// set its own.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_remote_heads_gossip(mut self, enabled: bool) -> Self {
        self.gossip_enabled = enabled;
        self
    }

    /// An ephemeral repo never announces a storage id, so peers will not
    /// persist sync states for it.
    pub fn with_ephemerality(mut self, is_ephemeral: bool) -> Self {
        self.is_ephemeral = is_ephemeral;
        self
    }

    pub fn with_network_adapter(mut self, adapter: Box<dyn NetworkAdapter>) -> Self {
        self.register_adapter(adapter);
        self
    }

    fn register_adapter(&mut self, adapter: Box<dyn NetworkAdapter>) -> usize {
        let index = self.network.add_adapter(adapter);
        self.network_wakers.push(waker(Arc::new(RepoWaker {
            sender: self.wake_sender.clone(),
            signal: WakeSignal::Network(index),
        })));
        index
    }

    /// Run the repo's event loop in the background.
    pub fn run(self) -> RepoHandle {
        let repo_sender = self.repo_sender.clone();
        let handles = self.handles.clone();
        let local_peer_id = self.local_peer_id.clone();
        let storage_id = self.storage.as_ref().map(StorageSubsystem::id);
        let is_ephemeral = self.is_ephemeral;
        let join = std::thread::spawn(move || self.event_loop());
        RepoHandle {
            repo_sender,
            handles,
            local_peer_id,
            storage_id,
            is_ephemeral,
            join: Arc::new(Mutex::new(Some(join))),
        }
    }

    // --- the event loop ---

    fn event_loop(mut self) {
        tracing::info!(peer_id = %self.local_peer_id, "repo event loop starting");
        for index in 0..self.network.adapter_count() {
            self.poll_adapter(index);
        }
        loop {
            let timeout = self
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_TICK);
            select! {
                recv(self.repo_receiver) -> event => {
                    if let Ok(event) = event {
                        self.handle_repo_event(event);
                    }
                }
                recv(self.wake_receiver) -> signal => {
                    if let Ok(signal) = signal {
                        self.handle_wake(signal);
                    }
                }
                default(timeout) => {}
            }
            while let Ok(event) = self.repo_receiver.try_recv() {
                self.handle_repo_event(event);
            }
            while let Ok(signal) = self.wake_receiver.try_recv() {
                self.handle_wake(signal);
            }
            self.fire_timers();
            if self.stopping && self.shutdown_complete() {
                break;
            }
        }
        for waiter in self.flush_waiters.drain(..) {
            waiter.resolver.resolve(Err(RepoError::Shutdown));
        }
        for handle in self.handles.read().values() {
            handle.fail_waiters_on_shutdown();
        }
        tracing::info!(peer_id = %self.local_peer_id, "repo event loop stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.save_debouncer.next_deadline(),
            self.sync_debouncer.next_deadline(),
            self.sync_state_debouncer.next_deadline(),
            self.request_deadlines.values().min().copied(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for document_id in self.save_debouncer.take_due(now) {
            self.save_doc_now(document_id);
        }
        for (document_id, peer_id) in self.sync_debouncer.take_due(now) {
            if let Some(message) = self.collection.produce_sync_message(&document_id, &peer_id) {
                self.send_message(message);
            }
        }
        for storage_id in self.sync_state_debouncer.take_due(now) {
            self.fire_sync_state_save(storage_id);
        }
        let due: Vec<DocumentId> = self
            .request_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for document_id in due {
            self.request_deadlines.remove(&document_id);
            let events = self.collection.request_timed_out(&document_id);
            self.process_collection_events(events);
        }
    }

    fn handle_repo_event(&mut self, event: RepoEvent) {
        match event {
            RepoEvent::NewDoc(document_id) => {
                let Some(handle) = self.cached_handle(&document_id) else {
                    return;
                };
                let candidates = self.collection.add_document(document_id, handle.clone());
                for candidate in candidates {
                    self.spawn_policy(PolicyPurpose::BeginSync {
                        document_id: candidate.document_id,
                        peer_id: candidate.peer_id,
                    });
                }
                if !handle.document_is_empty() {
                    self.save_debouncer.touch(document_id);
                }
            }
            RepoEvent::FindDoc(document_id, timeout) => self.handle_find(document_id, timeout),
            RepoEvent::DocChange(document_id) => {
                self.save_debouncer.touch(document_id);
                let events = self.collection.document_changed(&document_id);
                self.process_collection_events(events);
            }
            RepoEvent::Broadcast { document_id, data } => {
                let targets = self.collection.document_peers(&document_id);
                let touched = self.network.send_ephemeral(document_id, targets, data);
                for index in touched {
                    self.pump_adapter(index);
                }
            }
            RepoEvent::Delete(document_id) => self.handle_delete(document_id),
            RepoEvent::RemoveFromCache(document_id) => self.handle_remove_from_cache(document_id),
            RepoEvent::Flush {
                document_ids,
                resolver,
            } => self.handle_flush(document_ids, resolver),
            RepoEvent::AddAdapter(adapter) => {
                let index = self.register_adapter(adapter);
                self.poll_adapter(index);
            }
            RepoEvent::SubscribeRemotes(storage_ids) => {
                if self.gossip_enabled {
                    let events = self.remote_heads.subscribe_to_remotes(storage_ids);
                    self.process_remote_heads_events(events);
                }
            }
            RepoEvent::UnsubscribeRemotes(storage_ids) => {
                if self.gossip_enabled {
                    let events = self.remote_heads.unsubscribe_from_remotes(storage_ids);
                    self.process_remote_heads_events(events);
                }
            }
            RepoEvent::Stop => self.begin_shutdown(),
        }
    }

    fn cached_handle(&self, document_id: &DocumentId) -> Option<DocHandle> {
        self.handles.read().get(document_id).cloned()
    }

    fn handle_find(&mut self, document_id: DocumentId, timeout: Option<Duration>) {
        let Some(handle) = self.cached_handle(&document_id) else {
            return;
        };
        match handle.state() {
            HandleState::Unavailable => {
                // A later scheduling turn than the find itself, so the
                // caller has had a chance to subscribe.
                handle.emit_unavailable();
            }
            HandleState::Loading => {
                if let Some(timeout) = timeout.or(self.request_timeout) {
                    self.request_timeouts.insert(document_id, timeout);
                }
                let candidates = self.collection.add_document(document_id, handle.clone());
                for candidate in candidates {
                    self.spawn_policy(PolicyPurpose::BeginSync {
                        document_id: candidate.document_id,
                        peer_id: candidate.peer_id,
                    });
                }
                let load = self.storage.as_ref().map(|s| s.load_doc(document_id));
                match load {
                    Some(fut) => {
                        self.spawn_storage_task(Box::pin(async move {
                            TaskResult::DocLoaded {
                                document_id,
                                result: fut.await,
                            }
                        }));
                    }
                    None => self.storage_missed(document_id),
                }
            }
            _ => {}
        }
    }

    /// The document is not in storage; ask the network once it is ready.
    fn storage_missed(&mut self, document_id: DocumentId) {
        if self.network.is_ready() {
            self.enter_requesting(document_id);
        } else {
            self.pending_network_ready.push(document_id);
        }
    }

    fn enter_requesting(&mut self, document_id: DocumentId) {
        let Some(handle) = self.cached_handle(&document_id) else {
            return;
        };
        handle.begin_request();
        if let Some(timeout) = self.request_timeouts.get(&document_id) {
            self.request_deadlines
                .insert(document_id, Instant::now() + *timeout);
        }
        let events = self.collection.document_state_changed(&document_id);
        self.process_collection_events(events);
    }

    fn handle_delete(&mut self, document_id: DocumentId) {
        let handle = self.handles.write().remove(&document_id);
        let Some(handle) = handle else {
            return;
        };
        handle.mark_deleted();
        self.collection.remove_document(&document_id);
        self.remote_heads.remove_document(&document_id);
        self.drop_pending_work(&document_id);
        let remove = self.storage.as_mut().map(|s| s.remove_doc(document_id));
        if let Some(fut) = remove {
            self.spawn_storage_task(Box::pin(async move {
                TaskResult::RemoveDone {
                    document_id,
                    result: fut.await,
                }
            }));
        }
        tracing::info!(%document_id, "document deleted");
    }

    fn handle_remove_from_cache(&mut self, document_id: DocumentId) {
        let Some(handle) = self.cached_handle(&document_id) else {
            return;
        };
        match handle.state() {
            HandleState::Ready => handle.unload(),
            HandleState::Unloaded | HandleState::Deleted | HandleState::Unavailable => {}
            state => {
                tracing::warn!(
                    %document_id,
                    ?state,
                    "refusing to evict a handle that is still loading"
                );
                return;
            }
        }
        self.handles.write().remove(&document_id);
        self.collection.remove_document(&document_id);
        self.remote_heads.remove_document(&document_id);
        self.drop_pending_work(&document_id);
    }

    fn drop_pending_work(&mut self, document_id: &DocumentId) {
        self.save_debouncer.cancel(document_id);
        self.sync_debouncer
            .cancel_matching(|(id, _)| id == document_id);
        self.request_deadlines.remove(document_id);
        self.request_timeouts.remove(document_id);
        self.pending_network_ready.retain(|id| id != document_id);
        for pending in self.pending_sync_state_saves.values_mut() {
            pending.retain(|(id, _)| id != document_id);
        }
    }

    fn handle_flush(
        &mut self,
        document_ids: Option<Vec<DocumentId>>,
        resolver: RepoFutureResolver<Result<(), RepoError>>,
    ) {
        if self.storage.is_none() {
            resolver.resolve(Ok(()));
            return;
        }
        let ids = document_ids
            .unwrap_or_else(|| self.handles.read().keys().copied().collect());
        let mut pending = HashSet::new();
        for document_id in ids {
            self.save_debouncer.cancel(&document_id);
            if let Some(task_id) = self.save_doc_now(document_id) {
                pending.insert(task_id);
            }
        }
        if pending.is_empty() {
            resolver.resolve(Ok(()));
        } else {
            self.flush_waiters.push(FlushWaiter {
                pending,
                failed: None,
                resolver,
            });
        }
    }

    /// Persist a document immediately. Returns the storage task id when a
    /// write was actually issued.
    fn save_doc_now(&mut self, document_id: DocumentId) -> Option<u64> {
        let storage = self.storage.as_mut()?;
        let handle = self.handles.read().get(&document_id).cloned()?;
        let doc = handle.fork_for_save()?;
        let fut = storage.save_doc(document_id, &doc)?;
        Some(self.spawn_storage_task(Box::pin(async move {
            TaskResult::SaveDone {
                document_id,
                result: fut.await,
            }
        })))
    }

    fn fire_sync_state_save(&mut self, storage_id: StorageId) {
        let Some(pending) = self.pending_sync_state_saves.remove(&storage_id) else {
            return;
        };
        for (document_id, peer_id) in pending {
            let Some(state) = self.collection.sync_state_for(&document_id, &peer_id) else {
                continue;
            };
            let Some(storage) = &self.storage else {
                return;
            };
            let fut = storage.save_sync_state(document_id, &storage_id, state);
            self.spawn_storage_task(Box::pin(async move {
                TaskResult::SyncStateSaved { result: fut.await }
            }));
        }
    }

    // --- wake handling ---

    fn handle_wake(&mut self, signal: WakeSignal) {
        match signal {
            WakeSignal::Network(index) => self.poll_adapter(index),
            WakeSignal::Storage(task_id) => self.poll_storage_task(task_id),
            WakeSignal::SharePolicy(task_id) => self.poll_policy_task(task_id),
        }
    }

    fn poll_adapter(&mut self, index: usize) {
        let Some(adapter_waker) = self.network_wakers.get(index).cloned() else {
            return;
        };
        let mut cx = Context::from_waker(&adapter_waker);
        let events = self.network.poll_events(index, &mut cx);
        for event in events {
            self.handle_inbound(event);
        }
        self.network.pump_outbox(index, &mut cx);
    }

    fn pump_adapter(&mut self, index: usize) {
        let Some(adapter_waker) = self.network_wakers.get(index).cloned() else {
            return;
        };
        let mut cx = Context::from_waker(&adapter_waker);
        self.network.pump_outbox(index, &mut cx);
    }

    fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::AdapterReady => {
                if self.network.is_ready() {
                    let waiting: Vec<DocumentId> = self.pending_network_ready.drain(..).collect();
                    for document_id in waiting {
                        self.enter_requesting(document_id);
                    }
                }
            }
            InboundEvent::Peer { peer_id, metadata } => {
                tracing::info!(%peer_id, "new peer");
                self.peer_metadata.insert(peer_id.clone(), metadata);
                let candidates = self.collection.add_peer(peer_id.clone());
                for candidate in candidates {
                    self.spawn_policy(PolicyPurpose::BeginSync {
                        document_id: candidate.document_id,
                        peer_id: candidate.peer_id,
                    });
                }
                if self.gossip_enabled {
                    self.spawn_policy(PolicyPurpose::Generous { peer_id });
                }
            }
            InboundEvent::PeerDisconnected { peer_id } => self.peer_gone(&peer_id),
            InboundEvent::AdapterClosed { disconnected } => {
                for peer_id in disconnected {
                    self.peer_gone(&peer_id);
                }
            }
            InboundEvent::Message(message) => self.handle_message(message),
        }
    }

    fn peer_gone(&mut self, peer_id: &PeerId) {
        tracing::info!(%peer_id, "peer disconnected");
        self.collection.remove_peer(peer_id);
        self.remote_heads.remove_peer(peer_id);
        self.peer_metadata.remove(peer_id);
        self.sync_debouncer.cancel_matching(|(_, p)| p == peer_id);
    }

    fn handle_message(&mut self, message: RepoMessage) {
        match message {
            RepoMessage::RemoteSubscriptionChange {
                sender_id,
                add,
                remove,
                ..
            } => {
                if self.gossip_enabled {
                    let events = self.remote_heads.handle_control_message(sender_id, add, remove);
                    self.process_remote_heads_events(events);
                }
            }
            RepoMessage::RemoteHeadsChanged {
                sender_id,
                document_id,
                new_heads,
                ..
            } => {
                if self.gossip_enabled {
                    let events =
                        self.remote_heads
                            .handle_remote_heads(document_id, &sender_id, new_heads);
                    self.process_remote_heads_events(events);
                }
            }
            message => {
                let Some(document_id) = message.document_id().copied() else {
                    return;
                };
                self.ensure_document(document_id);
                let (events, candidates) = self.collection.receive_message(message);
                self.process_collection_events(events);
                for candidate in candidates {
                    self.spawn_policy(PolicyPurpose::BeginSync {
                        document_id: candidate.document_id,
                        peer_id: candidate.peer_id,
                    });
                }
            }
        }
    }

    /// A message referenced a document we have no handle for: create one
    /// lazily and run it through the normal loading path.
    fn ensure_document(&mut self, document_id: DocumentId) {
        if self.collection.has_document(&document_id) {
            return;
        }
        {
            let mut cache = self.handles.write();
            if !cache.contains_key(&document_id) {
                let handle = DocHandle::new(
                    self.repo_sender.clone(),
                    document_id,
                    self.local_peer_id.clone(),
                );
                handle.begin_load();
                cache.insert(document_id, handle);
            }
        }
        self.handle_find(document_id, None);
    }

    fn process_collection_events(&mut self, events: Vec<CollectionEvent>) {
        for CollectionEvent { document_id, event } in events {
            match event {
                SyncEvent::Message(message) => self.send_message(message),
                SyncEvent::ScheduleSync { peer_id } => {
                    self.sync_debouncer.touch((document_id, peer_id));
                }
                SyncEvent::SyncStateChanged {
                    peer_id,
                    their_heads,
                } => self.sync_state_changed(document_id, peer_id, their_heads),
                SyncEvent::OpenDoc { peer_id } => {
                    tracing::trace!(%document_id, %peer_id, "first exchange with peer");
                    if self.gossip_enabled {
                        let events = self
                            .remote_heads
                            .subscribe_peer_to_doc(peer_id, document_id);
                        self.process_remote_heads_events(events);
                    }
                }
            }
        }
    }

    fn sync_state_changed(
        &mut self,
        document_id: DocumentId,
        peer_id: PeerId,
        their_heads: Vec<automerge::ChangeHash>,
    ) {
        let Some(metadata) = self.peer_metadata.get(&peer_id).cloned() else {
            return;
        };
        let Some(storage_id) = metadata.storage_id else {
            return;
        };
        if !metadata.is_ephemeral && self.storage.is_some() {
            self.pending_sync_state_saves
                .entry(storage_id.clone())
                .or_default()
                .insert((document_id, peer_id));
            self.sync_state_debouncer.touch(storage_id.clone());
        }
        if let Some(handle) = self.cached_handle(&document_id) {
            handle.set_remote_heads(storage_id.clone(), their_heads.clone());
        }
        if self.gossip_enabled {
            let events = self.remote_heads.handle_immediate_remote_heads(
                document_id,
                storage_id,
                TimestampedHeads {
                    heads: their_heads,
                    timestamp: now_millis(),
                },
            );
            self.process_remote_heads_events(events);
        }
    }

    fn process_remote_heads_events(&mut self, events: Vec<RemoteHeadsEvent>) {
        for event in events {
            match event {
                RemoteHeadsEvent::ChangeRemoteSubs { peers, add, remove } => {
                    for target_id in peers {
                        self.send_message(RepoMessage::RemoteSubscriptionChange {
                            sender_id: self.local_peer_id.clone(),
                            target_id,
                            add: add.clone(),
                            remove: remove.clone(),
                        });
                    }
                }
                RemoteHeadsEvent::NotifyRemoteHeads {
                    target,
                    document_id,
                    storage_id,
                    heads,
                } => {
                    self.send_message(RepoMessage::RemoteHeadsChanged {
                        sender_id: self.local_peer_id.clone(),
                        target_id: target,
                        document_id,
                        new_heads: [(storage_id, heads)].into(),
                    });
                }
                RemoteHeadsEvent::RemoteHeadsChanged {
                    document_id,
                    storage_id,
                    heads,
                } => {
                    if let Some(handle) = self.cached_handle(&document_id) {
                        handle.set_remote_heads(storage_id, heads.heads);
                    }
                }
            }
        }
    }

    fn send_message(&mut self, message: RepoMessage) {
        if let Some(index) = self.network.send(message) {
            self.pump_adapter(index);
        }
    }

    // --- cooperative task driving ---

    fn spawn_storage_task(&mut self, fut: BoxFuture<'static, TaskResult>) -> u64 {
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        let task_waker = waker(Arc::new(RepoWaker {
            sender: self.wake_sender.clone(),
            signal: WakeSignal::Storage(task_id),
        }));
        self.storage_tasks.insert(
            task_id,
            StorageTask {
                fut,
                waker: task_waker,
            },
        );
        self.poll_storage_task(task_id);
        task_id
    }

    fn poll_storage_task(&mut self, task_id: u64) {
        let Some(task) = self.storage_tasks.get_mut(&task_id) else {
            return;
        };
        let task_waker = task.waker.clone();
        let mut cx = Context::from_waker(&task_waker);
        match task.fut.as_mut().poll(&mut cx) {
            Poll::Ready(result) => {
                self.storage_tasks.remove(&task_id);
                self.handle_task_result(task_id, result);
            }
            Poll::Pending => {}
        }
    }

    fn handle_task_result(&mut self, task_id: u64, result: TaskResult) {
        match result {
            TaskResult::DocLoaded {
                document_id,
                result,
            } => {
                match result {
                    Ok(Some(loaded)) => {
                        if let Some(storage) = &mut self.storage {
                            storage.note_loaded(document_id, &loaded);
                        }
                        if let Some(handle) = self.cached_handle(&document_id) {
                            handle.done_loading(loaded.doc);
                        }
                        let events = self.collection.document_state_changed(&document_id);
                        self.process_collection_events(events);
                    }
                    Ok(None) => self.storage_missed(document_id),
                    Err(err) => {
                        tracing::warn!(%document_id, %err, "storage load failed; requesting from the network");
                        self.storage_missed(document_id);
                    }
                }
            }
            TaskResult::SaveDone {
                document_id,
                result,
            } => {
                let failure = result.err();
                if let Some(err) = &failure {
                    tracing::warn!(%document_id, %err, "storage save failed");
                }
                self.settle_flush_waiters(task_id, failure);
            }
            TaskResult::RemoveDone {
                document_id,
                result,
            } => {
                if let Err(err) = result {
                    tracing::warn!(%document_id, %err, "storage remove failed");
                }
            }
            TaskResult::SyncStateLoaded {
                document_id,
                peer_id,
                result,
            } => {
                let stored = match result {
                    Ok(stored) => stored,
                    Err(err) => {
                        tracing::warn!(%document_id, %peer_id, %err, "sync state load failed");
                        None
                    }
                };
                let events = self.collection.begin_sync(document_id, peer_id, stored);
                self.process_collection_events(events);
            }
            TaskResult::SyncStateSaved { result } => {
                if let Err(err) = result {
                    tracing::warn!(%err, "sync state save failed");
                }
            }
        }
    }

    fn settle_flush_waiters(&mut self, task_id: u64, failure: Option<StorageError>) {
        let mut resolved = Vec::new();
        for (index, waiter) in self.flush_waiters.iter_mut().enumerate() {
            if !waiter.pending.remove(&task_id) {
                continue;
            }
            if let Some(err) = &failure {
                waiter.failed = Some(err.clone());
            }
            if waiter.pending.is_empty() {
                resolved.push(index);
            }
        }
        for index in resolved.into_iter().rev() {
            let waiter = self.flush_waiters.remove(index);
            match waiter.failed {
                Some(err) => waiter.resolver.resolve(Err(RepoError::Storage(err))),
                None => waiter.resolver.resolve(Ok(())),
            }
        }
    }

    fn spawn_policy(&mut self, purpose: PolicyPurpose) {
        let fut = match &purpose {
            PolicyPurpose::BeginSync {
                document_id,
                peer_id,
            } => self.share_policy.should_share(peer_id, Some(document_id)),
            PolicyPurpose::Generous { peer_id } => self.share_policy.should_share(peer_id, None),
        };
        let task_id = self.next_task_id;
        self.next_task_id += 1;
        let task_waker = waker(Arc::new(RepoWaker {
            sender: self.wake_sender.clone(),
            signal: WakeSignal::SharePolicy(task_id),
        }));
        self.policy_tasks.insert(
            task_id,
            PolicyTask {
                fut,
                waker: task_waker,
                purpose,
            },
        );
        self.poll_policy_task(task_id);
    }

    fn poll_policy_task(&mut self, task_id: u64) {
        let Some(task) = self.policy_tasks.get_mut(&task_id) else {
            return;
        };
        let task_waker = task.waker.clone();
        let mut cx = Context::from_waker(&task_waker);
        match task.fut.as_mut().poll(&mut cx) {
            Poll::Ready(share) => {
                let purpose = task.purpose.clone();
                self.policy_tasks.remove(&task_id);
                if share {
                    self.policy_allowed(purpose);
                }
            }
            Poll::Pending => {}
        }
    }

    fn policy_allowed(&mut self, purpose: PolicyPurpose) {
        match purpose {
            PolicyPurpose::BeginSync {
                document_id,
                peer_id,
            } => {
                let stored_sync_state_available = self.storage.is_some()
                    && self
                        .peer_metadata
                        .get(&peer_id)
                        .map(|m| !m.is_ephemeral && m.storage_id.is_some())
                        .unwrap_or(false);
                if stored_sync_state_available {
                    let storage_id = self
                        .peer_metadata
                        .get(&peer_id)
                        .and_then(|m| m.storage_id.clone());
                    let load = match (&self.storage, storage_id) {
                        (Some(storage), Some(storage_id)) => {
                            Some(storage.load_sync_state(document_id, storage_id))
                        }
                        _ => None,
                    };
                    if let Some(fut) = load {
                        let peer_id = peer_id.clone();
                        self.spawn_storage_task(Box::pin(async move {
                            TaskResult::SyncStateLoaded {
                                document_id,
                                peer_id,
                                result: fut.await,
                            }
                        }));
                        return;
                    }
                }
                let events = self.collection.begin_sync(document_id, peer_id, None);
                self.process_collection_events(events);
            }
            PolicyPurpose::Generous { peer_id } => {
                let events = self.remote_heads.add_generous_peer(peer_id);
                self.process_remote_heads_events(events);
            }
        }
    }

    // --- shutdown ---

    fn begin_shutdown(&mut self) {
        if self.stopping {
            return;
        }
        tracing::info!(peer_id = %self.local_peer_id, "repo shutting down");
        self.stopping = true;
        self.policy_tasks.clear();
        self.save_debouncer.take_all();
        let ids: Vec<DocumentId> = self.handles.read().keys().copied().collect();
        for document_id in ids {
            self.save_doc_now(document_id);
        }
        for storage_id in self.sync_state_debouncer.take_all() {
            self.fire_sync_state_save(storage_id);
        }
        // Pending outbound syncs go out one last time before the
        // adapters close.
        for (document_id, peer_id) in self.sync_debouncer.take_all() {
            if let Some(message) = self.collection.produce_sync_message(&document_id, &peer_id) {
                self.send_message(message);
            }
        }
    }

    fn shutdown_complete(&mut self) -> bool {
        if !self.storage_tasks.is_empty() {
            return false;
        }
        for index in 0..self.network.adapter_count() {
            self.pump_adapter(index);
        }
        if self.network.has_pending_sends() {
            return false;
        }
        let mut all_closed = true;
        for index in 0..self.network.adapter_count() {
            let Some(adapter_waker) = self.network_wakers.get(index).cloned() else {
                continue;
            };
            let mut cx = Context::from_waker(&adapter_waker);
            if !self.network.poll_close(index, &mut cx) {
                all_closed = false;
            }
        }
        all_closed
    }
}

/// A cloneable handle onto a running repo.
#[derive(Clone)]
pub struct RepoHandle {
    repo_sender: Sender<RepoEvent>,
    handles: Arc<RwLock<HashMap<DocumentId, DocHandle>>>,
    local_peer_id: PeerId,
    storage_id: Option<StorageId>,
    is_ephemeral: bool,
    join: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl RepoHandle {
    pub fn peer_id(&self) -> PeerId {
        self.local_peer_id.clone()
    }

    /// The storage backend's id, if the repo has one.
    pub fn storage_id(&self) -> Option<StorageId> {
        self.storage_id.clone()
    }

    /// The metadata this repo announces to peers at connection setup.
    pub fn peer_metadata(&self) -> PeerMetadata {
        PeerMetadata {
            storage_id: self.storage_id.clone(),
            is_ephemeral: self.is_ephemeral || self.storage_id.is_none(),
        }
    }

    /// Create a new, empty document, ready for editing.
    pub fn new_document(&self) -> DocHandle {
        self.install_ready_document(Automerge::new())
    }

    /// Create a new document seeded by the closure.
    pub fn new_document_with<F>(&self, f: F) -> DocHandle
    where
        F: FnOnce(&mut Automerge),
    {
        let mut doc = Automerge::new();
        f(&mut doc);
        self.install_ready_document(doc)
    }

    /// Create a document from a serialized automerge document.
    pub fn import_document(&self, bytes: &[u8]) -> Result<DocHandle, RepoError> {
        let doc = Automerge::load(bytes)?;
        Ok(self.install_ready_document(doc))
    }

    /// Mint a new document carrying the full history of `source`.
    /// The source must be ready and non-empty.
    pub fn clone_document(&self, source: &DocHandle) -> Result<DocHandle, RepoError> {
        let doc = source.with_doc(|doc| doc.fork())?;
        if doc.get_heads().is_empty() {
            return Err(RepoError::Empty);
        }
        Ok(self.install_ready_document(doc))
    }

    fn install_ready_document(&self, doc: Automerge) -> DocHandle {
        let document_id = DocumentId::random();
        let handle = DocHandle::new(
            self.repo_sender.clone(),
            document_id,
            self.local_peer_id.clone(),
        );
        handle.setup_ready(doc);
        self.handles.write().insert(document_id, handle.clone());
        let _ = self.repo_sender.send(RepoEvent::NewDoc(document_id));
        handle
    }

    /// The handle for a document, from the cache or freshly loading.
    /// Loading and availability are reported through the handle's state
    /// and events; [`RepoHandle::request_document`] awaits them.
    pub fn find_document(&self, document_id: DocumentId) -> DocHandle {
        self.find_document_with_timeout(document_id, None)
    }

    /// As [`RepoHandle::find_document`], with a REQUESTING timeout after
    /// which the handle becomes unavailable.
    pub fn find_document_with_timeout(
        &self,
        document_id: DocumentId,
        timeout: Option<Duration>,
    ) -> DocHandle {
        let handle = {
            let mut cache = self.handles.write();
            match cache.get(&document_id) {
                Some(handle) => handle.clone(),
                None => {
                    let handle = DocHandle::new(
                        self.repo_sender.clone(),
                        document_id,
                        self.local_peer_id.clone(),
                    );
                    handle.begin_load();
                    cache.insert(document_id, handle.clone());
                    handle
                }
            }
        };
        let _ = self
            .repo_sender
            .send(RepoEvent::FindDoc(document_id, timeout));
        handle
    }

    /// Parse a document URL (or bare id, or legacy UUID) and find it.
    pub fn find_url(&self, url: &str) -> Result<DocHandle, InvalidDocumentId> {
        Ok(self.find_document(url.parse()?))
    }

    /// Find a document and wait until it is ready, or report that no
    /// peer could supply it.
    pub async fn request_document(
        &self,
        document_id: DocumentId,
    ) -> Result<DocHandle, RepoError> {
        let handle = self.find_document(document_id);
        handle
            .when_state(&[HandleState::Ready, HandleState::Unavailable])
            .await?;
        if handle.is_unavailable() {
            return Err(RepoError::Unavailable);
        }
        Ok(handle)
    }

    /// Delete a document: terminal for the handle, evicted from the
    /// cache, removed from storage.
    pub fn delete_document(&self, document_id: DocumentId) {
        let _ = self.repo_sender.send(RepoEvent::Delete(document_id));
    }

    /// Await readiness and export the full serialized document.
    pub async fn export_document(&self, document_id: DocumentId) -> Result<Vec<u8>, RepoError> {
        let handle = self.find_document(document_id);
        handle.when_ready().await?;
        Ok(handle.with_doc(|doc| doc.save())?)
    }

    /// Force a storage save of the named documents (or all cached ones),
    /// and wait for the writes to land.
    pub async fn flush(&self, document_ids: Option<Vec<DocumentId>>) -> Result<(), RepoError> {
        let (fut, resolver) = new_repo_future_with_resolver();
        if self
            .repo_sender
            .send(RepoEvent::Flush {
                document_ids,
                resolver,
            })
            .is_err()
        {
            return Err(RepoError::Shutdown);
        }
        fut.await
    }

    /// Evict a handle from the cache. Only permitted once the handle is
    /// ready, unloaded, deleted, or unavailable; a ready handle is
    /// unloaded first.
    pub fn remove_from_cache(&self, document_id: DocumentId) {
        let _ = self
            .repo_sender
            .send(RepoEvent::RemoveFromCache(document_id));
    }

    /// Plug in another network adapter at runtime.
    pub fn new_network_adapter(&self, adapter: Box<dyn NetworkAdapter>) {
        let _ = self.repo_sender.send(RepoEvent::AddAdapter(adapter));
    }

    /// Follow heads gossip for the named storages.
    pub fn subscribe_to_remote_heads(&self, storage_ids: Vec<StorageId>) {
        let _ = self
            .repo_sender
            .send(RepoEvent::SubscribeRemotes(storage_ids));
    }

    pub fn unsubscribe_from_remote_heads(&self, storage_ids: Vec<StorageId>) {
        let _ = self
            .repo_sender
            .send(RepoEvent::UnsubscribeRemotes(storage_ids));
    }

    /// Stop the repo: disconnect every adapter, flush every handle, and
    /// join the event loop. Idempotent.
    pub fn stop(&self) -> Result<(), RepoError> {
        let _ = self.repo_sender.send(RepoEvent::Stop);
        let join = self.join.lock().take();
        if let Some(join) = join {
            join.join().map_err(|_| RepoError::Shutdown)?;
        }
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::transaction::Transactable;

    #[test]
    fn repo_future_resolves_through_its_resolver() {
        let (fut, resolver) = new_repo_future_with_resolver::<u32>();
        resolver.resolve(7);
        assert_eq!(futures::executor::block_on(fut), 7);
    }

    #[test]
    fn repo_starts_and_stops() {
        let repo = Repo::new(None, None);
        let handle = repo.run();
        handle.stop().unwrap();
        // A second stop is a no-op.
        handle.stop().unwrap();
    }

    #[test]
    fn new_document_is_ready_and_cached_once() {
        let repo = Repo::new(Some("local".to_string()), None);
        let repo_handle = repo.run();
        let doc_handle = repo_handle.new_document();
        assert!(doc_handle.is_ready());

        // Finding it again yields the same underlying document.
        let found = repo_handle.find_document(doc_handle.document_id());
        doc_handle
            .with_doc_mut(|doc| {
                let mut tx = doc.transaction();
                tx.put(automerge::ROOT, "n", 1).unwrap();
                tx.commit();
            })
            .unwrap();
        assert_eq!(found.heads().unwrap(), doc_handle.heads().unwrap());
        repo_handle.stop().unwrap();
    }

    #[test]
    fn clone_document_requires_content() {
        let repo = Repo::new(None, None);
        let repo_handle = repo.run();
        let empty = repo_handle.new_document();
        assert!(matches!(
            repo_handle.clone_document(&empty),
            Err(RepoError::Empty)
        ));

        empty
            .with_doc_mut(|doc| {
                let mut tx = doc.transaction();
                tx.put(automerge::ROOT, "n", 1).unwrap();
                tx.commit();
            })
            .unwrap();
        let cloned = repo_handle.clone_document(&empty).unwrap();
        assert_ne!(cloned.document_id(), empty.document_id());
        assert_eq!(cloned.heads().unwrap(), empty.heads().unwrap());
        repo_handle.stop().unwrap();
    }

    #[test]
    fn import_export_round_trip() {
        let repo = Repo::new(None, None);
        let repo_handle = repo.run();
        let source = repo_handle.new_document_with(|doc| {
            let mut tx = doc.transaction();
            tx.put(automerge::ROOT, "k", "v").unwrap();
            tx.commit();
        });
        let bytes = futures::executor::block_on(
            repo_handle.export_document(source.document_id()),
        )
        .unwrap();
        let imported = repo_handle.import_document(&bytes).unwrap();
        assert_eq!(imported.heads().unwrap(), source.heads().unwrap());
        repo_handle.stop().unwrap();
    }
}
