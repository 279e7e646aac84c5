//! In-memory adapters for exercising repos in tests: a linkable network
//! adapter pair and a `HashMap`-backed storage adapter.

use futures::future::BoxFuture;
use futures::task::{Context, Poll, Waker};
use futures::{FutureExt, Sink, Stream};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vellum::{
    DocumentId, NetworkAdapter, NetworkError, NetworkEvent, PeerId, PeerMetadata, RepoMessage,
    StorageAdapter, StorageError, StorageId, StorageKey,
};

#[derive(Default)]
struct NetworkInner {
    inbound: Mutex<VecDeque<NetworkEvent>>,
    stream_waker: Mutex<Option<Waker>>,
    /// When linked, outbound messages land in the peer's inbound queue;
    /// otherwise they accumulate for the test to deliver by hand.
    peer: Mutex<Option<Arc<NetworkInner>>>,
    outbound: Mutex<VecDeque<RepoMessage>>,
    closed: AtomicBool,
}

impl NetworkInner {
    fn push_event(&self, event: NetworkEvent) {
        self.inbound.lock().push_back(event);
        if let Some(waker) = self.stream_waker.lock().take() {
            waker.wake();
        }
    }
}

/// An in-memory network adapter: a stream of injected events and a sink
/// that either forwards into a linked peer adapter or buffers outbound
/// messages for manual delivery.
#[derive(Clone, Default)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject an inbound event, waking the owning repo.
    pub fn push_event(&self, event: NetworkEvent) {
        self.inner.push_event(event);
    }

    /// Deliver this adapter's sends into `other`'s inbound queue.
    pub fn link(&self, other: &Network) {
        *self.inner.peer.lock() = Some(other.inner.clone());
    }

    /// Sever the link; subsequent sends buffer locally.
    pub fn unlink(&self) {
        *self.inner.peer.lock() = None;
    }

    /// Messages sent while unlinked, in send order.
    pub fn drain_outbound(&self) -> Vec<RepoMessage> {
        self.inner.outbound.lock().drain(..).collect()
    }

    /// End the adapter's event stream.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(waker) = self.inner.stream_waker.lock().take() {
            waker.wake();
        }
    }
}

impl Stream for Network {
    type Item = NetworkEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<NetworkEvent>> {
        *self.inner.stream_waker.lock() = Some(cx.waker().clone());
        if let Some(event) = self.inner.inbound.lock().pop_front() {
            return Poll::Ready(Some(event));
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

impl Sink<RepoMessage> for Network {
    type Error = NetworkError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Poll::Ready(Err(NetworkError::Error))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: RepoMessage) -> Result<(), Self::Error> {
        let peer = self.inner.peer.lock().clone();
        match peer {
            Some(peer) => peer.push_event(NetworkEvent::Message(item)),
            None => self.inner.outbound.lock().push_back(item),
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

impl NetworkAdapter for Network {}

/// A bidirectionally connected pair of adapters, ready and with both
/// peers announced to each other.
pub fn connected_pair(
    a_peer: PeerId,
    a_metadata: PeerMetadata,
    b_peer: PeerId,
    b_metadata: PeerMetadata,
) -> (Network, Network) {
    let a = Network::new();
    let b = Network::new();
    a.link(&b);
    b.link(&a);
    a.push_event(NetworkEvent::Ready);
    b.push_event(NetworkEvent::Ready);
    a.push_event(NetworkEvent::PeerCandidate {
        peer_id: b_peer,
        metadata: b_metadata,
    });
    b.push_event(NetworkEvent::PeerCandidate {
        peer_id: a_peer,
        metadata: a_metadata,
    });
    (a, b)
}

/// A `BTreeMap` behind a mutex, with the inspection helpers the
/// integration tests assert against.
#[derive(Clone)]
pub struct InMemoryStorage {
    data: Arc<Mutex<BTreeMap<StorageKey, Vec<u8>>>>,
    id: StorageId,
}

impl InMemoryStorage {
    pub fn new(id: &str) -> Self {
        InMemoryStorage {
            data: Arc::default(),
            id: StorageId(id.to_string()),
        }
    }

    pub fn keys(&self) -> Vec<StorageKey> {
        self.data.lock().keys().cloned().collect()
    }

    /// The stored keys under a document's prefix.
    pub fn keys_under(&self, document_id: &DocumentId) -> Vec<StorageKey> {
        let prefix = StorageKey::from(document_id);
        self.data
            .lock()
            .keys()
            .filter(|key| prefix.is_prefix_of(key))
            .cloned()
            .collect()
    }
}

impl StorageAdapter for InMemoryStorage {
    fn load(&self, key: StorageKey) -> BoxFuture<'static, Result<Option<Vec<u8>>, StorageError>> {
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

    fn save(&self, key: StorageKey, value: Vec<u8>) -> BoxFuture<'static, Result<(), StorageError>> {
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
        self.id.clone()
    }
}
