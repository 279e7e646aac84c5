use crate::interfaces::{NetworkAdapter, NetworkEvent, PeerId, PeerMetadata};
use crate::message::RepoMessage;
use futures::task::Context;
use futures::{Sink, Stream};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::Poll;

/// An inbound network event after multiplexing: routing recorded,
/// ephemeral duplicates already dropped.
#[derive(Debug)]
pub(crate) enum InboundEvent {
    /// An adapter finished its setup.
    AdapterReady,
    /// A new peer, reachable through the adapter that first claimed it.
    Peer {
        peer_id: PeerId,
        metadata: PeerMetadata,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    Message(RepoMessage),
    /// An adapter's event stream ended; its peers are gone.
    AdapterClosed {
        disconnected: Vec<PeerId>,
    },
}

struct AdapterEntry {
    adapter: Box<dyn NetworkAdapter>,
    ready: bool,
    closed: bool,
    outbox: VecDeque<RepoMessage>,
}

/// Multiplexes any number of network adapters behind one send/receive
/// surface. Tracks which adapter first claimed each peer, tags outbound
/// messages with our peer id (and ephemeral session bookkeeping), and
/// filters inbound ephemeral duplicates.
pub(crate) struct NetworkSubsystem {
    local_peer_id: PeerId,
    adapters: Vec<AdapterEntry>,
    routes: HashMap<PeerId, usize>,
    session_id: String,
    ephemeral_count: u32,
    /// Highest count seen per (sender, session), for the monotone filter.
    ephemeral_seen: HashMap<(PeerId, String), u32>,
}

impl NetworkSubsystem {
    pub(crate) fn new(local_peer_id: PeerId) -> Self {
        NetworkSubsystem {
            local_peer_id,
            adapters: Vec::new(),
            routes: HashMap::new(),
            session_id: uuid::Uuid::new_v4().to_string(),
            ephemeral_count: 0,
            ephemeral_seen: HashMap::new(),
        }
    }

    pub(crate) fn add_adapter(&mut self, adapter: Box<dyn NetworkAdapter>) -> usize {
        self.adapters.push(AdapterEntry {
            adapter,
            ready: false,
            closed: false,
            outbox: VecDeque::new(),
        });
        self.adapters.len() - 1
    }

    pub(crate) fn adapter_count(&self) -> usize {
        self.adapters.len()
    }

    /// Ready iff every adapter is.
    pub(crate) fn is_ready(&self) -> bool {
        self.adapters.iter().all(|entry| entry.ready || entry.closed)
    }

    /// Drain one adapter's event stream.
    pub(crate) fn poll_events(&mut self, index: usize, cx: &mut Context<'_>) -> Vec<InboundEvent> {
        let mut out = Vec::new();
        loop {
            let polled = {
                let Some(entry) = self.adapters.get_mut(index) else {
                    return out;
                };
                if entry.closed {
                    return out;
                }
                Pin::new(&mut entry.adapter).poll_next(cx)
            };
            match polled {
                Poll::Ready(Some(event)) => {
                    if let Some(event) = self.translate(index, event) {
                        out.push(event);
                    }
                }
                Poll::Ready(None) => {
                    self.adapters[index].closed = true;
                    let disconnected: Vec<PeerId> = self
                        .routes
                        .iter()
                        .filter(|(_, adapter)| **adapter == index)
                        .map(|(peer, _)| peer.clone())
                        .collect();
                    for peer in &disconnected {
                        self.routes.remove(peer);
                    }
                    out.push(InboundEvent::AdapterClosed { disconnected });
                    return out;
                }
                Poll::Pending => return out,
            }
        }
    }

    fn translate(&mut self, index: usize, event: NetworkEvent) -> Option<InboundEvent> {
        match event {
            NetworkEvent::Ready => {
                self.adapters[index].ready = true;
                Some(InboundEvent::AdapterReady)
            }
            NetworkEvent::PeerCandidate { peer_id, metadata } => {
                match self.routes.get(&peer_id) {
                    Some(existing) if *existing != index => {
                        // First claim wins.
                        tracing::debug!(%peer_id, "peer already routed through another adapter");
                        None
                    }
                    Some(_) => None,
                    None => {
                        self.routes.insert(peer_id.clone(), index);
                        Some(InboundEvent::Peer { peer_id, metadata })
                    }
                }
            }
            NetworkEvent::PeerDisconnected { peer_id } => {
                self.routes.remove(&peer_id);
                Some(InboundEvent::PeerDisconnected { peer_id })
            }
            NetworkEvent::Message(message) => {
                if let RepoMessage::Ephemeral {
                    sender_id,
                    session_id,
                    count,
                    ..
                } = &message
                {
                    if !self.note_ephemeral(sender_id.clone(), session_id.clone(), *count) {
                        tracing::trace!(
                            %sender_id,
                            session_id,
                            count,
                            "dropping out-of-order ephemeral message"
                        );
                        return None;
                    }
                }
                Some(InboundEvent::Message(message))
            }
        }
    }

    /// At-most-once per count, and never in decreasing count order.
    fn note_ephemeral(&mut self, sender_id: PeerId, session_id: String, count: u32) -> bool {
        let key = (sender_id, session_id);
        match self.ephemeral_seen.get(&key) {
            Some(last) if count <= *last => false,
            _ => {
                self.ephemeral_seen.insert(key, count);
                true
            }
        }
    }

    /// Queue an outbound message for its target's adapter. Returns the
    /// adapter to pump, or drops the message with a log when the target
    /// is not routed.
    pub(crate) fn send(&mut self, mut message: RepoMessage) -> Option<usize> {
        message.set_sender_id(self.local_peer_id.clone());
        let target = message.target_id().clone();
        let Some(&index) = self.routes.get(&target) else {
            tracing::warn!(
                target_id = %target,
                message_type = message.type_name(),
                "dropping message for unrouted peer"
            );
            return None;
        };
        if self.adapters[index].closed {
            tracing::warn!(target_id = %target, "dropping message for closed adapter");
            return None;
        }
        self.adapters[index].outbox.push_back(message);
        Some(index)
    }

    /// Build and queue one ephemeral broadcast to each target, all
    /// sharing one freshly minted count. Returns the adapters to pump.
    pub(crate) fn send_ephemeral(
        &mut self,
        document_id: crate::interfaces::DocumentId,
        targets: Vec<PeerId>,
        data: Vec<u8>,
    ) -> Vec<usize> {
        self.ephemeral_count += 1;
        let count = self.ephemeral_count;
        let mut touched = Vec::new();
        for target_id in targets {
            let message = RepoMessage::Ephemeral {
                sender_id: self.local_peer_id.clone(),
                target_id,
                document_id,
                count,
                session_id: self.session_id.clone(),
                data: data.clone(),
            };
            if let Some(index) = self.send(message) {
                touched.push(index);
            }
        }
        touched
    }

    /// Push queued messages into one adapter's sink.
    pub(crate) fn pump_outbox(&mut self, index: usize, cx: &mut Context<'_>) {
        let Some(entry) = self.adapters.get_mut(index) else {
            return;
        };
        if entry.closed {
            entry.outbox.clear();
            return;
        }
        while !entry.outbox.is_empty() {
            match Pin::new(&mut entry.adapter).poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    if let Some(message) = entry.outbox.pop_front() {
                        if Pin::new(&mut entry.adapter).start_send(message).is_err() {
                            tracing::warn!("adapter rejected outbound message; closing");
                            entry.closed = true;
                            entry.outbox.clear();
                            return;
                        }
                    }
                }
                Poll::Ready(Err(_)) => {
                    tracing::warn!("adapter sink failed; closing");
                    entry.closed = true;
                    entry.outbox.clear();
                    return;
                }
                Poll::Pending => break,
            }
        }
        let _ = Pin::new(&mut entry.adapter).poll_flush(cx);
    }

    pub(crate) fn has_pending_sends(&self) -> bool {
        self.adapters
            .iter()
            .any(|entry| !entry.closed && !entry.outbox.is_empty())
    }

    /// Drive one adapter's sink shutdown. True once it is closed.
    pub(crate) fn poll_close(&mut self, index: usize, cx: &mut Context<'_>) -> bool {
        let Some(entry) = self.adapters.get_mut(index) else {
            return true;
        };
        if entry.closed {
            return true;
        }
        match Pin::new(&mut entry.adapter).poll_close(cx) {
            Poll::Ready(_) => {
                entry.closed = true;
                true
            }
            Poll::Pending => false,
        }
    }

    pub(crate) fn all_closed(&self) -> bool {
        self.adapters.iter().all(|entry| entry.closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::DocumentId;

    fn subsystem() -> NetworkSubsystem {
        NetworkSubsystem::new(PeerId::from("local"))
    }

    #[test]
    fn ephemeral_filter_is_monotone_per_session() {
        let mut net = subsystem();
        let sender = PeerId::from("peer");
        // Delivery reordered as 3, 1, 2: only 3 passes.
        assert!(net.note_ephemeral(sender.clone(), "s1".into(), 3));
        assert!(!net.note_ephemeral(sender.clone(), "s1".into(), 1));
        assert!(!net.note_ephemeral(sender.clone(), "s1".into(), 2));
        // Same count never delivers twice.
        assert!(!net.note_ephemeral(sender.clone(), "s1".into(), 3));
        // A new session starts over.
        assert!(net.note_ephemeral(sender, "s2".into(), 1));
    }

    #[test]
    fn first_adapter_claiming_a_peer_wins() {
        let mut net = subsystem();
        // Two fake adapter slots; translate only needs the ready flag.
        net.adapters.push(AdapterEntry {
            adapter: unreachable_adapter(),
            ready: true,
            closed: false,
            outbox: VecDeque::new(),
        });
        net.adapters.push(AdapterEntry {
            adapter: unreachable_adapter(),
            ready: true,
            closed: false,
            outbox: VecDeque::new(),
        });
        let peer = PeerId::from("peer");
        let claimed = net.translate(
            0,
            NetworkEvent::PeerCandidate {
                peer_id: peer.clone(),
                metadata: PeerMetadata::default(),
            },
        );
        assert!(matches!(claimed, Some(InboundEvent::Peer { .. })));
        let second = net.translate(
            1,
            NetworkEvent::PeerCandidate {
                peer_id: peer.clone(),
                metadata: PeerMetadata::default(),
            },
        );
        assert!(second.is_none());
        assert_eq!(net.routes[&peer], 0);
    }

    #[test]
    fn sends_to_unrouted_peers_are_dropped() {
        let mut net = subsystem();
        let message = RepoMessage::DocUnavailable {
            sender_id: PeerId::from("local"),
            target_id: PeerId::from("nobody"),
            document_id: DocumentId::random(),
        };
        assert!(net.send(message).is_none());
        assert!(!net.has_pending_sends());
    }

    /// An adapter that must never be polled; routing tests only touch
    /// the subsystem's tables.
    fn unreachable_adapter() -> Box<dyn NetworkAdapter> {
        struct Unreachable;
        impl futures::Stream for Unreachable {
            type Item = NetworkEvent;
            fn poll_next(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<Option<NetworkEvent>> {
                unreachable!()
            }
        }
        impl futures::Sink<RepoMessage> for Unreachable {
            type Error = crate::interfaces::NetworkError;
            fn poll_ready(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<Result<(), Self::Error>> {
                unreachable!()
            }
            fn start_send(self: Pin<&mut Self>, _item: RepoMessage) -> Result<(), Self::Error> {
                unreachable!()
            }
            fn poll_flush(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<Result<(), Self::Error>> {
                unreachable!()
            }
            fn poll_close(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<Result<(), Self::Error>> {
                unreachable!()
            }
        }
        impl NetworkAdapter for Unreachable {}
        Box::new(Unreachable)
    }
}
