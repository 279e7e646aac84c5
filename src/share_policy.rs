use crate::interfaces::{DocumentId, PeerId};
use futures::future::BoxFuture;

/// Decides which documents are announced to and synced with which peers.
///
/// The policy is an arbitrary async predicate. The repo queries it from
/// every path that introduces a (peer, document) pair — new peer, new
/// document, inbound message — and never caches the answer, so a policy
/// may change its mind between calls and may be queried concurrently for
/// the same pair. A `None` document asks whether to announce our whole
/// collection to the peer.
pub trait SharePolicy: Send + 'static {
    fn should_share(
        &self,
        peer_id: &PeerId,
        document_id: Option<&DocumentId>,
    ) -> BoxFuture<'static, bool>;
}

/// The default policy: share every document with every peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct Permissive;

impl SharePolicy for Permissive {
    fn should_share(
        &self,
        _peer_id: &PeerId,
        _document_id: Option<&DocumentId>,
    ) -> BoxFuture<'static, bool> {
        Box::pin(futures::future::ready(true))
    }
}

impl<F> SharePolicy for F
where
    F: Fn(&PeerId, Option<&DocumentId>) -> bool + Send + 'static,
{
    fn should_share(
        &self,
        peer_id: &PeerId,
        document_id: Option<&DocumentId>,
    ) -> BoxFuture<'static, bool> {
        Box::pin(futures::future::ready(self(peer_id, document_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn closures_are_policies() {
        let policy = |peer_id: &PeerId, _doc: Option<&DocumentId>| peer_id.0 != "banned";
        assert!(block_on(policy.should_share(&PeerId::from("alice"), None)));
        assert!(!block_on(policy.should_share(&PeerId::from("banned"), None)));
        assert!(block_on(Permissive.should_share(&PeerId::from("anyone"), None)));
    }
}
