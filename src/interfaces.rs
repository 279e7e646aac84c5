use crate::message::RepoMessage;
use futures::future::BoxFuture;
use futures::{Sink, Stream};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The unique identifier of a document: an opaque 16 byte value.
///
/// A `DocumentId` has three interchangeable external representations:
/// the raw bytes, a base58check string, and a URL of the form
/// `automerge:<base58check>`. A legacy hyphenated UUID form is accepted
/// on input only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId([u8; 16]);

impl DocumentId {
    /// Mint a fresh random id.
    pub fn random() -> Self {
        DocumentId(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The `automerge:<base58check>` URL form of this id.
    pub fn as_url(&self) -> String {
        format!("automerge:{}", self)
    }
}

impl From<[u8; 16]> for DocumentId {
    fn from(bytes: [u8; 16]) -> Self {
        DocumentId(bytes)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).with_check().into_string())
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self)
    }
}

impl FromStr for DocumentId {
    type Err = InvalidDocumentId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let payload = s.strip_prefix("automerge:").unwrap_or(s);
        if payload.len() == 36 && payload.contains('-') {
            // Legacy hyphenated UUID form.
            let uuid = uuid::Uuid::parse_str(payload)
                .map_err(|_| InvalidDocumentId(s.to_string()))?;
            tracing::warn!(id = %payload, "parsed deprecated UUID document id");
            return Ok(DocumentId(*uuid.as_bytes()));
        }
        let bytes = bs58::decode(payload)
            .with_check(None)
            .into_vec()
            .map_err(|_| InvalidDocumentId(s.to_string()))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| InvalidDocumentId(s.to_string()))?;
        Ok(DocumentId(bytes))
    }
}

impl Serialize for DocumentId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The error returned when parsing a string that is not a valid document id.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid document id: {0}")]
pub struct InvalidDocumentId(pub String);

/// The id of a peer: a free-form string unique to one running process.
///
/// Two `PeerId`s carrying the same string across reconnects name the same
/// logical peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// The stable identifier of a storage backend, as opposed to a peer.
///
/// Several peers may share one `StorageId` (two tabs over the same disk),
/// and ephemeral peers have none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageId(pub String);

impl StorageId {
    pub fn random() -> Self {
        StorageId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StorageId {
    fn from(s: &str) -> Self {
        StorageId(s.to_string())
    }
}

/// Metadata a peer announces once at connection setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    pub storage_id: Option<StorageId>,
    pub is_ephemeral: bool,
}

/// A key in the storage backend: a path of string components.
///
/// Adapters must treat a shorter key as a prefix of every key it is a
/// leading subsequence of, for the range operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey(Vec<String>);

impl StorageKey {
    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn with_component(&self, component: impl Into<String>) -> StorageKey {
        let mut components = self.0.clone();
        components.push(component.into());
        StorageKey(components)
    }

    pub fn is_prefix_of(&self, other: &StorageKey) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl<S: Into<String>> FromIterator<S> for StorageKey {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        StorageKey(iter.into_iter().map(Into::into).collect())
    }
}

impl From<&DocumentId> for StorageKey {
    fn from(id: &DocumentId) -> Self {
        StorageKey(vec![id.to_string()])
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// The error type for storage operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A pluggable persistence backend: an async key-value store over
/// [`StorageKey`] paths.
///
/// All operations may fail, and failures propagate to the caller. The
/// subsystem built on top only ever issues idempotent writes, so adapters
/// are free to retry internally.
pub trait StorageAdapter: Send + Sync + 'static {
    fn load(&self, key: StorageKey) -> BoxFuture<'static, Result<Option<Vec<u8>>, StorageError>>;

    fn load_range(
        &self,
        prefix: StorageKey,
    ) -> BoxFuture<'static, Result<Vec<(StorageKey, Vec<u8>)>, StorageError>>;

    fn save(&self, key: StorageKey, data: Vec<u8>) -> BoxFuture<'static, Result<(), StorageError>>;

    fn remove(&self, key: StorageKey) -> BoxFuture<'static, Result<(), StorageError>>;

    fn remove_range(&self, prefix: StorageKey) -> BoxFuture<'static, Result<(), StorageError>>;

    /// The stable identifier of this backend.
    fn id(&self) -> StorageId;
}

/// The error type for network adapter operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    #[error("network adapter error")]
    Error,
}

/// An event surfaced by a network adapter.
///
/// Adapters signal their own shutdown by ending their event stream.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// The adapter has finished its setup and can carry messages.
    Ready,
    /// A remote peer announced itself on this adapter.
    PeerCandidate {
        peer_id: PeerId,
        metadata: PeerMetadata,
    },
    /// A previously announced peer went away.
    PeerDisconnected { peer_id: PeerId },
    /// An inbound message from a connected peer.
    Message(RepoMessage),
}

/// A pluggable transport: a stream of [`NetworkEvent`]s and a sink of
/// outbound [`RepoMessage`]s.
pub trait NetworkAdapter:
    Send + Unpin + Stream<Item = NetworkEvent> + Sink<RepoMessage, Error = NetworkError>
{
}
