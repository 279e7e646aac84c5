//! A client-side coordinator for a library of collaboratively edited
//! automerge documents.
//!
//! One [`Repo`] per process owns a cache of [`DocHandle`]s. For each
//! handle it loads and persists the document through a pluggable
//! [`StorageAdapter`], discovers peers through pluggable
//! [`NetworkAdapter`]s, and runs a per-document sync protocol with every
//! peer the [`SharePolicy`] admits, so that all participants converge on
//! the same document state. Peers with a storage backend additionally
//! gossip the heads they have observed on each other's behalf.
//!
//! The repo's event loop runs on its own thread; handles are cheap to
//! clone and safe to use from anywhere.

mod debounce;
mod dochandle;
mod events;
mod interfaces;
mod message;
mod network;
mod remote_heads;
mod repo;
mod share_policy;
mod storage;
mod synchronizer;

pub use crate::dochandle::{DocError, DocHandle, DocHandleEvent, DocSubscription, HandleState};
pub use crate::events::SubscriptionToken;
pub use crate::interfaces::{
    DocumentId, InvalidDocumentId, NetworkAdapter, NetworkError, NetworkEvent, PeerId,
    PeerMetadata, StorageAdapter, StorageError, StorageId, StorageKey,
};
pub use crate::message::{DecodeError, RepoMessage, TimestampedHeads};
pub use crate::repo::{
    Repo, RepoError, RepoFuture, RepoHandle, DEFAULT_SAVE_DEBOUNCE, DEFAULT_SYNC_DEBOUNCE,
};
pub use crate::share_policy::{Permissive, SharePolicy};
