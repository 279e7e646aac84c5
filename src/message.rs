use crate::interfaces::{DocumentId, PeerId, StorageId};
use automerge::ChangeHash;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use std::collections::HashMap;

/// Heads observed on behalf of a remote storage, stamped with the
/// observation time in milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedHeads {
    pub heads: Vec<ChangeHash>,
    pub timestamp: i64,
}

/// A message exchanged between repos.
///
/// The wire form is a CBOR map with string keys, matching the protocol of
/// the reference implementation: `type`, `senderId`, `targetId`,
/// `documentId`, and the per-type payload fields. Byte payloads are opaque
/// and handed to automerge verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum RepoMessage {
    /// A sync protocol message for a document both sides know about.
    Sync {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        data: Vec<u8>,
    },
    /// A sync message which additionally asks the recipient to send the
    /// document if it has it.
    Request {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        data: Vec<u8>,
    },
    /// The sender does not have, and cannot get, the named document.
    DocUnavailable {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
    },
    /// An application-level broadcast, not persisted in the document.
    Ephemeral {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        count: u32,
        session_id: String,
        data: Vec<u8>,
    },
    /// Subscribe or unsubscribe to heads gossip for the named storages.
    RemoteSubscriptionChange {
        sender_id: PeerId,
        target_id: PeerId,
        add: Vec<StorageId>,
        remove: Vec<StorageId>,
    },
    /// Heads the sender has observed on behalf of one or more storages.
    RemoteHeadsChanged {
        sender_id: PeerId,
        target_id: PeerId,
        document_id: DocumentId,
        new_heads: HashMap<StorageId, TimestampedHeads>,
    },
}

/// The error returned when an inbound message fails to decode.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Cbor(#[from] minicbor::decode::Error),
    #[error("message is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("message carries an invalid document id")]
    BadDocumentId,
    #[error("message carries an invalid change hash")]
    BadChangeHash,
    #[error("indefinite length items are not supported")]
    Indefinite,
}

impl RepoMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            RepoMessage::Sync { .. } => "sync",
            RepoMessage::Request { .. } => "request",
            RepoMessage::DocUnavailable { .. } => "doc-unavailable",
            RepoMessage::Ephemeral { .. } => "ephemeral",
            RepoMessage::RemoteSubscriptionChange { .. } => "remote-subscription-change",
            RepoMessage::RemoteHeadsChanged { .. } => "remote-heads-changed",
        }
    }

    pub fn sender_id(&self) -> &PeerId {
        match self {
            RepoMessage::Sync { sender_id, .. }
            | RepoMessage::Request { sender_id, .. }
            | RepoMessage::DocUnavailable { sender_id, .. }
            | RepoMessage::Ephemeral { sender_id, .. }
            | RepoMessage::RemoteSubscriptionChange { sender_id, .. }
            | RepoMessage::RemoteHeadsChanged { sender_id, .. } => sender_id,
        }
    }

    pub fn target_id(&self) -> &PeerId {
        match self {
            RepoMessage::Sync { target_id, .. }
            | RepoMessage::Request { target_id, .. }
            | RepoMessage::DocUnavailable { target_id, .. }
            | RepoMessage::Ephemeral { target_id, .. }
            | RepoMessage::RemoteSubscriptionChange { target_id, .. }
            | RepoMessage::RemoteHeadsChanged { target_id, .. } => target_id,
        }
    }

    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            RepoMessage::Sync { document_id, .. }
            | RepoMessage::Request { document_id, .. }
            | RepoMessage::DocUnavailable { document_id, .. }
            | RepoMessage::Ephemeral { document_id, .. }
            | RepoMessage::RemoteHeadsChanged { document_id, .. } => Some(document_id),
            RepoMessage::RemoteSubscriptionChange { .. } => None,
        }
    }

    pub(crate) fn set_sender_id(&mut self, id: PeerId) {
        match self {
            RepoMessage::Sync { sender_id, .. }
            | RepoMessage::Request { sender_id, .. }
            | RepoMessage::DocUnavailable { sender_id, .. }
            | RepoMessage::Ephemeral { sender_id, .. }
            | RepoMessage::RemoteSubscriptionChange { sender_id, .. }
            | RepoMessage::RemoteHeadsChanged { sender_id, .. } => *sender_id = id,
        }
    }

    /// Encode to the CBOR wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new(Vec::new());
        match self.encode_inner(&mut e) {
            Ok(()) => e.into_writer(),
            Err(_) => unreachable!("encoding into a Vec cannot fail"),
        }
    }

    fn encode_inner(
        &self,
        e: &mut Encoder<Vec<u8>>,
    ) -> Result<(), minicbor::encode::Error<core::convert::Infallible>> {
        match self {
            RepoMessage::Sync {
                sender_id,
                target_id,
                document_id,
                data,
            }
            | RepoMessage::Request {
                sender_id,
                target_id,
                document_id,
                data,
            } => {
                e.map(5)?;
                e.str("type")?.str(self.type_name())?;
                e.str("senderId")?.str(&sender_id.0)?;
                e.str("targetId")?.str(&target_id.0)?;
                e.str("documentId")?.str(&document_id.to_string())?;
                e.str("data")?.bytes(data)?;
            }
            RepoMessage::DocUnavailable {
                sender_id,
                target_id,
                document_id,
            } => {
                e.map(4)?;
                e.str("type")?.str(self.type_name())?;
                e.str("senderId")?.str(&sender_id.0)?;
                e.str("targetId")?.str(&target_id.0)?;
                e.str("documentId")?.str(&document_id.to_string())?;
            }
            RepoMessage::Ephemeral {
                sender_id,
                target_id,
                document_id,
                count,
                session_id,
                data,
            } => {
                e.map(7)?;
                e.str("type")?.str(self.type_name())?;
                e.str("senderId")?.str(&sender_id.0)?;
                e.str("targetId")?.str(&target_id.0)?;
                e.str("documentId")?.str(&document_id.to_string())?;
                e.str("count")?.u32(*count)?;
                e.str("sessionId")?.str(session_id)?;
                e.str("data")?.bytes(data)?;
            }
            RepoMessage::RemoteSubscriptionChange {
                sender_id,
                target_id,
                add,
                remove,
            } => {
                let len = 3 + u64::from(!add.is_empty()) + u64::from(!remove.is_empty());
                e.map(len)?;
                e.str("type")?.str(self.type_name())?;
                e.str("senderId")?.str(&sender_id.0)?;
                e.str("targetId")?.str(&target_id.0)?;
                if !add.is_empty() {
                    e.str("add")?.array(add.len() as u64)?;
                    for storage_id in add {
                        e.str(&storage_id.0)?;
                    }
                }
                if !remove.is_empty() {
                    e.str("remove")?.array(remove.len() as u64)?;
                    for storage_id in remove {
                        e.str(&storage_id.0)?;
                    }
                }
            }
            RepoMessage::RemoteHeadsChanged {
                sender_id,
                target_id,
                document_id,
                new_heads,
            } => {
                e.map(5)?;
                e.str("type")?.str(self.type_name())?;
                e.str("senderId")?.str(&sender_id.0)?;
                e.str("targetId")?.str(&target_id.0)?;
                e.str("documentId")?.str(&document_id.to_string())?;
                e.str("newHeads")?.map(new_heads.len() as u64)?;
                for (storage_id, entry) in new_heads {
                    e.str(&storage_id.0)?;
                    e.map(2)?;
                    e.str("heads")?.array(entry.heads.len() as u64)?;
                    for head in &entry.heads {
                        e.str(&head.to_string())?;
                    }
                    e.str("timestamp")?.i64(entry.timestamp)?;
                }
            }
        }
        Ok(())
    }

    /// Decode from the CBOR wire form, rejecting messages that lack any
    /// of their required fields.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut d = Decoder::new(bytes);
        let len = d
            .map()?
            .ok_or(DecodeError::Indefinite)?;

        let mut ty: Option<String> = None;
        let mut sender_id: Option<PeerId> = None;
        let mut target_id: Option<PeerId> = None;
        let mut document_id: Option<DocumentId> = None;
        let mut data: Option<Vec<u8>> = None;
        let mut count: Option<u32> = None;
        let mut session_id: Option<String> = None;
        let mut add: Vec<StorageId> = Vec::new();
        let mut remove: Vec<StorageId> = Vec::new();
        let mut new_heads: Option<HashMap<StorageId, TimestampedHeads>> = None;

        for _ in 0..len {
            let key = d.str()?;
            match key {
                "type" => ty = Some(d.str()?.to_string()),
                "senderId" => sender_id = Some(PeerId(d.str()?.to_string())),
                "targetId" => target_id = Some(PeerId(d.str()?.to_string())),
                "documentId" => {
                    let raw = d.str()?;
                    document_id = Some(raw.parse().map_err(|_| DecodeError::BadDocumentId)?);
                }
                "data" => data = Some(d.bytes()?.to_vec()),
                "count" => count = Some(d.u32()?),
                "sessionId" => session_id = Some(d.str()?.to_string()),
                "add" => add = decode_storage_ids(&mut d)?,
                "remove" => remove = decode_storage_ids(&mut d)?,
                "newHeads" => new_heads = Some(decode_new_heads(&mut d)?),
                _ => d.skip()?,
            }
        }

        let ty = ty.ok_or(DecodeError::MissingField("type"))?;
        let sender_id = sender_id.ok_or(DecodeError::MissingField("senderId"))?;
        let target_id = target_id.ok_or(DecodeError::MissingField("targetId"))?;
        match ty.as_str() {
            "sync" => Ok(RepoMessage::Sync {
                sender_id,
                target_id,
                document_id: document_id.ok_or(DecodeError::MissingField("documentId"))?,
                data: data.ok_or(DecodeError::MissingField("data"))?,
            }),
            "request" => Ok(RepoMessage::Request {
                sender_id,
                target_id,
                document_id: document_id.ok_or(DecodeError::MissingField("documentId"))?,
                data: data.ok_or(DecodeError::MissingField("data"))?,
            }),
            "doc-unavailable" => Ok(RepoMessage::DocUnavailable {
                sender_id,
                target_id,
                document_id: document_id.ok_or(DecodeError::MissingField("documentId"))?,
            }),
            "ephemeral" => Ok(RepoMessage::Ephemeral {
                sender_id,
                target_id,
                document_id: document_id.ok_or(DecodeError::MissingField("documentId"))?,
                count: count.ok_or(DecodeError::MissingField("count"))?,
                session_id: session_id.ok_or(DecodeError::MissingField("sessionId"))?,
                data: data.ok_or(DecodeError::MissingField("data"))?,
            }),
            "remote-subscription-change" => Ok(RepoMessage::RemoteSubscriptionChange {
                sender_id,
                target_id,
                add,
                remove,
            }),
            "remote-heads-changed" => Ok(RepoMessage::RemoteHeadsChanged {
                sender_id,
                target_id,
                document_id: document_id.ok_or(DecodeError::MissingField("documentId"))?,
                new_heads: new_heads.ok_or(DecodeError::MissingField("newHeads"))?,
            }),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

fn decode_storage_ids(d: &mut Decoder<'_>) -> Result<Vec<StorageId>, DecodeError> {
    let len = d
        .array()?
        .ok_or(DecodeError::Indefinite)?;
    let mut ids = Vec::with_capacity(len as usize);
    for _ in 0..len {
        ids.push(StorageId(d.str()?.to_string()));
    }
    Ok(ids)
}

fn decode_new_heads(
    d: &mut Decoder<'_>,
) -> Result<HashMap<StorageId, TimestampedHeads>, DecodeError> {
    let len = d
        .map()?
        .ok_or(DecodeError::Indefinite)?;
    let mut by_storage = HashMap::with_capacity(len as usize);
    for _ in 0..len {
        let storage_id = StorageId(d.str()?.to_string());
        let entry_len = d
            .map()?
            .ok_or(DecodeError::Indefinite)?;
        let mut heads: Option<Vec<ChangeHash>> = None;
        let mut timestamp: Option<i64> = None;
        for _ in 0..entry_len {
            match d.str()? {
                "heads" => {
                    let heads_len = d.array()?.ok_or(DecodeError::Indefinite)?;
                    let mut parsed = Vec::with_capacity(heads_len as usize);
                    for _ in 0..heads_len {
                        parsed.push(
                            d.str()?
                                .parse::<ChangeHash>()
                                .map_err(|_| DecodeError::BadChangeHash)?,
                        );
                    }
                    heads = Some(parsed);
                }
                "timestamp" => {
                    // Tolerate either integer width on the wire.
                    timestamp = Some(match d.datatype()? {
                        Type::U8 | Type::U16 | Type::U32 | Type::U64 => d.u64()? as i64,
                        _ => d.i64()?,
                    });
                }
                _ => d.skip()?,
            }
        }
        by_storage.insert(
            storage_id,
            TimestampedHeads {
                heads: heads.ok_or(DecodeError::MissingField("heads"))?,
                timestamp: timestamp.ok_or(DecodeError::MissingField("timestamp"))?,
            },
        );
    }
    Ok(by_storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> (PeerId, PeerId) {
        (PeerId::from("alice"), PeerId::from("bob"))
    }

    #[test]
    fn sync_and_ephemeral_round_trip() {
        let (alice, bob) = peers();
        let document_id = DocumentId::random();
        let sync = RepoMessage::Sync {
            sender_id: alice.clone(),
            target_id: bob.clone(),
            document_id,
            data: vec![1, 2, 3],
        };
        assert_eq!(RepoMessage::decode(&sync.encode()).unwrap(), sync);

        let ephemeral = RepoMessage::Ephemeral {
            sender_id: alice,
            target_id: bob,
            document_id,
            count: 7,
            session_id: "session-1".to_string(),
            data: vec![9, 9],
        };
        assert_eq!(RepoMessage::decode(&ephemeral.encode()).unwrap(), ephemeral);
    }

    #[test]
    fn remote_heads_round_trip() {
        let (alice, bob) = peers();
        let document_id = DocumentId::random();
        let head: ChangeHash = "0000000000000000000000000000000000000000000000000000000000000001"
            .parse()
            .unwrap();
        let mut new_heads = HashMap::new();
        new_heads.insert(
            StorageId::from("storage-a"),
            TimestampedHeads {
                heads: vec![head],
                timestamp: 1234,
            },
        );
        let msg = RepoMessage::RemoteHeadsChanged {
            sender_id: alice,
            target_id: bob,
            document_id,
            new_heads,
        };
        assert_eq!(RepoMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn subscription_change_omits_empty_sets() {
        let (alice, bob) = peers();
        let msg = RepoMessage::RemoteSubscriptionChange {
            sender_id: alice,
            target_id: bob,
            add: vec![StorageId::from("storage-a")],
            remove: vec![],
        };
        let decoded = RepoMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn rejects_missing_required_fields() {
        let (alice, bob) = peers();
        let document_id = DocumentId::random();
        let msg = RepoMessage::Sync {
            sender_id: alice,
            target_id: bob,
            document_id,
            data: vec![1],
        };
        // Re-encode by hand without the data field.
        let mut e = Encoder::new(Vec::new());
        e.map(4)
            .unwrap()
            .str("type")
            .unwrap()
            .str("sync")
            .unwrap()
            .str("senderId")
            .unwrap()
            .str("alice")
            .unwrap()
            .str("targetId")
            .unwrap()
            .str("bob")
            .unwrap()
            .str("documentId")
            .unwrap()
            .str(&msg.document_id().unwrap().to_string())
            .unwrap();
        let err = RepoMessage::decode(&e.into_writer()).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField("data")));
    }
}
