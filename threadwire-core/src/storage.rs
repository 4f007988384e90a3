//! The storage adapter: a narrow key/value/append capability the engine is
//! built against, and an in-memory reference implementation of it.
//!
//! The engine never touches a filesystem or database directly — it holds a
//! `&dyn Storage` and reads/writes through the eight namespaces the protocol
//! uses (`identity:`, `invitation:`, `public-key:`, `thread-info:`,
//! `encrypted-thread-key:`, `threads:`, `messages:`, `message-id:`). Values
//! are modeled as a tagged `StorageValue` rather than bare JSON so a caller
//! cannot, say, `set` an `Identity` under a `messages:` key without a type
//! error at the call site.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::crypto::Jwk;
use crate::error::{Error, Result};
use crate::identity::IdentityRecord;
use crate::thread::ThreadInfo;

/// A value stored under one of the protocol's storage namespaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StorageValue {
    /// `identity:<thumbprint>`
    Identity(IdentityRecord),
    /// `invitation:<thumbprint>` — the signed invitation JWS.
    Invitation(String),
    /// `public-key:<thumbprint>` — a counterparty's long-term identity JWK.
    PublicKey(Jwk),
    /// `thread-info:<thumbprint>`
    ThreadInfo(ThreadInfo),
    /// `encrypted-thread-key:<thumbprint>` — a `SelfEncrypted` JWS.
    EncryptedThreadKey(String),
    /// `threads:<client thumbprint>` — append-only list of thread thumbprints.
    ThreadIds(Vec<String>),
    /// `messages:<thread thumbprint>` — append-only list of message JWSes.
    Messages(Vec<String>),
    /// `message-id:<thread thumbprint>` — hex-encoded counter.
    MessageId(String),
}

impl StorageValue {
    /// Wraps a single thread thumbprint as an appendable `ThreadIds` item.
    #[must_use]
    pub fn thread_id(id: impl Into<String>) -> Self {
        StorageValue::ThreadIds(vec![id.into()])
    }

    /// Wraps a single message JWS as an appendable `Messages` item.
    #[must_use]
    pub fn message(jws: impl Into<String>) -> Self {
        StorageValue::Messages(vec![jws.into()])
    }
}

macro_rules! value_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        /// Extracts the
        #[doc = stringify!($variant)]
        /// variant, failing `MalformedEnvelope` if the stored value has a
        /// different shape than the namespace it was read from implies.
        pub fn $name(self) -> Result<$ty> {
            match self {
                StorageValue::$variant(v) => Ok(v),
                _ => Err(Error::MalformedEnvelope(format!(
                    "expected {} storage value",
                    stringify!($variant)
                ))),
            }
        }
    };
}

impl StorageValue {
    value_accessor!(into_identity, Identity, IdentityRecord);
    value_accessor!(into_invitation, Invitation, String);
    value_accessor!(into_public_key, PublicKey, Jwk);
    value_accessor!(into_thread_info, ThreadInfo, ThreadInfo);
    value_accessor!(into_encrypted_thread_key, EncryptedThreadKey, String);
    value_accessor!(into_thread_ids, ThreadIds, Vec<String>);
    value_accessor!(into_messages, Messages, Vec<String>);
    value_accessor!(into_message_id, MessageId, String);
}

/// A narrow key/value/append capability the engine is built against.
///
/// Keys are colon-delimited strings namespaced per the protocol (`identity:`,
/// `invitation:`, etc). Implementations need not be transactional; the engine
/// orders its writes so that a crash mid-operation leaves recoverable state
/// (see the module docs on `thread` for the exact ordering guarantees).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads a value, or `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<StorageValue>>;

    /// Writes a value, replacing whatever was previously stored at `key`.
    async fn set(&self, key: &str, value: StorageValue) -> Result<()>;

    /// Reports whether `key` is present.
    async fn has(&self, key: &str) -> Result<bool>;

    /// Appends one item to a list-valued key (`threads:*` or `messages:*`),
    /// preserving insertion order. Creates the list if absent.
    async fn append(&self, key: &str, item: StorageValue) -> Result<()>;
}

/// An in-memory `Storage` implementation, `tokio::sync::RwLock`-guarded.
///
/// Used by this crate's own tests and suitable as a reference for host
/// integrators who have not yet wired up a persistent backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, StorageValue>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<StorageValue>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: StorageValue) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(key))
    }

    async fn append(&self, key: &str, item: StorageValue) -> Result<()> {
        let mut entries = self.entries.write().await;
        match item {
            StorageValue::ThreadIds(mut new_ids) => {
                match entries.get_mut(key) {
                    Some(StorageValue::ThreadIds(existing)) => existing.append(&mut new_ids),
                    Some(_) => {
                        return Err(Error::MalformedEnvelope(format!(
                            "cannot append thread id onto non-list value at {key}"
                        )))
                    }
                    None => {
                        entries.insert(key.to_string(), StorageValue::ThreadIds(new_ids));
                    }
                }
                Ok(())
            }
            StorageValue::Messages(mut new_msgs) => {
                match entries.get_mut(key) {
                    Some(StorageValue::Messages(existing)) => existing.append(&mut new_msgs),
                    Some(_) => {
                        return Err(Error::MalformedEnvelope(format!(
                            "cannot append message onto non-list value at {key}"
                        )))
                    }
                    None => {
                        entries.insert(key.to_string(), StorageValue::Messages(new_msgs));
                    }
                }
                Ok(())
            }
            _ => Err(Error::MalformedEnvelope(
                "append only supports ThreadIds and Messages values".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let storage = MemoryStorage::new();
        storage
            .set("message-id:abc", StorageValue::MessageId("1a".to_string()))
            .await
            .unwrap();
        let value = storage.get("message-id:abc").await.unwrap().unwrap();
        assert_eq!(value.into_message_id().unwrap(), "1a");
    }

    #[tokio::test]
    async fn append_creates_then_preserves_order() {
        let storage = MemoryStorage::new();
        storage
            .append("messages:t1", StorageValue::message("jws-1"))
            .await
            .unwrap();
        storage
            .append("messages:t1", StorageValue::message("jws-2"))
            .await
            .unwrap();

        let list = storage
            .get("messages:t1")
            .await
            .unwrap()
            .unwrap()
            .into_messages()
            .unwrap();
        assert_eq!(list, vec!["jws-1".to_string(), "jws-2".to_string()]);
    }

    #[tokio::test]
    async fn has_reflects_presence() {
        let storage = MemoryStorage::new();
        assert!(!storage.has("threads:c1").await.unwrap());
        storage
            .append("threads:c1", StorageValue::thread_id("t1"))
            .await
            .unwrap();
        assert!(storage.has("threads:c1").await.unwrap());
    }
}
