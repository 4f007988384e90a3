//! The identity manager: generate, load, and back up a client's long-term
//! identity (an ECDSA signing keypair plus an ECDH "storage" keypair).
//!
//! Private key material is held in memory only for the lifetime of the
//! returned [`Client`]; both `EcdsaKeyPair` and `EcdhKeyPair` wrap
//! `p384`/`elliptic-curve` secret types that zeroize on drop, so no extra
//! wrapper is needed here to satisfy that requirement.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::{gen_ecdh, gen_ecdsa, jwk_thumbprint, unwrap_private, wrap_private, EcdhKeyPair, EcdsaKeyPair, Jwk, KdfParams};
use crate::error::{Error, Result};
use crate::jws::{self, JwsHeader};
use crate::storage::{Storage, StorageValue};

/// A public JWK paired with its password-wrapped private half, as persisted
/// under `identity:<thumbprint>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// The public key.
    pub jwk: Jwk,
    /// The private key, wrapped under a password (see `crypto::wrap_private`).
    pub private: String,
}

/// The stored record for one identity: a signing keypair and a storage
/// (ECDH) keypair, both password-wrapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// The long-term ECDSA signing keypair.
    pub id: KeyRecord,
    /// The long-term ECDH "storage" keypair, used for self-encryption.
    pub storage: KeyRecord,
}

/// The payload of an `IdentityBackup` JWS (see `make_backup`/`restore_backup`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityBackupPayload {
    /// The identity's thumbprint.
    pub thumbprint: String,
    /// The signing keypair record.
    pub id: KeyRecord,
    /// The storage keypair record.
    pub storage: KeyRecord,
}

/// A loaded client: the thumbprint and unwrapped in-memory keypairs.
pub struct Client {
    /// The RFC 7638 thumbprint of `id.public`; this client's stable id.
    pub thumbprint: String,
    /// The long-term signing keypair.
    pub id: EcdsaKeyPair,
    /// The long-term ECDH "storage" keypair.
    pub storage: EcdhKeyPair,
}

fn identity_key(thumbprint: &str) -> String {
    format!("identity:{thumbprint}")
}

/// Generates a new identity, wraps both private halves under `password`, and
/// persists the record to `storage`.
pub async fn generate(storage: &dyn Storage, password: &str) -> Result<Client> {
    generate_with_params(storage, password, KdfParams::default()).await
}

/// As [`generate`], but with explicit PBKDF2 parameters.
pub async fn generate_with_params(
    storage: &dyn Storage,
    password: &str,
    params: KdfParams,
) -> Result<Client> {
    let id_kp = gen_ecdsa();
    let storage_kp = gen_ecdh();
    let thumbprint = jwk_thumbprint(&id_kp.public);

    let record = IdentityRecord {
        id: KeyRecord {
            jwk: id_kp.public.clone(),
            private: wrap_private(&id_kp.private_jwk(), password, params)?,
        },
        storage: KeyRecord {
            jwk: storage_kp.public.clone(),
            private: wrap_private(&storage_kp.private_jwk(), password, params)?,
        },
    };
    storage
        .set(&identity_key(&thumbprint), StorageValue::Identity(record))
        .await?;

    info!(thumbprint = %thumbprint, "generated new identity");
    Ok(Client {
        thumbprint,
        id: id_kp,
        storage: storage_kp,
    })
}

/// Loads an identity by thumbprint, unwrapping both private halves under
/// `password`. Fails `NotFound` if no such identity exists, `BadPassword` if
/// the password does not unwrap it.
pub async fn load(storage: &dyn Storage, thumbprint: &str, password: &str) -> Result<Client> {
    let key = identity_key(thumbprint);
    let record = storage
        .get(&key)
        .await?
        .ok_or_else(|| Error::NotFound { key: key.clone() })?
        .into_identity()?;

    let id_private = unwrap_private(&record.id.private, password)?;
    let storage_private = unwrap_private(&record.storage.private, password)?;

    let id_kp = EcdsaKeyPair::from_private_jwk(&id_private)?;
    let storage_kp = EcdhKeyPair::from_private_jwk(&storage_private)?;

    debug!(thumbprint = %thumbprint, "loaded identity");
    Ok(Client {
        thumbprint: thumbprint.to_string(),
        id: id_kp,
        storage: storage_kp,
    })
}

impl Client {
    /// Serializes this identity, wraps both private halves under `password`,
    /// and signs the result with the identity's own signing key — an
    /// offline-storable, self-verifying backup artifact.
    pub fn make_backup(&self, password: &str) -> Result<String> {
        self.make_backup_with_params(password, KdfParams::default())
    }

    /// As [`Client::make_backup`], but with explicit PBKDF2 parameters.
    pub fn make_backup_with_params(&self, password: &str, params: KdfParams) -> Result<String> {
        let payload = IdentityBackupPayload {
            thumbprint: self.thumbprint.clone(),
            id: KeyRecord {
                jwk: self.id.public.clone(),
                private: wrap_private(&self.id.private_jwk(), password, params)?,
            },
            storage: KeyRecord {
                jwk: self.storage.public.clone(),
                private: wrap_private(&self.storage.private_jwk(), password, params)?,
            },
        };
        let header = JwsHeader::embedding(self.id.public.clone());
        jws::sign(&header, &payload, &self.id)
    }
}

/// Restores an identity from a backup JWS produced by [`Client::make_backup`],
/// writing it into `storage` under `identity:<thumbprint>` exactly as
/// [`generate`] would have. Idempotent: restoring the same backup twice
/// leaves storage unchanged the second time. Fails `BadPassword` (without
/// mutating storage) if `password` does not unwrap the backup.
pub async fn restore_backup(storage: &dyn Storage, jws: &str, password: &str) -> Result<String> {
    let parsed = jws::parse::<IdentityBackupPayload>(jws, None)?;

    let id_private = unwrap_private(&parsed.payload.id.private, password)?;
    let storage_private = unwrap_private(&parsed.payload.storage.private, password)?;

    let thumbprint = parsed.payload.thumbprint;
    let key = identity_key(&thumbprint);
    if storage.has(&key).await? {
        return Ok(thumbprint);
    }

    let record = IdentityRecord {
        id: KeyRecord {
            jwk: parsed.payload.id.jwk,
            private: wrap_private(&id_private, password, KdfParams::default())?,
        },
        storage: KeyRecord {
            jwk: parsed.payload.storage.jwk,
            private: wrap_private(&storage_private, password, KdfParams::default())?,
        },
    };
    storage
        .set(&key, StorageValue::Identity(record))
        .await?;
    info!(thumbprint = %thumbprint, "restored identity from backup");
    Ok(thumbprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn generate_then_load_round_trips() {
        let storage = MemoryStorage::new();
        let client = generate(&storage, "hunter2").await.unwrap();
        let loaded = load(&storage, &client.thumbprint, "hunter2").await.unwrap();
        assert_eq!(loaded.thumbprint, client.thumbprint);
        assert_eq!(loaded.id.public, client.id.public);
        assert_eq!(loaded.storage.public, client.storage.public);
    }

    #[tokio::test]
    async fn load_with_wrong_password_fails() {
        let storage = MemoryStorage::new();
        let client = generate(&storage, "hunter2").await.unwrap();
        let err = load(&storage, &client.thumbprint, "wrong").await.unwrap_err();
        assert!(matches!(err, Error::BadPassword));
    }

    #[tokio::test]
    async fn load_unknown_identity_is_not_found() {
        let storage = MemoryStorage::new();
        let err = load(&storage, "nonexistent", "pw").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn backup_round_trip() {
        let storage = MemoryStorage::new();
        let client = generate(&storage, "hunter2").await.unwrap();
        let backup = client.make_backup("backup-pw").unwrap();

        let fresh = MemoryStorage::new();
        let thumbprint = restore_backup(&fresh, &backup, "backup-pw").await.unwrap();
        assert_eq!(thumbprint, client.thumbprint);

        let restored = load(&fresh, &thumbprint, "backup-pw").await.unwrap();
        assert_eq!(restored.id.public, client.id.public);
    }

    #[tokio::test]
    async fn restore_with_wrong_password_does_not_mutate_storage() {
        let storage = MemoryStorage::new();
        let client = generate(&storage, "hunter2").await.unwrap();
        let backup = client.make_backup("backup-pw").unwrap();

        let fresh = MemoryStorage::new();
        let err = restore_backup(&fresh, &backup, "nope").await.unwrap_err();
        assert!(matches!(err, Error::BadPassword));
        assert!(!fresh.has(&identity_key(&client.thumbprint)).await.unwrap());
    }

    #[tokio::test]
    async fn restore_is_idempotent() {
        let storage = MemoryStorage::new();
        let client = generate(&storage, "hunter2").await.unwrap();
        let backup = client.make_backup("backup-pw").unwrap();

        let fresh = MemoryStorage::new();
        restore_backup(&fresh, &backup, "backup-pw").await.unwrap();
        let first = fresh
            .get(&identity_key(&client.thumbprint))
            .await
            .unwrap()
            .unwrap()
            .into_identity()
            .unwrap();

        restore_backup(&fresh, &backup, "backup-pw").await.unwrap();
        let second = fresh
            .get(&identity_key(&client.thumbprint))
            .await
            .unwrap()
            .unwrap()
            .into_identity()
            .unwrap();

        assert_eq!(first.id.private, second.id.private);
    }
}
