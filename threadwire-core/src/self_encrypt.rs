//! Self-encryption: encrypting data to the client's own long-term storage
//! key, used to back up ephemeral thread private keys.
//!
//! `encrypt_to_self` generates a fresh ECDH keypair, agrees a secret with the
//! client's own storage public key, AES-GCM-encrypts under it, and signs the
//! result with the client's identity key. It then immediately verifies and
//! decrypts its own output before returning — a construction-time self-test
//! that catches wiring bugs before anything is persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::crypto::{aes_gcm_decrypt, aes_gcm_encrypt, decode_flexible, gen_ecdh, random_iv, Jwk};
use crate::error::{Error, Result};
use crate::identity::Client;
use crate::jws::{self, JwsHeader};

/// The payload of a `SelfEncrypted` JWS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfEncryptedPayload {
    /// AES-GCM ciphertext (tag appended), base64url.
    pub message: String,
    /// The IV used for `message`, base64url.
    pub iv: String,
    /// The fresh ECDH public key used to derive the encryption secret.
    pub epk: Jwk,
}

/// Encrypts `plaintext` to `client`'s own storage key and signs the result
/// with `client`'s identity key, returning a compact `SelfEncrypted` JWS.
///
/// Fails `SelfEncryptMismatch` if the immediate self-verify/self-decrypt
/// check disagrees with the input — in that case nothing should be
/// persisted by the caller.
pub fn encrypt_to_self(client: &Client, plaintext: &str) -> Result<String> {
    let epk = gen_ecdh();
    let secret = epk.derive_shared(&client.storage.public)?;
    let iv = random_iv();
    let ciphertext = aes_gcm_encrypt(&secret, &iv, plaintext.as_bytes())?;

    let payload = SelfEncryptedPayload {
        message: URL_SAFE_NO_PAD.encode(ciphertext),
        iv: URL_SAFE_NO_PAD.encode(iv),
        epk: epk.public,
    };
    let header = JwsHeader::embedding(client.id.public.clone());
    let signed = jws::sign(&header, &payload, &client.id)?;

    match decrypt_from_self(client, &signed) {
        Ok(round_tripped) if round_tripped == plaintext => Ok(signed),
        _ => Err(Error::SelfEncryptMismatch),
    }
}

/// Decrypts a `SelfEncrypted` JWS produced by `encrypt_to_self` for the same
/// client. Fails `BadSignature` if it was not signed by `client`'s identity
/// key.
pub fn decrypt_from_self(client: &Client, jws: &str) -> Result<String> {
    let parsed = jws::parse::<SelfEncryptedPayload>(jws, Some(&client.id.public))?;

    let secret = client.storage.derive_shared(&parsed.payload.epk)?;
    let iv_bytes = decode_flexible(&parsed.payload.iv)?;
    let iv: [u8; 12] = iv_bytes
        .try_into()
        .map_err(|_| Error::MalformedEnvelope("self-encrypted iv has invalid length".to_string()))?;
    let ciphertext = decode_flexible(&parsed.payload.message)?;

    let plaintext = aes_gcm_decrypt(&secret, &iv, &ciphertext)?;
    String::from_utf8(plaintext).map_err(|_| Error::BadCiphertext)
}
