//! Cryptographic primitives for the threadwire protocol engine.
//!
//! Everything here is a synchronous, pure function: key generation, ECDH
//! agreement, AES-GCM, RFC 7638 thumbprints, and password-based wrapping of
//! private key material. Only the storage round trip and the engine
//! operations built on top of these primitives are `async`.
//!
//! # Security considerations
//!
//! - All private key material is held behind types that zeroize on drop
//!   (`p384::SecretKey` and `p384::ecdsa::SigningKey` both do this internally).
//! - IVs are always drawn from the system CSPRNG and must never be reused
//!   under the same key.
//! - Password unwrap failures and ciphertext authentication failures are
//!   distinguished (`BadPassword` vs `BadCiphertext`) so callers cannot be
//!   misled about which step failed.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::Hmac;
use p384::ecdsa::signature::{Signer as _, Verifier as _};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::elliptic_curve::sec1::ToEncodedPoint;
use p384::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// An EC public key in JWK form, restricted to the single curve this crate
/// uses throughout: P-384.
///
/// `d` is present only on the private (wrapped-at-rest) form of the key and
/// is never included in a thumbprint or in any value handed to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type; always `"EC"`.
    pub kty: String,
    /// Curve; always `"P-384"`.
    pub crv: String,
    /// X coordinate, base64url (no padding).
    pub x: String,
    /// Y coordinate, base64url (no padding).
    pub y: String,
    /// Private scalar, base64url (no padding). Only set on private JWKs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl Jwk {
    /// Returns the public-only form of this JWK (strips `d` if present).
    #[must_use]
    pub fn public(&self) -> Jwk {
        Jwk {
            kty: self.kty.clone(),
            crv: self.crv.clone(),
            x: self.x.clone(),
            y: self.y.clone(),
            d: None,
        }
    }
}

/// A generated or imported ECDSA (P-384) keypair.
pub struct EcdsaKeyPair {
    signing_key: SigningKey,
    /// The public half, exportable to peers.
    pub public: Jwk,
}

impl EcdsaKeyPair {
    /// Signs `data`, returning the fixed-width `R || S` encoding ES384 requires.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(data);
        signature.to_bytes().to_vec()
    }

    /// Exports the private key as a JWK with `d` set, for password wrapping.
    #[must_use]
    pub fn private_jwk(&self) -> Jwk {
        let mut jwk = self.public.clone();
        jwk.d = Some(URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()));
        jwk
    }

    /// Reconstructs a keypair from a private JWK (as produced by `private_jwk`).
    pub fn from_private_jwk(jwk: &Jwk) -> Result<Self> {
        let d = jwk
            .d
            .as_deref()
            .ok_or_else(|| Error::MalformedEnvelope("jwk missing private scalar".into()))?;
        let bytes = URL_SAFE_NO_PAD.decode(d)?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| Error::MalformedEnvelope(format!("invalid ECDSA private key: {e}")))?;
        let public = jwk_from_verifying_key(signing_key.verifying_key());
        Ok(Self { signing_key, public })
    }
}

/// Generates a fresh ECDSA (P-384) keypair, usable for signing and verification.
#[must_use]
pub fn gen_ecdsa() -> EcdsaKeyPair {
    let signing_key = SigningKey::random(&mut OsRng);
    let public = jwk_from_verifying_key(signing_key.verifying_key());
    EcdsaKeyPair {
        signing_key,
        public,
    }
}

/// Verifies a fixed-width ES384 signature against a public JWK.
pub fn verify_ecdsa(jwk: &Jwk, data: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = verifying_key_from_jwk(jwk)?;
    let signature = Signature::from_slice(signature).map_err(|_| Error::BadSignature)?;
    verifying_key
        .verify(data, &signature)
        .map_err(|_| Error::BadSignature)
}

/// A generated or imported ECDH (P-384) keypair.
pub struct EcdhKeyPair {
    secret: SecretKey,
    /// The public half, exportable to peers.
    pub public: Jwk,
}

impl EcdhKeyPair {
    /// Derives the shared AES-256-GCM key with a peer's public JWK.
    pub fn derive_shared(&self, their_public: &Jwk) -> Result<[u8; 32]> {
        derive_shared(&self.secret, their_public)
    }

    /// Exports the private key as a JWK with `d` set, for self-encrypted backup.
    #[must_use]
    pub fn private_jwk(&self) -> Jwk {
        let mut jwk = self.public.clone();
        jwk.d = Some(URL_SAFE_NO_PAD.encode(self.secret.to_bytes()));
        jwk
    }

    /// Reconstructs a keypair from a private JWK (as produced by `private_jwk`).
    pub fn from_private_jwk(jwk: &Jwk) -> Result<Self> {
        let d = jwk
            .d
            .as_deref()
            .ok_or_else(|| Error::MalformedEnvelope("jwk missing private scalar".into()))?;
        let bytes = URL_SAFE_NO_PAD.decode(d)?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| Error::MalformedEnvelope(format!("invalid ECDH private key: {e}")))?;
        let public_key = PublicKey::from_secret_scalar(&secret.to_nonzero_scalar());
        Ok(Self {
            secret,
            public: jwk_from_public_key(&public_key),
        })
    }
}

/// Generates a fresh ECDH (P-384) keypair.
#[must_use]
pub fn gen_ecdh() -> EcdhKeyPair {
    let secret = SecretKey::random(&mut OsRng);
    let public_key = PublicKey::from_secret_scalar(&secret.to_nonzero_scalar());
    EcdhKeyPair {
        secret,
        public: jwk_from_public_key(&public_key),
    }
}

/// Derives a 256-bit AES-GCM key from an ECDH private key and a peer's public
/// JWK. Both sides, with (priv, pub) swapped, derive an equal key.
pub fn derive_shared(private: &SecretKey, their_public: &Jwk) -> Result<[u8; 32]> {
    let public_key = public_key_from_jwk(their_public)?;
    let shared = p384::ecdh::diffie_hellman(private.to_nonzero_scalar(), public_key.as_affine());
    Ok(Sha256::digest(shared.raw_secret_bytes()).into())
}

fn public_key_from_jwk(jwk: &Jwk) -> Result<PublicKey> {
    let x = URL_SAFE_NO_PAD.decode(&jwk.x)?;
    let y = URL_SAFE_NO_PAD.decode(&jwk.y)?;
    let mut sec1 = Vec::with_capacity(1 + x.len() + y.len());
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    PublicKey::from_sec1_bytes(&sec1)
        .map_err(|e| Error::MalformedEnvelope(format!("invalid P-384 public key: {e}")))
}

fn verifying_key_from_jwk(jwk: &Jwk) -> Result<VerifyingKey> {
    let public_key = public_key_from_jwk(jwk)?;
    Ok(VerifyingKey::from(public_key))
}

fn jwk_from_public_key(public_key: &PublicKey) -> Jwk {
    let point = public_key.to_encoded_point(false);
    Jwk {
        kty: "EC".to_string(),
        crv: "P-384".to_string(),
        x: URL_SAFE_NO_PAD.encode(point.x().expect("uncompressed point has x")),
        y: URL_SAFE_NO_PAD.encode(point.y().expect("uncompressed point has y")),
        d: None,
    }
}

fn jwk_from_verifying_key(verifying_key: &VerifyingKey) -> Jwk {
    jwk_from_public_key(&PublicKey::from(*verifying_key))
}

/// Draws a fresh 12-byte IV from the system CSPRNG. Never reuse under the same key.
#[must_use]
pub fn random_iv() -> [u8; 12] {
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypts `plaintext` under `key`/`iv`, appending the 16-byte AES-GCM tag.
pub fn aes_gcm_encrypt(key: &[u8; 32], iv: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| Error::BadCiphertext)
}

/// Decrypts `ciphertext` (tag appended) under `key`/`iv`.
pub fn aes_gcm_decrypt(key: &[u8; 32], iv: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| Error::BadCiphertext)
}

/// Decodes base64url (no padding) first, falling back to standard base64
/// (with and without padding) for defensive compatibility with a
/// non-conforming peer. This crate only ever *emits* base64url; see the
/// `iv` fields of `ReplyMessage`/`SelfEncrypted` payloads.
pub fn decode_flexible(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .or_else(|_| base64::engine::general_purpose::STANDARD.decode(s))
        .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(s))
        .map_err(Error::from)
}

/// The RFC 7638 thumbprint of a public JWK: base64url(SHA-256(canonical JSON)).
///
/// Canonicalization for EC keys is the members `{crv, kty, x, y}` in
/// lexicographic order with no whitespace; `d` (if present) is never included.
#[must_use]
pub fn jwk_thumbprint(jwk: &Jwk) -> String {
    let canonical = format!(
        r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
        jwk.crv, jwk.kty, jwk.x, jwk.y
    );
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

/// PBKDF2-HMAC-SHA256 parameters governing password-based private key wrapping.
///
/// The wrapped blob records its own salt and iteration count, so raising the
/// default here never breaks decoding of previously wrapped blobs.
#[derive(Debug, Clone, Copy)]
pub struct KdfParams {
    /// PBKDF2 round count.
    pub iterations: u32,
    /// Random salt length in bytes.
    pub salt_len: usize,
}

impl Default for KdfParams {
    fn default() -> Self {
        // Current OWASP baseline for PBKDF2-HMAC-SHA256.
        Self {
            iterations: 600_000,
            salt_len: 16,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WrappedKey {
    salt: String,
    iterations: u32,
    iv: String,
    ciphertext: String,
}

/// Wraps a private JWK under `password`, returning an opaque JSON string
/// (`{salt, iterations, iv, ciphertext}`, all base64url) suitable for storage.
pub fn wrap_private(jwk: &Jwk, password: &str, params: KdfParams) -> Result<String> {
    let mut salt = vec![0u8; params.salt_len];
    OsRng.fill_bytes(&mut salt);

    let key = derive_wrapping_key(password, &salt, params.iterations)?;
    let iv = random_iv();
    let plaintext = Zeroizing::new(serde_json::to_vec(jwk)?);
    let ciphertext = aes_gcm_encrypt(&key, &iv, &plaintext)?;

    let blob = WrappedKey {
        salt: URL_SAFE_NO_PAD.encode(&salt),
        iterations: params.iterations,
        iv: URL_SAFE_NO_PAD.encode(iv),
        ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
    };
    Ok(serde_json::to_string(&blob)?)
}

/// Unwraps a private JWK previously produced by `wrap_private`, failing
/// `BadPassword` if the password does not match (the AES-GCM tag will not
/// verify under the wrong derived key).
pub fn unwrap_private(blob: &str, password: &str) -> Result<Jwk> {
    let blob: WrappedKey = serde_json::from_str(blob)?;
    let salt = URL_SAFE_NO_PAD.decode(&blob.salt)?;
    let iv_bytes = URL_SAFE_NO_PAD.decode(&blob.iv)?;
    let iv: [u8; 12] = iv_bytes
        .try_into()
        .map_err(|_| Error::MalformedEnvelope("wrapped key has invalid iv length".into()))?;
    let ciphertext = URL_SAFE_NO_PAD.decode(&blob.ciphertext)?;

    let key = derive_wrapping_key(password, &salt, blob.iterations)?;
    let plaintext =
        Zeroizing::new(aes_gcm_decrypt(&key, &iv, &ciphertext).map_err(|_| Error::BadPassword)?);
    Ok(serde_json::from_slice(&plaintext)?)
}

fn derive_wrapping_key(password: &str, salt: &[u8], iterations: u32) -> Result<Zeroizing<[u8; 32]>> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, &mut *key)
        .map_err(|_| Error::BadPassword)?;
    Ok(key)
}
