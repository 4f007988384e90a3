//! Compact JWS (RFC 7515) construction and verification.
//!
//! Every signed artifact in this crate — invitations, replies, self-encrypted
//! backups — is a compact JWS: `base64url(header) "." base64url(payload) "."
//! base64url(signature)`. The header always carries `alg: "ES384"` and may
//! embed the signer's public key under `jwk` (used for the first message of
//! a thread, and for self-encryption, where the recipient has no other way
//! to learn the verifying key).
//!
//! ES384 signatures are the fixed-width `R || S` concatenation, not the
//! DER/ASN.1 encoding `p384::ecdsa` produces by default; `crypto::sign`/
//! `crypto::verify_ecdsa` already do that conversion, so this module never
//! touches signature bytes beyond base64url-decoding them.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::{verify_ecdsa, EcdsaKeyPair, Jwk};
use crate::error::{Error, Result};

/// The protected header of a threadwire JWS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwsHeader {
    /// Signature algorithm; always `"ES384"`.
    pub alg: String,
    /// The signer's public key, embedded when the recipient has no other way
    /// to learn it yet (first reply in a thread, self-encrypted backups).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
}

impl JwsHeader {
    /// A bare ES384 header with no embedded key (detached-key verification mode).
    #[must_use]
    pub fn detached() -> Self {
        Self {
            alg: "ES384".to_string(),
            jwk: None,
        }
    }

    /// An ES384 header embedding `jwk` (embedded-key verification mode).
    #[must_use]
    pub fn embedding(jwk: Jwk) -> Self {
        Self {
            alg: "ES384".to_string(),
            jwk: Some(jwk),
        }
    }
}

/// A parsed JWS: typed header and typed payload.
#[derive(Debug, Clone)]
pub struct Parsed<P> {
    /// The decoded protected header.
    pub header: JwsHeader,
    /// The decoded payload.
    pub payload: P,
}

fn split(jws: &str) -> Result<(&str, &str, &str)> {
    let mut parts = jws.split('.');
    let (Some(h), Some(p), Some(s), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::MalformedEnvelope(
            "jws must have exactly three dot-separated parts".to_string(),
        ));
    };
    Ok((h, p, s))
}

/// Signs `payload` under `header` with `key`, returning a compact JWS string.
pub fn sign<P: Serialize>(header: &JwsHeader, payload: &P, key: &EcdsaKeyPair) -> Result<String> {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
    let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?);
    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature = key.sign(signing_input.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(signature);
    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Decodes and type-checks a JWS, verifying it when a key is available.
///
/// - If `pub_key` is supplied, verification happens against that key.
/// - Else if the header embeds a `jwk`, verification happens against it.
/// - Else the payload is returned unverified. This is deliberate: the thread
///   engine sometimes needs to read `re` from an incoming reply before it
///   knows which key should have signed it, and it must not verify with the
///   wrong key by mistake. Callers that take this path must verify (or
///   recurse into a call that does) before persisting anything derived from
///   the payload.
pub fn parse<P: DeserializeOwned>(jws: &str, pub_key: Option<&Jwk>) -> Result<Parsed<P>> {
    let (header_part, payload_part, sig_part) = split(jws)?;

    let header: JwsHeader = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_part)?)?;
    let payload: P = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload_part)?)?;

    if let Some(verifier) = pub_key.or(header.jwk.as_ref()) {
        let signing_input = format!("{header_part}.{payload_part}");
        let signature = URL_SAFE_NO_PAD.decode(sig_part)?;
        verify_ecdsa(verifier, signing_input.as_bytes(), &signature)?;
    }

    Ok(Parsed { header, payload })
}

/// Returns whether a JWS verifies. With no `pub_key`: uses the embedded
/// `jwk` if present, else fails (returns `false`, never an error — an
/// unverifiable envelope is simply not valid).
pub fn verify(jws: &str, pub_key: Option<&Jwk>) -> Result<bool> {
    let (header_part, payload_part, sig_part) = split(jws)?;
    let header: JwsHeader = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_part)?)?;

    let Some(verifier) = pub_key.or(header.jwk.as_ref()) else {
        return Ok(false);
    };

    let signing_input = format!("{header_part}.{payload_part}");
    let signature = URL_SAFE_NO_PAD.decode(sig_part)?;
    Ok(verify_ecdsa(verifier, signing_input.as_bytes(), &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::gen_ecdsa;
    use serde_json::{json, Value};

    #[test]
    fn sign_and_parse_embedded_key() {
        let key = gen_ecdsa();
        let header = JwsHeader::embedding(key.public.clone());
        let payload = json!({"hello": "world"});
        let jws = sign(&header, &payload, &key).unwrap();

        let parsed: Parsed<Value> = parse(&jws, None).unwrap();
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.header.jwk.unwrap(), key.public);
    }

    #[test]
    fn sign_and_parse_detached_key() {
        let key = gen_ecdsa();
        let header = JwsHeader::detached();
        let payload = json!({"n": 1});
        let jws = sign(&header, &payload, &key).unwrap();

        let parsed: Parsed<Value> = parse(&jws, Some(&key.public)).unwrap();
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn parse_without_any_key_is_unverified() {
        let key = gen_ecdsa();
        let header = JwsHeader::detached();
        let payload = json!({"n": 1});
        let jws = sign(&header, &payload, &key).unwrap();

        // No embedded jwk and no pub_key supplied: returns payload, doesn't error.
        let parsed: Parsed<Value> = parse(&jws, None).unwrap();
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = gen_ecdsa();
        let header = JwsHeader::embedding(key.public.clone());
        let payload = json!({"n": 1});
        let jws = sign(&header, &payload, &key).unwrap();

        let mut parts: Vec<&str> = jws.split('.').collect();
        let mut payload_bytes = URL_SAFE_NO_PAD.decode(parts[1]).unwrap();
        *payload_bytes.last_mut().unwrap() ^= 0xff;
        let tampered_payload = URL_SAFE_NO_PAD.encode(payload_bytes);
        parts[1] = &tampered_payload;
        let tampered = parts.join(".");

        let result: Result<Parsed<Value>> = parse(&tampered, None);
        assert!(result.is_err());
    }

    #[test]
    fn verify_with_no_key_available_is_false() {
        let key = gen_ecdsa();
        let header = JwsHeader::detached();
        let payload = json!({"n": 1});
        let jws = sign(&header, &payload, &key).unwrap();
        assert!(!verify(&jws, None).unwrap());
    }
}
