//! The thread engine: invitations, the invitation/reply handshake, per-thread
//! message append/verify/decrypt, and message-id sequencing.
//!
//! Every operation here either *produces* a signed artifact (an invitation,
//! a reply) or *ingests* one (`append_thread`). Verification always precedes
//! any storage write derived from an incoming artifact's content — see
//! `append_thread_unknown`, which parses unverified only far enough to route
//! by `re`, then verifies before anything is persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::{
    aes_gcm_decrypt, aes_gcm_encrypt, decode_flexible, gen_ecdh, jwk_thumbprint, random_iv,
    EcdhKeyPair, Jwk,
};
use crate::error::{Error, Result};
use crate::identity::Client;
use crate::jws::{self, JwsHeader};
use crate::self_encrypt;
use crate::storage::{Storage, StorageValue};

/// Strictly less than `2^53 / 2`, the largest value a `messageId` may hold.
const MAX_MESSAGE_ID: u64 = 1u64 << 52;

fn encode_message_id(id: u64) -> String {
    format!("{id:x}")
}

fn decode_message_id(s: &str) -> Result<u64> {
    u64::from_str_radix(s, 16)
        .map_err(|_| Error::MalformedEnvelope(format!("invalid messageId: {s}")))
}

fn random_message_id() -> u64 {
    let mut buf = [0u8; 8];
    OsRng.fill_bytes(&mut buf);
    u64::from_be_bytes(buf) % MAX_MESSAGE_ID
}

/// The payload of a signed `Invitation` JWS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationPayload {
    /// Hex-encoded initial message id.
    #[serde(rename = "messageId")]
    pub message_id: String,
    /// The inviter's fresh ephemeral ECDH public key for this thread.
    pub epk: Jwk,
    /// Optional free-text note shown to the recipient.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Optional nickname for the inviter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

/// Caller-supplied fields for `create_invitation`.
#[derive(Debug, Clone, Default)]
pub struct InvitationOptions {
    /// Optional free-text note shown to the recipient.
    pub note: Option<String>,
    /// Optional nickname for the inviter.
    pub nickname: Option<String>,
}

/// The payload of a `ReplyMessage` JWS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPayload {
    /// Addresses either the inviter's invitation thumbprint (first reply) or
    /// the recipient's thread thumbprint (subsequent messages).
    pub re: String,
    /// Hex-encoded message id, one greater than the previous message on this thread.
    #[serde(rename = "messageId")]
    pub message_id: String,
    /// AES-GCM ciphertext (tag appended), base64url.
    pub message: String,
    /// The IV used for `message`, base64url.
    pub iv: String,
    /// The replier's fresh ephemeral ECDH public key. Present only on the
    /// first reply of a thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epk: Option<Jwk>,
}

/// Caller-supplied fields for `reply_to_thread`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyOptions {
    /// Whether to embed `jwk` in the header and `epk` in the payload. Only
    /// semantically required for the first reply in a thread; legal but
    /// unnecessary afterwards.
    pub self_sign: bool,
}

/// The per-thread, per-side record stored under `thread-info:<my_thumbprint>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadInfo {
    /// Thumbprint of this side's ephemeral ECDH public key; this thread's local id.
    pub my_thumbprint: String,
    /// Counterparty's ephemeral ECDH public key.
    pub their_epk: Jwk,
    /// Counterparty's long-term identity public key.
    pub their_signature: Jwk,
    /// The original signed invitation, kept for audit/replay verification.
    pub signed_invite: String,
}

/// The result of successfully ingesting a message via `append_thread`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedMessage {
    /// The local thread this message belongs to.
    pub thread_thumbprint: String,
    /// The decrypted plaintext.
    pub message: String,
}

/// The thread secret and ephemeral keys derived by `read_thread_secret`.
pub struct ThreadSecret {
    /// The 256-bit AES-GCM key shared with the counterparty on this thread.
    pub secret: [u8; 32],
    /// This side's ephemeral public key.
    pub epk: Jwk,
    /// The counterparty's ephemeral public key.
    pub their_epk: Jwk,
}

/// A thread's coarse lifecycle state, derived by checking storage rather
/// than stored as its own field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// An invitation was created; no reply has been ingested yet (inviter side only).
    Invited,
    /// `thread-info` exists: the thread has exchanged at least one message.
    Active,
}

async fn make_thread_keys(storage: &dyn Storage, client: &Client) -> Result<EcdhKeyPair> {
    let keys = gen_ecdh();
    let thumbprint = jwk_thumbprint(&keys.public);
    let serialized = serde_json::to_string(&keys.private_jwk())?;
    let encrypted = self_encrypt::encrypt_to_self(client, &serialized)?;
    storage
        .set(
            &format!("encrypted-thread-key:{thumbprint}"),
            StorageValue::EncryptedThreadKey(encrypted),
        )
        .await?;
    Ok(keys)
}

/// Creates a fresh thread keypair, self-encrypts its backup, signs an
/// invitation carrying its public half, and stores the invitation for later
/// lookup by its epk thumbprint.
pub async fn create_invitation(
    storage: &dyn Storage,
    client: &Client,
    opts: InvitationOptions,
) -> Result<String> {
    let thread_keys = make_thread_keys(storage, client).await?;
    let thumbprint = jwk_thumbprint(&thread_keys.public);

    let payload = InvitationPayload {
        message_id: encode_message_id(random_message_id()),
        epk: thread_keys.public,
        note: opts.note,
        nickname: opts.nickname,
    };
    let header = JwsHeader::embedding(client.id.public.clone());
    let signed = jws::sign(&header, &payload, &client.id)?;

    storage
        .set(
            &format!("invitation:{thumbprint}"),
            StorageValue::Invitation(signed.clone()),
        )
        .await?;
    info!(thumbprint = %thumbprint, "created invitation");
    Ok(signed)
}

/// Writes the per-side thread record and bootstraps its message log.
///
/// `my_thumbprint` is `None` on the replier side (fresh thread keys are
/// generated here) and `Some` on the inviter side (thread keys already exist
/// from `create_invitation`; this just records the peer's half).
async fn start_thread(
    storage: &dyn Storage,
    client: &Client,
    signed_invite: &str,
    their_epk: &Jwk,
    their_signature: &Jwk,
    message_id: u64,
    my_thumbprint: Option<String>,
) -> Result<String> {
    let my_thumbprint = match my_thumbprint {
        Some(tp) => tp,
        None => jwk_thumbprint(&make_thread_keys(storage, client).await?.public),
    };

    let their_sig_thumbprint = jwk_thumbprint(their_signature);
    storage
        .set(
            &format!("public-key:{their_sig_thumbprint}"),
            StorageValue::PublicKey(their_signature.clone()),
        )
        .await?;

    storage
        .append(
            &format!("threads:{}", client.thumbprint),
            StorageValue::thread_id(my_thumbprint.clone()),
        )
        .await?;
    storage
        .append(
            &format!("messages:{my_thumbprint}"),
            StorageValue::message(signed_invite.to_string()),
        )
        .await?;
    storage
        .set(
            &format!("message-id:{my_thumbprint}"),
            StorageValue::MessageId(encode_message_id(message_id)),
        )
        .await?;

    let info = ThreadInfo {
        my_thumbprint: my_thumbprint.clone(),
        their_epk: their_epk.clone(),
        their_signature: their_signature.clone(),
        signed_invite: signed_invite.to_string(),
    };
    // Written last: a crash before this point leaves the thread recoverable
    // as "not yet started" rather than half-active.
    storage
        .set(
            &format!("thread-info:{my_thumbprint}"),
            StorageValue::ThreadInfo(info),
        )
        .await?;

    info!(thread = %my_thumbprint, "thread started");
    Ok(my_thumbprint)
}

/// Verifies a signed invitation, starts the local thread record, and sends
/// the first (self-signed) reply.
pub async fn reply_to_invitation(
    storage: &dyn Storage,
    client: &Client,
    signed_invite: &str,
    msg: &str,
) -> Result<String> {
    let parsed = jws::parse::<InvitationPayload>(signed_invite, None)?;
    let their_signature = parsed
        .header
        .jwk
        .ok_or_else(|| Error::MalformedEnvelope("invitation missing signer jwk".to_string()))?;
    let invitation_msg_id = decode_message_id(&parsed.payload.message_id)?;

    let my_thumbprint = start_thread(
        storage,
        client,
        signed_invite,
        &parsed.payload.epk,
        &their_signature,
        invitation_msg_id,
        None,
    )
    .await?;

    reply_to_thread(
        storage,
        client,
        &my_thumbprint,
        msg,
        ReplyOptions { self_sign: true },
    )
    .await
}

/// Loads a thread's current AES-GCM secret by unwrapping this side's
/// self-encrypted thread key and deriving ECDH against the peer's epk.
pub async fn read_thread_secret(
    storage: &dyn Storage,
    client: &Client,
    thread_thumbprint: &str,
) -> Result<ThreadSecret> {
    let info = thread_info(storage, thread_thumbprint).await?;

    let key = format!("encrypted-thread-key:{}", info.my_thumbprint);
    let encrypted = storage
        .get(&key)
        .await?
        .ok_or_else(|| Error::NotFound { key: key.clone() })?
        .into_encrypted_thread_key()?;
    let serialized = self_encrypt::decrypt_from_self(client, &encrypted)?;
    let private_jwk: Jwk = serde_json::from_str(&serialized)?;
    let my_keys = EcdhKeyPair::from_private_jwk(&private_jwk)?;

    let secret = my_keys.derive_shared(&info.their_epk)?;
    Ok(ThreadSecret {
        secret,
        epk: my_keys.public,
        their_epk: info.their_epk,
    })
}

fn decode_iv_field(iv: &str) -> Result<[u8; 12]> {
    decode_flexible(iv)?
        .try_into()
        .map_err(|_| Error::MalformedEnvelope("reply iv has invalid length".to_string()))
}

/// Encrypts and appends a new message on an already-established thread.
pub async fn reply_to_thread(
    storage: &dyn Storage,
    client: &Client,
    thread_thumbprint: &str,
    msg: &str,
    opts: ReplyOptions,
) -> Result<String> {
    let secret = read_thread_secret(storage, client, thread_thumbprint).await?;
    let iv = random_iv();
    let ciphertext = aes_gcm_encrypt(&secret.secret, &iv, msg.as_bytes())?;

    let id_key = format!("message-id:{thread_thumbprint}");
    let current = storage
        .get(&id_key)
        .await?
        .ok_or_else(|| Error::NotFound { key: id_key.clone() })?
        .into_message_id()?;
    let current_id = decode_message_id(&current)?;
    let next_id = current_id + 1;
    if next_id >= MAX_MESSAGE_ID {
        // No wraparound: an id that would reach or exceed the ceiling is
        // rejected rather than silently wrapping.
        return Err(Error::OutOfOrder {
            expected: next_id,
            actual: next_id,
        });
    }

    let re = jwk_thumbprint(&secret.their_epk);
    let header = if opts.self_sign {
        JwsHeader::embedding(client.id.public.clone())
    } else {
        JwsHeader::detached()
    };
    let payload = ReplyPayload {
        re,
        message_id: encode_message_id(next_id),
        message: URL_SAFE_NO_PAD.encode(&ciphertext),
        iv: URL_SAFE_NO_PAD.encode(iv),
        epk: opts.self_sign.then(|| secret.epk.clone()),
    };
    let signed = jws::sign(&header, &payload, &client.id)?;

    // Self-verify, then self-decrypt and compare against the input. Any
    // mismatch is fatal to this call and nothing further is written.
    if !jws::verify(&signed, Some(&client.id.public))? {
        return Err(Error::SelfEncryptMismatch);
    }
    let check = jws::parse::<ReplyPayload>(&signed, Some(&client.id.public))
        .map_err(|_| Error::SelfEncryptMismatch)?;
    let check_iv = decode_iv_field(&check.payload.iv).map_err(|_| Error::SelfEncryptMismatch)?;
    let check_ct =
        decode_flexible(&check.payload.message).map_err(|_| Error::SelfEncryptMismatch)?;
    let check_pt = aes_gcm_decrypt(&secret.secret, &check_iv, &check_ct)
        .map_err(|_| Error::SelfEncryptMismatch)?;
    if check_pt != msg.as_bytes() {
        return Err(Error::SelfEncryptMismatch);
    }

    storage
        .set(&id_key, StorageValue::MessageId(encode_message_id(next_id)))
        .await?;
    storage
        .append(
            &format!("messages:{thread_thumbprint}"),
            StorageValue::message(signed.clone()),
        )
        .await?;

    Ok(signed)
}

/// Ingests an incoming message. When `thread_thumbprint` is `None`, the
/// message is assumed to be the first reply arriving at the inviter's side
/// and is routed by its `re` field; when known, the message is appended to
/// that specific thread.
pub async fn append_thread(
    storage: &dyn Storage,
    client: &Client,
    jws_str: &str,
    thread_thumbprint: Option<&str>,
) -> Result<AppendedMessage> {
    match thread_thumbprint {
        Some(tt) => append_thread_known(storage, client, jws_str, tt).await,
        None => append_thread_unknown(storage, client, jws_str).await,
    }
}

async fn append_thread_unknown(
    storage: &dyn Storage,
    client: &Client,
    jws_str: &str,
) -> Result<AppendedMessage> {
    // Unverified here only to read routing fields; if the header embeds a
    // jwk, `jws::parse` already verified against it before returning.
    let peek = jws::parse::<ReplyPayload>(jws_str, None)?;

    match peek.header.jwk {
        None => {
            let key = format!("thread-info:{}", peek.payload.re);
            if storage.has(&key).await? {
                append_thread_known(storage, client, jws_str, &peek.payload.re).await
            } else {
                Err(Error::UnknownThread(peek.payload.re))
            }
        }
        Some(their_signature) => {
            let epk = peek.payload.epk.clone().ok_or(Error::MalformedFirstReply)?;

            let invitation_key = format!("invitation:{}", peek.payload.re);
            let invitation_jws = storage
                .get(&invitation_key)
                .await?
                .ok_or_else(|| Error::UnknownInvitation(peek.payload.re.clone()))?
                .into_invitation()?;
            let invitation = jws::parse::<InvitationPayload>(&invitation_jws, None)?;
            let invitation_msg_id = decode_message_id(&invitation.payload.message_id)?;
            let incoming_msg_id = decode_message_id(&peek.payload.message_id)?;
            if incoming_msg_id != invitation_msg_id + 1 {
                return Err(Error::OutOfOrder {
                    expected: invitation_msg_id + 1,
                    actual: incoming_msg_id,
                });
            }

            let my_thumbprint = jwk_thumbprint(&invitation.payload.epk);
            start_thread(
                storage,
                client,
                &invitation_jws,
                &epk,
                &their_signature,
                incoming_msg_id,
                Some(my_thumbprint.clone()),
            )
            .await?;

            append_thread_known(storage, client, jws_str, &my_thumbprint).await
        }
    }
}

async fn append_thread_known(
    storage: &dyn Storage,
    client: &Client,
    jws_str: &str,
    thread_thumbprint: &str,
) -> Result<AppendedMessage> {
    let info = thread_info(storage, thread_thumbprint).await?;

    // Peek (verifies automatically if the header embeds a jwk).
    let peek = jws::parse::<ReplyPayload>(jws_str, None)?;
    let verified = if peek.header.jwk.is_some() {
        peek
    } else {
        let their_ephemeral_thumbprint = jwk_thumbprint(&info.their_epk);
        let verifier = if peek.payload.re == info.my_thumbprint {
            &info.their_signature
        } else if peek.payload.re == their_ephemeral_thumbprint {
            &client.id.public
        } else {
            return Err(Error::UnverifiedSigner);
        };
        jws::parse::<ReplyPayload>(jws_str, Some(verifier))?
    };

    let secret = read_thread_secret(storage, client, thread_thumbprint).await?;
    let iv = decode_iv_field(&verified.payload.iv)?;
    let ciphertext = decode_flexible(&verified.payload.message)?;
    let plaintext = aes_gcm_decrypt(&secret.secret, &iv, &ciphertext)?;
    let message = String::from_utf8(plaintext).map_err(|_| Error::BadCiphertext)?;

    storage
        .append(
            &format!("messages:{thread_thumbprint}"),
            StorageValue::message(jws_str.to_string()),
        )
        .await?;

    info!(thread = %thread_thumbprint, "appended message");
    Ok(AppendedMessage {
        thread_thumbprint: thread_thumbprint.to_string(),
        message,
    })
}

/// Returns the parsed `ThreadInfo` for a local thread thumbprint.
pub async fn thread_info(storage: &dyn Storage, thread_thumbprint: &str) -> Result<ThreadInfo> {
    let key = format!("thread-info:{thread_thumbprint}");
    storage
        .get(&key)
        .await?
        .ok_or(Error::NotFound { key })?
        .into_thread_info()
}

/// Returns the thread thumbprints this client has started, in creation order.
pub async fn list_threads(storage: &dyn Storage, client_thumbprint: &str) -> Result<Vec<String>> {
    let key = format!("threads:{client_thumbprint}");
    match storage.get(&key).await? {
        Some(value) => value.into_thread_ids(),
        None => Ok(Vec::new()),
    }
}

/// Returns the raw message JWSes on a thread, in append order.
pub async fn thread_messages(storage: &dyn Storage, thread_thumbprint: &str) -> Result<Vec<String>> {
    let key = format!("messages:{thread_thumbprint}");
    match storage.get(&key).await? {
        Some(value) => value.into_messages(),
        None => Ok(Vec::new()),
    }
}

/// Derives a thread's lifecycle state by checking for the presence of
/// `invitation:`/`thread-info:` entries, rather than maintaining it as its
/// own stored field.
pub async fn thread_state(storage: &dyn Storage, thread_thumbprint: &str) -> Result<ThreadState> {
    if storage
        .has(&format!("thread-info:{thread_thumbprint}"))
        .await?
    {
        Ok(ThreadState::Active)
    } else if storage
        .has(&format!("invitation:{thread_thumbprint}"))
        .await?
    {
        Ok(ThreadState::Invited)
    } else {
        Err(Error::NotFound {
            key: thread_thumbprint.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;

    async fn new_client(storage: &MemoryStorage, password: &str) -> Client {
        identity::generate(storage, password).await.unwrap()
    }

    #[tokio::test]
    async fn alice_invites_bob_replies_alice_ingests() {
        let storage = MemoryStorage::new();
        let alice = new_client(&storage, "alice-pw").await;
        let bob = new_client(&storage, "bob-pw").await;

        let invite = create_invitation(
            &storage,
            &alice,
            InvitationOptions {
                nickname: Some("alice".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let r1 = reply_to_invitation(&storage, &bob, &invite, "hi").await.unwrap();
        let appended = append_thread(&storage, &alice, &r1, None).await.unwrap();

        let invite_parsed = jws::parse::<InvitationPayload>(&invite, None).unwrap();
        let expected_thread = jwk_thumbprint(&invite_parsed.payload.epk);

        assert_eq!(appended.thread_thumbprint, expected_thread);
        assert_eq!(appended.message, "hi");

        let threads = list_threads(&storage, &alice.thumbprint).await.unwrap();
        assert!(threads.contains(&expected_thread));
    }

    #[tokio::test]
    async fn second_message_has_no_embedded_key_and_sequential_id() {
        let storage = MemoryStorage::new();
        let alice = new_client(&storage, "alice-pw").await;
        let bob = new_client(&storage, "bob-pw").await;

        let invite = create_invitation(&storage, &alice, InvitationOptions::default())
            .await
            .unwrap();
        let invite_parsed = jws::parse::<InvitationPayload>(&invite, None).unwrap();
        let invite_msg_id = decode_message_id(&invite_parsed.payload.message_id).unwrap();

        let r1 = reply_to_invitation(&storage, &bob, &invite, "hi").await.unwrap();
        let appended = append_thread(&storage, &alice, &r1, None).await.unwrap();

        let r2 = reply_to_thread(
            &storage,
            &alice,
            &appended.thread_thumbprint,
            "hello bob",
            ReplyOptions::default(),
        )
        .await
        .unwrap();

        let r2_parsed = jws::parse::<ReplyPayload>(&r2, None).unwrap();
        assert!(r2_parsed.header.jwk.is_none());
        assert_eq!(
            decode_message_id(&r2_parsed.payload.message_id).unwrap(),
            invite_msg_id + 2
        );

        let bob_thread_secret = read_thread_secret(&storage, &bob, &appended.thread_thumbprint)
            .await
            .unwrap_err();
        // Bob's local thread id differs from Alice's (each side keys its own
        // thread-info under its own ephemeral thumbprint); this just proves
        // the lookup is thread-local rather than shared.
        assert!(matches!(bob_thread_secret, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn out_of_order_reply_is_rejected() {
        let storage = MemoryStorage::new();
        let alice = new_client(&storage, "alice-pw").await;
        let bob = new_client(&storage, "bob-pw").await;

        let invite = create_invitation(&storage, &alice, InvitationOptions::default())
            .await
            .unwrap();
        let invite_parsed = jws::parse::<InvitationPayload>(&invite, None).unwrap();
        let invite_msg_id = decode_message_id(&invite_parsed.payload.message_id).unwrap();

        let r1 = reply_to_invitation(&storage, &bob, &invite, "hi").await.unwrap();
        let mut parsed = jws::parse::<ReplyPayload>(&r1, None).unwrap();
        parsed.payload.message_id = encode_message_id(invite_msg_id + 2);
        let resigned = jws::sign(&parsed.header, &parsed.payload, &bob.id).unwrap();

        let err = append_thread(&storage, &alice, &resigned, None).await.unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { .. }));
    }

    #[tokio::test]
    async fn tampering_breaks_signature_verification() {
        let storage = MemoryStorage::new();
        let alice = new_client(&storage, "alice-pw").await;
        let bob = new_client(&storage, "bob-pw").await;

        let invite = create_invitation(&storage, &alice, InvitationOptions::default())
            .await
            .unwrap();
        let r1 = reply_to_invitation(&storage, &bob, &invite, "hi").await.unwrap();

        let mut parts: Vec<String> = r1.split('.').map(str::to_string).collect();
        let mut payload_bytes = URL_SAFE_NO_PAD.decode(&parts[1]).unwrap();
        let last = payload_bytes.len() - 1;
        payload_bytes[last] ^= 0xff;
        parts[1] = URL_SAFE_NO_PAD.encode(payload_bytes);
        let tampered = parts.join(".");

        let err = append_thread(&storage, &alice, &tampered, None).await.unwrap_err();
        assert!(matches!(err, Error::BadSignature | Error::MalformedEnvelope(_)));
    }

    #[tokio::test]
    async fn ecdh_symmetry_across_sides() {
        let storage = MemoryStorage::new();
        let alice = new_client(&storage, "alice-pw").await;
        let bob = new_client(&storage, "bob-pw").await;

        let invite = create_invitation(&storage, &alice, InvitationOptions::default())
            .await
            .unwrap();
        let r1 = reply_to_invitation(&storage, &bob, &invite, "hi").await.unwrap();
        let appended = append_thread(&storage, &alice, &r1, None).await.unwrap();

        let alice_secret = read_thread_secret(&storage, &alice, &appended.thread_thumbprint)
            .await
            .unwrap();

        let bob_threads = list_threads(&storage, &bob.thumbprint).await.unwrap();
        let bob_thread_thumbprint = bob_threads.first().unwrap();
        let bob_secret = read_thread_secret(&storage, &bob, bob_thread_thumbprint)
            .await
            .unwrap();

        assert_eq!(alice_secret.secret, bob_secret.secret);
    }

    #[tokio::test]
    async fn thread_state_transitions() {
        let storage = MemoryStorage::new();
        let alice = new_client(&storage, "alice-pw").await;
        let bob = new_client(&storage, "bob-pw").await;

        let invite = create_invitation(&storage, &alice, InvitationOptions::default())
            .await
            .unwrap();
        let invite_parsed = jws::parse::<InvitationPayload>(&invite, None).unwrap();
        let invitee_thumbprint = jwk_thumbprint(&invite_parsed.payload.epk);

        assert_eq!(
            thread_state(&storage, &invitee_thumbprint).await.unwrap(),
            ThreadState::Invited
        );

        let r1 = reply_to_invitation(&storage, &bob, &invite, "hi").await.unwrap();
        append_thread(&storage, &alice, &r1, None).await.unwrap();

        assert_eq!(
            thread_state(&storage, &invitee_thumbprint).await.unwrap(),
            ThreadState::Active
        );
    }

    #[tokio::test]
    async fn idempotent_append_accepts_duplicate() {
        let storage = MemoryStorage::new();
        let alice = new_client(&storage, "alice-pw").await;
        let bob = new_client(&storage, "bob-pw").await;

        let invite = create_invitation(&storage, &alice, InvitationOptions::default())
            .await
            .unwrap();
        let r1 = reply_to_invitation(&storage, &bob, &invite, "hi").await.unwrap();
        let first = append_thread(&storage, &alice, &r1, None).await.unwrap();
        let second = append_thread(
            &storage,
            &alice,
            &r1,
            Some(&first.thread_thumbprint),
        )
        .await
        .unwrap();

        assert_eq!(first.message, second.message);
        // messages[0] is the original invitation (appended by `start_thread`),
        // messages[1] and [2] are the two (non-deduplicated) copies of `r1`.
        let messages = thread_messages(&storage, &first.thread_thumbprint).await.unwrap();
        assert_eq!(messages.len(), 3);
    }
}
