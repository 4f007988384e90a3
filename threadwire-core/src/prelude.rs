//! Prelude module for commonly used types and traits.
//!
//! Import everything from this module with `use threadwire_core::prelude::*`.
//!
//! # Example
//!
//! ```rust
//! use threadwire_core::prelude::*;
//!
//! async fn example(storage: &dyn Storage) -> Result<()> {
//!     let alice = identity::generate(storage, "correct horse battery staple").await?;
//!     let invite = thread::create_invitation(storage, &alice, InvitationOptions::default()).await?;
//!     let threads = thread::list_threads(storage, &alice.thumbprint).await?;
//!     let _ = (invite, threads);
//!     Ok(())
//! }
//! ```

pub use crate::error::{Error, Result};

pub use crate::crypto::{Jwk, KdfParams};
pub use crate::identity::{self, Client, IdentityRecord, KeyRecord};
pub use crate::jws::{self, JwsHeader, Parsed};
pub use crate::self_encrypt::{decrypt_from_self, encrypt_to_self};
pub use crate::storage::{MemoryStorage, Storage, StorageValue};
pub use crate::thread::{
    self, AppendedMessage, InvitationOptions, InvitationPayload, ReplyOptions, ReplyPayload,
    ThreadInfo, ThreadSecret, ThreadState,
};
