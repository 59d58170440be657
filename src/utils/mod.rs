//! Utility functions and helpers
//!
//! Hashing, key handling, timestamps and the bincode wrappers used by the
//! rest of the ledger.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, double_sha256, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, public_key_from_pkcs8, sha256_digest, Hash,
};

pub use serialization::{deserialize, serialize, MAX_DECODE_LEN};
