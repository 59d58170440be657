//! Signature capabilities
//!
//! Key management lives outside the ledger. The core only needs two
//! capabilities: something that can sign a content hash when a page record is
//! assembled, and something that can tell whether a record's signature is
//! genuine when a block is validated.

use crate::core::page::{PageRecord, SignerIdentity};
use crate::error::Result;
use crate::utils::{
    ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, new_key_pair,
    public_key_from_pkcs8, Hash,
};

/// Produces signatures over page content hashes.
pub trait PageSigner {
    fn identity(&self) -> SignerIdentity;
    fn sign(&self, content_hash: &Hash) -> Result<Vec<u8>>;
}

/// Cryptographic signature check invoked by the validator after the
/// structural checks (signature present, content hash matches text) passed.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, record: &PageRecord) -> bool;
}

/// Accepts every structurally valid record. Used when signer public keys are
/// not resolvable by this node.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(&self, _record: &PageRecord) -> bool {
        true
    }
}

/// ECDSA P-256 / SHA-256 signer backed by a PKCS#8 key.
pub struct EcdsaP256Signer {
    username: String,
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl EcdsaP256Signer {
    pub fn from_pkcs8(username: &str, pkcs8: Vec<u8>) -> Result<EcdsaP256Signer> {
        let public_key = public_key_from_pkcs8(&pkcs8)?;
        Ok(EcdsaP256Signer {
            username: username.to_string(),
            pkcs8,
            public_key,
        })
    }

    /// Signer with a freshly generated key.
    pub fn generate(username: &str) -> Result<EcdsaP256Signer> {
        Self::from_pkcs8(username, new_key_pair()?)
    }
}

impl PageSigner for EcdsaP256Signer {
    fn identity(&self) -> SignerIdentity {
        SignerIdentity {
            username: self.username.clone(),
            public_key: self.public_key.clone(),
        }
    }

    fn sign(&self, content_hash: &Hash) -> Result<Vec<u8>> {
        ecdsa_p256_sha256_sign_digest(&self.pkcs8, content_hash.as_bytes())
    }
}

/// Verifies records against the public key embedded in their signer identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct EcdsaP256Verifier;

impl SignatureVerifier for EcdsaP256Verifier {
    fn verify(&self, record: &PageRecord) -> bool {
        ecdsa_p256_sha256_sign_verify(
            &record.get_signer().public_key,
            record.get_signature(),
            record.get_content_hash().as_bytes(),
        )
    }
}
