//! Core ledger functionality
//!
//! Page records, blocks and the chain, proof-of-work, difficulty policy,
//! validation and fork choice. Nothing in here does I/O or owns a thread.

pub mod block;
pub mod chain;
pub mod difficulty;
pub mod fork_choice;
pub mod merkle;
pub mod page;
pub mod proof_of_work;
pub mod signing;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use block::{genesis_block, Block, BlockHeader, GENESIS_TIMESTAMP};
pub use chain::{Chain, ChainView};
pub use difficulty::{DifficultyPolicy, MAX_DIFFICULTY, MIN_DIFFICULTY};
pub use fork_choice::{ForkChoice, ForkDecision, Reorg};
pub use merkle::{MerkleProof, MerkleTree, ProofElement};
pub use page::{
    chained_content_hash, split_sentences, PageContent, PageRecord, SignerIdentity,
    MAX_PAGE_TEXT_LEN,
};
pub use proof_of_work::{CancelToken, MiningOutcome, ProofOfWork, CANCEL_CHECK_INTERVAL};
pub use signing::{AcceptAll, EcdsaP256Signer, EcdsaP256Verifier, PageSigner, SignatureVerifier};
pub use validation::{Validator, MAX_FUTURE_DRIFT_MS};
