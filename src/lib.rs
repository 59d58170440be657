//! # Page Ledger - My Signed Document Ledger
//!
//! This is a small proof-of-work blockchain I use to record signed pages of
//! documents, so a page's text can later be checked against what was recorded.
//! When I come back to this code, here's what I need to remember:
//!
//! ## What I Built
//! - **Page Records**: every page carries a chained content hash over its
//!   sentences and an ECDSA P-256 signature
//! - **Proof-of-Work Chain**: blocks of page records, mined on a background
//!   thread that can be cancelled when the tip moves
//! - **Validation**: every block from a peer or from disk is re-checked
//!   (linkage, proof-of-work, records root, timestamps, signatures, duplicates)
//! - **Fork Choice**: longest valid chain wins, ties go to the lower tip hash
//! - **P2P Sync**: framed TCP protocol, handshakes, height polling and chunked
//!   chain download with step-back to find the fork point
//!
//! ## How I Organized My Code
//! - `core/`: pages, blocks, chain, proof-of-work, validation, fork choice
//! - `mining/`: the miner thread and the seam the sync manager talks to
//! - `network/`: framing, messages, connections, and the sync manager actor
//! - `storage/`: pending pool, chain file, known-peer database
//! - `config/`: TOML and environment configuration
//! - `utils/`: hashing, signatures and serialization helpers
//! - `cli/`: command-line interface
//!
//! ## Key Design Decisions I Made
//! - One sync manager thread owns the chain and the pool; everybody else
//!   sends it events, and readers get `Arc<Chain>` snapshots
//! - Sled only keeps the peer address book; the chain is one flat file that
//!   is replaced atomically on every save
//! - Signature checking sits behind a trait so tests can run without keys
//!
//! ## When I Need to Understand Something
//! 1. Start with `main.rs` to see the CLI commands
//! 2. Look at `network/sync.rs` for how blocks and peers are handled
//! 3. Check `core/validation.rs` for what makes a block acceptable
//! 4. Review `core/fork_choice.rs` for reorgs

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod mining;
pub mod network;
pub mod storage;
pub mod utils;

// Re-export commonly used types for convenience
pub use cli::{Command, Opt, OutputFormatArg};
pub use config::Config;
pub use core::{
    genesis_block, Block, Chain, ChainView, DifficultyPolicy, EcdsaP256Signer, EcdsaP256Verifier,
    ForkChoice, ForkDecision, PageRecord, PageSigner, ProofOfWork, SignatureVerifier, Validator,
};
pub use error::{ChainValidationError, LedgerError, Result, ValidationErrorKind};
pub use network::{NodeHandle, NodeStatus, Server};
pub use storage::{ChainStore, FileChainStore, PeerStore};
pub use utils::{current_timestamp, sha256_digest, Hash};
