use crate::core::Block;
use crate::utils::Hash;
use log::debug;
use num_bigint::{BigInt, Sign};
use std::ops::ShlAssign;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How many nonces are tried between two looks at the cancel flag.
pub const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Shared cancellation flag for a running nonce search.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a nonce search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningOutcome {
    Found(Block),
    Cancelled,
}

pub struct ProofOfWork {
    block: Block,
    target: BigInt,
}

impl ProofOfWork {
    pub fn new_proof_of_work(block: Block) -> ProofOfWork {
        let target = Self::target_for(block.get_difficulty());
        ProofOfWork { block, target }
    }

    /// `2^(256 - difficulty)`: a hash below it has at least `difficulty`
    /// leading zero bits.
    pub fn target_for(difficulty: u32) -> BigInt {
        let mut target = BigInt::from(1);
        target.shl_assign(256 - difficulty.min(256));
        target
    }

    pub fn meets_target(hash: &Hash, difficulty: u32) -> bool {
        let hash_int = BigInt::from_bytes_be(Sign::Plus, hash.as_bytes());
        hash_int < Self::target_for(difficulty)
    }

    /// Validate proof-of-work for a block
    pub fn validate(block: &Block) -> bool {
        Self::meets_target(&block.hash(), block.get_difficulty())
    }

    /// Searches nonces from `start_nonce` until the header hash meets the
    /// target or `cancel` is raised. When the whole nonce space has been
    /// tried the timestamp moves forward by one millisecond and the search
    /// continues.
    pub fn run(mut self, start_nonce: u64, cancel: &CancelToken) -> MiningOutcome {
        let mut nonce = start_nonce;
        let mut tried: u64 = 0;

        loop {
            if tried % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                debug!("Nonce search for block {} cancelled", self.block.get_index());
                return MiningOutcome::Cancelled;
            }

            self.block.header_mut().set_nonce(nonce);
            let hash = self.block.hash();
            let hash_int = BigInt::from_bytes_be(Sign::Plus, hash.as_bytes());
            if hash_int < self.target {
                debug!(
                    "Found nonce {} for block {} after {} attempts: {}",
                    nonce,
                    self.block.get_index(),
                    tried + 1,
                    hash
                );
                return MiningOutcome::Found(self.block);
            }

            nonce = nonce.wrapping_add(1);
            tried = tried.wrapping_add(1);
            if nonce == start_nonce {
                let header = self.block.header_mut();
                let timestamp = header.get_timestamp();
                header.set_timestamp(timestamp + 1);
            }
        }
    }

    /// Blocking search that cannot be cancelled. Handy for tools and tests.
    pub fn solve(block: Block) -> Block {
        match ProofOfWork::new_proof_of_work(block.clone()).run(0, &CancelToken::new()) {
            MiningOutcome::Found(mined) => mined,
            MiningOutcome::Cancelled => block,
        }
    }
}
