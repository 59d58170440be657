//! Block and chain validation
//!
//! Nothing that arrives from a peer, or from disk, is trusted. Every block is
//! re-hashed and checked against its predecessor, the difficulty policy and
//! the signature verifier before it can become part of the local chain.

use crate::core::signing::{AcceptAll, SignatureVerifier};
use crate::core::{Block, Chain, DifficultyPolicy, PageRecord, ProofOfWork, MAX_PAGE_TEXT_LEN};
use crate::error::{ChainValidationError, ValidationErrorKind};
use crate::utils::current_timestamp;
use std::collections::HashSet;
use std::sync::Arc;

/// How far ahead of the local clock a block timestamp may be.
pub const MAX_FUTURE_DRIFT_MS: i64 = 2 * 60 * 60 * 1000;

#[derive(Clone)]
pub struct Validator {
    verifier: Arc<dyn SignatureVerifier>,
    policy: DifficultyPolicy,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Validator {
    pub fn new(verifier: Arc<dyn SignatureVerifier>, policy: DifficultyPolicy) -> Validator {
        Validator { verifier, policy }
    }

    /// Structural checks only; every present signature is accepted.
    pub fn structural(policy: DifficultyPolicy) -> Validator {
        Self::new(Arc::new(AcceptAll), policy)
    }

    pub fn policy(&self) -> DifficultyPolicy {
        self.policy
    }

    /// Difficulty the block following `chain`'s tip must carry.
    pub fn next_difficulty(&self, chain: &Chain) -> u32 {
        self.policy.next_difficulty(chain.blocks())
    }

    /// Text within `MAX_PAGE_TEXT_LEN`, signature present, content hash
    /// matches the text, and the verifier accepts it.
    pub fn check_record(&self, record: &PageRecord) -> bool {
        record.get_text().len() <= MAX_PAGE_TEXT_LEN
            && record.is_signed()
            && record.has_consistent_content_hash()
            && self.verifier.verify(record)
    }

    /// Checks one block against its predecessor.
    pub fn validate_block(
        &self,
        block: &Block,
        predecessor: &Block,
        expected_difficulty: u32,
    ) -> Result<(), ValidationErrorKind> {
        if block.get_index() != predecessor.get_index() + 1
            || block.get_previous_hash() != predecessor.hash()
        {
            return Err(ValidationErrorKind::BadLinkage);
        }

        if block.get_records().is_empty() {
            return Err(ValidationErrorKind::EmptyBody);
        }

        if !block.verify_records_root() {
            return Err(ValidationErrorKind::BadRecordsRoot);
        }

        if block.get_difficulty() != expected_difficulty || !ProofOfWork::validate(block) {
            return Err(ValidationErrorKind::BadPoW);
        }

        if block.get_timestamp() < predecessor.get_timestamp() {
            return Err(ValidationErrorKind::BadTimestamp);
        }
        if let Ok(now) = current_timestamp() {
            if block.get_timestamp() > now.saturating_add(MAX_FUTURE_DRIFT_MS) {
                return Err(ValidationErrorKind::BadTimestamp);
            }
        }

        if !block.get_records().iter().all(|record| self.check_record(record)) {
            return Err(ValidationErrorKind::BadSignature);
        }

        let mut pages = HashSet::with_capacity(block.get_records().len());
        for record in block.get_records() {
            if !pages.insert(record.page_key()) {
                return Err(ValidationErrorKind::DuplicatePage);
            }
        }

        Ok(())
    }

    /// Validates a block that would extend `chain`'s tip, including the
    /// ledger-wide duplicate page rule.
    pub fn validate_extension(&self, chain: &Chain, block: &Block) -> Result<(), ChainValidationError> {
        let fail = |kind| ChainValidationError {
            index: block.get_index(),
            kind,
        };

        self.validate_block(block, chain.tip(), self.next_difficulty(chain))
            .map_err(fail)?;

        if block
            .get_records()
            .iter()
            .any(|record| chain.contains_page(record.get_title(), record.get_page_index()))
        {
            return Err(fail(ValidationErrorKind::DuplicatePage));
        }
        Ok(())
    }

    /// Validates a whole chain from genesis to tip. Reports the first
    /// failing block.
    pub fn validate_chain(&self, chain: &Chain) -> Result<(), ChainValidationError> {
        let blocks = chain.blocks();
        match blocks.first() {
            Some(genesis) if genesis.is_genesis() => {}
            _ => {
                return Err(ChainValidationError {
                    index: 0,
                    kind: ValidationErrorKind::BadGenesis,
                })
            }
        }

        let mut recorded: HashSet<(&str, u32)> = blocks[0]
            .get_records()
            .iter()
            .map(|record| record.page_key())
            .collect();

        for (position, pair) in blocks.windows(2).enumerate() {
            let (predecessor, block) = (&pair[0], &pair[1]);
            let fail = |kind| ChainValidationError {
                index: position as u64 + 1,
                kind,
            };

            let expected = self.policy.next_difficulty(&blocks[..=position]);
            self.validate_block(block, predecessor, expected)
                .map_err(fail)?;

            for record in block.get_records() {
                if !recorded.insert(record.page_key()) {
                    return Err(fail(ValidationErrorKind::DuplicatePage));
                }
            }
        }

        Ok(())
    }
}
