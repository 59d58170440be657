use crate::core::page::PageRecord;
use crate::core::{Chain, Validator};
use crate::utils::Hash;
use log::{info, warn};
use std::collections::HashSet;

/// A whole-chain replacement that fork choice decided to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reorg {
    pub chain: Chain,
    /// Records of the abandoned blocks that the new chain does not carry,
    /// in the order they appeared on the old chain.
    pub orphaned: Vec<PageRecord>,
    /// Highest index both chains share.
    pub common_ancestor: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkDecision {
    KeepLocal,
    Adopt(Reorg),
}

/// Longest valid chain wins; equal heights go to the lower tip hash.
pub struct ForkChoice;

impl ForkChoice {
    /// Strict preference of `candidate` over `local`, ignoring validity.
    pub fn is_preferred(candidate: &Chain, local: &Chain) -> bool {
        Self::rank(candidate) > Self::rank(local)
    }

    // Higher height first; on a tie the smaller tip hash ranks higher.
    fn rank(chain: &Chain) -> (u64, std::cmp::Reverse<Hash>) {
        (chain.height(), std::cmp::Reverse(chain.tip_hash()))
    }

    /// The canonical one of two valid chains. Argument order does not matter.
    pub fn canonical<'a>(a: &'a Chain, b: &'a Chain) -> &'a Chain {
        if Self::is_preferred(b, a) {
            b
        } else {
            a
        }
    }

    pub fn resolve(local: &Chain, candidate: Chain, validator: &Validator) -> ForkDecision {
        if !Self::is_preferred(&candidate, local) {
            return ForkDecision::KeepLocal;
        }

        if let Err(err) = validator.validate_chain(&candidate) {
            warn!(
                "Rejecting candidate chain of height {}: {}",
                candidate.height(),
                err
            );
            return ForkDecision::KeepLocal;
        }

        let common_ancestor = local.common_ancestor(&candidate);
        let first_diverging = common_ancestor + 1;

        let kept: HashSet<Hash> = candidate
            .blocks_from(first_diverging)
            .iter()
            .flat_map(|block| block.get_records())
            .map(PageRecord::record_id)
            .collect();

        let orphaned: Vec<PageRecord> = local
            .blocks_from(first_diverging)
            .iter()
            .flat_map(|block| block.get_records())
            .filter(|record| !kept.contains(&record.record_id()))
            .cloned()
            .collect();

        info!(
            "Adopting chain {} -> {} (common ancestor {}, {} orphaned records)",
            local.height(),
            candidate.height(),
            common_ancestor,
            orphaned.len()
        );

        ForkDecision::Adopt(Reorg {
            chain: candidate,
            orphaned,
            common_ancestor,
        })
    }
}
