// The chain is an in-memory vector of blocks starting at the fixed genesis.
// It only ever grows by one block at a time (append) or gets swapped out
// wholesale when fork choice adopts a better chain.

use crate::core::page::{PageContent, PageRecord};
use crate::core::{genesis_block, Block};
use crate::error::{ChainValidationError, LedgerError, Result, ValidationErrorKind};
use crate::utils::Hash;
use log::error;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Where a page record lives: block index and position in that block.
type RecordLocation = (u64, usize);

#[derive(Debug, Clone)]
pub struct Chain {
    blocks: Vec<Block>,
    // I keep these two indexes next to the blocks so lookups don't walk the chain
    hash_index: HashMap<Hash, u64>,
    title_index: HashMap<String, Vec<RecordLocation>>,
}

impl PartialEq for Chain {
    fn eq(&self, other: &Self) -> bool {
        self.blocks == other.blocks
    }
}

impl Eq for Chain {}

impl Default for Chain {
    fn default() -> Self {
        Chain::new()
    }
}

impl Chain {
    /// A chain holding only the genesis block.
    pub fn new() -> Chain {
        let mut chain = Chain {
            blocks: Vec::new(),
            hash_index: HashMap::new(),
            title_index: HashMap::new(),
        };
        chain.push_indexed(genesis_block().clone());
        chain
    }

    /// Builds a candidate chain from a full block list. Only the genesis block
    /// is checked here; everything else is up to the validator.
    pub fn from_blocks(blocks: Vec<Block>) -> Result<Chain> {
        match blocks.first() {
            Some(first) if first.is_genesis() => {}
            _ => {
                return Err(LedgerError::Validation(ChainValidationError {
                    index: 0,
                    kind: ValidationErrorKind::BadGenesis,
                }))
            }
        }

        let mut chain = Chain {
            blocks: Vec::with_capacity(blocks.len()),
            hash_index: HashMap::with_capacity(blocks.len()),
            title_index: HashMap::new(),
        };
        for block in blocks {
            chain.push_indexed(block);
        }
        Ok(chain)
    }

    /// Appends a block that links onto the current tip. Only linkage is
    /// checked; the caller validates the block first.
    pub fn append(&mut self, block: Block) -> Result<()> {
        let tip = self.tip();
        if block.get_index() != tip.get_index() + 1 {
            return Err(LedgerError::Linkage(format!(
                "Block index {} does not follow tip {}",
                block.get_index(),
                tip.get_index()
            )));
        }
        if block.get_previous_hash() != tip.hash() {
            return Err(LedgerError::Linkage(format!(
                "Block {} does not point at tip {}",
                block.get_index(),
                tip.hash().short()
            )));
        }

        self.push_indexed(block);
        Ok(())
    }

    fn push_indexed(&mut self, block: Block) {
        let index = block.get_index();
        self.hash_index.insert(block.hash(), index);
        for (position, record) in block.get_records().iter().enumerate() {
            self.title_index
                .entry(record.get_title().to_string())
                .or_default()
                .push((index, position));
        }
        self.blocks.push(block);
    }

    /// Index of the tip block. A genesis-only chain has height 0.
    pub fn height(&self) -> u64 {
        self.tip().get_index()
    }

    pub fn tip(&self) -> &Block {
        // never empty: every constructor starts from genesis
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn tip_hash(&self) -> Hash {
        self.tip().hash()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(index).ok()?)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Blocks from `index` (inclusive) to the tip; empty past the tip.
    pub fn blocks_from(&self, index: u64) -> &[Block] {
        let start = usize::try_from(index).unwrap_or(usize::MAX).min(self.blocks.len());
        &self.blocks[start..]
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn contains_hash(&self, hash: &Hash) -> bool {
        self.hash_index.contains_key(hash)
    }

    pub fn index_of(&self, hash: &Hash) -> Option<u64> {
        self.hash_index.get(hash).copied()
    }

    /// Whether `(title, page_index)` is already recorded anywhere.
    pub fn contains_page(&self, title: &str, page_index: u32) -> bool {
        self.find_pages_by_title(title)
            .iter()
            .any(|record| record.get_page_index() == page_index)
    }

    /// Highest index at which both chains hold the same block.
    pub fn common_ancestor(&self, other: &Chain) -> u64 {
        self.blocks
            .iter()
            .zip(other.blocks.iter())
            .take_while(|(a, b)| a.hash() == b.hash())
            .last()
            .map(|(a, _)| a.get_index())
            .unwrap_or(0)
    }

    /// Every page recorded under exactly this title, in chain order.
    pub fn find_pages_by_title(&self, title: &str) -> Vec<&PageRecord> {
        self.title_index
            .get(title)
            .map(|locations| {
                locations
                    .iter()
                    .filter_map(|(index, position)| {
                        self.get(*index)
                            .and_then(|block| block.get_records().get(*position))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All recorded pages, genesis excluded, for the document-matching search.
    pub fn page_contents(&self) -> impl Iterator<Item = PageContent<'_>> {
        self.blocks
            .iter()
            .skip(1)
            .flat_map(|block| block.get_records().iter())
            .map(|record| PageContent {
                title: record.get_title(),
                page_index: record.get_page_index(),
                text: record.get_text(),
            })
    }
}

/// Read-only view of the latest published chain. The sync manager publishes
/// a fresh snapshot after every mutation; readers never block it for longer
/// than an `Arc` clone.
#[derive(Debug, Clone)]
pub struct ChainView {
    inner: Arc<RwLock<Arc<Chain>>>,
}

impl ChainView {
    pub fn new(chain: Arc<Chain>) -> ChainView {
        ChainView {
            inner: Arc::new(RwLock::new(chain)),
        }
    }

    pub fn snapshot(&self) -> Arc<Chain> {
        match self.inner.read() {
            Ok(chain) => Arc::clone(&chain),
            Err(poisoned) => {
                error!("Chain view lock poisoned, serving last published chain");
                Arc::clone(&poisoned.into_inner())
            }
        }
    }

    pub(crate) fn publish(&self, chain: Arc<Chain>) {
        match self.inner.write() {
            Ok(mut current) => *current = chain,
            Err(poisoned) => {
                error!("Chain view lock poisoned while publishing");
                *poisoned.into_inner() = chain;
            }
        }
    }

    pub fn height(&self) -> u64 {
        self.snapshot().height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::{build_chain, mined_child, record};

    #[test]
    fn test_new_chain_is_genesis_only() {
        let chain = Chain::new();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.len(), 1);
        assert!(chain.tip().is_genesis());
        assert_eq!(chain.page_contents().count(), 0);
    }

    #[test]
    fn test_append_checks_linkage() {
        let mut chain = Chain::new();
        let first = mined_child(chain.tip(), vec![record("Doc", 0)], 1);
        let orphan = mined_child(&first, vec![record("Doc", 1)], 1);

        assert!(matches!(chain.append(orphan.clone()), Err(LedgerError::Linkage(_))));
        chain.append(first.clone()).unwrap();
        chain.append(orphan).unwrap();
        assert_eq!(chain.height(), 2);
        assert!(chain.contains_hash(&first.hash()));
        assert_eq!(chain.index_of(&first.hash()), Some(1));

        // replaying the same block is a linkage error, not a silent no-op
        assert!(chain.append(first).is_err());
    }

    #[test]
    fn test_from_blocks_requires_genesis() {
        let chain = build_chain(3, 1);
        let mut blocks = chain.blocks()[1..].to_vec();
        assert!(Chain::from_blocks(blocks.clone()).is_err());
        blocks.insert(0, genesis_block().clone());
        let rebuilt = Chain::from_blocks(blocks).unwrap();
        assert_eq!(rebuilt, chain);
        assert!(Chain::from_blocks(vec![]).is_err());
    }

    #[test]
    fn test_title_queries() {
        let chain = build_chain(3, 1);
        let pages = chain.find_pages_by_title("Doc 2");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].get_page_index(), 0);
        assert!(chain.contains_page("Doc 1", 0));
        assert!(!chain.contains_page("Doc 1", 7));
        assert!(chain.find_pages_by_title("Missing").is_empty());

        let titles: Vec<&str> = chain.page_contents().map(|page| page.title).collect();
        assert_eq!(titles, vec!["Doc 1", "Doc 2", "Doc 3"]);
    }

    #[test]
    fn test_blocks_from_and_common_ancestor() {
        let chain = build_chain(4, 1);
        assert_eq!(chain.blocks_from(2).len(), 3);
        assert!(chain.blocks_from(10).is_empty());

        let mut fork = Chain::from_blocks(chain.blocks()[..3].to_vec()).unwrap();
        let side = mined_child(fork.tip(), vec![record("Side", 0)], 1);
        fork.append(side).unwrap();
        assert_eq!(chain.common_ancestor(&fork), 2);
        assert_eq!(fork.common_ancestor(&chain), 2);
    }

    #[test]
    fn test_chain_view_publishes_snapshots() {
        let view = ChainView::new(Arc::new(Chain::new()));
        let before = view.snapshot();
        view.publish(Arc::new(build_chain(2, 1)));
        assert_eq!(before.height(), 0);
        assert_eq!(view.height(), 2);
    }
}
