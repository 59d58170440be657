//! Builders shared by the core unit tests.

use crate::core::block::{BlockHeader, GENESIS_TIMESTAMP};
use crate::core::page::{chained_content_hash, PageRecord, SignerIdentity};
use crate::core::{Block, Chain, ProofOfWork};
use crate::utils::Hash;

/// Structurally valid record; accepted by `AcceptAll`, not by ECDSA.
pub(crate) fn record(title: &str, page_index: u32) -> PageRecord {
    let text = format!("Page {page_index} of {title}. Nothing else.");
    PageRecord::from_parts(
        title.to_string(),
        page_index,
        text.clone(),
        chained_content_hash(title, page_index, &text),
        b"test-signature".to_vec(),
        SignerIdentity {
            username: "tester".to_string(),
            public_key: vec![1, 2, 3],
        },
        GENESIS_TIMESTAMP,
    )
}

pub(crate) fn unmined_child(previous: &Block, records: Vec<PageRecord>, difficulty: u32) -> Block {
    Block::new_template(previous, records, difficulty, previous.get_timestamp() + 1_000)
        .expect("non-empty records")
}

pub(crate) fn mined_child(previous: &Block, records: Vec<PageRecord>, difficulty: u32) -> Block {
    ProofOfWork::solve(unmined_child(previous, records, difficulty))
}

/// Chain of `height` mined blocks; block `i` records page 0 of "Doc i".
pub(crate) fn build_chain(height: u64, difficulty: u32) -> Chain {
    let mut chain = Chain::new();
    for i in 1..=height {
        let block = mined_child(chain.tip(), vec![record(&format!("Doc {i}"), 0)], difficulty);
        chain.append(block).expect("linked");
    }
    chain
}

/// Unmined, unlinked block with just the fields difficulty retargeting reads.
pub(crate) fn block_at(index: u64, timestamp: i64, difficulty: u32) -> Block {
    let records = vec![record("Filler", index as u32)];
    let header = BlockHeader::new(
        index,
        Hash::ZERO,
        timestamp,
        0,
        difficulty,
        Block::compute_records_root(&records),
    );
    Block::from_parts(header, records)
}
