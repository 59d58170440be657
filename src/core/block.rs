use crate::core::merkle::{MerkleProof, MerkleTree};
use crate::core::page::{chained_content_hash, PageRecord, SignerIdentity};
use crate::error::{ChainValidationError, LedgerError, Result, ValidationErrorKind};
use crate::utils::{deserialize, double_sha256, serialize, Hash};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// 2025-01-01T00:00:00Z; shared by every node so genesis hashes agree.
pub const GENESIS_TIMESTAMP: i64 = 1_735_689_600_000;
const GENESIS_TITLE: &str = "Genesis Block";

static GENESIS: Lazy<Block> = Lazy::new(|| {
    let record = PageRecord::from_parts(
        GENESIS_TITLE.to_string(),
        0,
        GENESIS_TITLE.to_string(),
        chained_content_hash(GENESIS_TITLE, 0, GENESIS_TITLE),
        b"N/A".to_vec(),
        SignerIdentity {
            username: "genesis".to_string(),
            public_key: Vec::new(),
        },
        GENESIS_TIMESTAMP,
    );
    let records = vec![record];
    let header = BlockHeader {
        index: 0,
        previous_hash: Hash::ZERO,
        timestamp: GENESIS_TIMESTAMP,
        nonce: 0,
        difficulty: 0,
        records_root: Block::compute_records_root(&records),
    };
    Block { header, records }
});

/// The fixed first block, identical on every node.
pub fn genesis_block() -> &'static Block {
    &GENESIS
}

/// Everything that is hashed. The block hash itself is never stored; it is
/// recomputed from these fields whenever it is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockHeader {
    index: u64,
    previous_hash: Hash,
    timestamp: i64,
    nonce: u64,
    difficulty: u32,
    records_root: Hash,
}

impl BlockHeader {
    pub fn new(
        index: u64,
        previous_hash: Hash,
        timestamp: i64,
        nonce: u64,
        difficulty: u32,
        records_root: Hash,
    ) -> BlockHeader {
        BlockHeader {
            index,
            previous_hash,
            timestamp,
            nonce,
            difficulty,
            records_root,
        }
    }

    /// Canonical byte layout fed to the hash function.
    pub fn prepare_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(96);
        data.extend(self.index.to_be_bytes());
        data.extend(self.previous_hash.as_bytes());
        data.extend(self.timestamp.to_be_bytes());
        data.extend(self.nonce.to_be_bytes());
        data.extend(self.difficulty.to_be_bytes());
        data.extend(self.records_root.as_bytes());
        data
    }

    pub fn compute_hash(&self) -> Hash {
        double_sha256(&self.prepare_data())
    }

    pub fn get_index(&self) -> u64 {
        self.index
    }

    pub fn get_previous_hash(&self) -> Hash {
        self.previous_hash
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn get_records_root(&self) -> Hash {
        self.records_root
    }

    pub(crate) fn set_nonce(&mut self, nonce: u64) {
        self.nonce = nonce;
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    header: BlockHeader,
    records: Vec<PageRecord>,
}

impl Block {
    /// Unmined candidate that extends `previous`. The nonce still has to be
    /// found by proof-of-work before the block is valid.
    pub fn new_template(
        previous: &Block,
        records: Vec<PageRecord>,
        difficulty: u32,
        timestamp: i64,
    ) -> Result<Block> {
        if records.is_empty() {
            return Err(LedgerError::Validation(ChainValidationError {
                index: previous.get_index() + 1,
                kind: ValidationErrorKind::EmptyBody,
            }));
        }

        let header = BlockHeader {
            index: previous.get_index() + 1,
            previous_hash: previous.hash(),
            timestamp: timestamp.max(previous.get_timestamp()),
            nonce: 0,
            difficulty,
            records_root: Self::compute_records_root(&records),
        };
        Ok(Block { header, records })
    }

    /// Reassembles a block from its parts, e.g. after decoding it off the
    /// wire. Validity is the validator's business.
    pub fn from_parts(header: BlockHeader, records: Vec<PageRecord>) -> Block {
        Block { header, records }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn hash(&self) -> Hash {
        self.header.compute_hash()
    }

    pub fn is_genesis(&self) -> bool {
        self == genesis_block()
    }

    pub fn get_header(&self) -> &BlockHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut BlockHeader {
        &mut self.header
    }

    pub fn get_records(&self) -> &[PageRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<PageRecord> {
        self.records
    }

    pub fn get_index(&self) -> u64 {
        self.header.index
    }

    pub fn get_previous_hash(&self) -> Hash {
        self.header.previous_hash
    }

    pub fn get_timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn get_nonce(&self) -> u64 {
        self.header.nonce
    }

    pub fn get_difficulty(&self) -> u32 {
        self.header.difficulty
    }

    pub fn compute_records_root(records: &[PageRecord]) -> Hash {
        let ids: Vec<Hash> = records.iter().map(PageRecord::record_id).collect();
        MerkleTree::calculate_root(&ids)
    }

    /// Whether the header's records root matches the body.
    pub fn verify_records_root(&self) -> bool {
        Self::compute_records_root(&self.records) == self.header.records_root
    }

    /// Proof that the record at `record_index` is committed to by this
    /// block's header.
    pub fn inclusion_proof(&self, record_index: usize) -> Result<MerkleProof> {
        let ids: Vec<Hash> = self.records.iter().map(PageRecord::record_id).collect();
        MerkleTree::from_leaves(&ids)?.generate_proof(record_index)
    }
}
