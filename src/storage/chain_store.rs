//! Chain persistence
//!
//! File layout:
//!
//! ```text
//! b"PGLEDGER" | u16 version | u64 block count | (u32 length | bincode block)*
//! ```
//!
//! All integers are big-endian. Blocks are written in chain order starting at
//! genesis.

use crate::core::{Block, Chain, Validator};
use crate::error::{LedgerError, Result};
use log::{info, warn};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CHAIN_FILE_MAGIC: &[u8; 8] = b"PGLEDGER";
pub const CHAIN_FILE_VERSION: u16 = 1;
const HEADER_LEN: usize = 8 + 2 + 8;

/// Somewhere a chain can be saved to and loaded back from.
pub trait ChainStore: Send {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Chain>>;

    fn save(&self, chain: &Chain) -> Result<()>;

    /// Loads and fully validates the stored chain. Any failure is reported
    /// as a persistence error and leaves the stored data alone.
    fn load_validated(&self, validator: &Validator) -> Result<Option<Chain>> {
        let chain = match self.load()? {
            Some(chain) => chain,
            None => return Ok(None),
        };
        validator.validate_chain(&chain).map_err(|err| {
            LedgerError::Persistence(format!("Stored chain failed validation at {err}"))
        })?;
        Ok(Some(chain))
    }
}

/// Stores the chain in a single file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileChainStore {
    path: PathBuf,
}

impl FileChainStore {
    pub fn new(path: impl Into<PathBuf>) -> FileChainStore {
        FileChainStore { path: path.into() }
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ChainStore for FileChainStore {
    fn load(&self) -> Result<Option<Chain>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|e| {
            LedgerError::Persistence(format!("Failed to read {}: {e}", self.path.display()))
        })?;
        let chain = decode_chain(&bytes)?;
        info!(
            "Loaded chain of height {} from {}",
            chain.height(),
            self.path.display()
        );
        Ok(Some(chain))
    }

    fn save(&self, chain: &Chain) -> Result<()> {
        let bytes = encode_chain(chain)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp = self.temp_path();
        let written = fs::File::create(&temp).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            warn!("Failed to write {}: {e}", temp.display());
            let _ = fs::remove_file(&temp);
            return Err(LedgerError::Persistence(format!(
                "Failed to write chain file: {e}"
            )));
        }

        fs::rename(&temp, &self.path).map_err(|e| {
            LedgerError::Persistence(format!("Failed to replace {}: {e}", self.path.display()))
        })
    }
}

pub fn encode_chain(chain: &Chain) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + chain.len() * 256);
    bytes.extend(CHAIN_FILE_MAGIC);
    bytes.extend(CHAIN_FILE_VERSION.to_be_bytes());
    bytes.extend((chain.len() as u64).to_be_bytes());

    for block in chain.blocks() {
        let encoded = block.serialize()?;
        let len = u32::try_from(encoded.len()).map_err(|_| {
            LedgerError::Persistence(format!("Block {} is too large to store", block.get_index()))
        })?;
        bytes.extend(len.to_be_bytes());
        bytes.extend(encoded);
    }
    Ok(bytes)
}

pub fn decode_chain(bytes: &[u8]) -> Result<Chain> {
    let corrupt = |what: &str| LedgerError::Persistence(format!("Corrupt chain file: {what}"));

    if bytes.len() < HEADER_LEN || &bytes[..8] != CHAIN_FILE_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = u16::from_be_bytes([bytes[8], bytes[9]]);
    if version != CHAIN_FILE_VERSION {
        return Err(corrupt(&format!("unsupported version {version}")));
    }
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[10..HEADER_LEN]);
    let count = u64::from_be_bytes(count_bytes);

    let mut blocks = Vec::new();
    let mut offset = HEADER_LEN;
    for i in 0..count {
        let len_end = offset + 4;
        if len_end > bytes.len() {
            return Err(corrupt(&format!("truncated length of block {i}")));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[offset..len_end]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        let end = len_end + len;
        if end > bytes.len() {
            return Err(corrupt(&format!("truncated block {i}")));
        }
        let block = Block::deserialize(&bytes[len_end..end])
            .map_err(|e| corrupt(&format!("block {i}: {e}")))?;
        blocks.push(block);
        offset = end;
    }

    if offset != bytes.len() {
        return Err(corrupt("trailing bytes"));
    }

    Chain::from_blocks(blocks).map_err(|e| corrupt(&e.to_string()))
}
