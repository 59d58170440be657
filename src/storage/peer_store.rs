use crate::error::{LedgerError, Result};
use log::debug;
use std::net::SocketAddr;
use std::path::Path;

const PEERS_TREE: &str = "peers";

/// Address book of peers this node has heard of, kept in a sled tree.
/// The value is the number of consecutive failed connection attempts.
#[derive(Clone)]
pub struct PeerStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl PeerStore {
    pub fn open(path: &Path) -> Result<PeerStore> {
        let db = sled::open(path)
            .map_err(|e| LedgerError::Database(format!("Failed to open peer database: {e}")))?;
        Self::from_db(db)
    }

    /// In-memory store that vanishes with the process.
    pub fn temporary() -> Result<PeerStore> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| LedgerError::Database(format!("Failed to open peer database: {e}")))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<PeerStore> {
        let tree = db
            .open_tree(PEERS_TREE)
            .map_err(|e| LedgerError::Database(format!("Failed to open peers tree: {e}")))?;
        Ok(PeerStore { db, tree })
    }

    /// Remembers an address. Known addresses keep their failure count.
    pub fn add(&self, addr: &SocketAddr) -> Result<bool> {
        let key = addr.to_string();
        let inserted = self
            .tree
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(&0u32.to_be_bytes()[..]))?
            .is_ok();
        if inserted {
            debug!("Learned peer address {addr}");
        }
        Ok(inserted)
    }

    pub fn contains(&self, addr: &SocketAddr) -> Result<bool> {
        Ok(self.tree.contains_key(addr.to_string().as_bytes())?)
    }

    /// Bumps the failure count and returns the new value.
    pub fn record_failure(&self, addr: &SocketAddr) -> Result<u32> {
        let updated = self.tree.update_and_fetch(addr.to_string().as_bytes(), |old| {
            let failures = old.map(decode_failures).unwrap_or(0).saturating_add(1);
            Some(failures.to_be_bytes().to_vec())
        })?;
        Ok(updated.map(|v| decode_failures(&v)).unwrap_or(0))
    }

    pub fn record_success(&self, addr: &SocketAddr) -> Result<()> {
        self.tree
            .insert(addr.to_string().as_bytes(), &0u32.to_be_bytes()[..])?;
        Ok(())
    }

    pub fn remove(&self, addr: &SocketAddr) -> Result<()> {
        self.tree.remove(addr.to_string().as_bytes())?;
        Ok(())
    }

    /// Every stored address with its failure count.
    pub fn known_peers(&self) -> Result<Vec<(SocketAddr, u32)>> {
        let mut peers = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let addr = String::from_utf8_lossy(&key);
            match addr.parse::<SocketAddr>() {
                Ok(addr) => peers.push((addr, decode_failures(&value))),
                Err(_) => debug!("Skipping malformed peer entry {addr}"),
            }
        }
        Ok(peers)
    }

    /// Addresses that have failed fewer than `max_retries` times in a row.
    pub fn retryable(&self, max_retries: u32) -> Result<Vec<SocketAddr>> {
        Ok(self
            .known_peers()?
            .into_iter()
            .filter(|(_, failures)| *failures < max_retries)
            .map(|(addr, _)| addr)
            .collect())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_failures(bytes: &[u8]) -> u32 {
    match <[u8; 4]>::try_from(bytes) {
        Ok(raw) => u32::from_be_bytes(raw),
        Err(_) => 0,
    }
}
