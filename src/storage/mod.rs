//! Data storage and persistence
//!
//! The pending pool of records waiting to be mined, the on-disk chain file,
//! and the sled-backed address book of known peers.

pub mod chain_store;
pub mod pending_pool;
pub mod peer_store;

pub use chain_store::{decode_chain, encode_chain, ChainStore, FileChainStore};
pub use pending_pool::PendingPool;
pub use peer_store::PeerStore;
