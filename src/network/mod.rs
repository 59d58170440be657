//! Peer-to-peer networking
//!
//! Framed TCP connections between nodes, the message set they speak, and the
//! sync manager that turns those messages into chain updates.
//!
//! Every connection gets a reader and a writer thread; neither touches the
//! chain. They only forward `SyncEvent`s to the sync manager, which owns all
//! consensus state.

pub mod connection;
pub mod message;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod sync;

pub use message::{Handshake, Message};
pub use peer::{ConnectionState, Direction, PeerId, PeerSummary};
pub use protocol::{read_message, send_message, MAGIC, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};
pub use server::{NodeHandle, Server};
pub use sync::{NodeStatus, SyncEvent, SyncManager, SyncSettings};
