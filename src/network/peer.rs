use crate::error::{LedgerError, Result};
use crate::network::message::Message;
use crate::utils::Hash;
use log::debug;
use serde::Serialize;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::Sender;

pub type PeerId = u64;

/// Lifecycle of one peer connection.
///
/// `Connecting -> Handshaking -> Synced <-> Stale -> Disconnected`; any state
/// may drop straight to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Synced,
    /// Peer that reported a greater height than ours. Its chain is being
    /// requested; it goes back to `Synced` once our height catches up or
    /// the download ends.
    Stale,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Synced)
                | (Synced, Stale)
                | (Stale, Synced)
                | (Connecting | Handshaking | Synced | Stale, Disconnected)
        )
    }

    /// Peers in these states receive announcements and height queries.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Synced | ConnectionState::Stale)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Sending side of a connection: the writer thread's queue plus a clone of
/// the socket so the connection can be torn down from outside.
#[derive(Debug)]
pub struct PeerHandle {
    outbound: Sender<Message>,
    socket: Option<TcpStream>,
}

impl PeerHandle {
    pub fn new(outbound: Sender<Message>, socket: TcpStream) -> PeerHandle {
        PeerHandle {
            outbound,
            socket: Some(socket),
        }
    }

    /// Handle without a socket; messages only land in the channel.
    pub fn detached(outbound: Sender<Message>) -> PeerHandle {
        PeerHandle {
            outbound,
            socket: None,
        }
    }

    /// Queues a message for the writer thread. False once the writer is gone.
    pub fn send(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }

    /// Shuts the socket down, which unblocks the reader thread.
    pub fn close(&self) {
        if let Some(socket) = &self.socket {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                debug!("Socket shutdown: {e}");
            }
        }
    }
}

/// What the sync manager knows about one connected peer.
#[derive(Debug)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub node_id: Option<String>,
    pub listen_port: Option<u16>,
    pub height: u64,
    pub tip_hash: Hash,
    /// A height query went out and has not been answered yet.
    pub awaiting_height: bool,
    state: ConnectionState,
    handle: PeerHandle,
}

impl PeerInfo {
    pub fn new(id: PeerId, addr: SocketAddr, direction: Direction, handle: PeerHandle) -> PeerInfo {
        PeerInfo {
            id,
            addr,
            direction,
            node_id: None,
            listen_port: None,
            height: 0,
            tip_hash: Hash::ZERO,
            awaiting_height: false,
            state: ConnectionState::Connecting,
            handle,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(LedgerError::Protocol(format!(
                "Peer {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        debug!("Peer {} ({}): {} -> {}", self.id, self.addr, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Address the peer accepts connections on, once its handshake told us.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_port
            .map(|port| SocketAddr::new(self.addr.ip(), port))
    }

    pub fn send(&self, message: Message) -> bool {
        self.handle.send(message)
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id,
            addr: self.addr.to_string(),
            node_id: self.node_id.clone(),
            direction: self.direction,
            state: self.state,
            height: self.height,
        }
    }
}

/// Peer entry in a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub addr: String,
    pub node_id: Option<String>,
    pub direction: Direction,
    pub state: ConnectionState,
    pub height: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_state_machine() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Synced));
        assert!(Synced.can_transition_to(Stale));
        assert!(Stale.can_transition_to(Synced));
        assert!(Handshaking.can_transition_to(Disconnected));

        assert!(!Connecting.can_transition_to(Synced));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Synced.can_transition_to(Handshaking));
    }

    #[test]
    fn test_peer_transitions_and_send() {
        let (tx, rx) = mpsc::channel();
        let addr: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        let mut peer = PeerInfo::new(1, addr, Direction::Inbound, PeerHandle::detached(tx));

        assert!(peer.transition(ConnectionState::Synced).is_err());
        peer.transition(ConnectionState::Handshaking).unwrap();
        peer.transition(ConnectionState::Synced).unwrap();
        assert!(peer.state().is_active());

        peer.listen_port = Some(2001);
        assert_eq!(peer.listen_addr(), Some("10.0.0.5:2001".parse().unwrap()));

        assert!(peer.send(Message::ChainHeightQuery));
        assert_eq!(rx.recv().unwrap(), Message::ChainHeightQuery);
        drop(rx);
        assert!(!peer.send(Message::ChainHeightQuery));
    }
}
