use crate::error::{LedgerError, Result};
use crate::network::message::Message;
use crate::network::peer::{PeerHandle, PeerId};
use crate::network::protocol::{read_message, send_message};
use crate::network::sync::SyncEvent;
use log::{debug, warn};
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Shuts the socket down when dropped, whichever way a connection thread
/// exits.
struct SocketGuard(TcpStream);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// Starts the reader and writer threads for an established connection and
/// returns the handle used to talk to it.
pub fn spawn_connection(
    peer: PeerId,
    stream: TcpStream,
    events: Sender<SyncEvent>,
    socket_timeout: Duration,
) -> Result<(PeerHandle, Vec<JoinHandle<()>>)> {
    stream.set_read_timeout(Some(socket_timeout))?;
    stream.set_write_timeout(Some(socket_timeout))?;
    let _ = stream.set_nodelay(true);

    let read_half = stream.try_clone()?;
    let write_half = stream.try_clone()?;
    let (outbound, queue) = mpsc::channel::<Message>();

    let reader = thread::Builder::new()
        .name(format!("peer-{peer}-reader"))
        .spawn(move || read_loop(peer, read_half, events))
        .map_err(|e| LedgerError::Io(format!("Failed to spawn reader thread: {e}")))?;

    let writer = thread::Builder::new()
        .name(format!("peer-{peer}-writer"))
        .spawn(move || {
            let guard = SocketGuard(write_half);
            let mut writer = BufWriter::new(&guard.0);
            for message in queue {
                if let Err(e) = send_message(&mut writer, &message) {
                    debug!("Peer {peer}: write failed: {e}");
                    break;
                }
            }
        })
        .map_err(|e| LedgerError::Io(format!("Failed to spawn writer thread: {e}")))?;

    Ok((PeerHandle::new(outbound, stream), vec![reader, writer]))
}

fn read_loop(peer: PeerId, stream: TcpStream, events: Sender<SyncEvent>) {
    let guard = SocketGuard(stream);
    let mut reader = BufReader::new(&guard.0);

    let reason = loop {
        match read_message(&mut reader) {
            Ok(message) => {
                if events.send(SyncEvent::PeerMessage { peer, message }).is_err() {
                    break "node shutting down".to_string();
                }
            }
            Err(e) => {
                if e.is_protocol() {
                    warn!("Peer {peer}: {e}, closing connection");
                } else {
                    debug!("Peer {peer}: {e}");
                }
                break e.to_string();
            }
        }
    };

    drop(reader);
    drop(guard);
    let _ = events.send(SyncEvent::PeerDisconnected { peer, reason });
}

/// Connects to `addr` on a short-lived thread and reports the outcome to
/// the sync manager.
pub fn dial(
    addr: SocketAddr,
    events: Sender<SyncEvent>,
    timeout: Duration,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("dial-{addr}"))
        .spawn(move || {
            let event = match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => SyncEvent::Connected {
                    stream,
                    addr,
                    direction: crate::network::peer::Direction::Outbound,
                },
                Err(e) => SyncEvent::DialFailed {
                    addr,
                    error: e.to_string(),
                },
            };
            let _ = events.send(event);
        })
        .map_err(|e| LedgerError::Io(format!("Failed to spawn dial thread: {e}")))
}
