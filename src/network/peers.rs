use crate::error::{BlockchainError, Result};
use crate::network::Message;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

/// Outbound queue of one connection; its writer task owns the socket half.
pub type PeerSender = UnboundedSender<Message>;

/// Bounded table of live connections
///
/// Each entry is the sending side of a connection's outbound queue, so
/// broadcasting never touches a socket directly and a slow or dead peer
/// cannot hold up the others.
pub struct PeerRegistry {
    peers: RwLock<HashMap<SocketAddr, PeerSender>>,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_peers,
        }
    }

    /// `Ok(false)` when the table is full or `address` is already present.
    pub fn register(&self, address: SocketAddr, sender: PeerSender) -> Result<bool> {
        let mut peers = self
            .peers
            .write()
            .map_err(|e| BlockchainError::Network(format!("Failed to acquire peer lock: {e}")))?;

        if peers.len() >= self.max_peers {
            warn!("Rejecting peer {address}: limit of {} reached", self.max_peers);
            return Ok(false);
        }
        if peers.contains_key(&address) {
            warn!("Rejecting peer {address}: already connected");
            return Ok(false);
        }

        peers.insert(address, sender);
        info!("Connected to peer: {address}");
        Ok(true)
    }

    pub fn remove(&self, address: &SocketAddr) {
        match self.peers.write() {
            Ok(mut peers) => {
                if peers.remove(address).is_some() {
                    info!("Disconnected from peer: {address}");
                }
            }
            Err(e) => warn!("Failed to acquire peer lock: {e}"),
        }
    }

    /// Best-effort send to every peer except `except`; returns how many
    /// queues accepted the message.
    pub fn broadcast(&self, message: &Message, except: Option<SocketAddr>) -> usize {
        let peers = match self.peers.read() {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Failed to acquire peer lock: {e}");
                return 0;
            }
        };

        let mut delivered = 0;
        for (address, sender) in peers.iter() {
            if Some(*address) == except {
                continue;
            }
            if sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!("Peer {address} queue is closed, skipping");
            }
        }
        debug!("Broadcast {} to {delivered} peers", message.kind());
        delivered
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
