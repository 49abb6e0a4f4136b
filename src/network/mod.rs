//! Peer-to-peer networking
//!
//! Length-prefixed JSON messages over TCP, a handshake per connection,
//! inventory-based relay of blocks and transactions, and a bounded peer
//! table. Connections are tokio tasks that stop on a shared shutdown signal.

pub mod codec;
pub mod message;
pub mod peer;
pub mod peers;
pub mod server;

pub use codec::{encode_frame, read_message, write_message, MAX_MESSAGE_SIZE};
pub use message::{InvItem, InvType, Message, VersionPayload, PROTOCOL_VERSION};
pub use peer::HandshakeState;
pub use peers::{PeerRegistry, PeerSender};
pub use server::{send_tx, NodeContext, Server};
