use crate::core::{AcceptOutcome, Block, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::codec::{read_message, write_message};
use crate::network::server::{run_blocking, NodeContext};
use crate::network::{InvItem, InvType, Message, PeerSender};
use data_encoding::HEXLOWER;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Handshake progress of one connection. Nothing here is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeState {
    pub sent_version: bool,
    pub got_version: bool,
    pub got_verack: bool,
}

impl HandshakeState {
    pub fn is_established(&self) -> bool {
        self.sent_version && self.got_version && self.got_verack
    }
}

/// Drives one socket until the peer leaves, a frame or payload fails to
/// decode, or `shutdown` flips. Failures stay local to this connection.
pub(crate) async fn run_connection(
    ctx: Arc<NodeContext>,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();

    match ctx.peers.register(addr, outbound.clone()) {
        Ok(true) => {}
        Ok(false) => return,
        Err(e) => {
            warn!("Dropping connection from {addr}: {e}");
            return;
        }
    }
    // deregisters on every exit path, unwinding included
    let registration = Registration {
        ctx: Arc::clone(&ctx),
        addr,
    };

    let writer_task = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            if let Err(e) = write_message(&mut writer, &message).await {
                debug!("Write to {addr} failed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut connection = Connection {
        ctx: Arc::clone(&ctx),
        addr,
        outbound,
        state: HandshakeState::default(),
    };

    match connection.start() {
        Ok(()) => loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Closing {addr} for shutdown");
                    break;
                }
                read = read_message(&mut reader) => match read {
                    Ok(Some(message)) => {
                        if let Err(e) = connection.handle(message).await {
                            warn!("Closing {addr}: {e}");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Peer {addr} closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Closing {addr}: {e}");
                        break;
                    }
                },
            }
        },
        Err(e) => warn!("Failed to start connection with {addr}: {e}"),
    }

    // the registry held the only other sender; the writer drains and exits
    drop(registration);
    drop(connection);
    let _ = writer_task.await;
}

/// Holds a connection's slot in the peer registry and frees it on drop.
struct Registration {
    ctx: Arc<NodeContext>,
    addr: SocketAddr,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.ctx.peers.remove(&self.addr);
    }
}

struct Connection {
    ctx: Arc<NodeContext>,
    addr: SocketAddr,
    outbound: PeerSender,
    state: HandshakeState,
}

impl Connection {
    fn send(&self, message: Message) -> Result<()> {
        debug!("Sending {} to {}", message.kind(), self.addr);
        self.outbound
            .send(message)
            .map_err(|_| BlockchainError::Network(format!("Writer for {} has stopped", self.addr)))
    }

    fn start(&mut self) -> Result<()> {
        self.send(self.ctx.version_message()?)?;
        self.state.sent_version = true;
        Ok(())
    }

    /// `Err` closes the connection; only undecodable payloads and a dead
    /// writer do that. Invalid blocks and transactions are logged and dropped.
    async fn handle(&mut self, message: Message) -> Result<()> {
        debug!("Received {} from {}", message.kind(), self.addr);

        if self.ctx.config.require_handshake
            && !self.state.is_established()
            && !message.is_handshake_or_liveness()
        {
            debug!(
                "Ignoring {} from {} before the handshake completes",
                message.kind(),
                self.addr
            );
            return Ok(());
        }

        match message {
            Message::Version(version) => {
                let was_established = self.state.is_established();
                self.state.got_version = true;
                info!(
                    "Peer {} runs {} (protocol {}, height {})",
                    self.addr, version.agent, version.protocol_version, version.height
                );
                self.send(Message::Verack {})?;

                let our_height = self.ctx.blockchain.get_best_height()? as u64;
                if version.height > our_height {
                    self.send(Message::GetBlocks {
                        locator_hashes: vec![self.ctx.blockchain.get_tip_hash()?],
                        stop_hash: vec![],
                    })?;
                }
                self.on_progress(was_established)
            }
            Message::Verack {} => {
                let was_established = self.state.is_established();
                self.state.got_verack = true;
                self.on_progress(was_established)
            }
            Message::Ping { nonce } => self.send(Message::Pong { nonce }),
            Message::Pong { nonce } => {
                debug!("Pong {nonce} from {}", self.addr);
                Ok(())
            }
            Message::GetBlocks { .. } => {
                let items = self
                    .ctx
                    .blockchain
                    .get_block_hashes()?
                    .iter()
                    .map(|hash| InvItem::block(hash))
                    .collect();
                self.send(Message::Inv { items })
            }
            Message::Inv { items } => self.handle_inv(items),
            Message::GetData { items } => self.handle_get_data(items),
            Message::Block { block } => self.handle_block(&block).await,
            Message::Tx { transaction } => self.handle_tx(&transaction),
            Message::GetMempool {} => self.send(Message::Mempool {
                hashes: self.ctx.mempool.get_all_hashes(),
            }),
            Message::Mempool { hashes } => {
                let items = hashes.iter().map(|hash| InvItem::tx(hash)).collect();
                self.handle_inv(items)
            }
        }
    }

    fn on_progress(&mut self, was_established: bool) -> Result<()> {
        if !was_established && self.state.is_established() {
            info!("Handshake with {} complete", self.addr);
            self.send(Message::GetMempool {})?;
        }
        Ok(())
    }

    /// Requests only the announced items we do not already hold.
    fn handle_inv(&self, items: Vec<InvItem>) -> Result<()> {
        let mut wanted = vec![];
        for item in items {
            let known = match item.kind {
                InvType::Block => self.ctx.blockchain.has_block(&item.hash)?,
                InvType::Tx => self.ctx.mempool.has(&HEXLOWER.encode(&item.hash)),
            };
            if !known {
                wanted.push(item);
            }
        }

        if wanted.is_empty() {
            return Ok(());
        }
        self.send(Message::GetData { items: wanted })
    }

    fn handle_get_data(&self, items: Vec<InvItem>) -> Result<()> {
        for item in items {
            match item.kind {
                InvType::Block => match self.ctx.blockchain.get_block(&item.hash)? {
                    Some(block) => self.send(Message::Block {
                        block: block.serialize()?,
                    })?,
                    None => debug!("Peer asked for unknown block {}", HEXLOWER.encode(&item.hash)),
                },
                InvType::Tx => match self.ctx.mempool.get(&HEXLOWER.encode(&item.hash)) {
                    Some(tx) => self.send(Message::Tx {
                        transaction: tx.serialize()?,
                    })?,
                    None => debug!("Peer asked for unknown tx {}", HEXLOWER.encode(&item.hash)),
                },
            }
        }
        Ok(())
    }

    async fn handle_block(&self, bytes: &[u8]) -> Result<()> {
        let block = Block::deserialize(bytes)?;
        let hash_hex = block.get_hash_hex();

        let blockchain = self.ctx.blockchain.clone();
        let candidate = block.clone();
        let outcome = run_blocking(move || blockchain.accept_block(&candidate)).await;

        match outcome {
            Ok(AcceptOutcome::Committed) => {
                self.ctx.mempool.remove_included(block.get_transactions());
                self.ctx.peers.broadcast(
                    &Message::Inv {
                        items: vec![InvItem::block(block.get_hash())],
                    },
                    Some(self.addr),
                );
            }
            Ok(AcceptOutcome::AlreadyKnown) => debug!("Block {hash_hex} already known"),
            Ok(AcceptOutcome::NotExtendingTip) => {
                debug!("Ignoring block {hash_hex}: it does not extend our tip")
            }
            Err(e) => warn!("Rejected block {hash_hex} from {}: {e}", self.addr),
        }
        Ok(())
    }

    fn handle_tx(&self, bytes: &[u8]) -> Result<()> {
        let tx = Transaction::deserialize(bytes)?;
        let txid_hex = tx.get_id_hex();
        if self.ctx.mempool.has(&txid_hex) {
            return Ok(());
        }

        match self.ctx.blockchain.verify_transaction(&tx) {
            Ok(true) => {
                info!("Accepted transaction {txid_hex} from {}", self.addr);
                let inv = Message::Inv {
                    items: vec![InvItem::tx(tx.get_id())],
                };
                self.ctx.mempool.add(tx);
                self.ctx.peers.broadcast(&inv, Some(self.addr));
            }
            Ok(false) => warn!("Rejected transaction {txid_hex}: verification failed"),
            Err(e) => warn!("Rejected transaction {txid_hex}: {e}"),
        }
        Ok(())
    }
}
