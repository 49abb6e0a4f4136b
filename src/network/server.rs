use crate::config::NodeConfig;
use crate::core::{Block, Blockchain, Transaction};
use crate::error::{BlockchainError, Result};
use crate::network::codec::{read_message, write_message};
use crate::network::peer::run_connection;
use crate::network::{InvItem, Message, PeerRegistry, VersionPayload, PROTOCOL_VERSION};
use crate::storage::MemoryPool;
use crate::utils::current_timestamp;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// State shared by every connection task and the miner.
pub struct NodeContext {
    pub(crate) config: NodeConfig,
    pub(crate) blockchain: Blockchain,
    pub(crate) mempool: MemoryPool,
    pub(crate) peers: PeerRegistry,
}

impl NodeContext {
    pub(crate) fn version_message(&self) -> Result<Message> {
        Ok(Message::Version(VersionPayload {
            protocol_version: PROTOCOL_VERSION,
            agent: self.config.agent.clone(),
            height: self.blockchain.get_best_height()? as u64,
            capabilities: vec!["blocks".to_string(), "tx".to_string()],
            timestamp: current_timestamp()?,
        }))
    }
}

/// Runs blocking ledger work (proof-of-work, sled commits) off the async
/// worker threads.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BlockchainError::Network(format!("Blocking task failed: {e}")))?
}

/// P2P node: accepts and dials connections, relays blocks and transactions,
/// and optionally mines.
#[derive(Clone)]
pub struct Server {
    ctx: Arc<NodeContext>,
}

impl Server {
    pub fn new(config: NodeConfig, blockchain: Blockchain) -> Self {
        let peers = PeerRegistry::new(config.max_peers);
        Self {
            ctx: Arc::new(NodeContext {
                config,
                blockchain,
                mempool: MemoryPool::new(),
                peers,
            }),
        }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.ctx.blockchain
    }

    pub fn get_mempool(&self) -> &MemoryPool {
        &self.ctx.mempool
    }

    pub fn get_peers(&self) -> &PeerRegistry {
        &self.ctx.peers
    }

    pub fn get_config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    /// Binds the configured address and serves until `shutdown` flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.ctx.config.listen_addr.as_str();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BlockchainError::Network(format!("Failed to bind to {addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Dials the seeds, starts the miner if configured, then accepts
    /// connections until `shutdown` flips.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Server listening on {}", listener.local_addr()?);

        for seed in &self.ctx.config.seeds {
            if let Err(e) = self.connect(seed, shutdown.clone()).await {
                warn!("Failed to connect to seed {seed}: {e}");
            }
        }

        if let Some(address) = &self.ctx.config.mining_address {
            info!("Mining enabled, rewards go to {address}");
            tokio::spawn(self.clone().mine_loop(shutdown.clone()));
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutting down listener");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {peer_addr}");
                        tokio::spawn(run_connection(
                            Arc::clone(&self.ctx),
                            stream,
                            peer_addr,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => error!("Failed to accept connection: {e}"),
                },
            }
        }
    }

    /// Opens an outbound connection within the configured dial timeout.
    pub async fn connect(&self, addr: &str, shutdown: watch::Receiver<bool>) -> Result<SocketAddr> {
        let stream = timeout(self.ctx.config.dial_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| BlockchainError::Network(format!("Timed out dialing {addr}")))?
            .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;
        let peer_addr = stream.peer_addr()?;

        tokio::spawn(run_connection(
            Arc::clone(&self.ctx),
            stream,
            peer_addr,
            shutdown,
        ));
        Ok(peer_addr)
    }

    /// Verifies a loose transaction against the UTXO index, pools it and
    /// announces it to every peer.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<()> {
        if !self.ctx.blockchain.verify_transaction(&tx)? {
            return Err(BlockchainError::Transaction(format!(
                "Transaction {} failed verification",
                tx.get_id_hex()
            )));
        }
        let inv = Message::Inv {
            items: vec![InvItem::tx(tx.get_id())],
        };
        info!("Accepted transaction {} into the memory pool", tx.get_id_hex());
        self.ctx.mempool.add(tx);
        self.ctx.peers.broadcast(&inv, None);
        Ok(())
    }

    async fn mine_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.ctx.config.mining_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Miner stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.mine_pending().await {
                Ok(Some(block)) => debug!("Miner round produced {}", block.get_hash_hex()),
                Ok(None) => {}
                Err(BlockchainError::StaleTip(msg)) => info!("Mined block went stale: {msg}"),
                Err(e) => warn!("Mining round failed: {e}"),
            }
        }
    }

    /// One mining round: valid, mutually compatible mempool transactions
    /// behind a fresh coinbase. Returns `None` when there is nothing to do.
    pub async fn mine_pending(&self) -> Result<Option<Block>> {
        let Some(address) = self.ctx.config.mining_address.clone() else {
            return Ok(None);
        };
        // an empty node waits to receive a genesis block from its peers
        if self.ctx.blockchain.is_empty()? {
            return Ok(None);
        }

        let selected = self.select_transactions()?;
        if selected.is_empty() && !self.ctx.config.mine_empty_blocks {
            return Ok(None);
        }

        let mut block_txs = vec![Transaction::new_coinbase_tx(&address, "")?];
        block_txs.extend(selected);

        let blockchain = self.ctx.blockchain.clone();
        let block = run_blocking(move || blockchain.mine_block(&block_txs)).await?;

        self.ctx.mempool.remove_included(block.get_transactions());
        self.ctx.peers.broadcast(
            &Message::Inv {
                items: vec![InvItem::block(block.get_hash())],
            },
            None,
        );
        Ok(Some(block))
    }

    fn select_transactions(&self) -> Result<Vec<Transaction>> {
        let mut selected = vec![];
        let mut spent = HashSet::new();

        for tx in self.ctx.mempool.get_all() {
            match self.ctx.blockchain.verify_transaction(&tx) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Dropping invalid transaction {}", tx.get_id_hex());
                    self.ctx.mempool.remove(&tx.get_id_hex());
                    continue;
                }
                Err(e) => {
                    warn!("Dropping transaction {}: {e}", tx.get_id_hex());
                    self.ctx.mempool.remove(&tx.get_id_hex());
                    continue;
                }
            }

            let out_points = tx.spent_outpoints()?;
            if out_points.iter().any(|out_point| spent.contains(out_point)) {
                // conflicts with one already selected; retried next round
                continue;
            }
            spent.extend(out_points);
            selected.push(tx);
        }
        Ok(selected)
    }
}

/// Hands one transaction to the node at `addr`: handshake, send, close.
pub async fn send_tx(addr: &str, tx: &Transaction, config: &NodeConfig) -> Result<()> {
    let mut stream = timeout(config.dial_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| BlockchainError::Network(format!("Timed out dialing {addr}")))?
        .map_err(|e| BlockchainError::Network(format!("Failed to connect to {addr}: {e}")))?;

    let version = Message::Version(VersionPayload {
        protocol_version: PROTOCOL_VERSION,
        agent: config.agent.clone(),
        height: 0,
        capabilities: vec![],
        timestamp: current_timestamp()?,
    });
    write_message(&mut stream, &version).await?;

    let (mut got_version, mut got_verack) = (false, false);
    while !(got_version && got_verack) {
        match read_message(&mut stream).await? {
            Some(Message::Version(_)) => {
                got_version = true;
                write_message(&mut stream, &Message::Verack {}).await?;
            }
            Some(Message::Verack {}) => got_verack = true,
            Some(other) => debug!("Ignoring {} during handshake", other.kind()),
            None => {
                return Err(BlockchainError::Network(format!(
                    "{addr} closed the connection during the handshake"
                )))
            }
        }
    }

    write_message(
        &mut stream,
        &Message::Tx {
            transaction: tx.serialize()?,
        },
    )
    .await?;
    info!("Sent transaction {} to {addr}", tx.get_id_hex());
    Ok(())
}
