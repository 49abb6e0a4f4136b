//! Network integration tests
//!
//! Real TCP nodes on ephemeral ports. A scripted peer speaks the wire
//! protocol directly; a ping sent after the message under test marks the
//! point by which every reply to it has arrived, since a connection is
//! processed strictly in order.

use std::net::SocketAddr;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use utxo_chain::core::{Blockchain, Transaction};
use utxo_chain::network::{
    read_message, write_message, InvItem, InvType, Message, VersionPayload, PROTOCOL_VERSION,
};
use utxo_chain::storage::UTXOSet;
use utxo_chain::wallet::Wallet;
use utxo_chain::{send_tx, NodeConfig, Server};

const TEST_DIFFICULTY: u32 = 8;
const WAIT: Duration = Duration::from_secs(10);

fn new_chain() -> (Blockchain, Wallet, TempDir) {
    let temp_dir = tempdir().unwrap();
    let miner = Wallet::new().unwrap();
    let blockchain =
        Blockchain::create_blockchain(temp_dir.path(), &miner.get_address(), TEST_DIFFICULTY)
            .unwrap();
    (blockchain, miner, temp_dir)
}

fn mine_empty(blockchain: &Blockchain) {
    let reward = Wallet::new().unwrap().get_address();
    blockchain
        .mine_block(&[Transaction::new_coinbase_tx(&reward, "").unwrap()])
        .unwrap();
}

async fn start_node(blockchain: Blockchain) -> (Server, SocketAddr, watch::Sender<bool>) {
    let config = NodeConfig {
        difficulty: TEST_DIFFICULTY,
        ..NodeConfig::default()
    };
    start_node_with(config, blockchain).await
}

async fn start_node_with(
    config: NodeConfig,
    blockchain: Blockchain,
) -> (Server, SocketAddr, watch::Sender<bool>) {
    let server = Server::new(config, blockchain);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener, shutdown_rx).await });
    (server, addr, shutdown_tx)
}

async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    condition()
}

struct ScriptedPeer {
    stream: TcpStream,
}

impl ScriptedPeer {
    async fn connect(addr: SocketAddr) -> ScriptedPeer {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut peer = ScriptedPeer { stream };
        peer.send(Message::Version(VersionPayload {
            protocol_version: PROTOCOL_VERSION,
            agent: "scripted-peer".to_string(),
            height: 0,
            capabilities: vec![],
            timestamp: 0,
        }))
        .await;
        peer
    }

    /// Connects and completes the handshake in both directions.
    async fn handshake(addr: SocketAddr) -> ScriptedPeer {
        let mut peer = ScriptedPeer::connect(addr).await;
        let (mut got_version, mut got_verack) = (false, false);
        while !(got_version && got_verack) {
            match peer.recv().await {
                Message::Version(_) => {
                    got_version = true;
                    peer.send(Message::Verack {}).await;
                }
                Message::Verack {} => got_verack = true,
                _ => {}
            }
        }
        peer
    }

    async fn send(&mut self, message: Message) {
        write_message(&mut self.stream, &message).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(WAIT, read_message(&mut self.stream))
            .await
            .expect("timed out waiting for a message")
            .unwrap()
            .expect("node closed the connection")
    }

    /// Sends a ping and returns everything received before its pong.
    async fn drain_until_pong(&mut self, nonce: u64) -> Vec<Message> {
        self.send(Message::Ping { nonce }).await;
        let mut seen = vec![];
        loop {
            match self.recv().await {
                Message::Pong { nonce: n } if n == nonce => return seen,
                other => seen.push(other),
            }
        }
    }
}

/// Reads until the node closes the connection or `WAIT` runs out.
async fn wait_for_close(stream: &mut TcpStream) -> bool {
    timeout(WAIT, async {
        loop {
            match read_message(stream).await {
                Ok(Some(_)) => continue,
                _ => return,
            }
        }
    })
    .await
    .is_ok()
}

fn has_get_data(messages: &[Message]) -> bool {
    messages
        .iter()
        .any(|message| matches!(message, Message::GetData { .. }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inv_for_known_block_requests_nothing() {
    let (blockchain, _miner, _dir) = new_chain();
    let known = blockchain.get_tip_hash().unwrap();
    let (_server, addr, _shutdown) = start_node(blockchain).await;

    let mut peer = ScriptedPeer::handshake(addr).await;
    peer.send(Message::Inv {
        items: vec![InvItem::block(&known)],
    })
    .await;
    let replies = peer.drain_until_pong(1).await;
    assert!(!has_get_data(&replies));

    // an unknown hash is requested
    peer.send(Message::Inv {
        items: vec![InvItem::block(&[0xee; 32])],
    })
    .await;
    let replies = peer.drain_until_pong(2).await;
    assert!(replies.iter().any(|message| matches!(
        message,
        Message::GetData { items } if items.len() == 1 && items[0].kind == InvType::Block
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_not_extending_tip_is_ignored() {
    let (blockchain, _miner, _dir) = new_chain();
    let tip = blockchain.get_tip_hash().unwrap();
    let (server, addr, _shutdown) = start_node(blockchain).await;

    // a second block from an unrelated chain
    let (other, _other_miner, _other_dir) = new_chain();
    mine_empty(&other);
    let foreign = other.get_block(&other.get_tip_hash().unwrap()).unwrap().unwrap();

    let mut peer = ScriptedPeer::handshake(addr).await;
    peer.send(Message::Block {
        block: foreign.serialize().unwrap(),
    })
    .await;
    peer.drain_until_pong(3).await;

    let ledger = server.get_blockchain();
    assert_eq!(ledger.get_tip_hash().unwrap(), tip);
    assert!(!ledger.has_block(foreign.get_hash()).unwrap());
    assert_eq!(ledger.get_best_height().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relay_waits_for_handshake() {
    let (blockchain, _miner, _dir) = new_chain();
    let (_server, addr, _shutdown) = start_node(blockchain).await;

    // version only, no verack: the node must not answer getblocks yet
    let mut peer = ScriptedPeer::connect(addr).await;
    peer.send(Message::GetBlocks {
        locator_hashes: vec![],
        stop_hash: vec![],
    })
    .await;
    let replies = peer.drain_until_pong(4).await;
    assert!(!replies
        .iter()
        .any(|message| matches!(message, Message::Inv { .. })));

    peer.send(Message::Verack {}).await;
    peer.send(Message::GetBlocks {
        locator_hashes: vec![],
        stop_hash: vec![],
    })
    .await;
    let replies = peer.drain_until_pong(5).await;
    assert!(replies
        .iter()
        .any(|message| matches!(message, Message::Inv { items } if items.len() == 1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frame_closes_only_that_connection() {
    let (blockchain, _miner, _dir) = new_chain();
    let (_server, addr, _shutdown) = start_node(blockchain).await;

    let mut bad = ScriptedPeer::handshake(addr).await;
    bad.stream
        .write_all(&(64u32 * 1024 * 1024).to_be_bytes())
        .await
        .unwrap();
    assert!(wait_for_close(&mut bad.stream).await);

    // the node keeps serving others
    let mut good = ScriptedPeer::handshake(addr).await;
    good.drain_until_pong(6).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_nodes_sync_blocks_and_transactions() {
    let (source, miner, _dir) = new_chain();
    mine_empty(&source);
    let (node_a, addr_a, _shutdown_a) = start_node(source.clone()).await;

    let fresh_dir = tempdir().unwrap();
    let fresh = Blockchain::open(fresh_dir.path(), TEST_DIFFICULTY).unwrap();
    let (node_b, _addr_b, shutdown_b) = start_node(fresh).await;
    node_b
        .connect(&addr_a.to_string(), shutdown_b.subscribe())
        .await
        .unwrap();

    let synced = wait_until(|| {
        node_b.get_blockchain().get_tip_hash().unwrap() == source.get_tip_hash().unwrap()
    })
    .await;
    assert!(synced, "node B never caught up with node A");
    assert_eq!(node_b.get_blockchain().get_best_height().unwrap(), 2);

    let tx = Transaction::new_utxo_transaction(
        &miner,
        &Wallet::new().unwrap().get_address(),
        20,
        &UTXOSet::new(source.clone()),
    )
    .unwrap();
    let txid = tx.get_id_hex();
    node_a.submit_transaction(tx).unwrap();

    let relayed = wait_until(|| node_b.get_mempool().has(&txid)).await;
    assert!(relayed, "transaction never reached node B");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_block_payload_frees_the_peer_slot() {
    let (blockchain, _miner, _dir) = new_chain();
    let config = NodeConfig {
        difficulty: TEST_DIFFICULTY,
        max_peers: 1,
        ..NodeConfig::default()
    };
    let (server, addr, _shutdown) = start_node_with(config, blockchain).await;

    // zero timestamp, then a transaction count of u64::MAX
    let mut payload = vec![0u8, 253];
    payload.extend(u64::MAX.to_le_bytes());

    let mut bad = ScriptedPeer::handshake(addr).await;
    assert_eq!(server.get_peers().len(), 1);
    bad.send(Message::Block { block: payload }).await;
    assert!(wait_for_close(&mut bad.stream).await);

    let freed = wait_until(|| server.get_peers().is_empty()).await;
    assert!(freed, "registry kept the closed peer");
    assert_eq!(server.get_blockchain().get_best_height().unwrap(), 1);

    // the single slot is usable again
    let mut good = ScriptedPeer::handshake(addr).await;
    good.drain_until_pong(7).await;
    assert_eq!(server.get_peers().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_tx_reaches_node_mempool() {
    let (blockchain, miner, _dir) = new_chain();
    let (server, addr, _shutdown) = start_node(blockchain.clone()).await;

    let tx = Transaction::new_utxo_transaction(
        &miner,
        &Wallet::new().unwrap().get_address(),
        15,
        &UTXOSet::new(blockchain),
    )
    .unwrap();
    let txid = tx.get_id_hex();

    send_tx(&addr.to_string(), &tx, &NodeConfig::default())
        .await
        .unwrap();

    let pooled = wait_until(|| server.get_mempool().has(&txid)).await;
    assert!(pooled, "submitted transaction never reached the mempool");
    assert_eq!(server.get_mempool().get(&txid), Some(tx));
}
