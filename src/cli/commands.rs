use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "utxo-chain", version, about = "Proof-of-work UTXO ledger node")]
pub struct Opt {
    /// TOML configuration file; NODE_ADDRESS, MINING_ADDRESS and NODE_DATA_DIR override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "createwallet", about = "Generate a key pair and print its address")]
    Createwallet,
    #[command(name = "createblockchain", about = "Create a new blockchain")]
    Createblockchain {
        #[arg(long, help = "The address to send genesis block reward to")]
        address: String,
    },
    #[command(name = "getbalance", about = "Get the wallet balance of the target address")]
    GetBalance {
        #[arg(long, help = "The wallet address")]
        address: String,
    },
    #[command(name = "send", about = "Pay from a key to an address")]
    Send {
        #[arg(long, help = "Hex PKCS#8 private key of the sender, as printed by createwallet")]
        from_key: String,
        #[arg(long, help = "Destination wallet address")]
        to: String,
        #[arg(long, help = "Amount to send")]
        amount: u64,
        #[arg(long, help = "Mine the transaction into a local block right away")]
        mine: bool,
        #[arg(
            long,
            default_value = "127.0.0.1:2001",
            help = "Node that receives the transaction when not mining locally"
        )]
        node: String,
    },
    #[command(name = "printchain", about = "Print blockchain all block")]
    Printchain,
    #[command(name = "reindexutxo", about = "Rebuild UTXO index set")]
    Reindexutxo,
    #[command(name = "startnode", about = "Start a node")]
    StartNode {
        #[arg(long, help = "Enable mining mode and send reward to ADDRESS")]
        miner: Option<String>,
        #[arg(long, help = "Peer to dial at start-up, in addition to configured seeds")]
        connect: Vec<String>,
    },
}
