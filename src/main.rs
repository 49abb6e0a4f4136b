use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info};
use std::process;
use tokio::sync::watch;
use utxo_chain::{
    address_to_pub_key_hash, convert_address, hash_pub_key, send_tx, validate_address,
    Blockchain, Command, NodeConfig, Opt, Server, Transaction, UTXOSet, Wallet,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::parse();
    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NodeConfig::load(opt.config.as_deref())?;

    match opt.command {
        Command::Createwallet => {
            let wallet = Wallet::new()?;
            println!("Your new address: {}", wallet.get_address());
            println!("Private key (PKCS#8, keep it safe): {}", HEXLOWER.encode(wallet.get_pkcs8()));
        }
        Command::Createblockchain { address } => {
            if !validate_address(&address) {
                return Err(format!("Invalid address: {address}").into());
            }
            Blockchain::create_blockchain(&config.data_dir, &address, config.difficulty)?;
            println!("Done!");
        }
        Command::GetBalance { address } => {
            let pub_key_hash = address_to_pub_key_hash(&address)?;
            let blockchain = Blockchain::open(&config.data_dir, config.difficulty)?;
            let balance = UTXOSet::new(blockchain).get_balance(&pub_key_hash)?;
            println!("Balance of {address}: {balance}");
        }
        Command::Send {
            from_key,
            to,
            amount,
            mine,
            node,
        } => {
            if !validate_address(&to) {
                return Err(format!("Invalid recipient address: {to}").into());
            }
            let pkcs8 = HEXLOWER
                .decode(from_key.as_bytes())
                .map_err(|e| format!("Invalid private key: {e}"))?;
            let wallet = Wallet::from_pkcs8(&pkcs8)?;

            let blockchain = Blockchain::open(&config.data_dir, config.difficulty)?;
            let utxo_set = UTXOSet::new(blockchain.clone());
            let transaction = Transaction::new_utxo_transaction(&wallet, &to, amount, &utxo_set)?;

            if mine {
                let coinbase = Transaction::new_coinbase_tx(&wallet.get_address(), "")?;
                let block = blockchain.mine_block(&[coinbase, transaction])?;
                info!("Mined block {}", block.get_hash_hex());
            } else {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(send_tx(&node, &transaction, &config))?;
            }
            println!("Success!")
        }
        Command::Printchain => {
            let blockchain = Blockchain::open(&config.data_dir, config.difficulty)?;
            for block in blockchain.iterator()? {
                println!("Pre block hash: {}", HEXLOWER.encode(block.get_pre_block_hash()));
                println!("Cur block hash: {}", block.get_hash_hex());
                println!("Cur block Timestamp: {}", block.get_timestamp());
                for tx in block.get_transactions() {
                    println!("- Transaction txid_hex: {}", tx.get_id_hex());
                    if !tx.is_coinbase() {
                        for input in tx.get_vin() {
                            let address = convert_address(&hash_pub_key(input.get_pub_key()));
                            println!(
                                "-- Input txid = {}, vout = {}, from = {address}",
                                HEXLOWER.encode(input.get_txid()),
                                input.get_vout(),
                            )
                        }
                    }
                    for output in tx.get_vout() {
                        let address = convert_address(output.get_pub_key_hash());
                        println!("-- Output value = {}, to = {address}", output.get_value())
                    }
                }
                println!()
            }
        }
        Command::Reindexutxo => {
            let blockchain = Blockchain::open(&config.data_dir, config.difficulty)?;
            let utxo_set = UTXOSet::new(blockchain);
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
        Command::StartNode { miner, connect } => {
            if miner.is_some() {
                config.mining_address = miner;
            }
            config.seeds.extend(connect);
            config.validate()?;

            let blockchain = Blockchain::open(&config.data_dir, config.difficulty)?;
            if blockchain.is_empty()? {
                info!("Ledger is empty, waiting for blocks from peers");
            }
            if !config.is_miner() {
                info!("No mining address configured, relaying only");
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received Ctrl-C, shutting down");
                        let _ = shutdown_tx.send(true);
                    }
                });
                let server = Server::new(config, blockchain);
                let served = server.run(shutdown_rx).await;
                info!(
                    "Node on {} stopped with {} peers still connected",
                    server.get_config().listen_addr,
                    server.get_peers().len()
                );
                served
            })?;
        }
    }
    Ok(())
}
