// =============================================================================
// ZAPLINE v0.4 - Main Entry Point
// =============================================================================
//
// Off-chain payment channels over a shared 2-of-2 funding output.
// One subcommand per channel operation; `run` serves inbound updates.
//
// =============================================================================

#![allow(special_module_name)]
#![allow(dead_code)]

mod channels;
mod elkrem;
mod lib;
mod network;
mod signer;
mod storage;
mod wallet;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::Mutex;

use crate::channels::fund::{mirror_pair, FundingParams};
use crate::channels::state::{ChannelError, OutPoint};
use crate::channels::UpdateEngine;
use crate::lib::{DEFAULT_CSV_DELAY, MAX_PUSH};
use crate::signer::WalletSigner;
use crate::storage::{ChannelStore, SledStore};
use crate::wallet::Wallet;

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Parser)]
#[command(name = "zapline")]
#[command(version = "0.4.0")]
#[command(about = "Zapline - bidirectional off-chain payment channels", long_about = None)]
struct Cli {
    /// Database directory
    #[arg(long, default_value = "zapline_data")]
    db: String,

    /// Seed phrase file
    #[arg(long, default_value = "zapline.seed")]
    seed: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node and serve inbound channel updates
    Run {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:29735")]
        listen: String,
    },

    /// Push satoshis to the counterparty over a channel
    Push {
        peer_idx: u32,
        chan_idx: u32,
        /// Amount in satoshis
        amount: u32,
        /// Repeat the push this many times
        #[arg(default_value = "1")]
        times: u32,
        /// Peer address (e.g. 127.0.0.1:29735)
        #[arg(long)]
        addr: String,
    },

    /// Resume an interrupted update exchange
    Resume {
        peer_idx: u32,
        chan_idx: u32,
        #[arg(long)]
        addr: String,
    },

    /// Unilaterally close a channel; prints the transaction to broadcast
    Break { peer_idx: u32, chan_idx: u32 },

    /// List channels
    List,

    /// Show the node identity pubkey
    Address,

    /// Regtest only: materialize a funded channel record. Both parties run
    /// this with the same parameters and each other's seed phrase in place
    /// of a real funding handshake.
    DevFund {
        chan_idx: u32,
        /// Total satoshis in the funding output
        capacity: i64,
        /// Our share at state 0
        my_amt: i64,
        /// Counterparty seed phrase
        #[arg(long)]
        their_seed: String,
        /// Index the counterparty assigned to us
        #[arg(long, default_value = "1")]
        their_peer_idx: u32,
        /// Funding txid, hex
        #[arg(long)]
        txid: String,
        #[arg(long, default_value = "0")]
        vout: u32,
    },
}

// =============================================================================
// Entry Point
// =============================================================================

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ChannelError> {
    let wallet = Wallet::load_or_create(&cli.seed)?;
    let store = SledStore::open(&cli.db)?;
    let id_pub = wallet.id_pub();
    let engine = Arc::new(Mutex::new(UpdateEngine::new(
        store,
        WalletSigner::new(wallet.clone()),
    )));

    match cli.command {
        Commands::Run { listen } => network::serve(listen, engine, id_pub).await,

        Commands::Push { peer_idx, chan_idx, amount, times, addr } => {
            if amount < 1 || amount > MAX_PUSH {
                return Err(ChannelError::BadAmount(amount as i64));
            }
            let (mut stream, peer) = network::dial(&addr, &engine, id_pub).await?;
            check_connected_peer(&engine, &peer, peer_idx).await?;

            for i in 0..times {
                let rts = {
                    let mut eng = engine.lock().await;
                    eng.push_channel(&peer, chan_idx, amount)?
                };
                network::drive_exchange(&mut stream, &engine, &peer, rts).await?;

                let eng = engine.lock().await;
                let chan = eng.store().get_channel_by_idx(peer_idx, chan_idx)?;
                println!(
                    "push {}/{} complete: {} sat at state {}",
                    i + 1,
                    times,
                    chan.state.my_amt,
                    chan.state.state_idx
                );
            }
            Ok(())
        }

        Commands::Resume { peer_idx, chan_idx, addr } => {
            let (mut stream, peer) = network::dial(&addr, &engine, id_pub).await?;
            check_connected_peer(&engine, &peer, peer_idx).await?;

            let next = {
                let mut eng = engine.lock().await;
                eng.send_next_msg(peer_idx, chan_idx)?
            };
            match next {
                None => println!("channel ({},{}) has nothing to resume", peer_idx, chan_idx),
                Some(msg) => {
                    println!("resuming with {}", msg.name());
                    network::drive_exchange(&mut stream, &engine, &peer, msg).await?;
                    let eng = engine.lock().await;
                    let chan = eng.store().get_channel_by_idx(peer_idx, chan_idx)?;
                    println!(
                        "channel settled: {} sat at state {}",
                        chan.state.my_amt, chan.state.state_idx
                    );
                }
            }
            Ok(())
        }

        Commands::Break { peer_idx, chan_idx } => {
            let tx = {
                let mut eng = engine.lock().await;
                eng.break_channel(peer_idx, chan_idx)?
            };
            println!(
                "breaking ({},{}) at state {}; wait out the CSV delay of {} blocks",
                peer_idx, chan_idx, tx.tx.state_idx, DEFAULT_CSV_DELAY
            );
            println!("broadcast: {}", tx.to_hex());
            Ok(())
        }

        Commands::List => {
            let eng = engine.lock().await;
            let chans = eng.store().list_channels()?;
            if chans.is_empty() {
                println!("no channels");
            }
            for chan in chans {
                print!("{}", chan.info());
            }
            Ok(())
        }

        Commands::Address => {
            println!("{}", id_pub.to_hex());
            Ok(())
        }

        Commands::DevFund {
            chan_idx,
            capacity,
            my_amt,
            their_seed,
            their_peer_idx,
            txid,
            vout,
        } => {
            dev_fund(
                &engine,
                &wallet,
                chan_idx,
                capacity,
                my_amt,
                &their_seed,
                their_peer_idx,
                &txid,
                vout,
            )
            .await
        }
    }
}

/// Refuse to act on a channel owned by a different peer than the one at the
/// other end of the socket.
async fn check_connected_peer(
    engine: &network::SharedEngine,
    peer: &channels::PubKey,
    want_idx: u32,
) -> Result<(), ChannelError> {
    let eng = engine.lock().await;
    let connected_idx = eng.store().get_peer_idx(peer)?;
    if connected_idx != want_idx {
        return Err(ChannelError::StateConflict(format!(
            "want peer {} but connected to peer {}",
            want_idx, connected_idx
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn dev_fund(
    engine: &network::SharedEngine,
    wallet: &Wallet,
    chan_idx: u32,
    capacity: i64,
    my_amt: i64,
    their_seed: &str,
    their_peer_idx: u32,
    txid_hex: &str,
    vout: u32,
) -> Result<(), ChannelError> {
    let their_wallet = Wallet::from_phrase(their_seed)?;

    let txid_bytes = hex::decode(txid_hex)
        .map_err(|e| ChannelError::Storage(format!("bad txid hex: {}", e)))?;
    if txid_bytes.len() != 32 {
        return Err(ChannelError::Storage("txid must be 32 bytes".to_string()));
    }
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&txid_bytes);

    let eng = engine.lock().await;
    let my_peer_idx = eng.store().register_peer(&their_wallet.id_pub())?;

    let (mine, _theirs) = mirror_pair(
        wallet,
        &their_wallet,
        my_peer_idx,
        their_peer_idx,
        chan_idx,
        &FundingParams {
            outpoint: OutPoint { txid, vout },
            capacity,
            amt_a: my_amt,
            csv_delay: DEFAULT_CSV_DELAY,
        },
    )?;
    eng.store().create_channel(&mine)?;

    println!(
        "funded channel ({},{}) {}: capacity {} sat, ours {} sat",
        my_peer_idx, chan_idx, mine.outpoint, capacity, my_amt
    );
    Ok(())
}
