// =============================================================================
// ZAPLINE v0.4 - P2P Transport
// =============================================================================
//
// Length-framed messages over TCP: 4-byte magic, u32 payload length, then
// the payload (1-byte message ID plus body). A version handshake exchanges
// identity pubkeys before any channel traffic; the peer identity is then
// threaded into every engine call rather than held in any global.
//
// The engine itself is synchronous; one async mutex around it serializes
// handlers, which is exactly the per-channel exclusion the update protocol
// needs.
//
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::channels::messages::{ChannelMessage, MSGID_VERSION};
use crate::channels::state::{ChannelError, EngineState, OutPoint, PubKey};
use crate::channels::UpdateEngine;
use crate::lib::{MAX_FRAME_SIZE, NETWORK_MAGIC, PROTOCOL_VERSION};
use crate::signer::WalletSigner;
use crate::storage::{ChannelStore, SledStore};

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

pub type Engine = UpdateEngine<SledStore, WalletSigner>;
pub type SharedEngine = Arc<Mutex<Engine>>;

// =============================================================================
// Framing
// =============================================================================

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<(), ChannelError> {
    let mut data = NETWORK_MAGIC.to_vec();
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(payload);
    stream
        .write_all(&data)
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, ChannelError> {
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))?;

    if header[..4] != NETWORK_MAGIC {
        return Err(ChannelError::Transport("bad network magic".to_string()));
    }
    let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(ChannelError::Transport(format!("bad frame length {}", len)));
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))?;
    Ok(payload)
}

// =============================================================================
// Handshake
// =============================================================================

fn version_payload(id_pub: &PubKey) -> Vec<u8> {
    let mut payload = vec![MSGID_VERSION];
    payload.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    payload.extend_from_slice(&id_pub.0);
    payload
}

fn parse_version(payload: &[u8]) -> Result<PubKey, ChannelError> {
    if payload.len() != 38 || payload[0] != MSGID_VERSION {
        return Err(ChannelError::Transport("bad version message".to_string()));
    }
    let version = u32::from_be_bytes(payload[1..5].try_into().unwrap());
    if version != PROTOCOL_VERSION {
        return Err(ChannelError::Transport(format!(
            "protocol version {} unsupported",
            version
        )));
    }
    let peer = PubKey::from_slice(&payload[5..38]).unwrap();
    if !peer.is_valid_point() {
        return Err(ChannelError::BadPubkey);
    }
    Ok(peer)
}

async fn handshake(
    stream: &mut TcpStream,
    id_pub: &PubKey,
    outbound: bool,
) -> Result<PubKey, ChannelError> {
    if outbound {
        write_frame(stream, &version_payload(id_pub)).await?;
        let payload = timeout(REPLY_TIMEOUT, read_frame(stream))
            .await
            .map_err(|_| ChannelError::Transport("handshake timeout".to_string()))??;
        parse_version(&payload)
    } else {
        let payload = timeout(REPLY_TIMEOUT, read_frame(stream))
            .await
            .map_err(|_| ChannelError::Transport("handshake timeout".to_string()))??;
        let peer = parse_version(&payload)?;
        write_frame(stream, &version_payload(id_pub)).await?;
        Ok(peer)
    }
}

// =============================================================================
// Fatal Error Handling
// =============================================================================

/// A fatal elkrem failure means the channel is over; close it on chain with
/// the best state we hold and surface the transaction for broadcast.
async fn break_after_fatal(engine: &SharedEngine, peer: &PubKey, outpoint: &OutPoint) {
    let mut eng = engine.lock().await;
    let chan = match eng.store().get_channel(peer, outpoint) {
        Ok(c) => c,
        Err(e) => {
            log::error!("channel {} broken but unloadable: {}", outpoint, e);
            return;
        }
    };
    match eng.break_channel(chan.peer_idx, chan.chan_idx) {
        Ok(tx) => {
            log::error!(
                "channel {} broken; broadcast close tx: {}",
                outpoint,
                tx.to_hex()
            );
        }
        Err(e) => log::error!("channel {} broken and break failed: {}", outpoint, e),
    }
}

// =============================================================================
// Server
// =============================================================================

pub async fn serve(
    listen: String,
    engine: SharedEngine,
    id_pub: PubKey,
) -> Result<(), ChannelError> {
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))?;
    log::info!("listening on {}", listen);

    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, engine, id_pub).await {
                log::warn!("connection {}: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    engine: SharedEngine,
    id_pub: PubKey,
) -> Result<(), ChannelError> {
    let peer = handshake(&mut stream, &id_pub, false).await?;
    engine.lock().await.store().register_peer(&peer)?;
    log::info!("peer {} connected", peer);

    loop {
        let payload = match read_frame(&mut stream).await {
            Ok(p) => p,
            Err(_) => break, // disconnect; peer resumes on reconnect
        };
        let msg = match ChannelMessage::decode(&payload) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("bad message from {}: {}", peer, e);
                continue;
            }
        };
        log::debug!("got {} from {}", msg.name(), peer);

        let result = {
            let mut eng = engine.lock().await;
            eng.handle_message(&peer, &msg)
        };
        match result {
            Ok(Some(reply)) => write_frame(&mut stream, &reply.encode()).await?,
            Ok(None) => {}
            Err(e) if e.is_fatal() => {
                break_after_fatal(&engine, &peer, msg.outpoint()).await;
            }
            Err(e) => log::warn!("{} from {} rejected: {}", msg.name(), peer, e),
        }
    }

    log::info!("peer {} disconnected", peer);
    Ok(())
}

// =============================================================================
// Client
// =============================================================================

/// Connect and handshake; returns the stream and the peer's identity.
pub async fn dial(
    addr: &str,
    engine: &SharedEngine,
    id_pub: PubKey,
) -> Result<(TcpStream, PubKey), ChannelError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ChannelError::Transport(e.to_string()))?;
    let peer = handshake(&mut stream, &id_pub, true).await?;
    engine.lock().await.store().register_peer(&peer)?;
    log::info!("connected to {} ({})", addr, peer);
    Ok((stream, peer))
}

/// Transmit one message and pump the exchange until the channel settles
/// back to Clean. The state check runs before each read, so a resume that
/// needs no reply returns immediately.
pub async fn drive_exchange(
    stream: &mut TcpStream,
    engine: &SharedEngine,
    peer: &PubKey,
    first: ChannelMessage,
) -> Result<(), ChannelError> {
    let outpoint = *first.outpoint();
    write_frame(stream, &first.encode()).await?;

    loop {
        {
            let eng = engine.lock().await;
            let chan = eng.store().get_channel(peer, &outpoint)?;
            if chan.state.engine_state()? == EngineState::Clean {
                return Ok(());
            }
        }

        let payload = timeout(REPLY_TIMEOUT, read_frame(stream))
            .await
            .map_err(|_| ChannelError::Transport("reply timeout".to_string()))??;
        let msg = ChannelMessage::decode(&payload)?;
        log::debug!("got {} from {}", msg.name(), peer);

        let result = {
            let mut eng = engine.lock().await;
            eng.handle_message(peer, &msg)
        };
        match result {
            Ok(Some(reply)) => write_frame(stream, &reply.encode()).await?,
            Ok(None) => {}
            Err(e) if e.is_fatal() => {
                break_after_fatal(engine, peer, msg.outpoint()).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_payload_roundtrip() {
        let wallet = crate::wallet::Wallet::new().unwrap();
        let id = wallet.id_pub();
        let payload = version_payload(&id);
        assert_eq!(payload.len(), 38);
        assert_eq!(parse_version(&payload).unwrap(), id);
    }

    #[test]
    fn test_version_rejects_garbage() {
        assert!(parse_version(&[0u8; 38]).is_err());
        assert!(parse_version(&[MSGID_VERSION; 10]).is_err());

        // Right shape, wrong protocol version.
        let wallet = crate::wallet::Wallet::new().unwrap();
        let mut payload = version_payload(&wallet.id_pub());
        payload[4] = payload[4].wrapping_add(1);
        assert!(parse_version(&payload).is_err());

        // Right version, invalid point.
        let mut bad_key = version_payload(&wallet.id_pub());
        for b in bad_key[5..].iter_mut() {
            *b = 0xFF;
        }
        assert!(parse_version(&bad_key).is_err());
    }
}
