// =============================================================================
// ZAPLINE v0.4 - Storage Engine (Sled Database)
// =============================================================================
//
// Single source of truth for channel records. A channel (elkrem trees
// included) serializes to one key, so every state save is atomic. The
// engine works against the trait; tests run on a temporary database.
//
// Trees:
//   channels    peer_pub ‖ outpoint  -> Channel (bincode)
//   chan_index  (peer_idx, chan_idx) -> primary key
//   peers       peer_pub             -> peer_idx
//   meta        counters
//
// =============================================================================

use sled::{Db, Tree};
use std::path::Path;

use crate::channels::state::{Channel, ChannelError, OutPoint, PubKey};

// =============================================================================
// Store Interface
// =============================================================================

pub trait ChannelStore {
    /// Look up by counterparty identity and funding outpoint.
    fn get_channel(&self, peer: &PubKey, outpoint: &OutPoint) -> Result<Channel, ChannelError>;

    /// Look up by (peer index, channel index).
    fn get_channel_by_idx(&self, peer_idx: u32, chan_idx: u32) -> Result<Channel, ChannelError>;

    /// Atomically persist the mutable channel state. Rejects state-index
    /// regressions; those are programming errors, not peer input.
    fn save_channel_state(&self, chan: &Channel) -> Result<(), ChannelError>;

    /// Refresh a channel snapshot from the store.
    fn reload_channel(&self, chan: &mut Channel) -> Result<(), ChannelError>;

    fn get_peer_idx(&self, peer: &PubKey) -> Result<u32, ChannelError>;

    /// Index a peer, allocating the next index on first contact.
    fn register_peer(&self, peer: &PubKey) -> Result<u32, ChannelError>;

    /// Insert a newly funded channel.
    fn create_channel(&self, chan: &Channel) -> Result<(), ChannelError>;

    fn list_channels(&self) -> Result<Vec<Channel>, ChannelError>;
}

// =============================================================================
// Sled Store
// =============================================================================

pub struct SledStore {
    db: Db,
    channels: Tree,
    chan_index: Tree,
    peers: Tree,
    meta: Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChannelError> {
        let db = sled::open(path).map_err(|e| ChannelError::Storage(e.to_string()))?;
        Self::with_db(db)
    }

    /// In-memory database for tests.
    pub fn open_temporary() -> Result<Self, ChannelError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, ChannelError> {
        let channels = db
            .open_tree("channels")
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        let chan_index = db
            .open_tree("chan_index")
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        let peers = db
            .open_tree("peers")
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        let meta = db
            .open_tree("meta")
            .map_err(|e| ChannelError::Storage(e.to_string()))?;

        Ok(SledStore {
            db,
            channels,
            chan_index,
            peers,
            meta,
        })
    }

    fn primary_key(peer: &PubKey, outpoint: &OutPoint) -> Vec<u8> {
        let mut key = Vec::with_capacity(33 + 36);
        key.extend_from_slice(&peer.0);
        key.extend_from_slice(&outpoint.to_bytes());
        key
    }

    fn index_key(peer_idx: u32, chan_idx: u32) -> [u8; 8] {
        let mut key = [0u8; 8];
        key[..4].copy_from_slice(&peer_idx.to_be_bytes());
        key[4..].copy_from_slice(&chan_idx.to_be_bytes());
        key
    }

    fn decode_channel(bytes: &[u8]) -> Result<Channel, ChannelError> {
        bincode::deserialize(bytes)
            .map_err(|e| ChannelError::Storage(format!("decode channel: {}", e)))
    }

    fn flush(&self) -> Result<(), ChannelError> {
        self.db
            .flush()
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl ChannelStore for SledStore {
    fn get_channel(&self, peer: &PubKey, outpoint: &OutPoint) -> Result<Channel, ChannelError> {
        let key = Self::primary_key(peer, outpoint);
        let bytes = self
            .channels
            .get(&key)
            .map_err(|e| ChannelError::Storage(e.to_string()))?
            .ok_or(ChannelError::NotFound)?;
        Self::decode_channel(&bytes)
    }

    fn get_channel_by_idx(&self, peer_idx: u32, chan_idx: u32) -> Result<Channel, ChannelError> {
        let primary = self
            .chan_index
            .get(Self::index_key(peer_idx, chan_idx))
            .map_err(|e| ChannelError::Storage(e.to_string()))?
            .ok_or(ChannelError::NotFound)?;
        let bytes = self
            .channels
            .get(&primary)
            .map_err(|e| ChannelError::Storage(e.to_string()))?
            .ok_or(ChannelError::NotFound)?;
        Self::decode_channel(&bytes)
    }

    fn save_channel_state(&self, chan: &Channel) -> Result<(), ChannelError> {
        chan.check_invariants()?;

        let key = Self::primary_key(&chan.peer_id, &chan.outpoint);
        if let Some(existing) = self
            .channels
            .get(&key)
            .map_err(|e| ChannelError::Storage(e.to_string()))?
        {
            let old = Self::decode_channel(&existing)?;
            if old.state.state_idx > chan.state.state_idx {
                return Err(ChannelError::StateConflict(format!(
                    "state index would regress from {} to {}",
                    old.state.state_idx, chan.state.state_idx
                )));
            }
        } else {
            return Err(ChannelError::NotFound);
        }

        let bytes =
            bincode::serialize(chan).map_err(|e| ChannelError::Storage(e.to_string()))?;
        self.channels
            .insert(key, bytes)
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        self.flush()
    }

    fn reload_channel(&self, chan: &mut Channel) -> Result<(), ChannelError> {
        let peer = chan.peer_id;
        let outpoint = chan.outpoint;
        *chan = self.get_channel(&peer, &outpoint)?;
        Ok(())
    }

    fn get_peer_idx(&self, peer: &PubKey) -> Result<u32, ChannelError> {
        let bytes = self
            .peers
            .get(peer.0)
            .map_err(|e| ChannelError::Storage(e.to_string()))?
            .ok_or(ChannelError::NotFound)?;
        let arr: [u8; 4] = bytes
            .as_ref()
            .try_into()
            .map_err(|_| ChannelError::Storage("bad peer index".to_string()))?;
        Ok(u32::from_be_bytes(arr))
    }

    fn register_peer(&self, peer: &PubKey) -> Result<u32, ChannelError> {
        if let Ok(idx) = self.get_peer_idx(peer) {
            return Ok(idx);
        }

        let next = match self
            .meta
            .get("next_peer_idx")
            .map_err(|e| ChannelError::Storage(e.to_string()))?
        {
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| ChannelError::Storage("bad peer counter".to_string()))?;
                u32::from_be_bytes(arr)
            }
            None => 1,
        };

        self.peers
            .insert(peer.0, &next.to_be_bytes())
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        self.meta
            .insert("next_peer_idx", &(next + 1).to_be_bytes())
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        self.flush()?;
        Ok(next)
    }

    fn create_channel(&self, chan: &Channel) -> Result<(), ChannelError> {
        chan.check_invariants()?;

        let key = Self::primary_key(&chan.peer_id, &chan.outpoint);
        if self
            .channels
            .contains_key(&key)
            .map_err(|e| ChannelError::Storage(e.to_string()))?
        {
            return Err(ChannelError::Storage("channel already exists".to_string()));
        }

        let bytes =
            bincode::serialize(chan).map_err(|e| ChannelError::Storage(e.to_string()))?;
        self.channels
            .insert(key.clone(), bytes)
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        self.chan_index
            .insert(Self::index_key(chan.peer_idx, chan.chan_idx), key)
            .map_err(|e| ChannelError::Storage(e.to_string()))?;
        self.flush()
    }

    fn list_channels(&self) -> Result<Vec<Channel>, ChannelError> {
        let mut out = Vec::new();
        for item in self.channels.iter() {
            let (_, bytes) = item.map_err(|e| ChannelError::Storage(e.to_string()))?;
            out.push(Self::decode_channel(&bytes)?);
        }
        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::state::ChannelState;
    use crate::elkrem::{ElkremReceiver, ElkremSender};

    fn test_channel(peer: PubKey, peer_idx: u32, chan_idx: u32) -> Channel {
        Channel {
            peer_id: peer,
            peer_idx,
            chan_idx,
            outpoint: OutPoint { txid: [chan_idx as u8; 32], vout: 0 },
            capacity: 1_000_000,
            closed: false,
            broken: false,
            csv_delay: 144,
            my_fund_pub: PubKey([0x02; 33]),
            their_fund_pub: PubKey([0x03; 33]),
            my_refund_pub: PubKey([0x02; 33]),
            their_refund_pub: PubKey([0x03; 33]),
            their_hakd_base: PubKey([0x03; 33]),
            state: ChannelState {
                state_idx: 0,
                my_amt: 500_000,
                delta: 0,
                my_hakd_pub: PubKey([0x02; 33]),
                my_prev_hakd_pub: PubKey::ZERO,
                their_sig: Vec::new(),
                their_sig_idx: 0,
            },
            elk_send: ElkremSender::new([0x11; 32]),
            elk_recv: ElkremReceiver::new(),
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let store = SledStore::open_temporary().unwrap();
        let peer = PubKey([0x03; 33]);
        let chan = test_channel(peer, 1, 1);

        store.create_channel(&chan).unwrap();

        let by_key = store.get_channel(&peer, &chan.outpoint).unwrap();
        assert_eq!(by_key.capacity, 1_000_000);

        let by_idx = store.get_channel_by_idx(1, 1).unwrap();
        assert_eq!(by_idx.outpoint, chan.outpoint);

        assert!(matches!(
            store.get_channel_by_idx(1, 2),
            Err(ChannelError::NotFound)
        ));
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let store = SledStore::open_temporary().unwrap();
        let chan = test_channel(PubKey([0x03; 33]), 1, 1);
        store.create_channel(&chan).unwrap();
        assert!(store.create_channel(&chan).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let store = SledStore::open_temporary().unwrap();
        let peer = PubKey([0x03; 33]);
        let mut chan = test_channel(peer, 1, 1);
        store.create_channel(&chan).unwrap();

        let mut stale = chan.clone();

        chan.state.state_idx = 1;
        chan.state.my_amt = 450_000;
        store.save_channel_state(&chan).unwrap();

        store.reload_channel(&mut stale).unwrap();
        assert_eq!(stale.state.state_idx, 1);
        assert_eq!(stale.state.my_amt, 450_000);
    }

    #[test]
    fn test_state_index_regression_rejected() {
        let store = SledStore::open_temporary().unwrap();
        let mut chan = test_channel(PubKey([0x03; 33]), 1, 1);
        store.create_channel(&chan).unwrap();

        chan.state.state_idx = 5;
        store.save_channel_state(&chan).unwrap();

        chan.state.state_idx = 4;
        assert!(matches!(
            store.save_channel_state(&chan),
            Err(ChannelError::StateConflict(_))
        ));
    }

    #[test]
    fn test_save_unknown_channel_rejected() {
        let store = SledStore::open_temporary().unwrap();
        let chan = test_channel(PubKey([0x03; 33]), 1, 1);
        assert!(matches!(
            store.save_channel_state(&chan),
            Err(ChannelError::NotFound)
        ));
    }

    #[test]
    fn test_invariant_violation_rejected_on_save() {
        let store = SledStore::open_temporary().unwrap();
        let mut chan = test_channel(PubKey([0x03; 33]), 1, 1);
        store.create_channel(&chan).unwrap();

        chan.state.my_amt = 2_000_000; // above capacity
        assert!(store.save_channel_state(&chan).is_err());
    }

    #[test]
    fn test_register_peer_indices() {
        let store = SledStore::open_temporary().unwrap();
        let a = PubKey([0x03; 33]);
        let b = PubKey([0x04; 33]);

        assert_eq!(store.register_peer(&a).unwrap(), 1);
        assert_eq!(store.register_peer(&b).unwrap(), 2);
        // idempotent
        assert_eq!(store.register_peer(&a).unwrap(), 1);
        assert_eq!(store.get_peer_idx(&a).unwrap(), 1);
        assert!(store.get_peer_idx(&PubKey([0x05; 33])).is_err());
    }

    #[test]
    fn test_list_channels() {
        let store = SledStore::open_temporary().unwrap();
        store.create_channel(&test_channel(PubKey([0x03; 33]), 1, 1)).unwrap();
        store.create_channel(&test_channel(PubKey([0x03; 33]), 1, 2)).unwrap();
        assert_eq!(store.list_channels().unwrap().len(), 2);
    }
}
