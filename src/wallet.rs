// =============================================================================
// ZAPLINE v0.4 - Wallet & Key Derivation
// =============================================================================
//
// All channel key material is derived from a single BIP39 seed phrase.
// Derivation has three levels: use case, peer index, and channel index.
//
//   use 0  - regular wallet keys
//   use 2  - channel funding keys (2-of-2 multisig)
//   use 3  - channel refund keys (commitment outputs)
//   use 4  - HAKD base points (revocation)
//   use 8  - elkrem tree roots
//   use 11 - node identity key
//
// =============================================================================

use std::fs;
use std::path::Path;

use bip39::{Language, Mnemonic, MnemonicType, Seed};
use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256, Sha512};

use crate::channels::state::{ChannelError, PubKey};

// =============================================================================
// Derivation Paths
// =============================================================================

pub const USE_WALLET: u32 = 0;
pub const USE_CHANNEL_FUND: u32 = 2;
pub const USE_CHANNEL_REFUND: u32 = 3;
pub const USE_HAKD_BASE: u32 = 4;
pub const USE_ELKREM: u32 = 8;
pub const USE_IDENTITY: u32 = 11;

// =============================================================================
// Wallet
// =============================================================================

/// Deterministic key source for the node. Holds the BIP32-style master key
/// derived from a BIP39 mnemonic.
#[derive(Clone)]
pub struct Wallet {
    phrase: String,
    master_key: [u8; 32],
    chain_code: [u8; 32],
}

impl Wallet {
    /// Create a fresh wallet with a random 24-word mnemonic.
    pub fn new() -> Result<Self, ChannelError> {
        let mnemonic = Mnemonic::new(MnemonicType::Words24, Language::English);
        Self::from_phrase(mnemonic.phrase())
    }

    /// Restore a wallet from a mnemonic phrase.
    pub fn from_phrase(phrase: &str) -> Result<Self, ChannelError> {
        let mnemonic = Mnemonic::from_phrase(phrase, Language::English)
            .map_err(|e| ChannelError::Storage(format!("invalid mnemonic: {}", e)))?;

        let seed = Seed::new(&mnemonic, "");
        let (master_key, chain_code) = derive_master_key(seed.as_bytes())?;

        Ok(Wallet {
            phrase: phrase.to_string(),
            master_key,
            chain_code,
        })
    }

    /// Load the wallet from a seed file, creating one on first run.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        if path.exists() {
            let phrase = fs::read_to_string(path)
                .map_err(|e| ChannelError::Storage(format!("read seed file: {}", e)))?;
            return Self::from_phrase(phrase.trim());
        }

        let wallet = Self::new()?;
        fs::write(path, format!("{}\n", wallet.phrase))
            .map_err(|e| ChannelError::Storage(format!("write seed file: {}", e)))?;
        log::info!("created new wallet seed at {}", path.display());
        Ok(wallet)
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    /// Derive the private key for (use, peer, channel).
    /// Simplified derivation: a tagged SHA256 chain over the master key,
    /// rehashed until the result is a valid scalar.
    pub fn derive_privkey(&self, use_case: u32, peer_idx: u32, chan_idx: u32) -> SecretKey {
        let mut data = Vec::with_capacity(32 + 32 + 12 + 14);
        data.extend_from_slice(&self.master_key);
        data.extend_from_slice(&self.chain_code);
        data.extend_from_slice(&use_case.to_be_bytes());
        data.extend_from_slice(&peer_idx.to_be_bytes());
        data.extend_from_slice(&chan_idx.to_be_bytes());
        data.extend_from_slice(b"zapline/derive");

        let mut digest: [u8; 32] = Sha256::digest(&data).into();
        loop {
            if let Ok(key) = SecretKey::from_slice(&digest) {
                return key;
            }
            digest = Sha256::digest(digest).into();
        }
    }

    /// Derive the compressed public key for (use, peer, channel).
    pub fn derive_pubkey(&self, use_case: u32, peer_idx: u32, chan_idx: u32) -> PubKey {
        let secp = Secp256k1::new();
        let sk = self.derive_privkey(use_case, peer_idx, chan_idx);
        PubKey(PublicKey::from_secret_key(&secp, &sk).serialize())
    }

    /// Node identity key (use 11, path 0/0).
    pub fn id_key(&self) -> SecretKey {
        self.derive_privkey(USE_IDENTITY, 0, 0)
    }

    pub fn id_pub(&self) -> PubKey {
        self.derive_pubkey(USE_IDENTITY, 0, 0)
    }

    /// Funding key for a channel.
    pub fn fund_key(&self, peer_idx: u32, chan_idx: u32) -> SecretKey {
        self.derive_privkey(USE_CHANNEL_FUND, peer_idx, chan_idx)
    }

    pub fn fund_pub(&self, peer_idx: u32, chan_idx: u32) -> PubKey {
        self.derive_pubkey(USE_CHANNEL_FUND, peer_idx, chan_idx)
    }

    pub fn refund_pub(&self, peer_idx: u32, chan_idx: u32) -> PubKey {
        self.derive_pubkey(USE_CHANNEL_REFUND, peer_idx, chan_idx)
    }

    pub fn hakd_base_pub(&self, peer_idx: u32, chan_idx: u32) -> PubKey {
        self.derive_pubkey(USE_HAKD_BASE, peer_idx, chan_idx)
    }

    /// Elkrem sender root for a channel: hash of the derived elkrem key.
    pub fn elkrem_root(&self, peer_idx: u32, chan_idx: u32) -> [u8; 32] {
        let sk = self.derive_privkey(USE_ELKREM, peer_idx, chan_idx);
        Sha256::digest(sk.secret_bytes()).into()
    }
}

/// BIP32 master key derivation from a BIP39 seed.
fn derive_master_key(seed: &[u8]) -> Result<([u8; 32], [u8; 32]), ChannelError> {
    type HmacSha512 = Hmac<Sha512>;

    let mut mac = HmacSha512::new_from_slice(b"Zapline seed")
        .map_err(|_| ChannelError::Storage("hmac init".to_string()))?;
    mac.update(seed);
    let result = mac.finalize().into_bytes();

    let mut master_key = [0u8; 32];
    let mut chain_code = [0u8; 32];
    master_key.copy_from_slice(&result[..32]);
    chain_code.copy_from_slice(&result[32..]);

    Ok((master_key, chain_code))
}

// =============================================================================
// Tests
// =============================================================================
