// =============================================================================
// ZAPLINE v0.4 - Channel State
// =============================================================================
//
// Core types for a bidirectional payment channel and its update-state
// machine.
//
// Update round (push from A to B):
//
//   A (initiator)                     B (receiver)
//   ─────────────                     ────────────
//   delta := -amt      ──RTS────▶     delta := +amt, advance state
//                      ◀──ACKSIG──    sign A's new commitment
//   advance, verify    ──SIGREV──▶    verify, ingest A's revocation
//                      ◀──REV─────    reveal B's revocation
//   ingest, clear
//
// Each persisted record sits in exactly one of four engine states, keyed
// on the sign of `delta` and whether the previous HAKD pubkey is cleared.
// That pair is what makes crash recovery a pure function of the record.
//
// =============================================================================

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::elkrem::{ElkremReceiver, ElkremSender};
use crate::lib::MIN_BALANCE;

// =============================================================================
// Compressed Public Key
// =============================================================================

/// A 33-byte compressed secp256k1 public key. The all-zero value is a
/// sentinel meaning "no key" (nothing awaiting revocation).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubKey(pub [u8; 33]);

impl PubKey {
    pub const ZERO: PubKey = PubKey([0u8; 33]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 33]
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 33 {
            return None;
        }
        let mut arr = [0u8; 33];
        arr.copy_from_slice(bytes);
        Some(PubKey(arr))
    }

    /// Valid point on the curve?
    pub fn is_valid_point(&self) -> bool {
        secp256k1::PublicKey::from_slice(&self.0).is_ok()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short display (first 4 bytes).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Debug for PubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PubKey({})", self.short())
    }
}

impl std::fmt::Display for PubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

// serde represents fixed arrays only up to 32 bytes, so the 33-byte key
// serializes as a raw byte string.
impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PubKeyVisitor;

        impl<'de> Visitor<'de> for PubKeyVisitor {
            type Value = PubKey;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("33 bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<PubKey, E> {
                PubKey::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<PubKey, A::Error> {
                let mut arr = [0u8; 33];
                for (i, byte) in arr.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(PubKey(arr))
            }
        }

        deserializer.deserialize_bytes(PubKeyVisitor)
    }
}

// =============================================================================
// Funding Outpoint
// =============================================================================

/// The 2-of-2 output anchoring a channel: 32-byte txid plus output index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub vout: u32,
}

impl OutPoint {
    pub const LEN: usize = 36;

    /// Wire form: txid followed by big-endian vout.
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut b = [0u8; 36];
        b[..32].copy_from_slice(&self.txid);
        b[32..].copy_from_slice(&self.vout.to_be_bytes());
        b
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 36 {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[..32]);
        let vout = u32::from_be_bytes(bytes[32..36].try_into().ok()?);
        Some(OutPoint { txid, vout })
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", hex::encode(&self.txid[..4]), self.vout)
    }
}

// =============================================================================
// Channel Error
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// Malformed message length for the named message kind.
    BadLength { kind: &'static str, got: usize },
    /// Received pubkey is not a point on the curve.
    BadPubkey,
    /// Amount outside the legal range.
    BadAmount(i64),
    /// Update would push a balance below the minimum reserve.
    ReserveViolation { amount: i64, available: i64 },
    /// Message peer does not own the channel it names.
    PeerMismatch,
    ChannelClosed,
    ChannelBroken,
    /// A state update is already in flight.
    UpdateInProgress,
    /// Record is in a state the operation cannot act on.
    StateConflict(String),
    /// Counterparty signature failed verification.
    SignatureInvalid,
    /// Revocation secret inconsistent with prior secrets. Fatal: the only
    /// honest response is a unilateral close at the current state.
    ElkremInvalid(String),
    NotFound,
    Storage(String),
    Transport(String),
}

impl ChannelError {
    /// Fatal errors end the channel; everything else leaves it usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::ElkremInvalid(_))
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::BadLength { kind, got } => {
                write!(f, "bad {} length: {} bytes", kind, got)
            }
            ChannelError::BadPubkey => write!(f, "pubkey is not a curve point"),
            ChannelError::BadAmount(a) => write!(f, "amount {} out of range", a),
            ChannelError::ReserveViolation { amount, available } => {
                write!(
                    f,
                    "push of {} violates reserve: {} available above {} minimum",
                    amount, available, MIN_BALANCE
                )
            }
            ChannelError::PeerMismatch => write!(f, "peer does not own this channel"),
            ChannelError::ChannelClosed => write!(f, "channel is closed"),
            ChannelError::ChannelBroken => write!(f, "channel is broken"),
            ChannelError::UpdateInProgress => {
                write!(f, "channel update in progress, cannot push")
            }
            ChannelError::StateConflict(s) => write!(f, "state conflict: {}", s),
            ChannelError::SignatureInvalid => write!(f, "signature verification failed"),
            ChannelError::ElkremInvalid(s) => write!(f, "revocation secret invalid: {}", s),
            ChannelError::NotFound => write!(f, "channel not found"),
            ChannelError::Storage(s) => write!(f, "storage error: {}", s),
            ChannelError::Transport(s) => write!(f, "transport error: {}", s),
        }
    }
}

impl std::error::Error for ChannelError {}

// =============================================================================
// Engine State
// =============================================================================

/// The four legal update-engine states of a persisted channel record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// No update in flight.
    Clean,
    /// We proposed a push and await the counterparty's signature.
    RtsSent,
    /// We signed their new state and await their SIGREV.
    AckSigSent,
    /// They signed our new state; we owe them a SIGREV.
    SigRevOwed,
}

// =============================================================================
// Channel State Record
// =============================================================================

/// The mutable portion of a channel record. Everything the update engine
/// touches lives here; key material and capacity are fixed at funding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelState {
    /// Index of the last locally committed state. Only ever increases.
    pub state_idx: u64,

    /// Satoshis owed to us at `state_idx`.
    pub my_amt: i64,

    /// Pending balance change. Zero when nothing is in flight; negative
    /// while our own push awaits the counterparty's signature; positive
    /// from the moment we apply their push until their SIGREV revokes
    /// their old state.
    pub delta: i32,

    /// Revocable-output pubkey for the counterparty's commitment at
    /// `state_idx`. We hold its punishment key once they revoke.
    pub my_hakd_pub: PubKey,

    /// `my_hakd_pub` of the prior state. Zero sentinel: no prior state
    /// awaiting revocation.
    pub my_prev_hakd_pub: PubKey,

    /// Latest counterparty signature over our own commitment, and the
    /// state index it covers. A break pairs this signature with the
    /// matching state.
    pub their_sig: Vec<u8>,
    pub their_sig_idx: u64,
}

impl ChannelState {
    /// Classify the record into one of the four engine states.
    /// Any other (delta, prev) combination is a corrupted record.
    pub fn engine_state(&self) -> Result<EngineState, ChannelError> {
        let prev_clear = self.my_prev_hakd_pub.is_zero();
        match (self.delta, prev_clear) {
            (0, true) => Ok(EngineState::Clean),
            (d, true) if d < 0 => Ok(EngineState::RtsSent),
            (d, false) if d > 0 => Ok(EngineState::AckSigSent),
            (0, false) => Ok(EngineState::SigRevOwed),
            (d, _) => Err(ChannelError::StateConflict(format!(
                "delta {} with prev HAKD {}",
                d,
                if prev_clear { "clear" } else { "set" }
            ))),
        }
    }
}

// =============================================================================
// Channel
// =============================================================================

/// A payment channel with one peer. The engine treats this as a value
/// snapshot: load from the store, mutate, hand back for atomic persistence.
/// Elkrem trees ride inside the record so they persist with it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Channel {
    /// Counterparty identity pubkey.
    pub peer_id: PubKey,
    pub peer_idx: u32,
    pub chan_idx: u32,

    /// Funding outpoint; also the channel tag on every wire message.
    pub outpoint: OutPoint,

    /// Total satoshis locked in the funding output. Immutable.
    pub capacity: i64,

    /// Terminal flag; a closed record only exists for chain monitoring.
    pub closed: bool,

    /// Set when the counterparty revoked signed state with a bad secret.
    /// No further updates are accepted; break is the way out.
    pub broken: bool,

    pub csv_delay: u32,

    // Key material fixed at funding.
    pub my_fund_pub: PubKey,
    pub their_fund_pub: PubKey,
    pub my_refund_pub: PubKey,
    pub their_refund_pub: PubKey,
    pub their_hakd_base: PubKey,

    pub state: ChannelState,

    /// Our revocation secrets (we reveal these as states retire).
    pub elk_send: ElkremSender,
    /// Their revocation secrets (ingested as they retire states).
    pub elk_recv: ElkremReceiver,
}

impl Channel {
    /// Counterparty balance at the current state.
    pub fn their_amt(&self) -> i64 {
        self.capacity - self.state.my_amt
    }

    /// The state a break must sign: the newest one the stored counterparty
    /// signature covers. An inbound push we have applied but they have not
    /// yet revoked is backed out transiently.
    pub fn committed_view(&self) -> (u64, i64) {
        if self.state.their_sig_idx < self.state.state_idx && self.state.delta > 0 {
            (
                self.state.their_sig_idx,
                self.state.my_amt - self.state.delta as i64,
            )
        } else {
            (self.state.state_idx, self.state.my_amt)
        }
    }

    /// Invariants that must hold on every store write. A violation is a
    /// programming error upstream, never a peer input error.
    pub fn check_invariants(&self) -> Result<(), ChannelError> {
        if self.capacity <= 0 {
            return Err(ChannelError::StateConflict(format!(
                "capacity {}",
                self.capacity
            )));
        }
        if self.state.my_amt < 0 || self.state.my_amt > self.capacity {
            return Err(ChannelError::StateConflict(format!(
                "my_amt {} outside [0, {}]",
                self.state.my_amt, self.capacity
            )));
        }
        if self.state.my_amt < MIN_BALANCE || self.their_amt() < MIN_BALANCE {
            return Err(ChannelError::StateConflict(format!(
                "balance {}/{} below reserve {}",
                self.state.my_amt,
                self.their_amt(),
                MIN_BALANCE
            )));
        }
        self.state.engine_state()?;
        Ok(())
    }

    /// Summary for display.
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            peer_idx: self.peer_idx,
            chan_idx: self.chan_idx,
            outpoint: self.outpoint,
            capacity: self.capacity,
            my_amt: self.state.my_amt,
            their_amt: self.their_amt(),
            state_idx: self.state.state_idx,
            engine_state: self.state.engine_state().ok(),
            closed: self.closed,
            broken: self.broken,
        }
    }
}

// =============================================================================
// Channel Info (for display)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub peer_idx: u32,
    pub chan_idx: u32,
    pub outpoint: OutPoint,
    pub capacity: i64,
    pub my_amt: i64,
    pub their_amt: i64,
    pub state_idx: u64,
    pub engine_state: Option<EngineState>,
    pub closed: bool,
    pub broken: bool,
}

impl std::fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Channel ({},{}) {}", self.peer_idx, self.chan_idx, self.outpoint)?;
        writeln!(f, "  Capacity: {} sat", self.capacity)?;
        writeln!(f, "  Mine: {} sat  Theirs: {} sat", self.my_amt, self.their_amt)?;
        writeln!(f, "  State: {} ({:?})", self.state_idx, self.engine_state)?;
        if self.broken {
            writeln!(f, "  BROKEN")?;
        }
        if self.closed {
            writeln!(f, "  CLOSED")?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
