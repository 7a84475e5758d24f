// =============================================================================
// ZAPLINE v0.4 - Channel Wire Messages
// =============================================================================
//
// Fixed hand-rolled layouts; no serde on the wire. Every message carries the
// funding outpoint as the channel tag. First byte is the message ID, all
// integers big-endian. Frames with the wrong length are rejected before any
// field is parsed.
//
//   RTS    (0x30): outpoint[36] ‖ push_amount[4] ‖ hakd_pub[33]       = 73
//   ACKSIG (0x31): outpoint[36] ‖ hakd_pub[33]   ‖ der_sig[66..76]    = 135..145
//   SIGREV (0x32): outpoint[36] ‖ elkrem[32]     ‖ der_sig            = 135..145
//   REV    (0x33): outpoint[36] ‖ elkrem[32]                          = 68
//
// =============================================================================

use super::state::{ChannelError, OutPoint, PubKey};

// =============================================================================
// Message IDs
// =============================================================================

pub const MSGID_VERSION: u8 = 0x01;
pub const MSGID_RTS: u8 = 0x30;
pub const MSGID_ACKSIG: u8 = 0x31;
pub const MSGID_SIGREV: u8 = 0x32;
pub const MSGID_REVOKE: u8 = 0x33;

// Body lengths, excluding the ID byte.
pub const RTS_LEN: usize = 73;
pub const ACKSIG_MIN_LEN: usize = 135;
pub const ACKSIG_MAX_LEN: usize = 145;
pub const SIGREV_MIN_LEN: usize = 135;
pub const SIGREV_MAX_LEN: usize = 145;
pub const REV_LEN: usize = 68;

// =============================================================================
// Channel Message
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Request-to-send: propose adding `amount` satoshis to the receiver's
    /// balance. Carries the receiver's revocable-output pubkey for the new
    /// state (we derive it; only we know the elkrem tweak).
    Rts {
        outpoint: OutPoint,
        amount: u32,
        hakd_pub: PubKey,
    },

    /// Acknowledge an RTS: our signature over the initiator's new
    /// commitment, plus the initiator's revocable-output pubkey for the
    /// new state.
    AckSig {
        outpoint: OutPoint,
        hakd_pub: PubKey,
        sig: Vec<u8>,
    },

    /// Signature over the receiver's new commitment plus the elkrem secret
    /// revoking the initiator's previous state.
    SigRev {
        outpoint: OutPoint,
        elkrem: [u8; 32],
        sig: Vec<u8>,
    },

    /// The elkrem secret revoking the receiver's previous state. Terminal.
    Revoke {
        outpoint: OutPoint,
        elkrem: [u8; 32],
    },
}

impl ChannelMessage {
    pub fn msg_id(&self) -> u8 {
        match self {
            ChannelMessage::Rts { .. } => MSGID_RTS,
            ChannelMessage::AckSig { .. } => MSGID_ACKSIG,
            ChannelMessage::SigRev { .. } => MSGID_SIGREV,
            ChannelMessage::Revoke { .. } => MSGID_REVOKE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelMessage::Rts { .. } => "RTS",
            ChannelMessage::AckSig { .. } => "ACKSIG",
            ChannelMessage::SigRev { .. } => "SIGREV",
            ChannelMessage::Revoke { .. } => "REV",
        }
    }

    pub fn outpoint(&self) -> &OutPoint {
        match self {
            ChannelMessage::Rts { outpoint, .. } => outpoint,
            ChannelMessage::AckSig { outpoint, .. } => outpoint,
            ChannelMessage::SigRev { outpoint, .. } => outpoint,
            ChannelMessage::Revoke { outpoint, .. } => outpoint,
        }
    }

    /// ID byte followed by the body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.msg_id()];
        match self {
            ChannelMessage::Rts { outpoint, amount, hakd_pub } => {
                buf.extend_from_slice(&outpoint.to_bytes());
                buf.extend_from_slice(&amount.to_be_bytes());
                buf.extend_from_slice(&hakd_pub.0);
            }
            ChannelMessage::AckSig { outpoint, hakd_pub, sig } => {
                buf.extend_from_slice(&outpoint.to_bytes());
                buf.extend_from_slice(&hakd_pub.0);
                buf.extend_from_slice(sig);
            }
            ChannelMessage::SigRev { outpoint, elkrem, sig } => {
                buf.extend_from_slice(&outpoint.to_bytes());
                buf.extend_from_slice(elkrem);
                buf.extend_from_slice(sig);
            }
            ChannelMessage::Revoke { outpoint, elkrem } => {
                buf.extend_from_slice(&outpoint.to_bytes());
                buf.extend_from_slice(elkrem);
            }
        }
        buf
    }

    /// Parse a full payload (ID byte included). Length is validated per
    /// message kind before any field is read.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        if bytes.is_empty() {
            return Err(ChannelError::BadLength { kind: "message", got: 0 });
        }
        let id = bytes[0];
        let body = &bytes[1..];

        match id {
            MSGID_RTS => {
                if body.len() != RTS_LEN {
                    return Err(ChannelError::BadLength { kind: "RTS", got: body.len() });
                }
                let outpoint = OutPoint::from_bytes(&body[..36]).unwrap();
                let amount = u32::from_be_bytes(body[36..40].try_into().unwrap());
                let hakd_pub = PubKey::from_slice(&body[40..73]).unwrap();
                Ok(ChannelMessage::Rts { outpoint, amount, hakd_pub })
            }
            MSGID_ACKSIG => {
                if body.len() < ACKSIG_MIN_LEN || body.len() > ACKSIG_MAX_LEN {
                    return Err(ChannelError::BadLength { kind: "ACKSIG", got: body.len() });
                }
                let outpoint = OutPoint::from_bytes(&body[..36]).unwrap();
                let hakd_pub = PubKey::from_slice(&body[36..69]).unwrap();
                let sig = body[69..].to_vec();
                Ok(ChannelMessage::AckSig { outpoint, hakd_pub, sig })
            }
            MSGID_SIGREV => {
                if body.len() < SIGREV_MIN_LEN || body.len() > SIGREV_MAX_LEN {
                    return Err(ChannelError::BadLength { kind: "SIGREV", got: body.len() });
                }
                let outpoint = OutPoint::from_bytes(&body[..36]).unwrap();
                let mut elkrem = [0u8; 32];
                elkrem.copy_from_slice(&body[36..68]);
                let sig = body[68..].to_vec();
                Ok(ChannelMessage::SigRev { outpoint, elkrem, sig })
            }
            MSGID_REVOKE => {
                if body.len() != REV_LEN {
                    return Err(ChannelError::BadLength { kind: "REV", got: body.len() });
                }
                let outpoint = OutPoint::from_bytes(&body[..36]).unwrap();
                let mut elkrem = [0u8; 32];
                elkrem.copy_from_slice(&body[36..]);
                Ok(ChannelMessage::Revoke { outpoint, elkrem })
            }
            other => Err(ChannelError::StateConflict(format!(
                "unknown message id 0x{:02x}",
                other
            ))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
