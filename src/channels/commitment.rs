// =============================================================================
// ZAPLINE v0.4 - Commitment Transactions
// =============================================================================
//
// Each party holds its own signed-but-unbroadcast commitment spending the
// funding output. Broadcasting one closes the channel unilaterally.
//
// Outputs (our version):
//   1. Ours, delayed and revocable:
//      OP_IF <revocation_pub> OP_CHECKSIG
//      OP_ELSE <csv_delay> OP_CSV OP_DROP <our_pub> OP_CHECKSIG OP_ENDIF
//   2. Theirs, immediately spendable: <their_pub> OP_CHECKSIG
//
// The revocation pubkey rotates per state; once we revoke a state the
// counterparty holds its private key and can sweep the OP_IF branch of a
// stale broadcast before our CSV delay expires.
//
// =============================================================================

use sha2::{Digest, Sha256};

use super::state::{OutPoint, PubKey};

/// Outputs below this are not worth creating.
const DUST_LIMIT: i64 = 546;

// =============================================================================
// Commitment Output
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitmentOutputType {
    /// To the commitment holder: CSV delay plus revocation escape hatch.
    Delayed {
        csv_delay: u32,
        delayed_pub: PubKey,
        revocation_pub: PubKey,
    },
    /// To the counterparty, immediately spendable.
    Immediate { pubkey: PubKey },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentOutput {
    pub output_type: CommitmentOutputType,
    pub value: i64,
    pub script: Vec<u8>,
}

impl CommitmentOutput {
    pub fn delayed(
        value: i64,
        csv_delay: u32,
        delayed_pub: PubKey,
        revocation_pub: PubKey,
    ) -> Self {
        let mut script = Vec::new();

        // OP_IF <revocation_pub> OP_CHECKSIG
        script.push(0x63);
        script.push(33);
        script.extend_from_slice(&revocation_pub.0);
        script.push(0xAC);

        // OP_ELSE <csv_delay> OP_CSV OP_DROP <delayed_pub> OP_CHECKSIG
        script.push(0x67);
        let delay_bytes = encode_script_number(csv_delay as i64);
        script.push(delay_bytes.len() as u8);
        script.extend_from_slice(&delay_bytes);
        script.push(0xB2); // OP_CSV
        script.push(0x75); // OP_DROP
        script.push(33);
        script.extend_from_slice(&delayed_pub.0);
        script.push(0xAC);

        // OP_ENDIF
        script.push(0x68);

        CommitmentOutput {
            output_type: CommitmentOutputType::Delayed {
                csv_delay,
                delayed_pub,
                revocation_pub,
            },
            value,
            script,
        }
    }

    pub fn immediate(value: i64, pubkey: PubKey) -> Self {
        let mut script = Vec::new();
        script.push(33);
        script.extend_from_slice(&pubkey.0);
        script.push(0xAC);

        CommitmentOutput {
            output_type: CommitmentOutputType::Immediate { pubkey },
            value,
            script,
        }
    }
}

// =============================================================================
// Commitment Transaction
// =============================================================================

/// Inputs to a commitment build. The engine decides whose view this is;
/// the builder only assembles bytes.
#[derive(Clone, Debug)]
pub struct CommitmentParams {
    pub funding: OutPoint,
    pub state_idx: u64,
    /// Holder's balance: delayed and revocable.
    pub delayed_value: i64,
    pub delayed_pub: PubKey,
    pub revocation_pub: PubKey,
    /// Counterparty balance: immediate.
    pub immediate_value: i64,
    pub immediate_pub: PubKey,
    pub csv_delay: u32,
}

#[derive(Clone, Debug)]
pub struct CommitmentTx {
    pub funding: OutPoint,
    pub state_idx: u64,
    /// State index XORed with a funding-derived factor, like a locktime
    /// field that does not leak the update count.
    pub obscured_idx: u64,
    pub outputs: Vec<CommitmentOutput>,
}

impl CommitmentTx {
    pub fn build(p: &CommitmentParams) -> Self {
        let mut outputs = Vec::new();

        if p.delayed_value >= DUST_LIMIT {
            outputs.push(CommitmentOutput::delayed(
                p.delayed_value,
                p.csv_delay,
                p.delayed_pub,
                p.revocation_pub,
            ));
        }
        if p.immediate_value >= DUST_LIMIT {
            outputs.push(CommitmentOutput::immediate(p.immediate_value, p.immediate_pub));
        }

        let obscured_idx = p.state_idx ^ obscuring_factor(&p.funding.txid);

        CommitmentTx {
            funding: p.funding,
            state_idx: p.state_idx,
            obscured_idx,
            outputs,
        }
    }

    /// Serialize for hashing and broadcast.
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::new();

        // Version
        data.extend_from_slice(&2u32.to_le_bytes());

        // Input: funding outpoint
        data.extend_from_slice(&self.funding.txid);
        data.extend_from_slice(&self.funding.vout.to_le_bytes());

        // Outputs
        data.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_le_bytes());
            data.extend_from_slice(&(output.script.len() as u32).to_le_bytes());
            data.extend_from_slice(&output.script);
        }

        // Obscured state index in the locktime slot
        data.extend_from_slice(&self.obscured_idx.to_le_bytes());

        data
    }

    /// Digest both parties sign.
    pub fn sighash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"zapline/commitment");
        hasher.update(self.serialize());
        hasher.finalize().into()
    }

    pub fn txid(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.serialize());
        hasher.finalize().into()
    }

    pub fn total_output_value(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

// =============================================================================
// Signed Commitment (break transaction)
// =============================================================================

/// A commitment with both signatures attached: broadcastable.
#[derive(Clone, Debug)]
pub struct SignedCommitment {
    pub tx: CommitmentTx,
    pub my_sig: Vec<u8>,
    pub their_sig: Vec<u8>,
}

impl SignedCommitment {
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = self.tx.serialize();
        data.extend_from_slice(&(self.my_sig.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.my_sig);
        data.extend_from_slice(&(self.their_sig.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.their_sig);
        data
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn obscuring_factor(funding_txid: &[u8; 32]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(funding_txid);
    hasher.update(b"obscure");
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Minimal Bitcoin Script number encoding.
fn encode_script_number(n: i64) -> Vec<u8> {
    if n == 0 {
        return vec![];
    }

    let negative = n < 0;
    let mut abs_n = n.unsigned_abs();
    let mut result = Vec::new();

    while abs_n > 0 {
        result.push((abs_n & 0xFF) as u8);
        abs_n >>= 8;
    }

    if result.last().unwrap() & 0x80 != 0 {
        result.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        *result.last_mut().unwrap() |= 0x80;
    }

    result
}

// =============================================================================
// Tests
// =============================================================================
