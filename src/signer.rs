// =============================================================================
// ZAPLINE v0.4 - Channel Signer
// =============================================================================
//
// Bridges wallet keys and commitment construction for the update engine.
// The engine only ever asks four things: sign the counterparty's commitment
// at the channel's current in-memory state, verify their signature against
// our own commitment, derive a per-state HAKD pubkey, and produce a
// broadcastable break transaction.
//
// Commitment views are asymmetric but mirror-consistent: the signature we
// produce over their commitment is exactly what they verify against the
// commitment they build for themselves, and vice versa.
//
// =============================================================================

use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Scalar, Secp256k1};
use sha2::{Digest, Sha256};

use crate::channels::commitment::{CommitmentParams, CommitmentTx, SignedCommitment};
use crate::channels::state::{Channel, ChannelError, PubKey};
use crate::wallet::Wallet;

// =============================================================================
// Signer Interface
// =============================================================================

pub trait Signer {
    /// DER signature over the counterparty's commitment for the channel's
    /// current in-memory state.
    fn sign_commitment(&self, chan: &Channel) -> Result<Vec<u8>, ChannelError>;

    /// Verify their signature against our own commitment at the current
    /// in-memory state.
    fn verify_sig(&self, chan: &Channel, sig_der: &[u8]) -> Result<(), ChannelError>;

    /// Revocable-output pubkey for our own commitment at `state_idx`:
    /// their HAKD base point plus our elkrem hash at that index times G.
    fn their_hakd_pub(&self, chan: &Channel, state_idx: u64) -> Result<PubKey, ChannelError>;

    /// Check a revealed revocation secret against the state it retires:
    /// our HAKD base plus the secret times G must equal the revocable
    /// pubkey we were holding for that state.
    fn check_revocation(&self, chan: &Channel, secret: &[u8; 32]) -> Result<(), ChannelError>;

    /// Broadcastable unilateral-close transaction for the last fully
    /// signed state.
    fn sign_break_tx(&self, chan: &Channel) -> Result<SignedCommitment, ChannelError>;
}

// =============================================================================
// Wallet Signer
// =============================================================================

pub struct WalletSigner {
    wallet: Wallet,
    secp: Secp256k1<All>,
}

impl WalletSigner {
    pub fn new(wallet: Wallet) -> Self {
        WalletSigner {
            wallet,
            secp: Secp256k1::new(),
        }
    }

    /// The counterparty's commitment: their balance delayed and revocable
    /// via the HAKD pub they handed us, our balance immediate.
    fn their_commitment(&self, chan: &Channel) -> CommitmentTx {
        CommitmentTx::build(&CommitmentParams {
            funding: chan.outpoint,
            state_idx: chan.state.state_idx,
            delayed_value: chan.their_amt(),
            delayed_pub: chan.their_refund_pub,
            revocation_pub: chan.state.my_hakd_pub,
            immediate_value: chan.state.my_amt,
            immediate_pub: chan.my_refund_pub,
            csv_delay: chan.csv_delay,
        })
    }

    /// Our own commitment at an explicit (state, balance) view. The
    /// revocation pub is re-derived; it is the same value we sent them
    /// when this state was negotiated.
    fn our_commitment(
        &self,
        chan: &Channel,
        state_idx: u64,
        my_amt: i64,
    ) -> Result<CommitmentTx, ChannelError> {
        let revocation_pub = self.their_hakd_pub(chan, state_idx)?;
        Ok(CommitmentTx::build(&CommitmentParams {
            funding: chan.outpoint,
            state_idx,
            delayed_value: my_amt,
            delayed_pub: chan.my_refund_pub,
            revocation_pub,
            immediate_value: chan.capacity - my_amt,
            immediate_pub: chan.their_refund_pub,
            csv_delay: chan.csv_delay,
        }))
    }

    fn sign_digest(&self, chan: &Channel, digest: [u8; 32]) -> Vec<u8> {
        let sk = self.wallet.fund_key(chan.peer_idx, chan.chan_idx);
        let msg = Message::from_digest(digest);
        self.secp.sign_ecdsa(&msg, &sk).serialize_der().to_vec()
    }
}

impl Signer for WalletSigner {
    fn sign_commitment(&self, chan: &Channel) -> Result<Vec<u8>, ChannelError> {
        let tx = self.their_commitment(chan);
        Ok(self.sign_digest(chan, tx.sighash()))
    }

    fn verify_sig(&self, chan: &Channel, sig_der: &[u8]) -> Result<(), ChannelError> {
        let tx = self.our_commitment(chan, chan.state.state_idx, chan.state.my_amt)?;
        let msg = Message::from_digest(tx.sighash());

        let sig = Signature::from_der(sig_der).map_err(|_| ChannelError::SignatureInvalid)?;
        let pk = PublicKey::from_slice(&chan.their_fund_pub.0)
            .map_err(|_| ChannelError::BadPubkey)?;

        self.secp
            .verify_ecdsa(&msg, &sig, &pk)
            .map_err(|_| ChannelError::SignatureInvalid)
    }

    fn their_hakd_pub(&self, chan: &Channel, state_idx: u64) -> Result<PubKey, ChannelError> {
        let base = PublicKey::from_slice(&chan.their_hakd_base.0)
            .map_err(|_| ChannelError::BadPubkey)?;

        let elk = chan
            .elk_send
            .at_index(state_idx)
            .map_err(|e| ChannelError::StateConflict(e.to_string()))?;

        let tweaked = base
            .add_exp_tweak(&self.secp, &elkrem_scalar(elk))
            .map_err(|_| ChannelError::BadPubkey)?;

        Ok(PubKey(tweaked.serialize()))
    }

    fn check_revocation(&self, chan: &Channel, secret: &[u8; 32]) -> Result<(), ChannelError> {
        let base_bytes = self.wallet.hakd_base_pub(chan.peer_idx, chan.chan_idx);
        let base = PublicKey::from_slice(&base_bytes.0).map_err(|_| ChannelError::BadPubkey)?;

        let derived = base
            .add_exp_tweak(&self.secp, &elkrem_scalar(*secret))
            .map_err(|_| ChannelError::BadPubkey)?;

        if PubKey(derived.serialize()) != chan.state.my_prev_hakd_pub {
            return Err(ChannelError::ElkremInvalid(
                "secret does not open the revoked state".to_string(),
            ));
        }
        Ok(())
    }

    fn sign_break_tx(&self, chan: &Channel) -> Result<SignedCommitment, ChannelError> {
        if chan.state.their_sig.is_empty() {
            return Err(ChannelError::StateConflict(
                "no counterparty signature on record".to_string(),
            ));
        }

        let (idx, my_amt) = chan.committed_view();
        let tx = self.our_commitment(chan, idx, my_amt)?;
        let my_sig = self.sign_digest(chan, tx.sighash());

        Ok(SignedCommitment {
            tx,
            my_sig,
            their_sig: chan.state.their_sig.clone(),
        })
    }
}

/// Reduce an elkrem hash to a usable scalar. Rehash on the astronomically
/// unlikely out-of-range case so both parties stay in agreement.
fn elkrem_scalar(mut bytes: [u8; 32]) -> Scalar {
    loop {
        if let Ok(s) = Scalar::from_be_bytes(bytes) {
            return s;
        }
        bytes = Sha256::digest(bytes).into();
    }
}

// =============================================================================
// Tests
// =============================================================================
