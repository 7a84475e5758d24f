// =============================================================================
// ZAPLINE v0.4 - Channel Funding Records
// =============================================================================
//
// Real channels come out of an on-chain funding handshake. This module only
// materializes the resulting records: given both wallets it builds the two
// mirrored views of one channel, cross-derives the initial revocable-output
// pubkeys, and cross-signs the state-0 commitments. Used by the regtest
// `dev-fund` command and the engine tests; a production funding flow would
// replace the wallet-to-wallet shortcut with message exchange.
//
// =============================================================================

use super::state::{Channel, ChannelError, ChannelState, OutPoint, PubKey};
use crate::elkrem::{ElkremReceiver, ElkremSender};
use crate::signer::{Signer, WalletSigner};
use crate::wallet::Wallet;

#[derive(Clone, Debug)]
pub struct FundingParams {
    pub outpoint: OutPoint,
    pub capacity: i64,
    /// Side A's share of the capacity at state 0.
    pub amt_a: i64,
    pub csv_delay: u32,
}

/// One side's view of the channel, before cross-derived fields are filled.
fn one_side(
    wallet: &Wallet,
    other: &Wallet,
    peer_idx: u32,
    other_peer_idx: u32,
    chan_idx: u32,
    my_amt: i64,
    p: &FundingParams,
) -> Channel {
    Channel {
        peer_id: other.id_pub(),
        peer_idx,
        chan_idx,
        outpoint: p.outpoint,
        capacity: p.capacity,
        closed: false,
        broken: false,
        csv_delay: p.csv_delay,
        my_fund_pub: wallet.fund_pub(peer_idx, chan_idx),
        their_fund_pub: other.fund_pub(other_peer_idx, chan_idx),
        my_refund_pub: wallet.refund_pub(peer_idx, chan_idx),
        their_refund_pub: other.refund_pub(other_peer_idx, chan_idx),
        their_hakd_base: other.hakd_base_pub(other_peer_idx, chan_idx),
        state: ChannelState {
            state_idx: 0,
            my_amt,
            delta: 0,
            my_hakd_pub: PubKey::ZERO,
            my_prev_hakd_pub: PubKey::ZERO,
            their_sig: Vec::new(),
            their_sig_idx: 0,
        },
        elk_send: ElkremSender::new(wallet.elkrem_root(peer_idx, chan_idx)),
        elk_recv: ElkremReceiver::new(),
    }
}

/// Build both views of a funded channel. `peer_idx_a` is the index side A
/// assigned to B, and vice versa; `chan_idx` must match on both sides.
pub fn mirror_pair(
    wallet_a: &Wallet,
    wallet_b: &Wallet,
    peer_idx_a: u32,
    peer_idx_b: u32,
    chan_idx: u32,
    p: &FundingParams,
) -> Result<(Channel, Channel), ChannelError> {
    if p.amt_a < 0 || p.amt_a > p.capacity {
        return Err(ChannelError::BadAmount(p.amt_a));
    }

    let mut chan_a = one_side(wallet_a, wallet_b, peer_idx_a, peer_idx_b, chan_idx, p.amt_a, p);
    let mut chan_b = one_side(
        wallet_b,
        wallet_a,
        peer_idx_b,
        peer_idx_a,
        chan_idx,
        p.capacity - p.amt_a,
        p,
    );

    let signer_a = WalletSigner::new(wallet_a.clone());
    let signer_b = WalletSigner::new(wallet_b.clone());

    // Each side's revocable-output pubkey for state 0 is derived by the
    // other side, exactly as RTS/ACKSIG hand them over in later rounds.
    chan_a.state.my_hakd_pub = signer_b.their_hakd_pub(&chan_b, 0)?;
    chan_b.state.my_hakd_pub = signer_a.their_hakd_pub(&chan_a, 0)?;

    // Cross-sign the state-0 commitments so either side can break
    // immediately after funding.
    chan_a.state.their_sig = signer_b.sign_commitment(&chan_b)?;
    chan_b.state.their_sig = signer_a.sign_commitment(&chan_a)?;

    Ok((chan_a, chan_b))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> FundingParams {
        FundingParams {
            outpoint: OutPoint { txid: [0xAB; 32], vout: 1 },
            capacity: 1_000_000,
            amt_a: 500_000,
            csv_delay: 144,
        }
    }

    #[test]
    fn test_mirrored_views_consistent() {
        let wa = Wallet::new().unwrap();
        let wb = Wallet::new().unwrap();
        let (a, b) = mirror_pair(&wa, &wb, 1, 1, 1, &params()).unwrap();

        assert_eq!(a.state.my_amt + b.state.my_amt, 1_000_000);
        assert_eq!(a.my_fund_pub, b.their_fund_pub);
        assert_eq!(b.my_fund_pub, a.their_fund_pub);
        assert_eq!(a.peer_id, wb.id_pub());
        assert_eq!(b.peer_id, wa.id_pub());
        assert!(a.check_invariants().is_ok());
        assert!(b.check_invariants().is_ok());
    }

    #[test]
    fn test_initial_signatures_verify() {
        let wa = Wallet::new().unwrap();
        let wb = Wallet::new().unwrap();
        let (a, b) = mirror_pair(&wa, &wb, 1, 1, 1, &params()).unwrap();

        let signer_a = WalletSigner::new(wa);
        let signer_b = WalletSigner::new(wb);
        assert!(signer_a.verify_sig(&a, &a.state.their_sig).is_ok());
        assert!(signer_b.verify_sig(&b, &b.state.their_sig).is_ok());
    }

    #[test]
    fn test_unbalanced_funding_rejected() {
        let wa = Wallet::new().unwrap();
        let wb = Wallet::new().unwrap();
        let mut p = params();
        p.amt_a = 1_000_001;
        assert!(mirror_pair(&wa, &wb, 1, 1, 1, &p).is_err());
    }
}
