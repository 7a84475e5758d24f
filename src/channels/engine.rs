// =============================================================================
// ZAPLINE v0.4 - Channel Update Engine
// =============================================================================
//
// Drives and consumes the RTS / ACKSIG / SIGREV / REV sequence. Two rules
// keep the protocol safe under crashes and a dishonest counterparty:
//
//   1. Never hold a signed new state without the counterparty's revocation
//      of the old one still owed to us being tracked (`my_prev_hakd_pub`).
//   2. Persist every state advance before transmitting the message that
//      depends on it. Handlers return the reply; the caller transmits it
//      only after this function has come back Ok.
//
// Each side advances `state_idx` exactly once per round: the receiver when
// it applies the RTS and builds the ACKSIG, the initiator when it processes
// the ACKSIG. Resume after a disconnect is `send_next_msg`, a pure function
// of the persisted record:
//
//   delta  prev_hakd   resend
//   ─────  ─────────   ──────
//     0      clear     REV     (peer drops it as a duplicate)
//    <0      clear     RTS
//    >0      set       ACKSIG
//     0      set       SIGREV
//
// =============================================================================

use log::{info, warn};

use super::messages::ChannelMessage;
use super::state::{Channel, ChannelError, EngineState, OutPoint, PubKey};
use crate::channels::commitment::SignedCommitment;
use crate::lib::{MAX_PUSH, MIN_BALANCE};
use crate::signer::Signer;
use crate::storage::ChannelStore;

// =============================================================================
// Update Engine
// =============================================================================

pub struct UpdateEngine<S: ChannelStore, K: Signer> {
    store: S,
    signer: K,
}

impl<S: ChannelStore, K: Signer> UpdateEngine<S, K> {
    pub fn new(store: S, signer: K) -> Self {
        UpdateEngine { store, signer }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // =========================================================================
    // Inbound Dispatch
    // =========================================================================

    /// Process one message from `peer`. Returns the reply to transmit, if
    /// any. State is persisted before this returns, so the caller may crash
    /// before sending without losing ground.
    pub fn handle_message(
        &mut self,
        peer: &PubKey,
        msg: &ChannelMessage,
    ) -> Result<Option<ChannelMessage>, ChannelError> {
        match msg {
            ChannelMessage::Rts { outpoint, amount, hakd_pub } => {
                self.handle_rts(peer, outpoint, *amount, hakd_pub)
            }
            ChannelMessage::AckSig { outpoint, hakd_pub, sig } => {
                self.handle_acksig(peer, outpoint, hakd_pub, sig)
            }
            ChannelMessage::SigRev { outpoint, elkrem, sig } => {
                self.handle_sigrev(peer, outpoint, elkrem, sig)
            }
            ChannelMessage::Revoke { outpoint, elkrem } => {
                self.handle_rev(peer, outpoint, elkrem)
            }
        }
    }

    fn load_for_update(
        &self,
        peer: &PubKey,
        outpoint: &OutPoint,
    ) -> Result<Channel, ChannelError> {
        let chan = self.store.get_channel(peer, outpoint)?;
        if chan.closed {
            return Err(ChannelError::ChannelClosed);
        }
        if chan.broken {
            return Err(ChannelError::ChannelBroken);
        }
        // Lookup is keyed by peer, so this cannot fire today. Kept in case
        // the keying ever changes.
        if chan.peer_id != *peer {
            return Err(ChannelError::PeerMismatch);
        }
        Ok(chan)
    }

    // =========================================================================
    // RTS: counterparty proposes pushing funds to us
    // =========================================================================

    fn handle_rts(
        &mut self,
        peer: &PubKey,
        outpoint: &OutPoint,
        amount: u32,
        hakd_pub: &PubKey,
    ) -> Result<Option<ChannelMessage>, ChannelError> {
        let mut chan = self.load_for_update(peer, outpoint)?;

        match chan.state.engine_state()? {
            EngineState::Clean => {}
            // The initiator never saw our ACKSIG; answer the resend in kind.
            EngineState::AckSigSent
                if chan.state.delta == amount as i32 && chan.state.my_hakd_pub == *hakd_pub =>
            {
                info!("duplicate RTS on {}, re-sending ACKSIG", outpoint);
                return Ok(Some(self.build_acksig(&chan)?));
            }
            _ => return Err(ChannelError::UpdateInProgress),
        }

        if amount < 1 || amount > MAX_PUSH {
            return Err(ChannelError::BadAmount(amount as i64));
        }
        if !hakd_pub.is_valid_point() {
            return Err(ChannelError::BadPubkey);
        }

        let amt = amount as i64;
        // The push must leave the initiator above reserve...
        if amt + MIN_BALANCE > chan.their_amt() {
            return Err(ChannelError::ReserveViolation {
                amount: amt,
                available: chan.their_amt() - MIN_BALANCE,
            });
        }
        // Our balance only grows here; every persisted record already
        // satisfies the reserve floor.
        debug_assert!(chan.state.my_amt + amt >= MIN_BALANCE);

        // Apply and advance in a single persisted step. `delta` stays
        // positive until their SIGREV revokes the state this replaces.
        chan.state.delta = amount as i32;
        chan.state.my_prev_hakd_pub = chan.state.my_hakd_pub;
        chan.state.my_hakd_pub = *hakd_pub;
        chan.state.state_idx += 1;
        chan.state.my_amt += amt;

        let reply = self.build_acksig(&chan)?;
        self.store.save_channel_state(&chan)?;

        info!(
            "RTS on {}: +{} sat, now {} at state {}",
            outpoint, amt, chan.state.my_amt, chan.state.state_idx
        );
        Ok(Some(reply))
    }

    fn build_acksig(&self, chan: &Channel) -> Result<ChannelMessage, ChannelError> {
        let sig = self.signer.sign_commitment(chan)?;
        let hakd_pub = self.signer.their_hakd_pub(chan, chan.state.state_idx)?;
        Ok(ChannelMessage::AckSig {
            outpoint: chan.outpoint,
            hakd_pub,
            sig,
        })
    }

    // =========================================================================
    // ACKSIG: counterparty signed the state our push created
    // =========================================================================

    fn handle_acksig(
        &mut self,
        peer: &PubKey,
        outpoint: &OutPoint,
        hakd_pub: &PubKey,
        sig: &[u8],
    ) -> Result<Option<ChannelMessage>, ChannelError> {
        let mut chan = self.load_for_update(peer, outpoint)?;

        match chan.state.engine_state()? {
            EngineState::RtsSent => {}
            // Our SIGREV was lost; repeat it.
            EngineState::SigRevOwed if chan.state.my_hakd_pub == *hakd_pub => {
                info!("duplicate ACKSIG on {}, re-sending SIGREV", outpoint);
                return Ok(Some(self.build_sigrev(&chan)?));
            }
            EngineState::Clean => {
                info!("stale ACKSIG on {}, dropping", outpoint);
                return Ok(None);
            }
            _ => {
                return Err(ChannelError::StateConflict(
                    "ACKSIG while counterparty push in progress".to_string(),
                ))
            }
        }

        if !hakd_pub.is_valid_point() {
            return Err(ChannelError::BadPubkey);
        }

        // Advance to the state the signature covers, then check it. Reject
        // without persisting if it does not verify.
        chan.state.state_idx += 1;
        chan.state.my_prev_hakd_pub = chan.state.my_hakd_pub;
        chan.state.my_hakd_pub = *hakd_pub;
        chan.state.my_amt += chan.state.delta as i64;
        chan.state.delta = 0;

        self.signer.verify_sig(&chan, sig)?;
        chan.state.their_sig = sig.to_vec();
        chan.state.their_sig_idx = chan.state.state_idx;

        let reply = self.build_sigrev(&chan)?;
        self.store.save_channel_state(&chan)?;

        info!(
            "ACKSIG on {}: now {} at state {}",
            outpoint, chan.state.my_amt, chan.state.state_idx
        );
        Ok(Some(reply))
    }

    fn build_sigrev(&self, chan: &Channel) -> Result<ChannelMessage, ChannelError> {
        let sig = self.signer.sign_commitment(chan)?;
        let elkrem = chan
            .elk_send
            .at_index(chan.state.state_idx - 1)
            .map_err(|e| ChannelError::StateConflict(e.to_string()))?;
        Ok(ChannelMessage::SigRev {
            outpoint: chan.outpoint,
            elkrem,
            sig,
        })
    }

    // =========================================================================
    // SIGREV: counterparty signed our new state and revoked their old one
    // =========================================================================

    fn handle_sigrev(
        &mut self,
        peer: &PubKey,
        outpoint: &OutPoint,
        elkrem: &[u8; 32],
        sig: &[u8],
    ) -> Result<Option<ChannelMessage>, ChannelError> {
        let mut chan = self.load_for_update(peer, outpoint)?;

        match chan.state.engine_state()? {
            EngineState::AckSigSent => {}
            // Already processed; our REV must have been lost. Repeat it.
            EngineState::Clean if chan.state.state_idx >= 1 => {
                info!("duplicate SIGREV on {}, re-sending REV", outpoint);
                return Ok(Some(self.build_rev(&chan)?));
            }
            _ => {
                return Err(ChannelError::StateConflict(
                    "SIGREV with no signed state outstanding".to_string(),
                ))
            }
        }

        // Signature first. If the revocation then fails we still hold a
        // valid signature for the newer state, which is the better close.
        self.signer.verify_sig(&chan, sig)?;
        chan.state.their_sig = sig.to_vec();
        chan.state.their_sig_idx = chan.state.state_idx;

        self.ingest_revocation(&mut chan, elkrem)?;

        chan.state.delta = 0;
        chan.state.my_prev_hakd_pub = PubKey::ZERO;

        let reply = self.build_rev(&chan)?;
        self.store.save_channel_state(&chan)?;

        info!(
            "SIGREV OK on {}, state {} all signed, sending REV",
            outpoint, chan.state.state_idx
        );
        Ok(Some(reply))
    }

    fn build_rev(&self, chan: &Channel) -> Result<ChannelMessage, ChannelError> {
        let elkrem = chan
            .elk_send
            .at_index(chan.state.state_idx - 1)
            .map_err(|e| ChannelError::StateConflict(e.to_string()))?;
        Ok(ChannelMessage::Revoke {
            outpoint: chan.outpoint,
            elkrem,
        })
    }

    // =========================================================================
    // REV: counterparty revoked their old state; round complete
    // =========================================================================

    fn handle_rev(
        &mut self,
        peer: &PubKey,
        outpoint: &OutPoint,
        elkrem: &[u8; 32],
    ) -> Result<Option<ChannelMessage>, ChannelError> {
        let mut chan = self.load_for_update(peer, outpoint)?;

        if chan.state.my_prev_hakd_pub.is_zero() {
            info!("REV on {} with nothing to revoke, dropping", outpoint);
            return Ok(None);
        }
        if chan.state.engine_state()? != EngineState::SigRevOwed {
            return Err(ChannelError::StateConflict(
                "REV while counterparty push unrevoked".to_string(),
            ));
        }

        self.ingest_revocation(&mut chan, elkrem)?;

        chan.state.my_prev_hakd_pub = PubKey::ZERO;
        self.store.save_channel_state(&chan)?;

        info!("REV OK on {}, state {} all clear", outpoint, chan.state.state_idx);
        Ok(None)
    }

    /// Validate and absorb a revealed revocation secret. The secret must
    /// open the revocable pubkey of the state being retired and must hash
    /// consistently with every prior secret. Failure is fatal: the channel
    /// is marked broken and persisted before the error surfaces.
    fn ingest_revocation(
        &mut self,
        chan: &mut Channel,
        elkrem: &[u8; 32],
    ) -> Result<(), ChannelError> {
        let result = self.signer.check_revocation(chan, elkrem).and_then(|_| {
            chan.elk_recv
                .ingest(*elkrem)
                .map_err(|e| ChannelError::ElkremInvalid(e.to_string()))
        });

        if let Err(e) = result {
            chan.broken = true;
            self.store.save_channel_state(chan)?;
            warn!("channel {} broken: {}", chan.outpoint, e);
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Push Initiation
    // =========================================================================

    /// Start a state update pushing `amount` satoshis to the counterparty.
    /// Returns the RTS to transmit. Only one update may be in flight.
    pub fn push_channel(
        &mut self,
        peer: &PubKey,
        chan_idx: u32,
        amount: u32,
    ) -> Result<ChannelMessage, ChannelError> {
        let peer_idx = self.store.get_peer_idx(peer)?;
        let mut chan = self.store.get_channel_by_idx(peer_idx, chan_idx)?;

        if chan.closed {
            return Err(ChannelError::ChannelClosed);
        }
        if chan.broken {
            return Err(ChannelError::ChannelBroken);
        }
        if amount < 1 || amount > MAX_PUSH {
            return Err(ChannelError::BadAmount(amount as i64));
        }
        if chan.state.engine_state()? != EngineState::Clean {
            return Err(ChannelError::UpdateInProgress);
        }

        let amt = amount as i64;
        if amt + MIN_BALANCE > chan.state.my_amt {
            return Err(ChannelError::ReserveViolation {
                amount: amt,
                available: chan.state.my_amt - MIN_BALANCE,
            });
        }
        // The counterparty only gains from a push; every persisted record
        // already satisfies their reserve floor.
        debug_assert!(amt + chan.their_amt() >= MIN_BALANCE);

        chan.state.delta = -(amount as i32);
        self.store.save_channel_state(&chan)?;

        info!(
            "push {} sat on ({},{}), proposing state {}",
            amt,
            peer_idx,
            chan_idx,
            chan.state.state_idx + 1
        );
        self.build_rts(&chan)
    }

    fn build_rts(&self, chan: &Channel) -> Result<ChannelMessage, ChannelError> {
        // The proposed state does not exist on disk yet; derive its HAKD
        // pub at an explicit index instead of bumping anything.
        let hakd_pub = self
            .signer
            .their_hakd_pub(chan, chan.state.state_idx + 1)?;
        Ok(ChannelMessage::Rts {
            outpoint: chan.outpoint,
            amount: (-chan.state.delta) as u32,
            hakd_pub,
        })
    }

    // =========================================================================
    // Resume
    // =========================================================================

    /// What to send after a reconnect, as a pure function of the record.
    /// Returns None only when the channel is fresh and Clean.
    pub fn send_next_msg(
        &mut self,
        peer_idx: u32,
        chan_idx: u32,
    ) -> Result<Option<ChannelMessage>, ChannelError> {
        let chan = self.store.get_channel_by_idx(peer_idx, chan_idx)?;

        if chan.closed {
            return Err(ChannelError::ChannelClosed);
        }
        if chan.broken {
            return Err(ChannelError::ChannelBroken);
        }

        match chan.state.engine_state()? {
            EngineState::Clean => {
                if chan.state.state_idx == 0 {
                    return Ok(None);
                }
                // Re-revoke the already revoked state; the peer drops it.
                Ok(Some(self.build_rev(&chan)?))
            }
            EngineState::RtsSent => Ok(Some(self.build_rts(&chan)?)),
            EngineState::AckSigSent => Ok(Some(self.build_acksig(&chan)?)),
            EngineState::SigRevOwed => Ok(Some(self.build_sigrev(&chan)?)),
        }
    }

    // =========================================================================
    // Break Path
    // =========================================================================

    /// Unilateral close: sign the last fully committed state and mark the
    /// channel closed. Works in any engine state, broken included; the
    /// output script gives the counterparty the punishment branch if we
    /// ever broadcast something they have revoked.
    pub fn break_channel(
        &mut self,
        peer_idx: u32,
        chan_idx: u32,
    ) -> Result<SignedCommitment, ChannelError> {
        let mut chan = self.store.get_channel_by_idx(peer_idx, chan_idx)?;

        if chan.closed {
            return Err(ChannelError::ChannelClosed);
        }

        let tx = self.signer.sign_break_tx(&chan)?;

        chan.closed = true;
        self.store.save_channel_state(&chan)?;

        warn!(
            "breaking ({},{}) at state {}, txid {}",
            peer_idx,
            chan_idx,
            tx.tx.state_idx,
            hex::encode(&tx.tx.txid()[..8])
        );
        Ok(tx)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::fund::{mirror_pair, FundingParams};
    use crate::channels::state::OutPoint;
    use crate::signer::WalletSigner;
    use crate::storage::SledStore;
    use crate::wallet::Wallet;

    struct TestNode {
        engine: UpdateEngine<SledStore, WalletSigner>,
        id: PubKey,
    }

    fn outpoint() -> OutPoint {
        OutPoint { txid: [0xAB; 32], vout: 0 }
    }

    /// Two nodes sharing a freshly funded 1M sat channel, 500k each.
    fn make_pair() -> (TestNode, TestNode) {
        let wa = Wallet::new().unwrap();
        let wb = Wallet::new().unwrap();

        let store_a = SledStore::open_temporary().unwrap();
        let store_b = SledStore::open_temporary().unwrap();
        let pa = store_a.register_peer(&wb.id_pub()).unwrap();
        let pb = store_b.register_peer(&wa.id_pub()).unwrap();

        let (chan_a, chan_b) = mirror_pair(
            &wa,
            &wb,
            pa,
            pb,
            1,
            &FundingParams {
                outpoint: outpoint(),
                capacity: 1_000_000,
                amt_a: 500_000,
                csv_delay: 144,
            },
        )
        .unwrap();
        store_a.create_channel(&chan_a).unwrap();
        store_b.create_channel(&chan_b).unwrap();

        (
            TestNode {
                id: wa.id_pub(),
                engine: UpdateEngine::new(store_a, WalletSigner::new(wa)),
            },
            TestNode {
                id: wb.id_pub(),
                engine: UpdateEngine::new(store_b, WalletSigner::new(wb)),
            },
        )
    }

    fn chan_of(node: &TestNode) -> Channel {
        node.engine.store().get_channel_by_idx(1, 1).unwrap()
    }

    /// Deliver messages back and forth until the exchange goes quiet.
    fn pump(a: &mut TestNode, b: &mut TestNode, first: ChannelMessage) {
        let mut msg = Some(first);
        let mut from_a = true;
        while let Some(m) = msg.take() {
            msg = if from_a {
                b.engine.handle_message(&a.id, &m).unwrap()
            } else {
                a.engine.handle_message(&b.id, &m).unwrap()
            };
            from_a = !from_a;
        }
    }

    fn push_round(a: &mut TestNode, b: &mut TestNode, amount: u32) {
        let rts = a.engine.push_channel(&b.id, 1, amount).unwrap();
        pump(a, b, rts);
    }

    #[test]
    fn test_single_push_clean() {
        let (mut a, mut b) = make_pair();
        push_round(&mut a, &mut b, 50_000);

        let ca = chan_of(&a);
        let cb = chan_of(&b);
        assert_eq!(ca.state.my_amt, 450_000);
        assert_eq!(cb.state.my_amt, 550_000);
        assert_eq!(ca.state.state_idx, 1);
        assert_eq!(cb.state.state_idx, 1);
        assert_eq!(ca.state.engine_state().unwrap(), EngineState::Clean);
        assert_eq!(cb.state.engine_state().unwrap(), EngineState::Clean);

        // Both sides hold the revocation of the other's state 0.
        assert_eq!(ca.elk_recv.up_to(), Some(0));
        assert_eq!(cb.elk_recv.up_to(), Some(0));
        // And a counterparty signature covering the new state.
        assert_eq!(ca.state.their_sig_idx, 1);
        assert_eq!(cb.state.their_sig_idx, 1);
    }

    #[test]
    fn test_push_back() {
        let (mut a, mut b) = make_pair();
        push_round(&mut a, &mut b, 50_000);

        let rts = b.engine.push_channel(&a.id, 1, 30_000).unwrap();
        pump(&mut b, &mut a, rts);

        let ca = chan_of(&a);
        let cb = chan_of(&b);
        assert_eq!(ca.state.my_amt, 480_000);
        assert_eq!(cb.state.my_amt, 520_000);
        assert_eq!(ca.state.state_idx, 2);
        assert_eq!(cb.state.state_idx, 2);
        assert_eq!(ca.state.my_amt + cb.state.my_amt, 1_000_000);
    }

    #[test]
    fn test_many_rounds_conserve_capacity() {
        let (mut a, mut b) = make_pair();
        for i in 0..6u32 {
            if i % 2 == 0 {
                push_round(&mut a, &mut b, 20_000 + i * 1_000);
            } else {
                let rts = b.engine.push_channel(&a.id, 1, 15_000).unwrap();
                pump(&mut b, &mut a, rts);
            }
        }
        let ca = chan_of(&a);
        let cb = chan_of(&b);
        assert_eq!(ca.state.my_amt + cb.state.my_amt, 1_000_000);
        assert_eq!(ca.state.state_idx, 6);
        assert_eq!(cb.state.state_idx, 6);
    }

    #[test]
    fn test_push_to_exact_reserve_boundary() {
        let (mut a, mut b) = make_pair();
        // Leaves us at exactly the reserve floor.
        push_round(&mut a, &mut b, 490_000);
        assert_eq!(chan_of(&a).state.my_amt, 10_000);
        assert_eq!(chan_of(&b).state.my_amt, 990_000);
    }

    #[test]
    fn test_push_below_reserve_rejected() {
        let (mut a, b) = make_pair();
        // One satoshi past the floor.
        assert!(matches!(
            a.engine.push_channel(&b.id, 1, 490_001),
            Err(ChannelError::ReserveViolation { .. })
        ));
        // Nothing persisted.
        assert_eq!(chan_of(&a).state.engine_state().unwrap(), EngineState::Clean);
    }

    #[test]
    fn test_push_amount_bounds() {
        let (mut a, b) = make_pair();
        assert!(matches!(
            a.engine.push_channel(&b.id, 1, 0),
            Err(ChannelError::BadAmount(0))
        ));
        assert!(matches!(
            a.engine.push_channel(&b.id, 1, MAX_PUSH + 1),
            Err(ChannelError::BadAmount(_))
        ));
    }

    #[test]
    fn test_concurrent_push_rejected() {
        let (mut a, b) = make_pair();
        let _rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        assert!(matches!(
            a.engine.push_channel(&b.id, 1, 10_000),
            Err(ChannelError::UpdateInProgress)
        ));
    }

    #[test]
    fn test_rts_zero_amount_rejected() {
        let (a, mut b) = make_pair();
        let hakd_pub = chan_of(&a).state.my_hakd_pub;
        let msg = ChannelMessage::Rts { outpoint: outpoint(), amount: 0, hakd_pub };
        assert!(matches!(
            b.engine.handle_message(&a.id, &msg),
            Err(ChannelError::BadAmount(0))
        ));
        // Receiver record untouched.
        let cb = chan_of(&b);
        assert_eq!(cb.state.state_idx, 0);
        assert_eq!(cb.state.engine_state().unwrap(), EngineState::Clean);
    }

    #[test]
    fn test_rts_overdraw_rejected() {
        let (a, mut b) = make_pair();
        let hakd_pub = chan_of(&a).state.my_hakd_pub;
        // Would leave the initiator below reserve from the receiver's view.
        let msg = ChannelMessage::Rts {
            outpoint: outpoint(),
            amount: 490_001,
            hakd_pub,
        };
        assert!(matches!(
            b.engine.handle_message(&a.id, &msg),
            Err(ChannelError::ReserveViolation { .. })
        ));
        assert_eq!(chan_of(&b).state.state_idx, 0);
    }

    #[test]
    fn test_rts_bad_pubkey_rejected() {
        let (a, mut b) = make_pair();
        let msg = ChannelMessage::Rts {
            outpoint: outpoint(),
            amount: 50_000,
            hakd_pub: PubKey([0xFF; 33]), // not a curve point
        };
        assert!(matches!(
            b.engine.handle_message(&a.id, &msg),
            Err(ChannelError::BadPubkey)
        ));
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let (a, mut b) = make_pair();
        let stranger = Wallet::new().unwrap().id_pub();
        let hakd_pub = chan_of(&a).state.my_hakd_pub;
        let msg = ChannelMessage::Rts { outpoint: outpoint(), amount: 50_000, hakd_pub };
        assert!(b.engine.handle_message(&stranger, &msg).is_err());
    }

    #[test]
    fn test_duplicate_rev_dropped() {
        let (mut a, mut b) = make_pair();

        // Run a round by hand so the final REV can be replayed.
        let rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        let acksig = b.engine.handle_message(&a.id, &rts).unwrap().unwrap();
        let sigrev = a.engine.handle_message(&b.id, &acksig).unwrap().unwrap();
        let rev = b.engine.handle_message(&a.id, &sigrev).unwrap().unwrap();
        assert!(a.engine.handle_message(&b.id, &rev).unwrap().is_none());

        let before = chan_of(&a);
        // Replay: dropped without error, nothing changes.
        assert!(a.engine.handle_message(&b.id, &rev).unwrap().is_none());
        let after = chan_of(&a);
        assert_eq!(before.state.state_idx, after.state.state_idx);
        assert_eq!(before.elk_recv.up_to(), after.elk_recv.up_to());
    }

    #[test]
    fn test_resume_rts_sent() {
        let (mut a, mut b) = make_pair();
        let rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        // RTS lost in transit; reconnect and resume.
        let resent = a.engine.send_next_msg(1, 1).unwrap().unwrap();
        assert_eq!(resent, rts);
        pump(&mut a, &mut b, resent);
        assert_eq!(chan_of(&a).state.my_amt, 450_000);
        assert_eq!(chan_of(&b).state.my_amt, 550_000);
    }

    #[test]
    fn test_resume_acksig_sent() {
        let (mut a, mut b) = make_pair();
        let rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        let acksig = b.engine.handle_message(&a.id, &rts).unwrap().unwrap();

        // B crashed after persisting but before the ACKSIG got out.
        let resent = b.engine.send_next_msg(1, 1).unwrap().unwrap();
        assert_eq!(resent, acksig);

        // B's record advanced exactly once despite the rebuild.
        let cb = chan_of(&b);
        assert_eq!(cb.state.state_idx, 1);
        assert_eq!(cb.state.my_amt, 550_000);

        pump(&mut b, &mut a, resent);
        assert_eq!(chan_of(&a).state.engine_state().unwrap(), EngineState::Clean);
        assert_eq!(chan_of(&b).state.engine_state().unwrap(), EngineState::Clean);
    }

    #[test]
    fn test_resume_sigrev_owed() {
        let (mut a, mut b) = make_pair();
        let rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        let acksig = b.engine.handle_message(&a.id, &rts).unwrap().unwrap();
        let sigrev = a.engine.handle_message(&b.id, &acksig).unwrap().unwrap();

        // A crashed between persisting the ACKSIG result and sending.
        let resent = a.engine.send_next_msg(1, 1).unwrap().unwrap();
        assert_eq!(resent, sigrev);

        let rev = b.engine.handle_message(&a.id, &resent).unwrap().unwrap();
        assert!(a.engine.handle_message(&b.id, &rev).unwrap().is_none());

        assert_eq!(chan_of(&a).state.my_amt, 450_000);
        assert_eq!(chan_of(&b).state.my_amt, 550_000);
        assert_eq!(chan_of(&a).state.engine_state().unwrap(), EngineState::Clean);
    }

    #[test]
    fn test_duplicate_rts_answered_idempotently() {
        let (mut a, mut b) = make_pair();
        let rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        let acksig1 = b.engine.handle_message(&a.id, &rts).unwrap().unwrap();
        // Initiator resends the same RTS after a reconnect.
        let acksig2 = b.engine.handle_message(&a.id, &rts).unwrap().unwrap();
        assert_eq!(acksig1, acksig2);
        assert_eq!(chan_of(&b).state.state_idx, 1);
        assert_eq!(chan_of(&b).state.my_amt, 550_000);
    }

    #[test]
    fn test_duplicate_sigrev_answers_rev() {
        let (mut a, mut b) = make_pair();
        let rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        let acksig = b.engine.handle_message(&a.id, &rts).unwrap().unwrap();
        let sigrev = a.engine.handle_message(&b.id, &acksig).unwrap().unwrap();
        let rev1 = b.engine.handle_message(&a.id, &sigrev).unwrap().unwrap();
        // The REV never arrived; initiator resends SIGREV.
        let rev2 = b.engine.handle_message(&a.id, &sigrev).unwrap().unwrap();
        assert_eq!(rev1, rev2);
        assert_eq!(chan_of(&b).state.state_idx, 1);
    }

    #[test]
    fn test_resume_clean_rev_is_noop_for_peer() {
        let (mut a, mut b) = make_pair();
        push_round(&mut a, &mut b, 50_000);

        let rev = a.engine.send_next_msg(1, 1).unwrap().unwrap();
        assert!(matches!(rev, ChannelMessage::Revoke { .. }));
        // Peer treats it as a duplicate and drops it.
        assert!(b.engine.handle_message(&a.id, &rev).unwrap().is_none());
        assert_eq!(chan_of(&b).state.state_idx, 1);

        // Fresh channel: nothing to send at all.
        let (mut fresh, _other) = make_pair();
        assert!(fresh.engine.send_next_msg(1, 1).unwrap().is_none());
    }

    #[test]
    fn test_break_clean() {
        let (mut a, mut b) = make_pair();
        push_round(&mut a, &mut b, 50_000);

        let tx = a.engine.break_channel(1, 1).unwrap();
        assert_eq!(tx.tx.state_idx, 1);
        assert_eq!(tx.tx.total_output_value(), 1_000_000);
        assert!(chan_of(&a).closed);

        // Closed channels reject everything further.
        assert!(matches!(
            a.engine.push_channel(&b.id, 1, 1_000),
            Err(ChannelError::ChannelClosed)
        ));
        assert!(matches!(
            a.engine.break_channel(1, 1),
            Err(ChannelError::ChannelClosed)
        ));
    }

    #[test]
    fn test_break_mid_update_signs_committed_state() {
        let (mut a, b) = make_pair();
        // Push proposed but never answered: delta is pending, state 0 is
        // still the last committed one.
        let _rts = a.engine.push_channel(&b.id, 1, 20_000).unwrap();

        let tx = a.engine.break_channel(1, 1).unwrap();
        assert_eq!(tx.tx.state_idx, 0);
        // Our delayed output carries the unpushed 500k.
        assert_eq!(tx.tx.outputs[0].value, 500_000);
    }

    #[test]
    fn test_break_backs_out_unrevoked_inbound_push() {
        let (mut a, mut b) = make_pair();
        let rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        let _acksig = b.engine.handle_message(&a.id, &rts).unwrap().unwrap();

        // B applied the push but holds no signature for the new state yet;
        // a break must publish state 0 with the old amounts.
        let tx = b.engine.break_channel(1, 1).unwrap();
        assert_eq!(tx.tx.state_idx, 0);
        assert_eq!(tx.tx.outputs[0].value, 500_000);
    }

    #[test]
    fn test_closed_channel_rejects_messages() {
        let (mut a, mut b) = make_pair();
        push_round(&mut a, &mut b, 50_000);
        b.engine.break_channel(1, 1).unwrap();

        let hakd_pub = chan_of(&a).state.my_hakd_pub;
        let msg = ChannelMessage::Rts { outpoint: outpoint(), amount: 10_000, hakd_pub };
        assert!(matches!(
            b.engine.handle_message(&a.id, &msg),
            Err(ChannelError::ChannelClosed)
        ));
    }

    #[test]
    fn test_bad_elkrem_breaks_channel_keeps_better_state() {
        let (mut a, mut b) = make_pair();
        push_round(&mut a, &mut b, 50_000);

        // Second round, but the initiator revokes with a corrupt secret.
        let rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        let acksig = b.engine.handle_message(&a.id, &rts).unwrap().unwrap();
        let sigrev = a.engine.handle_message(&b.id, &acksig).unwrap().unwrap();

        let corrupted = match sigrev {
            ChannelMessage::SigRev { outpoint, mut elkrem, sig } => {
                elkrem[0] ^= 0xFF;
                ChannelMessage::SigRev { outpoint, elkrem, sig }
            }
            _ => unreachable!(),
        };

        let err = b.engine.handle_message(&a.id, &corrupted).unwrap_err();
        assert!(err.is_fatal());

        let cb = chan_of(&b);
        assert!(cb.broken);
        // The verified signature was kept: break publishes the newer,
        // more favorable state.
        assert_eq!(cb.state.their_sig_idx, cb.state.state_idx);
        let tx = b.engine.break_channel(1, 1).unwrap();
        assert_eq!(tx.tx.state_idx, 2);
        assert_eq!(tx.tx.outputs[0].value, 600_000);
    }

    #[test]
    fn test_broken_channel_rejects_updates() {
        let (mut a, mut b) = make_pair();
        push_round(&mut a, &mut b, 50_000);

        let rts = a.engine.push_channel(&b.id, 1, 50_000).unwrap();
        let acksig = b.engine.handle_message(&a.id, &rts).unwrap().unwrap();
        let sigrev = a.engine.handle_message(&b.id, &acksig).unwrap().unwrap();
        let corrupted = match sigrev {
            ChannelMessage::SigRev { outpoint, mut elkrem, sig } => {
                elkrem[0] ^= 0xFF;
                ChannelMessage::SigRev { outpoint, elkrem, sig }
            }
            _ => unreachable!(),
        };
        let _ = b.engine.handle_message(&a.id, &corrupted).unwrap_err();

        // Even a now well formed retry bounces.
        let retry = a.engine.send_next_msg(1, 1).unwrap().unwrap();
        assert!(matches!(
            b.engine.handle_message(&a.id, &retry),
            Err(ChannelError::ChannelBroken)
        ));
    }

    #[test]
    fn test_codec_survives_wire_roundtrip_mid_protocol() {
        // Same round, but every message passes through encode/decode.
        let (mut a, mut b) = make_pair();
        let mut msg = Some(a.engine.push_channel(&b.id, 1, 50_000).unwrap());
        let mut from_a = true;
        while let Some(m) = msg.take() {
            let wire = m.encode();
            let decoded = ChannelMessage::decode(&wire).unwrap();
            assert_eq!(decoded, m);
            msg = if from_a {
                b.engine.handle_message(&a.id, &decoded).unwrap()
            } else {
                a.engine.handle_message(&b.id, &decoded).unwrap()
            };
            from_a = !from_a;
        }
        assert_eq!(chan_of(&a).state.my_amt, 450_000);
        assert_eq!(chan_of(&b).state.my_amt, 550_000);
    }
}
