// =============================================================================
// ZAPLINE v0.4 - Elkrem Hash Trees
// =============================================================================
//
// Revocation secrets are leaves of a deterministic binary hash tree. The
// sender keeps only the root and re-derives any node on demand; the receiver
// keeps at most one node per tree level and can re-derive every secret it
// has ever been handed.
//
// Nodes are numbered post-order, so secrets are revealed children-first:
//
//              6
//          ┌───┴───┐
//          2       5
//        ┌─┴─┐   ┌─┴─┐
//        0   1   3   4
//
// A parent hashes down to its children (left = H(parent),
// right = H(parent || 0x01)), which is what lets the receiver verify each
// incoming parent against the two nodes it replaces.
//
// =============================================================================

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Height of the full tree. 2^48 states is enough for any channel.
pub const MAX_HEIGHT: u8 = 47;

/// Post-order index of the root node.
pub const MAX_INDEX: u64 = (1 << 48) - 2;

// =============================================================================
// Elkrem Error
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ElkremError {
    /// Index outside the tree, or descent did not land on the target.
    OutOfRange(u64),
    /// An ingested hash does not reproduce the nodes it claims to cover.
    Inconsistent(u64),
    /// Every index has been used.
    TreeExhausted,
    /// The receiver has never been given a node covering this index.
    NotCovered(u64),
}

impl std::fmt::Display for ElkremError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElkremError::OutOfRange(i) => write!(f, "elkrem index {} out of range", i),
            ElkremError::Inconsistent(i) => {
                write!(f, "elkrem hash at index {} inconsistent with prior nodes", i)
            }
            ElkremError::TreeExhausted => write!(f, "elkrem tree exhausted"),
            ElkremError::NotCovered(i) => write!(f, "elkrem index {} not yet received", i),
        }
    }
}

impl std::error::Error for ElkremError {}

// =============================================================================
// Node Hashing
// =============================================================================

fn left_sha(parent: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(parent);
    hasher.finalize().into()
}

fn right_sha(parent: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(parent);
    hasher.update([0x01]);
    hasher.finalize().into()
}

/// Walk from node `i` (height `h`, hash `sha`) down to node `w`.
/// Left subtree indices come first, so the left child of `i` is
/// `i - 2^h` and the right child is `i - 1`.
fn descend(w: u64, mut i: u64, mut h: u8, mut sha: [u8; 32]) -> Result<[u8; 32], ElkremError> {
    while w < i {
        if h == 0 {
            return Err(ElkremError::OutOfRange(w));
        }
        if w <= i - (1u64 << h) {
            sha = left_sha(&sha);
            i -= 1u64 << h;
        } else {
            sha = right_sha(&sha);
            i -= 1;
        }
        h -= 1;
    }
    if w == i {
        Ok(sha)
    } else {
        Err(ElkremError::OutOfRange(w))
    }
}

// =============================================================================
// Sender
// =============================================================================

/// Emits revocation secrets for our own past states. Stateless apart from
/// the root, so re-sending any index is always possible.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElkremSender {
    root: [u8; 32],
}

impl ElkremSender {
    pub fn new(root: [u8; 32]) -> Self {
        ElkremSender { root }
    }

    /// Secret for state index `w`.
    pub fn at_index(&self, w: u64) -> Result<[u8; 32], ElkremError> {
        if w > MAX_INDEX {
            return Err(ElkremError::OutOfRange(w));
        }
        descend(w, MAX_INDEX, MAX_HEIGHT, self.root)
    }
}

// =============================================================================
// Receiver
// =============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ElkremNode {
    sha: [u8; 32],
    h: u8,
    i: u64,
}

/// Ingests the counterparty's revocation secrets in order, keeping one node
/// per level. When a parent arrives it must hash down to the two nodes it
/// replaces; anything else means the counterparty is feeding us garbage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ElkremReceiver {
    stack: Vec<ElkremNode>,
}

impl ElkremReceiver {
    pub fn new() -> Self {
        ElkremReceiver { stack: Vec::new() }
    }

    /// Index of the most recently ingested node, if any.
    pub fn up_to(&self) -> Option<u64> {
        self.stack.last().map(|n| n.i)
    }

    /// Accept the next secret in post-order sequence.
    pub fn ingest(&mut self, sha: [u8; 32]) -> Result<(), ElkremError> {
        let mut node = ElkremNode { sha, h: 0, i: 0 };
        if let Some(top) = self.stack.last() {
            node.i = top.i + 1;
        }
        if node.i > MAX_INDEX {
            return Err(ElkremError::TreeExhausted);
        }

        let t = self.stack.len();
        if t >= 2 && self.stack[t - 1].h == self.stack[t - 2].h {
            // Incoming node is the parent of the top two; verify both.
            node.h = self.stack[t - 1].h + 1;
            if left_sha(&node.sha) != self.stack[t - 2].sha {
                return Err(ElkremError::Inconsistent(node.i));
            }
            if right_sha(&node.sha) != self.stack[t - 1].sha {
                return Err(ElkremError::Inconsistent(node.i));
            }
            self.stack.truncate(t - 2);
        }

        self.stack.push(node);
        Ok(())
    }

    /// Re-derive any previously covered secret.
    pub fn at_index(&self, w: u64) -> Result<[u8; 32], ElkremError> {
        for n in &self.stack {
            let span = (1u64 << (n.h + 1)) - 2;
            let lo = n.i - span;
            if w >= lo && w <= n.i {
                return descend(w, n.i, n.h, n.sha);
            }
        }
        Err(ElkremError::NotCovered(w))
    }
}

// =============================================================================
// Tests
// =============================================================================
