//! Block: a committed batch of transactions.
//!
//! A block is cut from a decided frame: its transactions are the frame's
//! event payloads in consensus order, and its body records the frame hash so
//! signers commit to the exact cut of the DAG. Signatures accumulate
//! asynchronously through the signature pool; once strictly more than the
//! trust count have been collected the block is eligible to become the
//! anchor block.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::crypto::{self, CryptoError};
use crate::frame::Frame;
use crate::types::{Hash, PubKey, Signature};

/// The signed body of a block. Hashed with `blake3(borsh(self))`; block
/// signatures are over this digest.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockBody {
    pub index: i64,
    pub round_received: i64,
    /// Digest of the frame this block was cut from.
    pub frame_hash: Hash,
    /// Transactions in consensus order.
    pub transactions: Vec<Vec<u8>>,
}

impl BlockBody {
    pub fn hash(&self) -> Hash {
        let bytes = borsh::to_vec(self).expect("borsh serialization cannot fail");
        crypto::content_hash(&bytes)
    }
}

/// A validator's signature over a block body, as gossiped inside events.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockSignature {
    pub validator: PubKey,
    pub index: i64,
    pub signature: Signature,
}

impl BlockSignature {
    pub fn to_wire(&self) -> WireBlockSignature {
        WireBlockSignature {
            index: self.index,
            signature: self.signature,
        }
    }
}

/// Wire form of a block signature. The validator key is omitted: it is
/// always the creator of the carrying event.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WireBlockSignature {
    pub index: i64,
    pub signature: Signature,
}

/// A block plus its accumulated signatures, keyed by validator.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub body: BlockBody,
    pub signatures: BTreeMap<PubKey, Signature>,
}

impl Block {
    pub fn new(index: i64, round_received: i64, frame_hash: Hash, transactions: Vec<Vec<u8>>) -> Self {
        Block {
            body: BlockBody {
                index,
                round_received,
                frame_hash,
                transactions,
            },
            signatures: BTreeMap::new(),
        }
    }

    /// Cut a block from a frame: transactions are collected from the frame's
    /// events in their stored (consensus) order.
    pub fn from_frame(index: i64, frame: &Frame) -> Self {
        let transactions = frame
            .events
            .iter()
            .flat_map(|m| m.body.transactions.iter().cloned())
            .collect();
        Block::new(index, frame.round, frame.hash(), transactions)
    }

    pub fn index(&self) -> i64 {
        self.body.index
    }

    pub fn round_received(&self) -> i64 {
        self.body.round_received
    }

    pub fn frame_hash(&self) -> Hash {
        self.body.frame_hash
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.body.transactions
    }

    /// Sign the block body, producing a signature suitable for gossip.
    pub fn sign(&self, key: &ed25519_dalek::SigningKey) -> BlockSignature {
        BlockSignature {
            validator: crypto::public_key(key),
            index: self.body.index,
            signature: crypto::sign_hash(key, &self.body.hash()),
        }
    }

    /// Verify a signature against this block's body digest.
    ///
    /// Returns `Ok(false)` for a well-formed but invalid signature; `Err`
    /// only when the validator key itself is malformed.
    pub fn verify(&self, sig: &BlockSignature) -> Result<bool, CryptoError> {
        match crypto::verify_hash(&sig.validator, &self.body.hash(), &sig.signature) {
            Ok(()) => Ok(true),
            Err(CryptoError::InvalidSignature) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Attach a signature. Re-attaching from the same validator overwrites.
    pub fn set_signature(&mut self, sig: BlockSignature) {
        self.signatures.insert(sig.validator, sig.signature);
    }

    pub fn get_signature(&self, validator: &PubKey) -> Option<BlockSignature> {
        self.signatures.get(validator).map(|s| BlockSignature {
            validator: *validator,
            index: self.body.index,
            signature: *s,
        })
    }

    pub fn block_signatures(&self) -> Vec<BlockSignature> {
        self.signatures
            .iter()
            .map(|(validator, signature)| BlockSignature {
                validator: *validator,
                index: self.body.index,
                signature: *signature,
            })
            .collect()
    }
}
