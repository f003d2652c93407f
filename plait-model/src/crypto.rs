//! Centralized cryptographic operations for Plait.
//!
//! **All** Ed25519 signing, verification, BLAKE3 hashing, and identifier
//! derivation should go through this module. This provides a single audit
//! surface for cryptographic correctness.
//!
//! # Primitives
//!
//! | Primitive   | Algorithm       | Purpose                                      |
//! |-------------|-----------------|----------------------------------------------|
//! | Hash        | BLAKE3 (32 B)   | Event/block/frame digests, DAG linkage       |
//! | Signature   | Ed25519 (64 B)  | Event signing, block signing                 |
//! | Identity    | Ed25519 keypair | Participant identity, stable integer ID      |

use crate::types::{Hash, PubKey, Signature};

/// Domain string for deriving participant IDs from public keys.
const PARTICIPANT_ID_DOMAIN: &str = "plait.participant.id";

/// Domain string for deriving the synthetic self-parent hash of a root.
const ROOT_SELF_PARENT_DOMAIN: &str = "plait.root.self-parent";

// ---------------------------------------------------------------------------
// Content hashing (BLAKE3)
// ---------------------------------------------------------------------------

/// Compute the BLAKE3 content hash of arbitrary bytes.
///
/// Used for: event body hashing, block body hashing, frame digests, and any
/// other content-addressed lookups.
#[inline]
pub fn content_hash(data: &[u8]) -> Hash {
    Hash(*blake3::hash(data).as_bytes())
}

// ---------------------------------------------------------------------------
// Ed25519 signing
// ---------------------------------------------------------------------------

/// Sign a BLAKE3 content hash with an Ed25519 signing key.
///
/// This is the canonical signing pattern in Plait: compute `blake3(content)`,
/// then sign the 32-byte digest. Both events and blocks use this.
pub fn sign_hash(signing_key: &ed25519_dalek::SigningKey, hash: &Hash) -> Signature {
    use ed25519_dalek::Signer;
    let sig = signing_key.sign(hash.as_bytes());
    Signature(sig.to_bytes())
}

/// The public key of a signing key, as a `PubKey`.
pub fn public_key(signing_key: &ed25519_dalek::SigningKey) -> PubKey {
    PubKey(signing_key.verifying_key().to_bytes())
}

/// Generate a fresh Ed25519 keypair from the OS RNG.
pub fn generate_key() -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng)
}

// ---------------------------------------------------------------------------
// Ed25519 verification
// ---------------------------------------------------------------------------

/// Verify an Ed25519 signature over a BLAKE3 content hash (strict).
///
/// Uses `verify_strict()` (rejects small-order keys, checks canonical S).
/// Events and block signatures both go through here.
pub fn verify_hash(pubkey: &PubKey, hash: &Hash, signature: &Signature) -> Result<(), CryptoError> {
    let vk = verifying_key(pubkey)?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    vk.verify_strict(hash.as_bytes(), &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Deserialize a `PubKey` into an Ed25519 `VerifyingKey`.
///
/// Fails if the 32 bytes are not a valid curve point.
pub fn verifying_key(pubkey: &PubKey) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
    ed25519_dalek::VerifyingKey::from_bytes(&pubkey.0).map_err(|_| CryptoError::InvalidPublicKey)
}

// ---------------------------------------------------------------------------
// Identifier derivation
// ---------------------------------------------------------------------------

/// Derive a participant's stable integer ID from its public key.
///
/// The ID is the first 4 bytes (little-endian) of a domain-separated BLAKE3
/// digest of the key, widened to `i64`. Anyone holding the key can derive it.
pub fn participant_id(pubkey: &PubKey) -> i64 {
    let mut hasher = blake3::Hasher::new_derive_key(PARTICIPANT_ID_DOMAIN);
    hasher.update(pubkey.as_bytes());
    let digest = hasher.finalize();
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&digest.as_bytes()[..4]);
    u32::from_le_bytes(buf) as i64
}

/// Synthetic self-parent hash for a participant's root.
///
/// Events whose self-parent equals this hash are the first events of the
/// participant in the current incarnation of the DAG.
pub fn root_self_parent(participant_id: i64) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(ROOT_SELF_PARENT_DOMAIN);
    hasher.update(&participant_id.to_le_bytes());
    Hash(*hasher.finalize().as_bytes())
}

// ---------------------------------------------------------------------------
// Coin flips
// ---------------------------------------------------------------------------

/// Deterministic pseudo-coin used by fame voting in coin rounds: the middle
/// byte of the hash, mapped to a boolean. Breaks meta-stable voting regions
/// without any exchange of randomness.
pub fn middle_bit(hash: &Hash) -> bool {
    hash.as_bytes()[hash.as_bytes().len() / 2] != 0
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid Ed25519 public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
}
