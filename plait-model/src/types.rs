//! Fixed-width byte newtypes.
//!
//! `Hash`, `PubKey`, and `Signature` wrap the raw arrays that flow through
//! the engine. The wrappers keep digests out of key slots at compile time,
//! carry the Borsh encoding used everywhere content is hashed, and render
//! as `0x`-prefixed lowercase hex, the canonical key form.

use std::fmt;

macro_rules! byte_newtype {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            borsh::BorshSerialize,
            borsh::BorshDeserialize,
        )]
        #[repr(transparent)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            /// The all-zero value, used as a "nothing here yet" sentinel.
            pub const ZERO: $name = $name([0u8; $len]);

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        // Fallible parse from dynamically-sized storage keys and wire bytes.
        impl TryFrom<&[u8]> for $name {
            type Error = std::array::TryFromSliceError;

            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                <[u8; $len]>::try_from(slice).map($name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

byte_newtype!(Hash, 32, "BLAKE3 digest of an event body, block body, or frame.");
byte_newtype!(PubKey, 32, "Ed25519 verifying key identifying a participant.");
byte_newtype!(Signature, 64, "Ed25519 signature, R ‖ S.");

impl Default for Hash {
    fn default() -> Self {
        Hash::ZERO
    }
}

impl Signature {
    /// The R half of the signature. Ed25519 signing is deterministic, so
    /// this doubles as a stable sort key when Lamport timestamps tie.
    pub fn r_component(&self) -> [u8; 32] {
        let mut r = [0u8; 32];
        r.copy_from_slice(&self.0[..32]);
        r
    }
}
