//! Keypairs and identifiers.
//!
//! All identifiers are base58-encoded 32-byte ed25519 public keys. A
//! [`DocId`] has the same form as an [`ActorId`]: the root actor of a
//! document is the actor whose id equals the document id.

use std::{fmt, str::FromStr};

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Signing keypair backing one feed (or the repo identity).
///
/// The secret key may be absent on other nodes; holders of the secret can
/// append to the feed.
#[derive(Clone, Serialize, Deserialize)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Create a new [`Keypair`] with a random key.
    pub fn generate<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        Keypair { signing_key }
    }

    /// Create a [`Keypair`] from the secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Keypair {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Returns the secret key byte representation.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The public key of this keypair, as an [`ActorId`].
    pub fn public(&self) -> ActorId {
        ActorId(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message with this keypair.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.public())
    }
}

macro_rules! id_type {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name([u8; 32]);

        impl $name {
            /// Get the byte representation of this id.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Create from a byte array.
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                $name(bytes)
            }

            /// The first characters of the base58 representation, for logging.
            pub fn fmt_short(&self) -> String {
                let mut text = base58::fmt(self.0);
                text.truncate(10);
                text
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", base58::fmt(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.fmt_short())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(base58::parse_array(s)?))
            }
        }
    };
}

id_type!(
    /// Identifier of one actor: the public key of the feed keypair.
    ActorId
);
id_type!(
    /// Identifier of a document: the public key of its root actor.
    DocId
);
id_type!(
    /// Identifier of a connected peer: the public key of its repo identity.
    PeerId
);
id_type!(
    /// Swarm rendezvous topic: the hash of an actor public key.
    DiscoveryId
);

impl ActorId {
    /// Verify a signature made by the keypair behind this id.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        VerifyingKey::from_bytes(&self.0)?.verify_strict(msg, signature)
    }

    /// The discovery topic for this actor's feed.
    pub fn discovery(&self) -> DiscoveryId {
        DiscoveryId(*blake3::hash(&self.0).as_bytes())
    }
}

impl DocId {
    /// The root actor of this document carries the same public key.
    pub fn root_actor(&self) -> ActorId {
        ActorId(self.0)
    }
}

impl From<ActorId> for DocId {
    fn from(value: ActorId) -> Self {
        DocId(value.0)
    }
}

impl From<DocId> for ActorId {
    fn from(value: DocId) -> Self {
        ActorId(value.0)
    }
}

impl From<Keypair> for ActorId {
    fn from(value: Keypair) -> Self {
        value.public()
    }
}

/// Utilities for working with byte array identifiers.
mod base58 {
    /// Convert to a base58 string.
    pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
        bs58::encode(bytes.as_ref()).into_string()
    }

    /// Parse from a base58 string into a byte array.
    pub fn parse_array<const N: usize>(input: &str) -> anyhow::Result<[u8; N]> {
        bs58::decode(input)
            .into_vec()?
            .try_into()
            .map_err(|_| anyhow::anyhow!("failed to parse: invalid byte length"))
    }
}
