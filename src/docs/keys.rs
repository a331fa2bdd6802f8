//! Keys used for documents.
//!
//! An [`Author`] signs the entries it writes. A [`NamespaceSecret`] is the write capability
//! for a document; its public half, the [`NamespaceId`], identifies the document.

use std::{fmt, str::FromStr};

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use snafu::{IntoError, Snafu};

/// Author key to insert entries into a document.
///
/// Internally, an author is a [`SigningKey`] which is used to sign entries.
#[derive(Clone, Serialize, Deserialize)]
pub struct Author {
    signing_key: SigningKey,
}

impl Author {
    /// Create a new [`Author`] with a random key.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        Author { signing_key }
    }

    /// Create an [`Author`] from a byte array.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningKey::from_bytes(bytes).into()
    }

    /// Returns the [`Author`] byte representation.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the [`AuthorId`] for this author.
    pub fn id(&self) -> AuthorId {
        AuthorId(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message with this [`Author`] key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

/// Namespace key of a document.
///
/// Holders of this key can insert new entries into the document.
#[derive(Clone, Serialize, Deserialize)]
pub struct NamespaceSecret {
    signing_key: SigningKey,
}

impl NamespaceSecret {
    /// Create a new [`NamespaceSecret`] with a random key.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        NamespaceSecret { signing_key }
    }

    /// Create a [`NamespaceSecret`] from a byte array.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningKey::from_bytes(bytes).into()
    }

    /// Returns the [`NamespaceSecret`] byte representation.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the [`NamespaceId`] for this namespace.
    pub fn id(&self) -> NamespaceId {
        NamespaceId(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message with this [`NamespaceSecret`] key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

impl PartialEq for NamespaceSecret {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for NamespaceSecret {}

impl From<SigningKey> for Author {
    fn from(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
}

impl From<SigningKey> for NamespaceSecret {
    fn from(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
}

/// Identifier of a document: the public key of its [`NamespaceSecret`].
#[derive(
    Default,
    Clone,
    Copy,
    PartialOrd,
    Ord,
    Eq,
    PartialEq,
    Hash,
    derive_more::From,
    derive_more::Into,
    Serialize,
    Deserialize,
)]
pub struct NamespaceId([u8; 32]);

/// Identifier of an [`Author`]: its public key.
///
/// Distinct from the network identity of a node. The same author may write from several
/// nodes and one node may hold several authors.
#[derive(
    Default,
    Clone,
    Copy,
    PartialOrd,
    Ord,
    Eq,
    PartialEq,
    Hash,
    derive_more::From,
    derive_more::Into,
    Serialize,
    Deserialize,
)]
pub struct AuthorId([u8; 32]);

macro_rules! impl_public_id {
    ($ty:ident, $name:literal) => {
        impl $ty {
            /// Convert to byte array.
            pub fn to_bytes(&self) -> [u8; 32] {
                self.0
            }

            /// Convert to byte slice.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Strictly verify a signature on a message.
            ///
            /// Fails if the bytes are not a valid curve point or the signature does not match.
            pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
                VerifyingKey::from_bytes(&self.0)?.verify_strict(msg, signature)
            }

            /// Short form for logging.
            pub fn fmt_short(&self) -> String {
                base32::fmt_short(self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", base32::fmt(self.0))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($name, "({})"), self.fmt_short())
            }
        }

        impl FromStr for $ty {
            type Err = KeyParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(base32::parse_array(s)?))
            }
        }

        impl AsRef<[u8]> for $ty {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

impl_public_id!(NamespaceId, "NamespaceId");
impl_public_id!(AuthorId, "AuthorId");

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", self.id().fmt_short())
    }
}

impl fmt::Debug for NamespaceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespaceSecret({})", self.id().fmt_short())
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.to_bytes()))
    }
}

impl fmt::Display for NamespaceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.to_bytes()))
    }
}

impl FromStr for Author {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&base32::parse_array(s)?))
    }
}

impl FromStr for NamespaceSecret {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&base32::parse_array(s)?))
    }
}

impl From<&Author> for AuthorId {
    fn from(value: &Author) -> Self {
        value.id()
    }
}

impl From<&NamespaceSecret> for NamespaceId {
    fn from(value: &NamespaceSecret) -> Self {
        value.id()
    }
}

/// Error parsing a key from its base32 form.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum KeyParseError {
    /// Not valid base32.
    #[snafu(display("invalid key encoding"))]
    Encoding { source: data_encoding::DecodeError },
    /// Decoded to the wrong number of bytes.
    #[snafu(display("invalid key length {len}"))]
    Length { len: usize },
}

/// The capability held for a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, derive_more::From)]
pub enum Capability {
    /// Write access: holds the namespace secret.
    Write(NamespaceSecret),
    /// Read access: holds the namespace id only.
    Read(NamespaceId),
}

/// The kind of a [`Capability`].
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum CapabilityKind {
    /// A writable document.
    Write = 1,
    /// A readable document.
    Read = 2,
}

impl Capability {
    /// Get the [`NamespaceId`] for this [`Capability`].
    pub fn id(&self) -> NamespaceId {
        match self {
            Capability::Write(secret) => secret.id(),
            Capability::Read(id) => *id,
        }
    }

    /// Get the [`NamespaceSecret`] of this [`Capability`], if it is a write capability.
    pub fn secret_key(&self) -> Option<&NamespaceSecret> {
        match self {
            Capability::Write(secret) => Some(secret),
            Capability::Read(_) => None,
        }
    }

    /// Get the kind of capability.
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::Write(_) => CapabilityKind::Write,
            Capability::Read(_) => CapabilityKind::Read,
        }
    }

    /// Merge this capability with another capability for the same namespace.
    ///
    /// A write capability is never downgraded. Returns `true` if the capability was upgraded.
    /// Returns `false` if the namespaces differ.
    pub fn merge(&mut self, other: Capability) -> bool {
        if other.id() != self.id() {
            return false;
        }
        if matches!(self, Capability::Read(_)) && matches!(other, Capability::Write(_)) {
            *self = other;
            true
        } else {
            false
        }
    }
}

/// Utilities for working with byte array identifiers.
pub(crate) mod base32 {
    use super::{IntoError, KeyParseError, key_parse_error};

    /// Convert to a base32 string
    pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(bytes.as_ref());
        text.make_ascii_lowercase();
        text
    }

    /// Convert to a base32 string limited to the first 10 bytes.
    pub fn fmt_short(bytes: impl AsRef<[u8]>) -> String {
        let len = bytes.as_ref().len().min(10);
        let mut text = data_encoding::BASE32_NOPAD.encode(&bytes.as_ref()[..len]);
        text.make_ascii_lowercase();
        text
    }

    /// Parse from a base32 string into a byte array
    pub fn parse_array<const N: usize>(input: &str) -> Result<[u8; N], KeyParseError> {
        let bytes = data_encoding::BASE32_NOPAD
            .decode(input.to_ascii_uppercase().as_bytes())
            .map_err(|source| key_parse_error::EncodingSnafu.into_error(source))?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| key_parse_error::LengthSnafu { len }.build())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn author_roundtrip_and_sign() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
        let author = Author::new(&mut rng);
        let parsed: Author = author.to_string().parse().unwrap();
        assert_eq!(parsed.id(), author.id());

        let sig = author.sign(b"hello");
        author.id().verify(b"hello", &sig).unwrap();
        assert!(author.id().verify(b"hellO", &sig).is_err());

        let id: AuthorId = author.id().to_string().parse().unwrap();
        assert_eq!(id, author.id());
        assert!("abc".parse::<AuthorId>().is_err());
    }

    #[test]
    fn capability_merge() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        let secret = NamespaceSecret::new(&mut rng);
        let other = NamespaceSecret::new(&mut rng);

        let mut cap = Capability::Read(secret.id());
        assert!(!cap.merge(Capability::Read(secret.id())));
        assert!(!cap.merge(Capability::Write(other)));
        assert_eq!(cap.kind(), CapabilityKind::Read);
        assert!(cap.merge(Capability::Write(secret.clone())));
        assert_eq!(cap.kind(), CapabilityKind::Write);
        assert!(!cap.merge(Capability::Read(secret.id())));
        assert_eq!(cap.secret_key(), Some(&secret));
    }
}
