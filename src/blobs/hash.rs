//! The content hash used for blobs.

use std::{fmt, str::FromStr};

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, SeqAccess},
    ser::SerializeTuple,
};
use snafu::{IntoError, Snafu, ensure};

/// The blake3 hash of a blob's bytes.
///
/// Two blobs with identical bytes always have the same hash.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash([u8; 32]);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&DD(self.to_hex())).finish()
    }
}

struct DD<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DD<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Hash {
    /// Calculate the hash of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        blake3::hash(buf.as_ref()).into()
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `Hash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert the hash to a hex string.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// Short form of the hash for logging.
    pub fn fmt_short(&self) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0[..5]);
        text.make_ascii_lowercase();
        text
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(value)
    }
}

impl From<Hash> for [u8; 32] {
    fn from(value: Hash) -> Self {
        value.0
    }
}

impl From<blake3::Hash> for Hash {
    fn from(value: blake3::Hash) -> Self {
        Hash(value.into())
    }
}

impl From<&[u8; 32]> for Hash {
    fn from(value: &[u8; 32]) -> Self {
        Hash(*value)
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        f.write_str(&text)
    }
}

/// Error parsing a [`Hash`] from a string.
#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum HashParseError {
    /// Neither 52 base32 characters nor 64 hex characters.
    #[snafu(display("invalid hash length {len}"))]
    Length { len: usize },
    /// The characters are not valid base32 or hex.
    #[snafu(display("invalid hash encoding"))]
    Encoding { source: data_encoding::DecodeError },
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sb = s.as_bytes();
        let mut res = [0u8; 32];
        if sb.len() == 64 {
            if let Ok(32) = data_encoding::HEXLOWER_PERMISSIVE.decode_mut(sb, &mut res) {
                return Ok(Self(res));
            }
        }
        ensure!(
            sb.len() == 52,
            hash_parse_error::LengthSnafu { len: sb.len() }
        );
        let upper = s.to_ascii_uppercase();
        data_encoding::BASE32_NOPAD
            .decode_mut(upper.as_bytes(), &mut res)
            .map_err(|partial| partial.error)
            .map_err(|source| hash_parse_error::EncodingSnafu.into_error(source))?;
        Ok(Self(res))
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            let mut s = serializer.serialize_tuple(32)?;
            for item in &self.0 {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(32, HashVisitor)
        }
    }
}

struct HashVisitor;

impl<'de> de::Visitor<'de> for HashVisitor {
    type Value = Hash;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of 32 bytes containing hash data")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut arr = [0u8; 32];
        for (i, byte) in arr.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Hash(arr))
    }
}

/// A format identifier
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Default,
    Debug,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum BlobFormat {
    /// Raw blob
    #[default]
    Raw,
    /// A sequence of hashes, each referring to another blob.
    HashSeq,
}

impl BlobFormat {
    /// Is raw format
    pub const fn is_raw(&self) -> bool {
        matches!(self, BlobFormat::Raw)
    }

    /// Is hash seq format
    pub const fn is_hash_seq(&self) -> bool {
        matches!(self, BlobFormat::HashSeq)
    }
}

/// A hash and format pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashAndFormat {
    /// The hash
    pub hash: Hash,
    /// The format
    pub format: BlobFormat,
}

impl HashAndFormat {
    /// Create a new hash and format pair, using the default (raw) format.
    pub fn raw(hash: Hash) -> Self {
        Self {
            hash,
            format: BlobFormat::Raw,
        }
    }

    /// Create a new hash and format pair, using the collection format.
    pub fn hash_seq(hash: Hash) -> Self {
        Self {
            hash,
            format: BlobFormat::HashSeq,
        }
    }
}

impl From<Hash> for HashAndFormat {
    fn from(hash: Hash) -> Self {
        Self::raw(hash)
    }
}

impl fmt::Display for HashAndFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format {
            BlobFormat::Raw => write!(f, "{}", self.hash.to_hex()),
            BlobFormat::HashSeq => write!(f, "s{}", self.hash.to_hex()),
        }
    }
}

/// Parses the content of a [`BlobFormat::HashSeq`] blob.
pub fn parse_hash_seq(data: &[u8]) -> Option<Vec<Hash>> {
    if data.len() % 32 != 0 {
        return None;
    }
    let hashes = data
        .chunks_exact(32)
        .map(|chunk| {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(chunk);
            Hash(bytes)
        })
        .collect();
    Some(hashes)
}

/// Encodes hashes as the content of a [`BlobFormat::HashSeq`] blob.
pub fn encode_hash_seq(hashes: impl IntoIterator<Item = Hash>) -> bytes::Bytes {
    hashes
        .into_iter()
        .flat_map(|hash| hash.0)
        .collect::<Vec<u8>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_display_roundtrip() {
        let hash = Hash::new(b"hello");
        let text = hash.to_string();
        assert_eq!(text.len(), 52);
        assert_eq!(text.parse::<Hash>().unwrap(), hash);
        assert_eq!(hash.to_hex().parse::<Hash>().unwrap(), hash);
        assert!("abc".parse::<Hash>().is_err());
    }

    #[test]
    fn hash_serde() {
        let hash = Hash::new(b"hello");
        let bytes = postcard::to_stdvec(&hash).unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(postcard::from_bytes::<Hash>(&bytes).unwrap(), hash);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        assert_eq!(serde_json::from_str::<Hash>(&json).unwrap(), hash);
    }

    #[test]
    fn distinct_content_distinct_hash() {
        assert_ne!(Hash::new(b"a"), Hash::new(b"b"));
        assert_ne!(Hash::new(b""), Hash::new([0u8]));
    }

    #[test]
    fn hash_seq_roundtrip() {
        let hashes = vec![Hash::new(b"a"), Hash::new(b"b")];
        let data = encode_hash_seq(hashes.clone());
        assert_eq!(data.len(), 64);
        assert_eq!(parse_hash_seq(&data).unwrap(), hashes);
        assert!(parse_hash_seq(&data[..40]).is_none());
    }

    #[test]
    fn format_from_str() {
        assert_eq!("hash_seq".parse::<BlobFormat>().unwrap(), BlobFormat::HashSeq);
        assert_eq!(BlobFormat::Raw.to_string(), "raw");
    }
}
