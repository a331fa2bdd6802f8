//! Verified streaming over blob content.
//!
//! A blob's [`Hash`] is the root of the blake3 tree over its bytes. The [`Outboard`] keeps
//! the interior nodes of that tree down to groups of [`CHUNK_SIZE`] bytes. With it a
//! provider can send any run of chunks together with the parent hashes that prove them,
//! and a getter checks every chunk against the root before the rest of the blob arrives.

use std::io::{self, Read};

use bao_tree::{
    blake3,
    io::{
        outboard::PostOrderMemOutboard,
        sync::{encode_ranges_validated, outboard_post_order, DecodeResponseIter, ReadAt, Size},
        BaoContentItem, Leaf,
    },
    BaoTree, BlockSize, ChunkNum, ChunkRanges,
};
use bytes::Bytes;

use super::Hash;
use crate::error::{Error, Result};

/// Size of a chunk in bytes. The last chunk of a blob may be shorter.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// 2^4 blake3 chunks of 1 KiB per leaf group.
const BLOCK_SIZE: BlockSize = BlockSize::from_chunk_log(4);

const BLAKE3_CHUNKS_PER_CHUNK: u64 = (CHUNK_SIZE / 1024) as u64;

/// Number of chunks for a blob of `size` bytes. The empty blob has a single empty chunk.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64).max(1)
}

/// Expected length of chunk `index` in a blob of `size` bytes.
pub fn chunk_len(size: u64, index: u64) -> usize {
    let start = index * CHUNK_SIZE as u64;
    size.saturating_sub(start).min(CHUNK_SIZE as u64) as usize
}

/// Chunks `start..end` as blake3 chunk ranges.
fn chunk_ranges(start: u64, end: u64) -> ChunkRanges {
    ChunkRanges::from(
        ChunkNum(start * BLAKE3_CHUNKS_PER_CHUNK)..ChunkNum(end * BLAKE3_CHUNKS_PER_CHUNK),
    )
}

fn to_blake3(hash: Hash) -> blake3::Hash {
    blake3::Hash::from(*hash.as_bytes())
}

/// The interior hashes of a blob's tree, together with its size.
#[derive(Debug, Clone)]
pub struct Outboard {
    size: u64,
    inner: PostOrderMemOutboard,
}

impl Outboard {
    /// Computes the outboard of a complete blob.
    pub fn compute(data: &[u8]) -> Self {
        Self {
            size: data.len() as u64,
            inner: PostOrderMemOutboard::create(data, BLOCK_SIZE),
        }
    }

    /// Computes the outboard of `size` bytes read from `reader`, without holding them in
    /// memory.
    pub fn from_reader(reader: impl Read, size: u64) -> io::Result<Self> {
        let tree = BaoTree::new(size, BLOCK_SIZE);
        let mut data = Vec::new();
        let root = outboard_post_order(reader, tree, &mut data)?;
        Ok(Self {
            size,
            inner: PostOrderMemOutboard { root, tree, data },
        })
    }

    /// The root hash.
    pub fn root(&self) -> Hash {
        Hash::from(*self.inner.root.as_bytes())
    }

    /// Size of the blob in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of chunks.
    pub fn chunks(&self) -> u64 {
        chunk_count(self.size)
    }

    /// Checks that `data` is the whole blob.
    pub fn verify(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.size
            && encode_ranges_validated(data, &self.inner, &ChunkRanges::all(), io::sink()).is_ok()
    }

    /// Encodes chunks `start..end` of `data` with the parent hashes needed to verify them.
    ///
    /// Fails if `data` does not match the outboard.
    pub fn encode(&self, data: impl ReadAt + Size, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut encoded = Vec::new();
        encode_ranges_validated(data, &self.inner, &chunk_ranges(start, end), &mut encoded)
            .map_err(|err| Error::storage(err))?;
        Ok(encoded)
    }

    /// Serializes to bytes for storage next to the blob data.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.inner.data.len());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.inner.data);
        out
    }

    /// Parses bytes produced by [`Self::to_bytes`] for the blob `hash`.
    pub fn from_bytes(hash: Hash, bytes: &[u8]) -> Option<Self> {
        let (size, rest) = bytes.split_first_chunk::<8>()?;
        let size = u64::from_le_bytes(*size);
        let tree = BaoTree::new(size, BLOCK_SIZE);
        if rest.len() as u64 != tree.outboard_size() {
            return None;
        }
        Some(Self {
            size,
            inner: PostOrderMemOutboard {
                root: to_blake3(hash),
                tree,
                data: rest.to_vec(),
            },
        })
    }
}

/// Decodes and verifies chunks `start..end` of the blob `hash` of `size` bytes.
///
/// Returns the verified chunks in order as `(index, data)`. Fails on the first chunk or
/// parent that does not match the hash.
pub fn decode(
    hash: Hash,
    size: u64,
    start: u64,
    end: u64,
    encoded: &[u8],
) -> Result<Vec<(u64, Bytes)>> {
    let tree = BaoTree::new(size, BLOCK_SIZE);
    let ranges = chunk_ranges(start, end);
    let mut chunks = Vec::new();
    for item in DecodeResponseIter::new(to_blake3(hash), tree, encoded, &ranges) {
        match item.map_err(Error::verification)? {
            BaoContentItem::Parent(_) => {}
            BaoContentItem::Leaf(Leaf { offset, data }) => {
                if offset % CHUNK_SIZE as u64 != 0 {
                    return Err(Error::verification(format!("unaligned chunk at {offset}")));
                }
                chunks.push((offset / CHUNK_SIZE as u64, data));
            }
        }
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Bytes where no two chunks are alike.
    fn distinct_chunks(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 7 + i / CHUNK_SIZE * 31) as u8).collect()
    }

    #[test]
    fn chunk_geometry() {
        assert_eq!(chunk_count(0), 1);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64), 1);
        assert_eq!(chunk_count(CHUNK_SIZE as u64 + 1), 2);
        assert_eq!(chunk_len(CHUNK_SIZE as u64 + 1, 1), 1);
        assert_eq!(chunk_len(0, 0), 0);
    }

    #[test]
    fn root_is_the_plain_blake3_hash() {
        let data = distinct_chunks(CHUNK_SIZE * 3 + 100);
        let outboard = Outboard::compute(&data);
        assert_eq!(outboard.root(), Hash::from(*blake3::hash(&data).as_bytes()));
        assert_eq!(outboard.root(), Hash::new(&data));
        assert_eq!(outboard.chunks(), 4);
    }

    #[test]
    fn decode_verifies_every_chunk() -> Result<()> {
        let data = distinct_chunks(CHUNK_SIZE * 2 + 10);
        let outboard = Outboard::compute(&data);
        let hash = outboard.root();
        let size = data.len() as u64;

        let encoded = outboard.encode(&data[..], 1, 3)?;
        let chunks = decode(hash, size, 1, 3, &encoded)?;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].0, 1);
        assert_eq!(&chunks[0].1[..], &data[CHUNK_SIZE..CHUNK_SIZE * 2]);
        assert_eq!(chunks[1].0, 2);
        assert_eq!(chunks[1].1.len(), 10);

        // a flipped bit in the last chunk
        let mut bad = encoded.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        assert!(decode(hash, size, 1, 3, &bad).is_err());

        // chunk 0 presented as chunk 1
        let first = outboard.encode(&data[..], 0, 1)?;
        assert!(decode(hash, size, 1, 2, &first).is_err());
        Ok(())
    }

    #[test]
    fn verify_detects_corruption() {
        let data = distinct_chunks(CHUNK_SIZE * 2 + 10);
        let outboard = Outboard::compute(&data);
        assert!(outboard.verify(&data));

        let mut bad = data.clone();
        bad[CHUNK_SIZE + 5] ^= 1;
        assert!(!outboard.verify(&bad));

        // chunks swapped
        let mut swapped = data[CHUNK_SIZE..CHUNK_SIZE * 2].to_vec();
        swapped.extend_from_slice(&data[..CHUNK_SIZE]);
        swapped.extend_from_slice(&data[CHUNK_SIZE * 2..]);
        assert!(!outboard.verify(&swapped));

        assert!(!outboard.verify(&data[..data.len() - 1]));
    }

    #[test]
    fn encode_rejects_data_that_changed() {
        let data = distinct_chunks(CHUNK_SIZE + 1);
        let outboard = Outboard::compute(&data);
        let mut changed = data.clone();
        changed[0] ^= 1;
        assert!(outboard.encode(&changed[..], 0, 1).is_err());
    }

    #[test]
    fn outboard_bytes_require_matching_size() {
        let data = distinct_chunks(CHUNK_SIZE * 5);
        let outboard = Outboard::compute(&data);
        let mut bytes = outboard.to_bytes();
        let parsed = Outboard::from_bytes(outboard.root(), &bytes).expect("valid outboard");
        assert_eq!(parsed.size(), outboard.size());
        assert!(parsed.verify(&data));

        bytes[0] = bytes[0].wrapping_add(1);
        assert!(Outboard::from_bytes(outboard.root(), &bytes).is_none());
        assert!(Outboard::from_bytes(outboard.root(), &[1, 2]).is_none());
    }

    proptest! {
        #[test]
        fn streaming_matches_in_memory(data in proptest::collection::vec(any::<u8>(), 0..70_000)) {
            let streamed = Outboard::from_reader(&data[..], data.len() as u64).unwrap();
            let computed = Outboard::compute(&data);
            prop_assert_eq!(streamed.root(), computed.root());
            prop_assert_eq!(streamed.to_bytes(), computed.to_bytes());
        }
    }
}
