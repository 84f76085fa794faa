//! Assembles file images for writing.
//!
//! All of the supported formats are built the same way: fixed records at
//! offsets worked out up front, followed by a pile of variable-length payloads
//! whose offsets are only known once everything before them has been placed.
//! `FileImage` collects both kinds of data keyed by offset, and writes them out
//! in order once the whole file has been described.
//!
//! Layer payloads go through `FileImage::alloc`, which deduplicates them by
//! content hash. Prints commonly contain long stretches of identical layers
//! (think of the straight walls of a box), and storing each distinct payload
//! only once can shrink a file considerably.

use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::io::Write;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::model::{Layer, Printable};

/// Rounds `x` up to a multiple of 4.
pub fn align4(x: u32) -> u32 {
    (x + 3) & !3
}

/// A payload as it will be stored, along with a hash of its contents.
#[derive(Clone, Debug)]
pub struct CompressedBlock {
    pub data: Vec<u8>,
    pub hash: [u8; 32],
}

impl CompressedBlock {
    /// Wraps `data`, which must already be in its final (compressed and, where
    /// applicable, scrambled) form.
    pub fn new(data: Vec<u8>) -> Self {
        let hash = *blake3::hash(&data).as_bytes();
        Self { data, hash }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An in-memory file under construction.
#[derive(Debug)]
pub struct FileImage {
    /// Whether payloads must start at 4-byte boundaries.
    aligned: bool,
    records: BTreeMap<u32, Vec<u8>>,
    placed: HashMap<[u8; 32], u32>,
    /// Next offset available to `alloc`.
    next: u32,
    hits: usize,
}

impl FileImage {
    /// Creates an empty image whose payload area starts at `payload_base`.
    /// Everything below that is expected to be filled with `put`.
    pub fn new(payload_base: u32, aligned: bool) -> Self {
        Self {
            aligned,
            records: BTreeMap::new(),
            placed: HashMap::new(),
            next: if aligned {
                align4(payload_base)
            } else {
                payload_base
            },
            hits: 0,
        }
    }

    /// Places `bytes` at a fixed `offset`.
    pub fn put(&mut self, offset: u32, bytes: impl Into<Vec<u8>>) {
        self.records.insert(offset, bytes.into());
    }

    /// Finds a home for `block` in the payload area, returning its offset. If
    /// an identical block has already been placed, its offset is returned and
    /// nothing new is stored.
    pub fn alloc(&mut self, block: CompressedBlock) -> Result<u32> {
        self.alloc_prefixed(block, 0).map(|(offset, _)| offset)
    }

    /// Like `alloc`, but leaves `prefix` bytes free directly before the block
    /// when it is newly placed, for a record that describes it. Returns the
    /// block's offset and whether it was newly placed; only then is the caller
    /// expected to `put` the prefix record at `offset - prefix`.
    ///
    /// Deduplication looks at the block alone, so blocks that would carry
    /// different prefix records still share one copy.
    pub fn alloc_prefixed(
        &mut self,
        block: CompressedBlock,
        prefix: u32,
    ) -> Result<(u32, bool)> {
        if let Some(&offset) = self.placed.get(&block.hash) {
            log::debug!(
                "dedup: {}-byte block reuses offset 0x{:x}",
                block.len(),
                offset
            );
            self.hits += 1;
            return Ok((offset, false));
        }

        let too_big = || Error::invalid("file exceeds 4GiB");
        let offset = self.next.checked_add(prefix).ok_or_else(too_big)?;
        let mut end = u32::try_from(block.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(too_big)?;
        if self.aligned {
            end = align4(end);
        }
        log::debug!(
            "alloc: {} bytes at 0x{:x} (+{} reserved)",
            block.len(),
            offset,
            prefix
        );

        self.placed.insert(block.hash, offset);
        self.records.insert(offset, block.data);
        self.next = end;
        Ok((offset, true))
    }

    /// Number of `alloc` calls that were satisfied by an existing block.
    pub fn dedup_hits(&self) -> usize {
        self.hits
    }

    /// Writes the file to `sink` in offset order, zero-filling any gaps.
    /// Returns the number of bytes written.
    pub fn finish(self, sink: &mut dyn Write) -> Result<u64> {
        let mut pos = 0u64;
        for (offset, data) in self.records {
            let offset = u64::from(offset);
            if offset < pos {
                return Err(Error::invalid(format!(
                    "record at 0x{:x} overlaps previous record ending at 0x{:x}",
                    offset, pos
                )));
            }
            let gap = (offset - pos) as usize;
            if gap > 0 {
                sink.write_all(&vec![0; gap])?;
            }
            sink.write_all(&data)?;
            pos = offset + data.len() as u64;
        }
        Ok(pos)
    }
}

/// Fetches and processes every layer of `printable` on the rayon pool,
/// returning the results in layer order.
///
/// Encoding layers is by far the most expensive part of writing a file, and
/// layers are independent until their payloads are placed, so this is where
/// the parallelism goes. Placement itself happens afterwards, in order.
pub fn encode_layers<T, F>(printable: &dyn Printable, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(u32, Layer) -> T + Sync,
{
    (0..printable.layer_count())
        .into_par_iter()
        .map(|index| Ok(f(index, printable.layer(index)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(0x71), 0x74);
    }

    #[test]
    fn dedup_returns_first_offset() {
        let mut image = FileImage::new(0x10, false);
        let a = image.alloc(CompressedBlock::new(vec![1, 2, 3])).unwrap();
        let b = image.alloc(CompressedBlock::new(vec![4, 5])).unwrap();
        let c = image.alloc(CompressedBlock::new(vec![1, 2, 3])).unwrap();
        assert_eq!((a, b, c), (0x10, 0x13, 0x10));
        assert_eq!(image.dedup_hits(), 1);

        let mut out = vec![];
        assert_eq!(image.finish(&mut out).unwrap(), 0x15);
        assert_eq!(&out[..0x10], &[0; 0x10]);
        assert_eq!(&out[0x10..], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn aligned_allocation() {
        let mut image = FileImage::new(0x71, true);
        let a = image.alloc(CompressedBlock::new(vec![9; 5])).unwrap();
        let b = image.alloc(CompressedBlock::new(vec![8; 3])).unwrap();
        assert_eq!((a, b), (0x74, 0x7c));
        image.put(0, vec![0xAA; 4]);

        let mut out = vec![];
        image.finish(&mut out).unwrap();
        assert_eq!(out.len(), 0x7f);
        assert_eq!(&out[..4], &[0xAA; 4]);
        assert_eq!(&out[0x79..0x7c], &[0; 3]);
    }

    #[test]
    fn prefix_reserved_on_first_placement_only() {
        let mut image = FileImage::new(8, true);
        let block = || CompressedBlock::new(vec![7; 4]);
        assert_eq!(image.alloc_prefixed(block(), 4).unwrap(), (12, true));
        assert_eq!(image.alloc_prefixed(block(), 4).unwrap(), (12, false));
        let other = image.alloc_prefixed(CompressedBlock::new(vec![1]), 4).unwrap();
        assert_eq!(other, (20, true));
        image.put(8, vec![0xEE; 4]);
        assert_eq!(image.dedup_hits(), 1);

        let mut out = vec![];
        image.finish(&mut out).unwrap();
        assert_eq!(&out[8..], &[0xEE, 0xEE, 0xEE, 0xEE, 7, 7, 7, 7, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn overlap_is_an_error() {
        let mut image = FileImage::new(0, false);
        image.put(0, vec![0; 8]);
        image.put(4, vec![0; 8]);
        let mut out = vec![];
        assert!(matches!(
            image.finish(&mut out),
            Err(Error::InvalidParameter(_))
        ));
    }
}
