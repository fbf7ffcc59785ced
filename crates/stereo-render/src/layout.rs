// SPDX-License-Identifier: CEPL-1.0
//! Packs several uniform blocks into one buffer allocation.
//!
//! Only the layout is tracked here; the memory itself belongs to whoever
//! allocates `total_size()` bytes. Every block starts on a multiple of the
//! device's `minUniformBufferOffsetAlignment` so it can be bound as a
//! descriptor range of its own.
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("uniform alignment {0} is not a power of two")]
    Alignment(u64),
    #[error("block {index} does not exist ({count} blocks)")]
    NoSuchBlock { index: usize, count: usize },
    #[error("block {index} holds {expected} bytes, source has {actual}")]
    SourceSize {
        index: usize,
        expected: u64,
        actual: usize,
    },
    #[error("destination holds {actual} bytes, layout needs {needed}")]
    Destination { needed: u64, actual: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Block {
    offset: u64,
    size: u64,
}

/// Append-only half of the planner. [`finish`](Self::finish) hands out the
/// immutable [`UniformLayout`], so nothing can be added once a buffer has
/// been sized from it.
#[derive(Clone, Debug)]
pub struct UniformLayoutBuilder {
    align: u64,
    cursor: u64,
    blocks: Vec<Block>,
}

impl UniformLayoutBuilder {
    /// `min_alignment` of 0 packs blocks back to back.
    pub fn new(min_alignment: u64) -> Result<Self, LayoutError> {
        if min_alignment != 0 && !min_alignment.is_power_of_two() {
            return Err(LayoutError::Alignment(min_alignment));
        }
        Ok(Self {
            align: min_alignment,
            cursor: 0,
            blocks: Vec::new(),
        })
    }

    /// Appends a block of `size` bytes and returns its index.
    pub fn add(&mut self, size: usize) -> usize {
        let size = size as u64;
        self.blocks.push(Block {
            offset: self.cursor,
            size,
        });
        self.cursor += align_up(size, self.align);
        self.blocks.len() - 1
    }

    pub fn finish(self) -> UniformLayout {
        UniformLayout {
            align: self.align,
            total: self.cursor,
            blocks: self.blocks,
        }
    }
}

#[inline]
fn align_up(size: u64, align: u64) -> u64 {
    if align == 0 {
        size
    } else {
        (size + align - 1) & !(align - 1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformLayout {
    align: u64,
    total: u64,
    blocks: Vec<Block>,
}

impl UniformLayout {
    pub fn alignment(&self) -> u64 {
        self.align
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Byte offset of block `index` from the start of the buffer.
    pub fn offset(&self, index: usize) -> u64 {
        self.blocks[index].offset
    }

    /// Unpadded size of block `index`.
    pub fn size(&self, index: usize) -> u64 {
        self.blocks[index].size
    }

    /// Bytes the backing buffer has to allocate, trailing padding included.
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Copies exactly `size(index)` bytes from `src` to `offset(index)` in `dst`.
    pub fn copy(&self, dst: &mut [u8], src: &[u8], index: usize) -> Result<(), LayoutError> {
        let block = *self.blocks.get(index).ok_or(LayoutError::NoSuchBlock {
            index,
            count: self.blocks.len(),
        })?;
        if src.len() as u64 != block.size {
            return Err(LayoutError::SourceSize {
                index,
                expected: block.size,
                actual: src.len(),
            });
        }
        if (dst.len() as u64) < self.total {
            return Err(LayoutError::Destination {
                needed: self.total,
                actual: dst.len(),
            });
        }
        let start = block.offset as usize;
        dst[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(align: u64, sizes: &[usize]) -> UniformLayout {
        let mut b = UniformLayoutBuilder::new(align).unwrap();
        for &s in sizes {
            b.add(s);
        }
        b.finish()
    }

    #[test]
    fn scene_and_animation_blocks_on_256_alignment() {
        let layout = build(256, &[128, 4]);
        assert_eq!(layout.offset(0), 0);
        assert_eq!(layout.size(0), 128);
        assert_eq!(layout.offset(1), 256);
        assert_eq!(layout.size(1), 4);
        // The trailing block is padded too; the buffer has to cover it.
        assert_eq!(layout.total_size(), 512);
    }

    #[test]
    fn zero_alignment_packs_tightly() {
        let layout = build(0, &[128, 4]);
        assert_eq!(layout.offset(0), 0);
        assert_eq!(layout.offset(1), 128);
        assert_eq!(layout.total_size(), 132);
    }

    #[test]
    fn offsets_follow_rounded_sizes() {
        let sizes = [1, 64, 65, 3, 256, 257, 0, 17];
        for align in [1u64, 4, 16, 64, 256] {
            let layout = build(align, &sizes);
            for i in 0..sizes.len() - 1 {
                let rounded = layout.size(i).div_ceil(align) * align;
                assert_eq!(layout.offset(i + 1), layout.offset(i) + rounded);
                assert_eq!(layout.offset(i) % align, 0);
            }
            let last = sizes.len() - 1;
            let rounded = layout.size(last).div_ceil(align) * align;
            assert_eq!(layout.total_size(), layout.offset(last) + rounded);
        }
    }

    #[test]
    fn packed_offsets_are_exact_sums() {
        let sizes = [3usize, 5, 7, 11];
        let layout = build(0, &sizes);
        let mut expected = 0u64;
        for (i, &s) in sizes.iter().enumerate() {
            assert_eq!(layout.offset(i), expected);
            expected += s as u64;
        }
        assert_eq!(layout.total_size(), expected);
    }

    #[test]
    fn copies_land_at_block_offsets() {
        for count in 1..6usize {
            let sizes: Vec<usize> = (0..count).map(|i| 10 + 37 * i).collect();
            let layout = build(64, &sizes);
            let mut buffer = vec![0u8; layout.total_size() as usize];
            let patterns: Vec<Vec<u8>> = sizes
                .iter()
                .enumerate()
                .map(|(i, &s)| (0..s).map(|b| (b as u8).wrapping_mul(31) ^ i as u8).collect())
                .collect();

            for (i, p) in patterns.iter().enumerate() {
                layout.copy(&mut buffer, p, i).unwrap();
            }
            for (i, p) in patterns.iter().enumerate() {
                let start = layout.offset(i) as usize;
                assert_eq!(&buffer[start..start + p.len()], p.as_slice());
            }
        }
    }

    #[test]
    fn later_copy_leaves_earlier_block_alone() {
        let layout = build(256, &[128, 4]);
        let mut buffer = vec![0u8; layout.total_size() as usize];
        layout.copy(&mut buffer, &[0xAB; 128], 0).unwrap();
        layout.copy(&mut buffer, &[0xCD; 4], 1).unwrap();
        assert!(buffer[..128].iter().all(|&b| b == 0xAB));
        assert!(buffer[128..256].iter().all(|&b| b == 0));
    }

    #[test]
    fn copy_rejects_mismatched_sizes() {
        let layout = build(16, &[8, 8]);
        let mut buffer = vec![0u8; layout.total_size() as usize];
        assert_eq!(
            layout.copy(&mut buffer, &[0; 7], 0),
            Err(LayoutError::SourceSize {
                index: 0,
                expected: 8,
                actual: 7
            })
        );
        assert!(matches!(
            layout.copy(&mut buffer[..20], &[0; 8], 1),
            Err(LayoutError::Destination { needed: 32, .. })
        ));
        assert!(matches!(
            layout.copy(&mut buffer, &[0; 8], 2),
            Err(LayoutError::NoSuchBlock { index: 2, count: 2 })
        ));
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        assert_eq!(
            UniformLayoutBuilder::new(48).unwrap_err(),
            LayoutError::Alignment(48)
        );
    }
}
