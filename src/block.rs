//! The block-device boundary consumed by the buffer cache.

use crate::error::Result;

/// The number of bytes in one disk block.
pub const BLOCK_SIZE: usize = 512;

/// Identifies one block on one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId {
    /// The device the block lives on.
    pub device: u32,
    /// The block's index on that device.
    pub number: u64,
}

impl BlockId {
    /// The cache bucket this block maps to, out of `buckets`.
    ///
    /// Any reasonably uniform mix of the two key halves would do; this one
    /// shifts the block number clear of the device id before combining.
    pub(crate) fn bucket_of(self, buckets: usize) -> usize {
        (((self.number << 10) | u64::from(self.device)) % buckets as u64) as usize
    }
}

/// A device that can synchronously transfer one block at a time.
///
/// Both calls block the calling thread until the transfer is complete. The
/// cache invokes them only while it holds the buffer's exclusive lock and
/// no spin lock.
pub trait BlockDevice {
    /// Fill `data` with the contents of the given block.
    fn read_block(&self, id: BlockId, data: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Persist `data` as the new contents of the given block.
    fn write_block(&self, id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &D {
    fn read_block(&self, id: BlockId, data: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        D::read_block(self, id, data)
    }
    fn write_block(&self, id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        D::write_block(self, id, data)
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for std::sync::Arc<D> {
    fn read_block(&self, id: BlockId, data: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        D::read_block(self, id, data)
    }
    fn write_block(&self, id: BlockId, data: &[u8; BLOCK_SIZE]) -> Result<()> {
        D::write_block(self, id, data)
    }
}

#[cfg(test)]
mod tests {
    use super::BlockId;

    #[test]
    fn bucket_mapping_is_stable_and_in_range() {
        let buckets = 7;
        for device in 0..4 {
            for number in 0..64 {
                let id = BlockId { device, number };
                let bucket = id.bucket_of(buckets);
                assert!(bucket < buckets, "Bucket index out of range");
                assert_eq!(
                    bucket,
                    id.bucket_of(buckets),
                    "Mapping must be deterministic"
                );
            }
        }
    }

    #[test]
    fn blocks_a_bucket_count_apart_share_a_bucket() {
        // The tests for LRU behavior rely on this property to aim several
        // blocks at one bucket.
        let buckets = 7;
        let id = |number| BlockId { device: 1, number };
        assert_eq!(id(1).bucket_of(buckets), id(8).bucket_of(buckets));
        assert_eq!(id(1).bucket_of(buckets), id(15).bucket_of(buckets));
    }
}
