use crate::heap_storage::{HeapStorage, SetupOptions};
use crate::{HeapError, HeapGeometry, TopCacheOptions, TopCachedHeapStorage};

/// Either a device used as-is or a device behind a top cache.
///
/// Returned by [`top_cached`]; implements [`HeapStorage`] by delegating to
/// whichever variant it holds, so callers need not care which one they got.
pub enum HeapHandle<D: HeapStorage> {
    Plain(D),
    TopCached(TopCachedHeapStorage<D>),
}

/// Wrap `device` in a top cache as described by `options`.
///
/// With `cached_levels == 0` the device comes back unchanged as
/// [`HeapHandle::Plain`]: no wrapper and no clones are made.
pub fn top_cached<D: HeapStorage>(device: D, options: TopCacheOptions) -> Result<HeapHandle<D>, HeapError> {
    if options.is_bypass() {
        tracing::debug!(storage = device.storage_name(), "top cache disabled; using device directly");
        return Ok(HeapHandle::Plain(device));
    }
    TopCachedHeapStorage::new(device, options).map(HeapHandle::TopCached)
}

impl<D: HeapStorage> HeapHandle<D> {
    pub fn is_top_cached(&self) -> bool {
        matches!(self, HeapHandle::TopCached(_))
    }

    pub fn as_top_cached(&self) -> Option<&TopCachedHeapStorage<D>> {
        match self {
            HeapHandle::TopCached(heap) => Some(heap),
            HeapHandle::Plain(_) => None,
        }
    }

    /// The device itself, if no cache was put in front of it.
    pub fn into_plain(self) -> Result<D, Self> {
        match self {
            HeapHandle::Plain(device) => Ok(device),
            other => Err(other),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $heap:ident => $call:expr) => {
        match $self {
            HeapHandle::Plain($heap) => $call,
            HeapHandle::TopCached($heap) => $call,
        }
    };
}

impl<D: HeapStorage> HeapStorage for HeapHandle<D> {
    fn setup(storage_name: &str, options: &SetupOptions) -> Result<Self, HeapError> {
        D::setup(storage_name, options).map(HeapHandle::Plain)
    }

    fn clone_device(&self) -> Result<Self, HeapError> {
        match self {
            HeapHandle::Plain(device) => device.clone_device().map(HeapHandle::Plain),
            HeapHandle::TopCached(heap) => heap.clone_device().map(HeapHandle::TopCached),
        }
    }

    fn geometry(&self) -> &HeapGeometry {
        delegate!(self, heap => heap.geometry())
    }

    fn block_size(&self) -> usize {
        delegate!(self, heap => heap.block_size())
    }

    fn blocks_per_bucket(&self) -> usize {
        delegate!(self, heap => heap.blocks_per_bucket())
    }

    fn storage_name(&self) -> &str {
        delegate!(self, heap => heap.storage_name())
    }

    fn key(&self) -> Option<&[u8]> {
        delegate!(self, heap => heap.key())
    }

    fn is_read_only(&self) -> bool {
        delegate!(self, heap => heap.is_read_only())
    }

    fn header_data(&self) -> Result<Vec<u8>, HeapError> {
        delegate!(self, heap => heap.header_data())
    }

    fn update_header_data(&self, new_header: &[u8]) -> Result<(), HeapError> {
        delegate!(self, heap => heap.update_header_data(new_header))
    }

    fn read_blocks(&self, indices: &[u64]) -> Result<Vec<Vec<u8>>, HeapError> {
        delegate!(self, heap => heap.read_blocks(indices))
    }

    fn write_blocks<B: AsRef<[u8]>>(&self, indices: &[u64], buckets: &[B]) -> Result<usize, HeapError> {
        delegate!(self, heap => heap.write_blocks(indices, buckets))
    }

    fn read_path(&self, bucket: u64, level_start: usize) -> Result<Vec<Vec<u8>>, HeapError> {
        delegate!(self, heap => heap.read_path(bucket, level_start))
    }

    fn write_path<B: AsRef<[u8]>>(
        &self,
        bucket: u64,
        buckets: &[B],
        level_start: usize,
    ) -> Result<(), HeapError> {
        delegate!(self, heap => heap.write_path(bucket, buckets, level_start))
    }

    fn bytes_sent(&self) -> u64 {
        delegate!(self, heap => heap.bytes_sent())
    }

    fn bytes_received(&self) -> u64 {
        delegate!(self, heap => heap.bytes_received())
    }

    fn close(self) -> Result<(), HeapError> {
        delegate!(self, heap => heap.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryHeapStorage;

    fn memory_heap() -> MemoryHeapStorage {
        MemoryHeapStorage::setup(
            "mem",
            &SetupOptions::new(2, 16).initialize(|b| vec![b as u8; 16]),
        )
        .unwrap()
    }

    #[test]
    fn zero_cached_levels_returns_the_device_unchanged() {
        let device = memory_heap();
        let id = device.handle_id();
        let handle = top_cached(device, TopCacheOptions::new(0)).unwrap();
        assert!(!handle.is_top_cached());
        assert!(handle.as_top_cached().is_none());

        let device = match handle.into_plain() {
            Ok(device) => device,
            Err(_) => panic!("expected a plain device"),
        };
        assert_eq!(device.handle_id(), id);
        assert!(device.operations().is_empty());
        assert_eq!(device.open_handles(), vec![id]);
    }

    #[test]
    fn cached_handle_delegates() {
        let device = memory_heap();
        let observer = device.clone_device().unwrap();
        let handle = top_cached(device, TopCacheOptions::new(1)).unwrap();
        assert!(handle.is_top_cached());
        assert_eq!(handle.as_top_cached().map(|h| h.subheap_count()), Some(2));
        assert!(matches!(handle.clone_device(), Err(HeapError::Unsupported(_))));

        assert_eq!(handle.bucket_count(), 7);
        assert_eq!(handle.read_path(4, 0).unwrap(), vec![vec![0u8; 16], vec![1u8; 16], vec![4u8; 16]]);
        handle.write_path(4, &[vec![7u8; 16], vec![7u8; 16], vec![7u8; 16]], 0).unwrap();
        assert_eq!(handle.bytes_sent(), 32);

        let handle = match handle.into_plain() {
            Ok(_) => panic!("expected a cached handle"),
            Err(handle) => handle,
        };
        handle.close().unwrap();
        assert_eq!(observer.peek_bucket(0).unwrap(), vec![7u8; 16]);
        assert_eq!(observer.open_handles(), vec![observer.handle_id()]);
    }

    #[test]
    fn plain_handle_behaves_like_the_device() {
        let handle = top_cached(memory_heap(), TopCacheOptions::new(0)).unwrap();
        let clone = handle.clone_device().unwrap();
        assert!(!clone.is_top_cached());
        handle.write_path(6, &[vec![1u8; 16], vec![2u8; 16], vec![3u8; 16]], 0).unwrap();
        assert_eq!(clone.read_path(6, 1).unwrap(), vec![vec![2u8; 16], vec![3u8; 16]]);
        clone.close().unwrap();
        handle.close().unwrap();
    }
}
