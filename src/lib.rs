mod encrypted_heap;
pub(crate) mod encryption;
mod error;
mod file_layer;
mod file_on_disk;
mod heap_geometry;
mod heap_handle;
mod heap_in_memory;
mod heap_storage;
mod top_cached;

pub use encrypted_heap::EncryptedHeapStorage;
pub use error::HeapError;
pub use file_layer::FileLayer;
pub use file_on_disk::FileOnDisk;
pub use heap_geometry::{HeapGeometry, HeapNode};
pub use heap_handle::{top_cached, HeapHandle};
pub use heap_in_memory::{MediumOp, MediumOpKind, MemoryHeapStorage};
pub use heap_storage::{BucketIter, HeapStorage, KdfParams, SetupOptions, TrafficCounters};
pub use top_cached::{TopCacheOptions, TopCachedHeapStorage};

/// Handle to one fixed-size header slot of a [`FileLayer`], issued by
/// `header_slot_for_upper`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderSlotId(pub(crate) u8);

/// How an existing heap file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Shared process lock.
    Read,
    /// Exclusive process lock.
    Write,
}

/// Heap storage in a single (optionally encrypted) file on disk.
pub type HeapFile = EncryptedHeapStorage<FileOnDisk>;

/// A heap file with its top levels cached in memory.
pub type TopCachedHeapFile = TopCachedHeapStorage<HeapFile>;
