use std::collections::VecDeque;

use crate::{HeaderSlotId, HeapError, OpenMode};

/// Byte-addressed file underneath [`EncryptedHeapStorage`](crate::EncryptedHeapStorage).
///
/// The layer owns the file header: a magic prefix and a table of fixed-size
/// header slots, followed by the bucket data region at [`data_offset`].
/// Upper layers ask for their slot sizes at `create()` and afterwards
/// read and rewrite their slot through the [`HeaderSlotId`] they are handed.
///
/// Methods take `&self`; implementations guard the OS handle internally so
/// one instance can serve several threads.
///
/// [`data_offset`]: FileLayer::data_offset
pub trait FileLayer: Send + Sync {
    /// Create a new file with one header slot per entry of `slot_sizes`
    /// (payload bytes, in slot order). Fails if the file exists.
    fn create(path: &str, slot_sizes: VecDeque<u32>) -> Result<Self, HeapError>
    where
        Self: Sized;

    /// Open an existing file, taking a shared lock for `Read` and an
    /// exclusive one for `Write`.
    fn open(path: &str, mode: OpenMode) -> Result<Self, HeapError>
    where
        Self: Sized;

    /// A second handle to the same file with its own file position, opened
    /// in the same [`OpenMode`]. It does not take the process lock; the
    /// handle it came from keeps holding it.
    fn reopen(&self) -> Result<Self, HeapError>
    where
        Self: Sized;

    fn path(&self) -> &str;

    fn mode(&self) -> OpenMode;

    /// Where bucket data begins, right after the header.
    fn data_offset(&self) -> u64;

    /// Fill `buf` from absolute `offset`. Returns fewer bytes than requested
    /// only at end of file.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, HeapError>;

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), HeapError>;

    fn len(&self) -> Result<u64, HeapError>;

    fn is_empty(&self) -> Result<bool, HeapError> {
        self.len().map(|len| len == 0)
    }

    fn set_len(&self, len: u64) -> Result<(), HeapError>;

    /// Flush data and metadata to stable storage.
    fn sync(&self) -> Result<(), HeapError>;

    /// Slot reserved for the `index`-th size passed to `create()`.
    fn header_slot_for_upper(&self, index: u8) -> HeaderSlotId;

    /// Overwrite a slot. `data` must be exactly the slot's size.
    fn write_header_slot(&self, slot: HeaderSlotId, data: &[u8]) -> Result<(), HeapError>;

    fn read_header_slot(&self, slot: HeaderSlotId) -> Result<Vec<u8>, HeapError>;
}
