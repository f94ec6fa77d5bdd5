use std::sync::atomic::{AtomicU64, Ordering};

use crate::{HeapError, HeapGeometry};

/// Argon2id cost parameters used when a heap is set up with a password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    // OWASP recommended baseline.
    fn default() -> Self {
        Self {
            m_cost: 19456,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

/// Options for [`HeapStorage::setup`].
#[derive(Debug, Clone)]
pub struct SetupOptions {
    /// Arity of the heap (2 = binary).
    pub heap_base: u64,
    /// Heap height; the heap has `height + 1` levels.
    pub height: usize,
    /// Size of one block in bytes.
    pub block_size: usize,
    pub blocks_per_bucket: usize,
    /// Opaque user bytes stored next to the heap. Its length is fixed for
    /// the lifetime of the storage.
    pub header_data: Vec<u8>,
    /// Password for AES-XTS bucket encryption. `None` = no encryption.
    pub password: Option<Vec<u8>>,
    pub kdf: KdfParams,
    /// Initial plaintext of each bucket, by index. Buckets are zero-filled
    /// when this is `None`.
    pub initialize: Option<fn(u64) -> Vec<u8>>,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            heap_base: 2,
            height: 3,
            block_size: 4096,
            blocks_per_bucket: 1,
            header_data: Vec::new(),
            password: None,
            kdf: KdfParams::default(),
            initialize: None,
        }
    }
}

impl SetupOptions {
    pub fn new(height: usize, block_size: usize) -> Self {
        Self {
            height,
            block_size,
            ..Default::default()
        }
    }

    pub fn heap_base(mut self, heap_base: u64) -> Self {
        self.heap_base = heap_base;
        self
    }

    pub fn blocks_per_bucket(mut self, blocks_per_bucket: usize) -> Self {
        self.blocks_per_bucket = blocks_per_bucket;
        self
    }

    pub fn header_data(mut self, header_data: impl Into<Vec<u8>>) -> Self {
        self.header_data = header_data.into();
        self
    }

    pub fn password(mut self, password: impl Into<Vec<u8>>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn initialize(mut self, initialize: fn(u64) -> Vec<u8>) -> Self {
        self.initialize = Some(initialize);
        self
    }

    pub fn bucket_size(&self) -> usize {
        self.block_size * self.blocks_per_bucket
    }

    /// Validate the options and build the geometry they describe.
    pub(crate) fn geometry(&self) -> Result<HeapGeometry, HeapError> {
        if self.block_size == 0 || self.blocks_per_bucket == 0 {
            return Err(HeapError::Configuration(format!(
                "block_size ({}) and blocks_per_bucket ({}) must be non-zero",
                self.block_size, self.blocks_per_bucket
            )));
        }
        HeapGeometry::new(self.heap_base, self.height)
    }

    /// Plaintext of bucket `index` at setup time.
    pub(crate) fn initial_bucket(&self, index: u64) -> Result<Vec<u8>, HeapError> {
        let bucket_size = self.bucket_size();
        match self.initialize {
            None => Ok(vec![0u8; bucket_size]),
            Some(init) => {
                let data = init(index);
                if data.len() != bucket_size {
                    return Err(HeapError::InvalidArgument(format!(
                        "initializer returned {} bytes for bucket {}, expected {}",
                        data.len(),
                        index,
                        bucket_size
                    )));
                }
                Ok(data)
            }
        }
    }
}

/// Per-handle I/O traffic counters.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficCounters {
    pub fn record_sent(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Lazy bucket iterator returned by [`HeapStorage::yield_blocks`].
pub type BucketIter<'a> = Box<dyn Iterator<Item = Result<Vec<u8>, HeapError>> + 'a>;

/// Bucket storage laid out as a virtual heap.
///
/// A handle to an opened, fully initialized heap of fixed-size buckets.
/// Buckets are addressed by their index in [`HeapGeometry`]. Every handle
/// carries its own traffic counters; [`clone_device`](Self::clone_device)
/// produces an independent handle to the same medium so unrelated paths can
/// be served in parallel.
///
/// All methods take `&self` (except `close`) so a handle can be shared across
/// threads. Implementations use interior mutability to protect their state.
pub trait HeapStorage: Send + Sync {
    /// Create and initialize new storage named `storage_name`.
    fn setup(storage_name: &str, options: &SetupOptions) -> Result<Self, HeapError>
    where
        Self: Sized;

    /// Open an independent handle to the same medium, with fresh traffic
    /// counters.
    fn clone_device(&self) -> Result<Self, HeapError>
    where
        Self: Sized;

    fn geometry(&self) -> &HeapGeometry;

    fn block_size(&self) -> usize;

    fn blocks_per_bucket(&self) -> usize;

    /// Size of one bucket's plaintext in bytes.
    fn bucket_size(&self) -> usize {
        self.block_size() * self.blocks_per_bucket()
    }

    fn bucket_count(&self) -> u64 {
        self.geometry().bucket_count()
    }

    fn storage_name(&self) -> &str;

    /// Raw bucket encryption key, if the storage is encrypted.
    fn key(&self) -> Option<&[u8]> {
        None
    }

    /// True if this handle was opened without write access. Writes through
    /// it fail with `ReadOnly`.
    fn is_read_only(&self) -> bool {
        false
    }

    fn header_data(&self) -> Result<Vec<u8>, HeapError>;

    /// Replace the user header. The new header must have the same length as
    /// the current one.
    fn update_header_data(&self, new_header: &[u8]) -> Result<(), HeapError>;

    /// Read the given buckets, in the given order.
    fn read_blocks(&self, indices: &[u64]) -> Result<Vec<Vec<u8>>, HeapError>;

    /// Write `buckets[i]` to bucket `indices[i]`. Returns the number of
    /// buckets written.
    fn write_blocks<B: AsRef<[u8]>>(&self, indices: &[u64], buckets: &[B]) -> Result<usize, HeapError>
    where
        Self: Sized;

    /// Read the given buckets lazily, one at a time.
    fn yield_blocks<'a>(&'a self, indices: &'a [u64]) -> BucketIter<'a> {
        Box::new(indices.iter().map(move |&index| {
            let mut buckets = self.read_blocks(&[index])?;
            buckets.pop().ok_or_else(|| {
                HeapError::IoConsistency(format!("no data returned for bucket {}", index))
            })
        }))
    }

    /// Read the buckets on the root path of `bucket`, starting at
    /// `level_start`.
    fn read_path(&self, bucket: u64, level_start: usize) -> Result<Vec<Vec<u8>>, HeapError> {
        let path = checked_path(self.geometry(), bucket, level_start)?;
        self.read_blocks(&path[level_start..])
    }

    /// Write `buckets` over the root path of `bucket`, starting at
    /// `level_start`.
    fn write_path<B: AsRef<[u8]>>(
        &self,
        bucket: u64,
        buckets: &[B],
        level_start: usize,
    ) -> Result<(), HeapError>
    where
        Self: Sized,
    {
        let path = checked_path(self.geometry(), bucket, level_start)?;
        let written = self.write_blocks(&path[level_start..], buckets)?;
        if written != buckets.len() {
            return Err(HeapError::IoConsistency(format!(
                "write_path({}): wrote {} buckets, expected {}",
                bucket,
                written,
                buckets.len()
            )));
        }
        Ok(())
    }

    /// Total bytes this handle has written to the medium.
    fn bytes_sent(&self) -> u64;

    /// Total bytes this handle has read from the medium.
    fn bytes_received(&self) -> u64;

    /// Flush and release the handle.
    fn close(self) -> Result<(), HeapError>
    where
        Self: Sized;
}

/// Root path of `bucket`, checking that the bucket exists and that
/// `level_start` does not run past its end.
pub(crate) fn checked_path(
    geometry: &HeapGeometry,
    bucket: u64,
    level_start: usize,
) -> Result<Vec<u64>, HeapError> {
    if bucket >= geometry.bucket_count() {
        return Err(HeapError::OutOfRange(format!(
            "bucket {} is outside the heap ({} buckets)",
            bucket,
            geometry.bucket_count()
        )));
    }
    let path = geometry.path_from_root(bucket);
    if level_start > path.len() {
        return Err(HeapError::OutOfRange(format!(
            "level_start {} exceeds path length {} of bucket {}",
            level_start,
            path.len(),
            bucket
        )));
    }
    Ok(path)
}

/// Check that `buckets` pairs up with `indices` and that every blob is a full
/// bucket.
pub(crate) fn check_buckets<B: AsRef<[u8]>>(
    indices: &[u64],
    buckets: &[B],
    bucket_size: usize,
) -> Result<(), HeapError> {
    if indices.len() != buckets.len() {
        return Err(HeapError::InvalidArgument(format!(
            "{} bucket indices but {} buckets",
            indices.len(),
            buckets.len()
        )));
    }
    for (index, bucket) in indices.iter().zip(buckets) {
        if bucket.as_ref().len() != bucket_size {
            return Err(HeapError::InvalidArgument(format!(
                "bucket {}: expected {} bytes, got {}",
                index,
                bucket_size,
                bucket.as_ref().len()
            )));
        }
    }
    Ok(())
}
