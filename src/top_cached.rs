use std::ops::Range;
use std::sync::{RwLock, RwLockReadGuard};

use crate::heap_storage::{check_buckets, checked_path, HeapStorage, SetupOptions};
use crate::{HeapError, HeapGeometry};

/// Options for [`TopCachedHeapStorage`] and [`top_cached`](crate::top_cached).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopCacheOptions {
    /// Number of top heap levels held in memory. `0` disables the cache
    /// (the factory hands the device back untouched); a negative value
    /// caches the whole heap.
    pub cached_levels: i64,
    /// Level whose buckets each get their own device clone. Defaults to
    /// `cached_levels`; clamped to `[0, cached_levels]`.
    pub concurrency_level: Option<i64>,
}

impl Default for TopCacheOptions {
    fn default() -> Self {
        Self {
            cached_levels: 1,
            concurrency_level: None,
        }
    }
}

impl TopCacheOptions {
    pub fn new(cached_levels: i64) -> Self {
        Self {
            cached_levels,
            ..Default::default()
        }
    }

    pub fn concurrency_level(mut self, concurrency_level: i64) -> Self {
        self.concurrency_level = Some(concurrency_level);
        self
    }

    /// True when these options ask for no cache at all.
    pub fn is_bypass(&self) -> bool {
        self.cached_levels == 0
    }

    /// Resolve the options against a heap of `levels` levels into
    /// `(cached_levels, concurrency_level)`.
    pub(crate) fn clamp(&self, levels: usize) -> Result<(usize, usize), HeapError> {
        let levels = i64::try_from(levels)
            .map_err(|_| HeapError::Configuration(format!("{} levels is too many", levels)))?;
        let mut cached_levels = self.cached_levels;
        if cached_levels < 0 {
            cached_levels = levels;
        }
        cached_levels = cached_levels.min(levels);
        let concurrency_level = self
            .concurrency_level
            .unwrap_or(cached_levels)
            .clamp(0, cached_levels);

        if cached_levels < 1 || cached_levels > levels {
            return Err(HeapError::Configuration(format!(
                "cached_levels must be in [1, {}], got {}",
                levels, cached_levels
            )));
        }
        if concurrency_level > cached_levels {
            return Err(HeapError::Configuration(format!(
                "concurrency_level {} exceeds cached_levels {}",
                concurrency_level, cached_levels
            )));
        }
        Ok((cached_levels as usize, concurrency_level as usize))
    }
}

/// Where one bucket lives inside a [`TopCachedHeapStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Cache,
    Device(usize),
}

/// Heap storage with the top levels held in memory and the rest of the heap
/// split into subheaps, each served by its own device clone.
///
/// On construction every bucket above `cached_levels` is downloaded into one
/// contiguous buffer. Path reads and writes touching those levels are served
/// from memory; the remainder of a path goes, in one bulk call, to the clone
/// that owns the subheap the path descends into. Subheaps are rooted at
/// `concurrency_level`, so paths through different subheap roots never share
/// a device handle and can be served concurrently.
///
/// Cached writes reach the device only once, when the storage is closed.
/// A crash before that loses them. Over a read-only device every write is
/// refused and close skips the flush. Dropping the storage without calling
/// [`close`](HeapStorage::close) still flushes, but can only log a failure.
///
/// Overlapping path operations that both touch the cached levels must be
/// serialized by the caller; the buffer lock only covers single bucket
/// copies.
pub struct TopCachedHeapStorage<D: HeapStorage> {
    /// The wrapped device. Only used to download and flush the cache, for
    /// header access, and to be closed last.
    external: Option<D>,
    /// `devices[0]` is the root clone; `devices[i]` for `i >= 1` owns the
    /// subheap rooted at the `i - 1`-th bucket of the concurrency level.
    devices: Vec<D>,
    /// Owning device of bucket `cached_bucket_count + i`.
    owners: Vec<usize>,
    geometry: HeapGeometry,
    block_size: usize,
    blocks_per_bucket: usize,
    bucket_size: usize,
    storage_name: String,
    key: Option<Vec<u8>>,
    cached_levels: usize,
    concurrency_level: usize,
    cached_bucket_count: u64,
    cache: RwLock<Vec<u8>>,
    read_only: bool,
    closed: bool,
}

impl<D: HeapStorage> TopCachedHeapStorage<D> {
    /// Wrap `device`, taking ownership of it.
    ///
    /// Fails with `Configuration` if the options resolve to zero cached
    /// levels; use [`top_cached`](crate::top_cached) to get a bypass instead.
    /// On any failure every clone made so far and `device` itself are closed
    /// before the error is returned.
    pub fn new(device: D, options: TopCacheOptions) -> Result<Self, HeapError> {
        if options.is_bypass() {
            return Err(abandon(
                device,
                Vec::new(),
                HeapError::Configuration(
                    "cached_levels is 0; use top_cached() to bypass the cache".to_string(),
                ),
            ));
        }
        let geometry = *device.geometry();
        let (cached_levels, concurrency_level) = match options.clamp(geometry.levels()) {
            Ok(clamped) => clamped,
            Err(e) => return Err(abandon(device, Vec::new(), e)),
        };

        let bucket_size = device.bucket_size();
        let cached_bucket_count = geometry.first_bucket_at_level(cached_levels);
        let cache = match download(&device, cached_bucket_count, bucket_size) {
            Ok(cache) => cache,
            Err(e) => return Err(abandon(device, Vec::new(), e)),
        };

        let mut devices = Vec::new();
        match device.clone_device() {
            Ok(root) => devices.push(root),
            Err(e) => {
                return Err(abandon(
                    device,
                    devices,
                    HeapError::DeviceClone(format!("root clone: {}", e)),
                ))
            }
        }
        if concurrency_level > 0 && concurrency_level <= geometry.last_level() {
            let first = geometry.first_bucket_at_level(concurrency_level);
            let last = geometry.last_bucket_at_level(concurrency_level);
            for subheap_root in first..=last {
                match device.clone_device() {
                    Ok(clone) => devices.push(clone),
                    Err(e) => {
                        return Err(abandon(
                            device,
                            devices,
                            HeapError::DeviceClone(format!(
                                "clone for subheap rooted at bucket {}: {}",
                                subheap_root, e
                            )),
                        ))
                    }
                }
            }
        }

        let owners = ownership_map(&geometry, cached_bucket_count, concurrency_level, devices.len() - 1);

        tracing::debug!(
            storage = device.storage_name(),
            cached_levels,
            concurrency_level,
            cached_buckets = cached_bucket_count,
            subheaps = devices.len() - 1,
            read_only = device.is_read_only(),
            "opened top-cached heap storage"
        );

        let read_only = device.is_read_only();
        Ok(TopCachedHeapStorage {
            geometry,
            block_size: device.block_size(),
            blocks_per_bucket: device.blocks_per_bucket(),
            bucket_size,
            storage_name: device.storage_name().to_string(),
            key: device.key().map(<[u8]>::to_vec),
            external: Some(device),
            devices,
            owners,
            cached_levels,
            concurrency_level,
            cached_bucket_count,
            cache: RwLock::new(cache),
            read_only,
            closed: false,
        })
    }

    /// Read-only view of the in-memory buffer holding the cached buckets in
    /// index order.
    pub fn cached_bucket_data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.cache.read().unwrap()
    }

    pub fn cached_levels(&self) -> usize {
        self.cached_levels
    }

    pub fn concurrency_level(&self) -> usize {
        self.concurrency_level
    }

    pub fn cached_bucket_count(&self) -> u64 {
        self.cached_bucket_count
    }

    /// Number of subheap clones (not counting the root clone).
    pub fn subheap_count(&self) -> usize {
        self.devices.len().saturating_sub(1)
    }

    /// The device clones, root clone first.
    pub fn devices(&self) -> &[D] {
        &self.devices
    }

    /// Index into [`devices`](Self::devices) of the clone serving `bucket`.
    /// `None` for cached or out-of-range buckets.
    pub fn device_index_for(&self, bucket: u64) -> Option<usize> {
        match self.route(bucket) {
            Ok(Route::Device(d)) => Some(d),
            _ => None,
        }
    }

    fn route(&self, bucket: u64) -> Result<Route, HeapError> {
        if bucket >= self.geometry.bucket_count() {
            return Err(HeapError::OutOfRange(format!(
                "bucket {} is outside the heap ({} buckets)",
                bucket,
                self.geometry.bucket_count()
            )));
        }
        if bucket < self.cached_bucket_count {
            return Ok(Route::Cache);
        }
        Ok(Route::Device(
            self.owners[(bucket - self.cached_bucket_count) as usize],
        ))
    }

    /// Split `indices` into maximal runs of neighbouring entries that share
    /// a route.
    fn routed_runs(&self, indices: &[u64]) -> Result<Vec<(Route, Range<usize>)>, HeapError> {
        let mut runs: Vec<(Route, Range<usize>)> = Vec::new();
        for (i, &bucket) in indices.iter().enumerate() {
            let route = self.route(bucket)?;
            match runs.last_mut() {
                Some((last, range)) if *last == route => range.end = i + 1,
                _ => runs.push((route, i..i + 1)),
            }
        }
        Ok(runs)
    }

    fn require_write(&self) -> Result<(), HeapError> {
        if self.read_only {
            return Err(HeapError::ReadOnly(format!(
                "'{}' is opened for reading",
                self.storage_name
            )));
        }
        Ok(())
    }

    fn cache_range(&self, bucket: u64) -> Range<usize> {
        let start = bucket as usize * self.bucket_size;
        start..start + self.bucket_size
    }

    fn read_cached(&self, indices: &[u64]) -> Vec<Vec<u8>> {
        let cache = self.cache.read().unwrap();
        indices
            .iter()
            .map(|&b| cache[self.cache_range(b)].to_vec())
            .collect()
    }

    fn write_cached<B: AsRef<[u8]>>(&self, indices: &[u64], buckets: &[B]) {
        let mut cache = self.cache.write().unwrap();
        for (&b, bucket) in indices.iter().zip(buckets) {
            let range = self.cache_range(b);
            cache[range].copy_from_slice(bucket.as_ref());
        }
    }

    fn read_device(&self, device: usize, indices: &[u64]) -> Result<Vec<Vec<u8>>, HeapError> {
        let buckets = self.devices[device].read_blocks(indices)?;
        if buckets.len() != indices.len() {
            return Err(HeapError::IoConsistency(format!(
                "device {} returned {} buckets, expected {}",
                device,
                buckets.len(),
                indices.len()
            )));
        }
        Ok(buckets)
    }

    fn write_device<B: AsRef<[u8]>>(
        &self,
        device: usize,
        indices: &[u64],
        buckets: &[B],
    ) -> Result<(), HeapError> {
        let written = self.devices[device].write_blocks(indices, buckets)?;
        if written != indices.len() {
            return Err(HeapError::IoConsistency(format!(
                "device {} wrote {} buckets, expected {}",
                device,
                written,
                indices.len()
            )));
        }
        Ok(())
    }

    /// Owner of the first uncached bucket on a path.
    fn path_owner(&self, bucket: u64) -> usize {
        self.owners[(bucket - self.cached_bucket_count) as usize]
    }

    /// Flush the cache and close every device, once. Each step runs even if
    /// an earlier one failed; the first error wins.
    fn shutdown(&mut self) -> Result<(), HeapError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error: Option<HeapError> = None;
        let mut record = |e: HeapError, what: &str| {
            if first_error.is_none() {
                first_error = Some(e);
            } else {
                tracing::warn!(error = %e, "{} failed while closing top-cached storage", what);
            }
        };

        let cache = std::mem::take(&mut *self.cache.write().unwrap());
        let external = self.external.take();
        if let Some(external) = external.as_ref().filter(|_| !self.read_only) {
            if let Err(e) = flush(external, &cache, self.cached_bucket_count, self.bucket_size) {
                record(e, "cache flush");
            }
        }

        let mut devices = std::mem::take(&mut self.devices);
        let subheaps = if devices.len() > 1 {
            devices.split_off(1)
        } else {
            Vec::new()
        };
        for clone in subheaps {
            if let Err(e) = clone.close() {
                record(e, "closing a subheap clone");
            }
        }
        for root in devices {
            if let Err(e) = root.close() {
                record(e, "closing the root clone");
            }
        }
        if let Some(external) = external {
            if let Err(e) = external.close() {
                record(e, "closing the wrapped device");
            }
        }
        drop(cache);

        tracing::debug!(storage = %self.storage_name, "closed top-cached heap storage");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<D: HeapStorage> HeapStorage for TopCachedHeapStorage<D> {
    fn setup(_storage_name: &str, _options: &SetupOptions) -> Result<Self, HeapError> {
        Err(HeapError::Unsupported(
            "set up the underlying storage, then wrap it".to_string(),
        ))
    }

    fn clone_device(&self) -> Result<Self, HeapError> {
        Err(HeapError::Unsupported(
            "top-cached storage cannot be cloned".to_string(),
        ))
    }

    fn geometry(&self) -> &HeapGeometry {
        &self.geometry
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn blocks_per_bucket(&self) -> usize {
        self.blocks_per_bucket
    }

    fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn storage_name(&self) -> &str {
        &self.storage_name
    }

    fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn header_data(&self) -> Result<Vec<u8>, HeapError> {
        match &self.external {
            Some(external) => external.header_data(),
            None => Err(HeapError::Unsupported("storage is closed".to_string())),
        }
    }

    fn update_header_data(&self, new_header: &[u8]) -> Result<(), HeapError> {
        match &self.external {
            Some(external) => external.update_header_data(new_header),
            None => Err(HeapError::Unsupported("storage is closed".to_string())),
        }
    }

    fn read_blocks(&self, indices: &[u64]) -> Result<Vec<Vec<u8>>, HeapError> {
        let mut buckets = Vec::with_capacity(indices.len());
        for (route, range) in self.routed_runs(indices)? {
            let run = &indices[range];
            match route {
                Route::Cache => buckets.extend(self.read_cached(run)),
                Route::Device(d) => buckets.extend(self.read_device(d, run)?),
            }
        }
        Ok(buckets)
    }

    fn write_blocks<B: AsRef<[u8]>>(&self, indices: &[u64], buckets: &[B]) -> Result<usize, HeapError> {
        self.require_write()?;
        check_buckets(indices, buckets, self.bucket_size)?;
        // Device runs go first so a failed device write leaves the cache
        // untouched.
        let mut cached_runs = Vec::new();
        for (route, range) in self.routed_runs(indices)? {
            match route {
                Route::Cache => cached_runs.push(range),
                Route::Device(d) => self.write_device(d, &indices[range.clone()], &buckets[range])?,
            }
        }
        for range in cached_runs {
            self.write_cached(&indices[range.clone()], &buckets[range]);
        }
        Ok(indices.len())
    }

    fn read_path(&self, bucket: u64, level_start: usize) -> Result<Vec<Vec<u8>>, HeapError> {
        let path = checked_path(&self.geometry, bucket, level_start)?;
        let cached = self.cached_levels;
        if path.len() <= cached {
            return Ok(self.read_cached(&path[level_start..]));
        }
        let owner = self.path_owner(path[cached]);
        if level_start >= cached {
            return self.read_device(owner, &path[level_start..]);
        }
        let mut buckets = self.read_cached(&path[level_start..cached]);
        buckets.extend(self.read_device(owner, &path[cached..])?);
        Ok(buckets)
    }

    fn write_path<B: AsRef<[u8]>>(
        &self,
        bucket: u64,
        buckets: &[B],
        level_start: usize,
    ) -> Result<(), HeapError> {
        self.require_write()?;
        let path = checked_path(&self.geometry, bucket, level_start)?;
        let targets = &path[level_start..];
        check_buckets(targets, buckets, self.bucket_size)?;

        let cached = self.cached_levels;
        if path.len() <= cached {
            self.write_cached(targets, buckets);
            return Ok(());
        }
        let owner = self.path_owner(path[cached]);
        if level_start >= cached {
            return self.write_device(owner, targets, buckets);
        }
        let split = cached - level_start;
        self.write_device(owner, &path[cached..], &buckets[split..])?;
        self.write_cached(&path[level_start..cached], &buckets[..split]);
        Ok(())
    }

    fn bytes_sent(&self) -> u64 {
        self.devices.iter().map(HeapStorage::bytes_sent).sum()
    }

    fn bytes_received(&self) -> u64 {
        self.devices.iter().map(HeapStorage::bytes_received).sum()
    }

    fn close(mut self) -> Result<(), HeapError> {
        self.shutdown()
    }
}

impl<D: HeapStorage> Drop for TopCachedHeapStorage<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(
                storage = %self.storage_name,
                error = %e,
                "top-cached storage dropped without close; flush failed"
            );
        }
    }
}

/// Read buckets `0..count` through `device` into one buffer.
fn download<D: HeapStorage>(device: &D, count: u64, bucket_size: usize) -> Result<Vec<u8>, HeapError> {
    let total = usize::try_from(count)
        .ok()
        .and_then(|n| n.checked_mul(bucket_size))
        .ok_or_else(|| {
            HeapError::Configuration(format!(
                "{} cached buckets of {} bytes do not fit in memory",
                count, bucket_size
            ))
        })?;
    let indices: Vec<u64> = (0..count).collect();
    let mut cache = Vec::with_capacity(total);
    for (index, bucket) in indices.iter().zip(device.yield_blocks(&indices)) {
        let bucket = bucket?;
        if bucket.len() != bucket_size {
            return Err(HeapError::IoConsistency(format!(
                "bucket {} came back as {} bytes, expected {}",
                index,
                bucket.len(),
                bucket_size
            )));
        }
        cache.extend_from_slice(&bucket);
    }
    if cache.len() != total {
        return Err(HeapError::IoConsistency(format!(
            "downloaded {} bytes for the cache, expected {}",
            cache.len(),
            total
        )));
    }
    Ok(cache)
}

/// Write the whole cache back to buckets `0..count` in one call.
fn flush<D: HeapStorage>(device: &D, cache: &[u8], count: u64, bucket_size: usize) -> Result<(), HeapError> {
    let indices: Vec<u64> = (0..count).collect();
    let buckets: Vec<&[u8]> = cache.chunks_exact(bucket_size).collect();
    if buckets.len() != indices.len() || buckets.len() * bucket_size != cache.len() {
        return Err(HeapError::IoConsistency(format!(
            "cache holds {} bytes, expected {} buckets of {}",
            cache.len(),
            count,
            bucket_size
        )));
    }
    let written = device.write_blocks(&indices, &buckets)?;
    if written != buckets.len() {
        return Err(HeapError::IoConsistency(format!(
            "cache flush wrote {} buckets, expected {}",
            written,
            buckets.len()
        )));
    }
    Ok(())
}

/// Owning device for every bucket below the cache. With no subheap clones
/// everything belongs to the root clone.
fn ownership_map(
    geometry: &HeapGeometry,
    cached_bucket_count: u64,
    concurrency_level: usize,
    subheaps: usize,
) -> Vec<usize> {
    let first_subheap = geometry.first_bucket_at_level(concurrency_level);
    (cached_bucket_count..geometry.bucket_count())
        .map(|bucket| {
            if subheaps == 0 {
                0
            } else {
                (geometry.ancestor_at_level(bucket, concurrency_level) - first_subheap) as usize + 1
            }
        })
        .collect()
}

/// Close everything opened during a failed construction and hand back the
/// error that caused it.
fn abandon<D: HeapStorage>(device: D, clones: Vec<D>, error: HeapError) -> HeapError {
    tracing::debug!(error = %error, clones = clones.len(), "rolling back top-cached storage");
    for clone in clones.into_iter().rev() {
        if let Err(e) = clone.close() {
            tracing::warn!(error = %e, "failed to close device clone during rollback");
        }
    }
    if let Err(e) = device.close() {
        tracing::warn!(error = %e, "failed to close wrapped device during rollback");
    }
    error
}
