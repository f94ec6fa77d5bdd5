use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::heap_storage::{check_buckets, HeapStorage, SetupOptions, TrafficCounters};
use crate::{HeapError, HeapGeometry};

/// What a handle did to the shared medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumOpKind {
    Read,
    Write,
    HeaderWrite,
    Clone,
    Close,
}

/// One logged operation against a [`MemoryHeapStorage`] medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumOp {
    /// Id of the handle that issued the operation.
    pub handle: u64,
    pub kind: MediumOpKind,
    /// Buckets touched, in request order. Empty for header/clone/close.
    pub buckets: Vec<u64>,
}

struct MediumState {
    buckets: Vec<u8>,
    header: Vec<u8>,
    log: Vec<MediumOp>,
    open_handles: BTreeSet<u64>,
    next_handle: u64,
    faults: Faults,
}

/// Injected failures. A `Some(n)` budget lets `n` more calls succeed.
#[derive(Default)]
struct Faults {
    clones: Option<usize>,
    reads: Option<usize>,
    writes: Option<usize>,
    short_reads: bool,
}

/// Spend one call from `budget`; false once it has run out.
fn take_budget(budget: &mut Option<usize>) -> bool {
    match budget {
        Some(0) => false,
        Some(remaining) => {
            *remaining -= 1;
            true
        }
        None => true,
    }
}

struct MemoryMedium {
    name: String,
    geometry: HeapGeometry,
    block_size: usize,
    blocks_per_bucket: usize,
    state: Mutex<MediumState>,
}

/// In-memory heap storage; a debugging and testing tool.
///
/// Every clone shares one medium (bucket bytes plus header) but has its own
/// handle id and traffic counters. The medium keeps a log of every read,
/// write, header update, clone and close, and tracks which handles are still
/// open. Future clones, reads and writes can be made to fail, and reads can
/// be made to come back one bucket short. That makes it the counting fake
/// used to check when and through which handle buckets move, and what
/// happens when they don't.
///
/// Buckets are stored in plaintext; a setup password is ignored.
pub struct MemoryHeapStorage {
    medium: Arc<MemoryMedium>,
    handle: u64,
    traffic: TrafficCounters,
}

impl MemoryHeapStorage {
    fn bucket_range(&self, bucket: u64) -> Result<std::ops::Range<usize>, HeapError> {
        if bucket >= self.medium.geometry.bucket_count() {
            return Err(HeapError::OutOfRange(format!(
                "bucket {} is outside the heap ({} buckets)",
                bucket,
                self.medium.geometry.bucket_count()
            )));
        }
        let bucket_size = self.bucket_size();
        let start = bucket as usize * bucket_size;
        Ok(start..start + bucket_size)
    }

    fn log(state: &mut MediumState, handle: u64, kind: MediumOpKind, buckets: Vec<u64>) {
        state.log.push(MediumOp {
            handle,
            kind,
            buckets,
        });
    }

    /// Id of this handle in the operation log.
    pub fn handle_id(&self) -> u64 {
        self.handle
    }

    /// Every operation issued against the medium so far, by any handle.
    pub fn operations(&self) -> Vec<MediumOp> {
        self.medium.state.lock().unwrap().log.clone()
    }

    pub fn clear_operations(&self) {
        self.medium.state.lock().unwrap().log.clear();
    }

    /// Ids of the handles that have not been closed yet.
    pub fn open_handles(&self) -> Vec<u64> {
        self.medium
            .state
            .lock()
            .unwrap()
            .open_handles
            .iter()
            .copied()
            .collect()
    }

    /// Let the next `successes` clones succeed and fail every clone after
    /// that.
    pub fn fail_clones_after(&self, successes: usize) {
        self.medium.state.lock().unwrap().faults.clones = Some(successes);
    }

    /// Same as [`fail_clones_after`](Self::fail_clones_after), for
    /// `read_blocks` calls from any handle.
    pub fn fail_reads_after(&self, successes: usize) {
        self.medium.state.lock().unwrap().faults.reads = Some(successes);
    }

    /// Same as [`fail_clones_after`](Self::fail_clones_after), for
    /// `write_blocks` calls from any handle.
    pub fn fail_writes_after(&self, successes: usize) {
        self.medium.state.lock().unwrap().faults.writes = Some(successes);
    }

    /// While set, every `read_blocks` call drops the last requested bucket
    /// from its result.
    pub fn short_reads(&self, enabled: bool) {
        self.medium.state.lock().unwrap().faults.short_reads = enabled;
    }

    /// Drop every injected failure.
    pub fn clear_faults(&self) {
        self.medium.state.lock().unwrap().faults = Faults::default();
    }

    fn injected(&self, what: &str) -> HeapError {
        HeapError::IoError(format!("injected {} failure on '{}'", what, self.medium.name))
    }

    /// Current contents of a bucket, without logging or counting traffic.
    pub fn peek_bucket(&self, bucket: u64) -> Result<Vec<u8>, HeapError> {
        let range = self.bucket_range(bucket)?;
        Ok(self.medium.state.lock().unwrap().buckets[range].to_vec())
    }
}

impl HeapStorage for MemoryHeapStorage {
    fn setup(storage_name: &str, options: &SetupOptions) -> Result<Self, HeapError> {
        let geometry = options.geometry()?;
        let bucket_size = options.bucket_size();
        let total = usize::try_from(geometry.bucket_count())
            .ok()
            .and_then(|n| n.checked_mul(bucket_size))
            .ok_or_else(|| {
                HeapError::Configuration(format!(
                    "{} buckets of {} bytes do not fit in memory",
                    geometry.bucket_count(),
                    bucket_size
                ))
            })?;

        let mut buckets = Vec::with_capacity(total);
        for bucket in 0..geometry.bucket_count() {
            buckets.extend_from_slice(&options.initial_bucket(bucket)?);
        }

        let medium = MemoryMedium {
            name: storage_name.to_string(),
            geometry,
            block_size: options.block_size,
            blocks_per_bucket: options.blocks_per_bucket,
            state: Mutex::new(MediumState {
                buckets,
                header: options.header_data.clone(),
                log: Vec::new(),
                open_handles: BTreeSet::from([0]),
                next_handle: 1,
                faults: Faults::default(),
            }),
        };

        Ok(MemoryHeapStorage {
            medium: Arc::new(medium),
            handle: 0,
            traffic: TrafficCounters::default(),
        })
    }

    fn clone_device(&self) -> Result<Self, HeapError> {
        let mut state = self.medium.state.lock().unwrap();
        if !take_budget(&mut state.faults.clones) {
            return Err(self.injected("clone"));
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.open_handles.insert(handle);
        Self::log(&mut state, self.handle, MediumOpKind::Clone, Vec::new());
        drop(state);

        Ok(MemoryHeapStorage {
            medium: Arc::clone(&self.medium),
            handle,
            traffic: TrafficCounters::default(),
        })
    }

    fn geometry(&self) -> &HeapGeometry {
        &self.medium.geometry
    }

    fn block_size(&self) -> usize {
        self.medium.block_size
    }

    fn blocks_per_bucket(&self) -> usize {
        self.medium.blocks_per_bucket
    }

    fn storage_name(&self) -> &str {
        &self.medium.name
    }

    fn header_data(&self) -> Result<Vec<u8>, HeapError> {
        Ok(self.medium.state.lock().unwrap().header.clone())
    }

    fn update_header_data(&self, new_header: &[u8]) -> Result<(), HeapError> {
        let mut state = self.medium.state.lock().unwrap();
        if new_header.len() != state.header.len() {
            return Err(HeapError::InvalidArgument(format!(
                "new header data is {} bytes, must stay {} bytes",
                new_header.len(),
                state.header.len()
            )));
        }
        state.header.copy_from_slice(new_header);
        Self::log(&mut state, self.handle, MediumOpKind::HeaderWrite, Vec::new());
        Ok(())
    }

    fn read_blocks(&self, indices: &[u64]) -> Result<Vec<Vec<u8>>, HeapError> {
        let ranges = indices
            .iter()
            .map(|&b| self.bucket_range(b))
            .collect::<Result<Vec<_>, _>>()?;
        let mut state = self.medium.state.lock().unwrap();
        if !take_budget(&mut state.faults.reads) {
            return Err(self.injected("read"));
        }
        let mut buckets: Vec<Vec<u8>> = ranges
            .into_iter()
            .map(|range| state.buckets[range].to_vec())
            .collect();
        if state.faults.short_reads {
            buckets.pop();
        }
        Self::log(&mut state, self.handle, MediumOpKind::Read, indices.to_vec());
        drop(state);

        self.traffic
            .record_received(buckets.len() * self.bucket_size());
        Ok(buckets)
    }

    fn write_blocks<B: AsRef<[u8]>>(&self, indices: &[u64], buckets: &[B]) -> Result<usize, HeapError> {
        check_buckets(indices, buckets, self.bucket_size())?;
        let ranges = indices
            .iter()
            .map(|&b| self.bucket_range(b))
            .collect::<Result<Vec<_>, _>>()?;
        let mut state = self.medium.state.lock().unwrap();
        if !take_budget(&mut state.faults.writes) {
            return Err(self.injected("write"));
        }
        for (range, bucket) in ranges.into_iter().zip(buckets) {
            state.buckets[range].copy_from_slice(bucket.as_ref());
        }
        Self::log(&mut state, self.handle, MediumOpKind::Write, indices.to_vec());
        drop(state);

        self.traffic.record_sent(indices.len() * self.bucket_size());
        Ok(indices.len())
    }

    fn bytes_sent(&self) -> u64 {
        self.traffic.sent()
    }

    fn bytes_received(&self) -> u64 {
        self.traffic.received()
    }

    fn close(self) -> Result<(), HeapError> {
        let mut state = self.medium.state.lock().unwrap();
        state.open_handles.remove(&self.handle);
        Self::log(&mut state, self.handle, MediumOpKind::Close, Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(height: usize) -> MemoryHeapStorage {
        MemoryHeapStorage::setup(
            "mem",
            &SetupOptions::new(height, 8).initialize(|b| vec![b as u8; 8]),
        )
        .unwrap()
    }

    #[test]
    fn setup_uses_initializer() {
        let heap = setup(2);
        assert_eq!(heap.bucket_count(), 7);
        for b in 0..7 {
            assert_eq!(heap.peek_bucket(b).unwrap(), vec![b as u8; 8]);
        }
        assert!(heap.operations().is_empty());
    }

    #[test]
    fn clones_share_buckets_and_log_per_handle() {
        let heap = setup(2);
        let clone = heap.clone_device().unwrap();
        assert_ne!(heap.handle_id(), clone.handle_id());

        clone.write_blocks(&[3], &[vec![0xEE; 8]]).unwrap();
        assert_eq!(heap.read_blocks(&[3]).unwrap(), vec![vec![0xEE; 8]]);

        let ops = heap.operations();
        assert_eq!(
            ops,
            vec![
                MediumOp {
                    handle: heap.handle_id(),
                    kind: MediumOpKind::Clone,
                    buckets: vec![],
                },
                MediumOp {
                    handle: clone.handle_id(),
                    kind: MediumOpKind::Write,
                    buckets: vec![3],
                },
                MediumOp {
                    handle: heap.handle_id(),
                    kind: MediumOpKind::Read,
                    buckets: vec![3],
                },
            ]
        );
        assert_eq!(clone.bytes_sent(), 8);
        assert_eq!(heap.bytes_received(), 8);
        assert_eq!(heap.bytes_sent(), 0);
    }

    #[test]
    fn injected_clone_failure() {
        let heap = setup(1);
        heap.fail_clones_after(1);
        let first = heap.clone_device().unwrap();
        assert!(heap.clone_device().is_err());
        assert_eq!(heap.open_handles(), vec![0, first.handle_id()]);
        first.close().unwrap();
        assert_eq!(heap.open_handles(), vec![0]);
    }

    #[test]
    fn injected_read_and_write_faults() {
        let heap = setup(2);
        let clone = heap.clone_device().unwrap();

        heap.fail_writes_after(1);
        clone.write_blocks(&[1], &[vec![9u8; 8]]).unwrap();
        assert!(heap.write_blocks(&[2], &[vec![9u8; 8]]).is_err());
        assert_eq!(heap.peek_bucket(2).unwrap(), vec![2u8; 8]);

        heap.short_reads(true);
        assert_eq!(clone.read_blocks(&[1, 2, 3]).unwrap().len(), 2);
        heap.short_reads(false);

        heap.fail_reads_after(0);
        assert!(clone.read_blocks(&[1]).is_err());
        assert_eq!(heap.bytes_received(), 0);
        assert_eq!(clone.bytes_received(), 16);

        heap.clear_faults();
        assert_eq!(clone.read_blocks(&[1, 2]).unwrap().len(), 2);
        heap.write_blocks(&[2], &[vec![9u8; 8]]).unwrap();
    }

    #[test]
    fn out_of_range_and_bad_lengths() {
        let heap = setup(1);
        assert!(matches!(
            heap.read_blocks(&[3]),
            Err(HeapError::OutOfRange(_))
        ));
        assert!(matches!(
            heap.write_blocks(&[0, 1], &[vec![0u8; 8]]),
            Err(HeapError::InvalidArgument(_))
        ));
        assert!(matches!(
            heap.update_header_data(b"x"),
            Err(HeapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn yield_blocks_is_lazy() {
        let heap = setup(2);
        let indices = [0u64, 1, 2];
        let mut iter = heap.yield_blocks(&indices);
        assert_eq!(iter.next().unwrap().unwrap(), vec![0u8; 8]);
        assert_eq!(heap.operations().len(), 1);
        let rest: Vec<Vec<u8>> = iter.map(Result::unwrap).collect();
        assert_eq!(rest, vec![vec![1u8; 8], vec![2u8; 8]]);
        assert_eq!(heap.operations().len(), 3);
    }
}
