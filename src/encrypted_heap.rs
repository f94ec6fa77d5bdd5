use std::collections::VecDeque;
use std::sync::Arc;

use crate::encryption::{self, EncryptionConfig, HeapCipher};
use crate::file_layer::FileLayer;
use crate::heap_storage::{check_buckets, HeapStorage, SetupOptions, TrafficCounters};
use crate::{HeaderSlotId, HeapError, HeapGeometry, OpenMode};

// Heap header slot layout:
// | "vheap0": [u8;6] | version: u8 | heap_base: u64 | height: u32 | block_size: u32 |
// | blocks_per_bucket: u32 | encrypted: u8 |
// If encrypted == 1, the remaining bytes are the encryption config (129 bytes).
const P_ID_OFFSET: usize = 0;
const P_VERSION_OFFSET: usize = P_ID_OFFSET + 6;
const P_BASE_OFFSET: usize = P_VERSION_OFFSET + 1;
const P_HEIGHT_OFFSET: usize = P_BASE_OFFSET + 8;
const P_BLOCK_SIZE_OFFSET: usize = P_HEIGHT_OFFSET + 4;
const P_BPB_OFFSET: usize = P_BLOCK_SIZE_OFFSET + 4;
const P_ENCRYPTED_FLAG_OFFSET: usize = P_BPB_OFFSET + 4;
const P_ENCRYPTION_CONFIG_OFFSET: usize = P_ENCRYPTED_FLAG_OFFSET + 1;

/// Heap payload size for unencrypted files.
const HEAP_PAYLOAD_SIZE_PLAIN: u32 = P_ENCRYPTION_CONFIG_OFFSET as u32; // = 28

/// Heap payload size for encrypted files.
const HEAP_PAYLOAD_SIZE_ENCRYPTED: u32 =
    HEAP_PAYLOAD_SIZE_PLAIN + encryption::ENCRYPTION_CONFIG_SIZE as u32; // = 157

const HEAP_IDENTIFIER: &[u8; 6] = b"vheap0";

const HEAP_VERSION: u8 = 0;

/// Buckets initialized per file write during setup.
const SETUP_BATCH_BUCKETS: u64 = 256;

/// Bucket storage in a single file managed by a [`FileLayer`].
///
/// Bucket `b` lives at file offset `data_offset + b * bucket_size`. When the
/// heap was set up with a password, every bucket is AES-256-XTS encrypted
/// with its index as the tweak; the master key is wrapped under an
/// Argon2id-derived KEK in the heap header section.
///
/// Contiguous runs of bucket indices are served with a single file read or
/// write. Clones reopen the file through the file layer and share the
/// cipher.
pub struct EncryptedHeapStorage<F: FileLayer> {
    file: F,
    geometry: HeapGeometry,
    block_size: usize,
    blocks_per_bucket: usize,
    user_slot: HeaderSlotId,
    cipher: Option<Arc<HeapCipher>>,
    traffic: TrafficCounters,
}

/// Heap section contents, as stored in the header.
struct HeapHeader {
    geometry: HeapGeometry,
    block_size: usize,
    blocks_per_bucket: usize,
    encryption_config: Option<EncryptionConfig>,
}

impl<F: FileLayer> EncryptedHeapStorage<F> {
    /// Open an existing heap file.
    ///
    /// `password` is required if the heap was set up with encryption and
    /// must be absent otherwise.
    pub fn open(path: &str, mode: OpenMode, password: Option<&[u8]>) -> Result<Self, HeapError> {
        let file = F::open(path, mode)?;
        let heap_slot = file.header_slot_for_upper(0);
        let user_slot = file.header_slot_for_upper(1);

        let header = Self::deserialize_header(&file.read_header_slot(heap_slot)?)?;

        let cipher = match (&header.encryption_config, password) {
            (Some(config), Some(pw)) => Some(Arc::new(HeapCipher::unlock(config, pw)?)),
            (Some(_), None) => {
                return Err(HeapError::EncryptionRequired(
                    "heap is encrypted but no password was provided".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(HeapError::IoError(
                    "password provided but heap is not encrypted".to_string(),
                ))
            }
            (None, None) => None,
        };

        let overflow = || {
            HeapError::IoError(format!(
                "heap header describes {} buckets of {} x {} bytes, which overflows",
                header.geometry.bucket_count(),
                header.blocks_per_bucket,
                header.block_size
            ))
        };
        let bucket_size = header
            .block_size
            .checked_mul(header.blocks_per_bucket)
            .ok_or_else(overflow)?;
        let expected_len = header
            .geometry
            .bucket_count()
            .checked_mul(bucket_size as u64)
            .and_then(|data_len| data_len.checked_add(file.data_offset()))
            .ok_or_else(overflow)?;
        let file_len = file.len()?;
        if file_len != expected_len {
            return Err(HeapError::IoError(format!(
                "heap file is {} bytes, expected {} for {} buckets of {} bytes",
                file_len,
                expected_len,
                header.geometry.bucket_count(),
                bucket_size
            )));
        }

        tracing::debug!(
            path,
            levels = header.geometry.levels(),
            bucket_size,
            encrypted = cipher.is_some(),
            "opened heap storage"
        );

        Ok(EncryptedHeapStorage {
            file,
            geometry: header.geometry,
            block_size: header.block_size,
            blocks_per_bucket: header.blocks_per_bucket,
            user_slot,
            cipher,
            traffic: TrafficCounters::default(),
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    fn bucket_offset(&self, bucket: u64) -> u64 {
        self.file.data_offset() + bucket * self.bucket_size() as u64
    }

    fn serialize_header(
        geometry: &HeapGeometry,
        block_size: usize,
        blocks_per_bucket: usize,
        encryption_config: Option<&EncryptionConfig>,
    ) -> Vec<u8> {
        let payload_size = if encryption_config.is_some() {
            HEAP_PAYLOAD_SIZE_ENCRYPTED
        } else {
            HEAP_PAYLOAD_SIZE_PLAIN
        };
        let mut buf = Vec::with_capacity(payload_size as usize);
        buf.extend_from_slice(HEAP_IDENTIFIER);
        buf.push(HEAP_VERSION);
        buf.extend_from_slice(&geometry.heap_base().to_le_bytes());
        buf.extend_from_slice(&(geometry.height() as u32).to_le_bytes());
        buf.extend_from_slice(&(block_size as u32).to_le_bytes());
        buf.extend_from_slice(&(blocks_per_bucket as u32).to_le_bytes());
        if let Some(config) = encryption_config {
            buf.push(1);
            buf.extend_from_slice(&config.to_bytes());
        } else {
            buf.push(0);
        }
        buf
    }

    fn deserialize_header(payload: &[u8]) -> Result<HeapHeader, HeapError> {
        if payload.len() < HEAP_PAYLOAD_SIZE_PLAIN as usize {
            return Err(HeapError::IoError(format!(
                "heap header payload too short: {} < {}",
                payload.len(),
                HEAP_PAYLOAD_SIZE_PLAIN
            )));
        }
        if &payload[P_ID_OFFSET..P_VERSION_OFFSET] != HEAP_IDENTIFIER {
            return Err(HeapError::IoError(format!(
                "expected heap identifier 'vheap0', got '{}'",
                String::from_utf8_lossy(&payload[P_ID_OFFSET..P_VERSION_OFFSET])
            )));
        }
        if payload[P_VERSION_OFFSET] != HEAP_VERSION {
            return Err(HeapError::IoError(format!(
                "unsupported heap header version: {}",
                payload[P_VERSION_OFFSET]
            )));
        }

        let mut base = [0u8; 8];
        base.copy_from_slice(&payload[P_BASE_OFFSET..P_HEIGHT_OFFSET]);
        let heap_base = u64::from_le_bytes(base);
        let height = read_u32(payload, P_HEIGHT_OFFSET) as usize;
        let block_size = read_u32(payload, P_BLOCK_SIZE_OFFSET) as usize;
        let blocks_per_bucket = read_u32(payload, P_BPB_OFFSET) as usize;
        let geometry = HeapGeometry::new(heap_base, height)?;

        let encryption_config = if payload[P_ENCRYPTED_FLAG_OFFSET] == 1 {
            Some(EncryptionConfig::from_bytes(
                &payload[P_ENCRYPTION_CONFIG_OFFSET..],
            )?)
        } else {
            None
        };

        Ok(HeapHeader {
            geometry,
            block_size,
            blocks_per_bucket,
            encryption_config,
        })
    }

    fn require_write(&self) -> Result<(), HeapError> {
        if self.file.mode() == OpenMode::Read {
            return Err(HeapError::ReadOnly(format!(
                "heap file '{}' is opened for reading",
                self.file.path()
            )));
        }
        Ok(())
    }

    fn check_index(&self, bucket: u64) -> Result<(), HeapError> {
        if bucket >= self.geometry.bucket_count() {
            return Err(HeapError::OutOfRange(format!(
                "bucket {} is outside the heap ({} buckets)",
                bucket,
                self.geometry.bucket_count()
            )));
        }
        Ok(())
    }

    /// Read `count` consecutive buckets starting at `first`, decrypted and
    /// concatenated.
    fn read_run(&self, first: u64, count: usize) -> Result<Vec<u8>, HeapError> {
        let bucket_size = self.bucket_size();
        let mut raw = vec![0u8; count * bucket_size];
        let n = self.file.read(self.bucket_offset(first), &mut raw)?;
        self.traffic.record_received(n);
        if n != raw.len() {
            return Err(HeapError::IoError(format!(
                "short read of buckets {}..{}: {} of {} bytes",
                first,
                first + count as u64,
                n,
                raw.len()
            )));
        }
        if let Some(cipher) = &self.cipher {
            cipher.decrypt_run(&mut raw, bucket_size, first);
        }
        Ok(raw)
    }

    /// Encrypt (if needed) and write concatenated plaintext buckets starting
    /// at `first`.
    fn write_run(&self, first: u64, mut plain: Vec<u8>) -> Result<(), HeapError> {
        if let Some(cipher) = &self.cipher {
            cipher.encrypt_run(&mut plain, self.bucket_size(), first);
        }
        self.file.write(self.bucket_offset(first), &plain)?;
        self.traffic.record_sent(plain.len());
        Ok(())
    }

    /// Fill every bucket with its initial plaintext.
    fn initialize_buckets(&self, options: &SetupOptions) -> Result<(), HeapError> {
        // set_len already zero-filled the data region
        if options.initialize.is_none() && self.cipher.is_none() {
            return Ok(());
        }
        let bucket_count = self.geometry.bucket_count();
        let mut first = 0;
        while first < bucket_count {
            let end = (first + SETUP_BATCH_BUCKETS).min(bucket_count);
            let mut plain = Vec::with_capacity((end - first) as usize * self.bucket_size());
            for bucket in first..end {
                plain.extend_from_slice(&options.initial_bucket(bucket)?);
            }
            if let Some(cipher) = &self.cipher {
                cipher.encrypt_run(&mut plain, self.bucket_size(), first);
            }
            self.file.write(self.bucket_offset(first), &plain)?;
            first = end;
        }
        Ok(())
    }
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[pos..pos + 4]);
    u32::from_le_bytes(bytes)
}

/// Split `indices` into maximal runs of consecutive ascending bucket
/// indices. Returns `(position in indices, run length)` pairs.
fn contiguous_runs(indices: &[u64]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=indices.len() {
        if i == indices.len() || indices[i] != indices[i - 1] + 1 {
            if i > start {
                runs.push((start, i - start));
            }
            start = i;
        }
    }
    runs
}

impl<F: FileLayer> HeapStorage for EncryptedHeapStorage<F> {
    fn setup(storage_name: &str, options: &SetupOptions) -> Result<Self, HeapError> {
        let geometry = options.geometry()?;
        let bucket_size = options.bucket_size();

        let (cipher, encryption_config) = if let Some(pw) = &options.password {
            if bucket_size < encryption::MIN_ENCRYPTED_BUCKET_SIZE {
                return Err(HeapError::Configuration(format!(
                    "encrypted heaps need buckets of at least {} bytes, got {}",
                    encryption::MIN_ENCRYPTED_BUCKET_SIZE,
                    bucket_size
                )));
            }
            let (config, cipher) = HeapCipher::create(pw, &options.kdf)?;
            (Some(Arc::new(cipher)), Some(config))
        } else {
            (None, None)
        };

        let header_len = u32::try_from(options.header_data.len()).map_err(|_| {
            HeapError::InvalidArgument(format!(
                "header data of {} bytes is too large",
                options.header_data.len()
            ))
        })?;
        let payload_size = if encryption_config.is_some() {
            HEAP_PAYLOAD_SIZE_ENCRYPTED
        } else {
            HEAP_PAYLOAD_SIZE_PLAIN
        };

        let data_len = geometry
            .bucket_count()
            .checked_mul(bucket_size as u64)
            .ok_or_else(|| {
                HeapError::Configuration(format!(
                    "{} buckets of {} bytes overflow the file size",
                    geometry.bucket_count(),
                    bucket_size
                ))
            })?;

        let file = F::create(storage_name, VecDeque::from(vec![payload_size, header_len]))?;
        let heap_slot = file.header_slot_for_upper(0);
        let user_slot = file.header_slot_for_upper(1);

        let heap_payload = Self::serialize_header(
            &geometry,
            options.block_size,
            options.blocks_per_bucket,
            encryption_config.as_ref(),
        );
        file.write_header_slot(heap_slot, &heap_payload)?;
        file.write_header_slot(user_slot, &options.header_data)?;
        file.set_len(file.data_offset() + data_len)?;

        let storage = EncryptedHeapStorage {
            file,
            geometry,
            block_size: options.block_size,
            blocks_per_bucket: options.blocks_per_bucket,
            user_slot,
            cipher,
            traffic: TrafficCounters::default(),
        };
        storage.initialize_buckets(options)?;

        tracing::debug!(
            path = storage_name,
            buckets = geometry.bucket_count(),
            bucket_size,
            encrypted = storage.is_encrypted(),
            "set up heap storage"
        );
        Ok(storage)
    }

    fn clone_device(&self) -> Result<Self, HeapError> {
        Ok(EncryptedHeapStorage {
            file: self.file.reopen()?,
            geometry: self.geometry,
            block_size: self.block_size,
            blocks_per_bucket: self.blocks_per_bucket,
            user_slot: self.user_slot,
            cipher: self.cipher.clone(),
            traffic: TrafficCounters::default(),
        })
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

    fn storage_name(&self) -> &str {
        self.file.path()
    }

    fn key(&self) -> Option<&[u8]> {
        self.cipher.as_deref().map(HeapCipher::master_key)
    }

    fn header_data(&self) -> Result<Vec<u8>, HeapError> {
        self.file.read_header_slot(self.user_slot)
    }

    fn is_read_only(&self) -> bool {
        self.file.mode() == OpenMode::Read
    }

    fn update_header_data(&self, new_header: &[u8]) -> Result<(), HeapError> {
        self.require_write()?;
        let current_len = self.header_data()?.len();
        if new_header.len() != current_len {
            return Err(HeapError::InvalidArgument(format!(
                "new header data is {} bytes, must stay {} bytes",
                new_header.len(),
                current_len
            )));
        }
        self.file.write_header_slot(self.user_slot, new_header)
    }

    fn read_blocks(&self, indices: &[u64]) -> Result<Vec<Vec<u8>>, HeapError> {
        for &bucket in indices {
            self.check_index(bucket)?;
        }
        let bucket_size = self.bucket_size();
        let mut buckets = Vec::with_capacity(indices.len());
        for (start, len) in contiguous_runs(indices) {
            let raw = self.read_run(indices[start], len)?;
            buckets.extend(raw.chunks_exact(bucket_size).map(<[u8]>::to_vec));
        }
        Ok(buckets)
    }

    fn write_blocks<B: AsRef<[u8]>>(&self, indices: &[u64], buckets: &[B]) -> Result<usize, HeapError> {
        self.require_write()?;
        check_buckets(indices, buckets, self.bucket_size())?;
        for &bucket in indices {
            self.check_index(bucket)?;
        }
        for (start, len) in contiguous_runs(indices) {
            let mut plain = Vec::with_capacity(len * self.bucket_size());
            for bucket in &buckets[start..start + len] {
                plain.extend_from_slice(bucket.as_ref());
            }
            self.write_run(indices[start], plain)?;
        }
        Ok(indices.len())
    }

    fn bytes_sent(&self) -> u64 {
        self.traffic.sent()
    }

    fn bytes_received(&self) -> u64 {
        self.traffic.received()
    }

    fn close(self) -> Result<(), HeapError> {
        if !self.is_read_only() {
            self.file.sync()?;
        }
        tracing::debug!(
            path = self.file.path(),
            bytes_sent = self.traffic.sent(),
            bytes_received = self.traffic.received(),
            "closed heap storage"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileOnDisk, KdfParams};

    type HeapFile = EncryptedHeapStorage<FileOnDisk>;

    const FAST_KDF: KdfParams = KdfParams {
        m_cost: 256,
        t_cost: 1,
        p_cost: 1,
    };

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_string()
    }

    fn tagged_bucket(index: u64) -> Vec<u8> {
        let mut bucket = vec![0u8; 32];
        bucket[..8].copy_from_slice(&index.to_le_bytes());
        bucket[8..].iter_mut().for_each(|b| *b = 0xA5);
        bucket
    }

    #[test]
    fn contiguous_runs_split_on_gaps() {
        assert!(contiguous_runs(&[]).is_empty());
        assert_eq!(contiguous_runs(&[4]), vec![(0, 1)]);
        assert_eq!(contiguous_runs(&[0, 1, 2, 5, 6, 2]), vec![(0, 3), (3, 2), (5, 1)]);
        assert_eq!(contiguous_runs(&[0, 2, 6]), vec![(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn setup_initializes_every_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "init.heap");
        let opts = SetupOptions::new(3, 32).initialize(tagged_bucket);
        let heap = HeapFile::setup(&path, &opts).unwrap();
        assert_eq!(heap.bucket_count(), 15);
        assert_eq!(heap.bucket_size(), 32);
        assert!(!heap.is_encrypted());

        let all: Vec<u64> = (0..15).collect();
        let buckets = heap.read_blocks(&all).unwrap();
        for (i, bucket) in buckets.iter().enumerate() {
            assert_eq!(bucket, &tagged_bucket(i as u64));
        }
        assert_eq!(heap.bytes_received(), 15 * 32);
        heap.close().unwrap();
    }

    #[test]
    fn encrypted_heap_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "enc.heap");
        let opts = SetupOptions::new(2, 16)
            .blocks_per_bucket(2)
            .header_data(b"user-header".to_vec())
            .password(b"secret".to_vec())
            .kdf(FAST_KDF)
            .initialize(tagged_bucket);

        let key = {
            let heap = HeapFile::setup(&path, &opts).unwrap();
            assert!(heap.is_encrypted());
            heap.write_blocks(&[5, 2], &[vec![1u8; 32], vec![2u8; 32]])
                .unwrap();
            let key = heap.key().unwrap().to_vec();
            heap.close().unwrap();
            key
        };

        // Ciphertext on disk differs from the plaintext
        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(32).any(|w| w == tagged_bucket(3).as_slice()));

        let heap = HeapFile::open(&path, OpenMode::Write, Some(b"secret".as_slice())).unwrap();
        assert_eq!(heap.key().unwrap(), key.as_slice());
        assert_eq!(heap.header_data().unwrap(), b"user-header");
        assert_eq!(heap.read_blocks(&[5]).unwrap(), vec![vec![1u8; 32]]);
        assert_eq!(heap.read_blocks(&[2]).unwrap(), vec![vec![2u8; 32]]);
        assert_eq!(heap.read_blocks(&[3]).unwrap(), vec![tagged_bucket(3)]);
        heap.close().unwrap();
    }

    #[test]
    fn open_checks_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "pw.heap");
        let opts = SetupOptions::new(1, 16).password(b"pw".to_vec()).kdf(FAST_KDF);
        HeapFile::setup(&path, &opts).unwrap().close().unwrap();

        assert!(matches!(
            HeapFile::open(&path, OpenMode::Read, None),
            Err(HeapError::EncryptionRequired(_))
        ));
        assert!(matches!(
            HeapFile::open(&path, OpenMode::Read, Some(b"nope".as_slice())),
            Err(HeapError::WrongPassword(_))
        ));

        let plain_path = temp_path(&dir, "plain.heap");
        HeapFile::setup(&plain_path, &SetupOptions::new(1, 16))
            .unwrap()
            .close()
            .unwrap();
        assert!(HeapFile::open(&plain_path, OpenMode::Read, Some(b"pw".as_slice())).is_err());
    }

    #[test]
    fn encrypted_buckets_must_fit_xts() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "tiny.heap");
        let opts = SetupOptions::new(1, 8).password(b"pw".to_vec()).kdf(FAST_KDF);
        assert!(matches!(
            HeapFile::setup(&path, &opts),
            Err(HeapError::Configuration(_))
        ));
    }

    #[test]
    fn header_data_keeps_its_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "hdr.heap");
        let heap = HeapFile::setup(&path, &SetupOptions::new(1, 16).header_data(b"abcd".to_vec()))
            .unwrap();
        heap.update_header_data(b"wxyz").unwrap();
        assert_eq!(heap.header_data().unwrap(), b"wxyz");
        assert!(matches!(
            heap.update_header_data(b"toolong"),
            Err(HeapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn clones_share_medium_but_not_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "clone.heap");
        let opts = SetupOptions::new(2, 16).password(b"pw".to_vec()).kdf(FAST_KDF);
        let heap = HeapFile::setup(&path, &opts).unwrap();
        let clone = heap.clone_device().unwrap();

        clone.write_blocks(&[4], &[vec![9u8; 16]]).unwrap();
        assert_eq!(heap.read_blocks(&[4]).unwrap(), vec![vec![9u8; 16]]);
        assert_eq!(clone.bytes_sent(), 16);
        assert_eq!(clone.bytes_received(), 0);
        assert_eq!(heap.bytes_sent(), 0);
        assert_eq!(heap.bytes_received(), 16);

        clone.close().unwrap();
        heap.close().unwrap();
    }

    #[test]
    fn read_only_handles_refuse_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "ro.heap");
        HeapFile::setup(&path, &SetupOptions::new(2, 16).header_data(b"hd".to_vec()))
            .unwrap()
            .close()
            .unwrap();

        let heap = HeapFile::open(&path, OpenMode::Read, None).unwrap();
        let clone = heap.clone_device().unwrap();
        assert!(heap.is_read_only());
        assert!(clone.is_read_only());
        for handle in [&heap, &clone] {
            assert!(matches!(
                handle.write_blocks(&[3], &[vec![7u8; 16]]),
                Err(HeapError::ReadOnly(_))
            ));
            assert!(matches!(
                handle.update_header_data(b"xy"),
                Err(HeapError::ReadOnly(_))
            ));
        }
        assert_eq!(clone.read_blocks(&[3]).unwrap(), vec![vec![0u8; 16]]);
        assert_eq!(heap.header_data().unwrap(), b"hd");
        clone.close().unwrap();
        heap.close().unwrap();
    }

    #[test]
    fn open_rejects_a_header_whose_size_overflows() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "huge.heap");
        HeapFile::setup(&path, &SetupOptions::new(2, 16))
            .unwrap()
            .close()
            .unwrap();
        {
            let file = FileOnDisk::open(&path, OpenMode::Write).unwrap();
            let slot = file.header_slot_for_upper(0);
            let mut payload = file.read_header_slot(slot).unwrap();
            payload[P_HEIGHT_OFFSET..P_BLOCK_SIZE_OFFSET].copy_from_slice(&40u32.to_le_bytes());
            payload[P_BLOCK_SIZE_OFFSET..P_BPB_OFFSET].copy_from_slice(&u32::MAX.to_le_bytes());
            payload[P_BPB_OFFSET..P_ENCRYPTED_FLAG_OFFSET].copy_from_slice(&u32::MAX.to_le_bytes());
            file.write_header_slot(slot, &payload).unwrap();
        }
        assert!(matches!(
            HeapFile::open(&path, OpenMode::Read, None),
            Err(HeapError::IoError(_))
        ));
    }

    #[test]
    fn path_operations_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "path.heap");
        let heap = HeapFile::setup(&path, &SetupOptions::new(2, 16)).unwrap();

        let data = vec![vec![1u8; 16], vec![2u8; 16], vec![3u8; 16]];
        heap.write_path(5, &data, 0).unwrap();
        assert_eq!(heap.read_path(5, 0).unwrap(), data);
        assert_eq!(heap.read_path(5, 1).unwrap(), data[1..].to_vec());
        assert_eq!(heap.read_blocks(&[0, 2, 5]).unwrap(), data);

        assert!(matches!(heap.read_path(7, 0), Err(HeapError::OutOfRange(_))));
        assert!(matches!(heap.read_path(5, 4), Err(HeapError::OutOfRange(_))));
        assert!(matches!(
            heap.write_blocks(&[1], &[vec![0u8; 3]]),
            Err(HeapError::InvalidArgument(_))
        ));
    }
}
