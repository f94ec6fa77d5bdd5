use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use fs2::FileExt;

use crate::file_layer::FileLayer;
use crate::{HeaderSlotId, HeapError, OpenMode};

const MAGIC: &[u8; 8] = b"oramheap";
const FORMAT_VERSION: u8 = 1;

/// magic | format version | slot count
const PREAMBLE_SIZE: usize = MAGIC.len() + 1 + 1;

/// Every slot has a u32 payload length in the slot table.
const SLOT_ENTRY_SIZE: usize = 4;

// File header:
//
//   | "oramheap" | version: u8 | slot_count: u8 |
//   | payload_len: u32 | ... one per slot ...      |
//   | payload 0 | payload 1 | ...                  |
//   | bucket data ...                              |
//
// Slot sizes are fixed at create time, so the layout (and `data_offset`)
// can be recomputed from the slot table alone.

#[derive(Debug, Clone, Copy)]
struct SlotInfo {
    /// Absolute offset of the payload.
    offset: u64,
    len: u32,
}

#[derive(Debug, Clone)]
struct HeaderLayout {
    slots: Vec<SlotInfo>,
    data_offset: u64,
}

impl HeaderLayout {
    fn new(payload_lens: &[u32]) -> Result<Self, HeapError> {
        if payload_lens.len() > u8::MAX as usize {
            return Err(HeapError::InvalidArgument(format!(
                "{} header slots requested, at most {} supported",
                payload_lens.len(),
                u8::MAX
            )));
        }
        let mut offset = (PREAMBLE_SIZE + SLOT_ENTRY_SIZE * payload_lens.len()) as u64;
        let slots = payload_lens
            .iter()
            .map(|&len| {
                let slot = SlotInfo { offset, len };
                offset += len as u64;
                slot
            })
            .collect();
        Ok(HeaderLayout {
            slots,
            data_offset: offset,
        })
    }

    /// Preamble plus slot table; payloads start zeroed.
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data_offset as usize);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.push(self.slots.len() as u8);
        for slot in &self.slots {
            out.extend_from_slice(&slot.len.to_le_bytes());
        }
        out.resize(self.data_offset as usize, 0);
        out
    }

    fn decode(file: &mut fs::File) -> Result<Self, HeapError> {
        let mut preamble = [0u8; PREAMBLE_SIZE];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut preamble))
            .map_err(io_error("reading heap file preamble"))?;
        if &preamble[..MAGIC.len()] != MAGIC {
            return Err(HeapError::IoError("not a heap file (bad magic)".to_string()));
        }
        let version = preamble[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(HeapError::IoError(format!(
                "unsupported heap file format {}",
                version
            )));
        }

        let slot_count = preamble[MAGIC.len() + 1] as usize;
        let mut table = vec![0u8; slot_count * SLOT_ENTRY_SIZE];
        file.read_exact(&mut table)
            .map_err(io_error("reading header slot table"))?;
        let lens: Vec<u32> = table
            .chunks_exact(SLOT_ENTRY_SIZE)
            .map(|entry| u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]))
            .collect();
        Self::new(&lens)
    }
}

fn io_error(context: &'static str) -> impl Fn(io::Error) -> HeapError {
    move |e| HeapError::IoError(format!("{}: {}", context, e))
}

fn lock_conflict(e: io::Error) -> HeapError {
    HeapError::LockConflict(format!("heap file is locked by another process: {}", e))
}

/// [`FileLayer`] over a real file.
///
/// The handle returned by `create`/`open` holds an advisory process lock
/// (fs2) for as long as it lives; handles made by `reopen` share the file
/// without locking it again.
pub struct FileOnDisk {
    path: String,
    mode: OpenMode,
    file: Mutex<fs::File>,
    layout: HeaderLayout,
}

impl FileOnDisk {
    fn slot(&self, slot: HeaderSlotId) -> Result<SlotInfo, HeapError> {
        self.layout.slots.get(slot.0 as usize).copied().ok_or_else(|| {
            HeapError::IoError(format!(
                "no header slot {} (file has {})",
                slot.0,
                self.layout.slots.len()
            ))
        })
    }
}

impl FileLayer for FileOnDisk {
    fn create(path: &str, mut slot_sizes: VecDeque<u32>) -> Result<Self, HeapError> {
        if Path::new(path).exists() {
            return Err(HeapError::AlreadyExists(path.to_string()));
        }
        let layout = HeaderLayout::new(slot_sizes.make_contiguous())?;

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(io_error("creating heap file"))?;
        FileExt::try_lock_exclusive(&file).map_err(lock_conflict)?;
        file.write_all(&layout.encode())
            .map_err(io_error("writing heap file header"))?;

        Ok(FileOnDisk {
            path: path.to_string(),
            mode: OpenMode::Write,
            file: Mutex::new(file),
            layout,
        })
    }

    fn open(path: &str, mode: OpenMode) -> Result<Self, HeapError> {
        if !Path::new(path).exists() {
            return Err(HeapError::NotFound(path.to_string()));
        }
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::Write)
            .open(path)
            .map_err(io_error("opening heap file"))?;
        let locked = match mode {
            OpenMode::Read => FileExt::try_lock_shared(&file),
            OpenMode::Write => FileExt::try_lock_exclusive(&file),
        };
        locked.map_err(lock_conflict)?;

        let layout = HeaderLayout::decode(&mut file)?;
        Ok(FileOnDisk {
            path: path.to_string(),
            mode,
            file: Mutex::new(file),
            layout,
        })
    }

    fn reopen(&self) -> Result<Self, HeapError> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(self.mode == OpenMode::Write)
            .open(&self.path)
            .map_err(io_error("reopening heap file"))?;
        Ok(FileOnDisk {
            path: self.path.clone(),
            mode: self.mode,
            file: Mutex::new(file),
            layout: self.layout.clone(),
        })
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn data_offset(&self) -> u64 {
        self.layout.data_offset
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, HeapError> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .map_err(io_error("seeking heap file"))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_error("reading heap file")(e)),
            }
        }
        Ok(filled)
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), HeapError> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(io_error("writing heap file"))
    }

    fn len(&self) -> Result<u64, HeapError> {
        let file = self.file.lock().unwrap();
        Ok(file.metadata().map_err(io_error("reading file metadata"))?.len())
    }

    fn set_len(&self, len: u64) -> Result<(), HeapError> {
        let file = self.file.lock().unwrap();
        file.set_len(len).map_err(io_error("resizing heap file"))
    }

    fn sync(&self) -> Result<(), HeapError> {
        let file = self.file.lock().unwrap();
        file.sync_all().map_err(io_error("syncing heap file"))
    }

    fn header_slot_for_upper(&self, index: u8) -> HeaderSlotId {
        HeaderSlotId(index)
    }

    fn write_header_slot(&self, slot: HeaderSlotId, data: &[u8]) -> Result<(), HeapError> {
        let info = self.slot(slot)?;
        if data.len() != info.len as usize {
            return Err(HeapError::InvalidArgument(format!(
                "header slot {} holds {} bytes, got {}",
                slot.0,
                info.len,
                data.len()
            )));
        }
        self.write(info.offset, data)
    }

    fn read_header_slot(&self, slot: HeaderSlotId) -> Result<Vec<u8>, HeapError> {
        let info = self.slot(slot)?;
        let mut buf = vec![0u8; info.len as usize];
        let n = self.read(info.offset, &mut buf)?;
        if n != buf.len() {
            return Err(HeapError::IoError(format!(
                "header slot {} truncated: {} of {} bytes",
                slot.0,
                n,
                buf.len()
            )));
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn slots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "slots.heap");

        {
            let disk = FileOnDisk::create(&path, VecDeque::from(vec![5, 3])).unwrap();
            assert_eq!(disk.data_offset(), (PREAMBLE_SIZE + 2 * SLOT_ENTRY_SIZE + 8) as u64);
            disk.write_header_slot(disk.header_slot_for_upper(0), b"hello")
                .unwrap();
            disk.write_header_slot(disk.header_slot_for_upper(1), b"abc")
                .unwrap();
        }

        let disk = FileOnDisk::open(&path, OpenMode::Read).unwrap();
        assert_eq!(disk.data_offset(), (PREAMBLE_SIZE + 2 * SLOT_ENTRY_SIZE + 8) as u64);
        assert_eq!(disk.read_header_slot(disk.header_slot_for_upper(0)).unwrap(), b"hello");
        assert_eq!(disk.read_header_slot(disk.header_slot_for_upper(1)).unwrap(), b"abc");
    }

    #[test]
    fn slot_length_is_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "len.heap");
        let disk = FileOnDisk::create(&path, VecDeque::from(vec![4])).unwrap();
        let slot = disk.header_slot_for_upper(0);
        assert!(matches!(
            disk.write_header_slot(slot, b"toolong"),
            Err(HeapError::InvalidArgument(_))
        ));
        assert!(disk.read_header_slot(HeaderSlotId(9)).is_err());
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "exists.heap");
        let _disk = FileOnDisk::create(&path, VecDeque::new()).unwrap();
        assert!(matches!(
            FileOnDisk::create(&path, VecDeque::new()),
            Err(HeapError::AlreadyExists(_))
        ));
    }

    #[test]
    fn reopened_handle_shares_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "reopen.heap");
        let disk = FileOnDisk::create(&path, VecDeque::new()).unwrap();
        let offset = disk.data_offset();
        disk.set_len(offset + 32).unwrap();

        let other = disk.reopen().unwrap();
        other.write(offset, &[7u8; 32]).unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(disk.read(offset, &mut buf).unwrap(), 32);
        assert_eq!(buf, [7u8; 32]);
        assert_eq!(disk.len().unwrap(), offset + 32);

        // Short read at the end of the file.
        let mut tail = [0u8; 16];
        assert_eq!(disk.read(offset + 24, &mut tail).unwrap(), 8);
    }

    #[test]
    fn reopen_keeps_the_open_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "mode.heap");
        {
            let disk = FileOnDisk::create(&path, VecDeque::new()).unwrap();
            assert_eq!(disk.reopen().unwrap().mode(), OpenMode::Write);
            disk.set_len(disk.data_offset() + 16).unwrap();
        }

        let disk = FileOnDisk::open(&path, OpenMode::Read).unwrap();
        let other = disk.reopen().unwrap();
        assert_eq!(other.mode(), OpenMode::Read);
        assert!(other.write(disk.data_offset(), &[1u8; 16]).is_err());

        let mut buf = [0xFFu8; 16];
        assert_eq!(disk.read(disk.data_offset(), &mut buf).unwrap(), 16);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn open_rejects_foreign_and_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "garbage.heap");
        std::fs::write(&path, b"this is not a heap file at all").unwrap();
        assert!(matches!(
            FileOnDisk::open(&path, OpenMode::Read),
            Err(HeapError::IoError(_))
        ));
        assert!(matches!(
            FileOnDisk::open(&temp_path(&dir, "missing.heap"), OpenMode::Read),
            Err(HeapError::NotFound(_))
        ));
    }
}
