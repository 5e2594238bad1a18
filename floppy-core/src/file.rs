//! File-level operations over a FAT12 image buffer.
//!
//! Handles are ephemeral, process-local records tracked in a [`FileTable`];
//! nothing about them is persisted. All on-disk effects go through the FAT
//! and root-directory primitives in [`crate::fat`], so callers hand in the
//! mounted image buffer for every operation.

use std::collections::HashMap;

use crate::error::{FloppyError, FloppyResult};
use crate::fat::{self, dir, DirEntry, FileInfo};
use crate::sector::SECTOR_SIZE;

/// Access mode of an open file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// An open file.
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub id: u32,
    pub drive: char,
    pub name: String,
    pub mode: OpenMode,
    pub position: u32,
    pub start_cluster: u16,
    pub size: u32,
}

/// Table of open file handles.
#[derive(Default)]
pub struct FileTable {
    handles: HashMap<u32, FileHandle>,
    next_id: u32,
}

impl FileTable {
    pub fn new() -> Self {
        FileTable {
            handles: HashMap::new(),
            next_id: 1,
        }
    }

    fn insert(
        &mut self,
        drive: char,
        name: String,
        mode: OpenMode,
        start_cluster: u16,
        size: u32,
    ) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(
            id,
            FileHandle {
                id,
                drive,
                name,
                mode,
                position: 0,
                start_cluster,
                size,
            },
        );
        id
    }

    /// Open an existing file for reading. Fails if the name does not
    /// resolve to a directory entry.
    pub fn open_read(&mut self, buffer: &[u8], drive: char, name: &str) -> FloppyResult<u32> {
        let normalized = dir::to_8_3(name);
        let index = dir::find_entry(buffer, &normalized).ok_or_else(|| {
            log::warn!("open {}: file not found", normalized);
            FloppyError::FileNotFound(normalized.clone())
        })?;
        let offset = dir::entry_offset(index);
        let info = dir::parse_entry(&buffer[offset..offset + dir::DIR_ENTRY_SIZE]);
        Ok(self.insert(drive, normalized, OpenMode::Read, info.start_cluster, info.size))
    }

    /// Open a file for writing.
    ///
    /// An existing file's cluster chain is freed first: old data is
    /// discarded, not appended to. A new file gets a single cluster marked
    /// end-of-chain and a fresh directory entry; both the cluster and the
    /// root-directory slot must be available or the open fails with the
    /// on-disk state rolled back.
    pub fn open_write(&mut self, buffer: &mut [u8], drive: char, name: &str) -> FloppyResult<u32> {
        let normalized = dir::to_8_3(name);

        let start_cluster = match dir::find_entry(buffer, &normalized) {
            Some(index) => {
                let offset = dir::entry_offset(index);
                let old = dir::parse_entry(&buffer[offset..offset + dir::DIR_ENTRY_SIZE]);
                if old.start_cluster >= fat::FIRST_DATA_CLUSTER {
                    fat::free_cluster_chain(fat::fat_mut(buffer), old.start_cluster);
                }
                let start = fat::allocate_cluster_chain(fat::fat_mut(buffer), 1);
                fat::sync_fat_copies(buffer);
                if start == 0 {
                    DirEntry::at(buffer, index).mark_deleted();
                    log::warn!("open {}: no free cluster", normalized);
                    return Err(FloppyError::DiskFull);
                }
                let mut entry = DirEntry::at(buffer, index);
                entry.set_start_cluster(start);
                entry.set_file_size(0);
                start
            }
            None => {
                let start = fat::allocate_cluster_chain(fat::fat_mut(buffer), 1);
                if start == 0 {
                    log::warn!("open {}: no free cluster", normalized);
                    return Err(FloppyError::DiskFull);
                }
                if let Err(e) =
                    dir::create_entry(buffer, &normalized, dir::ATTR_ARCHIVE, start, 0)
                {
                    fat::free_cluster_chain(fat::fat_mut(buffer), start);
                    fat::sync_fat_copies(buffer);
                    log::warn!("open {}: root directory full", normalized);
                    return Err(e);
                }
                fat::sync_fat_copies(buffer);
                start
            }
        };

        Ok(self.insert(drive, normalized, OpenMode::Write, start_cluster, 0))
    }

    /// Read up to `length` bytes from the current position, walking the
    /// cluster chain as needed. Returns an empty vector at end of file.
    pub fn read(&mut self, buffer: &[u8], handle: u32, length: usize) -> FloppyResult<Vec<u8>> {
        let handle = self
            .handles
            .get_mut(&handle)
            .ok_or(FloppyError::InvalidHandle(handle))?;

        let remaining = handle.size.saturating_sub(handle.position) as usize;
        let want = length.min(remaining);
        if want == 0 {
            return Ok(Vec::new());
        }

        let chain = fat::walk_chain(fat::fat(buffer), handle.start_cluster);
        let mut out = Vec::with_capacity(want);
        let mut position = handle.position as usize;
        while out.len() < want {
            let Some(&cluster) = chain.get(position / SECTOR_SIZE) else {
                break;
            };
            let offset = position % SECTOR_SIZE;
            let take = (SECTOR_SIZE - offset).min(want - out.len());
            let base = fat::cluster_offset(cluster) + offset;
            out.extend_from_slice(&buffer[base..base + take]);
            position += take;
        }
        handle.position = position as u32;
        Ok(out)
    }

    /// Write into the handle's current cluster. A single call never crosses
    /// the cluster boundary: excess data is cut off at the cluster edge and
    /// the number of bytes actually written is returned. Growth past the
    /// recorded size updates both the handle and the on-disk directory
    /// entry.
    pub fn write(&mut self, buffer: &mut [u8], handle: u32, data: &[u8]) -> FloppyResult<usize> {
        let handle = self
            .handles
            .get_mut(&handle)
            .ok_or(FloppyError::InvalidHandle(handle))?;
        if handle.mode != OpenMode::Write {
            return Err(FloppyError::ReadOnlyHandle(handle.id));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let chain = fat::walk_chain(fat::fat(buffer), handle.start_cluster);
        let Some(&cluster) = chain.get(handle.position as usize / SECTOR_SIZE) else {
            log::warn!("write {}: no cluster at position {}", handle.name, handle.position);
            return Err(FloppyError::ChainExhausted);
        };

        let offset = handle.position as usize % SECTOR_SIZE;
        let n = data.len().min(SECTOR_SIZE - offset);
        let base = fat::cluster_offset(cluster) + offset;
        buffer[base..base + n].copy_from_slice(&data[..n]);

        handle.position += n as u32;
        if handle.position > handle.size {
            handle.size = handle.position;
            if let Some(index) = dir::find_entry(buffer, &handle.name) {
                DirEntry::at(buffer, index).set_file_size(handle.size);
            }
        }
        Ok(n)
    }

    /// Close a handle, removing it from the table.
    pub fn close(&mut self, handle: u32) -> FloppyResult<()> {
        self.handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(FloppyError::InvalidHandle(handle))
    }

    pub fn get(&self, handle: u32) -> Option<&FileHandle> {
        self.handles.get(&handle)
    }

    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Drop every handle for a drive (used when its disk is unmounted).
    pub fn close_drive(&mut self, drive: char) {
        self.handles.retain(|_, h| h.drive != drive);
    }
}

/// Delete a file: free its cluster chain and mark the directory slot
/// reusable.
pub fn delete_file(buffer: &mut [u8], name: &str) -> FloppyResult<()> {
    let normalized = dir::to_8_3(name);
    let index = dir::find_entry(buffer, &normalized).ok_or_else(|| {
        log::warn!("delete {}: file not found", normalized);
        FloppyError::FileNotFound(normalized.clone())
    })?;
    let offset = dir::entry_offset(index);
    let info = dir::parse_entry(&buffer[offset..offset + dir::DIR_ENTRY_SIZE]);
    if info.start_cluster >= fat::FIRST_DATA_CLUSTER {
        fat::free_cluster_chain(fat::fat_mut(buffer), info.start_cluster);
        fat::sync_fat_copies(buffer);
    }
    DirEntry::at(buffer, index).mark_deleted();
    Ok(())
}

/// List every used root-directory entry.
pub fn list_files(buffer: &[u8]) -> Vec<FileInfo> {
    let mut out = Vec::new();
    for index in 0..fat::ROOT_DIR_ENTRIES {
        let offset = dir::entry_offset(index);
        let raw = &buffer[offset..offset + dir::DIR_ENTRY_SIZE];
        if raw[0] == dir::ENTRY_NEVER_USED || raw[0] == dir::ENTRY_DELETED {
            continue;
        }
        out.push(dir::parse_entry(raw));
    }
    out
}

/// Look up a single file's directory entry.
pub fn get_file_info(buffer: &[u8], name: &str) -> Option<FileInfo> {
    let index = dir::find_entry(buffer, &dir::to_8_3(name))?;
    let offset = dir::entry_offset(index);
    Some(dir::parse_entry(&buffer[offset..offset + dir::DIR_ENTRY_SIZE]))
}

/// Free-space accounting at 512 bytes per cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub bad_bytes: usize,
}

/// Scan the FAT, counting free/bad/used data clusters (reserved clusters 0
/// and 1 are skipped).
pub fn get_free_space(buffer: &[u8]) -> DiskSpace {
    let fat_slice = fat::fat(buffer);
    let mut free = 0usize;
    let mut bad = 0usize;
    let mut used = 0usize;
    for cluster in fat::FIRST_DATA_CLUSTER..=fat::MAX_DATA_CLUSTER {
        match fat::read_fat12_entry(fat_slice, cluster) {
            Ok(fat::CLUSTER_FREE) => free += 1,
            Ok(fat::CLUSTER_BAD) => bad += 1,
            Ok(_) => used += 1,
            Err(_) => break,
        }
    }
    DiskSpace {
        total_bytes: fat::DATA_CLUSTER_COUNT as usize * SECTOR_SIZE,
        free_bytes: free * SECTOR_SIZE,
        used_bytes: used * SECTOR_SIZE,
        bad_bytes: bad * SECTOR_SIZE,
    }
}

/// Store a whole file in one call, replacing any previous content.
///
/// Allocates a chain sized for `data` up front (the handle layer only ever
/// writes within its current cluster), fills it sector by sector, then
/// writes the directory entry. Failures roll the allocation back.
pub fn store_file(buffer: &mut [u8], name: &str, data: &[u8]) -> FloppyResult<()> {
    let normalized = dir::to_8_3(name);
    let clusters = data.len().div_ceil(SECTOR_SIZE).max(1);

    let existing = dir::find_entry(buffer, &normalized);
    if let Some(index) = existing {
        let offset = dir::entry_offset(index);
        let old = dir::parse_entry(&buffer[offset..offset + dir::DIR_ENTRY_SIZE]);
        if old.start_cluster >= fat::FIRST_DATA_CLUSTER {
            fat::free_cluster_chain(fat::fat_mut(buffer), old.start_cluster);
        }
    }

    let start = fat::allocate_cluster_chain(fat::fat_mut(buffer), clusters);
    if start == 0 {
        if let Some(index) = existing {
            DirEntry::at(buffer, index).mark_deleted();
        }
        fat::sync_fat_copies(buffer);
        log::warn!(
            "store {}: not enough free clusters for {} bytes",
            normalized,
            data.len()
        );
        return Err(FloppyError::DiskFull);
    }

    let chain = fat::walk_chain(fat::fat(buffer), start);
    for (i, &cluster) in chain.iter().enumerate() {
        let begin = i * SECTOR_SIZE;
        let end = (begin + SECTOR_SIZE).min(data.len());
        let chunk = &data[begin..end];
        let base = fat::cluster_offset(cluster);
        buffer[base..base + chunk.len()].copy_from_slice(chunk);
    }

    match existing {
        Some(index) => {
            let mut entry = DirEntry::at(buffer, index);
            entry.set_start_cluster(start);
            entry.set_file_size(data.len() as u32);
        }
        None => {
            if let Err(e) =
                dir::create_entry(buffer, &normalized, dir::ATTR_ARCHIVE, start, data.len() as u32)
            {
                fat::free_cluster_chain(fat::fat_mut(buffer), start);
                fat::sync_fat_copies(buffer);
                log::warn!("store {}: root directory full", normalized);
                return Err(e);
            }
        }
    }
    fat::sync_fat_copies(buffer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::DISK_SIZE_360K;

    fn formatted_image() -> Vec<u8> {
        let mut buffer = vec![0u8; DISK_SIZE_360K];
        fat::initialize_filesystem(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_create_write_read_round_trip() {
        let mut buffer = formatted_image();
        let mut files = FileTable::new();

        let handle = files.open_write(&mut buffer, 'A', "TEST.TXT").unwrap();
        let written = files.write(&mut buffer, handle, b"Hello, World!").unwrap();
        assert_eq!(written, 13);
        files.close(handle).unwrap();

        let handle = files.open_read(&buffer, 'A', "test.txt").unwrap();
        let data = files.read(&buffer, handle, 13).unwrap();
        assert_eq!(data, b"Hello, World!");

        // At end of file, reads come back empty instead of failing.
        assert!(files.read(&buffer, handle, 10).unwrap().is_empty());
        files.close(handle).unwrap();
        assert_eq!(files.open_count(), 0);

        let listing = list_files(&buffer);
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "TEST.TXT");
        assert_eq!(listing[0].size, 13);
    }

    #[test]
    fn test_open_read_missing_file_fails() {
        let buffer = formatted_image();
        let mut files = FileTable::new();
        assert!(matches!(
            files.open_read(&buffer, 'A', "NOPE.TXT"),
            Err(FloppyError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_write_requires_write_mode() {
        let mut buffer = formatted_image();
        let mut files = FileTable::new();

        let handle = files.open_write(&mut buffer, 'A', "A.TXT").unwrap();
        files.write(&mut buffer, handle, b"x").unwrap();
        files.close(handle).unwrap();

        let handle = files.open_read(&buffer, 'A', "A.TXT").unwrap();
        assert!(matches!(
            files.write(&mut buffer, handle, b"y"),
            Err(FloppyError::ReadOnlyHandle(_))
        ));
    }

    #[test]
    fn test_write_stops_at_cluster_boundary() {
        let mut buffer = formatted_image();
        let mut files = FileTable::new();

        let handle = files.open_write(&mut buffer, 'A', "BIG.BIN").unwrap();
        let data = vec![0x77u8; 600];

        // First call is cut off at the cluster edge.
        assert_eq!(files.write(&mut buffer, handle, &data).unwrap(), 512);
        // The single allocated cluster is exhausted.
        assert!(matches!(
            files.write(&mut buffer, handle, &data[512..]),
            Err(FloppyError::ChainExhausted)
        ));
        assert_eq!(files.get(handle).unwrap().size, 512);
    }

    #[test]
    fn test_overwrite_discards_old_chain() {
        let mut buffer = formatted_image();
        let mut files = FileTable::new();

        store_file(&mut buffer, "DOC.TXT", &vec![1u8; 1500]).unwrap();
        let before = get_free_space(&buffer);

        let handle = files.open_write(&mut buffer, 'A', "DOC.TXT").unwrap();
        files.write(&mut buffer, handle, b"short").unwrap();
        files.close(handle).unwrap();

        // Three clusters came back, one went out again.
        let after = get_free_space(&buffer);
        assert_eq!(after.free_bytes, before.free_bytes + 2 * SECTOR_SIZE);
        assert_eq!(get_file_info(&buffer, "DOC.TXT").unwrap().size, 5);
    }

    #[test]
    fn test_delete_frees_chain() {
        let mut buffer = formatted_image();

        store_file(&mut buffer, "DATA.BIN", &vec![9u8; 2000]).unwrap();
        let before = get_free_space(&buffer);

        delete_file(&mut buffer, "data.bin").unwrap();
        let after = get_free_space(&buffer);

        assert_eq!(after.free_bytes, before.free_bytes + 4 * SECTOR_SIZE);
        assert!(list_files(&buffer).is_empty());
        assert!(matches!(
            delete_file(&mut buffer, "DATA.BIN"),
            Err(FloppyError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_store_file_multi_cluster_round_trip() {
        let mut buffer = formatted_image();
        let mut files = FileTable::new();

        let data: Vec<u8> = (0..1300).map(|i| (i % 256) as u8).collect();
        store_file(&mut buffer, "SPAN.BIN", &data).unwrap();

        let handle = files.open_read(&buffer, 'A', "SPAN.BIN").unwrap();
        let mut back = Vec::new();
        loop {
            let chunk = files.read(&buffer, handle, 256).unwrap();
            if chunk.is_empty() {
                break;
            }
            back.extend_from_slice(&chunk);
        }
        assert_eq!(back, data);
    }

    #[test]
    fn test_free_space_of_fresh_image() {
        let buffer = formatted_image();
        let space = get_free_space(&buffer);
        assert_eq!(space.total_bytes, 706 * SECTOR_SIZE);
        assert_eq!(space.free_bytes, space.total_bytes);
        assert_eq!(space.used_bytes, 0);
        assert_eq!(space.bad_bytes, 0);
    }

    #[test]
    fn test_invalid_handle() {
        let mut buffer = formatted_image();
        let mut files = FileTable::new();
        assert!(matches!(
            files.read(&buffer, 99, 1),
            Err(FloppyError::InvalidHandle(99))
        ));
        assert!(matches!(
            files.write(&mut buffer, 99, b"x"),
            Err(FloppyError::InvalidHandle(99))
        ));
        assert!(files.close(99).is_err());
    }

    #[test]
    fn test_close_drive_drops_handles() {
        let mut buffer = formatted_image();
        let mut files = FileTable::new();
        files.open_write(&mut buffer, 'A', "ONE.TXT").unwrap();
        files.open_write(&mut buffer, 'B', "TWO.TXT").unwrap();
        assert_eq!(files.open_count(), 2);

        files.close_drive('A');
        assert_eq!(files.open_count(), 1);
    }
}
