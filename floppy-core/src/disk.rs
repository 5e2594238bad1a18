//! Disk image mounting and drive-slot ownership.
//!
//! Two drive slots, "A" and "B". Each slot owns at most one backing image,
//! fully loaded into memory while mounted; writes set a dirty flag and the
//! buffer is persisted back to the backing path on unmount (or on demand).
//! No other component holds a long-lived reference to a slot's buffer.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{FloppyError, FloppyResult};
use crate::fat::BootSector;
use crate::sector::{self, DISK_SIZE_360K, DISK_SIZE_720K, TRACKS_PER_SIDE};

/// Number of drive slots.
pub const DRIVE_COUNT: usize = 2;

/// Convert a drive letter to a slot index (A=0, B=1).
pub fn drive_index(drive: char) -> FloppyResult<usize> {
    match drive.to_ascii_uppercase() {
        'A' => Ok(0),
        'B' => Ok(1),
        _ => Err(FloppyError::InvalidDrive(drive)),
    }
}

/// Slot index back to a drive letter.
fn drive_letter(index: usize) -> char {
    (b'A' + index as u8) as char
}

/// Snapshot of a mounted drive's state.
#[derive(Debug, Clone)]
pub struct DiskInfo {
    pub drive: char,
    pub path: PathBuf,
    pub size: usize,
    pub double_sided: bool,
    pub dirty: bool,
    pub mounted_at: SystemTime,
}

struct DriveSlot {
    path: PathBuf,
    buffer: Vec<u8>,
    dirty: bool,
    mounted_at: SystemTime,
}

impl DriveSlot {
    fn double_sided(&self) -> bool {
        self.buffer.len() == DISK_SIZE_720K
    }
}

/// Owner of the two drive slots.
#[derive(Default)]
pub struct DiskImage {
    slots: [Option<DriveSlot>; DRIVE_COUNT],
}

impl DiskImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount a disk image file into a drive slot.
    ///
    /// The backing file must be exactly 360KB or 720KB; it is loaded fully
    /// into memory. Any size-correct buffer is accepted (an all-zero image
    /// is valid; the format check only logs what it sees). On failure the
    /// slot is left untouched.
    pub fn mount(&mut self, drive: char, path: impl AsRef<Path>) -> FloppyResult<()> {
        let path = path.as_ref();
        let index = drive_index(drive)?;
        if self.slots[index].is_some() {
            log::warn!("mount {}: drive already holds a disk", drive);
            return Err(FloppyError::DriveAlreadyMounted(drive));
        }

        let buffer = fs::read(path).map_err(|e| {
            log::warn!("mount {}: cannot read {}: {}", drive, path.display(), e);
            FloppyError::Io(e)
        })?;
        if buffer.len() != DISK_SIZE_360K && buffer.len() != DISK_SIZE_720K {
            log::warn!(
                "mount {}: {} has invalid size {} bytes",
                drive,
                path.display(),
                buffer.len()
            );
            return Err(FloppyError::InvalidImageSize(buffer.len()));
        }

        match BootSector::parse(&buffer) {
            Ok(boot) => log::debug!(
                "mount {}: {} ({} sectors, OEM {:?})",
                drive,
                path.display(),
                boot.total_sectors,
                boot.oem_string()
            ),
            Err(_) => log::debug!(
                "mount {}: {} carries no boot signature (unformatted image)",
                drive,
                path.display()
            ),
        }

        self.slots[index] = Some(DriveSlot {
            path: path.to_path_buf(),
            buffer,
            dirty: false,
            mounted_at: SystemTime::now(),
        });
        Ok(())
    }

    /// Unmount a drive, persisting the buffer first when dirty. A failed
    /// persist leaves the drive mounted so the data is not lost.
    pub fn unmount(&mut self, drive: char) -> FloppyResult<()> {
        let index = drive_index(drive)?;
        let slot = self.slots[index]
            .take()
            .ok_or(FloppyError::DriveNotMounted(drive))?;

        if slot.dirty {
            if let Err(e) = fs::write(&slot.path, &slot.buffer) {
                log::warn!(
                    "unmount {}: cannot persist {}: {}",
                    drive,
                    slot.path.display(),
                    e
                );
                self.slots[index] = Some(slot);
                return Err(FloppyError::Io(e));
            }
        }
        Ok(())
    }

    /// Create a zero-formatted blank image file on disk.
    pub fn create_blank(path: impl AsRef<Path>, double_sided: bool) -> FloppyResult<()> {
        let size = if double_sided {
            DISK_SIZE_720K
        } else {
            DISK_SIZE_360K
        };
        let mut buffer = vec![0u8; size];
        sector::format_disk(&mut buffer);
        fs::write(path.as_ref(), &buffer)?;
        Ok(())
    }

    pub fn is_mounted(&self, drive: char) -> bool {
        drive_index(drive)
            .map(|index| self.slots[index].is_some())
            .unwrap_or(false)
    }

    /// Letters of the currently mounted drives.
    pub fn mounted_drives(&self) -> Vec<char> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| drive_letter(i)))
            .collect()
    }

    /// Borrow a mounted drive's buffer.
    pub fn buffer(&self, drive: char) -> FloppyResult<&[u8]> {
        let index = drive_index(drive)?;
        self.slots[index]
            .as_ref()
            .map(|slot| slot.buffer.as_slice())
            .ok_or(FloppyError::DriveNotMounted(drive))
    }

    /// Mutably borrow a mounted drive's buffer. The slot is marked dirty.
    pub fn buffer_mut(&mut self, drive: char) -> FloppyResult<&mut [u8]> {
        let index = drive_index(drive)?;
        let slot = self.slots[index]
            .as_mut()
            .ok_or(FloppyError::DriveNotMounted(drive))?;
        slot.dirty = true;
        Ok(slot.buffer.as_mut_slice())
    }

    /// Resolve the second-side remap: on a 720KB image, tracks 40..=79
    /// address the second side as track - 40.
    fn side_view(slot: &DriveSlot, track: u8) -> (usize, u8) {
        if slot.double_sided() && track >= TRACKS_PER_SIDE {
            (DISK_SIZE_360K, track - TRACKS_PER_SIDE)
        } else {
            (0, track)
        }
    }

    /// Read one sector from a mounted drive.
    pub fn read_sector(&self, drive: char, track: u8, sector: u8) -> FloppyResult<[u8; 512]> {
        let index = drive_index(drive)?;
        let slot = self.slots[index]
            .as_ref()
            .ok_or(FloppyError::DriveNotMounted(drive))?;
        let (offset, track) = Self::side_view(slot, track);
        sector::read_sector(&slot.buffer[offset..], track, sector)
    }

    /// Write one sector to a mounted drive, marking it dirty.
    pub fn write_sector(
        &mut self,
        drive: char,
        track: u8,
        sector: u8,
        data: &[u8],
    ) -> FloppyResult<()> {
        let index = drive_index(drive)?;
        let slot = self.slots[index]
            .as_mut()
            .ok_or(FloppyError::DriveNotMounted(drive))?;
        let (offset, track) = Self::side_view(slot, track);
        sector::write_sector(&mut slot.buffer[offset..], track, sector, data)?;
        slot.dirty = true;
        Ok(())
    }

    /// Zero-fill one track of a mounted drive.
    pub fn format_track(&mut self, drive: char, track: u8) -> FloppyResult<()> {
        let index = drive_index(drive)?;
        let slot = self.slots[index]
            .as_mut()
            .ok_or(FloppyError::DriveNotMounted(drive))?;
        let (offset, track) = Self::side_view(slot, track);
        sector::format_track(&mut slot.buffer[offset..], track)?;
        slot.dirty = true;
        Ok(())
    }

    /// Tracks addressable on a mounted drive (40 or 80).
    pub fn track_count(&self, drive: char) -> FloppyResult<u8> {
        let index = drive_index(drive)?;
        let slot = self.slots[index]
            .as_ref()
            .ok_or(FloppyError::DriveNotMounted(drive))?;
        Ok(if slot.double_sided() {
            2 * TRACKS_PER_SIDE
        } else {
            TRACKS_PER_SIDE
        })
    }

    /// State snapshot for a mounted drive.
    pub fn info(&self, drive: char) -> FloppyResult<DiskInfo> {
        let index = drive_index(drive)?;
        let slot = self.slots[index]
            .as_ref()
            .ok_or(FloppyError::DriveNotMounted(drive))?;
        Ok(DiskInfo {
            drive: drive_letter(index),
            path: slot.path.clone(),
            size: slot.buffer.len(),
            double_sided: slot.double_sided(),
            dirty: slot.dirty,
            mounted_at: slot.mounted_at,
        })
    }

    /// Persist every dirty drive without unmounting. Returns how many
    /// buffers were written.
    pub fn save_all_modified(&mut self) -> FloppyResult<usize> {
        let mut saved = 0;
        for slot in self.slots.iter_mut().flatten() {
            if slot.dirty {
                fs::write(&slot.path, &slot.buffer)?;
                slot.dirty = false;
                saved += 1;
            }
        }
        Ok(saved)
    }

    /// Unmount both drives, persisting dirty buffers.
    pub fn unmount_all(&mut self) -> FloppyResult<()> {
        for index in 0..DRIVE_COUNT {
            if self.slots[index].is_some() {
                self.unmount(drive_letter(index))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_image(name: &str, size: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!("floppy-disk-{}-{}", std::process::id(), name));
        fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn test_drive_index() {
        assert_eq!(drive_index('A').unwrap(), 0);
        assert_eq!(drive_index('b').unwrap(), 1);
        assert!(drive_index('C').is_err());
    }

    #[test]
    fn test_mount_unmount_round_trip() {
        let path = temp_image("mount.img", DISK_SIZE_360K);
        let mut disks = DiskImage::new();

        disks.mount('A', &path).unwrap();
        assert!(disks.is_mounted('A'));
        assert!(!disks.is_mounted('B'));
        assert_eq!(disks.mounted_drives(), vec!['A']);

        disks.unmount('A').unwrap();
        assert!(!disks.is_mounted('A'));
        assert!(disks.unmount('A').is_err());

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_mount_rejects_bad_size() {
        let path = temp_image("badsize.img", 1000);
        let mut disks = DiskImage::new();

        assert!(matches!(
            disks.mount('A', &path),
            Err(FloppyError::InvalidImageSize(1000))
        ));
        assert!(!disks.is_mounted('A'));

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_mount_rejects_missing_file() {
        let mut disks = DiskImage::new();
        let path = std::env::temp_dir().join("floppy-disk-does-not-exist.img");
        assert!(matches!(disks.mount('A', &path), Err(FloppyError::Io(_))));
        assert!(!disks.is_mounted('A'));
    }

    #[test]
    fn test_double_mount_rejected() {
        let path = temp_image("twice.img", DISK_SIZE_360K);
        let mut disks = DiskImage::new();
        disks.mount('A', &path).unwrap();
        assert!(matches!(
            disks.mount('A', &path),
            Err(FloppyError::DriveAlreadyMounted('A'))
        ));
        disks.unmount('A').unwrap();
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_write_persists_on_unmount() {
        let path = temp_image("persist.img", DISK_SIZE_360K);
        let mut disks = DiskImage::new();

        disks.mount('A', &path).unwrap();
        let data = [0x5Au8; 512];
        disks.write_sector('A', 3, 4, &data).unwrap();
        assert!(disks.info('A').unwrap().dirty);
        disks.unmount('A').unwrap();

        // Re-mount and confirm the write survived the round trip.
        disks.mount('A', &path).unwrap();
        assert_eq!(disks.read_sector('A', 3, 4).unwrap(), data);
        assert!(!disks.info('A').unwrap().dirty);
        disks.unmount('A').unwrap();

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_second_side_remap() {
        let path = temp_image("ds.img", DISK_SIZE_720K);
        let mut disks = DiskImage::new();
        disks.mount('B', &path).unwrap();

        let data = [0x42u8; 512];
        disks.write_sector('B', 41, 3, &data).unwrap();
        assert_eq!(disks.read_sector('B', 41, 3).unwrap(), data);

        // Same physical bytes as track 1 of the second half.
        let buffer = disks.buffer('B').unwrap();
        let offset = DISK_SIZE_360K + (9 + 2) * 512;
        assert_eq!(&buffer[offset..offset + 512], &data);

        // Track 80 is out of range even double-sided.
        assert!(disks.read_sector('B', 80, 1).is_err());

        disks.unmount('B').unwrap();
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_single_sided_rejects_high_tracks() {
        let path = temp_image("ss.img", DISK_SIZE_360K);
        let mut disks = DiskImage::new();
        disks.mount('A', &path).unwrap();
        assert!(disks.read_sector('A', 40, 1).is_err());
        disks.unmount('A').unwrap();
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_create_blank() {
        let path = std::env::temp_dir().join(format!("floppy-disk-{}-blank.img", std::process::id()));
        DiskImage::create_blank(&path, false).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), DISK_SIZE_360K as u64);

        DiskImage::create_blank(&path, true).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), DISK_SIZE_720K as u64);

        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_save_all_modified() {
        let path_a = temp_image("sava.img", DISK_SIZE_360K);
        let path_b = temp_image("savb.img", DISK_SIZE_360K);
        let mut disks = DiskImage::new();
        disks.mount('A', &path_a).unwrap();
        disks.mount('B', &path_b).unwrap();

        disks.write_sector('A', 0, 1, &[1u8; 512]).unwrap();
        assert_eq!(disks.save_all_modified().unwrap(), 1);
        assert_eq!(disks.save_all_modified().unwrap(), 0);

        disks.unmount_all().unwrap();
        fs::remove_file(path_a).unwrap();
        fs::remove_file(path_b).unwrap();
    }
}
