//! Sector-level operations on a flat disk-image buffer.
//!
//! Everything here is pure geometry and byte movement: logical/physical
//! address conversion, bounds-checked sector transfers, track formatting,
//! and CRC16 integrity checks. No knowledge of files or controllers.

use crate::error::{FloppyError, FloppyResult};

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;
/// Tracks addressable per side through (track, sector) pairs.
pub const TRACKS_PER_SIDE: u8 = 40;
/// Sectors per track, numbered 1..=9.
pub const SECTORS_PER_TRACK: u8 = 9;
/// Logical sectors addressable through (track, sector) pairs on one side.
pub const SECTORS_PER_SIDE: usize = TRACKS_PER_SIDE as usize * SECTORS_PER_TRACK as usize;

/// Size of a 360KB image (720 physical sectors). The (track, sector) API
/// covers the first [`SECTORS_PER_SIDE`] of them; the filesystem layer
/// reaches the rest by cluster byte offsets.
pub const DISK_SIZE_360K: usize = 368_640;
/// Size of a double-sided 720KB image; tracks 40..=79 address the second
/// half.
pub const DISK_SIZE_720K: usize = 737_280;

/// Convert a (track, sector) address to a logical sector index.
///
/// Tracks count from 0, sectors from 1 (physical floppy convention).
pub fn logical_sector(track: u8, sector: u8) -> FloppyResult<usize> {
    if track >= TRACKS_PER_SIDE || sector < 1 || sector > SECTORS_PER_TRACK {
        return Err(FloppyError::SectorOutOfRange { track, sector });
    }
    Ok(track as usize * SECTORS_PER_TRACK as usize + (sector as usize - 1))
}

/// Convert a logical sector index back to a (track, sector) address.
pub fn physical_address(logical: usize) -> FloppyResult<(u8, u8)> {
    if logical >= SECTORS_PER_SIDE {
        return Err(FloppyError::SectorOutOfRange {
            track: (logical / SECTORS_PER_TRACK as usize) as u8,
            sector: (logical % SECTORS_PER_TRACK as usize) as u8 + 1,
        });
    }
    Ok((
        (logical / SECTORS_PER_TRACK as usize) as u8,
        (logical % SECTORS_PER_TRACK as usize) as u8 + 1,
    ))
}

/// Byte offset of a (track, sector) address within the buffer.
pub fn sector_offset(track: u8, sector: u8) -> FloppyResult<usize> {
    Ok(logical_sector(track, sector)? * SECTOR_SIZE)
}

/// Read one 512-byte sector.
pub fn read_sector(buffer: &[u8], track: u8, sector: u8) -> FloppyResult<[u8; SECTOR_SIZE]> {
    let offset = sector_offset(track, sector)?;
    if offset + SECTOR_SIZE > buffer.len() {
        return Err(FloppyError::SectorOutOfRange { track, sector });
    }
    let mut out = [0u8; SECTOR_SIZE];
    out.copy_from_slice(&buffer[offset..offset + SECTOR_SIZE]);
    Ok(out)
}

/// Write one sector. `data` may be shorter than 512 bytes, in which case the
/// remainder of the sector is zero-filled; longer data is rejected.
pub fn write_sector(buffer: &mut [u8], track: u8, sector: u8, data: &[u8]) -> FloppyResult<()> {
    if data.len() > SECTOR_SIZE {
        return Err(FloppyError::SectorDataTooLarge(data.len()));
    }
    let offset = sector_offset(track, sector)?;
    if offset + SECTOR_SIZE > buffer.len() {
        return Err(FloppyError::SectorOutOfRange { track, sector });
    }
    let target = &mut buffer[offset..offset + SECTOR_SIZE];
    target[..data.len()].copy_from_slice(data);
    target[data.len()..].fill(0);
    Ok(())
}

/// Read `count` contiguous sectors starting at (track, sector), rolling over
/// into subsequent tracks. Fails if the run would pass the last track.
pub fn read_sectors(
    buffer: &[u8],
    track: u8,
    sector: u8,
    count: usize,
) -> FloppyResult<Vec<u8>> {
    let start = logical_sector(track, sector)?;
    let mut out = Vec::with_capacity(count * SECTOR_SIZE);
    for i in 0..count {
        let (t, s) = physical_address(start + i)?;
        out.extend_from_slice(&read_sector(buffer, t, s)?);
    }
    Ok(out)
}

/// Write a contiguous run of sectors starting at (track, sector). The final
/// sector is zero-padded when `data` is not a multiple of 512 bytes.
pub fn write_sectors(buffer: &mut [u8], track: u8, sector: u8, data: &[u8]) -> FloppyResult<()> {
    let start = logical_sector(track, sector)?;
    let count = data.len().div_ceil(SECTOR_SIZE);
    for i in 0..count {
        let (t, s) = physical_address(start + i)?;
        let begin = i * SECTOR_SIZE;
        let end = (begin + SECTOR_SIZE).min(data.len());
        write_sector(buffer, t, s, &data[begin..end])?;
    }
    Ok(())
}

/// Zero-fill every sector of one track.
pub fn format_track(buffer: &mut [u8], track: u8) -> FloppyResult<()> {
    for sector in 1..=SECTORS_PER_TRACK {
        write_sector(buffer, track, sector, &[])?;
    }
    Ok(())
}

/// Zero-fill the whole buffer.
pub fn format_disk(buffer: &mut [u8]) {
    buffer.fill(0);
}

/// Precomputed table for the right-shifting CRC16 LFSR, polynomial 0xA001.
const CRC16_TABLE: [u16; 256] = crc16_table();

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute the CRC16 of a byte slice.
pub fn calculate_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc = (crc >> 8) ^ CRC16_TABLE[((crc ^ byte as u16) & 0xFF) as usize];
    }
    crc
}

/// Check a 512-byte sector whose trailing two bytes hold the little-endian
/// CRC16 of the preceding 510 bytes. Anything that is not a full sector
/// fails the check.
pub fn verify_sector_crc(sector: &[u8]) -> bool {
    if sector.len() != SECTOR_SIZE {
        return false;
    }
    let expected = u16::from_le_bytes([sector[SECTOR_SIZE - 2], sector[SECTOR_SIZE - 1]]);
    calculate_crc16(&sector[..SECTOR_SIZE - 2]) == expected
}
