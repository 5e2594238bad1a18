//! Boot sector (BIOS parameter block) encoding and parsing.

use crate::error::{FloppyError, FloppyResult};
use crate::sector::SECTOR_SIZE;

/// Boot signature bytes at offset 510 (0xAA55 little-endian).
pub const BOOT_SIG_LEAD: u8 = 0x55;
pub const BOOT_SIG_TRAIL: u8 = 0xAA;

/// BIOS parameter block fields of sector 0.
///
/// The on-disk layout constants in [`crate::fat`] are fixed for this
/// subsystem; the BPB is written for well-formedness and informational
/// tooling, not consulted to derive the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_copies: u8,
    pub root_entries: u16,
    pub total_sectors: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat: u16,
}

impl Default for BootSector {
    fn default() -> Self {
        BootSector {
            oem_name: *b"RFLOPPY1",
            bytes_per_sector: SECTOR_SIZE as u16,
            sectors_per_cluster: 1,
            reserved_sectors: 3,
            fat_copies: 2,
            root_entries: 112,
            total_sectors: 720,
            media_descriptor: 0xF9,
            sectors_per_fat: 3,
        }
    }
}

impl BootSector {
    /// Parse the BPB from a boot sector. The buffer must hold at least one
    /// sector and carry the 0xAA55 signature.
    pub fn parse(buf: &[u8]) -> FloppyResult<Self> {
        if buf.len() < SECTOR_SIZE {
            return Err(FloppyError::InvalidBootSector);
        }
        if buf[510] != BOOT_SIG_LEAD || buf[511] != BOOT_SIG_TRAIL {
            return Err(FloppyError::InvalidBootSector);
        }

        let mut oem_name = [0u8; 8];
        oem_name.copy_from_slice(&buf[3..11]);

        Ok(BootSector {
            oem_name,
            bytes_per_sector: u16::from_le_bytes([buf[11], buf[12]]),
            sectors_per_cluster: buf[13],
            reserved_sectors: u16::from_le_bytes([buf[14], buf[15]]),
            fat_copies: buf[16],
            root_entries: u16::from_le_bytes([buf[17], buf[18]]),
            total_sectors: u16::from_le_bytes([buf[19], buf[20]]),
            media_descriptor: buf[21],
            sectors_per_fat: u16::from_le_bytes([buf[22], buf[23]]),
        })
    }

    /// Serialize into a boot sector: jump stub, OEM name, BPB fields, and
    /// the trailing signature. Bytes not covered are left untouched.
    pub fn write_to(&self, buf: &mut [u8]) -> FloppyResult<()> {
        if buf.len() < SECTOR_SIZE {
            return Err(FloppyError::InvalidBootSector);
        }

        // JMP SHORT +0x3C; NOP
        buf[0] = 0xEB;
        buf[1] = 0x3C;
        buf[2] = 0x90;
        buf[3..11].copy_from_slice(&self.oem_name);
        buf[11..13].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        buf[13] = self.sectors_per_cluster;
        buf[14..16].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        buf[16] = self.fat_copies;
        buf[17..19].copy_from_slice(&self.root_entries.to_le_bytes());
        buf[19..21].copy_from_slice(&self.total_sectors.to_le_bytes());
        buf[21] = self.media_descriptor;
        buf[22..24].copy_from_slice(&self.sectors_per_fat.to_le_bytes());
        buf[510] = BOOT_SIG_LEAD;
        buf[511] = BOOT_SIG_TRAIL;
        Ok(())
    }

    /// OEM name with trailing spaces stripped.
    pub fn oem_string(&self) -> String {
        String::from_utf8_lossy(&self.oem_name)
            .trim_end_matches(' ')
            .to_string()
    }
}
