//! Error types for the floppy subsystem.

use thiserror::Error;

/// Errors that can occur during disk, filesystem, and controller operations.
#[derive(Error, Debug)]
pub enum FloppyError {
    #[error("Invalid drive: {0}")]
    InvalidDrive(char),

    #[error("Drive not mounted: {0}")]
    DriveNotMounted(char),

    #[error("Drive already mounted: {0}")]
    DriveAlreadyMounted(char),

    #[error("Invalid disk image size: {0} bytes")]
    InvalidImageSize(usize),

    #[error("Sector out of range: track {track}, sector {sector}")]
    SectorOutOfRange { track: u8, sector: u8 },

    #[error("Sector data too large: {0} bytes")]
    SectorDataTooLarge(usize),

    #[error("FAT entry out of bounds: cluster {0}")]
    FatIndexOutOfBounds(u16),

    #[error("Disk full")]
    DiskFull,

    #[error("Root directory full")]
    RootDirectoryFull,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(u32),

    #[error("Handle not open for writing: {0}")]
    ReadOnlyHandle(u32),

    #[error("Write past end of allocated cluster chain")]
    ChainExhausted,

    #[error("Invalid boot sector")]
    InvalidBootSector,

    #[error("Unknown controller command: {0:#04X}")]
    UnknownCommand(u8),

    #[error("Register block does not fit address space at base {0:#06X}")]
    InvalidRegisterBase(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for floppy subsystem operations.
pub type FloppyResult<T> = Result<T, FloppyError>;
