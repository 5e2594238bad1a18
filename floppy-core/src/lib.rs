//! Dual-drive FAT12 floppy subsystem emulator
//!
//! This crate provides the storage engine of a small retro-style computer:
//! - Sector-level geometry and CRC16 operations on flat disk-image buffers
//! - Disk image mounting into drive slots "A" and "B" with dirty tracking
//! - The FAT12 on-disk format: boot sector, bit-packed allocation table,
//!   root directory, cluster chains
//! - A file-handle layer (open/read/write/close/delete)
//! - A memory-mapped disk controller with a command state machine,
//!   byte-stream DMA emulation, and simulated seek timing
//!
//! # Architecture
//!
//! The layers build bottom-up:
//! - `sector`: pure byte-level operations, no knowledge of files
//! - `disk`: `DiskImage` owning the mounted buffers
//! - `fat`: the binary format, operating on buffers `disk` supplies
//! - `file`: handles and directory bookkeeping on top of `fat`
//! - `controller`: the hardware-facing register façade over all of it
//!
//! The CPU side of the machine only needs the `MemoryBus` trait; the
//! controller implements it and intercepts its own register block.

pub mod archive;
pub mod controller;
pub mod disk;
pub mod error;
pub mod fat;
pub mod file;
pub mod sector;

pub use archive::{import_archive, load_archive, load_archive_from_path, ContentArchive};
pub use controller::{
    Command, FlatMemory, FloppyController, MemoryBus, Register, DEFAULT_BASE,
};
pub use disk::{DiskImage, DiskInfo};
pub use error::{FloppyError, FloppyResult};
pub use fat::{to_8_3, BootSector, FileInfo};
pub use file::{DiskSpace, FileHandle, FileTable, OpenMode};
