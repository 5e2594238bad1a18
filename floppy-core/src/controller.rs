//! Hardware-facing floppy disk controller.
//!
//! The controller exposes a 10-byte memory-mapped register block. Reads and
//! writes inside the block carry register semantics; every other address
//! passes through to the backing memory object. Commands are written to the
//! COMMAND register and either complete immediately, enter a byte-at-a-time
//! transfer phase through the DATA register, or (for head movement) finish
//! after a simulated settle delay via a deferred completion record.
//!
//! The controller also offers a high-level file API that bypasses the
//! register protocol entirely; both interfaces drive the same mounted
//! drive state.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::disk::{drive_index, DiskImage, DiskInfo};
use crate::error::{FloppyError, FloppyResult};
use crate::fat;
use crate::file::{self, DiskSpace, FileTable, OpenMode};
use crate::sector::{self, SECTOR_SIZE, TRACKS_PER_SIDE};

/// Byte-addressable memory, the collaborator interface expected from the
/// memory subsystem.
pub trait MemoryBus {
    fn read_byte(&mut self, addr: u16) -> u8;
    fn write_byte(&mut self, addr: u16, value: u8);
}

/// Plain 64KB memory with no device semantics.
pub struct FlatMemory {
    bytes: Box<[u8; 0x10000]>,
}

impl FlatMemory {
    pub fn new() -> Self {
        FlatMemory {
            bytes: Box::new([0u8; 0x10000]),
        }
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus for FlatMemory {
    fn read_byte(&mut self, addr: u16) -> u8 {
        self.bytes[addr as usize]
    }

    fn write_byte(&mut self, addr: u16, value: u8) {
        self.bytes[addr as usize] = value;
    }
}

/// Number of registers in the block.
pub const REGISTER_COUNT: u16 = 10;
/// Default base address of the register block.
pub const DEFAULT_BASE: u16 = 0xFF40;

/// Register offsets within the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    Command = 0,
    Status = 1,
    Data = 2,
    DriveSelect = 3,
    Track = 4,
    Sector = 5,
    DmaAddrLow = 6,
    DmaAddrHigh = 7,
    DmaCount = 8,
    Control = 9,
}

impl TryFrom<u16> for Register {
    type Error = u16;

    fn try_from(offset: u16) -> Result<Self, Self::Error> {
        match offset {
            0 => Ok(Self::Command),
            1 => Ok(Self::Status),
            2 => Ok(Self::Data),
            3 => Ok(Self::DriveSelect),
            4 => Ok(Self::Track),
            5 => Ok(Self::Sector),
            6 => Ok(Self::DmaAddrLow),
            7 => Ok(Self::DmaAddrHigh),
            8 => Ok(Self::DmaCount),
            9 => Ok(Self::Control),
            _ => Err(offset),
        }
    }
}

/// Controller command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    ReadSector = 0x01,
    WriteSector = 0x02,
    SeekTrack = 0x03,
    ReadStatus = 0x04,
    FormatTrack = 0x05,
    ReadId = 0x06,
    Recalibrate = 0x07,
    SenseInterrupt = 0x08,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::ReadSector),
            0x02 => Ok(Self::WriteSector),
            0x03 => Ok(Self::SeekTrack),
            0x04 => Ok(Self::ReadStatus),
            0x05 => Ok(Self::FormatTrack),
            0x06 => Ok(Self::ReadId),
            0x07 => Ok(Self::Recalibrate),
            0x08 => Ok(Self::SenseInterrupt),
            _ => Err(value),
        }
    }
}

/// Bits of the drive-status byte (READ_STATUS result) and the live
/// transfer bits mixed into STATUS register reads.
pub mod status {
    pub const BUSY: u8 = 0x01;
    pub const DATA_REQUEST: u8 = 0x02;
    pub const DATA_DIRECTION: u8 = 0x04;
    pub const TRACK_0: u8 = 0x08;
    pub const SEEK_COMPLETE: u8 = 0x10;
    pub const CRC_ERROR: u8 = 0x20;
    pub const DRIVE_READY: u8 = 0x40;
    pub const DRIVE_FAULT: u8 = 0x80;
}

/// Command completion codes, readable from the STATUS register once the
/// command has finished.
pub mod completion {
    pub const SUCCESS: u8 = 0x00;
    pub const ID_NOT_FOUND: u8 = 0x10;
    pub const CRC_ERROR: u8 = 0x20;
    pub const ABNORMAL: u8 = 0x40;
    pub const NOT_READY: u8 = 0x50;
    pub const INVALID_COMMAND: u8 = 0x80;
}

/// CONTROL register bit: soft reset.
pub const CONTROL_RESET: u8 = 0x01;
/// CONTROL register bit: verify sector CRC on reads.
pub const CONTROL_CRC_VERIFY: u8 = 0x02;

/// Head settle time for SEEK_TRACK.
pub const SEEK_SETTLE: Duration = Duration::from_millis(10);
/// Head settle time for RECALIBRATE.
pub const RECALIBRATE_SETTLE: Duration = Duration::from_millis(100);

/// Transfer phase of the command state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Sector loaded; DATA register reads stream it out.
    ReadTransfer,
    /// WRITE_SECTOR issued; DATA register writes collect the sector.
    AwaitingData,
}

/// Deferred completion for head-movement commands.
struct PendingCompletion {
    due: Instant,
    drive: usize,
    track: u8,
    code: u8,
}

/// The floppy disk controller.
pub struct FloppyController<M: MemoryBus> {
    mem: M,
    base: u16,
    regs: [u8; REGISTER_COUNT as usize],
    phase: Phase,
    data_buffer: Vec<u8>,
    data_index: usize,
    transfer_len: usize,
    pending: Option<PendingCompletion>,
    completion_code: u8,
    irq_pending: bool,
    crc_error: bool,
    seek_complete: bool,
    track_positions: [u8; 2],
    disks: DiskImage,
    files: FileTable,
}

impl<M: MemoryBus> FloppyController<M> {
    /// Create a controller with its register block at the default base.
    pub fn new(mem: M) -> Self {
        match Self::with_base(mem, DEFAULT_BASE) {
            Ok(controller) => controller,
            // The default base always fits.
            Err(_) => unreachable!(),
        }
    }

    /// Create a controller with the register block at `base`. The block
    /// must fit the 16-bit address space.
    pub fn with_base(mem: M, base: u16) -> FloppyResult<Self> {
        if base.checked_add(REGISTER_COUNT - 1).is_none() {
            return Err(FloppyError::InvalidRegisterBase(base));
        }
        Ok(FloppyController {
            mem,
            base,
            regs: [0; REGISTER_COUNT as usize],
            phase: Phase::Idle,
            data_buffer: Vec::with_capacity(SECTOR_SIZE),
            data_index: 0,
            transfer_len: 0,
            pending: None,
            completion_code: completion::SUCCESS,
            irq_pending: false,
            crc_error: false,
            seek_complete: false,
            track_positions: [0; 2],
            disks: DiskImage::new(),
            files: FileTable::new(),
        })
    }

    /// Base address of the register block.
    pub fn base(&self) -> u16 {
        self.base
    }

    fn register_at(&self, addr: u16) -> Option<Register> {
        let offset = addr.checked_sub(self.base)?;
        Register::try_from(offset).ok()
    }

    fn reg(&self, register: Register) -> u8 {
        self.regs[register as usize]
    }

    fn set_reg(&mut self, register: Register, value: u8) {
        self.regs[register as usize] = value;
    }

    // ==================== Register protocol ====================

    /// Resolve an elapsed deferred completion, if any. Embedding event
    /// loops may call this directly; every register access does.
    pub fn service(&mut self) {
        let due = matches!(&self.pending, Some(pending) if Instant::now() >= pending.due);
        if due {
            if let Some(pending) = self.pending.take() {
                self.track_positions[pending.drive] = pending.track;
                self.set_reg(Register::Track, pending.track);
                self.seek_complete = true;
                self.finish(pending.code);
            }
        }
    }

    /// Whether a deferred completion is still outstanding.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some() || self.phase == Phase::AwaitingData
    }

    /// Interrupt-pending flag, set on successful command completion and
    /// cleared by SENSE_INTERRUPT.
    pub fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    fn status_byte(&self) -> u8 {
        let mut value = self.completion_code;
        if self.pending.is_some() {
            value |= status::BUSY;
        }
        match self.phase {
            Phase::AwaitingData => value |= status::BUSY | status::DATA_REQUEST,
            Phase::ReadTransfer => value |= status::DATA_REQUEST | status::DATA_DIRECTION,
            Phase::Idle => {}
        }
        value
    }

    fn read_register(&mut self, register: Register) -> u8 {
        self.service();
        match register {
            Register::Status => self.status_byte(),
            Register::Data => self.read_data(),
            _ => self.reg(register),
        }
    }

    fn write_register(&mut self, register: Register, value: u8) {
        self.service();
        match register {
            Register::Command => self.execute(value),
            Register::Data => self.write_data(value),
            Register::Control => {
                self.set_reg(Register::Control, value);
                if value & CONTROL_RESET != 0 {
                    self.reset();
                }
            }
            _ => self.set_reg(register, value),
        }
    }

    fn read_data(&mut self) -> u8 {
        if self.phase != Phase::ReadTransfer {
            return self.reg(Register::Data);
        }
        let byte = self.data_buffer.get(self.data_index).copied().unwrap_or(0);
        self.data_index += 1;
        if self.data_index >= self.transfer_len {
            self.phase = Phase::Idle;
        }
        byte
    }

    fn write_data(&mut self, value: u8) {
        if self.phase != Phase::AwaitingData {
            self.set_reg(Register::Data, value);
            return;
        }
        self.data_buffer.push(value);
        if self.data_buffer.len() >= SECTOR_SIZE {
            self.commit_write_sector();
        }
    }

    /// Reset the command state machine, keeping mounted drives and head
    /// positions.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.pending = None;
        self.data_buffer.clear();
        self.data_index = 0;
        self.transfer_len = 0;
        self.completion_code = completion::SUCCESS;
        self.irq_pending = false;
        self.crc_error = false;
        self.seek_complete = false;
        for register in [
            Register::Command,
            Register::Status,
            Register::Data,
            Register::Track,
            Register::Sector,
            Register::DmaAddrLow,
            Register::DmaAddrHigh,
            Register::DmaCount,
        ] {
            self.set_reg(register, 0);
        }
    }

    fn finish(&mut self, code: u8) {
        self.completion_code = code;
        if code == completion::SUCCESS {
            self.irq_pending = true;
        }
    }

    fn selected_drive(&self) -> FloppyResult<char> {
        match self.reg(Register::DriveSelect) {
            0 => Ok('A'),
            1 => Ok('B'),
            other => Err(FloppyError::InvalidDrive((b'0' + (other % 10)) as char)),
        }
    }

    fn dma_transfer_len(&self) -> usize {
        match self.reg(Register::DmaCount) {
            0 => SECTOR_SIZE,
            count => count as usize,
        }
    }

    /// Execute a command written to the COMMAND register. Any error raised
    /// by the drive or filesystem layers becomes a completion code, so a
    /// bad command can never leave the controller stuck busy.
    fn execute(&mut self, opcode: u8) {
        // A new command supersedes any unfinished transfer phase.
        self.phase = Phase::Idle;
        self.data_buffer.clear();
        self.data_index = 0;
        self.completion_code = completion::SUCCESS;
        self.set_reg(Register::Command, opcode);

        let command = match Command::try_from(opcode) {
            Ok(command) => command,
            Err(_) => {
                log::warn!("fdc: {}", FloppyError::UnknownCommand(opcode));
                self.finish(completion::INVALID_COMMAND);
                return;
            }
        };

        match self.run_command(command) {
            Ok(()) => {}
            Err(e) => {
                log::warn!("fdc: {:?} failed: {}", command, e);
                self.finish(completion::ABNORMAL);
            }
        }
    }

    fn run_command(&mut self, command: Command) -> FloppyResult<()> {
        let drive = match self.selected_drive() {
            Ok(drive) => drive,
            Err(_) => {
                self.finish(completion::NOT_READY);
                return Ok(());
            }
        };
        let slot = drive_index(drive)?;
        let track = self.reg(Register::Track);
        let sector = self.reg(Register::Sector);

        match command {
            Command::ReadSector => {
                if !self.disks.is_mounted(drive) {
                    self.finish(completion::NOT_READY);
                    return Ok(());
                }
                match self.disks.read_sector(drive, track, sector) {
                    Ok(data) => {
                        if self.reg(Register::Control) & CONTROL_CRC_VERIFY != 0
                            && !sector::verify_sector_crc(&data)
                        {
                            self.crc_error = true;
                            self.finish(completion::CRC_ERROR);
                            return Ok(());
                        }
                        self.data_buffer = data.to_vec();
                        self.data_index = 0;
                        self.transfer_len = self.dma_transfer_len();
                        self.finish(completion::SUCCESS);
                        self.phase = Phase::ReadTransfer;
                    }
                    Err(FloppyError::SectorOutOfRange { .. }) => {
                        self.finish(completion::ID_NOT_FOUND);
                    }
                    Err(e) => return Err(e),
                }
            }

            Command::WriteSector => {
                if !self.disks.is_mounted(drive) {
                    self.finish(completion::NOT_READY);
                    return Ok(());
                }
                // Probe the address before accepting data.
                match self.disks.read_sector(drive, track, sector) {
                    Ok(_) => {
                        self.data_buffer.clear();
                        self.phase = Phase::AwaitingData;
                    }
                    Err(FloppyError::SectorOutOfRange { .. }) => {
                        self.finish(completion::ID_NOT_FOUND);
                    }
                    Err(e) => return Err(e),
                }
            }

            Command::SeekTrack => {
                let limit = if self.disks.is_mounted(drive) {
                    self.disks.track_count(drive)?
                } else {
                    TRACKS_PER_SIDE
                };
                if track >= limit {
                    self.finish(completion::ID_NOT_FOUND);
                    return Ok(());
                }
                self.seek_complete = false;
                self.pending = Some(PendingCompletion {
                    due: Instant::now() + SEEK_SETTLE,
                    drive: slot,
                    track,
                    code: completion::SUCCESS,
                });
            }

            Command::Recalibrate => {
                self.seek_complete = false;
                self.pending = Some(PendingCompletion {
                    due: Instant::now() + RECALIBRATE_SETTLE,
                    drive: slot,
                    track: 0,
                    code: completion::SUCCESS,
                });
            }

            Command::ReadStatus => {
                let bits = self.drive_status_bits(drive, slot);
                self.set_reg(Register::Data, bits);
                self.finish(completion::SUCCESS);
            }

            Command::FormatTrack => {
                if !self.disks.is_mounted(drive) {
                    self.finish(completion::NOT_READY);
                    return Ok(());
                }
                match self.disks.format_track(drive, track) {
                    Ok(()) => self.finish(completion::SUCCESS),
                    Err(FloppyError::SectorOutOfRange { .. }) => {
                        self.finish(completion::ID_NOT_FOUND)
                    }
                    Err(e) => return Err(e),
                }
            }

            Command::ReadId => {
                if !self.disks.is_mounted(drive) {
                    self.finish(completion::NOT_READY);
                    return Ok(());
                }
                self.set_reg(Register::Data, self.track_positions[slot]);
                self.finish(completion::SUCCESS);
            }

            Command::SenseInterrupt => {
                self.set_reg(Register::Data, self.track_positions[slot]);
                self.finish(completion::SUCCESS);
                // SENSE_INTERRUPT acknowledges, it does not raise.
                self.irq_pending = false;
            }
        }
        Ok(())
    }

    fn commit_write_sector(&mut self) {
        self.phase = Phase::Idle;
        let result = match self.selected_drive() {
            Ok(drive) => {
                let track = self.reg(Register::Track);
                let sector = self.reg(Register::Sector);
                let data = std::mem::take(&mut self.data_buffer);
                self.disks.write_sector(drive, track, sector, &data)
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.finish(completion::SUCCESS),
            Err(e) => {
                log::warn!("fdc: sector write failed: {}", e);
                self.finish(completion::ID_NOT_FOUND);
            }
        }
    }

    fn drive_status_bits(&self, drive: char, slot: usize) -> u8 {
        let mut bits = 0u8;
        if self.track_positions[slot] == 0 {
            bits |= status::TRACK_0;
        }
        if self.seek_complete {
            bits |= status::SEEK_COMPLETE;
        }
        if self.crc_error {
            bits |= status::CRC_ERROR;
        }
        if self.disks.is_mounted(drive) {
            bits |= status::DRIVE_READY;
        }
        bits
    }

    // ==================== High-level file API ====================
    //
    // Pass-through to the disk, filesystem, and file layers; independent
    // of the register protocol but operating on the same mounted state.

    pub fn mount_disk(&mut self, drive: char, path: impl AsRef<Path>) -> FloppyResult<()> {
        self.disks.mount(drive, path)
    }

    pub fn unmount_disk(&mut self, drive: char) -> FloppyResult<()> {
        self.files.close_drive(drive);
        self.disks.unmount(drive)
    }

    pub fn create_disk(path: impl AsRef<Path>, double_sided: bool) -> FloppyResult<()> {
        DiskImage::create_blank(path, double_sided)
    }

    pub fn initialize_filesystem(&mut self, drive: char) -> FloppyResult<()> {
        fat::initialize_filesystem(self.disks.buffer_mut(drive)?)
    }

    pub fn list_files(&self, drive: char) -> FloppyResult<Vec<fat::FileInfo>> {
        Ok(file::list_files(self.disks.buffer(drive)?))
    }

    pub fn get_file_info(&self, drive: char, name: &str) -> FloppyResult<Option<fat::FileInfo>> {
        Ok(file::get_file_info(self.disks.buffer(drive)?, name))
    }

    /// Read a whole file through the handle layer.
    pub fn read_file(&mut self, drive: char, name: &str) -> FloppyResult<Vec<u8>> {
        let buffer = self.disks.buffer(drive)?;
        let handle = self.files.open_read(buffer, drive, name)?;
        let mut out = Vec::new();
        loop {
            let chunk = self.files.read(buffer, handle, SECTOR_SIZE)?;
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        self.files.close(handle)?;
        Ok(out)
    }

    /// Store a whole file, replacing any previous content.
    pub fn write_file(&mut self, drive: char, name: &str, data: &[u8]) -> FloppyResult<()> {
        file::store_file(self.disks.buffer_mut(drive)?, name, data)
    }

    pub fn delete_file(&mut self, drive: char, name: &str) -> FloppyResult<()> {
        file::delete_file(self.disks.buffer_mut(drive)?, name)
    }

    pub fn get_free_space(&self, drive: char) -> FloppyResult<DiskSpace> {
        Ok(file::get_free_space(self.disks.buffer(drive)?))
    }

    pub fn get_disk_info(&self, drive: char) -> FloppyResult<DiskInfo> {
        self.disks.info(drive)
    }

    pub fn mounted_drives(&self) -> Vec<char> {
        self.disks.mounted_drives()
    }

    pub fn save_all_modified(&mut self) -> FloppyResult<usize> {
        self.disks.save_all_modified()
    }

    pub fn unmount_all(&mut self) -> FloppyResult<()> {
        self.files.close_drive('A');
        self.files.close_drive('B');
        self.disks.unmount_all()
    }

    /// Open a file handle (read or write) on a mounted drive.
    pub fn open_file(&mut self, drive: char, name: &str, mode: OpenMode) -> FloppyResult<u32> {
        match mode {
            OpenMode::Read => {
                let buffer = self.disks.buffer(drive)?;
                self.files.open_read(buffer, drive, name)
            }
            OpenMode::Write => {
                let buffer = self.disks.buffer_mut(drive)?;
                self.files.open_write(buffer, drive, name)
            }
        }
    }

    /// Read from an open handle.
    pub fn read_handle(&mut self, handle: u32, length: usize) -> FloppyResult<Vec<u8>> {
        let drive = self
            .files
            .get(handle)
            .map(|h| h.drive)
            .ok_or(FloppyError::InvalidHandle(handle))?;
        let buffer = self.disks.buffer(drive)?;
        self.files.read(buffer, handle, length)
    }

    /// Write to an open handle (single-cluster semantics).
    pub fn write_handle(&mut self, handle: u32, data: &[u8]) -> FloppyResult<usize> {
        let drive = self
            .files
            .get(handle)
            .map(|h| h.drive)
            .ok_or(FloppyError::InvalidHandle(handle))?;
        let buffer = self.disks.buffer_mut(drive)?;
        self.files.write(buffer, handle, data)
    }

    pub fn close_file(&mut self, handle: u32) -> FloppyResult<()> {
        self.files.close(handle)
    }

    /// Direct access to the drive slots for kernel-side collaborators.
    pub fn disks(&self) -> &DiskImage {
        &self.disks
    }

    pub fn disks_mut(&mut self) -> &mut DiskImage {
        &mut self.disks
    }
}

impl<M: MemoryBus> MemoryBus for FloppyController<M> {
    fn read_byte(&mut self, addr: u16) -> u8 {
        match self.register_at(addr) {
            Some(register) => self.read_register(register),
            None => self.mem.read_byte(addr),
        }
    }

    fn write_byte(&mut self, addr: u16, value: u8) {
        match self.register_at(addr) {
            Some(register) => self.write_register(register, value),
            None => self.mem.write_byte(addr, value),
        }
    }
}
