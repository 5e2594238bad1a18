//! End-to-end tests over real image files in the system temp directory.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use floppy_core::controller::{completion, status, Command, Register, RECALIBRATE_SETTLE};
use floppy_core::sector::{DISK_SIZE_360K, DISK_SIZE_720K, SECTOR_SIZE};
use floppy_core::{
    load_archive, DiskImage, FlatMemory, FloppyController, FloppyError, MemoryBus,
};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("floppy-it-{}-{}", std::process::id(), name))
}

fn reg(fdc: &FloppyController<FlatMemory>, register: Register) -> u16 {
    fdc.base() + register as u16
}

#[test]
fn test_full_file_lifecycle() {
    let path = temp_path("lifecycle.img");
    FloppyController::<FlatMemory>::create_disk(&path, false).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), DISK_SIZE_360K as u64);

    let mut fdc = FloppyController::new(FlatMemory::new());
    fdc.mount_disk('A', &path).unwrap();
    fdc.initialize_filesystem('A').unwrap();

    fdc.write_file('A', "TEST.TXT", b"Hello, World!").unwrap();

    let listing = fdc.list_files('A').unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "TEST.TXT");
    assert_eq!(listing[0].size, 13);

    assert_eq!(fdc.read_file('A', "TEST.TXT").unwrap(), b"Hello, World!");

    // Deleting returns the chain to the free pool.
    let before = fdc.get_free_space('A').unwrap();
    fdc.delete_file('A', "TEST.TXT").unwrap();
    let after = fdc.get_free_space('A').unwrap();
    assert_eq!(after.free_bytes, before.free_bytes + SECTOR_SIZE);
    assert!(fdc.list_files('A').unwrap().is_empty());
    assert!(matches!(
        fdc.read_file('A', "TEST.TXT"),
        Err(FloppyError::FileNotFound(_))
    ));

    // Changes survive unmount and remount.
    fdc.write_file('A', "KEEP.TXT", b"persisted").unwrap();
    fdc.unmount_all().unwrap();

    let mut fdc = FloppyController::new(FlatMemory::new());
    fdc.mount_disk('A', &path).unwrap();
    assert_eq!(fdc.read_file('A', "KEEP.TXT").unwrap(), b"persisted");
    fdc.unmount_all().unwrap();

    fs::remove_file(path).unwrap();
}

#[test]
fn test_multi_cluster_files_round_trip() {
    let path = temp_path("span.img");
    FloppyController::<FlatMemory>::create_disk(&path, true).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), DISK_SIZE_720K as u64);

    let mut fdc = FloppyController::new(FlatMemory::new());
    fdc.mount_disk('B', &path).unwrap();
    fdc.initialize_filesystem('B').unwrap();

    let data: Vec<u8> = (0..4000u32).map(|i| (i * 7 % 256) as u8).collect();
    fdc.write_file('B', "BIG.DAT", &data).unwrap();
    assert_eq!(fdc.read_file('B', "BIG.DAT").unwrap(), data);

    let space = fdc.get_free_space('B').unwrap();
    assert_eq!(space.used_bytes, 8 * SECTOR_SIZE);

    fdc.unmount_all().unwrap();
    fs::remove_file(path).unwrap();
}

#[test]
fn test_mount_rejects_wrong_size() {
    let path = temp_path("short.img");
    fs::write(&path, vec![0u8; 12345]).unwrap();

    let mut disks = DiskImage::new();
    assert!(matches!(
        disks.mount('A', &path),
        Err(FloppyError::InvalidImageSize(12345))
    ));
    assert!(disks.mounted_drives().is_empty());

    fs::remove_file(path).unwrap();
}

#[test]
fn test_register_session() {
    let path = temp_path("regs.img");
    FloppyController::<FlatMemory>::create_disk(&path, false).unwrap();

    let mut fdc = FloppyController::new(FlatMemory::new());
    fdc.mount_disk('A', &path).unwrap();

    // Unknown opcode fails immediately, without blocking.
    fdc.write_byte(reg(&fdc, Register::Command), 0xEE);
    assert_eq!(
        fdc.read_byte(reg(&fdc, Register::Status)),
        completion::INVALID_COMMAND
    );

    // Recalibrate completes after the simulated settle delay.
    fdc.write_byte(reg(&fdc, Register::Track), 33);
    fdc.write_byte(reg(&fdc, Register::Command), Command::Recalibrate as u8);
    assert_ne!(
        fdc.read_byte(reg(&fdc, Register::Status)) & status::BUSY,
        0
    );
    std::thread::sleep(RECALIBRATE_SETTLE + Duration::from_millis(30));
    assert_eq!(
        fdc.read_byte(reg(&fdc, Register::Status)),
        completion::SUCCESS
    );
    assert_eq!(fdc.read_byte(reg(&fdc, Register::Track)), 0);

    // Sector written through the register protocol is visible to the
    // high-level API.
    fdc.write_byte(reg(&fdc, Register::DriveSelect), 0);
    fdc.write_byte(reg(&fdc, Register::Track), 2);
    fdc.write_byte(reg(&fdc, Register::Sector), 3);
    fdc.write_byte(reg(&fdc, Register::Command), Command::WriteSector as u8);
    for i in 0..SECTOR_SIZE {
        fdc.write_byte(reg(&fdc, Register::Data), (i % 100) as u8);
    }
    assert_eq!(
        fdc.read_byte(reg(&fdc, Register::Status)),
        completion::SUCCESS
    );

    let sector = fdc.disks().read_sector('A', 2, 3).unwrap();
    let expected: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i % 100) as u8).collect();
    assert_eq!(sector.to_vec(), expected);

    fdc.unmount_all().unwrap();
    fs::remove_file(path).unwrap();
}

#[test]
fn test_archive_import_end_to_end() {
    use std::io::Write;

    let zip_path = temp_path("seed.zip");
    {
        let file = fs::File::create(&zip_path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file::<_, ()>("manifest.json", Default::default())
            .unwrap();
        zip.write_all(br#"{ "label": "seed", "files": [] }"#).unwrap();
        zip.start_file::<_, ()>("hello.txt", Default::default())
            .unwrap();
        zip.write_all(b"Hello, World!").unwrap();
        zip.finish().unwrap();
    }

    let img_path = temp_path("seeded.img");
    FloppyController::<FlatMemory>::create_disk(&img_path, false).unwrap();

    let mut fdc = FloppyController::new(FlatMemory::new());
    fdc.mount_disk('A', &img_path).unwrap();
    fdc.initialize_filesystem('A').unwrap();

    let archive = load_archive(std::io::BufReader::new(fs::File::open(&zip_path).unwrap()))
        .unwrap();
    assert_eq!(archive.label(), "seed");
    let report =
        floppy_core::import_archive(fdc.disks_mut().buffer_mut('A').unwrap(), &archive);
    assert_eq!(report.imported, vec!["HELLO.TXT".to_string()]);

    assert_eq!(fdc.read_file('A', "HELLO.TXT").unwrap(), b"Hello, World!");

    fdc.unmount_all().unwrap();
    fs::remove_file(zip_path).unwrap();
    fs::remove_file(img_path).unwrap();
}
