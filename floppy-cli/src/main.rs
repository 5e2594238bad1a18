//! floppy - FAT12 disk image workbench.
//!
//! Usage:
//!   floppy create disk.img [--double-sided]
//!   floppy dir disk.img
//!   floppy put disk.img notes.txt
//!   floppy type disk.img NOTES.TXT
//!   floppy import disk.img starter.zip
//!   floppy shell disk.img [second.img]    # interactive monitor on A:/B:

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tokio::sync::mpsc as tokio_mpsc;

use floppy_core::controller::{status, Command, Register};
use floppy_core::{
    import_archive, load_archive_from_path, BootSector, FlatMemory, FloppyController,
    FloppyResult, MemoryBus,
};

/// FAT12 floppy disk image workbench
#[derive(Parser, Debug)]
#[command(name = "floppy")]
#[command(about = "Create, inspect, and populate floppy disk images")]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    /// Log failure reasons from the disk layers
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create a blank image and initialize its filesystem
    Create {
        image: PathBuf,
        /// Create a 720KB double-sided image instead of 360KB
        #[arg(long)]
        double_sided: bool,
    },
    /// Re-initialize the filesystem on an existing image
    Format { image: PathBuf },
    /// Show boot-sector geometry and space usage
    Info { image: PathBuf },
    /// List the root directory
    Dir { image: PathBuf },
    /// Print a file's content to stdout
    Type { image: PathBuf, name: String },
    /// Copy a host file into the image
    Put {
        image: PathBuf,
        file: PathBuf,
        /// Store under this name instead of the host filename
        #[arg(long = "as")]
        as_name: Option<String>,
    },
    /// Delete a file
    Del { image: PathBuf, name: String },
    /// Import a content archive (ZIP, optional manifest.json)
    Import { image: PathBuf, archive: PathBuf },
    /// Interactive monitor with images mounted on A: and B:
    Shell { images: Vec<PathBuf> },
}

/// Minimal stderr logger for the `log` facade used by floppy-core.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Mount an image on A:, run the operation, and unmount (persisting any
/// changes).
fn with_mounted<F>(image: &Path, f: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&mut FloppyController<FlatMemory>) -> FloppyResult<()>,
{
    let mut fdc = FloppyController::new(FlatMemory::new());
    fdc.mount_disk('A', image)?;
    let result = f(&mut fdc);
    fdc.unmount_all()?;
    result?;
    Ok(())
}

fn attribute_string(attributes: u8) -> String {
    let flags = [
        (0x01, 'R'),
        (0x02, 'H'),
        (0x04, 'S'),
        (0x10, 'D'),
        (0x20, 'A'),
    ];
    flags
        .iter()
        .map(|&(bit, ch)| if attributes & bit != 0 { ch } else { '-' })
        .collect()
}

fn cmd_info(image: &Path) -> Result<(), Box<dyn std::error::Error>> {
    with_mounted(image, |fdc| {
        let info = fdc.get_disk_info('A')?;
        println!("Image:  {}", info.path.display());
        println!(
            "Size:   {} bytes ({})",
            info.size,
            if info.double_sided { "720KB" } else { "360KB" }
        );

        match BootSector::parse(fdc.disks().buffer('A')?) {
            Ok(boot) => {
                println!("OEM:    {}", boot.oem_string());
                println!(
                    "Layout: {} bytes/sector, {} sector(s)/cluster, {} FATs, {} root entries, {} total sectors",
                    boot.bytes_per_sector,
                    boot.sectors_per_cluster,
                    boot.fat_copies,
                    boot.root_entries,
                    boot.total_sectors
                );
                let space = fdc.get_free_space('A')?;
                println!(
                    "Space:  {} bytes free, {} used, {} marked bad",
                    space.free_bytes, space.used_bytes, space.bad_bytes
                );
            }
            Err(_) => println!("No filesystem (missing boot signature)"),
        }
        Ok(())
    })
}

fn cmd_dir(image: &Path) -> Result<(), Box<dyn std::error::Error>> {
    with_mounted(image, |fdc| {
        let mut files = fdc.list_files('A')?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        for info in &files {
            println!(
                "{:<12} {:>8}  {}  cluster {}",
                info.name,
                info.size,
                attribute_string(info.attributes),
                info.start_cluster
            );
        }
        let space = fdc.get_free_space('A')?;
        println!("{} file(s), {} bytes free", files.len(), space.free_bytes);
        Ok(())
    })
}

fn run_batch(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Cmd::Create {
            image,
            double_sided,
        } => {
            FloppyController::<FlatMemory>::create_disk(&image, double_sided)?;
            with_mounted(&image, |fdc| fdc.initialize_filesystem('A'))?;
            println!("Created {}", image.display());
        }
        Cmd::Format { image } => {
            with_mounted(&image, |fdc| fdc.initialize_filesystem('A'))?;
            println!("Formatted {}", image.display());
        }
        Cmd::Info { image } => cmd_info(&image)?,
        Cmd::Dir { image } => cmd_dir(&image)?,
        Cmd::Type { image, name } => {
            with_mounted(&image, |fdc| {
                let data = fdc.read_file('A', &name)?;
                io::stdout().write_all(&data)?;
                Ok(())
            })?;
        }
        Cmd::Put {
            image,
            file,
            as_name,
        } => {
            let data = std::fs::read(&file)?;
            let name = as_name.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "NONAME".to_string())
            });
            with_mounted(&image, |fdc| fdc.write_file('A', &name, &data))?;
            println!("Stored {} ({} bytes)", floppy_core::to_8_3(&name), data.len());
        }
        Cmd::Del { image, name } => {
            with_mounted(&image, |fdc| fdc.delete_file('A', &name))?;
            println!("Deleted {}", floppy_core::to_8_3(&name));
        }
        Cmd::Import { image, archive } => {
            let loaded = load_archive_from_path(&archive)?;
            println!("Importing {} ({} files)", loaded.label(), loaded.files.len());
            with_mounted(&image, |fdc| {
                let report = import_archive(fdc.disks_mut().buffer_mut('A')?, &loaded);
                for name in &report.imported {
                    println!("  + {}", name);
                }
                for (name, reason) in &report.skipped {
                    println!("  ! {} ({})", name, reason);
                }
                Ok(())
            })?;
        }
        Cmd::Shell { .. } => unreachable!("shell handled separately"),
    }
    Ok(())
}

// ==================== Interactive shell ====================

/// Translate crossterm key events to monitor key codes.
fn translate_key(code: KeyCode, modifiers: KeyModifiers) -> Option<u8> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(c) = code {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() {
                return Some(upper as u8 - 64); // Ctrl+C = 3
            }
        }
    }

    match code {
        KeyCode::Char(c) => Some(c as u8),
        KeyCode::Enter => Some(13),
        KeyCode::Backspace => Some(8),
        KeyCode::Esc => Some(27),
        _ => None,
    }
}

struct Monitor {
    fdc: FloppyController<FlatMemory>,
    current_drive: char,
}

impl Monitor {
    fn print(&self, text: &str) {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        // Raw mode needs explicit carriage returns.
        let _ = handle.write_all(text.replace('\n', "\r\n").as_bytes());
        let _ = handle.flush();
    }

    fn prompt(&self) {
        self.print(&format!("{}> ", self.current_drive));
    }

    /// Split an optional drive prefix off a name ("B:FILE.TXT").
    fn split_drive(&self, name: &str) -> (char, String) {
        let bytes = name.as_bytes();
        if bytes.len() >= 2 && bytes[1] == b':' {
            let drive = (bytes[0] as char).to_ascii_uppercase();
            if drive == 'A' || drive == 'B' {
                return (drive, name[2..].to_string());
            }
        }
        (self.current_drive, name.to_string())
    }

    fn register(&self, register: Register) -> u16 {
        self.fdc.base() + register as u16
    }

    /// Issue a head-movement command through the register protocol and
    /// poll STATUS until the deferred completion fires.
    fn issue_seek(&mut self, opcode: Command, track: u8) {
        let select = if self.current_drive == 'A' { 0 } else { 1 };
        self.fdc.write_byte(self.register(Register::DriveSelect), select);
        self.fdc.write_byte(self.register(Register::Track), track);
        let started = Instant::now();
        self.fdc
            .write_byte(self.register(Register::Command), opcode as u8);

        loop {
            let value = self.fdc.read_byte(self.register(Register::Status));
            if value & status::BUSY == 0 {
                self.print(&format!(
                    "status {:#04X} after {} ms\n",
                    value,
                    started.elapsed().as_millis()
                ));
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn show_status(&mut self) {
        let select = if self.current_drive == 'A' { 0 } else { 1 };
        self.fdc.write_byte(self.register(Register::DriveSelect), select);
        self.fdc
            .write_byte(self.register(Register::Command), Command::ReadStatus as u8);
        let bits = self.fdc.read_byte(self.register(Register::Data));

        let mut flags = Vec::new();
        if bits & status::TRACK_0 != 0 {
            flags.push("TRACK0");
        }
        if bits & status::SEEK_COMPLETE != 0 {
            flags.push("SEEK_COMPLETE");
        }
        if bits & status::CRC_ERROR != 0 {
            flags.push("CRC_ERROR");
        }
        if bits & status::DRIVE_READY != 0 {
            flags.push("READY");
        }
        if bits & status::DRIVE_FAULT != 0 {
            flags.push("FAULT");
        }
        self.print(&format!("{:#04X} [{}]\n", bits, flags.join(" ")));
    }

    /// Execute one monitor command line. Returns false when the session
    /// should end.
    fn execute(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }
        let upper = line.to_uppercase();
        let mut parts = upper.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let argument = parts.next().unwrap_or("");

        match verb {
            "A:" | "B:" => {
                let drive = verb.chars().next().unwrap_or('A');
                if self.fdc.disks().is_mounted(drive) {
                    self.current_drive = drive;
                } else {
                    self.print("drive not mounted\n");
                }
            }
            "DIR" => {
                let drive = if argument.is_empty() {
                    self.current_drive
                } else {
                    argument.chars().next().unwrap_or(self.current_drive)
                };
                match self.fdc.list_files(drive) {
                    Ok(mut files) => {
                        files.sort_by(|a, b| a.name.cmp(&b.name));
                        for info in &files {
                            self.print(&format!("{:<12} {:>8}\n", info.name, info.size));
                        }
                        match self.fdc.get_free_space(drive) {
                            Ok(space) => self.print(&format!(
                                "{} file(s), {} bytes free\n",
                                files.len(),
                                space.free_bytes
                            )),
                            Err(e) => self.print(&format!("{}\n", e)),
                        }
                    }
                    Err(e) => self.print(&format!("{}\n", e)),
                }
            }
            "TYPE" => {
                let (drive, name) = self.split_drive(argument);
                match self.fdc.read_file(drive, &name) {
                    Ok(data) => {
                        self.print(&String::from_utf8_lossy(&data));
                        self.print("\n");
                    }
                    Err(e) => self.print(&format!("{}\n", e)),
                }
            }
            "DEL" => {
                let (drive, name) = self.split_drive(argument);
                match self.fdc.delete_file(drive, &name) {
                    Ok(()) => self.print("deleted\n"),
                    Err(e) => self.print(&format!("{}\n", e)),
                }
            }
            "FREE" => match self.fdc.get_free_space(self.current_drive) {
                Ok(space) => self.print(&format!(
                    "{} bytes free, {} used, {} bad\n",
                    space.free_bytes, space.used_bytes, space.bad_bytes
                )),
                Err(e) => self.print(&format!("{}\n", e)),
            },
            "SEEK" => match argument.parse::<u8>() {
                Ok(track) => self.issue_seek(Command::SeekTrack, track),
                Err(_) => self.print("usage: SEEK <track>\n"),
            },
            "RECAL" => self.issue_seek(Command::Recalibrate, 0),
            "STATUS" => self.show_status(),
            "HELP" => {
                self.print(
                    "commands: DIR [d] TYPE <name> DEL <name> FREE SEEK <n> RECAL STATUS A: B: EXIT\n",
                );
            }
            "EXIT" | "QUIT" => return false,
            _ => self.print("unknown command (try HELP)\n"),
        }
        true
    }
}

/// Blocking monitor loop: consume keys from the channel, echo and edit the
/// line, and keep servicing the controller's deferred completions while
/// idle.
fn shell_loop(
    mut monitor: Monitor,
    keys: mpsc::Receiver<u8>,
) -> FloppyResult<()> {
    monitor.print("floppy monitor (HELP for commands)\n");
    monitor.prompt();

    let mut line = String::new();
    loop {
        match keys.recv_timeout(Duration::from_millis(20)) {
            Ok(13) => {
                monitor.print("\n");
                let entered = std::mem::take(&mut line);
                if !monitor.execute(&entered) {
                    break;
                }
                monitor.prompt();
            }
            Ok(8) | Ok(127) => {
                if line.pop().is_some() {
                    monitor.print("\x08 \x08");
                }
            }
            Ok(3) | Ok(27) => break, // Ctrl+C / Esc
            Ok(ch) if (32..127).contains(&ch) => {
                line.push(ch as char);
                let _ = io::stdout().write_all(&[ch]);
                let _ = io::stdout().flush();
            }
            Ok(_) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {
                monitor.fdc.service();
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    monitor.print("\n");
    monitor.fdc.unmount_all()
}

async fn run_shell(images: Vec<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    if images.is_empty() || images.len() > 2 {
        return Err("shell takes one or two images (A: and B:)".into());
    }

    let mut fdc = FloppyController::new(FlatMemory::new());
    for (i, path) in images.iter().enumerate() {
        let drive = (b'A' + i as u8) as char;
        fdc.mount_disk(drive, path)?;
        eprintln!("Mounted {} on {}:", path.display(), drive);
    }

    let monitor = Monitor {
        fdc,
        current_drive: 'A',
    };

    // Keyboard channel between the async input reader and the blocking
    // monitor loop.
    let (key_tx, key_rx) = mpsc::channel::<u8>();
    let (shutdown_tx, mut shutdown_rx) = tokio_mpsc::channel::<()>(1);

    let raw_mode_enabled = enable_raw_mode().is_ok();

    let shell_handle = tokio::task::spawn_blocking(move || shell_loop(monitor, key_rx));

    let input_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    if event::poll(Duration::from_millis(0)).unwrap_or(false) {
                        if let Ok(Event::Key(key_event)) = event::read() {
                            if let Some(ch) = translate_key(key_event.code, key_event.modifiers) {
                                if key_tx.send(ch).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    });

    let result = shell_handle.await?;

    let _ = shutdown_tx.send(()).await;
    let _ = input_handle.await;

    if raw_mode_enabled {
        let _ = disable_raw_mode();
    }

    result?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let _ = log::set_logger(&LOGGER);
    log::set_max_level(if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    });

    match args.command {
        Cmd::Shell { ref images } => run_shell(images.clone()).await,
        _ => run_batch(args),
    }
}
