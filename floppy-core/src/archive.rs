//! Content archives: ZIP files used to seed disk images.
//!
//! An archive holds plain files plus an optional `manifest.json` describing
//! the set (a label and per-file destination names). Import goes through
//! the normal file-operations path, so root-directory capacity and cluster
//! accounting are respected and per-file failures are reported rather than
//! aborting the whole import.

use std::io::{Read, Seek};
use std::path::Path;

use serde::{Deserialize, Serialize};
use zip::ZipArchive;

use crate::error::FloppyResult;
use crate::fat::dir::to_8_3;
use crate::file;

/// File entry in an archive manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub src: String,
    #[serde(default)]
    pub dst: Option<String>,
}

/// Archive manifest schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveManifest {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub files: Vec<ArchiveEntry>,
}

/// A loaded content archive. Filenames are normalized to 8.3 form, with
/// manifest `dst` renames already applied.
#[derive(Debug, Clone)]
pub struct ContentArchive {
    pub manifest: Option<ArchiveManifest>,
    pub files: Vec<(String, Vec<u8>)>,
}

impl ContentArchive {
    pub fn label(&self) -> &str {
        self.manifest
            .as_ref()
            .and_then(|m| m.label.as_deref())
            .unwrap_or("unnamed archive")
    }
}

/// Load an archive from ZIP data.
pub fn load_archive<R: Read + Seek>(reader: R) -> FloppyResult<ContentArchive> {
    let mut zip = ZipArchive::new(reader)?;
    let mut manifest: Option<ArchiveManifest> = None;
    let mut raw_files: Vec<(String, Vec<u8>)> = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;

        let upper = name.to_uppercase();
        if upper == "MANIFEST.JSON" || upper.ends_with("/MANIFEST.JSON") {
            manifest = Some(serde_json::from_slice(&content)?);
        } else {
            // Nested paths flatten to the bare filename.
            let filename = name.rsplit('/').next().unwrap_or(&name);
            raw_files.push((filename.to_string(), content));
        }
    }

    // Apply manifest renames, then normalize everything to 8.3.
    let mut files = Vec::with_capacity(raw_files.len());
    for (name, content) in raw_files {
        let target = manifest
            .as_ref()
            .and_then(|m| {
                m.files
                    .iter()
                    .find(|e| e.src.eq_ignore_ascii_case(&name))
                    .and_then(|e| e.dst.clone())
            })
            .unwrap_or(name);
        files.push((to_8_3(&target), content));
    }

    Ok(ContentArchive { manifest, files })
}

/// Load an archive from a file path.
pub fn load_archive_from_path(path: impl AsRef<Path>) -> FloppyResult<ContentArchive> {
    let file = std::fs::File::open(path.as_ref())?;
    load_archive(std::io::BufReader::new(file))
}

/// Outcome of an import: which files landed and which were skipped, with
/// the reason.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: Vec<String>,
    pub skipped: Vec<(String, String)>,
}

/// Import every archive file into a FAT12 image buffer.
pub fn import_archive(buffer: &mut [u8], archive: &ContentArchive) -> ImportReport {
    let mut report = ImportReport::default();
    for (name, content) in &archive.files {
        match file::store_file(buffer, name, content) {
            Ok(()) => report.imported.push(name.clone()),
            Err(e) => {
                log::warn!("import {}: {}", name, e);
                report.skipped.push((name.clone(), e.to_string()));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat;
    use crate::sector::DISK_SIZE_360K;
    use std::io::{Cursor, Write};

    fn create_test_zip(with_manifest: bool) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut zip = zip::ZipWriter::new(cursor);

            if with_manifest {
                let manifest = r#"{
                    "label": "starter set",
                    "files": [
                        { "src": "readme.txt", "dst": "README.DOC" }
                    ]
                }"#;
                zip.start_file::<_, ()>("manifest.json", Default::default())
                    .unwrap();
                zip.write_all(manifest.as_bytes()).unwrap();
            }

            zip.start_file::<_, ()>("readme.txt", Default::default())
                .unwrap();
            zip.write_all(b"read me first").unwrap();

            zip.start_file::<_, ()>("sub/program.bin", Default::default())
                .unwrap();
            zip.write_all(&[0xC3, 0x00, 0x00]).unwrap();

            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_load_archive_without_manifest() {
        let archive = load_archive(Cursor::new(create_test_zip(false))).unwrap();
        assert!(archive.manifest.is_none());
        assert_eq!(archive.label(), "unnamed archive");

        let names: Vec<&str> = archive.files.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"README.TXT"));
        // Nested path flattened to its filename.
        assert!(names.contains(&"PROGRAM.BIN"));
    }

    #[test]
    fn test_manifest_rename_applies() {
        let archive = load_archive(Cursor::new(create_test_zip(true))).unwrap();
        assert_eq!(archive.label(), "starter set");

        let names: Vec<&str> = archive.files.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"README.DOC"));
        assert!(!names.contains(&"README.TXT"));
    }

    #[test]
    fn test_import_into_image() {
        let mut buffer = vec![0u8; DISK_SIZE_360K];
        fat::initialize_filesystem(&mut buffer).unwrap();

        let archive = load_archive(Cursor::new(create_test_zip(true))).unwrap();
        let report = import_archive(&mut buffer, &archive);
        assert_eq!(report.imported.len(), 2);
        assert!(report.skipped.is_empty());

        let listing = file::list_files(&buffer);
        assert_eq!(listing.len(), 2);
        assert_eq!(
            file::get_file_info(&buffer, "README.DOC").unwrap().size,
            13
        );
    }
}
