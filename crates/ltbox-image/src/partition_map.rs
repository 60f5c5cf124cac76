//! Partition descriptors (`rawprogram*.xml`) and label lookup
//!
//! A descriptor lists `<program>` entries:
//!
//! ```xml
//! <data>
//!   <program label="boot_a" physical_partition_number="4"
//!            start_sector="131078" num_partition_sectors="24576"
//!            filename="boot.img" />
//! </data>
//! ```

use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use ltbox_core::prelude::*;
use ltbox_core::NotFoundReason;

/// Where one labelled partition lives on the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub label: String,
    pub lun: u32,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub filename: String,
    /// Descriptor the record was read from
    pub source_descriptor: PathBuf,
}

/// Records from a set of descriptors, in build order
#[derive(Debug, Clone, Default)]
pub struct PartitionMap {
    records: Vec<PartitionRecord>,
    descriptors: usize,
}

impl PartitionMap {
    /// Parse every descriptor in order
    ///
    /// An unparseable descriptor fails the whole build.
    pub fn build<P: AsRef<Path>>(descriptor_paths: &[P]) -> Result<Self> {
        let mut records = Vec::new();
        for path in descriptor_paths {
            let path = path.as_ref();
            let parsed = parse_descriptor(path)?;
            debug!("{}: {} program entries", path.display(), parsed.len());
            records.extend(parsed);
        }
        Ok(Self {
            records,
            descriptors: descriptor_paths.len(),
        })
    }

    /// Find `label`, ignoring case; the first descriptor wins
    ///
    /// `boot` alone falls back to `boot_a`, then `boot_b`.
    pub fn lookup(&self, label: &str) -> Result<&PartitionRecord> {
        if self.descriptors == 0 {
            return Err(Error::PartitionNotFound {
                label: label.to_string(),
                reason: NotFoundReason::NoDescriptors,
            });
        }

        let found = self.find(label).or_else(|| {
            if label.eq_ignore_ascii_case("boot") {
                self.find("boot_a").or_else(|| self.find("boot_b"))
            } else {
                None
            }
        });

        found.ok_or_else(|| Error::PartitionNotFound {
            label: label.to_string(),
            reason: NotFoundReason::LabelAbsent {
                descriptors: self.descriptors,
            },
        })
    }

    pub fn records(&self) -> &[PartitionRecord] {
        &self.records
    }

    pub fn descriptor_count(&self) -> usize {
        self.descriptors
    }

    fn find(&self, label: &str) -> Option<&PartitionRecord> {
        self.records
            .iter()
            .find(|r| r.label.eq_ignore_ascii_case(label))
    }
}

/// Parse the `<program>` entries of one descriptor file
pub fn parse_descriptor(path: &Path) -> Result<Vec<PartitionRecord>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::descriptor(path, format!("cannot read: {}", e)))?;
    parse_descriptor_str(&raw, path)
}

fn parse_descriptor_str(raw: &str, source: &Path) -> Result<Vec<PartitionRecord>> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);
    let mut records = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| {
            Error::descriptor(
                source,
                format!("XML error at byte {}: {}", reader.error_position(), e),
            )
        })?;
        match event {
            Event::Start(element) | Event::Empty(element) if element.name().as_ref() == b"program" => {
                if let Some(record) = parse_program(&element, source)? {
                    records.push(record);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(records)
}

/// One `<program>` element; `None` for entries that name no usable partition
fn parse_program(element: &BytesStart<'_>, source: &Path) -> Result<Option<PartitionRecord>> {
    let mut label = String::new();
    let mut lun = None;
    let mut start = None;
    let mut num = None;
    let mut filename = String::new();

    for attr in element.attributes() {
        let attr = attr.map_err(|e| Error::descriptor(source, format!("bad attribute: {}", e)))?;
        let value = attr
            .unescape_value()
            .map_err(|e| Error::descriptor(source, format!("bad attribute value: {}", e)))?;
        let value = value.trim();
        match attr.key.as_ref() {
            b"label" => label = value.to_string(),
            b"physical_partition_number" => lun = Some(value.to_string()),
            b"start_sector" => start = Some(value.to_string()),
            b"num_partition_sectors" => num = Some(value.to_string()),
            b"filename" => filename = value.to_string(),
            _ => {}
        }
    }

    if label.is_empty() {
        return Ok(None);
    }

    // Entries such as the backup GPT use expressions like `NUM_DISK_SECTORS-5.`
    let parsed = (
        lun.as_deref().and_then(|v| v.parse::<u32>().ok()),
        start.as_deref().and_then(|v| v.parse::<u64>().ok()),
        num.as_deref().map_or(Some(0), |v| v.parse::<u64>().ok()),
    );
    match parsed {
        (Some(lun), Some(start_sector), Some(num_sectors)) => Ok(Some(PartitionRecord {
            label,
            lun,
            start_sector,
            num_sectors,
            filename,
            source_descriptor: source.to_path_buf(),
        })),
        _ => {
            debug!(
                "Skipping '{}' in {}: non-numeric location (lun={:?}, start={:?}, sectors={:?})",
                label,
                source.display(),
                lun,
                start,
                num
            );
            Ok(None)
        }
    }
}

/// `rawprogram*.xml` descriptors in `dir`, sorted by file name
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    list_xml(dir, "rawprogram")
}

/// Which partitions have a patched image ready to be flashed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchedPartitions {
    pub persist: bool,
    pub devinfo: bool,
}

/// Descriptors for a full flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashDescriptors {
    pub raw: Vec<PathBuf>,
    pub patch: Vec<PathBuf>,
}

const RAWPROGRAM0: &str = "rawprogram0.xml";
const PERSIST_WRITE: &str = "rawprogram_write_persist_unsparse0.xml";
const PERSIST_SAVE: &str = "rawprogram_save_persist_unsparse0.xml";
const DEVINFO_WRITE: &str = "rawprogram4_write_devinfo.xml";
const DEVINFO_ORIGINAL: &str = "rawprogram4.xml";

/// Pick the raw-program and patch descriptors for a full flash of `image_dir`
///
/// `rawprogram0.xml` is never flashed. The write variants for persist and
/// devinfo replace their preserving counterparts only when a patched image is
/// available; otherwise the write variant is dropped so device data survives.
pub fn select_flash_descriptors(image_dir: &Path, patched: PatchedPartitions) -> Result<FlashDescriptors> {
    let mut raw: Vec<PathBuf> = list_xml(image_dir, "rawprogram")?
        .into_iter()
        .filter(|p| file_name(p) != RAWPROGRAM0)
        .collect();
    let patch = list_xml(image_dir, "patch")?;

    choose_variant(&mut raw, image_dir, PERSIST_WRITE, PERSIST_SAVE, patched.persist, "persist");
    choose_variant(&mut raw, image_dir, DEVINFO_WRITE, DEVINFO_ORIGINAL, patched.devinfo, "devinfo");

    if raw.is_empty() || patch.is_empty() {
        return Err(Error::descriptor(
            image_dir,
            "rawprogram*.xml (excluding rawprogram0.xml) or patch*.xml missing",
        ));
    }
    Ok(FlashDescriptors { raw, patch })
}

fn choose_variant(
    raw: &mut Vec<PathBuf>,
    image_dir: &Path,
    write: &str,
    keep: &str,
    patched: bool,
    partition: &str,
) {
    if !image_dir.join(write).is_file() {
        return;
    }
    if patched {
        info!("Using {} for {} (patched image)", write, partition);
        raw.retain(|p| file_name(p) != keep);
    } else {
        info!("Skipping {} flash, preserving device data", partition);
        raw.retain(|p| file_name(p) != write);
    }
}

fn list_xml(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::file(dir, e))?;
    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let name = file_name(path);
            path.is_file() && name.starts_with(prefix) && name.ends_with(".xml")
        })
        .collect();
    found.sort();
    Ok(found)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn write_xml(dir: &TempDir, name: &str, programs: &[(&str, u32, &str, u64)]) -> PathBuf {
        let mut body = String::from("<?xml version=\"1.0\" ?>\n<data>\n");
        for (label, lun, start, num) in programs {
            body.push_str(&format!(
                "  <program SECTOR_SIZE_IN_BYTES=\"4096\" filename=\"{label}.img\" label=\"{label}\" \
                 num_partition_sectors=\"{num}\" physical_partition_number=\"{lun}\" start_sector=\"{start}\"/>\n"
            ));
        }
        body.push_str("</data>\n");
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_parse_program_entries() {
        let dir = tempdir().unwrap();
        let xml = write_xml(&dir, "rawprogram4.xml", &[("devinfo", 4, "6", 1), ("", 4, "7", 1)]);

        let records = parse_descriptor(&xml).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, "devinfo");
        assert_eq!(records[0].lun, 4);
        assert_eq!(records[0].start_sector, 6);
        assert_eq!(records[0].num_sectors, 1);
        assert_eq!(records[0].filename, "devinfo.img");
        assert_eq!(records[0].source_descriptor, xml);
    }

    #[test]
    fn test_symbolic_start_sector_skipped() {
        let dir = tempdir().unwrap();
        let xml = write_xml(
            &dir,
            "rawprogram0.xml",
            &[("BackupGPT", 0, "NUM_DISK_SECTORS-5.", 5), ("xbl_a", 1, "6", 896)],
        );
        let records = parse_descriptor(&xml).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, "xbl_a");
    }

    #[test]
    fn test_malformed_descriptor_is_typed_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rawprogram1.xml");
        std::fs::write(&path, "<data><program label=\"boot\"/></datum>").unwrap();

        let err = PartitionMap::build(&[path]).unwrap_err();
        assert!(matches!(err, Error::Descriptor { .. }));
    }

    #[test]
    fn test_lookup_case_insensitive_first_wins() {
        let dir = tempdir().unwrap();
        let first = write_xml(&dir, "rawprogram1.xml", &[("Persist", 0, "100", 8192)]);
        let second = write_xml(&dir, "rawprogram2.xml", &[("persist", 2, "900", 8192)]);

        let map = PartitionMap::build(&[first.clone(), second]).unwrap();
        let record = map.lookup("PERSIST").unwrap();
        assert_eq!(record.lun, 0);
        assert_eq!(record.source_descriptor, first);
    }

    #[test]
    fn test_boot_prefers_boot_a_over_boot_b() {
        let dir = tempdir().unwrap();
        // boot_b appears first in build order and must still lose to boot_a
        let first = write_xml(&dir, "rawprogram2.xml", &[("boot_b", 4, "300", 16384)]);
        let second = write_xml(&dir, "rawprogram4.xml", &[("boot_a", 4, "200", 16384)]);

        let map = PartitionMap::build(&[first, second]).unwrap();
        assert_eq!(map.lookup("boot").unwrap().label, "boot_a");
    }

    #[test]
    fn test_boot_fallback_only_for_boot() {
        let dir = tempdir().unwrap();
        let xml = write_xml(&dir, "rawprogram4.xml", &[("vbmeta_a", 4, "1", 16)]);
        let map = PartitionMap::build(&[xml]).unwrap();
        assert!(map.lookup("vbmeta").is_err());
    }

    #[test]
    fn test_lookup_failure_reasons() {
        let empty = PartitionMap::build::<PathBuf>(&[]).unwrap();
        assert!(matches!(
            empty.lookup("boot"),
            Err(Error::PartitionNotFound {
                reason: NotFoundReason::NoDescriptors,
                ..
            })
        ));

        let dir = tempdir().unwrap();
        let xml = write_xml(&dir, "rawprogram1.xml", &[("xbl_a", 1, "6", 896)]);
        let map = PartitionMap::build(&[xml]).unwrap();
        assert!(matches!(
            map.lookup("devinfo"),
            Err(Error::PartitionNotFound {
                reason: NotFoundReason::LabelAbsent { descriptors: 1 },
                ..
            })
        ));
    }

    #[test]
    fn test_discover_lists_rawprogram_sorted() {
        let dir = tempdir().unwrap();
        for name in ["rawprogram4.xml", "patch0.xml", "rawprogram1.xml", "notes.txt"] {
            std::fs::write(dir.path().join(name), "<data/>").unwrap();
        }
        let names: Vec<String> = discover(dir.path())
            .unwrap()
            .iter()
            .map(|p| file_name(p))
            .collect();
        assert_eq!(names, vec!["rawprogram1.xml", "rawprogram4.xml"]);
    }

    fn flash_dir() -> TempDir {
        let dir = tempdir().unwrap();
        for name in [
            "rawprogram0.xml",
            "rawprogram1.xml",
            "rawprogram4.xml",
            "rawprogram4_write_devinfo.xml",
            "rawprogram_save_persist_unsparse0.xml",
            "rawprogram_write_persist_unsparse0.xml",
            "patch0.xml",
            "patch1.xml",
        ] {
            std::fs::write(dir.path().join(name), "<data/>").unwrap();
        }
        dir
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths.iter().map(|p| file_name(p)).collect()
    }

    #[test]
    fn test_select_without_patched_images_preserves_data() {
        let dir = flash_dir();
        let selected = select_flash_descriptors(dir.path(), PatchedPartitions::default()).unwrap();
        assert_eq!(
            names(&selected.raw),
            vec![
                "rawprogram1.xml",
                "rawprogram4.xml",
                "rawprogram_save_persist_unsparse0.xml"
            ]
        );
        assert_eq!(names(&selected.patch), vec!["patch0.xml", "patch1.xml"]);
    }

    #[test]
    fn test_select_with_patched_images_uses_write_variants() {
        let dir = flash_dir();
        let selected = select_flash_descriptors(
            dir.path(),
            PatchedPartitions {
                persist: true,
                devinfo: true,
            },
        )
        .unwrap();
        assert_eq!(
            names(&selected.raw),
            vec![
                "rawprogram1.xml",
                "rawprogram4_write_devinfo.xml",
                "rawprogram_write_persist_unsparse0.xml"
            ]
        );
    }

    #[test]
    fn test_select_requires_patch_descriptors() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("rawprogram1.xml"), "<data/>").unwrap();
        let err = select_flash_descriptors(dir.path(), PatchedPartitions::default()).unwrap_err();
        assert!(matches!(err, Error::Descriptor { .. }));
    }
}
