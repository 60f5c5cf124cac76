//! The operation surface
//!
//! Every operation opens its own [`DeviceSession`], drives the device into
//! the mode it needs and drops the session (and any EDL port lease) when it
//! returns. Image-only operations never touch the device.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ltbox_core::prelude::*;
use ltbox_core::{DeviceMode, SlotSuffix};
use ltbox_device::{
    fastboot, DeviceEnv, DeviceSession, FirehoseChannel, ModeOrchestrator, ToolPaths, ToolRunner,
};
use ltbox_image::region::{self, PrcConversion, FINGERPRINT_PROPERTY};
use ltbox_image::{
    compare, discover, select_flash_descriptors, AvbCodec, AvbImageInfo, FooterOverrides,
    PartitionMap, PatchedPair, PatchedPartitions, RollbackComparison, RollbackPatcher, ScratchDir,
};

use crate::config::LtboxConfig;
use crate::report::{
    DumpedPartition, FlashReport, ImageSummary, ReadReport, RegionCodePatch, RegionCodeReport,
    RegionConversion, SkippedPartition, WrittenPartition,
};

/// Partitions dumped when no label is given
pub const DEFAULT_DUMP_TARGETS: [&str; 2] = ["devinfo", "persist"];

/// New ROM images compared against the device, looked up in the image folder
pub const ROLLBACK_BOOT_IMAGE: &str = "boot.img";
pub const ROLLBACK_VBMETA_IMAGE: &str = "vbmeta_system.img";

/// Partition holding the kernel that root patches
pub const BOOT_LABEL: &str = "boot";

/// Stock boot image name inside `boot_backup_dir`
pub const BOOT_BACKUP_IMAGE: &str = "boot.img";

/// Timestamped folder receiving copies of devinfo/persist before patching
const CRITICAL_BACKUP_FORMAT: &str = "backup_critical_%Y%m%d_%H%M%S";

/// Images a full flash removes from the image folder afterwards
const DP_IMAGES: [&str; 2] = ["devinfo.img", "persist.img"];

pub struct Operations<R> {
    config: LtboxConfig,
    env: DeviceEnv<R>,
    adb_enabled: bool,
}

impl<R: ToolRunner> Operations<R> {
    /// Resolve the device tools and build the environment from `config`
    pub fn new(config: LtboxConfig, runner: R, adb_enabled: bool) -> Self {
        let tools = ToolPaths::resolve(&config.tools, Some(config.paths.tools_dir.as_path()));
        let missing = tools.missing();
        if !missing.is_empty() {
            warn!("Device tools not found: {}", missing.join(", "));
        }
        let env = DeviceEnv::new(runner, tools)
            .with_timings(config.timings.clone())
            .with_storage(config.storage);
        Self::with_env(config, env, adb_enabled)
    }

    pub fn with_env(config: LtboxConfig, env: DeviceEnv<R>, adb_enabled: bool) -> Self {
        Self {
            config,
            env,
            adb_enabled,
        }
    }

    pub fn config(&self) -> &LtboxConfig {
        &self.config
    }

    pub fn env(&self) -> &DeviceEnv<R> {
        &self.env
    }

    // ─────────────────────────────────────────────────────────────
    // Device operations
    // ─────────────────────────────────────────────────────────────

    /// Learn the active A/B slot
    pub async fn detect_slot(&self) -> Result<Option<SlotSuffix>> {
        let mut session = self.session();
        self.orchestrator().detect_slot(&mut session).await
    }

    /// Dump `labels` into `output_dir` as `<label>.img`
    ///
    /// Labels missing from the descriptors are skipped, and a failed read is
    /// recorded and the next label is tried unless the error is not
    /// recoverable. The device is only moved to EDL when at least one label
    /// resolves.
    pub async fn read_partitions(&self, labels: &[String], output_dir: &Path) -> Result<ReadReport> {
        let map = self.partition_map()?;
        let mut report = ReadReport::default();

        let mut targets = Vec::new();
        for label in labels {
            match map.lookup(label) {
                Ok(record) => {
                    info!(
                        "Found {} in {}: LUN={}, start={}",
                        record.label,
                        record.source_descriptor.display(),
                        record.lun,
                        record.start_sector
                    );
                    targets.push((label.clone(), record.clone()));
                }
                Err(e) => {
                    warn!("Skipping '{}': {}", label, e);
                    report.skipped.push(SkippedPartition {
                        label: label.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        if targets.is_empty() {
            warn!("No requested partition found in the descriptors, nothing to read");
            return Ok(report);
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| Error::file(output_dir, e))?;

        let mut session = self.session();
        self.open_edl(&mut session).await?;
        let channel = FirehoseChannel::new(&self.env);
        let link = session.edl_link()?;

        for (label, record) in targets {
            let out = output_dir.join(format!("{}.img", label));
            match channel
                .read_partition(link, record.lun, record.start_sector, record.num_sectors, &out)
                .await
            {
                Ok(()) => {
                    info!("Read '{}' into {}", label, out.display());
                    report.read.push(DumpedPartition {
                        label,
                        lun: record.lun,
                        start_sector: record.start_sector,
                        num_sectors: record.num_sectors,
                        path: out,
                    });
                }
                Err(e) if e.is_recoverable() => {
                    error!("Failed to read '{}': {}", label, e);
                    report.failed.push(SkippedPartition {
                        label,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e).context(format!("Reading '{}' aborted the dump", label)),
            }
        }

        self.finish(&mut session).await?;
        Ok(report)
    }

    /// Write each image to the partition named by its label
    ///
    /// A label that only exists with `_a`/`_b` variants gets the active slot
    /// applied, which is learned before the device enters EDL. Every image
    /// and label is checked before the device is touched; the first failed
    /// write stops the run.
    pub async fn write_partitions(
        &self,
        images: &BTreeMap<String, PathBuf>,
    ) -> Result<Vec<WrittenPartition>> {
        if images.is_empty() {
            warn!("No partition images given, nothing to write");
            return Ok(Vec::new());
        }
        if let Some(missing) = images.values().find(|p| !p.is_file()) {
            return Err(Error::missing_image(missing));
        }
        let map = self.partition_map()?;
        let mut session = self.session();

        let slot = if images.keys().any(|label| is_slotted(&map, label)) {
            self.orchestrator()
                .detect_slot(&mut session)
                .await?
                .unwrap_or_default()
        } else {
            SlotSuffix::None
        };

        let mut plan = Vec::with_capacity(images.len());
        for (label, image) in images {
            let target = if is_slotted(&map, label) {
                slot.apply(label)
            } else {
                label.clone()
            };
            let record = map.lookup(&target)?;
            plan.push(WrittenPartition {
                label: record.label.clone(),
                lun: record.lun,
                start_sector: record.start_sector,
                image: image.clone(),
            });
        }

        self.open_edl(&mut session).await?;
        let channel = FirehoseChannel::new(&self.env);
        let link = session.edl_link()?;
        for written in &plan {
            channel
                .write_partition(link, written.lun, written.start_sector, &written.image)
                .await?;
            info!("Wrote {} to '{}'", written.image.display(), written.label);
        }

        self.finish(&mut session).await?;
        Ok(plan)
    }

    /// Back up the active slot's boot partition as the stock image
    ///
    /// This is the first half of rooting: the dump in `boot_backup_dir` is
    /// what gets patched, and what [`Self::restore_boot`] flashes back later.
    /// An existing backup is overwritten.
    pub async fn dump_boot(&self) -> Result<DumpedPartition> {
        let map = self.partition_map()?;
        let mut session = self.session();
        let label = self.active_label(&map, &mut session, BOOT_LABEL).await?;
        let record = map.lookup(&label)?.clone();
        info!(
            "Found {} in {}: LUN={}, start={}",
            record.label,
            record.source_descriptor.display(),
            record.lun,
            record.start_sector
        );

        let backup_dir = &self.config.paths.boot_backup_dir;
        tokio::fs::create_dir_all(backup_dir)
            .await
            .map_err(|e| Error::file(backup_dir, e))?;
        let out = backup_dir.join(BOOT_BACKUP_IMAGE);

        self.open_edl(&mut session).await?;
        let link = session.edl_link()?;
        FirehoseChannel::new(&self.env)
            .read_partition(link, record.lun, record.start_sector, record.num_sectors, &out)
            .await
            .context(format!("Failed to back up '{}'", record.label))?;
        info!("Backed up '{}' to {}", record.label, out.display());

        self.finish(&mut session).await?;
        Ok(DumpedPartition {
            label: record.label,
            lun: record.lun,
            start_sector: record.start_sector,
            num_sectors: record.num_sectors,
            path: out,
        })
    }

    /// Write `image` to the active slot's boot partition over EDL
    pub async fn flash_boot(&self, image: &Path) -> Result<WrittenPartition> {
        if !image.is_file() {
            return Err(Error::missing_image(image));
        }
        let map = self.partition_map()?;
        let mut session = self.session();
        let label = self.active_label(&map, &mut session, BOOT_LABEL).await?;
        let record = map.lookup(&label)?;
        let written = WrittenPartition {
            label: record.label.clone(),
            lun: record.lun,
            start_sector: record.start_sector,
            image: image.to_path_buf(),
        };

        self.open_edl(&mut session).await?;
        let link = session.edl_link()?;
        FirehoseChannel::new(&self.env)
            .write_partition(link, written.lun, written.start_sector, image)
            .await
            .context(format!("EDL flash of '{}' failed", written.label))?;
        info!("Flashed {} to '{}'", image.display(), written.label);

        self.finish(&mut session).await?;
        Ok(written)
    }

    /// Unroot by flashing the stock boot backup back to the active slot
    ///
    /// Fails before the device is touched when the firmware descriptors or
    /// the backup in `boot_backup_dir` are missing.
    pub async fn restore_boot(&self) -> Result<WrittenPartition> {
        self.partition_map()?.lookup(BOOT_LABEL)?;
        let backup = self.config.paths.boot_backup_dir.join(BOOT_BACKUP_IMAGE);
        if !backup.is_file() {
            error!(
                "Stock boot backup not found. Place the boot.img of the current firmware in {}",
                self.config.paths.boot_backup_dir.display()
            );
            return Err(Error::missing_image(&backup));
        }
        info!("Stock boot backup found: {}", backup.display());
        self.flash_boot(&backup).await
    }

    /// Flash a full firmware folder with `loader` as the programmer
    ///
    /// The output folders are copied over `image_dir` first (devinfo and
    /// persist only unless `behavior.skip_dp`), then the raw-program and patch
    /// descriptors are selected and sent. The copied devinfo/persist images
    /// are removed from `image_dir` afterwards.
    pub async fn flash_all(&self, image_dir: &Path, loader: &Path) -> Result<FlashReport> {
        if !image_dir.is_dir() || is_empty_dir(image_dir)? {
            error!("Image folder {} is missing or empty", image_dir.display());
            return Err(Error::missing_image(image_dir));
        }
        if !loader.is_file() {
            return Err(Error::missing_image(loader));
        }

        let paths = &self.config.paths;
        let skip_dp = self.config.behavior.skip_dp;
        let mut sources = vec![
            &paths.output_dir,
            &paths.output_anti_rollback_dir,
            &paths.output_xml_dir,
        ];
        if skip_dp {
            info!("Skipping devinfo/persist copy as requested");
        } else {
            sources.push(&paths.output_dp_dir);
        }

        let mut copied_files = 0;
        for source in sources {
            if source.is_dir() {
                let count = copy_dir_contents(source, image_dir)?;
                info!("Copied {} file(s) from {}", count, source.display());
                copied_files += count;
            }
        }
        if copied_files == 0 {
            info!("No output folders found, flashing files already in {}", image_dir.display());
        }

        let patched = PatchedPartitions {
            persist: !skip_dp && paths.output_dp_dir.join("persist.img").is_file(),
            devinfo: !skip_dp && paths.output_dp_dir.join("devinfo.img").is_file(),
        };
        let descriptors = select_flash_descriptors(image_dir, patched)?;

        let mut session = self.session();
        self.orchestrator()
            .ensure_mode(&mut session, DeviceMode::Edl)
            .await?;
        let link = session.edl_link()?;
        FirehoseChannel::new(&self.env)
            .raw_program(link, loader, &descriptors.raw, &descriptors.patch)
            .await
            .context("Full flash failed. The device may be unstable; do not reboot it manually")?;

        if !skip_dp {
            for name in DP_IMAGES {
                let path = image_dir.join(name);
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!("Removed {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                }
            }
        }

        self.finish(&mut session).await?;

        Ok(FlashReport {
            copied_files,
            raw: descriptors.raw,
            patch: descriptors.patch,
        })
    }

    /// Flash small partitions from bootloader mode
    ///
    /// Images that do not exist are skipped; if none exists the call fails
    /// before the device is touched.
    pub async fn write_fastboot(&self, images: &BTreeMap<String, PathBuf>) -> Result<Vec<String>> {
        let present: Vec<(&String, &PathBuf)> = images
            .iter()
            .filter(|(label, path)| {
                let found = path.is_file();
                if !found {
                    warn!("{} not found, skipping '{}'", path.display(), label);
                }
                found
            })
            .collect();
        if present.is_empty() {
            return Err(match images.values().next() {
                Some(path) => Error::missing_image(path),
                None => Error::config("no images given for fastboot flashing"),
            });
        }

        let mut session = self.session();
        self.orchestrator()
            .ensure_mode(&mut session, DeviceMode::Bootloader)
            .await?;

        let mut flashed = Vec::with_capacity(present.len());
        for (label, image) in present {
            fastboot::flash(&self.env, label, image).await?;
            flashed.push(label.clone());
        }

        self.finish(&mut session).await?;
        Ok(flashed)
    }

    /// Disable the vendor OTA updater; returns whether it was confirmed
    pub async fn disable_ota(&self) -> Result<bool> {
        let mut session = self.session();
        self.orchestrator().disable_ota(&mut session).await
    }

    // ─────────────────────────────────────────────────────────────
    // Image operations
    // ─────────────────────────────────────────────────────────────

    /// Compare dumped device images against the ROM in the image folder
    pub fn compare_rollback(&self, dumped_boot: &Path, dumped_vbmeta: &Path) -> RollbackComparison {
        let image_dir = &self.config.paths.image_dir;
        compare(
            dumped_boot,
            dumped_vbmeta,
            &image_dir.join(ROLLBACK_BOOT_IMAGE),
            &image_dir.join(ROLLBACK_VBMETA_IMAGE),
        )
    }

    pub async fn patch_rollback(
        &self,
        comparison: &RollbackComparison,
        new_boot: &Path,
        new_vbmeta: &Path,
        output_dir: &Path,
    ) -> Result<PatchedPair> {
        RollbackPatcher::new(self.codec())
            .patch(comparison, new_boot, new_vbmeta, output_dir)
            .await
    }

    /// Convert a ROW vendor_boot to PRC and re-sign vbmeta to match
    ///
    /// With `model`, the vendor_boot fingerprint must mention it. Work happens
    /// in a scratch directory; only the finished `vendor_boot.img` and
    /// `vbmeta.img` land in `output_dir`.
    pub async fn convert_region(
        &self,
        vendor_boot: &Path,
        vbmeta: &Path,
        output_dir: &Path,
        model: Option<&str>,
    ) -> Result<RegionConversion> {
        for image in [vendor_boot, vbmeta] {
            if !image.is_file() {
                return Err(Error::missing_image(image));
            }
        }
        let codec = self.codec();
        let vendor_boot_info = codec.extract(vendor_boot)?;
        if let Some(model) = model {
            check_model(&vendor_boot_info, model)?;
        }

        let scratch = ScratchDir::create_in(&self.config.paths.work_dir, "region-")?;
        let vendor_boot_bak = scratch.join("vendor_boot.bak.img");
        let vbmeta_bak = scratch.join("vbmeta.bak.img");
        copy_file(vendor_boot, &vendor_boot_bak).await?;
        copy_file(vbmeta, &vbmeta_bak).await?;

        let original = tokio::fs::read(&vendor_boot_bak)
            .await
            .map_err(|e| Error::file(&vendor_boot_bak, e))?;
        let converted = region::convert_row_to_prc(&original);
        match converted.report {
            PrcConversion::Converted { replacements } => {
                info!("Replaced {} ROW marker(s) in vendor_boot", replacements)
            }
            PrcConversion::AlreadyPrc => info!("vendor_boot is already PRC"),
            PrcConversion::NoPatterns => warn!("No ROW or PRC markers found in vendor_boot"),
        }

        let prc = scratch.join("vendor_boot_prc.img");
        tokio::fs::write(&prc, &converted.bytes)
            .await
            .map_err(|e| Error::file(&prc, e))?;
        let rebuilt_vendor_boot = codec
            .rebuild_hash_footer(&prc, &prc, &vendor_boot_info, &FooterOverrides::default())
            .await?;

        let vbmeta_info = codec.extract(&vbmeta_bak)?;
        let rebuilt_vbmeta_path = scratch.join("vbmeta.img");
        let rebuilt_vbmeta = codec
            .rebuild_vbmeta_image(
                &rebuilt_vbmeta_path,
                &vbmeta_info,
                &[vbmeta_bak.clone(), prc.clone()],
                &FooterOverrides::default(),
            )
            .await?;

        recreate_dir(output_dir).await?;
        let final_vendor_boot = output_dir.join("vendor_boot.img");
        let final_vbmeta = output_dir.join("vbmeta.img");
        copy_file(&prc, &final_vendor_boot).await?;
        copy_file(&rebuilt_vbmeta_path, &final_vbmeta).await?;
        info!("Region conversion written to {}", output_dir.display());

        Ok(RegionConversion {
            conversion: converted.report,
            vendor_boot: ImageSummary::at(final_vendor_boot, &rebuilt_vendor_boot),
            vbmeta: ImageSummary::at(final_vbmeta, &rebuilt_vbmeta),
        })
    }

    /// Replace the country code in devinfo/persist images
    ///
    /// The inputs are first copied to a timestamped folder under the backup
    /// directory. Every image with a detected code lands in `output_dir`,
    /// unchanged ones as a plain copy; images whose code cannot be detected
    /// are left out.
    pub async fn patch_region_codes(
        &self,
        images: &[PathBuf],
        replacement: &str,
        output_dir: &Path,
    ) -> Result<RegionCodeReport> {
        let replacement = region::validate_code(replacement)?;
        if let Some(missing) = images.iter().find(|p| !p.is_file()) {
            return Err(Error::missing_image(missing));
        }

        let stamp = chrono::Local::now().format(CRITICAL_BACKUP_FORMAT).to_string();
        let backup_dir = self.config.paths.backup_dir.join(stamp);
        tokio::fs::create_dir_all(&backup_dir)
            .await
            .map_err(|e| Error::file(&backup_dir, e))?;
        for image in images {
            copy_file(image, &backup_dir.join(file_name(image)?)).await?;
        }
        info!("Backed up {} image(s) to {}", images.len(), backup_dir.display());

        recreate_dir(output_dir).await?;
        let mut patches = Vec::with_capacity(images.len());
        for image in images {
            let bytes = tokio::fs::read(image)
                .await
                .map_err(|e| Error::file(image, e))?;
            let Some(current) = region::detect_region_code(&bytes, &self.config.countries) else {
                warn!("No known country code in {}, skipping", image.display());
                patches.push(RegionCodePatch {
                    image: image.clone(),
                    detected: None,
                    outcome: None,
                    output: None,
                });
                continue;
            };
            info!(
                "{}: detected {} ({})",
                image.display(),
                current.code,
                current.name
            );

            let patched = region::replace_region_code(&bytes, &current.code, &replacement)?;
            let out = output_dir.join(file_name(image)?);
            tokio::fs::write(&out, &patched.bytes)
                .await
                .map_err(|e| Error::file(&out, e))?;
            if patched.report.changed() {
                info!("{} -> {}: {}", current.code, replacement, out.display());
            } else {
                info!("{} already {}, copied to {}", image.display(), replacement, out.display());
            }
            patches.push(RegionCodePatch {
                image: image.clone(),
                detected: Some(current.code.clone()),
                outcome: Some(patched.report),
                output: Some(out),
            });
        }

        Ok(RegionCodeReport {
            backup_dir,
            patches,
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────

    fn session(&self) -> DeviceSession {
        DeviceSession::new(self.adb_enabled)
    }

    fn orchestrator(&self) -> ModeOrchestrator<'_, R> {
        ModeOrchestrator::new(&self.env)
    }

    fn codec(&self) -> AvbCodec<'_, R> {
        AvbCodec::new(&self.env.runner, &self.config.avb, &self.config.keys)
    }

    /// Map built from every `rawprogram*.xml` in the image folder
    fn partition_map(&self) -> Result<PartitionMap> {
        PartitionMap::build(&discover(&self.config.paths.image_dir)?)
    }

    /// `label` with the active slot applied when it only exists per slot
    ///
    /// An undetectable slot falls back to the plain label, which the map
    /// resolves to the first slot it knows.
    async fn active_label(
        &self,
        map: &PartitionMap,
        session: &mut DeviceSession,
        label: &str,
    ) -> Result<String> {
        if !is_slotted(map, label) {
            return Ok(label.to_string());
        }
        match self.orchestrator().detect_slot(session).await? {
            Some(slot) => {
                info!("Active slot confirmed: {}", slot);
                Ok(slot.apply(label))
            }
            None => {
                warn!("Active slot detection failed, defaulting to '{}'", label);
                Ok(label.to_string())
            }
        }
    }

    /// Bring the session into EDL and upload the configured programmer
    async fn open_edl(&self, session: &mut DeviceSession) -> Result<()> {
        let loader = &self.config.paths.loader;
        if !loader.is_file() {
            return Err(Error::missing_image(loader));
        }
        self.orchestrator()
            .ensure_mode(session, DeviceMode::Edl)
            .await?;
        let link = session.edl_link()?;
        if !link.programmer_loaded() {
            FirehoseChannel::new(&self.env)
                .load_programmer(link, loader)
                .await?;
        }
        Ok(())
    }

    /// Return the device to system when `behavior.reboot_after` is set
    async fn finish(&self, session: &mut DeviceSession) -> Result<()> {
        if self.config.behavior.reboot_after {
            self.orchestrator()
                .ensure_mode(session, DeviceMode::System)
                .await
        } else {
            info!("Leaving device in {} mode as requested", session.current_mode());
            Ok(())
        }
    }
}

/// The label only exists with slot suffixes
fn is_slotted(map: &PartitionMap, label: &str) -> bool {
    let has = |name: &str| map.records().iter().any(|r| r.label.eq_ignore_ascii_case(name));
    !has(label) && (has(&SlotSuffix::A.apply(label)) || has(&SlotSuffix::B.apply(label)))
}

fn check_model(info: &AvbImageInfo, model: &str) -> Result<()> {
    match info.property(FINGERPRINT_PROPERTY) {
        None => {
            warn!(
                "{} has no {}, skipping model check",
                info.path.display(),
                FINGERPRINT_PROPERTY
            );
            Ok(())
        }
        Some(fingerprint) if fingerprint.contains(model) => {
            info!("Firmware fingerprint matches model {}", model);
            Ok(())
        }
        Some(fingerprint) => Err(Error::ModelMismatch {
            model: model.to_string(),
            fingerprint: fingerprint.to_string(),
        }),
    }
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(dir).map_err(|e| Error::file(dir, e))?;
    Ok(entries.next().is_none())
}

/// Copy everything under `src` into `dst`, overwriting; returns the file count
fn copy_dir_contents(src: &Path, dst: &Path) -> Result<usize> {
    std::fs::create_dir_all(dst).map_err(|e| Error::file(dst, e))?;
    let mut copied = 0;
    for entry in std::fs::read_dir(src).map_err(|e| Error::file(src, e))? {
        let entry = entry.map_err(|e| Error::file(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copied += copy_dir_contents(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(|e| Error::file(&from, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

async fn copy_file(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| Error::file(from, e))?;
    Ok(())
}

async fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| Error::file(dir, e))?;
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::file(dir, e))
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr> {
    path.file_name()
        .ok_or_else(|| Error::config(format!("{} has no file name", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltbox_core::StorageType;
    use ltbox_device::test_utils::{exit, test_env, FakeRunner, SimulatedDevice};
    use ltbox_device::{Invocation, Timings, ToolOutput};
    use ltbox_image::region::{region_marker, CodeReplacement};
    use ltbox_image::test_utils::{
        test_key_sha1, write_key, AvbImageBuilder, FakeAvbtool, TEST_PUBLIC_KEY,
    };
    use ltbox_image::{AvbAlgorithm, KeySelection, RollbackStatus};
    use tempfile::{tempdir, TempDir};

    struct Harness {
        dir: TempDir,
        device: SimulatedDevice,
        ops: Operations<FakeRunner>,
    }

    impl Harness {
        fn new(initial: DeviceMode, adb_enabled: bool) -> Self {
            Self::with_config(initial, adb_enabled, |_| {})
        }

        fn with_config(
            initial: DeviceMode,
            adb_enabled: bool,
            tweak: impl FnOnce(&mut LtboxConfig),
        ) -> Self {
            Self::with_hook(initial, adb_enabled, tweak, |_| None)
        }

        /// Like `with_config`, with `hook` answering before the fakes
        fn with_hook<F>(
            initial: DeviceMode,
            adb_enabled: bool,
            tweak: impl FnOnce(&mut LtboxConfig),
            hook: F,
        ) -> Self
        where
            F: Fn(&Invocation) -> Option<Result<ToolOutput>> + Send + Sync + 'static,
        {
            let dir = tempdir().unwrap();
            let mut config = LtboxConfig::default().rooted_at(dir.path());
            config.timings = Timings::immediate();
            config.keys = KeySelection::empty();
            config.keys.insert(&test_key_sha1(), write_key(dir.path()));
            tweak(&mut config);

            std::fs::create_dir_all(&config.paths.image_dir).unwrap();
            std::fs::write(&config.paths.loader, b"ELF").unwrap();

            let device = SimulatedDevice::new(initial, dir.path().join("serial-by-id"));
            let sim = device.clone();
            let avbtool = FakeAvbtool::new();
            let runner = FakeRunner::new(move |inv| {
                hook(inv)
                    .or_else(|| avbtool.respond(inv))
                    .or_else(|| sim.respond(inv))
                    .unwrap_or_else(|| exit(127, "unknown tool"))
            });
            let env = test_env(runner, dir.path()).with_storage(config.storage);
            let ops = Operations::with_env(config, env, adb_enabled);
            Self { dir, device, ops }
        }

        fn paths(&self) -> &crate::config::PathSettings {
            &self.ops.config().paths
        }

        fn image_dir(&self) -> PathBuf {
            self.paths().image_dir.clone()
        }

        fn calls_to(&self, tool: &str) -> usize {
            self.ops.env().runner.calls_to(tool).len()
        }

        /// `<data>` with one `<program>` per `(label, lun, start, sectors)`
        fn write_descriptor(&self, name: &str, programs: &[(&str, u32, u64, u64)]) {
            let mut xml = String::from("<?xml version=\"1.0\" ?>\n<data>\n");
            for (label, lun, start, sectors) in programs {
                xml.push_str(&format!(
                    "  <program label=\"{}\" physical_partition_number=\"{}\" start_sector=\"{}\" \
                     num_partition_sectors=\"{}\" filename=\"{}.img\"/>\n",
                    label, lun, start, sectors, label
                ));
            }
            xml.push_str("</data>\n");
            std::fs::write(self.image_dir().join(name), xml).unwrap();
        }

        fn write_file(&self, path: &Path, data: &[u8]) {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // ─────────────────────────────────────────────────────────────
    // read_partitions
    // ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_read_partitions_dumps_and_skips() {
        let h = Harness::new(DeviceMode::System, true);
        h.write_descriptor("rawprogram0.xml", &[("persist", 0, 100, 2)]);
        h.write_descriptor("rawprogram4.xml", &[("devinfo", 4, 6, 1)]);
        h.device.add_partition(4, 6, vec![0xab; 4096]);

        let out = h.dir.path().join("backup");
        let report = h
            .ops
            .read_partitions(&labels(&["devinfo", "persist", "frp"]), &out)
            .await
            .unwrap();

        assert_eq!(report.read.len(), 2);
        assert_eq!(report.read[0].label, "devinfo");
        assert_eq!(report.read[1].num_sectors, 2);
        assert_eq!(std::fs::read(out.join("devinfo.img")).unwrap(), vec![0xab; 4096]);
        assert_eq!(std::fs::read(out.join("persist.img")).unwrap().len(), 2 * 4096);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].label, "frp");
        assert!(report.failed.is_empty());

        assert_eq!(h.calls_to("QSaharaServer"), 1);
        assert_eq!(h.device.mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_read_partitions_records_failed_read_and_continues() {
        let h = Harness::with_hook(DeviceMode::Edl, true, |_| {}, |inv| {
            (inv.tool_name() == "fh_loader" && inv.flag_value("--start_sector") == Some("6"))
                .then(|| exit(1, "ERROR: read failed"))
        });
        h.write_descriptor("rawprogram4.xml", &[("devinfo", 4, 6, 1), ("persist", 4, 100, 2)]);

        let out = h.dir.path().join("backup");
        let report = h
            .ops
            .read_partitions(&labels(&["devinfo", "persist"]), &out)
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].label, "devinfo");
        assert_eq!(report.read.len(), 1);
        assert!(out.join("persist.img").is_file());
    }

    #[tokio::test]
    async fn test_read_partitions_stops_on_unrecoverable_error() {
        let h = Harness::with_hook(DeviceMode::Edl, true, |_| {}, |inv| {
            (inv.tool_name() == "fh_loader" && inv.flag_value("--start_sector") == Some("6"))
                .then(|| Err(Error::tool_not_found("fh_loader")))
        });
        h.write_descriptor("rawprogram4.xml", &[("devinfo", 4, 6, 1), ("persist", 4, 100, 2)]);

        let out = h.dir.path().join("backup");
        let err = h
            .ops
            .read_partitions(&labels(&["devinfo", "persist"]), &out)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ToolNotFound { .. }));
        assert!(!out.join("persist.img").exists());
    }

    #[tokio::test]
    async fn test_read_partitions_without_descriptors_touches_nothing() {
        let h = Harness::new(DeviceMode::System, true);
        let report = h
            .ops
            .read_partitions(&labels(&DEFAULT_DUMP_TARGETS), &h.dir.path().join("backup"))
            .await
            .unwrap();

        assert!(report.read.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped[0].reason.contains("no partition descriptors"));
        assert!(h.ops.env().runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_read_partitions_stays_in_edl_without_reboot() {
        let h = Harness::with_config(DeviceMode::Edl, false, |c| c.behavior.reboot_after = false);
        h.write_descriptor("rawprogram4.xml", &[("devinfo", 4, 6, 1)]);

        let report = h
            .ops
            .read_partitions(&labels(&["devinfo"]), &h.dir.path().join("backup"))
            .await
            .unwrap();

        assert_eq!(report.read.len(), 1);
        assert_eq!(h.device.mode(), DeviceMode::Edl);
        assert!(h.ops.env().runner.calls_with("fh_loader", "--reset").is_empty());
    }

    #[tokio::test]
    async fn test_read_partitions_missing_loader_fails_early() {
        let h = Harness::new(DeviceMode::System, true);
        h.write_descriptor("rawprogram4.xml", &[("devinfo", 4, 6, 1)]);
        std::fs::remove_file(&h.paths().loader).unwrap();

        let err = h
            .ops
            .read_partitions(&labels(&["devinfo"]), &h.dir.path().join("backup"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingImage { .. }));
        assert_eq!(h.device.mode(), DeviceMode::System);
    }

    // ─────────────────────────────────────────────────────────────
    // write_partitions
    // ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_write_partitions_applies_active_slot() {
        let h = Harness::new(DeviceMode::System, true);
        h.write_descriptor(
            "rawprogram4.xml",
            &[
                ("boot_a", 4, 100, 16),
                ("boot_b", 4, 200, 16),
                ("vbmeta_system_a", 4, 300, 2),
                ("vbmeta_system_b", 4, 400, 2),
                ("devinfo", 4, 6, 1),
            ],
        );
        h.device.set_slot(SlotSuffix::B);

        let boot = h.dir.path().join("output_anti_rollback/boot.img");
        let vbmeta = h.dir.path().join("output_anti_rollback/vbmeta_system.img");
        let devinfo = h.dir.path().join("output_dp/devinfo.img");
        h.write_file(&boot, &[1u8; 8192]);
        h.write_file(&vbmeta, &[2u8; 4096]);
        h.write_file(&devinfo, &[3u8; 4096]);

        let images = BTreeMap::from([
            ("boot".to_string(), boot),
            ("vbmeta_system".to_string(), vbmeta),
            ("devinfo".to_string(), devinfo),
        ]);
        let written = h.ops.write_partitions(&images).await.unwrap();

        let names: Vec<&str> = written.iter().map(|w| w.label.as_str()).collect();
        assert_eq!(names, vec!["boot_b", "devinfo", "vbmeta_system_b"]);

        let device_writes: Vec<(u32, u64)> =
            h.device.written().iter().map(|(lun, start, _)| (*lun, *start)).collect();
        assert_eq!(device_writes, vec![(4, 200), (4, 6), (4, 400)]);
        assert_eq!(h.device.mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_write_partitions_missing_image_touches_nothing() {
        let h = Harness::new(DeviceMode::System, true);
        h.write_descriptor("rawprogram4.xml", &[("devinfo", 4, 6, 1)]);

        let images = BTreeMap::from([("devinfo".to_string(), h.dir.path().join("nope.img"))]);
        let err = h.ops.write_partitions(&images).await.unwrap_err();

        assert!(matches!(err, Error::MissingImage { .. }));
        assert!(h.ops.env().runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_write_partitions_unknown_label_before_edl() {
        let h = Harness::new(DeviceMode::System, true);
        h.write_descriptor("rawprogram4.xml", &[("devinfo", 4, 6, 1)]);
        let image = h.dir.path().join("frp.img");
        h.write_file(&image, &[0u8; 4096]);

        let images = BTreeMap::from([("frp".to_string(), image)]);
        let err = h.ops.write_partitions(&images).await.unwrap_err();

        assert!(matches!(err, Error::PartitionNotFound { .. }));
        assert_eq!(h.device.mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_write_partitions_emmc_alignment() {
        let h = Harness::with_config(DeviceMode::Edl, false, |c| c.storage = StorageType::Emmc);
        h.write_descriptor("rawprogram0.xml", &[("persist", 0, 80, 2)]);
        let image = h.dir.path().join("persist.img");
        h.write_file(&image, &[0u8; 1000]);

        let images = BTreeMap::from([("persist".to_string(), image)]);
        let err = h.ops.write_partitions(&images).await.unwrap_err();
        assert!(matches!(
            err,
            Error::UnalignedImage {
                len: 1000,
                sector_size: 512,
                ..
            }
        ));
        assert!(h.device.written().is_empty());
    }

    // ─────────────────────────────────────────────────────────────
    // detect_slot / disable_ota / write_fastboot
    // ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_detect_slot_without_adb_uses_bootloader() {
        let h = Harness::new(DeviceMode::Bootloader, false);
        let slot = h.ops.detect_slot().await.unwrap();

        assert_eq!(slot, Some(SlotSuffix::A));
        assert!(h.ops.env().runner.calls_to("adb").is_empty());
        assert_eq!(h.device.mode(), DeviceMode::Bootloader);
    }

    #[tokio::test]
    async fn test_disable_ota_confirmed() {
        let h = Harness::new(DeviceMode::System, true);
        assert!(h.ops.disable_ota().await.unwrap());
    }

    #[tokio::test]
    async fn test_disable_ota_requires_adb() {
        let h = Harness::new(DeviceMode::System, false);
        let err = h.ops.disable_ota().await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_write_fastboot_skips_missing_images() {
        let h = Harness::new(DeviceMode::System, true);
        let devinfo = h.paths().output_dp_dir.join("devinfo.img");
        h.write_file(&devinfo, b"patched devinfo");

        let images = BTreeMap::from([
            ("devinfo".to_string(), devinfo),
            ("persist".to_string(), h.paths().output_dp_dir.join("persist.img")),
        ]);
        let flashed = h.ops.write_fastboot(&images).await.unwrap();

        assert_eq!(flashed, vec!["devinfo".to_string()]);
        assert_eq!(
            h.device.flashed(),
            vec![("devinfo".to_string(), b"patched devinfo".to_vec())]
        );
        assert_eq!(h.device.mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_write_fastboot_nothing_present() {
        let h = Harness::new(DeviceMode::System, true);
        let images = BTreeMap::from([(
            "persist".to_string(),
            h.paths().output_dp_dir.join("persist.img"),
        )]);
        let err = h.ops.write_fastboot(&images).await.unwrap_err();

        assert!(matches!(err, Error::MissingImage { .. }));
        assert!(h.ops.env().runner.calls().is_empty());
    }

    // ─────────────────────────────────────────────────────────────
    // flash_all
    // ─────────────────────────────────────────────────────────────

    fn write_boot_descriptor(h: &Harness) {
        h.write_descriptor(
            "rawprogram4.xml",
            &[("boot_a", 4, 1000, 16), ("boot_b", 4, 2000, 16)],
        );
    }

    #[tokio::test]
    async fn test_dump_boot_backs_up_active_slot() {
        let h = Harness::new(DeviceMode::System, true);
        write_boot_descriptor(&h);
        h.device.set_slot(SlotSuffix::B);
        h.device.add_partition(4, 2000, vec![0x5a; 16 * 4096]);

        let dumped = h.ops.dump_boot().await.unwrap();

        assert_eq!(dumped.label, "boot_b");
        assert_eq!(dumped.start_sector, 2000);
        assert_eq!(dumped.path, h.paths().boot_backup_dir.join("boot.img"));
        assert_eq!(std::fs::read(&dumped.path).unwrap(), vec![0x5a; 16 * 4096]);
        assert_eq!(h.device.mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_flash_boot_writes_active_slot() {
        let h = Harness::new(DeviceMode::System, true);
        write_boot_descriptor(&h);
        h.device.set_slot(SlotSuffix::B);
        let patched = h.dir.path().join("output_root/boot.img");
        h.write_file(&patched, &[7u8; 8192]);

        let written = h.ops.flash_boot(&patched).await.unwrap();

        assert_eq!(written.label, "boot_b");
        assert_eq!(h.device.written(), vec![(4, 2000, vec![7u8; 8192])]);
        assert_eq!(h.device.mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_restore_boot_flashes_stock_backup() {
        let h = Harness::new(DeviceMode::System, true);
        write_boot_descriptor(&h);
        h.write_file(&h.paths().boot_backup_dir.join("boot.img"), &[1u8; 4096]);

        let written = h.ops.restore_boot().await.unwrap();

        assert_eq!(written.label, "boot_a");
        assert_eq!(h.device.written(), vec![(4, 1000, vec![1u8; 4096])]);
        assert_eq!(h.device.mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_restore_boot_without_backup_touches_nothing() {
        let h = Harness::new(DeviceMode::System, true);
        write_boot_descriptor(&h);

        let err = h.ops.restore_boot().await.unwrap_err();

        assert!(matches!(err, Error::MissingImage { .. }));
        assert!(h.ops.env().runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_restore_boot_without_descriptors_touches_nothing() {
        let h = Harness::new(DeviceMode::System, true);
        h.write_file(&h.paths().boot_backup_dir.join("boot.img"), &[1u8; 4096]);

        let err = h.ops.restore_boot().await.unwrap_err();

        assert!(matches!(
            err,
            Error::PartitionNotFound {
                reason: ltbox_core::NotFoundReason::NoDescriptors,
                ..
            }
        ));
        assert!(h.ops.env().runner.calls().is_empty());
    }

    fn write_flash_set(h: &Harness) {
        for name in [
            "rawprogram0.xml",
            "rawprogram1.xml",
            "rawprogram4.xml",
            "rawprogram4_write_devinfo.xml",
            "rawprogram_save_persist_unsparse0.xml",
            "rawprogram_write_persist_unsparse0.xml",
            "patch0.xml",
        ] {
            h.write_file(&h.image_dir().join(name), b"<data/>");
        }
    }

    #[tokio::test]
    async fn test_flash_all_uses_patched_persist_only() {
        let h = Harness::new(DeviceMode::Edl, true);
        write_flash_set(&h);
        h.write_file(&h.paths().output_dp_dir.join("persist.img"), &[9u8; 4096]);
        h.write_file(&h.paths().output_dir.join("vendor_boot.img"), b"converted");

        let loader = h.paths().loader.clone();
        let report = h.ops.flash_all(&h.image_dir(), &loader).await.unwrap();

        assert_eq!(report.copied_files, 2);
        assert_eq!(
            h.device.sent_xmls(),
            vec![
                "rawprogram1.xml",
                "rawprogram4.xml",
                "rawprogram_write_persist_unsparse0.xml",
                "patch0.xml"
            ]
        );
        assert_eq!(
            std::fs::read(h.image_dir().join("vendor_boot.img")).unwrap(),
            b"converted".to_vec()
        );
        assert!(!h.image_dir().join("persist.img").exists());
        assert_eq!(h.device.mode(), DeviceMode::System);
    }

    #[tokio::test]
    async fn test_flash_all_skip_dp_preserves_device_data() {
        let h = Harness::with_config(DeviceMode::Edl, true, |c| c.behavior.skip_dp = true);
        write_flash_set(&h);
        h.write_file(&h.paths().output_dp_dir.join("persist.img"), &[9u8; 4096]);
        h.write_file(&h.paths().output_dp_dir.join("devinfo.img"), &[8u8; 4096]);

        let loader = h.paths().loader.clone();
        let report = h.ops.flash_all(&h.image_dir(), &loader).await.unwrap();

        assert_eq!(report.copied_files, 0);
        let sent = h.device.sent_xmls();
        assert!(sent.contains(&"rawprogram4.xml".to_string()));
        assert!(sent.contains(&"rawprogram_save_persist_unsparse0.xml".to_string()));
        assert!(!sent.iter().any(|x| x.contains("_write_")));
        assert!(!h.image_dir().join("persist.img").exists());
    }

    #[tokio::test]
    async fn test_flash_all_requires_populated_image_dir() {
        let h = Harness::new(DeviceMode::Edl, true);
        let empty = h.dir.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();

        let loader = h.paths().loader.clone();
        let err = h.ops.flash_all(&empty, &loader).await.unwrap_err();
        assert!(matches!(err, Error::MissingImage { .. }));
        assert!(h.ops.env().runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_flash_all_raw_failure_stops_before_patches() {
        let h = Harness::new(DeviceMode::Edl, true);
        write_flash_set(&h);
        h.device.fail_sendxml("rawprogram4.xml");

        let loader = h.paths().loader.clone();
        let err = h.ops.flash_all(&h.image_dir(), &loader).await.unwrap_err();

        assert!(matches!(err, Error::Protocol { .. }));
        assert!(!h.device.sent_xmls().contains(&"patch0.xml".to_string()));
        assert_eq!(h.device.mode(), DeviceMode::Edl);
    }

    // ─────────────────────────────────────────────────────────────
    // Rollback
    // ─────────────────────────────────────────────────────────────

    fn write_boot(path: &Path, index: u64) {
        AvbImageBuilder::hash_image("boot", 64 * 1024)
            .rollback_index(index)
            .property("com.android.build.boot.os_version", "14")
            .write(path)
            .unwrap();
    }

    fn write_vbmeta_system(path: &Path, index: u64) {
        AvbImageBuilder::vbmeta()
            .rollback_index(index)
            .rollback_index_location(2)
            .algorithm(AvbAlgorithm::Sha256Rsa4096)
            .public_key(TEST_PUBLIC_KEY)
            .hash_descriptor("boot", &[0; 20])
            .write(path)
            .unwrap();
    }

    #[tokio::test]
    async fn test_compare_and_patch_rollback() {
        let h = Harness::new(DeviceMode::System, true);
        let backup = &h.paths().backup_dir;
        write_boot(&backup.join("boot.img"), 3);
        write_vbmeta_system(&backup.join("vbmeta_system.img"), 3);
        let new_boot = h.image_dir().join(ROLLBACK_BOOT_IMAGE);
        let new_vbmeta = h.image_dir().join(ROLLBACK_VBMETA_IMAGE);
        write_boot(&new_boot, 5);
        write_vbmeta_system(&new_vbmeta, 4);

        let comparison = h
            .ops
            .compare_rollback(&backup.join("boot.img"), &backup.join("vbmeta_system.img"));
        assert_eq!(comparison.status, RollbackStatus::NeedsPatch);
        assert_eq!(comparison.new_boot_index, Some(5));

        let output = h.paths().output_anti_rollback_dir.clone();
        let pair = h
            .ops
            .patch_rollback(&comparison, &new_boot, &new_vbmeta, &output)
            .await
            .unwrap();

        assert_eq!(pair.boot.rollback_index, 3);
        assert_eq!(pair.boot.property("com.android.build.boot.os_version"), Some("14"));
        assert_eq!(pair.vbmeta.rollback_index, 3);
        assert_eq!(pair.vbmeta.rollback_index_location, 2);
        assert!(output.join("boot.img").is_file());
        assert!(output.join("vbmeta_system.img").is_file());
        assert!(h.ops.env().runner.calls_to("adb").is_empty());
    }

    #[tokio::test]
    async fn test_compare_rollback_missing_new_rom() {
        let h = Harness::new(DeviceMode::System, true);
        let backup = &h.paths().backup_dir;
        write_boot(&backup.join("boot.img"), 2);
        write_vbmeta_system(&backup.join("vbmeta_system.img"), 2);

        let comparison = h
            .ops
            .compare_rollback(&backup.join("boot.img"), &backup.join("vbmeta_system.img"));
        assert_eq!(comparison.status, RollbackStatus::MissingNew);
        assert_eq!(comparison.current_boot_index, 2);
    }

    // ─────────────────────────────────────────────────────────────
    // Region
    // ─────────────────────────────────────────────────────────────

    const FINGERPRINT: &str = "Lenovo/TB320FC/TB320FC:14/UKQ1.231003.002/ZUI_16.0.336:user/release-keys";

    fn write_region_inputs(h: &Harness) -> (PathBuf, PathBuf) {
        let mut payload = vec![0u8; 4096];
        payload.extend_from_slice(b"ro.product.locale.region=TB320FC.ROW\0IROW\0");
        payload.resize(8192, 0);

        let vendor_boot = h.image_dir().join("vendor_boot.img");
        AvbImageBuilder::hash_image("vendor_boot", 64 * 1024)
            .payload(payload)
            .property(FINGERPRINT_PROPERTY, FINGERPRINT)
            .write(&vendor_boot)
            .unwrap();

        let vbmeta = h.image_dir().join("vbmeta.img");
        AvbImageBuilder::vbmeta()
            .algorithm(AvbAlgorithm::Sha256Rsa4096)
            .public_key(TEST_PUBLIC_KEY)
            .hash_descriptor("vendor_boot", &[0; 20])
            .hashtree_descriptor("system", &[7; 20])
            .write(&vbmeta)
            .unwrap();
        (vendor_boot, vbmeta)
    }

    #[tokio::test]
    async fn test_convert_region_rewrites_and_resigns() {
        let h = Harness::new(DeviceMode::System, true);
        let (vendor_boot, vbmeta) = write_region_inputs(&h);
        let output = h.paths().output_dir.clone();

        let result = h
            .ops
            .convert_region(&vendor_boot, &vbmeta, &output, Some("TB320FC"))
            .await
            .unwrap();

        assert_eq!(result.conversion, PrcConversion::Converted { replacements: 2 });
        let bytes = std::fs::read(output.join("vendor_boot.img")).unwrap();
        assert!(bytes.windows(4).any(|w| w == b".PRC"));
        assert!(!bytes.windows(4).any(|w| w == b".ROW"));

        let info = ltbox_image::avb::extract(&output.join("vendor_boot.img")).unwrap();
        assert_eq!(info.property(FINGERPRINT_PROPERTY), Some(FINGERPRINT));
        assert_eq!(result.vendor_boot.partition_name.as_deref(), Some("vendor_boot"));

        let vbmeta_out = ltbox_image::avb::extract(&output.join("vbmeta.img")).unwrap();
        assert!(vbmeta_out.references("vendor_boot"));
        assert!(vbmeta_out.references("system"));
        assert_eq!(result.vbmeta.algorithm, AvbAlgorithm::Sha256Rsa4096);

        // inputs untouched, scratch removed
        assert!(std::fs::read(&vendor_boot).unwrap().windows(4).any(|w| w == b".ROW"));
        assert_eq!(std::fs::read_dir(&h.paths().work_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_convert_region_model_mismatch() {
        let h = Harness::new(DeviceMode::System, true);
        let (vendor_boot, vbmeta) = write_region_inputs(&h);
        let output = h.paths().output_dir.clone();

        let err = h
            .ops
            .convert_region(&vendor_boot, &vbmeta, &output, Some("TB371FC"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ModelMismatch { .. }));
        assert!(!output.join("vendor_boot.img").exists());
        assert!(h.ops.env().runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_convert_region_unknown_vbmeta_key() {
        let h = Harness::with_config(DeviceMode::System, true, |c| c.keys = KeySelection::empty());
        let (vendor_boot, vbmeta) = write_region_inputs(&h);
        let output = h.paths().output_dir.clone();

        let err = h
            .ops
            .convert_region(&vendor_boot, &vbmeta, &output, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::KeyMismatch { .. }));
        assert!(!output.join("vbmeta.img").exists());
    }

    #[tokio::test]
    async fn test_patch_region_codes() {
        let h = Harness::new(DeviceMode::System, true);
        let devinfo = h.paths().backup_dir.join("devinfo.img");
        let persist = h.paths().backup_dir.join("persist.img");
        let mut data = vec![0xffu8; 64];
        data.extend(region_marker("CN"));
        h.write_file(&devinfo, &data);
        h.write_file(&persist, &[0u8; 128]);

        let output = h.paths().output_dp_dir.clone();
        let report = h
            .ops
            .patch_region_codes(&[devinfo.clone(), persist.clone()], "us", &output)
            .await
            .unwrap();

        assert_eq!(report.patches[0].detected.as_deref(), Some("CN"));
        assert_eq!(
            report.patches[0].outcome,
            Some(CodeReplacement::Replaced { count: 1 })
        );
        let patched = std::fs::read(output.join("devinfo.img")).unwrap();
        assert!(patched.windows(10).any(|w| w == region_marker("US").as_slice()));

        assert_eq!(report.patches[1].detected, None);
        assert!(!output.join("persist.img").exists());

        let backup_name = report.backup_dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(backup_name.starts_with("backup_critical_"));
        assert_eq!(std::fs::read(report.backup_dir.join("devinfo.img")).unwrap(), data);
        assert!(report.backup_dir.join("persist.img").is_file());
    }

    #[tokio::test]
    async fn test_patch_region_codes_copies_unchanged_image() {
        let h = Harness::new(DeviceMode::System, true);
        let devinfo = h.paths().backup_dir.join("devinfo.img");
        let mut data = vec![0xffu8; 64];
        data.extend(region_marker("CN"));
        h.write_file(&devinfo, &data);

        let output = h.paths().output_dp_dir.clone();
        let report = h
            .ops
            .patch_region_codes(&[devinfo], "CN", &output)
            .await
            .unwrap();

        assert_eq!(report.patches[0].outcome, Some(CodeReplacement::Unchanged));
        assert_eq!(report.patches[0].output, Some(output.join("devinfo.img")));
        assert_eq!(std::fs::read(output.join("devinfo.img")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_patch_region_codes_rejects_bad_replacement() {
        let h = Harness::new(DeviceMode::System, true);
        let devinfo = h.paths().backup_dir.join("devinfo.img");
        h.write_file(&devinfo, &region_marker("CN"));

        let output = h.paths().output_dp_dir.clone();
        let err = h
            .ops
            .patch_region_codes(&[devinfo], "USA", &output)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Region { .. }));
        assert!(!output.exists());
    }
}
