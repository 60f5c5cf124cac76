//! Firehose partition I/O through `QSaharaServer` and `fh_loader`
//!
//! The wire protocol is spoken by the external executables. This module only
//! builds their command lines, enforces the programmer rules and honours the
//! settle delays the hardware needs between commands.

use std::path::{Path, PathBuf};

use ltbox_core::prelude::*;

use crate::edl::EdlLink;
use crate::env::DeviceEnv;
use crate::process::{Invocation, ToolOutput, ToolRunner};
use crate::timings::settle;

/// Sahara image id under which the programmer is uploaded
const PROGRAMMER_IMAGE_ID: u32 = 13;

/// Sector-level access to a device in EDL mode
///
/// Holds no state of its own; the loaded-programmer flag lives on the
/// [`EdlLink`], so the rules follow the session rather than the channel.
pub struct FirehoseChannel<'a, R> {
    env: &'a DeviceEnv<R>,
}

impl<'a, R: ToolRunner> FirehoseChannel<'a, R> {
    pub fn new(env: &'a DeviceEnv<R>) -> Self {
        Self { env }
    }

    /// Upload the programmer (exactly once per EDL session)
    pub async fn load_programmer(&self, link: &mut EdlLink, programmer: &Path) -> Result<()> {
        if link.programmer_loaded() {
            return Err(Error::protocol(format!(
                "programmer already loaded on {}",
                link.port()
            )));
        }
        if !programmer.is_file() {
            return Err(Error::missing_image(programmer));
        }

        info!("Uploading programmer {} to {}", programmer.display(), link.port());
        let inv = Invocation::new(&self.env.tools.sahara_server)
            .arg("-p")
            .arg(link.port().loader_arg())
            .arg("-s")
            .arg(format!("{}:{}", PROGRAMMER_IMAGE_ID, programmer.display()));
        let out = self.env.run(inv).await?;
        check_protocol("QSaharaServer", &out)?;

        link.set_programmer_loaded(true);
        settle(self.env.timings.programmer_settle()).await;
        Ok(())
    }

    /// Read `num_sectors` sectors at `start_sector` of `lun` into `output`
    pub async fn read_partition(
        &self,
        link: &EdlLink,
        lun: u32,
        start_sector: u64,
        num_sectors: u64,
        output: &Path,
    ) -> Result<()> {
        require_programmer(link)?;

        let work_dir = parent_dir(output);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| Error::file(&work_dir, e))?;

        info!(
            "Reading LUN {} sectors {}+{} into {}",
            lun,
            start_sector,
            num_sectors,
            output.display()
        );
        let inv = self
            .loader(link)
            .arg("--convertprogram2read")
            .arg(format!("--sendimage={}", output.display()))
            .arg(format!("--lun={}", lun))
            .arg(format!("--start_sector={}", start_sector))
            .arg(format!("--num_sectors={}", num_sectors))
            .args(self.common_flags())
            .current_dir(&work_dir);
        let out = self.env.run(inv).await?;
        check_protocol("fh_loader", &out)?;

        if !output.is_file() {
            return Err(Error::protocol(format!(
                "fh_loader reported success but {} was not produced",
                output.display()
            )));
        }

        settle(self.env.timings.read_settle()).await;
        Ok(())
    }

    /// Write `image` to `lun` starting at `start_sector`
    ///
    /// The image length must be a whole number of storage sectors; otherwise
    /// the loader is never invoked.
    pub async fn write_partition(
        &self,
        link: &EdlLink,
        lun: u32,
        start_sector: u64,
        image: &Path,
    ) -> Result<()> {
        require_programmer(link)?;

        let len = match tokio::fs::metadata(image).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(Error::missing_image(image)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::missing_image(image))
            }
            Err(e) => return Err(Error::file(image, e)),
        };
        let sector_size = self.env.storage.sector_size();
        if len % sector_size != 0 {
            return Err(Error::UnalignedImage {
                path: image.to_path_buf(),
                len,
                sector_size,
            });
        }

        info!(
            "Writing {} to LUN {} @ sector {}",
            image.display(),
            lun,
            start_sector
        );
        let inv = self
            .loader(link)
            .arg(format!("--sendimage={}", image.display()))
            .arg(format!("--lun={}", lun))
            .arg(format!("--start_sector={}", start_sector))
            .args(self.common_flags())
            .current_dir(parent_dir(image));
        let out = self.env.run(inv).await?;
        check_protocol("fh_loader", &out)
    }

    /// Reset the device toward system boot
    ///
    /// Fire-and-forget: failures are logged, never raised. The programmer is
    /// considered unloaded afterwards.
    pub async fn reset(&self, link: &mut EdlLink) {
        info!("Resetting device on {}", link.port());
        let inv = self
            .loader(link)
            .arg("--reset")
            .args(self.common_flags());
        match self.env.run(inv).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!("fh_loader reset exited with {:?}: {}", out.code, out.stderr.trim()),
            Err(e) => warn!("fh_loader reset could not run: {}", e),
        }

        link.set_programmer_loaded(false);
        settle(self.env.timings.reset_settle()).await;
    }

    /// Full flash from raw-program descriptors, then patch descriptors
    ///
    /// Raw descriptors run in order and the first failure stops the flash.
    /// Patch descriptors only run once every raw descriptor succeeded.
    pub async fn raw_program(
        &self,
        link: &mut EdlLink,
        programmer: &Path,
        raw_xmls: &[PathBuf],
        patch_xmls: &[PathBuf],
    ) -> Result<()> {
        self.load_programmer(link, programmer).await?;

        for xml in raw_xmls {
            self.send_xml(link, xml).await?;
        }
        info!("All {} raw program descriptors flashed", raw_xmls.len());

        for xml in patch_xmls {
            self.send_xml(link, xml).await?;
        }
        info!("All {} patch descriptors applied", patch_xmls.len());
        Ok(())
    }

    async fn send_xml(&self, link: &EdlLink, xml: &Path) -> Result<()> {
        let dir = parent_dir(xml);
        let name = xml
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::descriptor(xml, "descriptor path has no file name"))?;

        info!("Sending {}", name);
        let inv = self
            .loader(link)
            .arg(format!("--search_path={}", dir.display()))
            .arg(format!("--sendxml={}", name))
            .args(self.common_flags())
            .current_dir(&dir);
        let out = self.env.run(inv).await?;
        check_protocol("fh_loader", &out).map_err(|e| {
            error!("Flashing {} failed: {}", name, e);
            e
        })
    }

    fn loader(&self, link: &EdlLink) -> Invocation {
        Invocation::new(&self.env.tools.fh_loader).arg(format!("--port={}", link.port().loader_arg()))
    }

    fn common_flags(&self) -> [String; 3] {
        [
            "--zlpawarehost=1".to_string(),
            "--noprompt".to_string(),
            format!("--memoryname={}", self.env.storage.memory_name()),
        ]
    }
}

fn require_programmer(link: &EdlLink) -> Result<()> {
    if link.programmer_loaded() {
        Ok(())
    } else {
        Err(Error::protocol(format!(
            "no programmer loaded on {}",
            link.port()
        )))
    }
}

fn check_protocol(tool: &str, out: &ToolOutput) -> Result<()> {
    if out.success() {
        Ok(())
    } else {
        Err(Error::protocol(format!(
            "{} exited with {:?}: {}",
            tool,
            out.code,
            out.stderr.trim()
        )))
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
