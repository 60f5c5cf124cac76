//! Rebuilding AVB metadata through `avbtool`
//!
//! Parsing is native ([`super::format`]); anything that has to sign or
//! recompute digests is delegated to `avbtool.py`, fed with every field read
//! from the source image so nothing device-specific is dropped.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ltbox_core::prelude::*;
use ltbox_device::{Invocation, ToolRunner};

use super::format::{self, AvbImageInfo};
use crate::keys::KeySelection;

/// Where to find `avbtool`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvbToolConfig {
    /// Interpreter used to run the script
    pub python: PathBuf,
    pub script: PathBuf,
    /// `--padding_size` for rebuilt vbmeta images
    pub vbmeta_padding_size: u64,
}

impl Default for AvbToolConfig {
    fn default() -> Self {
        let python = if cfg!(windows) { "python" } else { "python3" };
        Self {
            python: PathBuf::from(python),
            script: PathBuf::from("avbtool.py"),
            vbmeta_padding_size: 8192,
        }
    }
}

/// Changes applied on top of the fields copied from the source image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FooterOverrides {
    pub rollback_index: Option<u64>,
    /// Replaces a property with the same key in place, otherwise appended
    pub properties: Vec<(String, String)>,
}

impl FooterOverrides {
    pub fn rollback_index(index: u64) -> Self {
        Self {
            rollback_index: Some(index),
            ..Default::default()
        }
    }

    /// `base` with these overrides applied, keeping the original order
    pub fn merge_properties(&self, base: &[(String, String)]) -> Vec<(String, String)> {
        let mut merged = base.to_vec();
        for (key, value) in &self.properties {
            match merged.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.clone(),
                None => merged.push((key.clone(), value.clone())),
            }
        }
        merged
    }
}

/// Extracts and regenerates verified-boot metadata
pub struct AvbCodec<'a, R> {
    runner: &'a R,
    tool: &'a AvbToolConfig,
    keys: &'a KeySelection,
}

impl<'a, R: ToolRunner> AvbCodec<'a, R> {
    pub fn new(runner: &'a R, tool: &'a AvbToolConfig, keys: &'a KeySelection) -> Self {
        Self { runner, tool, keys }
    }

    pub fn extract(&self, image: &Path) -> Result<AvbImageInfo> {
        format::extract(image)
    }

    /// Write `source` to `output` with a regenerated hash footer
    ///
    /// Partition size, name, salt, flags and every property come from
    /// `info`; `overrides` are applied on top.
    pub async fn rebuild_hash_footer(
        &self,
        source: &Path,
        output: &Path,
        info: &AvbImageInfo,
        overrides: &FooterOverrides,
    ) -> Result<AvbImageInfo> {
        let partition_name = info
            .partition_name
            .as_deref()
            .ok_or_else(|| Error::avb_field_missing("partition name", &info.path))?;
        let salt = info
            .salt_hex()
            .ok_or_else(|| Error::avb_field_missing("salt", &info.path))?;
        if info.footer.is_none() {
            return Err(Error::avb_field_missing("footer", &info.path));
        }
        let signing_key = if info.algorithm.is_signed() {
            Some(self.signing_key(info)?)
        } else {
            None
        };

        if source != output {
            create_parent(output).await?;
            tokio::fs::copy(source, output)
                .await
                .map_err(|e| Error::file(source, e))?;
        }

        let rollback_index = overrides.rollback_index.unwrap_or(info.rollback_index);
        let mut args = vec![
            "add_hash_footer".to_string(),
            "--image".to_string(),
            output.display().to_string(),
            "--partition_size".to_string(),
            info.partition_size.to_string(),
            "--partition_name".to_string(),
            partition_name.to_string(),
            "--rollback_index".to_string(),
            rollback_index.to_string(),
            "--salt".to_string(),
            salt,
        ];
        for (key, value) in overrides.merge_properties(&info.properties) {
            args.push("--prop".to_string());
            args.push(format!("{}:{}", key, value));
        }
        args.push("--flags".to_string());
        args.push(info.flags.to_string());
        if info.rollback_index_location != 0 {
            args.push("--rollback_index_location".to_string());
            args.push(info.rollback_index_location.to_string());
        }
        if let Some(key) = signing_key {
            args.push("--algorithm".to_string());
            args.push(info.algorithm.name().to_string());
            args.push("--key".to_string());
            args.push(key.display().to_string());
        }

        info!(
            "Rebuilding hash footer of {} ({}, rollback index {})",
            output.display(),
            partition_name,
            rollback_index
        );
        self.avbtool(args).await?;
        format::extract(output)
    }

    /// Write a freshly signed vbmeta image to `output`
    ///
    /// Descriptors come from every image in `chained`, in order; avbtool lets
    /// later images override descriptors of the same partition.
    pub async fn rebuild_vbmeta_image(
        &self,
        output: &Path,
        info: &AvbImageInfo,
        chained: &[PathBuf],
        overrides: &FooterOverrides,
    ) -> Result<AvbImageInfo> {
        if let Some(missing) = chained.iter().find(|p| !p.is_file()) {
            return Err(Error::missing_image(missing));
        }
        let key = self.signing_key(info)?;
        create_parent(output).await?;

        let rollback_index = overrides.rollback_index.unwrap_or(info.rollback_index);
        let mut args = vec![
            "make_vbmeta_image".to_string(),
            "--output".to_string(),
            output.display().to_string(),
            "--key".to_string(),
            key.display().to_string(),
            "--algorithm".to_string(),
            info.algorithm.name().to_string(),
            "--padding_size".to_string(),
            self.tool.vbmeta_padding_size.to_string(),
            "--flags".to_string(),
            info.flags.to_string(),
            "--rollback_index".to_string(),
            rollback_index.to_string(),
        ];
        if info.rollback_index_location != 0 {
            args.push("--rollback_index_location".to_string());
            args.push(info.rollback_index_location.to_string());
        }
        for (key, value) in &overrides.properties {
            args.push("--prop".to_string());
            args.push(format!("{}:{}", key, value));
        }
        for image in chained {
            args.push("--include_descriptors_from_image".to_string());
            args.push(image.display().to_string());
        }

        info!(
            "Rebuilding {} from {} image(s), rollback index {}",
            output.display(),
            chained.len(),
            rollback_index
        );
        self.avbtool(args).await?;
        format::extract(output)
    }

    fn signing_key(&self, info: &AvbImageInfo) -> Result<PathBuf> {
        let key = self.keys.key_for(info.pubkey_sha1.as_deref())?;
        if !key.is_file() {
            return Err(Error::config(format!(
                "signing key {} for {} does not exist",
                key.display(),
                info.pubkey_sha1.as_deref().unwrap_or("?")
            )));
        }
        debug!("Signing {} with {}", info.path.display(), key.display());
        Ok(key.to_path_buf())
    }

    async fn avbtool(&self, args: Vec<String>) -> Result<()> {
        let invocation = Invocation::new(&self.tool.python)
            .arg(self.tool.script.display().to_string())
            .args(args);
        debug!("{}", invocation.command_line());
        self.runner.run(&invocation).await?.into_checked("avbtool")?;
        Ok(())
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::file(parent, e))?;
    }
    Ok(())
}
