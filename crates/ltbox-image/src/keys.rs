//! Signing-key selection by public-key digest

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ltbox_core::prelude::*;

/// SHA1 of the AOSP `testkey_rsa4096` public key
pub const TESTKEY_RSA4096_SHA1: &str = "2597c218aae470a130f61162feaae70afd97f011";
/// SHA1 of the AOSP `testkey_rsa2048` public key
pub const TESTKEY_RSA2048_SHA1: &str = "cdbb77177f731920bbe0a0f94f84d9038ae0617d";

/// Public-key SHA1 (hex) to private signing key file
///
/// Serializes as a plain table:
///
/// ```toml
/// [keys]
/// 2597c218aae470a130f61162feaae70afd97f011 = "key/testkey_rsa4096.pem"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySelection {
    keys: BTreeMap<String, PathBuf>,
}

impl Default for KeySelection {
    fn default() -> Self {
        Self::standard(Path::new("key"))
    }
}

impl KeySelection {
    pub fn empty() -> Self {
        Self {
            keys: BTreeMap::new(),
        }
    }

    /// The AOSP test keys under `key_dir`
    pub fn standard(key_dir: &Path) -> Self {
        let mut selection = Self::empty();
        selection.insert(TESTKEY_RSA4096_SHA1, key_dir.join("testkey_rsa4096.pem"));
        selection.insert(TESTKEY_RSA2048_SHA1, key_dir.join("testkey_rsa2048.pem"));
        selection
    }

    pub fn insert(&mut self, digest: &str, key: impl Into<PathBuf>) {
        self.keys.insert(digest.trim().to_ascii_lowercase(), key.into());
    }

    /// Key for `digest`; no digest or an unknown one is [`Error::KeyMismatch`]
    pub fn key_for(&self, digest: Option<&str>) -> Result<&Path> {
        let found = digest.and_then(|digest| {
            let digest = digest.trim();
            self.keys
                .iter()
                .find(|(known, _)| known.eq_ignore_ascii_case(digest))
                .map(|(_, path)| path.as_path())
        });
        found.ok_or_else(|| Error::KeyMismatch {
            digest: digest.map(str::to_string),
        })
    }

    /// Anchor relative key paths at `base`
    pub fn resolve_relative(mut self, base: &Path) -> Self {
        for path in self.keys.values_mut() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.keys.iter().map(|(d, p)| (d.as_str(), p.as_path()))
    }
}
