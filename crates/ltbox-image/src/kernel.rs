//! Kernel version probe

use std::path::Path;
use std::sync::LazyLock;

use regex::bytes::Regex;

use ltbox_core::prelude::*;

static KERNEL_VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Linux version ((?-u:\S)+)").expect("Invalid kernel version regex")
});

/// Version string following `Linux version ` in a kernel image
pub fn kernel_version(image: &[u8]) -> Option<String> {
    KERNEL_VERSION_REGEX
        .captures(image)
        .and_then(|c| c.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
}

pub fn kernel_version_of(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Err(Error::missing_image(path));
    }
    let bytes = std::fs::read(path).map_err(|e| Error::file(path, e))?;
    Ok(kernel_version(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_found() {
        let image = b"\x00\x01Linux version 5.15.123-android14-11-gabcdef (build@host) #1 SMP\x00";
        assert_eq!(
            kernel_version(image).as_deref(),
            Some("5.15.123-android14-11-gabcdef")
        );
    }

    #[test]
    fn test_kernel_version_absent() {
        assert_eq!(kernel_version(b"no banner"), None);
    }

    #[test]
    fn test_kernel_version_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = kernel_version_of(&dir.path().join("kernel")).unwrap_err();
        assert!(matches!(err, Error::MissingImage { .. }));
    }
}
