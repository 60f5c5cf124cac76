//! Region conversion transforms
//!
//! Every transform takes the input bytes and returns a new buffer plus a
//! report; nothing here touches the filesystem.

use serde::{Deserialize, Serialize};

use ltbox_core::prelude::*;

/// ROW marker and its PRC replacement in vendor_boot
pub const ROW_TO_PRC: [(&[u8], &[u8]); 2] = [(b".ROW", b".PRC"), (b"IROW", b"IPRC")];

/// Fingerprint property checked against the device model
pub const FINGERPRINT_PROPERTY: &str = "com.android.build.vendor_boot.fingerprint";

/// Output of a transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformed<R> {
    pub bytes: Vec<u8>,
    pub report: R,
}

impl<R> Transformed<R> {
    fn new(bytes: Vec<u8>, report: R) -> Self {
        Self { bytes, report }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrcConversion {
    Converted { replacements: usize },
    AlreadyPrc,
    NoPatterns,
}

impl PrcConversion {
    pub fn changed(self) -> bool {
        matches!(self, PrcConversion::Converted { .. })
    }
}

/// Replace the ROW markers with PRC ones
pub fn convert_row_to_prc(input: &[u8]) -> Transformed<PrcConversion> {
    let mut bytes = input.to_vec();
    let mut replacements = 0;
    for (row, prc) in ROW_TO_PRC {
        let (next, count) = replace_all(&bytes, row, prc);
        bytes = next;
        replacements += count;
    }

    let report = if replacements > 0 {
        PrcConversion::Converted { replacements }
    } else if ROW_TO_PRC.iter().any(|(_, prc)| find(input, prc, 0).is_some()) {
        PrcConversion::AlreadyPrc
    } else {
        PrcConversion::NoPatterns
    };
    Transformed::new(bytes, report)
}

/// A country code and its display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryCode {
    pub code: String,
    pub name: String,
}

impl CountryCode {
    pub fn new(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
        }
    }
}

const DEFAULT_COUNTRIES: &[(&str, &str)] = &[
    ("AE", "United Arab Emirates"),
    ("AR", "Argentina"),
    ("AT", "Austria"),
    ("AU", "Australia"),
    ("BE", "Belgium"),
    ("BR", "Brazil"),
    ("CA", "Canada"),
    ("CH", "Switzerland"),
    ("CL", "Chile"),
    ("CN", "China"),
    ("CO", "Colombia"),
    ("CZ", "Czech Republic"),
    ("DE", "Germany"),
    ("DK", "Denmark"),
    ("ES", "Spain"),
    ("FI", "Finland"),
    ("FR", "France"),
    ("GB", "United Kingdom"),
    ("GR", "Greece"),
    ("HK", "Hong Kong"),
    ("HU", "Hungary"),
    ("ID", "Indonesia"),
    ("IE", "Ireland"),
    ("IL", "Israel"),
    ("IN", "India"),
    ("IT", "Italy"),
    ("JP", "Japan"),
    ("KR", "South Korea"),
    ("MX", "Mexico"),
    ("MY", "Malaysia"),
    ("NL", "Netherlands"),
    ("NO", "Norway"),
    ("NZ", "New Zealand"),
    ("PE", "Peru"),
    ("PH", "Philippines"),
    ("PL", "Poland"),
    ("PT", "Portugal"),
    ("RO", "Romania"),
    ("RU", "Russia"),
    ("SA", "Saudi Arabia"),
    ("SE", "Sweden"),
    ("SG", "Singapore"),
    ("TH", "Thailand"),
    ("TR", "Turkey"),
    ("TW", "Taiwan"),
    ("UA", "Ukraine"),
    ("US", "United States"),
    ("VN", "Vietnam"),
    ("ZA", "South Africa"),
];

pub fn default_country_codes() -> Vec<CountryCode> {
    DEFAULT_COUNTRIES
        .iter()
        .map(|(code, name)| CountryCode::new(code, name))
        .collect()
}

/// `\0\0\0{CC}XX\0\0\0`, the marker devinfo and persist carry
pub fn region_marker(code: &str) -> Vec<u8> {
    let mut marker = b"\x00\x00\x00".to_vec();
    marker.extend_from_slice(code.to_ascii_uppercase().as_bytes());
    marker.extend_from_slice(b"XX\x00\x00\x00");
    marker
}

/// First code in `codes` whose marker appears in `input`
pub fn detect_region_code<'a>(input: &[u8], codes: &'a [CountryCode]) -> Option<&'a CountryCode> {
    codes
        .iter()
        .find(|c| find(input, &region_marker(&c.code), 0).is_some())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeReplacement {
    Replaced { count: usize },
    /// Current and replacement codes are the same
    Unchanged,
    NotFound,
}

impl CodeReplacement {
    pub fn changed(self) -> bool {
        matches!(self, CodeReplacement::Replaced { .. })
    }
}

/// Check that `code` is two ASCII letters or digits
///
/// `00` is accepted as a replacement; the device then asks for the country
/// after boot.
pub fn validate_code(code: &str) -> Result<String> {
    if code.len() == 2 && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(code.to_ascii_uppercase())
    } else {
        Err(Error::region(format!(
            "country code '{}' must be two characters",
            code
        )))
    }
}

/// Swap the `current` region marker for `replacement`
pub fn replace_region_code(
    input: &[u8],
    current: &str,
    replacement: &str,
) -> Result<Transformed<CodeReplacement>> {
    let current = validate_code(current)?;
    let replacement = validate_code(replacement)?;
    if current == replacement {
        return Ok(Transformed::new(input.to_vec(), CodeReplacement::Unchanged));
    }

    let (bytes, count) = replace_all(input, &region_marker(&current), &region_marker(&replacement));
    let report = if count > 0 {
        CodeReplacement::Replaced { count }
    } else {
        CodeReplacement::NotFound
    };
    Ok(Transformed::new(bytes, report))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Non-overlapping left-to-right replacement
fn replace_all(input: &[u8], from: &[u8], to: &[u8]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(input.len());
    let mut count = 0;
    let mut pos = 0;
    while let Some(idx) = find(input, from, pos) {
        out.extend_from_slice(&input[pos..idx]);
        out.extend_from_slice(to);
        pos = idx + from.len();
        count += 1;
    }
    out.extend_from_slice(&input[pos..]);
    (out, count)
}
