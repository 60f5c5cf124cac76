//! Native parsing of Android Verified Boot metadata
//!
//! Layout (all integers big-endian):
//! - footer: the last 64 bytes of a partition image, magic `AVBf`
//! - vbmeta header: 256 bytes, magic `AVB0`, followed by the authentication
//!   block and the auxiliary block (descriptors and public key)
//!
//! Images without a footer are standalone vbmeta images with the header at
//! offset 0.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use ltbox_core::prelude::*;

pub const FOOTER_SIZE: u64 = 64;
pub const HEADER_SIZE: usize = 256;
pub const FOOTER_MAGIC: &[u8; 4] = b"AVBf";
pub const HEADER_MAGIC: &[u8; 4] = b"AVB0";

pub const TAG_PROPERTY: u64 = 0;
pub const TAG_HASHTREE: u64 = 1;
pub const TAG_HASH: u64 = 2;
pub const TAG_KERNEL_CMDLINE: u64 = 3;
pub const TAG_CHAIN_PARTITION: u64 = 4;

/// Fixed-size part of each descriptor body, after the 16-byte tag header
pub const HASH_FIXED_SIZE: usize = 116;
pub const HASHTREE_FIXED_SIZE: usize = 164;
pub const CHAIN_FIXED_SIZE: usize = 76;
pub const CMDLINE_FIXED_SIZE: usize = 8;
pub const PROPERTY_FIXED_SIZE: usize = 16;

/// Signing algorithm recorded in the vbmeta header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvbAlgorithm {
    None,
    Sha256Rsa2048,
    Sha256Rsa4096,
    Sha256Rsa8192,
    Sha512Rsa2048,
    Sha512Rsa4096,
    Sha512Rsa8192,
}

impl AvbAlgorithm {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Sha256Rsa2048,
            2 => Self::Sha256Rsa4096,
            3 => Self::Sha256Rsa8192,
            4 => Self::Sha512Rsa2048,
            5 => Self::Sha512Rsa4096,
            6 => Self::Sha512Rsa8192,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Sha256Rsa2048 => 1,
            Self::Sha256Rsa4096 => 2,
            Self::Sha256Rsa8192 => 3,
            Self::Sha512Rsa2048 => 4,
            Self::Sha512Rsa4096 => 5,
            Self::Sha512Rsa8192 => 6,
        }
    }

    /// Name as accepted by `avbtool --algorithm`
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Sha256Rsa2048 => "SHA256_RSA2048",
            Self::Sha256Rsa4096 => "SHA256_RSA4096",
            Self::Sha256Rsa8192 => "SHA256_RSA8192",
            Self::Sha512Rsa2048 => "SHA512_RSA2048",
            Self::Sha512Rsa4096 => "SHA512_RSA4096",
            Self::Sha512Rsa8192 => "SHA512_RSA8192",
        }
    }

    pub fn is_signed(self) -> bool {
        self != Self::None
    }
}

impl fmt::Display for AvbAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Trailing footer of a partition image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvbFooter {
    pub version_major: u32,
    pub version_minor: u32,
    pub original_image_size: u64,
    pub vbmeta_offset: u64,
    pub vbmeta_size: u64,
}

/// Fields of the vbmeta header this tool reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbmetaHeader {
    pub required_libavb_major: u32,
    pub required_libavb_minor: u32,
    pub authentication_block_size: u64,
    pub auxiliary_block_size: u64,
    pub algorithm: AvbAlgorithm,
    pub public_key_offset: u64,
    pub public_key_size: u64,
    pub descriptors_offset: u64,
    pub descriptors_size: u64,
    pub rollback_index: u64,
    pub flags: u32,
    pub rollback_index_location: u32,
    pub release_string: String,
}

/// One descriptor of the auxiliary block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Property {
        key: String,
        value: String,
    },
    Hashtree {
        image_size: u64,
        hash_algorithm: String,
        partition_name: String,
        salt: Vec<u8>,
        root_digest: Vec<u8>,
        flags: u32,
    },
    Hash {
        image_size: u64,
        hash_algorithm: String,
        partition_name: String,
        salt: Vec<u8>,
        digest: Vec<u8>,
        flags: u32,
    },
    KernelCmdline {
        flags: u32,
        cmdline: String,
    },
    ChainPartition {
        rollback_index_location: u32,
        partition_name: String,
        public_key: Vec<u8>,
        flags: u32,
    },
    Unknown {
        tag: u64,
    },
}

impl Descriptor {
    /// Partition a hash, hashtree or chain descriptor refers to
    pub fn partition_name(&self) -> Option<&str> {
        match self {
            Descriptor::Hash { partition_name, .. }
            | Descriptor::Hashtree { partition_name, .. }
            | Descriptor::ChainPartition { partition_name, .. } => Some(partition_name),
            _ => None,
        }
    }

    /// SHA1 of a chain descriptor's public key, lowercase hex
    pub fn public_key_sha1(&self) -> Option<String> {
        match self {
            Descriptor::ChainPartition { public_key, .. } => {
                Some(hex::encode(Sha1::digest(public_key)))
            }
            _ => None,
        }
    }
}

/// Verified-boot metadata extracted from one image file
///
/// Never mutated in place; rebuilding an image yields a fresh value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvbImageInfo {
    pub path: PathBuf,
    pub footer: Option<AvbFooter>,
    pub partition_size: u64,
    /// From the first hash (or hashtree) descriptor
    pub partition_name: Option<String>,
    pub salt: Option<Vec<u8>>,
    pub rollback_index: u64,
    pub rollback_index_location: u32,
    pub flags: u32,
    pub algorithm: AvbAlgorithm,
    /// Property descriptors in image order
    pub properties: Vec<(String, String)>,
    /// SHA1 of the embedded public key, lowercase hex
    pub pubkey_sha1: Option<String>,
    pub descriptors: Vec<Descriptor>,
}

impl AvbImageInfo {
    pub fn original_image_size(&self) -> Option<u64> {
        self.footer.map(|f| f.original_image_size)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Partitions covered by hash descriptors, in descriptor order
    pub fn hash_partitions(&self) -> Vec<&str> {
        self.descriptors
            .iter()
            .filter_map(|d| match d {
                Descriptor::Hash { partition_name, .. } => Some(partition_name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether any descriptor names `partition`
    pub fn references(&self, partition: &str) -> bool {
        self.descriptors
            .iter()
            .any(|d| d.partition_name() == Some(partition))
    }

    pub fn salt_hex(&self) -> Option<String> {
        self.salt.as_ref().map(hex::encode)
    }
}

/// Read footer, header and descriptors of `path`
pub fn extract(path: &Path) -> Result<AvbImageInfo> {
    if !path.is_file() {
        return Err(Error::missing_image(path));
    }
    let mut file = File::open(path).map_err(|e| Error::file(path, e))?;
    let file_len = file.metadata().map_err(|e| Error::file(path, e))?.len();

    let footer = read_footer(&mut file, file_len, path)?;
    let (vbmeta_offset, vbmeta_limit) = match footer {
        Some(footer) => (footer.vbmeta_offset, Some(footer.vbmeta_size)),
        None => (0, None),
    };

    if vbmeta_offset
        .checked_add(HEADER_SIZE as u64)
        .map_or(true, |end| end > file_len)
    {
        return Err(Error::avb_field_missing("vbmeta header", path));
    }
    let mut raw_header = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(vbmeta_offset))
        .and_then(|_| file.read_exact(&mut raw_header))
        .map_err(|e| Error::file(path, e))?;
    let header = parse_header(&raw_header, path)?;

    let aux_len = header.auxiliary_block_size;
    let overflow = || Error::avb_format(path, "vbmeta block sizes overflow");
    let header_end = vbmeta_offset + HEADER_SIZE as u64;
    let aux_offset = header_end
        .checked_add(header.authentication_block_size)
        .ok_or_else(overflow)?;
    let aux_end = aux_offset.checked_add(aux_len).ok_or_else(overflow)?;
    let blob_len = aux_end - vbmeta_offset;
    if vbmeta_limit.is_some_and(|limit| blob_len > limit) || aux_end > file_len {
        return Err(Error::avb_format(
            path,
            format!("vbmeta blocks ({} bytes) exceed the image", blob_len),
        ));
    }

    let aux_len = usize::try_from(aux_len)
        .map_err(|_| Error::avb_format(path, "auxiliary block too large"))?;
    let mut aux = vec![0u8; aux_len];
    file.seek(SeekFrom::Start(aux_offset))
        .and_then(|_| file.read_exact(&mut aux))
        .map_err(|e| Error::file(path, e))?;

    let aux_fields = Fields::new(&aux, path);
    let descriptors = parse_descriptors(
        aux_fields.bytes(header.descriptors_offset, header.descriptors_size)?,
        path,
    )?;
    let pubkey_sha1 = if header.public_key_size > 0 {
        let key = aux_fields.bytes(header.public_key_offset, header.public_key_size)?;
        Some(hex::encode(Sha1::digest(key)))
    } else {
        None
    };

    let (partition_name, salt) = primary_partition(&descriptors);
    let properties = descriptors
        .iter()
        .filter_map(|d| match d {
            Descriptor::Property { key, value } => Some((key.clone(), value.clone())),
            _ => None,
        })
        .collect();

    Ok(AvbImageInfo {
        path: path.to_path_buf(),
        footer,
        partition_size: file_len,
        partition_name,
        salt,
        rollback_index: header.rollback_index,
        rollback_index_location: header.rollback_index_location,
        flags: header.flags,
        algorithm: header.algorithm,
        properties,
        pubkey_sha1,
        descriptors,
    })
}

fn read_footer(file: &mut File, file_len: u64, path: &Path) -> Result<Option<AvbFooter>> {
    if file_len < FOOTER_SIZE {
        return Ok(None);
    }
    let mut raw = [0u8; FOOTER_SIZE as usize];
    file.seek(SeekFrom::Start(file_len - FOOTER_SIZE))
        .and_then(|_| file.read_exact(&mut raw))
        .map_err(|e| Error::file(path, e))?;
    if &raw[0..4] != FOOTER_MAGIC {
        return Ok(None);
    }

    let fields = Fields::new(&raw, path);
    let footer = AvbFooter {
        version_major: fields.u32(4)?,
        version_minor: fields.u32(8)?,
        original_image_size: fields.u64(12)?,
        vbmeta_offset: fields.u64(20)?,
        vbmeta_size: fields.u64(28)?,
    };
    if footer.vbmeta_offset > file_len {
        return Err(Error::avb_format(path, "footer points past end of image"));
    }
    Ok(Some(footer))
}

/// Parse the 256-byte vbmeta header
pub fn parse_header(raw: &[u8], path: &Path) -> Result<VbmetaHeader> {
    if raw.len() < HEADER_SIZE || &raw[0..4] != HEADER_MAGIC {
        return Err(Error::avb_field_missing("vbmeta header", path));
    }
    let fields = Fields::new(raw, path);
    let algorithm_type = fields.u32(28)?;
    let algorithm = AvbAlgorithm::from_u32(algorithm_type).ok_or_else(|| {
        Error::avb_format(path, format!("unknown algorithm type {}", algorithm_type))
    })?;

    Ok(VbmetaHeader {
        required_libavb_major: fields.u32(4)?,
        required_libavb_minor: fields.u32(8)?,
        authentication_block_size: fields.u64(12)?,
        auxiliary_block_size: fields.u64(20)?,
        algorithm,
        public_key_offset: fields.u64(64)?,
        public_key_size: fields.u64(72)?,
        descriptors_offset: fields.u64(96)?,
        descriptors_size: fields.u64(104)?,
        rollback_index: fields.u64(112)?,
        flags: fields.u32(120)?,
        rollback_index_location: fields.u32(124)?,
        release_string: c_string(fields.bytes(128, 48)?),
    })
}

/// Parse a descriptor array
pub fn parse_descriptors(raw: &[u8], path: &Path) -> Result<Vec<Descriptor>> {
    let fields = Fields::new(raw, path);
    let mut descriptors = Vec::new();
    let mut offset = 0u64;

    while offset + 16 <= raw.len() as u64 {
        let tag = fields.u64(offset)?;
        let num_bytes = fields.u64(offset + 8)?;
        let body = Fields::new(fields.bytes(offset + 16, num_bytes)?, path);
        descriptors.push(parse_descriptor(tag, &body)?);
        offset += 16 + num_bytes;
    }
    Ok(descriptors)
}

fn parse_descriptor(tag: u64, body: &Fields<'_>) -> Result<Descriptor> {
    let descriptor = match tag {
        TAG_PROPERTY => {
            let key_len = body.u64(0)?;
            let value_len = body.u64(8)?;
            let key_start = PROPERTY_FIXED_SIZE as u64;
            let key = body.bytes(key_start, key_len)?;
            // key and value are each followed by a NUL
            let value_start = key_start + key.len() as u64 + 1;
            Descriptor::Property {
                key: lossy(key),
                value: lossy(body.bytes(value_start, value_len)?),
            }
        }
        TAG_HASHTREE => {
            let name_len = body.u32(88)? as u64;
            let salt_len = body.u32(92)? as u64;
            let digest_len = body.u32(96)? as u64;
            let name_start = HASHTREE_FIXED_SIZE as u64;
            Descriptor::Hashtree {
                image_size: body.u64(4)?,
                hash_algorithm: c_string(body.bytes(56, 32)?),
                partition_name: lossy(body.bytes(name_start, name_len)?),
                salt: body.bytes(name_start + name_len, salt_len)?.to_vec(),
                root_digest: body
                    .bytes(name_start + name_len + salt_len, digest_len)?
                    .to_vec(),
                flags: body.u32(100)?,
            }
        }
        TAG_HASH => {
            let name_len = body.u32(40)? as u64;
            let salt_len = body.u32(44)? as u64;
            let digest_len = body.u32(48)? as u64;
            let name_start = HASH_FIXED_SIZE as u64;
            Descriptor::Hash {
                image_size: body.u64(0)?,
                hash_algorithm: c_string(body.bytes(8, 32)?),
                partition_name: lossy(body.bytes(name_start, name_len)?),
                salt: body.bytes(name_start + name_len, salt_len)?.to_vec(),
                digest: body
                    .bytes(name_start + name_len + salt_len, digest_len)?
                    .to_vec(),
                flags: body.u32(52)?,
            }
        }
        TAG_KERNEL_CMDLINE => {
            let len = body.u32(4)? as u64;
            Descriptor::KernelCmdline {
                flags: body.u32(0)?,
                cmdline: lossy(body.bytes(CMDLINE_FIXED_SIZE as u64, len)?),
            }
        }
        TAG_CHAIN_PARTITION => {
            let name_len = body.u32(4)? as u64;
            let key_len = body.u32(8)? as u64;
            let name_start = CHAIN_FIXED_SIZE as u64;
            Descriptor::ChainPartition {
                rollback_index_location: body.u32(0)?,
                partition_name: lossy(body.bytes(name_start, name_len)?),
                public_key: body.bytes(name_start + name_len, key_len)?.to_vec(),
                flags: body.u32(12)?,
            }
        }
        other => {
            trace!("Skipping AVB descriptor with tag {}", other);
            Descriptor::Unknown { tag: other }
        }
    };
    Ok(descriptor)
}

fn primary_partition(descriptors: &[Descriptor]) -> (Option<String>, Option<Vec<u8>>) {
    let hash = descriptors.iter().find_map(|d| match d {
        Descriptor::Hash {
            partition_name,
            salt,
            ..
        } => Some((partition_name, salt)),
        _ => None,
    });
    let tree = || {
        descriptors.iter().find_map(|d| match d {
            Descriptor::Hashtree {
                partition_name,
                salt,
                ..
            } => Some((partition_name, salt)),
            _ => None,
        })
    };
    match hash.or_else(tree) {
        Some((name, salt)) => (Some(name.clone()), Some(salt.clone())),
        None => (None, None),
    }
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    lossy(&raw[..end])
}

fn lossy(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

/// Bounds-checked big-endian reads over a byte slice
struct Fields<'a> {
    buf: &'a [u8],
    image: &'a Path,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8], image: &'a Path) -> Self {
        Self { buf, image }
    }

    fn bytes(&self, offset: u64, len: u64) -> Result<&'a [u8]> {
        let out_of_bounds = || {
            Error::avb_format(
                self.image,
                format!(
                    "field at {}+{} outside {}-byte block",
                    offset,
                    len,
                    self.buf.len()
                ),
            )
        };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let len = usize::try_from(len).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        self.buf.get(start..end).ok_or_else(out_of_bounds)
    }

    fn u32(&self, offset: u64) -> Result<u32> {
        let raw = self.bytes(offset, 4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&self, offset: u64) -> Result<u64> {
        let raw = self.bytes(offset, 8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(raw);
        Ok(u64::from_be_bytes(out))
    }
}
