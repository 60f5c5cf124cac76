//! Application error types with rich context

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::DeviceMode;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Why a partition lookup came back empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    /// The map was built from an empty descriptor list
    NoDescriptors,
    /// Descriptors were supplied but none carries the label
    LabelAbsent { descriptors: usize },
}

impl fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotFoundReason::NoDescriptors => write!(f, "no partition descriptors supplied"),
            NotFoundReason::LabelAbsent { descriptors } => {
                write!(f, "label absent from all {} descriptor(s)", descriptors)
            }
        }
    }
}

/// Coarse classification matching the operation-level error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    PartitionNotFound,
    AvbFieldMissing,
    KeyMismatch,
    IntegrityAbort,
    Tool,
    Image,
    Config,
    Io,
    Usage,
}

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File error for {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid configuration in {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    // ─────────────────────────────────────────────────────────────
    // Device / External Tool Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Device not reachable in {mode} mode: {message}")]
    Connection { mode: DeviceMode, message: String },

    #[error("Firehose protocol error: {message}")]
    Protocol { message: String },

    #[error("Required tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} exited with code {code:?}: {stderr}")]
    CommandFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Image {path} is {len} bytes, not a multiple of the {sector_size}-byte sector size")]
    UnalignedImage {
        path: PathBuf,
        len: u64,
        sector_size: u64,
    },

    // ─────────────────────────────────────────────────────────────
    // Partition Descriptor Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Partition '{label}' not found: {reason}")]
    PartitionNotFound {
        label: String,
        reason: NotFoundReason,
    },

    #[error("Invalid partition descriptor {path}: {message}")]
    Descriptor { path: PathBuf, message: String },

    // ─────────────────────────────────────────────────────────────
    // Verified Boot Errors
    // ─────────────────────────────────────────────────────────────
    #[error("AVB field '{field}' missing from {image}")]
    AvbFieldMissing { field: &'static str, image: PathBuf },

    #[error("Malformed AVB metadata in {image}: {message}")]
    AvbFormat { image: PathBuf, message: String },

    #[error("No signing key configured for public key SHA1 {digest:?}")]
    KeyMismatch { digest: Option<String> },

    #[error("Image not found: {path}")]
    MissingImage { path: PathBuf },

    #[error("Patch aborted, partial output in {output_dir} removed: {source}")]
    IntegrityAbort {
        output_dir: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("Rollback patch requested for a comparison with status {status}")]
    InvalidComparison { status: String },

    // ─────────────────────────────────────────────────────────────
    // Region Patch Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Region patch error: {message}")]
    Region { message: String },

    #[error("Firmware does not match device model '{model}' (fingerprint: {fingerprint})")]
    ModelMismatch { model: String, fingerprint: String },
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn connection(mode: DeviceMode, message: impl Into<String>) -> Self {
        Self::Connection {
            mode,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    pub fn command_failed(tool: impl Into<String>, code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            tool: tool.into(),
            code,
            stderr: stderr.into(),
        }
    }

    pub fn descriptor(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Descriptor {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn avb_field_missing(field: &'static str, image: impl Into<PathBuf>) -> Self {
        Self::AvbFieldMissing {
            field,
            image: image.into(),
        }
    }

    pub fn avb_format(image: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::AvbFormat {
            image: image.into(),
            message: message.into(),
        }
    }

    pub fn missing_image(path: impl Into<PathBuf>) -> Self {
        Self::MissingImage { path: path.into() }
    }

    pub fn integrity_abort(output_dir: impl Into<PathBuf>, source: Error) -> Self {
        Self::IntegrityAbort {
            output_dir: output_dir.into(),
            source: Box::new(source),
        }
    }

    pub fn region(message: impl Into<String>) -> Self {
        Self::Region {
            message: message.into(),
        }
    }

    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::File { .. } => ErrorKind::Io,
            Error::Config { .. } | Error::ConfigParse { .. } => ErrorKind::Config,
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Protocol { .. } | Error::UnalignedImage { .. } => ErrorKind::Protocol,
            Error::ToolNotFound { .. } | Error::CommandFailed { .. } => ErrorKind::Tool,
            Error::PartitionNotFound { .. } | Error::Descriptor { .. } => {
                ErrorKind::PartitionNotFound
            }
            Error::AvbFieldMissing { .. } => ErrorKind::AvbFieldMissing,
            Error::KeyMismatch { .. } => ErrorKind::KeyMismatch,
            Error::IntegrityAbort { .. } => ErrorKind::IntegrityAbort,
            Error::AvbFormat { .. } | Error::MissingImage { .. } => ErrorKind::Image,
            Error::Region { .. } | Error::ModelMismatch { .. } => ErrorKind::Image,
            Error::InvalidComparison { .. } => ErrorKind::Usage,
        }
    }

    /// Check if the caller may reasonably retry the whole operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::Protocol { .. } | Error::CommandFailed { .. }
        )
    }

    /// Check if this error means the setup itself is wrong and retrying is pointless
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ToolNotFound { .. }
                | Error::KeyMismatch { .. }
                | Error::ConfigParse { .. }
                | Error::InvalidComparison { .. }
                | Error::ModelMismatch { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
