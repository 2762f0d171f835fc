//! Error types for qemu-img operations
//!
//! Every failure is surfaced to the immediate caller as a tagged kind so
//! callers can branch without matching on message strings. Nothing is
//! retried and nothing is swallowed.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::image::descriptor::ImageDescriptor;

#[derive(Debug, Error)]
pub enum ImageError {
    /// The descriptor cannot be rendered or opened as requested: encryption
    /// on a non-qcow2 format, a missing or empty secret, a secret supplied
    /// for a plain image, a non-UTF-8 path, or an empty snapshot name.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A referenced file (image to open, backing file) did not exist at the
    /// time it was checked.
    #[error("no such file: {}", .path.display())]
    NotFound { path: PathBuf },

    /// qemu-img exited non-zero or could not be spawned. The diagnostic is
    /// the tool's own combined output, collapsed to a single line.
    #[error("'qemu-img {subcommand}' failed: {diagnostic}")]
    ExternalTool {
        subcommand: String,
        diagnostic: String,
    },

    /// `qemu-img info --output=json` produced something other than the
    /// expected structure.
    #[error("malformed 'qemu-img info' output: {0}")]
    MalformedOutput(String),

    /// A snapshot that an operation should have produced is missing from the
    /// follow-up listing. Treated as a consistency failure, never retried.
    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),
}

/// Returned by [`ImageDescriptor::new_encrypted`] when the requested format
/// cannot carry encryption (qemu-img only supports LUKS-style encryption on
/// qcow2).
///
/// The descriptor is fully populated despite the error, with the encrypted
/// flag set and the secret attached; [`descriptor`](Self::descriptor) and
/// [`into_descriptor`](Self::into_descriptor) expose it so callers can
/// observe exactly what was rejected.
#[derive(Debug)]
pub struct EncryptedFormatError {
    descriptor: ImageDescriptor,
}

impl EncryptedFormatError {
    pub(crate) fn new(descriptor: ImageDescriptor) -> Self {
        Self { descriptor }
    }

    /// The rejected descriptor.
    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.descriptor
    }

    /// Consume the error and recover the rejected descriptor.
    pub fn into_descriptor(self) -> ImageDescriptor {
        self.descriptor
    }
}

impl fmt::Display for EncryptedFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "encrypted images require the qcow2 format, got '{}'",
            self.descriptor.format
        )
    }
}

impl std::error::Error for EncryptedFormatError {}

impl From<EncryptedFormatError> for ImageError {
    fn from(err: EncryptedFormatError) -> Self {
        ImageError::Configuration(err.to_string())
    }
}
