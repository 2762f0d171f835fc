//! qemu-img subprocess execution
//!
//! The effectful half of the crate: a [`QemuImg`] handle runs rendered
//! argument sequences and maps results back through the parser. Every call
//! blocks until the child exits; there is no timeout, no cancellation, and
//! no retry. A hung qemu-img hangs the caller.
//!
//! Descriptors are not synchronized here. Two descriptors pointed at the
//! same file, or concurrent external access to it, must be serialized by
//! the caller; qemu-img itself guarantees nothing against that.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::ImageError;
use crate::image::descriptor::{Encryption, ImageDescriptor, SecretKey};
use crate::image::snapshot::{find_by_name, Snapshot};
use crate::invocation::{self, ImageInfo, SnapshotOp};

/// Handle to the qemu-img executable.
///
/// The default resolves `qemu-img` through `PATH`; an explicit program path
/// can be injected for nonstandard installs.
#[derive(Debug, Clone)]
pub struct QemuImg {
    program: PathBuf,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl QemuImg {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Create the image file described by the descriptor.
    pub fn create(&self, img: &ImageDescriptor) -> Result<(), ImageError> {
        let args = invocation::render_create(img)?;
        self.run(&args)?;
        Ok(())
    }

    /// Build a descriptor for an existing plain image from what qemu-img
    /// reports about it.
    ///
    /// Fails with the configuration kind when the image turns out to be
    /// encrypted; use [`open_encrypted`](Self::open_encrypted) with the
    /// secret instead.
    pub fn open(&self, path: impl Into<PathBuf>) -> Result<ImageDescriptor, ImageError> {
        let path = path.into();
        if !path.exists() {
            return Err(ImageError::NotFound { path });
        }

        let info = self.query_info(&path, None)?;
        if info.encrypted {
            return Err(ImageError::Configuration(format!(
                "image '{}' is encrypted but no secret was provided",
                path.display()
            )));
        }

        Ok(descriptor_from_info(path, info, None))
    }

    /// Build a descriptor for an existing encrypted image.
    ///
    /// Fails with the configuration kind when the secret is empty or when
    /// qemu-img reports the image as not encrypted.
    pub fn open_encrypted(
        &self,
        path: impl Into<PathBuf>,
        secret: impl Into<SecretKey>,
    ) -> Result<ImageDescriptor, ImageError> {
        let path = path.into();
        let secret = secret.into();
        if secret.is_empty() {
            return Err(ImageError::Configuration(
                "cannot open an encrypted image without a secret".to_string(),
            ));
        }
        if !path.exists() {
            return Err(ImageError::NotFound { path });
        }

        let info = self.query_info(&path, None)?;
        if !info.encrypted {
            return Err(ImageError::Configuration(format!(
                "image '{}' is not encrypted",
                path.display()
            )));
        }

        Ok(descriptor_from_info(path, info, Some(secret)))
    }

    /// Query qemu-img about the image, reconciling the reported encryption
    /// state against the descriptor's secret.
    pub fn inspect(&self, img: &ImageDescriptor) -> Result<ImageInfo, ImageError> {
        self.query_info(&img.path, img.secret())
    }

    /// A fresh snapshot listing.
    ///
    /// Nothing is cached: the tool is re-queried on every call, and any
    /// previously returned list is stale the moment a mutating operation
    /// runs against the image.
    pub fn snapshots(&self, img: &ImageDescriptor) -> Result<Vec<Snapshot>, ImageError> {
        Ok(self.inspect(img)?.snapshots)
    }

    /// Create a snapshot and return its record as reported by the tool.
    ///
    /// The record comes from a follow-up listing resolved by name (IDs are
    /// assigned by qemu-img and unknown until then). A create that succeeds
    /// but whose name is missing from the listing is a consistency failure,
    /// surfaced as [`ImageError::SnapshotNotFound`] and never retried.
    pub fn create_snapshot(
        &self,
        img: &ImageDescriptor,
        name: &str,
    ) -> Result<Snapshot, ImageError> {
        self.snapshot_op(img, SnapshotOp::Create, name)?;

        let snapshots = self.snapshots(img)?;
        find_by_name(&snapshots, name)
            .cloned()
            .ok_or_else(|| ImageError::SnapshotNotFound(name.to_string()))
    }

    /// Roll the image back to the named snapshot.
    pub fn restore_snapshot(&self, img: &ImageDescriptor, name: &str) -> Result<(), ImageError> {
        self.snapshot_op(img, SnapshotOp::Restore, name)
    }

    /// Delete the named snapshot from the image.
    pub fn delete_snapshot(&self, img: &ImageDescriptor, name: &str) -> Result<(), ImageError> {
        self.snapshot_op(img, SnapshotOp::Delete, name)
    }

    /// Point the image at a new backing file. The descriptor records the
    /// new base only after qemu-img succeeds.
    pub fn rebase(
        &self,
        img: &mut ImageDescriptor,
        new_backing: impl Into<PathBuf>,
    ) -> Result<(), ImageError> {
        let new_backing = new_backing.into();
        let args = invocation::render_rebase(img, &new_backing)?;
        self.run(&args)?;

        img.backing_file = Some(new_backing);
        Ok(())
    }

    fn snapshot_op(
        &self,
        img: &ImageDescriptor,
        op: SnapshotOp,
        name: &str,
    ) -> Result<(), ImageError> {
        if name.trim().is_empty() {
            return Err(ImageError::Configuration(
                "snapshot name cannot be empty".to_string(),
            ));
        }

        let args = invocation::render_snapshot(img, op, name)?;
        self.run(&args)?;
        Ok(())
    }

    fn query_info(
        &self,
        path: &Path,
        secret: Option<&SecretKey>,
    ) -> Result<ImageInfo, ImageError> {
        let args = invocation::render_info(path)?;
        let stdout = self.run(&args)?;
        invocation::parse_info(&stdout, secret)
    }

    fn run(&self, args: &[String]) -> Result<Vec<u8>, ImageError> {
        let subcommand = args.first().map(String::as_str).unwrap_or("").to_string();
        // The argument list can carry the secret object, so only the
        // subcommand is logged.
        debug!("running {} {}", self.program.display(), subcommand);

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|err| ImageError::ExternalTool {
                subcommand: subcommand.clone(),
                diagnostic: err.to_string(),
            })?;

        if !output.status.success() {
            return Err(ImageError::ExternalTool {
                subcommand,
                diagnostic: one_line(&output.stdout, &output.stderr),
            });
        }

        Ok(output.stdout)
    }
}

fn descriptor_from_info(
    path: PathBuf,
    info: ImageInfo,
    secret: Option<SecretKey>,
) -> ImageDescriptor {
    let mut img = ImageDescriptor::new(path, info.format, info.virtual_size);
    img.backing_file = info.backing_file;
    if let Some(bytes) = info.cluster_size {
        img.cluster_size_kb = bytes / 1024;
    }
    if let Some(secret) = secret {
        img.encryption = Some(Encryption::new(secret));
    }
    img
}

/// Collapse combined subprocess output to a single diagnostic line.
fn one_line(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    combined.push(' ');
    combined.push_str(&String::from_utf8_lossy(stderr));
    combined.split_whitespace().collect::<Vec<_>>().join(" ")
}
