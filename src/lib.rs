//! Declarative management of QEMU disk images through `qemu-img`.
//!
//! This crate does no disk I/O of its own. It translates an in-memory
//! [`ImageDescriptor`] into exact `qemu-img` argument sequences for
//! creation, snapshot lifecycle, and rebasing, runs the tool as a blocking
//! subprocess, and parses its JSON reports back into typed values. The
//! external tool remains the source of truth for all image semantics; this
//! layer is a configuration and state translator at the process boundary.
//!
//! ```no_run
//! use qimg::{ImageDescriptor, ImageFormat, QemuImg};
//!
//! # fn main() -> Result<(), qimg::ImageError> {
//! let image = ImageDescriptor::new("vm.qcow2", ImageFormat::Qcow2, 10 * 1024 * 1024 * 1024)
//!     .optimize_speed();
//!
//! let qemu = QemuImg::default();
//! qemu.create(&image)?;
//!
//! qemu.create_snapshot(&image, "fresh-install")?;
//! for snapshot in qemu.snapshots(&image)? {
//!     println!("{:>4}  {}  {}", snapshot.id, snapshot.name, snapshot.vm_clock_display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Rendering and parsing live in [`invocation`] and are pure: argument
//! vectors can be inspected without spawning anything. Errors are tagged by
//! kind in [`ImageError`]; nothing is retried or logged-and-swallowed.

pub mod commands;
pub mod config;
pub mod error;
pub mod image;
pub mod invocation;

pub use commands::qemu_img::QemuImg;
pub use error::{EncryptedFormatError, ImageError};
pub use image::{
    find_by_name, CipherAlgorithm, CipherFormat, CipherMode, CompatLevel, Encryption,
    HashAlgorithm, ImageDescriptor, ImageFormat, IvGenAlgorithm, Preallocation, SecretKey,
    Snapshot,
};
pub use invocation::{ImageInfo, SnapshotOp};
