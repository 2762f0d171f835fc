//! Disk image descriptors
//!
//! An [`ImageDescriptor`] is a transient, in-memory view of a disk image's
//! identity, geometry, and encryption configuration. It holds no durable
//! state: everything durable lives in the image file managed by qemu-img.
//! Construction never touches the filesystem, and the optimization profiles
//! are pure transformations producing new values.

use std::fmt;
use std::path::PathBuf;

use crate::error::{EncryptedFormatError, ImageError};
use crate::image::format::{
    CipherAlgorithm, CipherFormat, CipherMode, CompatLevel, HashAlgorithm, ImageFormat,
    IvGenAlgorithm, Preallocation,
};

/// Cluster size qemu-img uses when none is requested.
pub const DEFAULT_CLUSTER_SIZE_KB: u64 = 64;
/// Refcount table width qemu-img uses when none is requested.
pub const DEFAULT_REFCOUNT_BITS: u32 = 16;

const SPEED_ITER_TIME_MS: u64 = 1000;
const SIZE_ITER_TIME_MS: u64 = 2000;

/// An encryption secret supplied by the caller.
///
/// The value is held in memory only and is never persisted by this layer.
/// `Debug` output is redacted; use [`expose`](Self::expose) where the raw
/// value is genuinely needed (building the qemu-img secret object).
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl From<&str> for SecretKey {
    fn from(secret: &str) -> Self {
        Self::new(secret)
    }
}

impl From<String> for SecretKey {
    fn from(secret: String) -> Self {
        Self::new(secret)
    }
}

/// Encryption configuration for a qcow2 image.
///
/// Unset fields are omitted from the rendered invocation so qemu-img applies
/// its own defaults; the envelope format falls back to LUKS at render time.
///
/// Secret exposure: qemu-img takes encryption parameters on the command line,
/// so for snapshot operations the raw secret ends up inside the `--object`
/// argument token, visible to anything on the host that can read the process
/// argument list. Callers for whom `ps` visibility is in the threat model
/// must not rely on this layer to hide the secret.
#[derive(Debug, Clone, PartialEq)]
pub struct Encryption {
    /// Unlock secret for the image.
    pub secret: SecretKey,
    pub cipher_algorithm: Option<CipherAlgorithm>,
    pub cipher_mode: Option<CipherMode>,
    pub cipher_format: Option<CipherFormat>,
    pub hash_algorithm: Option<HashAlgorithm>,
    /// PBKDF iteration time in milliseconds. Larger values slow unlocking
    /// but harden the key derivation.
    pub iter_time_ms: Option<u64>,
    pub ivgen_algorithm: Option<IvGenAlgorithm>,
    pub ivgen_hash_algorithm: Option<HashAlgorithm>,
}

impl Encryption {
    /// Encryption with the given secret and every tunable left to qemu-img.
    pub fn new(secret: impl Into<SecretKey>) -> Self {
        Self {
            secret: secret.into(),
            cipher_algorithm: None,
            cipher_mode: None,
            cipher_format: None,
            hash_algorithm: None,
            iter_time_ms: None,
            ivgen_algorithm: None,
            ivgen_hash_algorithm: None,
        }
    }

    /// AES-256/XTS under LUKS with SHA-256 hashing and plain64 IV
    /// generation. Both optimization profiles pin this suite and differ only
    /// in the iteration time.
    fn set_standard_suite(&mut self, iter_time_ms: u64) {
        self.cipher_algorithm = Some(CipherAlgorithm::Aes256);
        self.cipher_mode = Some(CipherMode::Xts);
        self.cipher_format = Some(CipherFormat::Luks);
        self.hash_algorithm = Some(HashAlgorithm::Sha256);
        self.iter_time_ms = Some(iter_time_ms);
        self.ivgen_algorithm = Some(IvGenAlgorithm::Plain64);
        self.ivgen_hash_algorithm = Some(HashAlgorithm::Sha256);
    }
}

/// In-memory description of a disk image.
///
/// The path is used verbatim as a file reference and is not checked for
/// existence at construction. Geometry fields only influence image creation;
/// for an image that already exists on disk they are informational.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescriptor {
    /// Image file location.
    pub path: PathBuf,
    /// Image format.
    pub format: ImageFormat,
    /// Virtual size in bytes. Only meaningful at creation.
    pub virtual_size: u64,
    /// Base image this one records deltas against. Not every format
    /// supports backing chains; qemu-img is the judge of that.
    pub backing_file: Option<PathBuf>,
    /// Cluster size in KB.
    pub cluster_size_kb: u64,
    /// Width of the internal refcount table entries.
    pub refcount_bits: u32,
    /// Postpone refcount updates for faster writes.
    pub lazy_refcounts: bool,
    /// Subdivide L2 table entries for finer allocation granularity.
    pub extended_l2: bool,
    /// qcow2 compatibility level.
    pub compat: Option<CompatLevel>,
    /// Storage reservation at creation time.
    pub preallocation: Option<Preallocation>,
    /// Present exactly when the image is encrypted.
    pub encryption: Option<Encryption>,
}

impl ImageDescriptor {
    /// Descriptor for a plain image with the format's baseline geometry.
    pub fn new(path: impl Into<PathBuf>, format: ImageFormat, virtual_size: u64) -> Self {
        Self {
            path: path.into(),
            format,
            virtual_size,
            backing_file: None,
            cluster_size_kb: DEFAULT_CLUSTER_SIZE_KB,
            refcount_bits: DEFAULT_REFCOUNT_BITS,
            lazy_refcounts: false,
            extended_l2: false,
            compat: None,
            preallocation: None,
            encryption: None,
        }
    }

    /// Descriptor for an encrypted image.
    ///
    /// qemu-img only supports encryption-at-rest on qcow2; any other format
    /// fails with [`EncryptedFormatError`]. The error still carries the
    /// fully-populated descriptor (encrypted, secret attached) so the
    /// rejected configuration can be inspected.
    pub fn new_encrypted(
        path: impl Into<PathBuf>,
        format: ImageFormat,
        secret: impl Into<SecretKey>,
        virtual_size: u64,
    ) -> Result<Self, EncryptedFormatError> {
        let mut img = Self::new(path, format, virtual_size);
        img.encryption = Some(Encryption::new(secret));

        if format != ImageFormat::Qcow2 {
            return Err(EncryptedFormatError::new(img));
        }

        Ok(img)
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// The attached secret, when the descriptor is encrypted.
    pub fn secret(&self) -> Option<&SecretKey> {
        self.encryption.as_ref().map(|enc| &enc.secret)
    }

    /// Tune the descriptor for write throughput: lazy refcounts, the v3
    /// layout, wide refcounts, large clusters, extended L2 tables, and full
    /// preallocation. Encrypted descriptors get the standard cipher suite
    /// with a short key-derivation time (faster unlock, larger on-disk
    /// overhead).
    ///
    /// Only meaningful before [`QemuImg::create`]; applying a profile to the
    /// descriptor of an image that already exists does not change the file.
    ///
    /// Profiles assign every field they manage, so applying a second profile
    /// replaces the first outright.
    ///
    /// [`QemuImg::create`]: crate::commands::qemu_img::QemuImg::create
    pub fn optimize_speed(mut self) -> Self {
        self.lazy_refcounts = true;
        self.compat = Some(CompatLevel::Qcow3);
        self.refcount_bits = 64;
        self.cluster_size_kb = 1024;
        self.extended_l2 = true;
        self.preallocation = Some(Preallocation::Full);

        if let Some(enc) = &mut self.encryption {
            enc.set_standard_suite(SPEED_ITER_TIME_MS);
        }

        self
    }

    /// Tune the descriptor for minimal on-disk footprint: baseline refcount
    /// width and cluster size, metadata-only preallocation. Encrypted
    /// descriptors get the standard cipher suite with a long key-derivation
    /// time (slower unlock, smaller on-disk overhead).
    ///
    /// Only meaningful before [`QemuImg::create`]; applying a profile to the
    /// descriptor of an image that already exists does not change the file.
    ///
    /// [`QemuImg::create`]: crate::commands::qemu_img::QemuImg::create
    pub fn optimize_size(mut self) -> Self {
        self.lazy_refcounts = false;
        self.compat = None;
        self.refcount_bits = DEFAULT_REFCOUNT_BITS;
        self.cluster_size_kb = DEFAULT_CLUSTER_SIZE_KB;
        self.extended_l2 = true;
        self.preallocation = Some(Preallocation::Metadata);

        if let Some(enc) = &mut self.encryption {
            enc.set_standard_suite(SIZE_ITER_TIME_MS);
        }

        self
    }

    /// Record a backing file for the image.
    ///
    /// The existence check is point-in-time and inherently racy: the file
    /// can disappear between this call and the create invocation. Best
    /// effort only.
    pub fn with_backing_file(mut self, backing: impl Into<PathBuf>) -> Result<Self, ImageError> {
        let backing = backing.into();
        if !backing.exists() {
            return Err(ImageError::NotFound { path: backing });
        }

        self.backing_file = Some(backing);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_new_uses_baseline_geometry() {
        let img = ImageDescriptor::new("test.qcow2", ImageFormat::Qcow2, 10 * GIB);
        assert_eq!(img.cluster_size_kb, DEFAULT_CLUSTER_SIZE_KB);
        assert_eq!(img.refcount_bits, DEFAULT_REFCOUNT_BITS);
        assert!(!img.lazy_refcounts);
        assert!(!img.extended_l2);
        assert_eq!(img.compat, None);
        assert_eq!(img.preallocation, None);
        assert_eq!(img.backing_file, None);
        assert!(!img.is_encrypted());
    }

    #[test]
    fn test_new_encrypted_requires_qcow2() {
        for format in [
            ImageFormat::Raw,
            ImageFormat::Cloop,
            ImageFormat::Cow,
            ImageFormat::Qcow,
            ImageFormat::Vdmk,
            ImageFormat::Vdi,
            ImageFormat::Vhdx,
            ImageFormat::Vpc,
        ] {
            let err = ImageDescriptor::new_encrypted("enc.img", format, "topsecret", GIB)
                .expect_err("non-qcow2 format must be rejected");

            // The rejected descriptor is still fully populated.
            let img = err.into_descriptor();
            assert!(img.is_encrypted());
            assert_eq!(img.secret().unwrap().expose(), "topsecret");
            assert_eq!(img.format, format);
        }

        let img =
            ImageDescriptor::new_encrypted("enc.qcow2", ImageFormat::Qcow2, "topsecret", GIB)
                .unwrap();
        assert!(img.is_encrypted());
    }

    #[test]
    fn test_optimize_speed_fields() {
        let img = ImageDescriptor::new_encrypted("enc.qcow2", ImageFormat::Qcow2, "s", GIB)
            .unwrap()
            .optimize_speed();

        assert!(img.lazy_refcounts);
        assert_eq!(img.compat, Some(CompatLevel::Qcow3));
        assert_eq!(img.refcount_bits, 64);
        assert_eq!(img.cluster_size_kb, 1024);
        assert!(img.extended_l2);
        assert_eq!(img.preallocation, Some(Preallocation::Full));

        let enc = img.encryption.unwrap();
        assert_eq!(enc.cipher_algorithm, Some(CipherAlgorithm::Aes256));
        assert_eq!(enc.cipher_mode, Some(CipherMode::Xts));
        assert_eq!(enc.cipher_format, Some(CipherFormat::Luks));
        assert_eq!(enc.hash_algorithm, Some(HashAlgorithm::Sha256));
        assert_eq!(enc.iter_time_ms, Some(1000));
        assert_eq!(enc.ivgen_algorithm, Some(IvGenAlgorithm::Plain64));
        assert_eq!(enc.ivgen_hash_algorithm, Some(HashAlgorithm::Sha256));
    }

    #[test]
    fn test_optimize_size_fields() {
        let img = ImageDescriptor::new_encrypted("enc.qcow2", ImageFormat::Qcow2, "s", GIB)
            .unwrap()
            .optimize_size();

        assert!(!img.lazy_refcounts);
        assert_eq!(img.compat, None);
        assert_eq!(img.refcount_bits, DEFAULT_REFCOUNT_BITS);
        assert_eq!(img.cluster_size_kb, DEFAULT_CLUSTER_SIZE_KB);
        assert!(img.extended_l2);
        assert_eq!(img.preallocation, Some(Preallocation::Metadata));
        assert_eq!(img.encryption.unwrap().iter_time_ms, Some(2000));
    }

    #[test]
    fn test_later_profile_wins() {
        let base = ImageDescriptor::new_encrypted("enc.qcow2", ImageFormat::Qcow2, "s", GIB)
            .unwrap();

        let stacked = base.clone().optimize_speed().optimize_size();
        let direct = base.optimize_size();
        assert_eq!(stacked, direct);
    }

    #[test]
    fn test_profiles_do_not_touch_plain_encryption() {
        let img = ImageDescriptor::new("test.qcow2", ImageFormat::Qcow2, GIB).optimize_speed();
        assert!(img.encryption.is_none());
    }

    #[test]
    fn test_with_backing_file_missing() {
        let img = ImageDescriptor::new("test.qcow2", ImageFormat::Qcow2, GIB);
        let err = img
            .with_backing_file("/nonexistent/backing-54321.qcow2")
            .unwrap_err();
        assert!(matches!(err, ImageError::NotFound { .. }));
    }

    #[test]
    fn test_with_backing_file_present() {
        // The manifest is guaranteed to exist wherever the tests run.
        let backing = concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml");
        let img = ImageDescriptor::new("test.qcow2", ImageFormat::Qcow2, GIB)
            .with_backing_file(backing)
            .unwrap();
        assert_eq!(img.backing_file, Some(backing.into()));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SecretKey::new("hunter2");
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("hunter2"));
    }
}
