//! Rendering and parsing of qemu-img invocations
//!
//! The pure half of the crate: mapping an [`ImageDescriptor`] plus an
//! operation onto the exact argument sequence qemu-img expects, and mapping
//! the tool's JSON report back into an [`ImageInfo`]. Nothing here spawns a
//! process, so every rendering rule is unit-testable by inspecting the
//! produced vector.
//!
//! Rendering is minimal: an option is only emitted when it differs from the
//! format's implicit baseline, which keeps invocations short and avoids
//! second-guessing qemu-img's own default resolution. The one exception is
//! preallocation, which is always stated (`metadata` when the descriptor
//! leaves it unset) and can be overridden exactly once.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ImageError;
use crate::image::descriptor::{
    ImageDescriptor, SecretKey, DEFAULT_CLUSTER_SIZE_KB, DEFAULT_REFCOUNT_BITS,
};
use crate::image::format::{CipherFormat, ImageFormat};
use crate::image::snapshot::Snapshot;

/// Identifier of the transient secret object passed to qemu-img. The secret
/// value itself travels inside the `--object` argument; option clauses refer
/// to it by this id.
pub const SECRET_ID: &str = "sec0";

/// Snapshot lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOp {
    Create,
    Restore,
    Delete,
}

impl SnapshotOp {
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Create => "-c",
            Self::Restore => "-a",
            Self::Delete => "-d",
        }
    }
}

/// What `qemu-img info --output=json` reported about an image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageInfo {
    pub format: ImageFormat,
    /// Virtual size in bytes.
    pub virtual_size: u64,
    /// Reconciled encryption state, see [`parse_info`].
    pub encrypted: bool,
    pub backing_file: Option<PathBuf>,
    /// Cluster size in bytes, when reported.
    pub cluster_size: Option<u64>,
    /// Snapshots in the tool's reporting order.
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawImageInfo {
    format: String,
    virtual_size: u64,
    #[serde(default)]
    encrypted: bool,
    #[serde(default)]
    cluster_size: Option<u64>,
    #[serde(default)]
    backing_filename: Option<String>,
    #[serde(default)]
    snapshots: Vec<RawSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawSnapshot {
    id: String,
    name: String,
    #[serde(default)]
    date_sec: i64,
    #[serde(default)]
    date_nsec: i64,
    #[serde(default)]
    vm_clock_sec: i64,
    #[serde(default)]
    vm_clock_nsec: i64,
}

fn path_to_str(path: &Path) -> Result<&str, ImageError> {
    path.to_str().ok_or_else(|| {
        ImageError::Configuration(format!("path contains invalid UTF-8: {:?}", path))
    })
}

fn push_opt(args: &mut Vec<String>, value: String) {
    args.push("-o".to_string());
    args.push(value);
}

/// Render a `qemu-img create` invocation for the descriptor.
///
/// Fails without producing any arguments when the descriptor is encrypted
/// with a non-qcow2 format. For encrypted images the secret travels in a
/// `--object secret,id=sec0,data=...` token and the option clauses refer to
/// it as `encrypt.key-secret=sec0`; see [`Encryption`] for the argument-list
/// exposure caveat.
///
/// [`Encryption`]: crate::image::descriptor::Encryption
pub fn render_create(img: &ImageDescriptor) -> Result<Vec<String>, ImageError> {
    if img.is_encrypted() && img.format != ImageFormat::Qcow2 {
        return Err(ImageError::Configuration(format!(
            "encrypted images require the qcow2 format, got '{}'",
            img.format
        )));
    }

    let path = path_to_str(&img.path)?;
    let mut args = vec!["create".to_string()];

    if let Some(enc) = &img.encryption {
        args.push("--object".to_string());
        args.push(format!("secret,id={},data={}", SECRET_ID, enc.secret.expose()));
    }

    args.push("-f".to_string());
    args.push(img.format.as_str().to_string());

    if let Some(enc) = &img.encryption {
        push_opt(&mut args, format!("encrypt.key-secret={}", SECRET_ID));
        if let Some(ms) = enc.iter_time_ms {
            push_opt(&mut args, format!("encrypt.iter-time={}", ms));
        }
        if let Some(alg) = enc.ivgen_algorithm {
            push_opt(&mut args, format!("encrypt.ivgen-alg={}", alg));
        }
        if let Some(hash) = enc.ivgen_hash_algorithm {
            push_opt(&mut args, format!("encrypt.ivgen-hash-alg={}", hash));
        }
        if let Some(mode) = enc.cipher_mode {
            push_opt(&mut args, format!("encrypt.cipher-mode={}", mode));
        }
        if let Some(alg) = enc.cipher_algorithm {
            push_opt(&mut args, format!("encrypt.cipher-alg={}", alg));
        }
        if let Some(hash) = enc.hash_algorithm {
            push_opt(&mut args, format!("encrypt.hash-alg={}", hash));
        }
        let envelope = enc.cipher_format.unwrap_or(CipherFormat::Luks);
        push_opt(&mut args, format!("encrypt.format={}", envelope));
    }

    if let Some(backing) = &img.backing_file {
        push_opt(&mut args, format!("backing_file={}", path_to_str(backing)?));
    }
    if let Some(compat) = img.compat {
        push_opt(&mut args, format!("compat={}", compat));
    }
    if img.cluster_size_kb != DEFAULT_CLUSTER_SIZE_KB {
        push_opt(&mut args, format!("cluster_size={}K", img.cluster_size_kb));
    }
    if img.extended_l2 {
        push_opt(&mut args, "extended_l2=on".to_string());
    }
    if img.lazy_refcounts {
        push_opt(&mut args, "lazy_refcounts=on".to_string());
    }
    let prealloc = img.preallocation.map(|p| p.as_str()).unwrap_or("metadata");
    push_opt(&mut args, format!("preallocation={}", prealloc));
    if img.refcount_bits != DEFAULT_REFCOUNT_BITS {
        push_opt(&mut args, format!("refcount_bits={}", img.refcount_bits));
    }

    args.push(path.to_string());
    args.push(img.virtual_size.to_string());

    Ok(args)
}

/// Render a `qemu-img snapshot` invocation.
///
/// qemu-img has no persistent session, so for encrypted images the secret
/// object and an `--image-opts` clause restating the LUKS key reference must
/// be re-supplied on every invocation that touches file contents. The raw
/// secret is part of the resulting argument list; anything able to read the
/// child's argv on the host can see it.
pub fn render_snapshot(
    img: &ImageDescriptor,
    op: SnapshotOp,
    name: &str,
) -> Result<Vec<String>, ImageError> {
    let path = path_to_str(&img.path)?;
    let mut args = vec!["snapshot".to_string()];

    match &img.encryption {
        None => {
            args.push(op.flag().to_string());
            args.push(name.to_string());
            args.push(path.to_string());
        }
        Some(enc) => {
            args.push("--object".to_string());
            args.push(format!("secret,id={},data={}", SECRET_ID, enc.secret.expose()));
            args.push("--image-opts".to_string());
            args.push(op.flag().to_string());
            args.push(name.to_string());
            args.push(format!(
                "encrypt.format=luks,encrypt.key-secret={},file.filename={}",
                SECRET_ID, path
            ));
        }
    }

    Ok(args)
}

/// Render a `qemu-img rebase` invocation onto a new backing file.
///
/// Encryption is not special-cased here; qemu-img handles rebasing
/// encrypted overlays itself.
pub fn render_rebase(
    img: &ImageDescriptor,
    new_backing: &Path,
) -> Result<Vec<String>, ImageError> {
    Ok(vec![
        "rebase".to_string(),
        "-b".to_string(),
        path_to_str(new_backing)?.to_string(),
        path_to_str(&img.path)?.to_string(),
    ])
}

/// Render a `qemu-img info` invocation with JSON output.
pub fn render_info(path: &Path) -> Result<Vec<String>, ImageError> {
    Ok(vec![
        "info".to_string(),
        "--output=json".to_string(),
        path_to_str(path)?.to_string(),
    ])
}

/// Parse the JSON payload of `qemu-img info --output=json`.
///
/// Two reconciliation rules apply:
///
/// * A non-empty locally-known `secret` forces `encrypted = true` no matter
///   what the payload reports; a secret in hand is stronger evidence than a
///   possibly-stale report. Without one, the reported value (absent means
///   false) is taken verbatim.
/// * Snapshot entries whose `id` does not parse as an integer are dropped
///   silently, keeping all other entries in their original order. The tool
///   has had format quirks here and one odd entry should not fail the whole
///   listing.
pub fn parse_info(raw: &[u8], secret: Option<&SecretKey>) -> Result<ImageInfo, ImageError> {
    let raw: RawImageInfo = serde_json::from_slice(raw)
        .map_err(|err| ImageError::MalformedOutput(err.to_string()))?;

    let format = ImageFormat::from_name(&raw.format).ok_or_else(|| {
        ImageError::MalformedOutput(format!("unrecognized image format '{}'", raw.format))
    })?;

    let encrypted = match secret {
        Some(secret) if !secret.is_empty() => true,
        _ => raw.encrypted,
    };

    let snapshots = raw
        .snapshots
        .into_iter()
        .filter_map(|snap| {
            let id = snap.id.parse::<u32>().ok()?;
            Some(Snapshot {
                id,
                name: snap.name,
                created: timestamp(snap.date_sec, snap.date_nsec),
                vm_clock: timestamp(snap.vm_clock_sec, snap.vm_clock_nsec),
            })
        })
        .collect();

    Ok(ImageInfo {
        format,
        virtual_size: raw.virtual_size,
        encrypted,
        backing_file: raw.backing_filename.map(PathBuf::from),
        cluster_size: raw.cluster_size,
        snapshots,
    })
}

fn timestamp(sec: i64, nsec: i64) -> DateTime<Utc> {
    let nsec = u32::try_from(nsec).unwrap_or(0);
    DateTime::from_timestamp(sec, nsec).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::descriptor::ImageDescriptor;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn as_strs(args: &[String]) -> Vec<&str> {
        args.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_render_create_plain_defaults() {
        let img = ImageDescriptor::new("test.qcow2", ImageFormat::Qcow2, 10 * GIB);
        let args = render_create(&img).unwrap();
        assert_eq!(
            as_strs(&args),
            vec![
                "create",
                "-f",
                "qcow2",
                "-o",
                "preallocation=metadata",
                "test.qcow2",
                "10737418240",
            ]
        );
    }

    #[test]
    fn test_render_create_speed_profile() {
        let img = ImageDescriptor::new("fast.qcow2", ImageFormat::Qcow2, GIB).optimize_speed();
        let args = render_create(&img).unwrap();
        assert_eq!(
            as_strs(&args),
            vec![
                "create",
                "-f",
                "qcow2",
                "-o",
                "compat=1.1",
                "-o",
                "cluster_size=1024K",
                "-o",
                "extended_l2=on",
                "-o",
                "lazy_refcounts=on",
                "-o",
                "preallocation=full",
                "-o",
                "refcount_bits=64",
                "fast.qcow2",
                "1073741824",
            ]
        );
    }

    #[test]
    fn test_render_create_with_backing_file() {
        let mut img = ImageDescriptor::new("delta.qcow2", ImageFormat::Qcow2, GIB);
        img.backing_file = Some("base.qcow2".into());
        let args = render_create(&img).unwrap();
        assert_eq!(
            as_strs(&args),
            vec![
                "create",
                "-f",
                "qcow2",
                "-o",
                "backing_file=base.qcow2",
                "-o",
                "preallocation=metadata",
                "delta.qcow2",
                "1073741824",
            ]
        );
    }

    #[test]
    fn test_render_create_encrypted() {
        let img =
            ImageDescriptor::new_encrypted("enc.qcow2", ImageFormat::Qcow2, "secret1", 5 * GIB)
                .unwrap();
        let args = render_create(&img).unwrap();
        let strs = as_strs(&args);

        // Secret travels through the object side-channel, never a bare flag.
        let object_at = strs.iter().position(|a| *a == "--object").unwrap();
        assert_eq!(strs[object_at + 1], "secret,id=sec0,data=secret1");

        assert!(strs.contains(&"encrypt.key-secret=sec0"));
        assert!(strs.contains(&"encrypt.format=luks"));
        assert_eq!(&strs[strs.len() - 2..], &["enc.qcow2", "5368709120"]);
    }

    #[test]
    fn test_render_create_encrypted_emits_cipher_before_geometry() {
        let img =
            ImageDescriptor::new_encrypted("enc.qcow2", ImageFormat::Qcow2, "secret1", GIB)
                .unwrap()
                .optimize_speed();
        let args = render_create(&img).unwrap();
        let strs = as_strs(&args);

        let key_secret = strs.iter().position(|a| *a == "encrypt.key-secret=sec0").unwrap();
        let iter_time = strs.iter().position(|a| *a == "encrypt.iter-time=1000").unwrap();
        let envelope = strs.iter().position(|a| *a == "encrypt.format=luks").unwrap();
        let compat = strs.iter().position(|a| *a == "compat=1.1").unwrap();
        assert!(key_secret < iter_time);
        assert!(iter_time < envelope);
        assert!(envelope < compat);
        assert!(strs.contains(&"encrypt.cipher-alg=aes-256"));
        assert!(strs.contains(&"encrypt.cipher-mode=xts"));
        assert!(strs.contains(&"encrypt.ivgen-alg=plain64"));
        assert!(strs.contains(&"encrypt.ivgen-hash-alg=sha256"));
        assert!(strs.contains(&"encrypt.hash-alg=sha256"));
    }

    #[test]
    fn test_render_create_encrypted_non_qcow2_fails() {
        let img = ImageDescriptor::new_encrypted("enc.raw", ImageFormat::Raw, "secret1", GIB)
            .unwrap_err()
            .into_descriptor();
        let err = render_create(&img).unwrap_err();
        assert!(matches!(err, ImageError::Configuration(_)));
    }

    #[test]
    fn test_render_snapshot_plain() {
        let img = ImageDescriptor::new("test.qcow2", ImageFormat::Qcow2, GIB);
        let create = render_snapshot(&img, SnapshotOp::Create, "snap1").unwrap();
        assert_eq!(as_strs(&create), vec!["snapshot", "-c", "snap1", "test.qcow2"]);

        let restore = render_snapshot(&img, SnapshotOp::Restore, "snap1").unwrap();
        assert_eq!(as_strs(&restore), vec!["snapshot", "-a", "snap1", "test.qcow2"]);

        let delete = render_snapshot(&img, SnapshotOp::Delete, "snap1").unwrap();
        assert_eq!(as_strs(&delete), vec!["snapshot", "-d", "snap1", "test.qcow2"]);
    }

    #[test]
    fn test_render_snapshot_encrypted() {
        let img =
            ImageDescriptor::new_encrypted("enc.qcow2", ImageFormat::Qcow2, "secret1", GIB)
                .unwrap();
        let args = render_snapshot(&img, SnapshotOp::Create, "snap1").unwrap();
        assert_eq!(
            as_strs(&args),
            vec![
                "snapshot",
                "--object",
                "secret,id=sec0,data=secret1",
                "--image-opts",
                "-c",
                "snap1",
                "encrypt.format=luks,encrypt.key-secret=sec0,file.filename=enc.qcow2",
            ]
        );
    }

    #[test]
    fn test_render_rebase() {
        let img = ImageDescriptor::new("delta.qcow2", ImageFormat::Qcow2, GIB);
        let args = render_rebase(&img, Path::new("new-base.qcow2")).unwrap();
        assert_eq!(
            as_strs(&args),
            vec!["rebase", "-b", "new-base.qcow2", "delta.qcow2"]
        );
    }

    #[test]
    fn test_render_info() {
        let args = render_info(Path::new("test.qcow2")).unwrap();
        assert_eq!(as_strs(&args), vec!["info", "--output=json", "test.qcow2"]);
    }

    #[test]
    fn test_parse_info_basic() {
        let payload = br#"{
            "filename": "test.qcow2",
            "format": "qcow2",
            "virtual-size": 10737418240,
            "cluster-size": 65536,
            "snapshots": [
                {
                    "id": "1",
                    "name": "fresh-install",
                    "date-sec": 1705312245,
                    "date-nsec": 123456789,
                    "vm-clock-sec": 330,
                    "vm-clock-nsec": 123000000
                },
                {
                    "id": "2",
                    "name": "after-drivers",
                    "date-sec": 1705412400,
                    "date-nsec": 456789012,
                    "vm-clock-sec": 945,
                    "vm-clock-nsec": 456000000
                }
            ]
        }"#;

        let info = parse_info(payload, None).unwrap();
        assert_eq!(info.format, ImageFormat::Qcow2);
        assert_eq!(info.virtual_size, 10737418240);
        assert!(!info.encrypted);
        assert_eq!(info.cluster_size, Some(65536));
        assert_eq!(info.snapshots.len(), 2);
        assert_eq!(info.snapshots[0].id, 1);
        assert_eq!(info.snapshots[0].name, "fresh-install");
        assert_eq!(info.snapshots[0].created.timestamp(), 1705312245);
        assert_eq!(info.snapshots[1].vm_clock.timestamp(), 945);
    }

    #[test]
    fn test_parse_info_known_secret_forces_encrypted() {
        let payload = br#"{"format": "qcow2", "virtual-size": 1024, "encrypted": false}"#;

        let secret = SecretKey::new("secret1");
        let info = parse_info(payload, Some(&secret)).unwrap();
        assert!(info.encrypted);

        // Without a secret the reported value is taken verbatim.
        let info = parse_info(payload, None).unwrap();
        assert!(!info.encrypted);

        // An empty secret is no evidence either.
        let empty = SecretKey::new("");
        let info = parse_info(payload, Some(&empty)).unwrap();
        assert!(!info.encrypted);
    }

    #[test]
    fn test_parse_info_absent_encrypted_means_false() {
        let payload = br#"{"format": "raw", "virtual-size": 512}"#;
        let info = parse_info(payload, None).unwrap();
        assert!(!info.encrypted);
    }

    #[test]
    fn test_parse_info_drops_non_numeric_snapshot_ids() {
        let payload = br#"{
            "format": "qcow2",
            "virtual-size": 1024,
            "snapshots": [
                {"id": "1", "name": "first", "date-sec": 1, "date-nsec": 0,
                 "vm-clock-sec": 0, "vm-clock-nsec": 0},
                {"id": "bogus", "name": "second", "date-sec": 2, "date-nsec": 0,
                 "vm-clock-sec": 0, "vm-clock-nsec": 0},
                {"id": "3", "name": "third", "date-sec": 3, "date-nsec": 0,
                 "vm-clock-sec": 0, "vm-clock-nsec": 0}
            ]
        }"#;

        let info = parse_info(payload, None).unwrap();
        let names: Vec<&str> = info.snapshots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "third"]);
        assert_eq!(info.snapshots[1].id, 3);
    }

    #[test]
    fn test_parse_info_rejects_garbage() {
        let err = parse_info(b"qemu-img: command not found", None).unwrap_err();
        assert!(matches!(err, ImageError::MalformedOutput(_)));
    }

    #[test]
    fn test_parse_info_rejects_unknown_format() {
        let payload = br#"{"format": "vmdk3", "virtual-size": 1024}"#;
        let err = parse_info(payload, None).unwrap_err();
        assert!(matches!(err, ImageError::MalformedOutput(_)));
    }

    #[test]
    fn test_parse_info_backing_file() {
        let payload = br#"{
            "format": "qcow2",
            "virtual-size": 1024,
            "backing-filename": "base.qcow2"
        }"#;
        let info = parse_info(payload, None).unwrap();
        assert_eq!(info.backing_file, Some("base.qcow2".into()));
    }
}
