//! Format and option vocabularies for qemu-img
//!
//! Closed enumerations for the image formats and creation options this layer
//! renders. Values map one-to-one onto the strings qemu-img expects.

use clap::ValueEnum;
use serde::Serialize;
use std::fmt;

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Cloop,
    Cow,
    Qcow,
    Qcow2,
    Vdmk,
    Vdi,
    Vhdx,
    Vpc,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Cloop => "cloop",
            Self::Cow => "cow",
            Self::Qcow => "qcow",
            Self::Qcow2 => "qcow2",
            Self::Vdmk => "vdmk",
            Self::Vdi => "vdi",
            Self::Vhdx => "vhdx",
            Self::Vpc => "vpc",
        }
    }

    /// Parse a format name as reported by `qemu-img info`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "raw" => Some(Self::Raw),
            "cloop" => Some(Self::Cloop),
            "cow" => Some(Self::Cow),
            "qcow" => Some(Self::Qcow),
            "qcow2" => Some(Self::Qcow2),
            "vdmk" => Some(Self::Vdmk),
            "vdi" => Some(Self::Vdi),
            "vhdx" => Some(Self::Vhdx),
            "vpc" => Some(Self::Vpc),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// qcow2 compatibility level, tied to the format major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatLevel {
    /// Original qcow2 layout (`compat=0.10`)
    Qcow2,
    /// qcow2 version 3 layout (`compat=1.1`)
    Qcow3,
}

impl CompatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qcow2 => "0.10",
            Self::Qcow3 => "1.1",
        }
    }
}

impl fmt::Display for CompatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much of an image's storage is reserved at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preallocation {
    /// Allocate metadata only; data clusters grow on demand.
    Metadata,
    /// Reserve space with fallocate without writing it.
    Falloc,
    /// Write out the full image size up front.
    Full,
}

impl Preallocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Falloc => "falloc",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for Preallocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cipher algorithm for at-rest encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes128,
    Aes192,
    Aes256,
}

impl CipherAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes128 => "aes-128",
            Self::Aes192 => "aes-192",
            Self::Aes256 => "aes-256",
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block cipher mode of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Cbc,
    Xts,
}

impl CipherMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cbc => "cbc",
            Self::Xts => "xts",
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk encryption envelope format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherFormat {
    Luks,
    Aes,
}

impl CipherFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Luks => "luks",
            Self::Aes => "aes",
        }
    }
}

impl fmt::Display for CipherFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hash algorithm used for key derivation and IV generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Initialization-vector generation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvGenAlgorithm {
    Plain,
    Plain64,
    Essiv,
}

impl IvGenAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Plain64 => "plain64",
            Self::Essiv => "essiv",
        }
    }
}

impl fmt::Display for IvGenAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_round_trip() {
        for fmt in [
            ImageFormat::Raw,
            ImageFormat::Cloop,
            ImageFormat::Cow,
            ImageFormat::Qcow,
            ImageFormat::Qcow2,
            ImageFormat::Vdmk,
            ImageFormat::Vdi,
            ImageFormat::Vhdx,
            ImageFormat::Vpc,
        ] {
            assert_eq!(ImageFormat::from_name(fmt.as_str()), Some(fmt));
        }
        assert_eq!(ImageFormat::from_name("luks"), None);
    }

    #[test]
    fn test_compat_levels() {
        assert_eq!(CompatLevel::Qcow2.as_str(), "0.10");
        assert_eq!(CompatLevel::Qcow3.as_str(), "1.1");
    }
}
