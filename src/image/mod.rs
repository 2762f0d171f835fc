pub mod descriptor;
pub mod format;
pub mod snapshot;

pub use descriptor::{
    Encryption, ImageDescriptor, SecretKey, DEFAULT_CLUSTER_SIZE_KB, DEFAULT_REFCOUNT_BITS,
};
pub use format::{
    CipherAlgorithm, CipherFormat, CipherMode, CompatLevel, HashAlgorithm, ImageFormat,
    IvGenAlgorithm, Preallocation,
};
pub use snapshot::{find_by_name, Snapshot};
