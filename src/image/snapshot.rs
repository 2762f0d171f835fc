//! Image snapshot records
//!
//! Snapshots are created, destroyed, and enumerated entirely by qemu-img;
//! this module only models what the tool reports. IDs are assigned by the
//! tool and are opaque here: the name is the stable lookup key, even though
//! qemu-img does not enforce name uniqueness.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A snapshot as reported by `qemu-img info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Numeric ID assigned by qemu-img.
    pub id: u32,
    /// Caller-chosen name.
    pub name: String,
    /// Wall-clock creation time.
    pub created: DateTime<Utc>,
    /// The guest's internal clock at snapshot time. Distinct from the
    /// creation time: this is how long the guest had been running.
    pub vm_clock: DateTime<Utc>,
}

impl Snapshot {
    /// Guest clock rendered as `HH:MM:SS.mmm` elapsed time.
    pub fn vm_clock_display(&self) -> String {
        let total_secs = self.vm_clock.timestamp() as f64
            + f64::from(self.vm_clock.timestamp_subsec_nanos()) / 1_000_000_000.0;
        let hours = (total_secs / 3600.0) as u64;
        let minutes = ((total_secs % 3600.0) / 60.0) as u64;
        let seconds = total_secs % 60.0;
        format!("{:02}:{:02}:{:06.3}", hours, minutes, seconds)
    }
}

/// Find a snapshot by name. First match wins: qemu-img does not guarantee
/// unique names, so on a collision the earliest entry in list order is
/// returned.
pub fn find_by_name<'a>(snapshots: &'a [Snapshot], name: &str) -> Option<&'a Snapshot> {
    snapshots.iter().find(|snap| snap.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u32, name: &str) -> Snapshot {
        Snapshot {
            id,
            name: name.to_string(),
            created: DateTime::from_timestamp(1_705_312_245, 0).unwrap(),
            vm_clock: DateTime::from_timestamp(330, 123_000_000).unwrap(),
        }
    }

    #[test]
    fn test_find_by_name() {
        let snapshots = vec![snapshot(1, "base"), snapshot(2, "patched")];
        assert_eq!(find_by_name(&snapshots, "patched").unwrap().id, 2);
        assert!(find_by_name(&snapshots, "missing").is_none());
    }

    #[test]
    fn test_find_by_name_duplicate_returns_first() {
        let snapshots = vec![snapshot(4, "nightly"), snapshot(7, "nightly")];
        assert_eq!(find_by_name(&snapshots, "nightly").unwrap().id, 4);
    }

    #[test]
    fn test_vm_clock_display() {
        let snap = snapshot(1, "base");
        assert_eq!(snap.vm_clock_display(), "00:05:30.123");
    }
}
