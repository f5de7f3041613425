//! Staging-volume disk accounting
//!
//! One [`DiskTracker`] exists per operator process, created when the staging
//! volume becomes visible. It outlives individual reconcile passes; download
//! admission debits it and failed downloads credit it back. Successful
//! downloads keep their bytes reserved until the external cleanup reclaims
//! staged packages and a re-sync observes the freed space.

use std::path::Path;
use std::sync::Mutex;

use tracing::debug;

use crate::Error;

/// Free-byte accounting for the staging volume
#[derive(Debug)]
pub struct DiskTracker {
    available: Mutex<u64>,
}

impl DiskTracker {
    /// Tracker seeded from the filesystem holding `path`
    pub fn probe(path: &Path) -> Result<Self, Error> {
        let available = available_bytes(path)?;
        debug!(path = %path.display(), available, "Probed staging volume capacity");
        Ok(Self {
            available: Mutex::new(available),
        })
    }

    /// Tracker with a fixed capacity; used by tests and dry runs
    pub fn with_capacity(bytes: u64) -> Self {
        Self {
            available: Mutex::new(bytes),
        }
    }

    /// Bytes currently unreserved
    pub fn available(&self) -> u64 {
        *self.available.lock().expect("disk tracker poisoned")
    }

    /// Reserve `bytes`, failing without side effects when the volume cannot
    /// fit them
    ///
    /// The admission rule is strict: a reservation that would leave zero
    /// bytes free is refused.
    pub fn reserve(&self, bytes: u64) -> Result<(), Error> {
        let mut available = self.available.lock().expect("disk tracker poisoned");
        if *available <= bytes {
            return Err(Error::InsufficientDiskSpace {
                needed: bytes,
                available: *available,
            });
        }
        *available -= bytes;
        Ok(())
    }

    /// Return `bytes` to the pool
    pub fn release(&self, bytes: u64) {
        let mut available = self.available.lock().expect("disk tracker poisoned");
        *available = available.saturating_add(bytes);
    }

    /// Replace the accounted capacity with a fresh filesystem measurement
    pub fn resync(&self, path: &Path) -> Result<(), Error> {
        let measured = available_bytes(path)?;
        let mut available = self.available.lock().expect("disk tracker poisoned");
        debug!(
            path = %path.display(),
            accounted = *available,
            measured,
            "Re-synced staging volume capacity"
        );
        *available = measured;
        Ok(())
    }
}

/// Free bytes on the filesystem holding `path`
fn available_bytes(path: &Path) -> Result<u64, Error> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|errno| Error::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_release_restores_capacity_exactly() {
        let tracker = DiskTracker::with_capacity(1_000);
        tracker.reserve(300).unwrap();
        assert_eq!(tracker.available(), 700);
        tracker.reserve(300).unwrap();
        assert_eq!(tracker.available(), 400);
        tracker.release(300);
        tracker.release(300);
        assert_eq!(tracker.available(), 1_000);
    }

    #[test]
    fn reserve_refuses_to_fill_the_volume() {
        let tracker = DiskTracker::with_capacity(100);
        // Equal to capacity is refused, not just larger.
        assert!(matches!(
            tracker.reserve(100),
            Err(Error::InsufficientDiskSpace { .. })
        ));
        assert!(tracker.reserve(150).is_err());
        // A failed reservation must not debit anything.
        assert_eq!(tracker.available(), 100);
        tracker.reserve(99).unwrap();
        assert_eq!(tracker.available(), 1);
    }

    #[test]
    fn release_saturates_instead_of_wrapping() {
        let tracker = DiskTracker::with_capacity(u64::MAX - 5);
        tracker.release(100);
        assert_eq!(tracker.available(), u64::MAX);
    }

    #[test]
    fn probe_reads_a_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = DiskTracker::probe(dir.path()).unwrap();
        assert!(tracker.available() > 0);

        // Re-sync against the same path stays in the same ballpark.
        tracker.reserve(1).unwrap();
        tracker.resync(dir.path()).unwrap();
        assert!(tracker.available() > 0);
    }
}
