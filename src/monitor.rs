//! Per-worker liveness beacons for the watchdog.
//!
//! Each worker stamps its beacon before dispatching a message and clears it
//! after the handler returns. The watchdog thread scans all beacons on a
//! fixed interval; a beacon whose version has not moved since the previous
//! scan, while a destination is still recorded, points at a handler that
//! never returned.

use crate::handle::Handle;
use core::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
pub(crate) struct WorkerMonitor {
    version: AtomicU32,
    check_version: AtomicU32,
    source: AtomicU32,
    destination: AtomicU32,
}

impl WorkerMonitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stamp the beacon for one dispatch. Called with the real addresses
    /// before the handler runs and with invalid handles once it returns.
    pub(crate) fn trigger(&self, source: Handle, destination: Handle) {
        self.source.store(source.raw(), Ordering::Relaxed);
        self.destination.store(destination.raw(), Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// One watchdog scan step.
    ///
    /// Returns the stamped `(source, destination)` pair when the worker has
    /// not finished a dispatch since the last scan. While the handler stays
    /// stuck the same pair is reported on every scan.
    pub(crate) fn check(&self) -> Option<(Handle, Handle)> {
        let version = self.version.load(Ordering::Acquire);

        if version == self.check_version.load(Ordering::Relaxed) {
            let destination = Handle::from_raw(self.destination.load(Ordering::Relaxed));

            if destination.is_valid() {
                let source = Handle::from_raw(self.source.load(Ordering::Relaxed));

                return Some((source, destination));
            }
        } else {
            self.check_version.store(version, Ordering::Relaxed);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_worker_is_never_suspected() {
        let monitor = WorkerMonitor::new();

        assert_eq!(monitor.check(), None);
        assert_eq!(monitor.check(), None);
    }

    #[test]
    fn finished_dispatch_is_not_suspected() {
        let monitor = WorkerMonitor::new();
        let a = Handle::from_raw(1);
        let b = Handle::from_raw(2);

        monitor.trigger(a, b);
        monitor.trigger(Handle::INVALID, Handle::INVALID);

        // First scan adopts the new version, second sees a cleared beacon.
        assert_eq!(monitor.check(), None);
        assert_eq!(monitor.check(), None);
    }

    #[test]
    fn stuck_dispatch_is_reported_each_scan() {
        let monitor = WorkerMonitor::new();
        let a = Handle::from_raw(1);
        let b = Handle::from_raw(2);

        monitor.trigger(a, b);

        // Scan one records the version, scan two sees it unchanged with a
        // destination still stamped.
        assert_eq!(monitor.check(), None);
        assert_eq!(monitor.check(), Some((a, b)));
        assert_eq!(monitor.check(), Some((a, b)));

        monitor.trigger(Handle::INVALID, Handle::INVALID);
        assert_eq!(monitor.check(), None);
    }
}
