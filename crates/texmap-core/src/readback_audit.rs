//! Feature-gated device→host readback audit.
//!
//! Every readback is counted.  Code that expects a stretch of work to stay
//! on the device opens a region with [`device_only`] or
//! [`device_only_strict`]; a readback recorded on the same thread while the
//! region is open is a violation.  Lenient regions log and count violations,
//! strict ones also fail a debug assertion.  Mappers never open regions
//! themselves, so a readback that was asked for is never flagged.
//!
//! Without the `audit-readback` feature every helper is a no-op.

use std::marker::PhantomData;

#[cfg(feature = "audit-readback")]
use std::cell::Cell;
#[cfg(feature = "audit-readback")]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "audit-readback")]
static READBACKS: AtomicU64 = AtomicU64::new(0);
#[cfg(feature = "audit-readback")]
static VIOLATIONS: AtomicU64 = AtomicU64::new(0);

#[cfg(feature = "audit-readback")]
#[derive(Clone, Copy)]
struct Region {
    name: &'static str,
    strict: bool,
    violations: u64,
}

#[cfg(feature = "audit-readback")]
thread_local! {
    static REGION: Cell<Option<Region>> = const { Cell::new(None) };
}

/// An open device-only region.  Closing it restores the enclosing region,
/// which inherits the violations seen inside.
///
/// Regions are per thread, so the guard is `!Send`.
#[must_use = "the region closes when the guard drops"]
pub struct DeviceOnlyRegion {
    #[cfg(feature = "audit-readback")]
    enclosing: Option<Region>,
    _thread_bound: PhantomData<*const ()>,
}

impl DeviceOnlyRegion {
    /// Violations recorded in this region and its nested regions so far.
    pub fn violations(&self) -> u64 {
        #[cfg(feature = "audit-readback")]
        {
            REGION.get().map_or(0, |r| r.violations)
        }

        #[cfg(not(feature = "audit-readback"))]
        {
            0
        }
    }
}

impl Drop for DeviceOnlyRegion {
    fn drop(&mut self) {
        #[cfg(feature = "audit-readback")]
        {
            let inner = REGION.get().map_or(0, |r| r.violations);
            REGION.set(self.enclosing.map(|mut outer| {
                outer.violations += inner;
                outer
            }));
        }
    }
}

fn open(name: &'static str, strict: bool) -> DeviceOnlyRegion {
    #[cfg(feature = "audit-readback")]
    {
        let enclosing = REGION.get();
        // A region nested in a strict one stays strict.
        let strict = strict || enclosing.is_some_and(|r| r.strict);
        REGION.set(Some(Region {
            name,
            strict,
            violations: 0,
        }));
        DeviceOnlyRegion {
            enclosing,
            _thread_bound: PhantomData,
        }
    }

    #[cfg(not(feature = "audit-readback"))]
    {
        let _ = (name, strict);
        DeviceOnlyRegion {
            _thread_bound: PhantomData,
        }
    }
}

/// Mark the current thread as device-only until the guard drops.
/// Readbacks inside are logged and counted as violations.
pub fn device_only(name: &'static str) -> DeviceOnlyRegion {
    open(name, false)
}

/// Like [`device_only`], but a violation also fails a debug assertion.
pub fn device_only_strict(name: &'static str) -> DeviceOnlyRegion {
    open(name, true)
}

/// Name of the innermost open region on this thread.
pub fn current_region() -> Option<&'static str> {
    #[cfg(feature = "audit-readback")]
    {
        REGION.get().map(|r| r.name)
    }

    #[cfg(not(feature = "audit-readback"))]
    {
        None
    }
}

/// Readbacks recorded by this process (always 0 without the feature).
pub fn readback_count() -> u64 {
    #[cfg(feature = "audit-readback")]
    {
        READBACKS.load(Ordering::Relaxed)
    }

    #[cfg(not(feature = "audit-readback"))]
    {
        0
    }
}

/// Readbacks recorded inside device-only regions, on any thread.
pub fn violation_count() -> u64 {
    #[cfg(feature = "audit-readback")]
    {
        VIOLATIONS.load(Ordering::Relaxed)
    }

    #[cfg(not(feature = "audit-readback"))]
    {
        0
    }
}

/// Record a device→host readback of `bytes` bytes at `site`.
pub fn record_readback(site: &str, bytes: usize) {
    #[cfg(feature = "audit-readback")]
    {
        READBACKS.fetch_add(1, Ordering::Relaxed);
        let Some(mut region) = REGION.get() else {
            return;
        };
        region.violations += 1;
        REGION.set(Some(region));
        VIOLATIONS.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(site, bytes, region = region.name, "readback inside device-only region");
        debug_assert!(
            !region.strict,
            "readback at `{site}` inside device-only region `{}`: {bytes} bytes",
            region.name
        );
    }

    #[cfg(not(feature = "audit-readback"))]
    {
        let _ = (site, bytes);
    }
}
