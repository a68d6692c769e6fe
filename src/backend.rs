//! Accelerated-backend probe.
//!
//! Detection runs at most once per process (until `invalidate`), and the result is cached.
//! Engines consult it once per `compute()` through a `BackendProbe`, which tests replace with
//! `BackendProbe::Fixed(..)` instead of relying on environment detection.

use parking_lot::Mutex;

static DETECTED: Mutex<Option<bool>> = parking_lot::const_mutex(None);
static OVERRIDE: Mutex<Option<bool>> = parking_lot::const_mutex(None);

/// Whether the accelerated kernel backend was compiled into this build.
pub const fn compiled() -> bool {
    cfg!(feature = "burn")
}

/// Is the accelerated kernel backend usable in this process?
///
/// Returns the override if one is set; otherwise detects once and caches.
pub fn accelerated_backend_available() -> bool {
    if let Some(forced) = *OVERRIDE.lock() {
        return forced && compiled();
    }
    let mut cached = DETECTED.lock();
    *cached.get_or_insert_with(detect)
}

/// Force the process-wide probe result (`None` restores detection).
pub fn set_override(value: Option<bool>) {
    *OVERRIDE.lock() = value;
}

/// Drop the cached detection result; the next query re-detects.
pub fn invalidate() {
    *DETECTED.lock() = None;
}

#[cfg(feature = "burn")]
fn detect() -> bool {
    let ok = std::panic::catch_unwind(crate::burn_kernel::smoke_test).unwrap_or(false);
    tracing::debug!(ok, "probed accelerated kernel backend");
    ok
}

#[cfg(not(feature = "burn"))]
fn detect() -> bool {
    false
}

/// How an engine learns whether the accelerated backend is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendProbe {
    /// Ask the process-wide cached probe.
    #[default]
    Detect,
    /// Injected result. `Fixed(true)` still reports unavailable when the backend is not compiled.
    Fixed(bool),
}

impl BackendProbe {
    pub fn available(self) -> bool {
        match self {
            BackendProbe::Detect => accelerated_backend_available(),
            BackendProbe::Fixed(v) => v && compiled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_probe_is_bounded_by_compilation() {
        assert!(!BackendProbe::Fixed(false).available());
        assert_eq!(BackendProbe::Fixed(true).available(), compiled());
    }

    #[test]
    fn detection_is_cached_and_invalidatable() {
        let first = accelerated_backend_available();
        assert_eq!(accelerated_backend_available(), first);
        invalidate();
        assert_eq!(accelerated_backend_available(), first);
        #[cfg(not(feature = "burn"))]
        assert!(!first);
    }
}
