use std::cell::Cell;

/// The two mutual-exclusion flags guarding the single camera resource for
/// the lifetime of a scan session: one for the periodic detection loop, one
/// for user/auto-driven captures. `Cell` keeps the whole gate `!Sync`, which
/// pins it to the cooperative single-threaded model it assumes.
#[derive(Debug, Default)]
pub struct CaptureGate {
    detecting: Cell<bool>,
    capturing: Cell<bool>,
}

/// Clears its flag on drop, so an early `?` return or panic can never leave
/// a stuck lock behind.
#[derive(Debug)]
pub struct GateGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl CaptureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detecting(&self) -> bool {
        self.detecting.get()
    }

    pub fn capturing(&self) -> bool {
        self.capturing.get()
    }

    pub fn idle(&self) -> bool {
        !self.detecting.get() && !self.capturing.get()
    }

    /// A detection cycle may start only when nothing at all is mid-flight.
    pub fn try_begin_detection(&self) -> Option<GateGuard<'_>> {
        if self.detecting.get() || self.capturing.get() {
            return None;
        }
        self.detecting.set(true);
        Some(GateGuard { flag: &self.detecting })
    }

    /// A capture may start while a detection is still draining; the caller
    /// is expected to poll `detecting()` before touching the camera.
    pub fn try_begin_capture(&self) -> Option<GateGuard<'_>> {
        if self.capturing.get() {
            return None;
        }
        self.capturing.set(true);
        Some(GateGuard { flag: &self.capturing })
    }

    /// Session teardown. Any live guard still clears its own flag on drop.
    pub fn reset(&self) {
        self.detecting.set(false);
        self.capturing.set(false);
    }
}
