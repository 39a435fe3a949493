//! Shared Acquisition Context
//!
//! Everything that crosses the boundary between the acquisition worker and the
//! rest of the process lives in one [`AcquisitionContext`]:
//!
//! - `requested`: a run was asked for; a second request is refused
//! - `running`: the worker task is active
//! - `cancel`: cooperative stop request, polled by the worker
//! - `hardware_in_use`: process-wide lock shared with autofocus
//! - progress counters, written only by the worker
//!
//! All fields are atomics, so the context is shared as an `Arc` without a mutex
//! and status readers never block the worker.
//!
//! # RAII
//!
//! [`RequestGuard`] and [`HardwareLock`] clear their flags when dropped, on
//! every exit path including panics inside the worker.

use super::state::{transition, SequencerEvent, SequencerState};
use crate::error::{SpimError, ValidationError};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

// =============================================================================
// Acquisition Context
// =============================================================================

/// Atomic flags and counters for one sequencer.
#[derive(Debug, Default)]
pub struct AcquisitionContext {
    requested: AtomicBool,
    running: AtomicBool,
    cancel: AtomicBool,
    hardware_in_use: Arc<AtomicBool>,
    timepoints_done: AtomicU32,
    timepoints_total: AtomicU32,
    state: AtomicU8,
}

impl AcquisitionContext {
    /// Fresh context with its own hardware flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing hardware lock, e.g. with an autofocus service.
    pub fn with_hardware_flag(hardware_in_use: Arc<AtomicBool>) -> Self {
        Self {
            hardware_in_use,
            ..Self::default()
        }
    }

    /// The process-wide hardware flag, for collaborators that must honour it.
    pub fn hardware_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.hardware_in_use)
    }

    /// Claim the single acquisition slot.
    ///
    /// Fails with [`SpimError::AlreadyRequested`] if another run holds it.
    pub fn request(&self) -> Result<RequestGuard<'_>, SpimError> {
        if self
            .requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SpimError::AlreadyRequested);
        }
        Ok(RequestGuard { ctx: self })
    }

    /// A run holds the acquisition slot.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The worker is past arming and acquiring.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Drop a cancel left over from while the sequencer was idle.
    ///
    /// Does nothing while a run holds the slot, so a stop aimed at that run
    /// survives.
    pub(crate) fn clear_idle_cancel(&self) {
        if !self.is_requested() {
            self.cancel.store(false, Ordering::SeqCst);
        }
    }

    /// Ask the worker to stop at its next check point.
    pub fn request_cancel(&self) {
        if self.is_requested() {
            tracing::info!("Acquisition cancel requested");
        }
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// A stop has been asked for and not yet consumed by a finished run.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Someone holds the hardware lock.
    pub fn hardware_in_use(&self) -> bool {
        self.hardware_in_use.load(Ordering::SeqCst)
    }

    /// Take the hardware lock, or report who holds it.
    pub fn lock_hardware(&self) -> Result<HardwareLock, ValidationError> {
        HardwareLock::acquire(Arc::clone(&self.hardware_in_use))
    }

    /// Current sequencer state.
    pub fn state(&self) -> SequencerState {
        SequencerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Advance the state machine. Only the worker calls this.
    pub(crate) fn apply(&self, event: SequencerEvent) -> Result<SequencerState, SpimError> {
        let next = transition(self.state(), event)?;
        self.state.store(next.as_u8(), Ordering::SeqCst);
        tracing::debug!(state = %next, ?event, "sequencer transition");
        Ok(next)
    }

    /// Timepoints completed by the current or last run.
    pub fn timepoints_done(&self) -> u32 {
        self.timepoints_done.load(Ordering::SeqCst)
    }

    /// Timepoints planned for the current or last run.
    pub fn timepoints_total(&self) -> u32 {
        self.timepoints_total.load(Ordering::SeqCst)
    }

    pub(crate) fn set_timepoints_done(&self, n: u32) {
        self.timepoints_done.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_timepoints_total(&self, n: u32) {
        self.timepoints_total.store(n, Ordering::SeqCst);
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Holds the acquisition slot.
///
/// On drop the cancel flag is cleared, then the running flag and the slot are
/// released.
#[derive(Debug)]
pub struct RequestGuard<'a> {
    ctx: &'a AcquisitionContext,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.ctx.cancel.store(false, Ordering::SeqCst);
        self.ctx.running.store(false, Ordering::SeqCst);
        self.ctx.requested.store(false, Ordering::SeqCst);
    }
}

/// Exclusive claim on the microscope hardware.
///
/// Released when dropped.
#[derive(Debug)]
pub struct HardwareLock {
    flag: Option<Arc<AtomicBool>>,
}

impl HardwareLock {
    /// Take `flag`, failing with [`ValidationError::HardwareInUse`] if it is set.
    pub fn acquire(flag: Arc<AtomicBool>) -> Result<Self, ValidationError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ValidationError::HardwareInUse)?;
        Ok(Self { flag: Some(flag) })
    }

    /// Release now rather than at end of scope.
    pub fn release(mut self) {
        self.unlock();
    }

    /// Still holding the flag.
    pub fn is_held(&self) -> bool {
        self.flag.is_some()
    }

    fn unlock(&mut self) {
        if let Some(flag) = self.flag.take() {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for HardwareLock {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("Hardware lock released during panic");
        }
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_request_refused() {
        let ctx = AcquisitionContext::new();
        let guard = ctx.request().unwrap();
        assert!(ctx.is_requested());
        assert!(matches!(ctx.request(), Err(SpimError::AlreadyRequested)));
        drop(guard);
        assert!(!ctx.is_requested());
        assert!(ctx.request().is_ok());
    }

    #[test]
    fn test_request_guard_clears_running() {
        let ctx = AcquisitionContext::new();
        {
            let _guard = ctx.request().unwrap();
            ctx.set_running(true);
            assert!(ctx.is_running());
        }
        assert!(!ctx.is_running());
    }

    #[test]
    fn test_claiming_the_slot_keeps_a_pending_cancel() {
        let ctx = AcquisitionContext::new();
        ctx.request_cancel();
        let guard = ctx.request().unwrap();
        assert!(ctx.is_cancel_requested());

        drop(guard);
        assert!(!ctx.is_cancel_requested());
    }

    #[test]
    fn test_idle_cancel_cleared_only_when_idle() {
        let ctx = AcquisitionContext::new();
        ctx.request_cancel();
        ctx.clear_idle_cancel();
        assert!(!ctx.is_cancel_requested());

        let _guard = ctx.request().unwrap();
        ctx.request_cancel();
        ctx.clear_idle_cancel();
        assert!(ctx.is_cancel_requested());
    }

    #[test]
    fn test_hardware_lock_exclusive() {
        let ctx = AcquisitionContext::new();
        let lock = ctx.lock_hardware().unwrap();
        assert!(lock.is_held());
        assert!(ctx.hardware_in_use());
        assert_eq!(
            ctx.lock_hardware().unwrap_err(),
            ValidationError::HardwareInUse
        );
        drop(lock);
        assert!(!ctx.hardware_in_use());
    }

    #[test]
    fn test_hardware_flag_shared_with_other_users() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = AcquisitionContext::with_hardware_flag(Arc::clone(&flag));
        let autofocus_lock = HardwareLock::acquire(Arc::clone(&flag)).unwrap();
        assert!(ctx.lock_hardware().is_err());
        autofocus_lock.release();
        assert!(ctx.lock_hardware().is_ok());
    }

    #[test]
    fn test_hardware_lock_released_on_panic() {
        let ctx = Arc::new(AcquisitionContext::new());
        let worker_ctx = Arc::clone(&ctx);
        let result = std::thread::spawn(move || {
            let _lock = worker_ctx.lock_hardware().unwrap();
            panic!("worker failed");
        })
        .join();
        assert!(result.is_err());
        assert!(!ctx.hardware_in_use());
    }

    #[test]
    fn test_apply_tracks_state() {
        let ctx = AcquisitionContext::new();
        assert_eq!(ctx.state(), SequencerState::Idle);
        ctx.apply(SequencerEvent::Arm).unwrap();
        assert_eq!(ctx.state(), SequencerState::Armed);
        assert!(ctx.apply(SequencerEvent::Finish).is_err());
        assert_eq!(ctx.state(), SequencerState::Armed);
    }
}
