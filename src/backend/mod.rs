//! Backend abstraction: the OS-facing half of the reactor.
//!
//! The driver owns every callback record; a backend only tracks which ids
//! are armed against which OS resources. Each dispatch reports the ids that
//! became ready, ordered ready streams first, due timers second, delivered
//! signals last; the driver re-checks liveness before invoking each one, so
//! a record removed earlier in the same pass is skipped.

pub(crate) mod poll;
pub(crate) mod select;

use std::os::unix::io::RawFd;

use crate::callback::CallbackId;
use crate::error::LoopError;

/// Instruction handed to a backend during an activation pass.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Activation {
    Timer { id: CallbackId, expiration: f64 },
    Readable { id: CallbackId, fd: RawFd },
    Writable { id: CallbackId, fd: RawFd },
    Signal { id: CallbackId, signo: i32 },
}

/// One pluggable I/O multiplexer.
pub(crate) trait Backend: Send {
    /// Arms a batch of records, in the driver's insertion order.
    fn activate(&mut self, batch: &[Activation]) -> Result<(), LoopError>;

    /// Disarms a single record; a no-op when it was never armed.
    fn deactivate(&mut self, activation: &Activation);

    /// Waits for readiness (indefinitely, until the next timer, or not at
    /// all, depending on `blocking`) and reports the ready callback ids in
    /// invocation order.
    fn dispatch(&mut self, blocking: bool) -> Result<Vec<CallbackId>, LoopError>;

    /// Current monotonic time in fractional seconds.
    fn now(&self) -> f64;

    /// The underlying OS multiplexer handle, when the backend has one.
    fn handle(&self) -> Option<RawFd>;

    /// Whether `on_signal` registrations are available.
    fn supports_signals(&self) -> bool;

    /// Called when `run` enters; backends with process-global resources arm
    /// them here. A failing enter must leave no residue: `run` bails out
    /// without calling [`on_run_exit`](Backend::on_run_exit), so the
    /// backend itself restores whatever the attempt displaced.
    fn on_run_enter(&mut self) -> Result<(), LoopError> {
        Ok(())
    }

    /// Called when `run` exits.
    fn on_run_exit(&mut self) {}
}
