//! Parking a linear flow against the loop and resuming it later.
//!
//! A [`Suspension`] couples one execution context (a [`Fiber`] or the
//! thread that owns the loop) to the driver. `suspend` parks the context
//! and hands control to the scheduler; a later callback calls `resume` or
//! `throw`, which queues a microtask that wakes the context on the
//! scheduler's next drain. Resumption is therefore never synchronous with
//! the resume call.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::driver::Driver;
use crate::error::{BoxError, LoopError};
use crate::fiber::{self, Fiber};

struct SusState<T> {
    /// The bound context is parked inside `suspend`.
    waiting: bool,
    /// Outcome from `resume`/`throw`, not yet released to the suspender.
    outcome: Option<Result<T, BoxError>>,
    /// The outcome has been released and may be consumed.
    delivered: bool,
}

struct SuspensionInner<T> {
    state: Mutex<SusState<T>>,
    resolved: Condvar,
    /// The bound fiber; `None` when bound to the loop-owning thread.
    fiber: Option<Fiber>,
    /// Thread the suspension was created on; suspensions never cross
    /// threads.
    owner: ThreadId,
}

/// Controller parking and resuming one execution context.
///
/// Clones share the same controller: keep one clone in the suspending
/// context and hand others to the callbacks that will resume it. A
/// suspension is reusable: after a resumption is consumed it can suspend
/// again.
pub struct Suspension<T> {
    inner: Arc<SuspensionInner<T>>,
    driver: Driver,
}

impl<T> Clone for Suspension<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            driver: self.driver.clone(),
        }
    }
}

impl Driver {
    /// Creates a suspension bound to the current execution context: the
    /// running fiber when called on a fiber thread, otherwise the calling
    /// thread itself (which must be the one that runs the loop).
    pub fn create_suspension<T: Send + 'static>(&self) -> Suspension<T> {
        Suspension {
            inner: Arc::new(SuspensionInner {
                state: Mutex::new(SusState {
                    waiting: false,
                    outcome: None,
                    delivered: false,
                }),
                resolved: Condvar::new(),
                fiber: fiber::current().map(|context| context.fiber),
                owner: thread::current().id(),
            }),
            driver: self.clone(),
        }
    }
}

impl<T: Send + 'static> Suspension<T> {
    /// Schedules the bound context to resume with `value`.
    ///
    /// Fails when a resumption is already pending or the bound fiber has
    /// completed. The context wakes on the scheduler's next microtask
    /// drain, never synchronously.
    pub fn resume(&self, value: T) -> Result<(), LoopError> {
        self.settle(Ok(value))
    }

    /// Schedules the bound context to resume by raising `error` out of its
    /// `suspend` call.
    pub fn throw(&self, error: BoxError) -> Result<(), LoopError> {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Result<T, BoxError>) -> Result<(), LoopError> {
        if let Some(fiber) = &self.inner.fiber {
            if fiber.is_done() {
                return Err(LoopError::lifecycle(
                    "cannot resume a suspension whose fiber has completed",
                ));
            }
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.outcome.is_some() || state.delivered {
                return Err(LoopError::lifecycle(
                    "suspension already has a pending resumption",
                ));
            }
            state.outcome = Some(outcome);
        }
        let delivery = self.clone();
        self.driver.enqueue_microtask(Box::new(move || {
            delivery.deliver();
            Ok(())
        }));
        Ok(())
    }

    /// Runs on the scheduler: releases the pending outcome to the parked
    /// context and, for fibers, waits until the fiber yields again so only
    /// one of the two runs at a time.
    fn deliver(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.outcome.is_none() {
                return;
            }
            if state.waiting {
                // The parked fiber's own yield announcement is still queued;
                // drop it so the post-delivery wait pairs with the next one.
                if let Some(fiber) = &self.inner.fiber {
                    fiber.drain_stale_events();
                }
            }
            state.delivered = true;
            self.inner.resolved.notify_all();
        }

        if let Some(fiber) = &self.inner.fiber {
            if !fiber.is_done() {
                let _ = fiber.wait_for_yield();
            }
        }
    }

    fn is_delivered(&self) -> bool {
        self.inner.state.lock().unwrap().delivered
    }

    /// Parks the current context until a resumption is delivered, returning
    /// the resumed value or propagating the thrown error.
    ///
    /// On a fiber thread this hands control back to the scheduler. On the
    /// loop-owning thread it drives the loop inline until the suspension
    /// resolves. Suspending from inside a callback (the scheduler context)
    /// or from a foreign thread fails.
    pub fn suspend(&self) -> Result<T, BoxError> {
        match self.inner.fiber.clone() {
            Some(fiber) => self.suspend_on_fiber(&fiber),
            None => self.suspend_inline(),
        }
    }

    fn suspend_on_fiber(&self, fiber: &Fiber) -> Result<T, BoxError> {
        if !fiber.is_current() {
            return Err(Box::new(LoopError::lifecycle(
                "suspension used outside its bound fiber",
            )));
        }
        let mut state = self.inner.state.lock().unwrap();
        if !state.delivered {
            state.waiting = true;
            // Announce the yield before parking; the scheduler resumes once
            // it sees control is back with the loop.
            if let Some(context) = fiber::current() {
                context.notify_suspended();
            }
            while !state.delivered {
                state = self.inner.resolved.wait(state).unwrap();
            }
        }
        state.waiting = false;
        state.delivered = false;
        state
            .outcome
            .take()
            .expect("suspension delivered without an outcome")
    }

    fn suspend_inline(&self) -> Result<T, BoxError> {
        if thread::current().id() != self.inner.owner {
            return Err(Box::new(LoopError::lifecycle(
                "suspension used from a thread it is not bound to",
            )));
        }
        if let Some(scheduler) = self.driver.scheduler_thread() {
            let message = if scheduler == thread::current().id() {
                "cannot suspend the scheduler context"
            } else {
                "cannot suspend against a loop running on another thread"
            };
            return Err(Box::new(LoopError::lifecycle(message)));
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.delivered {
                state.delivered = false;
                return state
                    .outcome
                    .take()
                    .expect("suspension delivered without an outcome");
            }
            state.waiting = true;
        }

        // Drive the loop on this thread until the resumption lands.
        let watcher = self.clone();
        let run = self.driver.run_internal(&mut move || watcher.is_delivered());

        let mut state = self.inner.state.lock().unwrap();
        state.waiting = false;
        if let Err(error) = run {
            return Err(Box::new(error));
        }
        if state.delivered {
            state.delivered = false;
            state
                .outcome
                .take()
                .expect("suspension delivered without an outcome")
        } else {
            Err(Box::new(LoopError::lifecycle(
                "event loop terminated without resuming the suspension",
            )))
        }
    }
}
