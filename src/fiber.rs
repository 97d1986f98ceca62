//! Thread-backed cooperative execution contexts.
//!
//! The reactor needs stackful contexts that can park mid-call-stack and be
//! resumed later. Rust has no native fiber primitive, so each context gets a
//! dedicated OS thread plus a rendezvous protocol: a fiber runs freely until
//! its first suspension, and from then on the scheduler and the fiber take
//! strict turns. Delivering a resumption blocks the scheduler until the
//! fiber suspends again or completes, which preserves the loop's
//! single-threaded execution discipline.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use log::trace;

thread_local! {
    static CURRENT: RefCell<Option<FiberContext>> = const { RefCell::new(None) };
}

/// What a fiber reports to the scheduler when it hands control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum YieldEvent {
    Suspended,
    Completed,
}

struct FiberInner {
    /// Scheduler-side receiver of yield events.
    events: Mutex<Receiver<YieldEvent>>,
    done: AtomicBool,
}

/// Handle to one cooperative execution context.
///
/// Cheap to clone; all clones refer to the same context. Spawn one with
/// [`Fiber::spawn`] and create suspensions inside it with
/// [`Driver::create_suspension`](crate::Driver::create_suspension).
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<FiberInner>,
}

/// The per-thread identity of a running fiber: its handle plus the sender
/// used to announce suspensions.
#[derive(Clone)]
pub(crate) struct FiberContext {
    pub(crate) fiber: Fiber,
    event_tx: Sender<YieldEvent>,
}

impl FiberContext {
    /// Fiber side: announce that the fiber is about to park.
    pub(crate) fn notify_suspended(&self) {
        let _ = self.event_tx.send(YieldEvent::Suspended);
    }
}

/// The context of the fiber running the current thread, when there is one.
pub(crate) fn current() -> Option<FiberContext> {
    CURRENT.with(|current| current.borrow().clone())
}

impl Fiber {
    /// Spawns a new fiber running `f`.
    ///
    /// The fiber executes freely until its first suspension; after that the
    /// scheduler resumes it cooperatively. A fiber that never suspends is
    /// just a thread that runs `f` to completion.
    pub fn spawn<F>(f: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        let (event_tx, events) = mpsc::channel();
        let inner = Arc::new(FiberInner {
            events: Mutex::new(events),
            done: AtomicBool::new(false),
        });
        let fiber = Fiber {
            inner: Arc::clone(&inner),
        };
        let context = FiberContext {
            fiber: fiber.clone(),
            event_tx,
        };
        thread::Builder::new()
            .name("eddy-fiber".into())
            .spawn(move || {
                let event_tx = context.event_tx.clone();
                CURRENT.with(|current| *current.borrow_mut() = Some(context));
                trace!("fiber started");
                f();
                inner.done.store(true, Ordering::Release);
                let _ = event_tx.send(YieldEvent::Completed);
                trace!("fiber completed");
            })
            .expect("failed to spawn fiber thread");
        fiber
    }

    /// Whether this fiber is the one running the current thread.
    pub(crate) fn is_current(&self) -> bool {
        current().map_or(false, |context| {
            Arc::ptr_eq(&context.fiber.inner, &self.inner)
        })
    }

    pub(crate) fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Scheduler side: discard yield announcements that predate the
    /// resumption being delivered. Only called while the fiber is parked.
    pub(crate) fn drain_stale_events(&self) {
        let events = self.inner.events.lock().unwrap();
        while events.try_recv().is_ok() {}
    }

    /// Scheduler side: block until the fiber suspends again or completes.
    pub(crate) fn wait_for_yield(&self) -> YieldEvent {
        let events = self.inner.events.lock().unwrap();
        events.recv().unwrap_or(YieldEvent::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_completion_is_observable() {
        let fiber = Fiber::spawn(|| {});
        assert_eq!(fiber.wait_for_yield(), YieldEvent::Completed);
        assert!(fiber.is_done());
    }

    #[test]
    fn test_current_is_set_inside_the_fiber() {
        let (tx, rx) = mpsc::channel();
        let fiber = Fiber::spawn(move || {
            tx.send(current().is_some()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        fiber.wait_for_yield();
    }

    #[test]
    fn test_current_is_unset_on_plain_threads() {
        assert!(current().is_none());
    }
}
