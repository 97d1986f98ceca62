//! The reactor driver: registration state machine and scheduling loop.
//!
//! A [`Driver`] multiplexes four kinds of activation (deferred work,
//! one-shot and periodic timers, descriptor readiness, unix signals) on a
//! single thread. Callbacks registered with the driver receive unique ids
//! and run to completion one at a time; each invocation may freely re-enter
//! the driver to register, cancel, or stop.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use crossbeam_queue::SegQueue;
use log::debug;
use metrics::{counter, gauge};

use crate::backend::poll::PollBackend;
use crate::backend::select::SelectBackend;
use crate::backend::{Activation, Backend};
use crate::callback::{Callable, CallbackId, CallbackKind, CallbackRecord, CallbackResult};
use crate::error::LoopError;

/// Handler invoked on the scheduler with every error escaping a user
/// callback or produced by dispatch itself. The handler must not panic; a
/// panicking handler aborts the loop.
pub type ErrorHandler = Box<dyn FnMut(LoopError) + Send>;

pub(crate) type Microtask = Box<dyn FnOnce() -> CallbackResult + Send>;

/// A cloneable handle to one event loop.
///
/// All clones share the same loop state. The driver assumes cooperative,
/// effectively single-threaded use: callbacks run on whichever thread called
/// [`run`](Driver::run), and nothing here protects against two threads
/// driving the same loop at once beyond the re-entry check in `run`.
pub struct Driver {
    shared: Arc<Shared>,
}

impl Clone for Driver {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared {
    state: Mutex<State>,
    /// FIFO microtask inbox; a queue rather than a field under the state
    /// lock so fiber threads can enqueue resumptions lock-free.
    microtasks: SegQueue<Microtask>,
}

struct State {
    backend: Box<dyn Backend>,
    records: HashMap<CallbackId, CallbackRecord>,
    next_id: u64,
    /// Ids awaiting the next activation pass, in registration order.
    pending: Vec<CallbackId>,
    /// Activated deferred callbacks awaiting invocation.
    ready_defers: VecDeque<CallbackId>,
    /// Number of records currently keeping the loop alive
    /// (enabled and referenced).
    keep_alive: usize,
    running: bool,
    stop_requested: bool,
    run_thread: Option<ThreadId>,
    error_handler: Option<ErrorHandler>,
}

impl State {
    fn register(&mut self, kind: CallbackKind, callable: Callable) -> CallbackId {
        self.next_id += 1;
        let id = CallbackId(self.next_id);
        let mut record = CallbackRecord::new(id, kind, callable);
        if let CallbackKind::Timer { interval, .. } = kind {
            record.expiration = self.backend.now() + interval;
        }
        self.keep_alive += 1;
        self.records.insert(id, record);
        self.pending.push(id);
        counter!("eddy_callbacks_registered_total").increment(1);
        gauge!("eddy_callbacks_live").set(self.records.len() as f64);
        id
    }

    fn disable_record(&mut self, id: CallbackId) {
        let (referenced, activation) = match self.records.get_mut(&id) {
            Some(record) if record.enabled => {
                record.enabled = false;
                (record.referenced, record.activation())
            }
            _ => return,
        };
        if referenced {
            self.keep_alive -= 1;
        }
        self.pending.retain(|pending| *pending != id);
        self.ready_defers.retain(|ready| *ready != id);
        if let Some(activation) = activation {
            self.backend.deactivate(&activation);
        }
    }

    fn cancel_record(&mut self, id: CallbackId) -> bool {
        let record = match self.records.remove(&id) {
            Some(record) => record,
            None => return false,
        };
        if record.keeps_alive() {
            self.keep_alive -= 1;
        }
        self.pending.retain(|pending| *pending != id);
        self.ready_defers.retain(|ready| *ready != id);
        if record.enabled {
            if let Some(activation) = record.activation() {
                self.backend.deactivate(&activation);
            }
        }
        gauge!("eddy_callbacks_live").set(self.records.len() as f64);
        true
    }
}

impl Driver {
    /// Creates a driver on the native poll backend, falling back to the
    /// pure select backend when the poller cannot be set up.
    pub fn new() -> Self {
        match PollBackend::new() {
            Ok(backend) => Self::with_backend(Box::new(backend)),
            Err(_) => Self::select(),
        }
    }

    /// Driver on the pure `select(2)` backend.
    pub fn select() -> Self {
        Self::with_backend(Box::new(SelectBackend::new()))
    }

    /// Driver on the native `mio` poll backend.
    pub fn poll() -> Result<Self, LoopError> {
        let backend =
            PollBackend::new().map_err(|err| LoopError::backend("failed to create poller", err))?;
        Ok(Self::with_backend(Box::new(backend)))
    }

    fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    backend,
                    records: HashMap::new(),
                    next_id: 0,
                    pending: Vec::new(),
                    ready_defers: VecDeque::new(),
                    keep_alive: 0,
                    running: false,
                    stop_requested: false,
                    run_thread: None,
                    error_handler: None,
                }),
                microtasks: SegQueue::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap()
    }

    // ---- registration -----------------------------------------------------

    /// Schedules `callback` to run once on the next loop iteration.
    pub fn defer<F>(&self, callback: F) -> CallbackId
    where
        F: FnMut(CallbackId) -> CallbackResult + Send + 'static,
    {
        self.lock()
            .register(CallbackKind::Defer, Callable::Plain(Box::new(callback)))
    }

    /// Schedules `callback` to run once after `seconds`. The record is
    /// cancelled before the callback runs, so its id is already invalid
    /// inside the callback.
    pub fn delay<F>(&self, seconds: f64, callback: F) -> CallbackId
    where
        F: FnMut(CallbackId) -> CallbackResult + Send + 'static,
    {
        assert!(
            seconds >= 0.0 && seconds.is_finite(),
            "delay must be finite and non-negative"
        );
        self.lock().register(
            CallbackKind::Timer {
                interval: seconds,
                repeat: false,
            },
            Callable::Plain(Box::new(callback)),
        )
    }

    /// Schedules `callback` to run every `interval` seconds. The next
    /// expiration is computed after each invocation returns, so two
    /// consecutive runs are never closer than `interval`.
    pub fn repeat<F>(&self, interval: f64, callback: F) -> CallbackId
    where
        F: FnMut(CallbackId) -> CallbackResult + Send + 'static,
    {
        assert!(
            interval > 0.0 && interval.is_finite(),
            "repeat interval must be finite and greater than zero"
        );
        self.lock().register(
            CallbackKind::Timer {
                interval,
                repeat: true,
            },
            Callable::Plain(Box::new(callback)),
        )
    }

    /// Invokes `callback` whenever `stream` is readable (level-triggered).
    pub fn on_readable<S, F>(&self, stream: &S, callback: F) -> CallbackId
    where
        S: AsRawFd + ?Sized,
        F: FnMut(CallbackId, RawFd) -> CallbackResult + Send + 'static,
    {
        self.lock().register(
            CallbackKind::Readable {
                fd: stream.as_raw_fd(),
            },
            Callable::Stream(Box::new(callback)),
        )
    }

    /// Invokes `callback` whenever `stream` is writable (level-triggered).
    pub fn on_writable<S, F>(&self, stream: &S, callback: F) -> CallbackId
    where
        S: AsRawFd + ?Sized,
        F: FnMut(CallbackId, RawFd) -> CallbackResult + Send + 'static,
    {
        self.lock().register(
            CallbackKind::Writable {
                fd: stream.as_raw_fd(),
            },
            Callable::Stream(Box::new(callback)),
        )
    }

    /// Invokes `callback` whenever `signo` is delivered to the process.
    pub fn on_signal<F>(&self, signo: i32, callback: F) -> Result<CallbackId, LoopError>
    where
        F: FnMut(CallbackId, i32) -> CallbackResult + Send + 'static,
    {
        let mut state = self.lock();
        if !state.backend.supports_signals() {
            return Err(LoopError::Unsupported {
                feature: "signal callbacks",
            });
        }
        Ok(state.register(
            CallbackKind::Signal { signo },
            Callable::Signal(Box::new(callback)),
        ))
    }

    // ---- record state transitions -----------------------------------------

    /// Re-enables a disabled callback. No-op on an already enabled id; fails
    /// on an unknown one.
    pub fn enable(&self, id: CallbackId) -> Result<CallbackId, LoopError> {
        let mut state = self.lock();
        let now = state.backend.now();
        let referenced = {
            let record = state.records.get_mut(&id).ok_or(LoopError::invalid(id))?;
            if record.enabled {
                return Ok(id);
            }
            record.enabled = true;
            if let CallbackKind::Timer { interval, .. } = record.kind {
                record.expiration = now + interval;
            }
            record.referenced
        };
        if referenced {
            state.keep_alive += 1;
        }
        state.pending.push(id);
        Ok(id)
    }

    /// Disables a callback without discarding it. Unknown ids are absorbed.
    pub fn disable(&self, id: CallbackId) -> Result<CallbackId, LoopError> {
        self.lock().disable_record(id);
        Ok(id)
    }

    /// Marks the callback as keeping the loop alive (the default).
    pub fn reference(&self, id: CallbackId) -> Result<CallbackId, LoopError> {
        let mut state = self.lock();
        let enabled = {
            let record = state.records.get_mut(&id).ok_or(LoopError::invalid(id))?;
            if record.referenced {
                return Ok(id);
            }
            record.referenced = true;
            record.enabled
        };
        if enabled {
            state.keep_alive += 1;
        }
        Ok(id)
    }

    /// Allows the loop to exit even while this callback stays enabled.
    pub fn unreference(&self, id: CallbackId) -> Result<CallbackId, LoopError> {
        let mut state = self.lock();
        let enabled = {
            let record = state.records.get_mut(&id).ok_or(LoopError::invalid(id))?;
            if !record.referenced {
                return Ok(id);
            }
            record.referenced = false;
            record.enabled
        };
        if enabled {
            state.keep_alive -= 1;
        }
        Ok(id)
    }

    /// Discards a callback registration. The id never resolves again; a
    /// second cancel, or a cancel of an unknown id, is a no-op.
    pub fn cancel(&self, id: CallbackId) {
        self.lock().cancel_record(id);
    }

    // ---- microtasks and error handling ------------------------------------

    /// Enqueues `task` to run before the next dispatch. Microtasks run in
    /// FIFO order and are not cancellable.
    pub fn queue<F>(&self, task: F)
    where
        F: FnOnce() -> CallbackResult + Send + 'static,
    {
        self.shared.microtasks.push(Box::new(task));
    }

    pub(crate) fn enqueue_microtask(&self, task: Microtask) {
        self.shared.microtasks.push(task);
    }

    /// Installs the error handler, returning the previous one.
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
        std::mem::replace(&mut self.lock().error_handler, handler)
    }

    /// The backend's underlying OS multiplexer handle, when it has one.
    pub fn handle(&self) -> Option<RawFd> {
        self.lock().backend.handle()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Asks the loop to exit once the current iteration completes. Safe to
    /// call from inside a callback.
    pub fn stop(&self) {
        self.lock().stop_requested = true;
    }

    pub(crate) fn scheduler_thread(&self) -> Option<ThreadId> {
        self.lock().run_thread
    }

    // ---- the loop ---------------------------------------------------------

    /// Runs the loop until [`stop`](Driver::stop) is called or no enabled,
    /// referenced callback remains.
    pub fn run(&self) -> Result<(), LoopError> {
        self.run_internal(&mut || false)
    }

    /// `run` with an extra exit predicate, checked between invocation
    /// phases; suspensions use it to drive the loop inline until resolved.
    pub(crate) fn run_internal(&self, done: &mut dyn FnMut() -> bool) -> Result<(), LoopError> {
        {
            let mut state = self.lock();
            if state.running {
                return Err(LoopError::lifecycle("the event loop is already running"));
            }
            state.running = true;
            state.stop_requested = false;
            state.run_thread = Some(thread::current().id());
            if let Err(error) = state.backend.on_run_enter() {
                state.running = false;
                state.run_thread = None;
                return Err(error);
            }
        }
        debug!("event loop entered");

        let result = loop {
            match self.tick(done) {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(error) => break Err(error),
            }
        };

        {
            let mut state = self.lock();
            state.backend.on_run_exit();
            state.running = false;
            state.run_thread = None;
        }
        debug!("event loop exited");
        result
    }

    /// One loop iteration. `Ok(false)` means the loop should return.
    fn tick(&self, done: &mut dyn FnMut() -> bool) -> Result<bool, LoopError> {
        self.drain_microtasks()?;
        if done() {
            return Ok(false);
        }

        {
            let state = self.lock();
            if state.stop_requested || state.keep_alive == 0 {
                return Ok(false);
            }
        }

        // Activation pass: promote pending records, in registration order.
        self.activate_pending()?;

        // Deferred callbacks activated before this iteration.
        let defers: Vec<CallbackId> = self.lock().ready_defers.drain(..).collect();
        for id in defers {
            self.invoke(id)?;
        }
        if done() {
            return Ok(false);
        }

        // Block only when nothing is waiting to run and nothing asked the
        // loop to exit.
        let blocking = {
            let state = self.lock();
            state.keep_alive > 0
                && !state.stop_requested
                && state.pending.is_empty()
                && state.ready_defers.is_empty()
                && self.shared.microtasks.is_empty()
        };

        let ready = {
            let mut state = self.lock();
            match state.backend.dispatch(blocking) {
                Ok(ready) => ready,
                Err(error) => {
                    drop(state);
                    self.report(error)?;
                    Vec::new()
                }
            }
        };
        for id in ready {
            self.invoke(id)?;
        }
        Ok(true)
    }

    fn activate_pending(&self) -> Result<(), LoopError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.pending.is_empty() {
            return Ok(());
        }
        let pending: Vec<CallbackId> = state.pending.drain(..).collect();
        let mut batch = Vec::new();
        for id in pending {
            let record = match state.records.get(&id) {
                Some(record) if record.enabled => record,
                _ => continue,
            };
            match record.activation() {
                Some(activation) => batch.push(activation),
                None => state.ready_defers.push_back(id),
            }
        }
        if batch.is_empty() {
            return Ok(());
        }
        if let Err(error) = state.backend.activate(&batch) {
            drop(guard);
            return self.report(error);
        }
        Ok(())
    }

    /// Runs every queued microtask, FIFO, including ones enqueued while
    /// draining. Errors are routed to the error handler.
    fn drain_microtasks(&self) -> Result<(), LoopError> {
        while let Some(task) = self.shared.microtasks.pop() {
            if let Err(source) = task() {
                self.report(LoopError::Callback { id: None, source })?;
            }
        }
        Ok(())
    }

    /// Invokes the callback behind `id`, skipping records removed or
    /// disabled since dispatch reported them ready.
    fn invoke(&self, id: CallbackId) -> Result<(), LoopError> {
        let (callable, kind) = {
            let mut state = self.lock();
            let record = match state.records.get(&id) {
                Some(record) if record.enabled => record,
                _ => return Ok(()),
            };
            let callable = Arc::clone(&record.callable);
            let kind = record.kind;
            // One-shot records are cancelled before their callback runs:
            // inside the callback the id is already invalid.
            if matches!(
                kind,
                CallbackKind::Defer | CallbackKind::Timer { repeat: false, .. }
            ) {
                state.cancel_record(id);
            }
            (callable, kind)
        };

        counter!("eddy_callbacks_invoked_total").increment(1);
        let result = {
            let mut callable = callable.lock().unwrap();
            match &mut *callable {
                Callable::Plain(callback) => callback(id),
                Callable::Stream(callback) => {
                    let fd = match kind {
                        CallbackKind::Readable { fd } | CallbackKind::Writable { fd } => fd,
                        _ => unreachable!("stream callable with non-stream kind"),
                    };
                    callback(id, fd)
                }
                Callable::Signal(callback) => {
                    let signo = match kind {
                        CallbackKind::Signal { signo } => signo,
                        _ => unreachable!("signal callable with non-signal kind"),
                    };
                    callback(id, signo)
                }
            }
        };

        if let Err(source) = result {
            self.report(LoopError::Callback {
                id: Some(id),
                source,
            })?;
        }

        if let CallbackKind::Timer {
            interval,
            repeat: true,
        } = kind
        {
            self.rearm_repeat(id, interval)?;
        }

        // Microtasks run between callbacks, never inside them.
        self.drain_microtasks()
    }

    /// Re-arms a repeating timer from the post-invocation clock, unless the
    /// callback disabled or cancelled it.
    fn rearm_repeat(&self, id: CallbackId, interval: f64) -> Result<(), LoopError> {
        let mut state = self.lock();
        let now = state.backend.now();
        let expiration = match state.records.get_mut(&id) {
            Some(record) if record.enabled => {
                record.expiration = now + interval;
                Some(record.expiration)
            }
            _ => None,
        };
        if let Some(expiration) = expiration {
            if let Err(error) = state.backend.activate(&[Activation::Timer { id, expiration }]) {
                drop(state);
                return self.report(error);
            }
        }
        Ok(())
    }

    /// Routes an error to the installed handler; with no handler installed
    /// the error aborts the loop.
    fn report(&self, error: LoopError) -> Result<(), LoopError> {
        let handler = self.lock().error_handler.take();
        match handler {
            Some(mut handler) => {
                debug!("routing error to handler: {error}");
                handler(error);
                let mut state = self.lock();
                // Keep a handler the callback installed over ours.
                if state.error_handler.is_none() {
                    state.error_handler = Some(handler);
                }
                Ok(())
            }
            None => Err(error),
        }
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}
