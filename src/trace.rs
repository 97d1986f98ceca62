//! Provenance-tracking decorator for debugging callback leaks.

use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use crate::callback::{CallbackId, CallbackResult};
use crate::driver::{Driver, ErrorHandler};
use crate::error::LoopError;
use crate::suspension::Suspension;

struct TraceEntry {
    creation: String,
    cancellation: Option<String>,
    /// False once the id stopped resolving: explicit cancel, or the
    /// automatic cancellation of a one-shot before its callback runs.
    live: bool,
    enabled: bool,
    referenced: bool,
}

type Entries = Arc<Mutex<BTreeMap<CallbackId, TraceEntry>>>;

/// Decorator recording where every callback was created and cancelled.
///
/// Registrations pass through to the wrapped [`Driver`] unchanged. When
/// `enable`, `reference`, or `unreference` fail with an invalid id, the
/// recorded creation and cancellation traces are attached to the error.
/// [`dump`](TracingDriver::dump) lists every enabled, referenced callback
/// with its creation trace, answering "why is the loop still
/// running?".
#[derive(Clone)]
pub struct TracingDriver {
    inner: Driver,
    entries: Entries,
}

impl TracingDriver {
    pub fn new(inner: Driver) -> Self {
        Self {
            inner,
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// The wrapped driver.
    pub fn inner(&self) -> &Driver {
        &self.inner
    }

    fn record(&self, id: CallbackId) -> CallbackId {
        self.entries.lock().unwrap().insert(
            id,
            TraceEntry {
                creation: Backtrace::force_capture().to_string(),
                cancellation: None,
                live: true,
                enabled: true,
                referenced: true,
            },
        );
        id
    }

    /// Marks `id` consumed by a one-shot invocation.
    fn finish(entries: &Entries, id: CallbackId) {
        if let Some(entry) = entries.lock().unwrap().get_mut(&id) {
            entry.live = false;
            entry.enabled = false;
        }
    }

    fn augment(&self, error: LoopError) -> LoopError {
        if let LoopError::InvalidCallback { id, .. } = &error {
            if let Some(entry) = self.entries.lock().unwrap().get(id) {
                return LoopError::InvalidCallback {
                    id: *id,
                    creation_trace: Some(entry.creation.clone()),
                    cancellation_trace: entry.cancellation.clone(),
                };
            }
        }
        error
    }

    fn mark<F>(&self, id: CallbackId, apply: F)
    where
        F: FnOnce(&mut TraceEntry),
    {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&id) {
            apply(entry);
        }
    }

    // ---- registration -----------------------------------------------------

    /// See [`Driver::defer`].
    pub fn defer<F>(&self, mut callback: F) -> CallbackId
    where
        F: FnMut(CallbackId) -> CallbackResult + Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        let id = self.inner.defer(move |id| {
            TracingDriver::finish(&entries, id);
            callback(id)
        });
        self.record(id)
    }

    /// See [`Driver::delay`].
    pub fn delay<F>(&self, seconds: f64, mut callback: F) -> CallbackId
    where
        F: FnMut(CallbackId) -> CallbackResult + Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        let id = self.inner.delay(seconds, move |id| {
            TracingDriver::finish(&entries, id);
            callback(id)
        });
        self.record(id)
    }

    /// See [`Driver::repeat`].
    pub fn repeat<F>(&self, interval: f64, callback: F) -> CallbackId
    where
        F: FnMut(CallbackId) -> CallbackResult + Send + 'static,
    {
        self.record(self.inner.repeat(interval, callback))
    }

    /// See [`Driver::on_readable`].
    pub fn on_readable<S, F>(&self, stream: &S, callback: F) -> CallbackId
    where
        S: AsRawFd + ?Sized,
        F: FnMut(CallbackId, RawFd) -> CallbackResult + Send + 'static,
    {
        self.record(self.inner.on_readable(stream, callback))
    }

    /// See [`Driver::on_writable`].
    pub fn on_writable<S, F>(&self, stream: &S, callback: F) -> CallbackId
    where
        S: AsRawFd + ?Sized,
        F: FnMut(CallbackId, RawFd) -> CallbackResult + Send + 'static,
    {
        self.record(self.inner.on_writable(stream, callback))
    }

    /// See [`Driver::on_signal`].
    pub fn on_signal<F>(&self, signo: i32, callback: F) -> Result<CallbackId, LoopError>
    where
        F: FnMut(CallbackId, i32) -> CallbackResult + Send + 'static,
    {
        Ok(self.record(self.inner.on_signal(signo, callback)?))
    }

    // ---- record state transitions -----------------------------------------

    /// See [`Driver::enable`]. Failures carry the recorded traces.
    pub fn enable(&self, id: CallbackId) -> Result<CallbackId, LoopError> {
        match self.inner.enable(id) {
            Ok(id) => {
                self.mark(id, |entry| entry.enabled = true);
                Ok(id)
            }
            Err(error) => Err(self.augment(error)),
        }
    }

    /// See [`Driver::disable`].
    pub fn disable(&self, id: CallbackId) -> Result<CallbackId, LoopError> {
        let result = self.inner.disable(id).map_err(|error| self.augment(error));
        if result.is_ok() {
            self.mark(id, |entry| entry.enabled = false);
        }
        result
    }

    /// See [`Driver::reference`]. Failures carry the recorded traces.
    pub fn reference(&self, id: CallbackId) -> Result<CallbackId, LoopError> {
        match self.inner.reference(id) {
            Ok(id) => {
                self.mark(id, |entry| entry.referenced = true);
                Ok(id)
            }
            Err(error) => Err(self.augment(error)),
        }
    }

    /// See [`Driver::unreference`]. Failures carry the recorded traces.
    pub fn unreference(&self, id: CallbackId) -> Result<CallbackId, LoopError> {
        match self.inner.unreference(id) {
            Ok(id) => {
                self.mark(id, |entry| entry.referenced = false);
                Ok(id)
            }
            Err(error) => Err(self.augment(error)),
        }
    }

    /// See [`Driver::cancel`]. Records the cancellation site.
    pub fn cancel(&self, id: CallbackId) {
        self.inner.cancel(id);
        self.mark(id, |entry| {
            if entry.live {
                entry.live = false;
                entry.cancellation = Some(Backtrace::force_capture().to_string());
            }
        });
    }

    // ---- passthrough ------------------------------------------------------

    /// See [`Driver::run`].
    pub fn run(&self) -> Result<(), LoopError> {
        self.inner.run()
    }

    /// See [`Driver::stop`].
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// See [`Driver::queue`].
    pub fn queue<F>(&self, task: F)
    where
        F: FnOnce() -> CallbackResult + Send + 'static,
    {
        self.inner.queue(task);
    }

    /// See [`Driver::set_error_handler`].
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
        self.inner.set_error_handler(handler)
    }

    /// See [`Driver::handle`].
    pub fn handle(&self) -> Option<RawFd> {
        self.inner.handle()
    }

    /// See [`Driver::create_suspension`].
    pub fn create_suspension<T: Send + 'static>(&self) -> Suspension<T> {
        self.inner.create_suspension()
    }

    // ---- diagnostics ------------------------------------------------------

    /// One block per enabled, referenced callback: an identifier line
    /// followed by the creation trace, blocks separated by a blank line.
    pub fn dump(&self) -> String {
        let entries = self.entries.lock().unwrap();
        let mut out = String::new();
        for (id, entry) in entries.iter() {
            if !(entry.live && entry.enabled && entry.referenced) {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = writeln!(out, "Callback identifier: {id}");
            let _ = writeln!(out, "{}", entry.creation.trim_end());
        }
        out
    }
}
