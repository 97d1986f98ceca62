//! Native backend over `mio::Poll`.
//!
//! Registrations go through `SourceFd` tokens keyed by descriptor. The
//! poller reports edges, while callbacks expect level-triggered readiness;
//! every delivered descriptor is re-registered after dispatch so a stream
//! that is still ready produces a fresh event on the next wait.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::backend::{Activation, Backend};
use crate::callback::CallbackId;
use crate::clock::Clock;
use crate::error::LoopError;
use crate::signals::{Armory, SignalSet};
use crate::timer_queue::TimerQueue;

/// Upper bound on one wait when nothing is registered with the poller.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 1024;

pub(crate) struct PollBackend {
    clock: Clock,
    poll: Poll,
    events: Events,
    readers: HashMap<RawFd, Vec<CallbackId>>,
    writers: HashMap<RawFd, Vec<CallbackId>>,
    timers: TimerQueue,
    signal_watchers: HashMap<i32, Vec<CallbackId>>,
    /// Hooks stay dormant until this loop enters `run` and takes the top of
    /// the armory stack.
    signals: Arc<Mutex<SignalSet>>,
    /// Read end of each signal pipe, registered with the poller.
    signal_fds: HashMap<RawFd, i32>,
    /// Descriptors currently registered with the poller.
    registered: HashSet<RawFd>,
}

impl PollBackend {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            clock: Clock::new(),
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            readers: HashMap::new(),
            writers: HashMap::new(),
            timers: TimerQueue::new(),
            signal_watchers: HashMap::new(),
            signals: Arc::new(Mutex::new(SignalSet::new(false))),
            signal_fds: HashMap::new(),
            registered: HashSet::new(),
        })
    }

    fn interest_for(&self, fd: RawFd) -> Option<Interest> {
        let read = self.readers.contains_key(&fd) || self.signal_fds.contains_key(&fd);
        let write = self.writers.contains_key(&fd);
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Brings the poller's registration for `fd` in line with the watch
    /// maps.
    fn sync_registration(&mut self, fd: RawFd) -> Result<(), LoopError> {
        let token = Token(fd as usize);
        let registry = self.poll.registry();
        let was_registered = self.registered.contains(&fd);
        let result = match (self.interest_for(fd), was_registered) {
            (Some(interest), true) => registry.reregister(&mut SourceFd(&fd), token, interest),
            (Some(interest), false) => registry.register(&mut SourceFd(&fd), token, interest),
            (None, true) => registry.deregister(&mut SourceFd(&fd)),
            (None, false) => return Ok(()),
        };
        match result {
            Ok(()) => {
                if self.interest_for(fd).is_some() {
                    self.registered.insert(fd);
                } else {
                    self.registered.remove(&fd);
                }
                Ok(())
            }
            Err(err) => Err(LoopError::backend(
                format!("failed to update poller registration for fd {fd}"),
                err,
            )),
        }
    }
}

fn push_watch<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Vec<CallbackId>>,
    key: K,
    id: CallbackId,
) {
    let ids = map.entry(key).or_default();
    if !ids.contains(&id) {
        ids.push(id);
    }
}

fn drop_watch<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, Vec<CallbackId>>,
    key: K,
    id: CallbackId,
) {
    if let Some(ids) = map.get_mut(&key) {
        ids.retain(|watch| *watch != id);
        if ids.is_empty() {
            map.remove(&key);
        }
    }
}

impl Backend for PollBackend {
    fn activate(&mut self, batch: &[Activation]) -> Result<(), LoopError> {
        for activation in batch {
            match *activation {
                Activation::Timer { id, expiration } => self.timers.insert(id, expiration),
                Activation::Readable { id, fd } => {
                    push_watch(&mut self.readers, fd, id);
                    self.sync_registration(fd)?;
                }
                Activation::Writable { id, fd } => {
                    push_watch(&mut self.writers, fd, id);
                    self.sync_registration(fd)?;
                }
                Activation::Signal { id, signo } => {
                    let pipe_fd = self.signals.lock().unwrap().install(signo).map_err(|err| {
                        LoopError::backend(
                            format!("failed to install handler for signal {signo}"),
                            err,
                        )
                    })?;
                    if !self.signal_fds.contains_key(&pipe_fd) {
                        self.signal_fds.insert(pipe_fd, signo);
                        self.sync_registration(pipe_fd)?;
                    }
                    push_watch(&mut self.signal_watchers, signo, id);
                }
            }
        }
        Ok(())
    }

    fn deactivate(&mut self, activation: &Activation) {
        match *activation {
            Activation::Timer { id, .. } => {
                self.timers.remove(id);
            }
            Activation::Readable { id, fd } => {
                drop_watch(&mut self.readers, fd, id);
                let _ = self.sync_registration(fd);
            }
            Activation::Writable { id, fd } => {
                drop_watch(&mut self.writers, fd, id);
                let _ = self.sync_registration(fd);
            }
            Activation::Signal { id, signo } => {
                drop_watch(&mut self.signal_watchers, signo, id);
                if !self.signal_watchers.contains_key(&signo) {
                    let pipe_fd = self
                        .signal_fds
                        .iter()
                        .find(|(_, &s)| s == signo)
                        .map(|(&fd, _)| fd);
                    if let Some(pipe_fd) = pipe_fd {
                        self.signal_fds.remove(&pipe_fd);
                        let _ = self.sync_registration(pipe_fd);
                    }
                    self.signals.lock().unwrap().remove(signo);
                }
            }
        }
    }

    fn dispatch(&mut self, blocking: bool) -> Result<Vec<CallbackId>, LoopError> {
        let mut timeout = if !blocking {
            Some(Duration::ZERO)
        } else {
            self.timers
                .peek()
                .map(|expiration| Duration::from_secs_f64((expiration - self.clock.now()).max(0.0)))
        };
        let nothing_registered =
            self.readers.is_empty() && self.writers.is_empty() && self.signal_fds.is_empty();
        if nothing_registered {
            timeout = Some(timeout.unwrap_or(MAX_IDLE_WAIT).min(MAX_IDLE_WAIT));
        }

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                trace!("poll interrupted by signal");
                self.events.clear();
            }
            Err(err) => return Err(LoopError::backend("poll failed", err)),
        }

        let mut ready = Vec::new();
        let mut delivered_signals: Vec<i32> = Vec::new();
        let mut rearm: Vec<RawFd> = Vec::new();

        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            if let Some(&signo) = self.signal_fds.get(&fd) {
                if self.signals.lock().unwrap().drain(signo) {
                    delivered_signals.push(signo);
                }
                rearm.push(fd);
                continue;
            }
            if event.is_readable() {
                if let Some(ids) = self.readers.get(&fd) {
                    ready.extend(ids.iter().copied());
                }
            }
            if event.is_writable() {
                if let Some(ids) = self.writers.get(&fd) {
                    ready.extend(ids.iter().copied());
                }
            }
            rearm.push(fd);
        }

        // Re-arm delivered descriptors so still-ready streams show up again
        // on the next wait.
        for fd in rearm {
            if self.registered.contains(&fd) {
                self.sync_registration(fd)?;
            }
        }

        let now = self.clock.now();
        while let Some(entry) = self.timers.extract(now) {
            ready.push(entry.id);
        }

        for signo in delivered_signals {
            if let Some(ids) = self.signal_watchers.get(&signo) {
                ready.extend(ids.iter().copied());
            }
        }

        Ok(ready)
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn handle(&self) -> Option<RawFd> {
        Some(self.poll.as_raw_fd())
    }

    fn supports_signals(&self) -> bool {
        cfg!(unix)
    }

    fn on_run_enter(&mut self) -> Result<(), LoopError> {
        Armory::enter(&self.signals)
            .map_err(|err| LoopError::backend("failed to arm signal handlers", err))
    }

    fn on_run_exit(&mut self) {
        Armory::exit(&self.signals);
    }
}
