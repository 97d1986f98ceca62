//! Pure `select(2)` backend, available on every unix platform.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::thread;
use std::time::Duration;

use log::trace;

use crate::backend::{Activation, Backend};
use crate::callback::CallbackId;
use crate::clock::Clock;
use crate::error::LoopError;
use crate::signals::SignalSet;
use crate::timer_queue::TimerQueue;

/// Upper bound on one wait when there is nothing to select on.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(1);

pub(crate) struct SelectBackend {
    clock: Clock,
    readers: BTreeMap<RawFd, Vec<CallbackId>>,
    writers: BTreeMap<RawFd, Vec<CallbackId>>,
    timers: TimerQueue,
    signal_watchers: BTreeMap<i32, Vec<CallbackId>>,
    // Armed as pipes are installed: select-based loops own their handlers
    // for as long as the registration exists.
    signals: SignalSet,
}

impl SelectBackend {
    pub(crate) fn new() -> Self {
        Self {
            clock: Clock::new(),
            readers: BTreeMap::new(),
            writers: BTreeMap::new(),
            timers: TimerQueue::new(),
            signal_watchers: BTreeMap::new(),
            signals: SignalSet::new(true),
        }
    }

    /// One `select` call. `Ok(None)` means the wait was interrupted by a
    /// signal; due timers are still processed in that case.
    fn wait(
        &self,
        read_fds: &[RawFd],
        write_fds: &[RawFd],
        timeout: Option<Duration>,
    ) -> Result<Option<(Vec<RawFd>, Vec<RawFd>)>, LoopError> {
        unsafe {
            let mut read_set: libc::fd_set = mem::zeroed();
            let mut write_set: libc::fd_set = mem::zeroed();
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);

            let mut max_fd: RawFd = -1;
            for &fd in read_fds {
                libc::FD_SET(fd, &mut read_set);
                max_fd = max_fd.max(fd);
            }
            for &fd in write_fds {
                libc::FD_SET(fd, &mut write_set);
                max_fd = max_fd.max(fd);
            }

            let mut tv = timeout.map(timeval_for);
            let tv_ptr = tv
                .as_mut()
                .map_or(ptr::null_mut(), |tv| tv as *mut libc::timeval);

            let rc = libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                ptr::null_mut(),
                tv_ptr,
            );
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    trace!("select interrupted by signal");
                    return Ok(None);
                }
                return Err(LoopError::backend("select failed", err));
            }

            let ready_reads = read_fds
                .iter()
                .copied()
                .filter(|&fd| libc::FD_ISSET(fd, &read_set))
                .collect();
            let ready_writes = write_fds
                .iter()
                .copied()
                .filter(|&fd| libc::FD_ISSET(fd, &write_set))
                .collect();
            Ok(Some((ready_reads, ready_writes)))
        }
    }
}

/// Rounds up to the next microsecond so a timer never wakes early.
fn timeval_for(timeout: Duration) -> libc::timeval {
    let mut sec = timeout.as_secs();
    let mut usec = timeout.subsec_micros();
    if timeout.subsec_nanos() % 1_000 != 0 {
        usec += 1;
        if usec == 1_000_000 {
            sec += 1;
            usec = 0;
        }
    }
    libc::timeval {
        tv_sec: sec as libc::time_t,
        tv_usec: usec as libc::suseconds_t,
    }
}

fn push_watch<K: Ord>(map: &mut BTreeMap<K, Vec<CallbackId>>, key: K, id: CallbackId) {
    let ids = map.entry(key).or_default();
    if !ids.contains(&id) {
        ids.push(id);
    }
}

fn drop_watch<K: Ord>(map: &mut BTreeMap<K, Vec<CallbackId>>, key: K, id: CallbackId) {
    if let Some(ids) = map.get_mut(&key) {
        ids.retain(|watch| *watch != id);
        if ids.is_empty() {
            map.remove(&key);
        }
    }
}

impl Backend for SelectBackend {
    fn activate(&mut self, batch: &[Activation]) -> Result<(), LoopError> {
        for activation in batch {
            match *activation {
                Activation::Timer { id, expiration } => self.timers.insert(id, expiration),
                Activation::Readable { id, fd } => push_watch(&mut self.readers, fd, id),
                Activation::Writable { id, fd } => push_watch(&mut self.writers, fd, id),
                Activation::Signal { id, signo } => {
                    self.signals.install(signo).map_err(|err| {
                        LoopError::backend(
                            format!("failed to install handler for signal {signo}"),
                            err,
                        )
                    })?;
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
            Activation::Readable { id, fd } => drop_watch(&mut self.readers, fd, id),
            Activation::Writable { id, fd } => drop_watch(&mut self.writers, fd, id),
            Activation::Signal { id, signo } => {
                drop_watch(&mut self.signal_watchers, signo, id);
                if !self.signal_watchers.contains_key(&signo) {
                    self.signals.remove(signo);
                }
            }
        }
    }

    fn dispatch(&mut self, blocking: bool) -> Result<Vec<CallbackId>, LoopError> {
        let timeout = if !blocking {
            Some(Duration::ZERO)
        } else {
            self.timers
                .peek()
                .map(|expiration| Duration::from_secs_f64((expiration - self.clock.now()).max(0.0)))
        };

        let signal_pipes: BTreeMap<RawFd, i32> = self.signals.watch_fds().into_iter().collect();
        let mut read_fds: Vec<RawFd> = self.readers.keys().copied().collect();
        read_fds.extend(signal_pipes.keys().copied());
        let write_fds: Vec<RawFd> = self.writers.keys().copied().collect();

        for &fd in read_fds.iter().chain(write_fds.iter()) {
            if fd as usize >= libc::FD_SETSIZE as usize {
                return Err(LoopError::Backend {
                    message: format!(
                        "descriptor {fd} is at or beyond FD_SETSIZE ({}); \
                         a loop watching this many descriptors needs the poll backend",
                        libc::FD_SETSIZE as usize
                    ),
                    source: None,
                });
            }
        }

        let mut delivered_signals: Vec<i32> = Vec::new();
        let mut ready = Vec::new();

        if read_fds.is_empty() && write_fds.is_empty() {
            // Nothing to select on; substitute a bounded sleep for the wait.
            let wait = timeout.unwrap_or(MAX_IDLE_WAIT).min(MAX_IDLE_WAIT);
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        } else if let Some((ready_reads, ready_writes)) =
            self.wait(&read_fds, &write_fds, timeout)?
        {
            // Ready streams first, in the order the OS reported them.
            for fd in ready_reads {
                if let Some(&signo) = signal_pipes.get(&fd) {
                    if self.signals.drain(signo) {
                        delivered_signals.push(signo);
                    }
                } else if let Some(ids) = self.readers.get(&fd) {
                    ready.extend(ids.iter().copied());
                }
            }
            for fd in ready_writes {
                if let Some(ids) = self.writers.get(&fd) {
                    ready.extend(ids.iter().copied());
                }
            }
        }

        // Due timers in (expiration, insertion sequence) order.
        let now = self.clock.now();
        while let Some(entry) = self.timers.extract(now) {
            ready.push(entry.id);
        }

        // Delivered signals last.
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
        None
    }

    fn supports_signals(&self) -> bool {
        cfg!(unix)
    }
}
