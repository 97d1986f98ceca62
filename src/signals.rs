//! Process-global signal plumbing.
//!
//! Signals are not pollable, so each watched signal number gets a self-pipe:
//! a `signal-hook` handler writes a byte into the pipe on delivery and the
//! backend folds the read end into its readiness set. The handler table is
//! process-global state; running loops therefore coordinate through a LIFO
//! [`Armory`] so that only the most recently entered loop has its hooks
//! armed (the previous loop's hooks are restored when it exits).

use std::collections::HashMap;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, OnceLock};

use log::debug;
use signal_hook::low_level::pipe;
use signal_hook::SigId;

pub(crate) struct SignalPipe {
    signo: i32,
    read: UnixStream,
    /// Kept open for the lifetime of the pipe; the registered hook writes
    /// into this descriptor from the signal handler.
    write: UnixStream,
    hook: Option<SigId>,
}

impl SignalPipe {
    fn new(signo: i32) -> io::Result<Self> {
        let (read, write) = UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;
        Ok(Self {
            signo,
            read,
            write,
            hook: None,
        })
    }

    fn arm(&mut self) -> io::Result<()> {
        if self.hook.is_none() {
            self.hook = Some(pipe::register_raw(self.signo, self.write.as_raw_fd())?);
            debug!("armed handler for signal {}", self.signo);
        }
        Ok(())
    }

    fn disarm(&mut self) {
        if let Some(hook) = self.hook.take() {
            signal_hook::low_level::unregister(hook);
            debug!("disarmed handler for signal {}", self.signo);
        }
    }

    pub(crate) fn signo(&self) -> i32 {
        self.signo
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Drains queued notification bytes, reporting whether any arrived.
    pub(crate) fn drain(&self) -> bool {
        let mut seen = false;
        let mut buf = [0u8; 64];
        let mut stream = &self.read;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => seen = true,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        seen
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// The watched signals of one backend instance.
///
/// A set created armed registers process-level hooks as pipes are
/// installed; a disarmed set keeps its pipes dormant until [`Armory::enter`]
/// arms them.
pub(crate) struct SignalSet {
    pipes: HashMap<i32, SignalPipe>,
    armed: bool,
}

impl SignalSet {
    pub(crate) fn new(armed: bool) -> Self {
        Self {
            pipes: HashMap::new(),
            armed,
        }
    }

    /// Installs the pipe for `signo`; idempotent.
    pub(crate) fn install(&mut self, signo: i32) -> io::Result<RawFd> {
        if let Some(pipe) = self.pipes.get(&signo) {
            return Ok(pipe.read_fd());
        }
        let mut pipe = SignalPipe::new(signo)?;
        if self.armed {
            pipe.arm()?;
        }
        let fd = pipe.read_fd();
        self.pipes.insert(signo, pipe);
        Ok(fd)
    }

    /// Drops the pipe for `signo`, unregistering its hook.
    pub(crate) fn remove(&mut self, signo: i32) {
        self.pipes.remove(&signo);
    }

    pub(crate) fn arm(&mut self) -> io::Result<()> {
        self.armed = true;
        for pipe in self.pipes.values_mut() {
            pipe.arm()?;
        }
        Ok(())
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
        for pipe in self.pipes.values_mut() {
            pipe.disarm();
        }
    }

    /// `(read_fd, signo)` for every installed pipe.
    pub(crate) fn watch_fds(&self) -> Vec<(RawFd, i32)> {
        self.pipes
            .values()
            .map(|pipe| (pipe.read_fd(), pipe.signo()))
            .collect()
    }

    /// Drains the pipe for `signo`, reporting whether a delivery was queued.
    pub(crate) fn drain(&self, signo: i32) -> bool {
        self.pipes.get(&signo).map_or(false, SignalPipe::drain)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }
}

/// LIFO stack of running loops' signal sets.
///
/// Entering `run` pushes a loop's set, disarming whichever loop was on top;
/// exiting pops it and re-arms the set underneath. This serializes the
/// process-global handler table across loop instances.
pub(crate) struct Armory;

static STACK: OnceLock<Mutex<Vec<Arc<Mutex<SignalSet>>>>> = OnceLock::new();

fn stack() -> &'static Mutex<Vec<Arc<Mutex<SignalSet>>>> {
    STACK.get_or_init(|| Mutex::new(Vec::new()))
}

impl Armory {
    /// Pushes `set` only once its hooks are armed. A failed arm rolls back
    /// any partially armed pipes and restores the previous loop's hooks, so
    /// the stack never holds a set that is not actually armed.
    pub(crate) fn enter(set: &Arc<Mutex<SignalSet>>) -> io::Result<()> {
        let mut stack = stack().lock().unwrap();
        if let Some(top) = stack.last() {
            top.lock().unwrap().disarm();
        }
        if let Err(err) = set.lock().unwrap().arm() {
            set.lock().unwrap().disarm();
            if let Some(top) = stack.last() {
                let _ = top.lock().unwrap().arm();
            }
            return Err(err);
        }
        stack.push(Arc::clone(set));
        Ok(())
    }

    pub(crate) fn exit(set: &Arc<Mutex<SignalSet>>) {
        let mut stack = stack().lock().unwrap();
        let position = match stack.iter().position(|entry| Arc::ptr_eq(entry, set)) {
            Some(position) => position,
            None => return,
        };
        let was_top = position == stack.len() - 1;
        stack.remove(position);
        if was_top {
            set.lock().unwrap().disarm();
            if let Some(top) = stack.last() {
                let _ = top.lock().unwrap().arm();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_hook::low_level::raise;

    // SIGURG and SIGWINCH are ignored by default, so raising them is safe
    // even while no hook is armed. Tests touching the process-global armory
    // stack serialize on this lock.
    static ARMORY_TESTS: Mutex<()> = Mutex::new(());

    #[test]
    fn test_installed_pipe_sees_a_delivery() {
        let mut set = SignalSet::new(true);
        set.install(libc::SIGURG).unwrap();

        raise(libc::SIGURG).unwrap();
        assert!(set.drain(libc::SIGURG));
        assert!(!set.drain(libc::SIGURG));
    }

    #[test]
    fn test_disarmed_set_misses_deliveries() {
        let mut set = SignalSet::new(false);
        set.install(libc::SIGWINCH).unwrap();

        raise(libc::SIGWINCH).unwrap();
        assert!(!set.drain(libc::SIGWINCH));

        set.arm().unwrap();
        raise(libc::SIGWINCH).unwrap();
        assert!(set.drain(libc::SIGWINCH));
        set.disarm();
    }

    #[test]
    fn test_armory_is_lifo() {
        let _serial = ARMORY_TESTS.lock().unwrap();
        let first = Arc::new(Mutex::new(SignalSet::new(false)));
        let second = Arc::new(Mutex::new(SignalSet::new(false)));
        first.lock().unwrap().install(libc::SIGCHLD).unwrap();
        second.lock().unwrap().install(libc::SIGCHLD).unwrap();

        Armory::enter(&first).unwrap();
        Armory::enter(&second).unwrap();

        raise(libc::SIGCHLD).unwrap();
        assert!(second.lock().unwrap().drain(libc::SIGCHLD));
        assert!(!first.lock().unwrap().drain(libc::SIGCHLD));

        Armory::exit(&second);
        raise(libc::SIGCHLD).unwrap();
        assert!(first.lock().unwrap().drain(libc::SIGCHLD));

        Armory::exit(&first);
    }

    #[test]
    fn test_armory_enter_failure_restores_the_previous_loop() {
        let _serial = ARMORY_TESTS.lock().unwrap();
        let good = Arc::new(Mutex::new(SignalSet::new(false)));
        good.lock().unwrap().install(libc::SIGCONT).unwrap();
        // The pipe installs fine while dormant, but SIGKILL can never have a
        // handler, so arming this set must fail.
        let bad = Arc::new(Mutex::new(SignalSet::new(false)));
        bad.lock().unwrap().install(libc::SIGKILL).unwrap();

        Armory::enter(&good).unwrap();
        assert!(Armory::enter(&bad).is_err());

        // The failed entry was never pushed and the previous loop's hooks
        // are back in place.
        raise(libc::SIGCONT).unwrap();
        assert!(good.lock().unwrap().drain(libc::SIGCONT));

        Armory::exit(&bad);
        raise(libc::SIGCONT).unwrap();
        assert!(good.lock().unwrap().drain(libc::SIGCONT));

        Armory::exit(&good);
    }
}
