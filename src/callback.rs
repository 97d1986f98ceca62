//! Callback identifiers and registration records.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::backend::Activation;
use crate::error::BoxError;

/// Identifier of one callback registration.
///
/// Ids are allocated monotonically and never reused: once a registration is
/// cancelled its id can never resolve to a record again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub(crate) u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

impl fmt::Debug for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallbackId({})", self.0)
    }
}

/// What user callbacks return.
///
/// `Ok(())` means the callback completed; an `Err` is routed to the loop's
/// error handler with the callback id attached, and aborts `run` when no
/// handler is installed.
pub type CallbackResult = Result<(), BoxError>;

/// Stored user callable, one shape per invocation payload.
pub(crate) enum Callable {
    /// Deferred and timer callbacks receive their own id.
    Plain(Box<dyn FnMut(CallbackId) -> CallbackResult + Send>),
    /// Stream callbacks receive the id and the watched descriptor.
    Stream(Box<dyn FnMut(CallbackId, RawFd) -> CallbackResult + Send>),
    /// Signal callbacks receive the id and the delivered signal number.
    Signal(Box<dyn FnMut(CallbackId, i32) -> CallbackResult + Send>),
}

/// The variant-specific half of a registration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CallbackKind {
    Defer,
    Timer { interval: f64, repeat: bool },
    Readable { fd: RawFd },
    Writable { fd: RawFd },
    Signal { signo: i32 },
}

pub(crate) struct CallbackRecord {
    pub(crate) id: CallbackId,
    pub(crate) kind: CallbackKind,
    /// Shared so the driver can invoke the callable without holding its
    /// own state lock, keeping re-entrant driver calls safe.
    pub(crate) callable: Arc<Mutex<Callable>>,
    pub(crate) enabled: bool,
    pub(crate) referenced: bool,
    /// Absolute expiration, timer records only.
    pub(crate) expiration: f64,
}

impl CallbackRecord {
    pub(crate) fn new(id: CallbackId, kind: CallbackKind, callable: Callable) -> Self {
        Self {
            id,
            kind,
            callable: Arc::new(Mutex::new(callable)),
            enabled: true,
            referenced: true,
            expiration: 0.0,
        }
    }

    /// A record keeps the loop alive iff it is both enabled and referenced.
    pub(crate) fn keeps_alive(&self) -> bool {
        self.enabled && self.referenced
    }

    /// The backend-facing description of this record, `None` for deferred
    /// records, which the driver dispatches itself.
    pub(crate) fn activation(&self) -> Option<Activation> {
        match self.kind {
            CallbackKind::Defer => None,
            CallbackKind::Timer { .. } => Some(Activation::Timer {
                id: self.id,
                expiration: self.expiration,
            }),
            CallbackKind::Readable { fd } => Some(Activation::Readable { id: self.id, fd }),
            CallbackKind::Writable { fd } => Some(Activation::Writable { id: self.id, fd }),
            CallbackKind::Signal { signo } => Some(Activation::Signal { id: self.id, signo }),
        }
    }
}

impl fmt::Debug for CallbackRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("referenced", &self.referenced)
            .finish()
    }
}
