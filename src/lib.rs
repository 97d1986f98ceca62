//! A callback-based cooperative event loop.
//!
//! `eddy` multiplexes four kinds of asynchronous activation on a single
//! thread (deferred work, one-shot and periodic timers, descriptor
//! readiness, and unix signals) and can park linear flows of execution
//! against the loop through suspendable fibers. It consists of:
//!
//! - [`driver`]: the reactor core (registration, scheduling, dispatch)
//! - [`fiber`]: stackful cooperative execution contexts
//! - [`suspension`]: pausing a context and resuming it from a callback
//! - [`trace`]: a decorator recording callback provenance for diagnostics
//! - [`clock`]: the monotonic time source
//! - [`error`]: everything that can go wrong
//!
//! ```no_run
//! use eddy::Driver;
//!
//! let driver = Driver::new();
//! let loop_handle = driver.clone();
//! driver.delay(0.1, move |_| {
//!     println!("tick");
//!     loop_handle.stop();
//!     Ok(())
//! });
//! driver.run().unwrap();
//! ```

mod backend;
pub mod callback;
pub mod clock;
pub mod driver;
pub mod error;
pub mod fiber;
mod signals;
pub mod suspension;
mod timer_queue;
pub mod trace;

pub use callback::{CallbackId, CallbackResult};
pub use clock::Clock;
pub use driver::{Driver, ErrorHandler};
pub use error::{BoxError, LoopError};
pub use fiber::Fiber;
pub use suspension::Suspension;
pub use trace::TracingDriver;
