//! The OS-services façade.
//!
//! Every driver and the fd lower layer talk to the host exclusively through this
//! trait: non-blocking mode, read/write/exceptional readiness registration,
//! timers, and subprocess wait/kill. A concrete `poll(2)`-backed implementation
//! ([`reactor::Reactor`]) is provided so the drivers are exercisable and
//! testable; a polished, multi-backend OS-services layer is explicitly out of
//! scope (see the crate root docs) — one working Unix implementation is enough
//! to drive the TCP and PTY drivers end to end.

pub mod reactor;

pub use reactor::Reactor;

use crate::error::Result;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

/// Which readiness condition a registration is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
  Read,
  Write,
  /// Exceptional condition; used for TCP out-of-band data (`POLLPRI`).
  Except,
}

/// A callback fired from the reactor's background thread. Drivers capture
/// whatever endpoint/accepter state they need behind their own lock.
pub type Callback = Box<dyn FnMut() + Send>;

/// The façade drivers and the fd lower layer are built against.
///
/// This mirrors `gensio_os_funcs`'s I/O-handling subset: lock allocation is left
/// to [`crate::sync::Mutex`] directly rather than routed through here (the
/// source's "lock allocate/free" indirection has no payoff in Rust), but
/// descriptor readiness, timers, and subprocess control all go through this
/// trait so a driver never calls `libc::poll`/`waitpid` itself.
pub trait OsServices: Send + Sync {
  /// Puts a descriptor into non-blocking mode.
  fn set_non_blocking(&self, fd: RawFd) -> Result<()>;

  /// Registers interest in a readiness condition for `fd`, invoking `cb` each
  /// time the reactor observes it. Replaces any existing callback for the same
  /// `(fd, interest)` pair.
  fn register(&self, fd: RawFd, interest: Interest, cb: Callback) -> Result<()>;

  /// Enables or disables a previously registered interest without discarding
  /// the callback (used by accepter enable/disable).
  fn set_interest_enabled(
    &self,
    fd: RawFd,
    interest: Interest,
    enabled: bool,
  ) -> Result<()>;

  /// Drops every registration for `fd`. Does not close the descriptor.
  fn deregister(&self, fd: RawFd);

  /// Runs `cb` once, after at least `after` has elapsed.
  fn schedule_timeout(&self, after: Duration, cb: Callback);

  /// Non-blocking reap: `Ok(None)` means the child has not exited yet.
  fn wait_subprog(&self, pid: libc::pid_t) -> Result<Option<i32>>;

  /// Sends `SIGTERM` (graceful) or `SIGKILL` (force) to a child.
  fn kill_subprog(&self, pid: libc::pid_t, force: bool) -> Result<()>;

  /// The host-based access check consulted by the TCP accepter before
  /// completing an accept. Returns `Some(diagnostic)` to reject the
  /// connection, `None` to allow it. The default `Reactor` implementation
  /// allows everything; callers needing a policy plug a different
  /// `OsServices` impl in.
  fn access_check(&self, peer: &SocketAddr) -> Option<String>;
}
