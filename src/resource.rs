//! Resource management for file descriptors.
//!
//! This module provides the [`Resource`] type, the crate's wrapper around an owned
//! OS descriptor (TCP socket, PTY master, listening socket). The fd-LL and the TCP
//! and PTY drivers close every descriptor they own through this type instead of
//! calling `libc::close` directly, so the close-on-last-drop behavior lives in one
//! place. Two call sites are deliberately exempt: `pty.rs`'s forked child closes
//! its inherited master/slave descriptors with raw `libc::close`, since only
//! async-signal-safe functions may run between `fork()` and `exec()`; and the
//! reactor's internal wake-pipe descriptor (`os/reactor.rs`), which is never
//! driver-owned.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

type Inner = RawFd;

/// Internal owned resource with automatic cleanup support.
struct Owned {
  inner: Inner,
  /// Whether this resource has already been closed; guards against a double-close
  /// if both the last `Arc` clone drops and an explicit `close()` race.
  closed: AtomicBool,
}

impl Owned {
  fn new(inner: Inner) -> Self {
    Self { inner, closed: AtomicBool::new(false) }
  }

  fn close_now(&self) {
    if !self.closed.swap(true, Ordering::AcqRel) {
      unsafe {
        libc::close(self.inner);
      }
    }
  }
}

impl Drop for Owned {
  fn drop(&mut self) {
    self.close_now();
  }
}

/// A reference-counted owned file descriptor.
///
/// `Resource` is `Arc`-backed so it can be cloned cheaply and handed to both the
/// reactor (which polls it for readiness) and the driver (which owns its
/// lifecycle); the descriptor is closed exactly once, when the last clone drops.
/// Call [`Resource::close`] to close it eagerly instead of waiting on drop — this
/// is what a driver's teardown path does so the descriptor is released as soon as
/// shutdown is observed rather than whenever the last `Arc` happens to go away.
#[derive(Clone)]
pub struct Resource(Arc<Owned>);

impl FromRawFd for Resource {
  /// Creates a `Resource` from a raw file descriptor.
  ///
  /// # Safety
  ///
  /// The caller must ensure `fd` is a valid, open file descriptor that no other
  /// code will close directly while this `Resource` (or any clone) exists.
  unsafe fn from_raw_fd(fd: RawFd) -> Self {
    Resource(Arc::new(Owned::new(fd)))
  }
}

impl AsFd for Resource {
  fn as_fd(&self) -> BorrowedFd<'_> {
    unsafe { BorrowedFd::borrow_raw(self.0.inner) }
  }
}

impl AsRawFd for Resource {
  fn as_raw_fd(&self) -> RawFd {
    self.0.inner
  }
}

impl Resource {
  /// Closes the underlying descriptor now, regardless of how many clones remain
  /// live. Safe to call more than once or concurrently with the final drop.
  pub fn close(&self) {
    self.0.close_now();
  }
}

impl std::fmt::Debug for Resource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("Resource")
  }
}
