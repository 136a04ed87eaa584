//! The error taxonomy shared by every driver and the fd lower layer.
//!
//! Drivers never invent ad-hoc error strings; every failure is mapped into one of
//! these kinds so callers can match on it the same way regardless of which driver
//! produced it.

use std::io;

/// A single error kind shared across all drivers and the fd lower layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// An option, address, or argument was malformed or otherwise unacceptable.
  #[error("invalid argument")]
  Invalid,

  /// The operation (or option) is not supported by this driver.
  #[error("not supported")]
  NotSupported,

  /// The object is not in a state where this operation can be performed.
  #[error("not ready")]
  NotReady,

  /// A name (user, group, control, address) could not be resolved.
  #[error("not found")]
  NotFound,

  /// There is no data available right now (distinct from would-block on a socket).
  #[error("no data")]
  NoData,

  /// The object is mid-transition and cannot accept this request.
  #[error("busy")]
  Busy,

  /// Allocation failed.
  #[error("no memory")]
  NoMemory,

  /// The combination of options/arguments is individually valid but mutually
  /// exclusive (e.g. argv together with slave permission options on a PTY).
  #[error("inconsistent configuration")]
  Inconsistent,

  /// A value (typically an address) exceeds a fixed platform-imposed limit.
  #[error("too large")]
  TooLarge,

  /// The peer is gone; surfaced in place of an I/O error that semantically
  /// means "the other end closed", notably EPIPE on a PTY master.
  #[error("remote end closed")]
  RemoteClose,

  /// An I/O error with no more specific mapping.
  #[error("I/O error: {0}")]
  Io(#[source] io::Error),

  /// The operation has not completed and must be retried once the underlying
  /// condition (writability, child exit) is observed.
  #[error("operation in progress")]
  InProgress,

  /// Catch-all for an error surfaced verbatim from the host OS.
  #[error("OS error: {0}")]
  Os(#[source] io::Error),
}

impl Error {
  /// True if this is the sentinel used to request another non-blocking attempt.
  pub fn is_in_progress(&self) -> bool {
    matches!(self, Error::InProgress)
  }

  /// Wraps a raw `errno` value as an OS error, the way the fd-LL does when a
  /// syscall fails and there is no more specific kind to report.
  pub fn from_errno(errno: i32) -> Self {
    Error::Os(io::Error::from_raw_os_error(errno))
  }
}

impl From<io::Error> for Error {
  fn from(e: io::Error) -> Self {
    match e.kind() {
      io::ErrorKind::WouldBlock => Error::InProgress,
      io::ErrorKind::NotFound => Error::NotFound,
      io::ErrorKind::BrokenPipe => Error::RemoteClose,
      _ => Error::Os(e),
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
