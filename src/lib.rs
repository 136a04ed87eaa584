#![allow(private_bounds)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # gensio-rs
//!
//! `gensio-rs` abstracts byte-stream I/O endpoints behind a uniform,
//! composable object model: a polymorphic [`Endpoint`] handle backed by a
//! pluggable driver, wired up through a shared non-blocking file-descriptor
//! lower layer ([`fdll`]).
//!
//! Two drivers are provided:
//!
//! - **TCP** ([`tcp`]) — a client driver that connects across an address
//!   list with automatic fallback, and an accepter driver with a
//!   reference-counted listening-socket lifecycle.
//! - **PTY** ([`pty`]) — forks and execs a child process under a
//!   pseudo-terminal, with slave permission/ownership/symlink configuration
//!   and exit-code reaping.
//!
//! ## Platform support
//!
//! | Platform     | fd readiness        | PTY slave configuration |
//! |--------------|----------------------|--------------------------|
//! | Linux        | `poll(2)`            | supported                |
//! | macOS/*BSD   | `poll(2)`            | supported                |
//! | Other Unix   | `poll(2)`            | not supported            |
//! | Windows      | not supported        | not supported            |
//!
//! A single `poll(2)`-backed [`OsServices`] implementation ([`os::Reactor`])
//! is provided so both drivers are exercisable end to end; it is not a
//! multi-backend I/O layer, and plugging in a different `OsServices` (say, one
//! backed by io_uring) is an explicit extension point rather than something
//! this crate tries to anticipate.
//!
//! ## Getting started
//!
//! ```no_run
//! use gensio_rs::{os::Reactor, tcp_alloc, AddressList};
//!
//! let os = Reactor::new().unwrap();
//! let addrs = AddressList::resolve("example.com:80").unwrap();
//! let endpoint = tcp_alloc(addrs, &[], os, Box::new(|_ev| {})).unwrap();
//! endpoint.write(b"GET / HTTP/1.0\r\n\r\n", None).unwrap();
//! ```
//!
//! ## Error handling
//!
//! Every fallible operation returns [`Result<T>`], an alias over [`Error`]: a
//! closed taxonomy (invalid argument, not-supported, not-ready, and so on)
//! that every driver maps its failures into, rather than surfacing ad-hoc
//! error strings (see [`error`]).
//!
//! ## Logging
//!
//! Drivers emit [`tracing`] events under per-component targets
//! (`gensio_rs::tcp::accepter`, `gensio_rs::pty`, ...); this crate does not
//! install a subscriber itself.

#[macro_use]
mod macros;

pub mod addr;
pub mod error;
pub mod fdll;
pub mod endpoint;
pub mod net_utils;
pub mod options;
pub mod os;
pub mod pty;
pub mod resource;
pub mod sync;
pub mod tcp;

pub use addr::AddressList;
pub use endpoint::{Endpoint, EndpointCallback, EndpointEvent};
pub use error::{Error, Result};
pub use os::{OsServices, Reactor};
pub use pty::PtyOps;
pub use resource::Resource;
pub use tcp::{TcpAccepter, TcpAccepterCallback, TcpAccepterEvent, TcpClientOps};

use std::sync::Arc;

/// Allocates a TCP client endpoint (§6.1's `tcp_alloc`): drives the full
/// non-blocking connect-retry protocol across `addrs` before returning.
pub fn tcp_alloc(
  addrs: AddressList,
  opts: &[String],
  os: Arc<dyn OsServices>,
  cb: EndpointCallback,
) -> Result<Endpoint<TcpClientOps>> {
  let ops = TcpClientOps::new_client(addrs, opts)?;
  Endpoint::alloc(ops, os, true, cb)
}

/// Allocates a TCP client endpoint from a `host:port` string (§6.1's
/// `tcp_str_alloc`).
pub fn tcp_str_alloc(
  spec: &str,
  opts: &[String],
  os: Arc<dyn OsServices>,
  cb: EndpointCallback,
) -> Result<Endpoint<TcpClientOps>> {
  tcp_alloc(AddressList::resolve(spec)?, opts, os, cb)
}

/// Allocates a TCP accepter (§6.1's `tcp_accepter_alloc`). The accepter is
/// not listening until [`TcpAccepter::startup`] is called.
pub fn tcp_accepter_alloc(
  addrs: AddressList,
  opts: &[String],
  os: Arc<dyn OsServices>,
  acc_cb: TcpAccepterCallback,
) -> Result<Arc<TcpAccepter>> {
  TcpAccepter::alloc(addrs, opts, os, acc_cb)
}

/// Allocates a TCP accepter from a `host:port` string (§6.1's
/// `tcp_accepter_str_alloc`).
pub fn tcp_accepter_str_alloc(
  spec: &str,
  opts: &[String],
  os: Arc<dyn OsServices>,
  acc_cb: TcpAccepterCallback,
) -> Result<Arc<TcpAccepter>> {
  tcp_accepter_alloc(AddressList::resolve(spec)?, opts, os, acc_cb)
}

/// Allocates a PTY endpoint (§6.1's `pty_alloc`): if `argv` is non-empty, the
/// child is spawned as part of this call.
pub fn pty_alloc(
  argv: Vec<String>,
  opts: &[String],
  os: Arc<dyn OsServices>,
  cb: EndpointCallback,
) -> Result<Endpoint<PtyOps>> {
  let ops = PtyOps::alloc(argv, opts, os.clone())?;
  Endpoint::alloc(ops, os, true, cb)
}

/// Allocates a PTY endpoint from a shell-style command line (§6.1's
/// `pty_str_alloc`).
pub fn pty_str_alloc(
  command: &str,
  opts: &[String],
  os: Arc<dyn OsServices>,
  cb: EndpointCallback,
) -> Result<Endpoint<PtyOps>> {
  let ops = PtyOps::new_from_str(command, opts, os.clone())?;
  Endpoint::alloc(ops, os, true, cb)
}
