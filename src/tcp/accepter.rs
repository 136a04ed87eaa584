//! The TCP accepter driver (§4.2): a listening-socket set, an accept→child
//! pipeline, and a reference-counted shutdown lifecycle.

use super::{apply_standard_options, bind_addr, new_stream_socket};
use super::client::TcpClientOps;
use crate::addr::AddressList;
use crate::endpoint::{AccepterCore, Endpoint};
use crate::error::{Error, Result};
use crate::net_utils;
use crate::options::{parse_bool, parse_opt, parse_usize};
use crate::os::{Interest, OsServices};
use crate::resource::Resource;
use crate::sync::Mutex;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use tracing::{debug, trace, warn};

const DEFAULT_READBUF: usize = 4096;
const LISTEN_BACKLOG: i32 = 16;

/// An event delivered to the accepter's callback (§6.3's `acc_cb`).
pub enum TcpAccepterEvent {
  NewConnection(Endpoint<TcpClientOps>),
  /// A diagnostic the accepter wants logged (`acc_log`); never fatal.
  Log(String),
}

pub type TcpAccepterCallback = Box<dyn FnMut(TcpAccepterEvent) + Send>;

/// The TCP accepter driver (§3's "TCP accepter state").
pub struct TcpAccepter {
  core: AccepterCore,
  os: Arc<dyn OsServices>,
  addrs: AddressList,
  readbuf: usize,
  nodelay: bool,
  acc_cb: Mutex<TcpAccepterCallback>,
}

impl TcpAccepter {
  /// The allocator (§4.2): duplicates the address list, parses `readbuf`/
  /// `nodelay`, and leaves startup to a later call.
  pub fn alloc(
    addrs: AddressList,
    opts: &[String],
    os: Arc<dyn OsServices>,
    acc_cb: TcpAccepterCallback,
  ) -> Result<Arc<Self>> {
    let mut readbuf = DEFAULT_READBUF;
    let mut nodelay = false;
    for raw in opts {
      let opt = parse_opt(raw);
      match opt.key {
        "readbuf" => readbuf = parse_usize(opt.value)?,
        "nodelay" => nodelay = parse_bool(opt.value)?,
        _ => return Err(Error::Invalid),
      }
    }
    Ok(Arc::new(Self {
      core: AccepterCore::new(),
      os,
      addrs,
      readbuf,
      nodelay,
      acc_cb: Mutex::new(acc_cb),
    }))
  }

  pub fn is_enabled(&self) -> bool {
    self.core.is_enabled()
  }

  /// Opens one listening socket per address, registers a read handler on
  /// each, and marks the accepter up (§4.2's startup).
  pub fn startup(self: &Arc<Self>) -> Result<()> {
    let mut listening = Vec::with_capacity(self.addrs.len());
    for addr in self.addrs.as_slice() {
      match self.open_listener(*addr) {
        Ok(fd) => listening.push(fd),
        Err(e) => {
          for fd in &listening {
            self.os.deregister(*fd);
            drop(unsafe { Resource::from_raw_fd(*fd) });
          }
          return Err(e);
        }
      }
    }
    self.core.startup(listening.clone())?;
    for fd in listening {
      let this = self.clone();
      self.os.register(fd, Interest::Read, Box::new(move || this.on_acceptable(fd)))?;
    }
    debug!(target: "gensio_rs::tcp::accepter", listeners = self.core.listening().len(), "accepter started");
    Ok(())
  }

  fn open_listener(&self, addr: SocketAddr) -> Result<RawFd> {
    let fd = new_stream_socket(&addr)?;
    if let Err(e) = self.configure_listener(fd, addr) {
      drop(unsafe { Resource::from_raw_fd(fd) });
      return Err(e);
    }
    Ok(fd)
  }

  fn configure_listener(&self, fd: RawFd, addr: SocketAddr) -> Result<()> {
    set_non_blocking(fd)?;
    apply_standard_options(fd, self.nodelay)?;
    bind_addr(fd, &addr)?;
    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } == -1 {
      return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(())
  }

  /// Accepts as many pending connections as are ready without blocking
  /// (§4.2's read handler). Runs on the reactor thread.
  fn on_acceptable(self: &Arc<Self>, fd: RawFd) {
    loop {
      let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
      let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
      let client_fd = unsafe {
        libc::accept(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len)
      };
      if client_fd == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::WouldBlock {
          warn!(target: "gensio_rs::tcp::accepter", %err, "accept error");
          self.log(format!("accept error: {err}"));
        }
        return;
      }

      let peer = match unsafe { net_utils::libc_socketaddr_into_std(&storage) } {
        Ok(p) => p,
        Err(e) => {
          warn!(target: "gensio_rs::tcp::accepter", %e, "could not decode peer address");
          self.log(format!("accept: could not decode peer address: {e}"));
          drop(unsafe { Resource::from_raw_fd(client_fd) });
          continue;
        }
      };

      if let Some(diagnostic) = self.os.access_check(&peer) {
        unsafe {
          libc::send(
            client_fd,
            diagnostic.as_ptr() as *const libc::c_void,
            diagnostic.len(),
            0,
          );
        }
        drop(unsafe { Resource::from_raw_fd(client_fd) });
        continue;
      }

      if let Err(e) = self.finish_accept(client_fd, peer) {
        warn!(target: "gensio_rs::tcp::accepter", %e, %peer, "server-endpoint setup failed");
        self.log(format!("accept: socket setup failed: {e}"));
        drop(unsafe { Resource::from_raw_fd(client_fd) });
      }
    }
  }

  fn finish_accept(self: &Arc<Self>, client_fd: RawFd, peer: SocketAddr) -> Result<()> {
    set_non_blocking(client_fd)?;
    apply_standard_options(client_fd, self.nodelay)?;

    self.core.incref();
    let ops = TcpClientOps::new_server(peer, self.readbuf, self.nodelay);
    let endpoint = Endpoint::server_alloc(client_fd, ops, self.os.clone(), true, None);
    trace!(target: "gensio_rs::tcp::accepter", %peer, "accepted connection");
    // The accepted socket has no further async open step, so server-open-done
    // fires synchronously here rather than through a separate callback.
    (*self.acc_cb.lock())(TcpAccepterEvent::NewConnection(endpoint));
    self.core.decref(|| {});
    Ok(())
  }

  fn log(&self, msg: String) {
    (*self.acc_cb.lock())(TcpAccepterEvent::Log(msg));
  }

  /// Toggles accept on every listening descriptor (§4.2's enable/disable).
  pub fn set_enabled(self: &Arc<Self>, enabled: bool) {
    if self.core.is_enabled() == enabled {
      return;
    }
    self.core.set_enabled(enabled);
    for fd in self.core.listening() {
      let _ = self.os.set_interest_enabled(fd, Interest::Read, enabled);
    }
  }

  /// Asynchronous shutdown (§4.2): deregisters every listening descriptor,
  /// closes it, and treats that as its "cleared" callback, since this
  /// backend's deregister is synchronous with respect to the calling thread.
  pub fn shutdown(self: &Arc<Self>, done: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
    debug!(target: "gensio_rs::tcp::accepter", "accepter shutting down");
    let listening = self.core.shutdown(done)?;
    for fd in listening {
      self.os.deregister(fd);
      drop(unsafe { Resource::from_raw_fd(fd) });
      let this = self.clone();
      self.core.descriptor_cleared(move || this.core.decref(|| {}));
    }
    Ok(())
  }

  /// Force-clears handlers and closes descriptors directly, without waiting
  /// for cleared callbacks (§4.2's synchronous disable path).
  pub fn disable(self: &Arc<Self>) {
    let listening = match self.core.shutdown(None) {
      Ok(listening) => listening,
      Err(_) => return,
    };
    for fd in listening {
      self.os.deregister(fd);
      drop(unsafe { Resource::from_raw_fd(fd) });
      let this = self.clone();
      self.core.descriptor_cleared(move || this.core.decref(|| {}));
    }
  }

  /// Drops the original allocation reference, shutting down first if still
  /// set up (§4.2's free).
  pub fn free(self: &Arc<Self>) {
    if self.core.is_setup() {
      let _ = self.shutdown(None);
    }
    self.core.decref(|| {});
  }
}

fn set_non_blocking(fd: RawFd) -> Result<()> {
  let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
  if flags == -1 {
    return Err(Error::from(std::io::Error::last_os_error()));
  }
  if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
    return Err(Error::from(std::io::Error::last_os_error()));
  }
  Ok(())
}
