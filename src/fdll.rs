//! The file-descriptor lower layer (fd-LL): owns a non-blocking descriptor and
//! serializes the callbacks a driver's operations table receives.
//!
//! This is the collaborator spec.md treats as "external" (§6.3) but whose
//! contract every driver is written against, so it has to exist as real code
//! here. [`DriverOps`] is the operations-table trait (§9's "capability
//! record"): the two TCP shapes and the PTY driver each implement it, relying
//! on default methods for whichever table entries they don't populate, the
//! same way the source leaves unused function-pointer slots null.

use crate::error::{Error, Result};
use crate::os::{Interest, OsServices};
use crate::resource::Resource;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::{Arc, Mutex};

/// Outcome of the non-blocking open protocol's first two steps.
pub enum OpenStatus {
  /// The descriptor is immediately usable.
  Done(RawFd),
  /// The descriptor was created but the operation (connect, spawn) has not
  /// finished; the fd-LL will await writability and call [`DriverOps::check_open`].
  InProgress(RawFd),
}

/// Outcome of [`DriverOps::check_close`].
pub enum CloseStatus {
  /// Teardown is complete; the fd-LL may close the descriptor.
  Done,
  /// Not finished; try again after the given delay (used by the PTY driver's
  /// bounded reap polling).
  Retry(std::time::Duration),
}

/// A single value flowing through [`DriverOps::control`].
#[derive(Debug, Clone)]
pub enum ControlValue {
  None,
  Bool(bool),
  Int(i64),
  Text(String),
  Bytes(Vec<u8>),
}

/// An event the fd-LL delivers to the endpoint's callback.
pub enum FdEvent {
  /// The non-blocking open protocol finished, successfully or not.
  OpenDone(Result<()>),
  /// Bytes arrived. `aux` is `Some("oob")` for out-of-band data delivered via
  /// [`DriverOps::except_ready`], `None` for the ordinary in-band path.
  Read(Vec<u8>, Option<&'static str>),
  /// The fd-LL has fully torn the descriptor down.
  Closed,
}

/// The operations table a driver populates. Every method has a default that
/// returns *not-supported* (or does nothing, for the readiness callbacks),
/// standing in for a null function pointer in the table this models.
pub trait DriverOps: Send {
  /// First attempt to establish the descriptor (connect, or PTY spawn).
  fn sub_open(&mut self) -> Result<OpenStatus>;

  /// Advance past a failed attempt (TCP client only: advance the address
  /// cursor and try the next address).
  fn retry_open(&mut self) -> Result<OpenStatus> {
    Err(Error::NotSupported)
  }

  /// Validate an async-completed open (TCP client only: read `SO_ERROR`).
  fn check_open(&mut self, _fd: RawFd) -> Result<()> {
    Ok(())
  }

  /// Drive final teardown (PTY only: unlink the symlink, reap the child).
  fn check_close(&mut self) -> Result<CloseStatus> {
    Ok(CloseStatus::Done)
  }

  /// Called when `fd` is readable. Implementations read as much as they can
  /// non-blockingly and pass bytes to `deliver`; translate a hard read error
  /// the way the driver's write mapping does (e.g. PTY EPIPE → remote-close).
  fn read_ready(&mut self, fd: RawFd, deliver: &mut dyn FnMut(Vec<u8>));

  /// Called on an exceptional condition (TCP out-of-band data). Default: no
  /// driver populates this except the TCP client.
  fn except_ready(&mut self, _fd: RawFd, _deliver: &mut dyn FnMut(Vec<u8>)) {}

  /// Serialized write path. `aux` carries the `oob` tag for an out-of-band send.
  fn write(&mut self, fd: RawFd, buf: &[u8], aux: Option<&str>) -> Result<usize>;

  fn raddr_to_str(&self) -> Option<String> {
    None
  }

  fn get_raddr(&self) -> Option<Vec<u8>> {
    None
  }

  fn control(
    &mut self,
    fd: Option<RawFd>,
    get: bool,
    key: &str,
    val: ControlValue,
  ) -> Result<ControlValue> {
    let _ = (fd, get, key, val);
    Err(Error::NotSupported)
  }

  /// Final release of driver-owned state, called once the fd-LL has nothing
  /// left to do with the descriptor.
  fn free(&mut self) {}
}

struct State<D: DriverOps> {
  fd: Option<Resource>,
  ops: D,
}

/// Owns one descriptor's lifecycle and dispatches its readiness callbacks to a
/// [`DriverOps`] implementation, forwarding the results to an endpoint-level
/// event sink.
pub struct FdLL<D: DriverOps + 'static> {
  os: Arc<dyn OsServices>,
  state: Mutex<State<D>>,
  on_event: Mutex<Box<dyn FnMut(FdEvent) + Send>>,
}

impl<D: DriverOps + 'static> FdLL<D> {
  /// Begins the non-blocking open protocol: calls `sub_open`, and if that
  /// returns `InProgress`, arms a writability registration that drives
  /// `check_open`/`retry_open` until the descriptor is usable or the driver
  /// gives up.
  pub fn open(
    ops: D,
    os: Arc<dyn OsServices>,
    on_event: Box<dyn FnMut(FdEvent) + Send>,
  ) -> Result<Arc<Self>> {
    let this = Arc::new(Self {
      os,
      state: Mutex::new(State { fd: None, ops }),
      on_event: Mutex::new(on_event),
    });
    let status = {
      let mut state = this.state.lock().unwrap();
      state.ops.sub_open()
    }?;
    this.drive_open_status(status)?;
    Ok(this)
  }

  /// Wraps an already-open descriptor (the TCP accepter's accept path: the
  /// socket is open and connected the moment `accept(2)` returns).
  pub fn from_open_fd(
    fd: RawFd,
    ops: D,
    os: Arc<dyn OsServices>,
    on_event: Box<dyn FnMut(FdEvent) + Send>,
  ) -> Arc<Self> {
    let this = Arc::new(Self {
      os,
      state: Mutex::new(State { fd: Some(unsafe { Resource::from_raw_fd(fd) }), ops }),
      on_event: Mutex::new(on_event),
    });
    this.clone().arm_steady_state(fd);
    (this.on_event.lock().unwrap())(FdEvent::OpenDone(Ok(())));
    this
  }

  fn drive_open_status(self: &Arc<Self>, status: OpenStatus) -> Result<()> {
    match status {
      OpenStatus::Done(fd) => {
        self.state.lock().unwrap().fd = Some(unsafe { Resource::from_raw_fd(fd) });
        self.clone().arm_steady_state(fd);
        (self.on_event.lock().unwrap())(FdEvent::OpenDone(Ok(())));
        Ok(())
      }
      OpenStatus::InProgress(fd) => {
        self.state.lock().unwrap().fd = Some(unsafe { Resource::from_raw_fd(fd) });
        let this = self.clone();
        self.os.register(
          fd,
          Interest::Write,
          Box::new(move || this.on_connect_writable(fd)),
        )?;
        Ok(())
      }
    }
  }

  fn on_connect_writable(self: &Arc<Self>, fd: RawFd) {
    self.os.deregister(fd);
    let result = {
      let mut state = self.state.lock().unwrap();
      state.ops.check_open(fd)
    };
    match result {
      Ok(()) => {
        self.clone().arm_steady_state(fd);
        (self.on_event.lock().unwrap())(FdEvent::OpenDone(Ok(())));
      }
      Err(_first_err) => {
        // Close through the Resource held in state, not the raw `fd`
        // parameter: on a later call state.fd may already hold a
        // different (possibly reused) descriptor.
        let res = self.state.lock().unwrap().fd.take();
        if let Some(res) = res {
          res.close();
        }
        self.retry_after_failure();
      }
    }
  }

  fn retry_after_failure(self: &Arc<Self>) {
    let status = {
      let mut state = self.state.lock().unwrap();
      state.ops.retry_open()
    };
    match status {
      Ok(s) => {
        if let Err(e) = self.drive_open_status(s) {
          (self.on_event.lock().unwrap())(FdEvent::OpenDone(Err(e)));
        }
      }
      Err(e) => {
        (self.on_event.lock().unwrap())(FdEvent::OpenDone(Err(e)));
      }
    }
  }

  fn arm_steady_state(self: Arc<Self>, fd: RawFd) {
    let read_this = self.clone();
    let _ = self.os.register(
      fd,
      Interest::Read,
      Box::new(move || read_this.on_readable(fd)),
    );
    let except_this = self.clone();
    let _ = self.os.register(
      fd,
      Interest::Except,
      Box::new(move || except_this.on_exceptional(fd)),
    );
  }

  fn on_readable(self: &Arc<Self>, fd: RawFd) {
    let mut bufs = Vec::new();
    {
      let mut state = self.state.lock().unwrap();
      state.ops.read_ready(fd, &mut |data| bufs.push(data));
    }
    let mut sink = self.on_event.lock().unwrap();
    for data in bufs {
      sink(FdEvent::Read(data, None));
    }
  }

  fn on_exceptional(self: &Arc<Self>, fd: RawFd) {
    let mut bufs = Vec::new();
    {
      let mut state = self.state.lock().unwrap();
      state.ops.except_ready(fd, &mut |data| bufs.push(data));
    }
    let mut sink = self.on_event.lock().unwrap();
    for data in bufs {
      sink(FdEvent::Read(data, Some("oob")));
    }
  }

  pub fn write(&self, buf: &[u8], aux: Option<&str>) -> Result<usize> {
    let mut state = self.state.lock().unwrap();
    let fd = state.fd.as_ref().map(|r| r.as_raw_fd()).ok_or(Error::NotReady)?;
    state.ops.write(fd, buf, aux)
  }

  pub fn control(&self, get: bool, key: &str, val: ControlValue) -> Result<ControlValue> {
    let mut state = self.state.lock().unwrap();
    let fd = state.fd.as_ref().map(|r| r.as_raw_fd());
    state.ops.control(fd, get, key, val)
  }

  pub fn raddr_to_str(&self) -> Option<String> {
    self.state.lock().unwrap().ops.raddr_to_str()
  }

  pub fn get_raddr(&self) -> Option<Vec<u8>> {
    self.state.lock().unwrap().ops.get_raddr()
  }

  /// Begins final teardown: deregisters readiness, then polls `check_close`
  /// (re-arming a timer if it asks for a retry) until it reports done, then
  /// closes the descriptor and fires [`FdEvent::Closed`].
  pub fn close(self: &Arc<Self>) {
    let fd = self.state.lock().unwrap().fd.as_ref().map(|r| r.as_raw_fd());
    if let Some(fd) = fd {
      self.os.deregister(fd);
    }
    self.drive_close();
  }

  fn drive_close(self: &Arc<Self>) {
    let status = self.state.lock().unwrap().ops.check_close();
    match status {
      Ok(CloseStatus::Done) => {
        let res = self.state.lock().unwrap().fd.take();
        if let Some(res) = res {
          res.close();
        }
        self.state.lock().unwrap().ops.free();
        (self.on_event.lock().unwrap())(FdEvent::Closed);
      }
      Ok(CloseStatus::Retry(after)) => {
        let this = self.clone();
        self.os.schedule_timeout(after, Box::new(move || this.drive_close()));
      }
      Err(_) => {
        // check_close has no error path in the source; treat as done to
        // avoid leaking the descriptor.
        let res = self.state.lock().unwrap().fd.take();
        if let Some(res) = res {
          res.close();
        }
        (self.on_event.lock().unwrap())(FdEvent::Closed);
      }
    }
  }
}
