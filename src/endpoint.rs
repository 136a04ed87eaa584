//! The minimal "base gensio" / "base accepter" contract the drivers are built
//! against (§6.3's external collaborator, given just enough body here to be
//! exercisable).

use crate::error::{Error, Result};
use crate::fdll::{ControlValue, DriverOps, FdEvent, FdLL};
use crate::os::OsServices;
use crate::sync::Mutex;
use std::os::fd::RawFd;
use std::sync::Arc;

/// An event delivered to an endpoint's callback.
pub enum EndpointEvent {
  /// The open protocol finished.
  Open(Result<()>),
  /// Bytes arrived; `aux` is `Some("oob")` for out-of-band data.
  Read(Vec<u8>, Option<&'static str>),
  /// The endpoint has fully closed.
  Closed,
}

pub type EndpointCallback = Box<dyn FnMut(EndpointEvent) + Send>;

fn noop_callback() -> EndpointCallback {
  Box::new(|_| {})
}

/// A polymorphic byte-stream handle. Wraps an [`FdLL`] driving a particular
/// [`DriverOps`] implementation and adds the "reliable" metadata bit (§3/GLOSSARY).
///
/// The event callback lives behind a settable slot rather than being fixed at
/// construction: an accepter hands a freshly accepted [`Endpoint`] to its
/// `NEW_CONNECTION` handler before that handler has had a chance to install
/// its own callback, exactly as the collaborator contract in §6.3 describes.
pub struct Endpoint<D: DriverOps + 'static> {
  fdll: Arc<FdLL<D>>,
  cb_slot: Arc<Mutex<EndpointCallback>>,
  reliable: bool,
}

impl<D: DriverOps + 'static> Endpoint<D> {
  /// Allocates a client-side endpoint: drives the full sub_open/retry_open/
  /// check_open protocol before the caller sees anything.
  pub fn alloc(
    ops: D,
    os: Arc<dyn OsServices>,
    reliable: bool,
    cb: EndpointCallback,
  ) -> Result<Self> {
    let cb_slot = Arc::new(Mutex::new(cb));
    let dispatch_slot = cb_slot.clone();
    let fdll = FdLL::open(
      ops,
      os,
      Box::new(move |ev| (*dispatch_slot.lock())(convert_event(ev))),
    )?;
    Ok(Self { fdll, cb_slot, reliable })
  }

  /// Wraps an already-open descriptor, as produced by accepting a connection.
  /// The callback may be the no-op placeholder; install the real one via
  /// [`Endpoint::set_callback`] once the accepter hands this endpoint off.
  pub fn server_alloc(
    fd: RawFd,
    ops: D,
    os: Arc<dyn OsServices>,
    reliable: bool,
    cb: Option<EndpointCallback>,
  ) -> Self {
    let cb_slot = Arc::new(Mutex::new(cb.unwrap_or_else(noop_callback)));
    let dispatch_slot = cb_slot.clone();
    let fdll = FdLL::from_open_fd(
      fd,
      ops,
      os,
      Box::new(move |ev| (*dispatch_slot.lock())(convert_event(ev))),
    );
    Self { fdll, cb_slot, reliable }
  }

  /// Installs (or replaces) the event callback.
  pub fn set_callback(&self, cb: EndpointCallback) {
    *self.cb_slot.lock() = cb;
  }

  pub fn is_reliable(&self) -> bool {
    self.reliable
  }

  pub fn write(&self, buf: &[u8], aux: Option<&str>) -> Result<usize> {
    self.fdll.write(buf, aux)
  }

  pub fn close(&self) {
    self.fdll.close();
  }

  pub fn control(&self, get: bool, key: &str, val: ControlValue) -> Result<ControlValue> {
    self.fdll.control(get, key, val)
  }

  pub fn raddr_to_str(&self) -> Option<String> {
    self.fdll.raddr_to_str()
  }

  pub fn get_raddr(&self) -> Option<Vec<u8>> {
    self.fdll.get_raddr()
  }
}

fn convert_event(ev: FdEvent) -> EndpointEvent {
  match ev {
    FdEvent::OpenDone(r) => EndpointEvent::Open(r),
    FdEvent::Read(data, aux) => EndpointEvent::Read(data, aux),
    FdEvent::Closed => EndpointEvent::Closed,
  }
}

/// An event delivered to an accepter's callback.
pub enum AccepterEvent<D: DriverOps + 'static> {
  NewConnection(Endpoint<D>),
}

/// Shared bookkeeping for an accepter's reference-counted shutdown lifecycle
/// (§3's `setup`/`enabled`/`in_shutdown`/`nr_accept_close_waiting`). One
/// instance backs the TCP accepter driver; a future second accepter driver
/// would reuse the same core.
pub struct AccepterCore {
  inner: Mutex<CoreState>,
}

struct CoreState {
  setup: bool,
  enabled: bool,
  in_shutdown: bool,
  nr_accept_close_waiting: usize,
  refcount: usize,
  listening: Vec<RawFd>,
  shutdown_done: Option<Box<dyn FnOnce() + Send>>,
}

impl AccepterCore {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(CoreState {
        setup: false,
        enabled: false,
        in_shutdown: false,
        nr_accept_close_waiting: 0,
        refcount: 1,
        listening: Vec::new(),
        shutdown_done: None,
      }),
    }
  }

  pub fn is_setup(&self) -> bool {
    self.inner.lock().setup
  }

  pub fn is_enabled(&self) -> bool {
    self.inner.lock().enabled
  }

  pub fn is_in_shutdown(&self) -> bool {
    self.inner.lock().in_shutdown
  }

  /// Installs the listening descriptor set and marks the accepter up. Fails
  /// with *busy* if already `setup` or mid-shutdown.
  pub fn startup(&self, listening: Vec<RawFd>) -> Result<()> {
    let mut state = self.inner.lock();
    if state.setup || state.in_shutdown {
      return Err(Error::Busy);
    }
    state.listening = listening;
    state.setup = true;
    state.enabled = true;
    state.refcount += 1;
    Ok(())
  }

  pub fn listening(&self) -> Vec<RawFd> {
    self.inner.lock().listening.clone()
  }

  pub fn set_enabled(&self, enabled: bool) {
    self.inner.lock().enabled = enabled;
  }

  pub fn incref(&self) {
    self.inner.lock().refcount += 1;
  }

  /// Drops one reference; runs `on_zero` (under no lock) exactly once, when
  /// the count reaches zero.
  pub fn decref(&self, on_zero: impl FnOnce()) {
    let hit_zero = {
      let mut state = self.inner.lock();
      debug_assert!(state.refcount > 0);
      state.refcount -= 1;
      state.refcount == 0
    };
    if hit_zero {
      on_zero();
    }
  }

  /// Begins asynchronous shutdown. `on_each_cleared` is expected to be called
  /// by the driver once per listening descriptor as its clear completes;
  /// `done` fires after the last one, strictly after every descriptor's
  /// cleared callback (§5 ordering guarantee (b)).
  pub fn shutdown(
    &self,
    done: Option<Box<dyn FnOnce() + Send>>,
  ) -> Result<Vec<RawFd>> {
    let mut state = self.inner.lock();
    if !state.setup {
      return Err(Error::Busy);
    }
    state.in_shutdown = true;
    state.nr_accept_close_waiting = state.listening.len();
    state.shutdown_done = done;
    state.setup = false;
    state.enabled = false;
    Ok(std::mem::take(&mut state.listening))
  }

  /// Called once per listening descriptor's cleared callback. When the last
  /// one reports in, clears `in_shutdown` and fires the shutdown-done
  /// callback, then drops the refcount startup took.
  pub fn descriptor_cleared(&self, drop_startup_ref: impl FnOnce()) {
    let (hit_zero, done) = {
      let mut state = self.inner.lock();
      if state.nr_accept_close_waiting > 0 {
        state.nr_accept_close_waiting -= 1;
      }
      if state.nr_accept_close_waiting == 0 {
        state.in_shutdown = false;
        (true, state.shutdown_done.take())
      } else {
        (false, None)
      }
    };
    if hit_zero {
      if let Some(done) = done {
        done();
      }
      drop_startup_ref();
    }
  }
}

impl Default for AccepterCore {
  fn default() -> Self {
    Self::new()
  }
}
