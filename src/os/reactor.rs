//! A single background-thread, `poll(2)`-based [`OsServices`] implementation.
//!
//! The source this crate is modeled on lets the OS-services backend be any of
//! several I/O multiplexing strategies (epoll, kqueue, a thread pool). Rather
//! than carry that split here without being able to compile and exercise each
//! variant, one dependency-free backend is provided: a dedicated thread that
//! calls `poll(2)` over every registered descriptor plus a self-pipe used to
//! wake it when a registration changes or a timer is armed from another
//! thread. This is the same self-pipe-wakeup shape used elsewhere in this
//! codebase's epoll/kqueue backends, just without the platform split.

use super::{Callback, Interest, OsServices};
use crate::error::{Error, Result};
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

enum Command {
  Register(RawFd, Interest, Callback),
  SetEnabled(RawFd, Interest, bool),
  Deregister(RawFd),
  Timer(Instant, Callback),
  Shutdown,
}

struct Registration {
  fd: RawFd,
  read: Option<(Callback, bool)>,
  write: Option<(Callback, bool)>,
  except: Option<(Callback, bool)>,
}

impl Registration {
  fn empty(fd: RawFd) -> Self {
    Self { fd, read: None, write: None, except: None }
  }

  fn is_empty(&self) -> bool {
    self.read.is_none() && self.write.is_none() && self.except.is_none()
  }
}

struct PendingTimer {
  at: Instant,
  cb: Callback,
}

impl PartialEq for PendingTimer {
  fn eq(&self, other: &Self) -> bool {
    self.at == other.at
  }
}
impl Eq for PendingTimer {}
impl PartialOrd for PendingTimer {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}
impl Ord for PendingTimer {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    // Reverse so the BinaryHeap (a max-heap) pops the earliest deadline first.
    other.at.cmp(&self.at)
  }
}

/// A `poll(2)`-backed [`OsServices`] implementation running on one background
/// thread, shared by every endpoint/accepter created against it.
pub struct Reactor {
  cmd_tx: crossbeam_channel::Sender<Command>,
  wake_w: RawFd,
  thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Reactor {
  /// Spawns the background poll loop and returns a handle ready for use.
  pub fn new() -> Result<Arc<Self>> {
    let mut pipe_fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } == -1 {
      return Err(Error::from(std::io::Error::last_os_error()));
    }
    let (wake_r, wake_w) = (pipe_fds[0], pipe_fds[1]);
    set_non_blocking_raw(wake_r)?;
    set_non_blocking_raw(wake_w)?;

    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<Command>();

    let thread = std::thread::Builder::new()
      .name("gensio-reactor".into())
      .spawn(move || run_loop(wake_r, cmd_rx))
      .map_err(|e| Error::from(std::io::Error::from(e.kind())))?;

    Ok(Arc::new(Self {
      cmd_tx,
      wake_w,
      thread: std::sync::Mutex::new(Some(thread)),
    }))
  }

  fn wake(&self) {
    let byte = 1u8;
    unsafe {
      libc::write(self.wake_w, &byte as *const u8 as *const libc::c_void, 1);
    }
  }

  fn send(&self, cmd: Command) {
    // The receiver only goes away once the thread is told to shut down, and
    // nothing sends after that, so this channel never actually disconnects
    // while the reactor is reachable.
    let _ = self.cmd_tx.send(cmd);
    self.wake();
  }
}

impl Drop for Reactor {
  fn drop(&mut self) {
    self.send(Command::Shutdown);
    if let Some(handle) = self.thread.lock().unwrap().take() {
      let _ = handle.join();
    }
    unsafe {
      libc::close(self.wake_w);
    }
  }
}

impl OsServices for Reactor {
  fn set_non_blocking(&self, fd: RawFd) -> Result<()> {
    set_non_blocking_raw(fd)
  }

  fn register(&self, fd: RawFd, interest: Interest, cb: Callback) -> Result<()> {
    self.send(Command::Register(fd, interest, cb));
    Ok(())
  }

  fn set_interest_enabled(
    &self,
    fd: RawFd,
    interest: Interest,
    enabled: bool,
  ) -> Result<()> {
    self.send(Command::SetEnabled(fd, interest, enabled));
    Ok(())
  }

  fn deregister(&self, fd: RawFd) {
    self.send(Command::Deregister(fd));
  }

  fn schedule_timeout(&self, after: Duration, cb: Callback) {
    self.send(Command::Timer(Instant::now() + after, cb));
  }

  fn wait_subprog(&self, pid: libc::pid_t) -> Result<Option<i32>> {
    let mut status: libc::c_int = 0;
    let res = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if res == 0 {
      Ok(None)
    } else if res == pid {
      let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
      } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
      } else {
        -1
      };
      Ok(Some(code))
    } else {
      Err(Error::from(std::io::Error::last_os_error()))
    }
  }

  fn kill_subprog(&self, pid: libc::pid_t, force: bool) -> Result<()> {
    let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
    if unsafe { libc::kill(pid, sig) } == -1 {
      return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(())
  }

  fn access_check(&self, _peer: &SocketAddr) -> Option<String> {
    None
  }
}

fn set_non_blocking_raw(fd: RawFd) -> Result<()> {
  let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
  if flags == -1 {
    return Err(Error::from(std::io::Error::last_os_error()));
  }
  if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
    return Err(Error::from(std::io::Error::last_os_error()));
  }
  Ok(())
}

fn apply_command(
  regs: &mut Vec<Registration>,
  timers: &mut BinaryHeap<PendingTimer>,
  cmd: Command,
) -> bool {
  match cmd {
    Command::Register(fd, interest, cb) => {
      let reg = match regs.iter_mut().find(|r| r.fd == fd) {
        Some(r) => r,
        None => {
          regs.push(Registration::empty(fd));
          regs.last_mut().unwrap()
        }
      };
      let slot = match interest {
        Interest::Read => &mut reg.read,
        Interest::Write => &mut reg.write,
        Interest::Except => &mut reg.except,
      };
      *slot = Some((cb, true));
    }
    Command::SetEnabled(fd, interest, enabled) => {
      if let Some(reg) = regs.iter_mut().find(|r| r.fd == fd) {
        let slot = match interest {
          Interest::Read => &mut reg.read,
          Interest::Write => &mut reg.write,
          Interest::Except => &mut reg.except,
        };
        if let Some((_, en)) = slot {
          *en = enabled;
        }
      }
    }
    Command::Deregister(fd) => {
      regs.retain(|r| r.fd != fd);
    }
    Command::Timer(at, cb) => {
      timers.push(PendingTimer { at, cb });
    }
    Command::Shutdown => return true,
  }
  false
}

fn run_loop(wake_r: RawFd, cmd_rx: crossbeam_channel::Receiver<Command>) {
  let mut regs: Vec<Registration> = vec![Registration::empty(wake_r)];
  regs[0].read = Some((Box::new(|| {}), true));
  let mut timers: BinaryHeap<PendingTimer> = BinaryHeap::new();
  let mut drain_buf = [0u8; 64];

  'outer: loop {
    let timeout_ms = match timers.peek() {
      Some(t) => {
        let now = Instant::now();
        if t.at <= now { 0 } else {
          (t.at - now).as_millis().min(i32::MAX as u128) as i32
        }
      }
      None => -1,
    };

    let mut pollfds: Vec<libc::pollfd> = regs
      .iter()
      .map(|r| {
        let mut events = 0;
        if r.read.as_ref().is_some_and(|(_, en)| *en) {
          events |= libc::POLLIN;
        }
        if r.write.as_ref().is_some_and(|(_, en)| *en) {
          events |= libc::POLLOUT;
        }
        if r.except.as_ref().is_some_and(|(_, en)| *en) {
          events |= libc::POLLPRI;
        }
        libc::pollfd { fd: r.fd, events, revents: 0 }
      })
      .collect();

    let n = unsafe {
      libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
    };

    if n < 0 {
      let err = std::io::Error::last_os_error();
      if err.kind() == std::io::ErrorKind::Interrupted {
        continue;
      }
      // Nothing sane to do with a broken poll set other than stop.
      break;
    }

    // Fire due timers first so a timer callback that re-registers readiness
    // is reflected on the same pass's follow-up registration drain below.
    let now = Instant::now();
    while timers.peek().is_some_and(|t| t.at <= now) {
      let mut t = timers.pop().unwrap();
      (t.cb)();
    }

    if n > 0 {
      for (i, pfd) in pollfds.iter().enumerate() {
        if pfd.revents == 0 {
          continue;
        }
        if pfd.fd == wake_r {
          if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            loop {
              let r = unsafe {
                libc::read(
                  wake_r,
                  drain_buf.as_mut_ptr() as *mut libc::c_void,
                  drain_buf.len(),
                )
              };
              if r <= 0 {
                break;
              }
            }
            while let Ok(cmd) = cmd_rx.try_recv() {
              if apply_command(&mut regs, &mut timers, cmd) {
                break 'outer;
              }
            }
          }
          continue;
        }

        let fd = pfd.fd;
        let hup_or_err = pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0;
        let readable = pfd.revents & libc::POLLIN != 0 || hup_or_err;
        let writable = pfd.revents & libc::POLLOUT != 0 || hup_or_err;
        let exceptional = pfd.revents & libc::POLLPRI != 0;

        if let Some(reg) = regs.iter_mut().find(|r| r.fd == fd) {
          if exceptional {
            if let Some((cb, true)) = &mut reg.except {
              cb();
            }
          }
          if readable {
            if let Some((cb, true)) = &mut reg.read {
              cb();
            }
          }
          if writable {
            if let Some((cb, true)) = &mut reg.write {
              cb();
            }
          }
        }
      }
    }

    regs.retain(|r| r.fd == wake_r || !r.is_empty());
  }
}
