//! The TCP client driver (§4.1): non-blocking connect across an address list,
//! plus the shape an accepted connection reuses for its read/write/control
//! path once the socket is already open.

use super::{apply_standard_options, bind_addr, format_raddr, get_nodelay, new_stream_socket, set_nodelay};
use crate::addr::AddressList;
use crate::error::{Error, Result};
use crate::fdll::{ControlValue, DriverOps, OpenStatus};
use crate::net_utils;
use crate::options::{parse_bool, parse_opt, parse_usize};
use crate::resource::Resource;
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};

const DEFAULT_READBUF: usize = 4096;

/// The operations-table state for one TCP endpoint (§3's "TCP client state").
/// The same struct backs both shapes the source describes: a client driving
/// its own connect-retry loop, and a server-side endpoint that skips straight
/// to the steady read/write/control behavior over an already-accepted socket.
pub struct TcpClientOps {
  addrs: AddressList,
  cursor: usize,
  laddr: Option<SocketAddr>,
  nodelay: bool,
  readbuf: usize,
  raddr: Option<SocketAddr>,
  last_err: Option<Error>,
  is_server_side: bool,
}

impl TcpClientOps {
  /// Builds the client-shape state from a driver option vector (§4.1's
  /// allocator). `readbuf=`, `laddr=`, `nodelay=` are recognized; anything
  /// else is *invalid*.
  pub fn new_client(addrs: AddressList, opts: &[String]) -> Result<Self> {
    let mut readbuf = DEFAULT_READBUF;
    let mut laddr = None;
    let mut nodelay = false;
    for raw in opts {
      let opt = parse_opt(raw);
      match opt.key {
        "readbuf" => readbuf = parse_usize(opt.value)?,
        "laddr" => {
          laddr = Some(
            opt
              .value
              .ok_or(Error::Invalid)?
              .parse::<SocketAddr>()
              .map_err(|_| Error::Invalid)?,
          )
        }
        "nodelay" => nodelay = parse_bool(opt.value)?,
        _ => return Err(Error::Invalid),
      }
    }
    if addrs.is_empty() {
      return Err(Error::Invalid);
    }
    Ok(Self {
      addrs,
      cursor: 0,
      laddr,
      nodelay,
      readbuf,
      raddr: None,
      last_err: None,
      is_server_side: false,
    })
  }

  /// Builds the server-accepted shape: the socket is already open and
  /// connected, so there is no cursor to drive — `raddr` is just the peer
  /// address `accept(2)` returned.
  pub fn new_server(peer: SocketAddr, readbuf: usize, nodelay: bool) -> Self {
    Self {
      addrs: AddressList::new(vec![]),
      cursor: 0,
      laddr: None,
      nodelay,
      readbuf,
      raddr: Some(peer),
      last_err: None,
      is_server_side: true,
    }
  }

  fn attempt(&mut self, addr: SocketAddr) -> Result<OpenStatus> {
    let fd = new_stream_socket(&addr)?;
    if let Err(e) = self.configure_and_connect(fd, addr) {
      drop(unsafe { Resource::from_raw_fd(fd) });
      return Err(e);
    }
    let res = unsafe {
      let storage = net_utils::std_socketaddr_into_libc(addr);
      libc::connect(
        fd,
        (&storage as *const libc::sockaddr_storage).cast(),
        net_utils::socklen(&addr),
      )
    };
    if res == 0 {
      self.raddr = Some(addr);
      return Ok(OpenStatus::Done(fd));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
      return Ok(OpenStatus::InProgress(fd));
    }
    drop(unsafe { Resource::from_raw_fd(fd) });
    Err(Error::from(err))
  }

  fn configure_and_connect(&self, fd: RawFd, _addr: SocketAddr) -> Result<()> {
    set_non_blocking(fd)?;
    apply_standard_options(fd, self.nodelay)?;
    if let Some(laddr) = self.laddr {
      bind_addr(fd, &laddr)?;
    }
    Ok(())
  }

  /// Drives the client's own non-blocking open loop: tries the current cursor
  /// position, and on a synchronous hard failure advances through the rest of
  /// the address list before giving up (§4.1's sub-open description).
  fn try_from_cursor(&mut self) -> Result<OpenStatus> {
    loop {
      let addr = match self.addrs.as_slice().get(self.cursor) {
        Some(a) => *a,
        None => return Err(self.last_err.take().unwrap_or(Error::Invalid)),
      };
      match self.attempt(addr) {
        Ok(status) => return Ok(status),
        Err(e) => {
          self.last_err = Some(e);
          self.cursor += 1;
        }
      }
    }
  }
}

impl DriverOps for TcpClientOps {
  fn sub_open(&mut self) -> Result<OpenStatus> {
    if self.is_server_side {
      return Err(Error::NotSupported);
    }
    self.try_from_cursor()
  }

  fn retry_open(&mut self) -> Result<OpenStatus> {
    self.cursor += 1;
    self.try_from_cursor()
  }

  fn check_open(&mut self, fd: RawFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = unsafe {
      libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut _ as *mut libc::c_void,
        &mut len,
      )
    };
    if res == -1 {
      return Err(Error::from(std::io::Error::last_os_error()));
    }
    if err != 0 {
      return Err(Error::from_errno(err));
    }
    if let Some(addr) = self.addrs.as_slice().get(self.cursor) {
      self.raddr = Some(*addr);
    }
    Ok(())
  }

  fn read_ready(&mut self, fd: RawFd, deliver: &mut dyn FnMut(Vec<u8>)) {
    let mut buf = vec![0u8; self.readbuf];
    loop {
      let n = unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
      };
      if n > 0 {
        deliver(buf[..n as usize].to_vec());
        if (n as usize) < buf.len() {
          break;
        }
      } else {
        break;
      }
    }
  }

  fn except_ready(&mut self, fd: RawFd, deliver: &mut dyn FnMut(Vec<u8>)) {
    let mut buf = vec![0u8; self.readbuf];
    let n = unsafe {
      libc::recv(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        libc::MSG_OOB,
      )
    };
    if n > 0 {
      deliver(buf[..n as usize].to_vec());
    }
  }

  fn write(&mut self, fd: RawFd, buf: &[u8], aux: Option<&str>) -> Result<usize> {
    let flags = match aux {
      None => 0,
      Some("oob") => libc::MSG_OOB,
      Some(_) => return Err(Error::Invalid),
    };
    let n = unsafe {
      libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    };
    if n == -1 {
      return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(n as usize)
  }

  fn raddr_to_str(&self) -> Option<String> {
    self.raddr.as_ref().map(format_raddr)
  }

  fn get_raddr(&self) -> Option<Vec<u8>> {
    self.raddr.map(|a| {
      let storage = net_utils::std_socketaddr_into_libc(a);
      let len = net_utils::socklen(&a) as usize;
      let bytes: &[u8] = unsafe {
        std::slice::from_raw_parts(
          &storage as *const libc::sockaddr_storage as *const u8,
          len,
        )
      };
      bytes.to_vec()
    })
  }

  fn control(
    &mut self,
    fd: Option<RawFd>,
    get: bool,
    key: &str,
    val: ControlValue,
  ) -> Result<ControlValue> {
    if key != "NODELAY" {
      return Err(Error::NotSupported);
    }
    let fd = fd.ok_or(Error::NotReady)?;
    if get {
      Ok(ControlValue::Bool(get_nodelay(fd)?))
    } else {
      match val {
        ControlValue::Bool(b) => {
          set_nodelay(fd, b)?;
          self.nodelay = b;
          Ok(ControlValue::None)
        }
        _ => Err(Error::Invalid),
      }
    }
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
