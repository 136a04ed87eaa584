//! The TCP client and accepter drivers (§4.1, §4.2).

pub mod accepter;
pub mod client;

pub use accepter::TcpAccepter;
pub use client::TcpClientOps;

use crate::error::{Error, Result};
use crate::net_utils;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Socket options applied to every TCP socket this crate creates, client or
/// accepted (§6.4: keep-alive and reuse-address are always enabled).
pub(crate) fn apply_standard_options(fd: RawFd, nodelay: bool) -> Result<()> {
  set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, true)?;
  set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, true)?;
  if nodelay {
    set_nodelay(fd, true)?;
  }
  Ok(())
}

pub(crate) fn set_nodelay(fd: RawFd, on: bool) -> Result<()> {
  set_sockopt_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub(crate) fn get_nodelay(fd: RawFd) -> Result<bool> {
  let mut val: libc::c_int = 0;
  let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
  let res = unsafe {
    libc::getsockopt(
      fd,
      libc::IPPROTO_TCP,
      libc::TCP_NODELAY,
      &mut val as *mut _ as *mut libc::c_void,
      &mut len,
    )
  };
  if res == -1 {
    return Err(Error::from(std::io::Error::last_os_error()));
  }
  Ok(val != 0)
}

fn set_sockopt_bool(
  fd: RawFd,
  level: libc::c_int,
  name: libc::c_int,
  on: bool,
) -> Result<()> {
  let val: libc::c_int = if on { 1 } else { 0 };
  syscall!(setsockopt(
    fd,
    level,
    name,
    &val as *const _ as *const libc::c_void,
    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
  ))?;
  Ok(())
}

/// Creates a non-blocking stream socket for `addr`'s family.
pub(crate) fn new_stream_socket(addr: &SocketAddr) -> Result<RawFd> {
  let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
  Ok(syscall!(socket(domain, libc::SOCK_STREAM, 0))?)
}

pub(crate) fn bind_addr(fd: RawFd, addr: &SocketAddr) -> Result<()> {
  let storage = net_utils::std_socketaddr_into_libc(*addr);
  syscall!(bind(
    fd,
    (&storage as *const libc::sockaddr_storage).cast(),
    net_utils::socklen(addr),
  ))?;
  Ok(())
}

pub(crate) fn format_raddr(addr: &SocketAddr) -> String {
  format!("{},{}", addr.ip(), addr.port())
}
