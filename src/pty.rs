//! The PTY driver (§4.3): opens a master pseudo-terminal, configures the
//! slave side, forks and execs a child under it, and reaps the child on
//! close.
//!
//! Slave configuration (mode/owner/group/symlink) and `ptsname_r` itself are
//! only available on platforms with a reentrant pts-name helper, matched by
//! the `has_ptsname_r` cfg alias `build.rs` defines from the same platform
//! list the source guards with `HAVE_PTSNAME_R`.

use crate::error::{Error, Result};
use crate::fdll::{CloseStatus, ControlValue, DriverOps, OpenStatus};
use crate::options::{parse_bool, parse_opt, parse_perm, parse_octal_digit};
use crate::os::OsServices;
use crate::resource::Resource;
use std::ffi::CString;
use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const DEFAULT_READBUF: usize = 4096;
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Slave-side configuration collected by the allocator (§3's "slave
/// permission descriptor" plus the optional owner/group/symlink fields).
/// Only meaningful on `has_ptsname_r` platforms and only for a detached PTY.
#[cfg(has_ptsname_r)]
#[derive(Default)]
struct SlaveConfig {
  mode: Option<(u32, u32, u32)>,
  owner: Option<String>,
  group: Option<String>,
  link: Option<String>,
  forcelink: bool,
  link_created: bool,
}

/// The operations-table state for a PTY endpoint (§3's "PTY state").
pub struct PtyOps {
  os: Arc<dyn OsServices>,
  readbuf: usize,
  raw: bool,
  argv: Vec<String>,
  env: Option<Vec<String>>,
  #[cfg(has_ptsname_r)]
  slave: SlaveConfig,
  slave_name: Option<String>,
  pid: Option<libc::pid_t>,
  exit_code: Option<i32>,
  cleaned_up: bool,
}

impl PtyOps {
  /// The allocator (§4.3): parses `readbuf`/`raw`, and on `has_ptsname_r`
  /// platforms the slave-configuration options. Rejects argv together with
  /// any of mode/owner/group with *inconsistent*, since those only apply to
  /// a detached PTY.
  pub fn alloc(argv: Vec<String>, opts: &[String], os: Arc<dyn OsServices>) -> Result<Self> {
    let mut readbuf = DEFAULT_READBUF;
    let mut raw = false;
    #[cfg(has_ptsname_r)]
    let mut slave = SlaveConfig::default();
    #[cfg(has_ptsname_r)]
    let mut umode: Option<u32> = None;
    #[cfg(has_ptsname_r)]
    let mut gmode: Option<u32> = None;
    #[cfg(has_ptsname_r)]
    let mut omode: Option<u32> = None;

    for raw_opt in opts {
      let opt = parse_opt(raw_opt);
      match opt.key {
        "readbuf" => readbuf = crate::options::parse_usize(opt.value)?,
        "raw" => raw = parse_bool(opt.value)?,
        #[cfg(has_ptsname_r)]
        "link" => slave.link = Some(opt.value.ok_or(Error::Invalid)?.to_string()),
        #[cfg(has_ptsname_r)]
        "forcelink" => slave.forcelink = parse_bool(opt.value)?,
        #[cfg(has_ptsname_r)]
        "umode" => umode = Some(parse_octal_digit(opt.value)?),
        #[cfg(has_ptsname_r)]
        "gmode" => gmode = Some(parse_octal_digit(opt.value)?),
        #[cfg(has_ptsname_r)]
        "omode" => omode = Some(parse_octal_digit(opt.value)?),
        #[cfg(has_ptsname_r)]
        "perm" => {
          let (u, g, o) = parse_perm(opt.value)?;
          umode = Some(u);
          gmode = Some(g);
          omode = Some(o);
        }
        #[cfg(has_ptsname_r)]
        "owner" => slave.owner = Some(opt.value.ok_or(Error::Invalid)?.to_string()),
        #[cfg(has_ptsname_r)]
        "group" => slave.group = Some(opt.value.ok_or(Error::Invalid)?.to_string()),
        _ => return Err(Error::Invalid),
      }
    }

    #[cfg(has_ptsname_r)]
    {
      if umode.is_some() || gmode.is_some() || omode.is_some() {
        slave.mode = Some((umode.unwrap_or(6), gmode.unwrap_or(6), omode.unwrap_or(6)));
      }
      if !argv.is_empty() && (slave.mode.is_some() || slave.owner.is_some() || slave.group.is_some()) {
        return Err(Error::Inconsistent);
      }
    }

    Ok(Self {
      os,
      readbuf,
      raw,
      argv,
      env: None,
      #[cfg(has_ptsname_r)]
      slave,
      slave_name: None,
      pid: None,
      exit_code: None,
      cleaned_up: false,
    })
  }

  /// Parses a shell-style command line into argv and forwards to [`PtyOps::alloc`].
  pub fn new_from_str(command: &str, opts: &[String], os: Arc<dyn OsServices>) -> Result<Self> {
    Self::alloc(shell_split(command)?, opts, os)
  }

  #[cfg(has_ptsname_r)]
  fn setup_pty(&mut self, master: &nix::pty::PtyMaster) -> Result<()> {
    let name = nix::pty::ptsname_r(master).map_err(|e| Error::from_errno(e as i32))?;

    if let Some((u, g, o)) = self.slave.mode {
      let mode = (u << 6) | (g << 3) | o;
      let path = CString::new(name.as_str()).map_err(|_| Error::Invalid)?;
      if unsafe { libc::chmod(path.as_ptr(), mode) } == -1 {
        return Err(Error::from(std::io::Error::last_os_error()));
      }
    }

    let mut ownerid: libc::uid_t = u32::MAX;
    let mut groupid: libc::gid_t = u32::MAX;
    if let Some(owner) = &self.slave.owner {
      let user = nix::unistd::User::from_name(owner)
        .map_err(|e| Error::from_errno(e as i32))?
        .ok_or(Error::NotFound)?;
      ownerid = user.uid.as_raw();
    }
    if let Some(group) = &self.slave.group {
      let grp = nix::unistd::Group::from_name(group)
        .map_err(|e| Error::from_errno(e as i32))?
        .ok_or(Error::NotFound)?;
      groupid = grp.gid.as_raw();
    }
    if ownerid != u32::MAX || groupid != u32::MAX {
      let path = CString::new(name.as_str()).map_err(|_| Error::Invalid)?;
      if unsafe { libc::chown(path.as_ptr(), ownerid, groupid) } == -1 {
        return Err(Error::from(std::io::Error::last_os_error()));
      }
    }

    if let Some(link) = self.slave.link.clone() {
      let mut retried = false;
      loop {
        match std::os::unix::fs::symlink(&name, &link) {
          Ok(()) => {
            self.slave.link_created = true;
            break;
          }
          Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && self.slave.forcelink && !retried => {
            debug!(target: "gensio_rs::pty", %link, "forcelink: replacing existing symlink");
            let _ = std::fs::remove_file(&link);
            retried = true;
          }
          Err(e) => {
            warn!(target: "gensio_rs::pty", %link, %e, "symlink creation failed");
            return Err(Error::from(e));
          }
        }
      }
    }

    trace!(target: "gensio_rs::pty", slave = %name, "slave configured");
    self.slave_name = Some(name);
    Ok(())
  }

  #[cfg(has_ptsname_r)]
  fn cleanup_pty(&mut self) {
    if self.slave.link_created {
      if let Some(link) = &self.slave.link {
        trace!(target: "gensio_rs::pty", %link, "removing slave symlink");
        let _ = std::fs::remove_file(link);
      }
      self.slave.link_created = false;
    }
  }

  #[cfg(not(has_ptsname_r))]
  fn cleanup_pty(&mut self) {}

  fn make_raw(&self, master_fd: RawFd) -> Result<()> {
    use nix::sys::termios::{self, SetArg};
    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(master_fd) };
    let mut term = termios::tcgetattr(fd).map_err(|e| Error::from_errno(e as i32))?;
    termios::cfmakeraw(&mut term);
    termios::tcsetattr(fd, SetArg::TCSANOW, &term).map_err(|e| Error::from_errno(e as i32))?;
    Ok(())
  }

  fn spawn_child(&mut self, master_fd: RawFd) -> Result<()> {
    let slave_name = self.slave_name.clone().ok_or(Error::NotReady)?;
    let slave_path = CString::new(slave_name.as_str()).map_err(|_| Error::Invalid)?;
    let argv_c: Vec<CString> = self
      .argv
      .iter()
      .map(|s| CString::new(s.as_str()).map_err(|_| Error::Invalid))
      .collect::<Result<_>>()?;
    let env_c: Option<Vec<CString>> = match &self.env {
      Some(env) => Some(
        env
          .iter()
          .map(|s| CString::new(s.as_str()).map_err(|_| Error::Invalid))
          .collect::<Result<_>>()?,
      ),
      None => None,
    };

    match unsafe { nix::unistd::fork() }.map_err(|e| Error::from_errno(e as i32))? {
      nix::unistd::ForkResult::Parent { child } => {
        debug!(target: "gensio_rs::pty", pid = child.as_raw(), "child spawned");
        self.pid = Some(child.as_raw());
        Ok(())
      }
      nix::unistd::ForkResult::Child => {
        let _ = nix::unistd::setsid();
        unsafe {
          libc::close(master_fd);
        }
        let slave_fd = unsafe { libc::open(slave_path.as_ptr(), libc::O_RDWR) };
        if slave_fd < 0 {
          unsafe { libc::_exit(127) };
        }
        unsafe {
          libc::dup2(slave_fd, 0);
          libc::dup2(slave_fd, 1);
          libc::dup2(slave_fd, 2);
          if slave_fd > 2 {
            libc::close(slave_fd);
          }
        }
        match &env_c {
          Some(envv) => {
            let _ = nix::unistd::execve(&argv_c[0], &argv_c, envv);
          }
          None => {
            let _ = nix::unistd::execvp(&argv_c[0], &argv_c);
          }
        }
        // execv{e,p} only returns on failure.
        unsafe { libc::_exit(127) };
      }
    }
  }

  fn reap(&mut self) -> Result<Option<i32>> {
    if let Some(code) = self.exit_code {
      return Ok(Some(code));
    }
    let pid = self.pid.ok_or(Error::NotReady)?;
    match self.os.wait_subprog(pid)? {
      Some(code) => {
        self.exit_code = Some(code);
        Ok(Some(code))
      }
      None => Ok(None),
    }
  }
}

impl DriverOps for PtyOps {
  #[cfg(has_ptsname_r)]
  fn sub_open(&mut self) -> Result<OpenStatus> {
    use nix::fcntl::OFlag;
    use nix::pty::{grantpt, posix_openpt, unlockpt};
    use std::os::fd::IntoRawFd;

    let master =
      posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(|e| Error::from_errno(e as i32))?;
    grantpt(&master).map_err(|e| Error::from_errno(e as i32))?;
    unlockpt(&master).map_err(|e| Error::from_errno(e as i32))?;

    if let Err(e) = self.setup_pty(&master) {
      self.cleanup_pty();
      return Err(e);
    }

    let master_fd = master.into_raw_fd();
    if let Err(e) = self.finish_open(master_fd) {
      self.cleanup_pty();
      drop(unsafe { Resource::from_raw_fd(master_fd) });
      return Err(e);
    }
    Ok(OpenStatus::Done(master_fd))
  }

  #[cfg(not(has_ptsname_r))]
  fn sub_open(&mut self) -> Result<OpenStatus> {
    Err(Error::NotSupported)
  }

  fn check_close(&mut self) -> Result<CloseStatus> {
    if !self.cleaned_up {
      self.cleanup_pty();
      self.cleaned_up = true;
    }
    match self.reap() {
      Ok(Some(_)) => Ok(CloseStatus::Done),
      Ok(None) => Ok(CloseStatus::Retry(REAP_POLL_INTERVAL)),
      Err(e) => Err(e),
    }
  }

  fn read_ready(&mut self, fd: RawFd, deliver: &mut dyn FnMut(Vec<u8>)) {
    let mut buf = vec![0u8; self.readbuf];
    loop {
      let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
      if n > 0 {
        deliver(buf[..n as usize].to_vec());
        if (n as usize) < buf.len() {
          break;
        }
      } else {
        // PTYs report EIO rather than returning 0 at EOF; either way there is
        // nothing further to read right now.
        break;
      }
    }
  }

  fn write(&mut self, fd: RawFd, buf: &[u8], aux: Option<&str>) -> Result<usize> {
    if aux.is_some() {
      return Err(Error::Invalid);
    }
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n == -1 {
      // PTYs do not reliably deliver EPIPE as the OS error kind it normally
      // would; map the I/O failure straight to remote-close regardless.
      let err = std::io::Error::last_os_error();
      return match err.raw_os_error() {
        Some(libc::EIO) | Some(libc::EPIPE) => Err(Error::RemoteClose),
        _ => Err(Error::from(err)),
      };
    }
    Ok(n as usize)
  }

  fn raddr_to_str(&self) -> Option<String> {
    Some(shell_quote_join(&self.argv))
  }

  fn get_raddr(&self) -> Option<Vec<u8>> {
    Some(self.argv.join("\0").into_bytes())
  }

  fn control(
    &mut self,
    fd: Option<RawFd>,
    get: bool,
    key: &str,
    val: ControlValue,
  ) -> Result<ControlValue> {
    match (key, get) {
      ("ENVIRONMENT", false) => {
        if self.argv.is_empty() {
          return Err(Error::NotSupported);
        }
        match val {
          ControlValue::Text(s) => {
            self.env = Some(shell_split(&s)?);
            Ok(ControlValue::None)
          }
          _ => Err(Error::Invalid),
        }
      }
      ("ARGS", false) => {
        if fd.is_some() {
          return Err(Error::NotReady);
        }
        match val {
          ControlValue::Text(s) => {
            self.argv = shell_split(&s)?;
            Ok(ControlValue::None)
          }
          _ => Err(Error::Invalid),
        }
      }
      ("EXIT_CODE", true) => self.exit_code.map(|c| ControlValue::Int(c as i64)).ok_or(Error::NotReady),
      ("KILL_TASK", false) => {
        let pid = self.pid.ok_or(Error::NotReady)?;
        let force = match val {
          ControlValue::Int(v) => v != 0,
          ControlValue::Bool(b) => b,
          _ => return Err(Error::Invalid),
        };
        self.os.kill_subprog(pid, force).map(|_| ControlValue::None)
      }
      ("WAIT_TASK", true) => {
        let code = self.reap()?.ok_or(Error::InProgress)?;
        Ok(ControlValue::Text(code.to_string()))
      }
      ("LADDR", true) | ("LPORT", true) => {
        self.slave_name.clone().map(ControlValue::Text).ok_or(Error::NotReady)
      }
      ("RADDR", true) => Ok(ControlValue::Text(shell_quote_join(&self.argv))),
      ("RADDR_BIN", true) => Ok(ControlValue::Int(fd.unwrap_or(-1) as i64)),
      ("REMOTE_ID", true) => self.pid.map(|p| ControlValue::Text(p.to_string())).ok_or(Error::NotReady),
      _ => Err(Error::NotSupported),
    }
  }

  fn free(&mut self) {}
}

impl PtyOps {
  /// Runs the part of sub-open that happens after the slave is configured:
  /// the optional raw-mode switch, and — if argv was given — the
  /// fork+exec+PID readback (§4.3's sub-open).
  fn finish_open(&mut self, master_fd: RawFd) -> Result<()> {
    if self.raw {
      self.make_raw(master_fd)?;
    }
    if !self.argv.is_empty() {
      self.spawn_child(master_fd)?;
    }
    Ok(())
  }
}

/// A minimal shell-style tokenizer (§4.4): splits on whitespace, honoring
/// single and double quotes. Not a full shell grammar — enough for the
/// argv-from-string constructors and the `ARGS`/`ENVIRONMENT` controls.
fn shell_split(s: &str) -> Result<Vec<String>> {
  let mut out = Vec::new();
  let mut cur = String::new();
  let mut in_tok = false;
  let mut quote: Option<char> = None;
  for c in s.chars() {
    match quote {
      Some(q) => {
        if c == q {
          quote = None;
        } else {
          cur.push(c);
        }
      }
      None => match c {
        '\'' | '"' => {
          quote = Some(c);
          in_tok = true;
        }
        c if c.is_whitespace() => {
          if in_tok {
            out.push(std::mem::take(&mut cur));
            in_tok = false;
          }
        }
        c => {
          cur.push(c);
          in_tok = true;
        }
      },
    }
  }
  if quote.is_some() {
    return Err(Error::Invalid);
  }
  if in_tok {
    out.push(cur);
  }
  Ok(out)
}

fn shell_quote_join(argv: &[String]) -> String {
  argv
    .iter()
    .map(|a| {
      if a.is_empty() || a.chars().any(char::is_whitespace) {
        format!("\"{}\"", a.replace('"', "\\\""))
      } else {
        a.clone()
      }
    })
    .collect::<Vec<_>>()
    .join(" ")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shell_split_handles_quotes() {
    let argv = shell_split(r#"echo "hello world" 'a b'"#).unwrap();
    assert_eq!(argv, vec!["echo", "hello world", "a b"]);
  }

  #[test]
  fn shell_split_rejects_unterminated_quote() {
    assert!(shell_split(r#"echo "unterminated"#).is_err());
  }

  #[test]
  fn shell_quote_join_quotes_only_when_needed() {
    assert_eq!(shell_quote_join(&["echo".into(), "hello world".into()]), "echo \"hello world\"");
  }
}
