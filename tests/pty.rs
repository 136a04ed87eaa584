//! End-to-end PTY scenarios: a spawned child, and a detached slave with
//! symlink/permission configuration (§8's PTY scenarios). Both are gated on
//! `has_ptsname_r`, the same way the driver itself is, since there is no
//! fallback slave-configuration path to exercise on platforms without it.

#![cfg(has_ptsname_r)]

use gensio_rs::endpoint::EndpointEvent;
use gensio_rs::fdll::ControlValue;
use gensio_rs::os::Reactor;
use gensio_rs::pty_alloc;
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn pty_with_child_runs_to_completion() {
  let os = Reactor::new().unwrap();
  let (tx, rx) = mpsc::channel();
  let (read_tx, read_rx) = mpsc::channel();

  let endpoint = pty_alloc(
    vec!["/bin/echo".to_string(), "hello".to_string()],
    &["raw".to_string()],
    os,
    Box::new(move |ev| match ev {
      EndpointEvent::Read(data, _) => {
        let _ = read_tx.send(data);
      }
      other => {
        let _ = tx.send(other);
      }
    }),
  )
  .unwrap();

  match rx.recv_timeout(Duration::from_secs(2)) {
    Ok(EndpointEvent::Open(Ok(()))) => {}
    other => panic!("expected a successful open, got {}", debug_of(other)),
  }

  let remote_id = endpoint.control(true, "REMOTE_ID", ControlValue::None).unwrap();
  match remote_id {
    ControlValue::Text(pid) => assert!(pid.parse::<i64>().unwrap() > 0),
    other => panic!("expected REMOTE_ID text, got {other:?}"),
  }

  let mut collected = Vec::new();
  let deadline = std::time::Instant::now() + Duration::from_secs(2);
  while collected.len() < b"hello\n".len() && std::time::Instant::now() < deadline {
    if let Ok(chunk) = read_rx.recv_timeout(Duration::from_millis(200)) {
      collected.extend(chunk);
    }
  }
  assert_eq!(collected, b"hello\n");

  // Poll WAIT_TASK until the child has exited and been reaped.
  let deadline = std::time::Instant::now() + Duration::from_secs(2);
  let mut exit_code = None;
  while exit_code.is_none() && std::time::Instant::now() < deadline {
    match endpoint.control(true, "WAIT_TASK", ControlValue::None) {
      Ok(ControlValue::Text(code)) => exit_code = Some(code),
      _ => std::thread::sleep(Duration::from_millis(20)),
    }
  }
  assert_eq!(exit_code.as_deref(), Some("0"));

  let exit_code = endpoint.control(true, "EXIT_CODE", ControlValue::None).unwrap();
  match exit_code {
    ControlValue::Int(0) => {}
    other => panic!("expected EXIT_CODE=0, got {other:?}"),
  }

  endpoint.close();
}

#[test]
fn pty_detached_slave_configures_symlink_and_permissions() {
  let link = format!("/tmp/gensio-rs-test-{}", std::process::id());
  let _ = std::fs::remove_file(&link);

  let os = Reactor::new().unwrap();
  let (tx, rx) = mpsc::channel();
  let endpoint = pty_alloc(
    vec![],
    &[
      format!("link={link}"),
      "forcelink".to_string(),
      "perm=0600".to_string(),
    ],
    os,
    Box::new(move |ev| {
      let _ = tx.send(ev);
    }),
  )
  .unwrap();

  match rx.recv_timeout(Duration::from_secs(2)) {
    Ok(EndpointEvent::Open(Ok(()))) => {}
    other => panic!("expected a successful open, got {}", debug_of(other)),
  }

  let laddr = endpoint.control(true, "LADDR", ControlValue::None).unwrap();
  let slave_path = match laddr {
    ControlValue::Text(p) => p,
    other => panic!("expected LADDR text, got {other:?}"),
  };

  let link_target = std::fs::read_link(&link).unwrap();
  assert_eq!(link_target.to_str().unwrap(), slave_path);

  let meta = std::fs::metadata(&link).unwrap();
  use std::os::unix::fs::PermissionsExt;
  assert_eq!(meta.permissions().mode() & 0o777, 0o600);

  endpoint.close();
  // check_close unlinks the symlink as part of cleanup; give the reap loop a
  // moment before asserting it is gone.
  std::thread::sleep(Duration::from_millis(50));
  assert!(std::fs::symlink_metadata(&link).is_err());
}

#[test]
fn pty_inconsistent_config_rejected_at_allocate() {
  let os = Reactor::new().unwrap();
  let err = gensio_rs::PtyOps::alloc(
    vec!["/bin/true".to_string()],
    &["perm=0600".to_string()],
    os,
  )
  .unwrap_err();
  assert!(matches!(err, gensio_rs::Error::Inconsistent));
}

fn debug_of(ev: Result<EndpointEvent, mpsc::RecvTimeoutError>) -> &'static str {
  match ev {
    Ok(EndpointEvent::Open(Err(_))) => "Open(Err(_))",
    Ok(EndpointEvent::Read(_, _)) => "Read(_, _)",
    Ok(EndpointEvent::Closed) => "Closed",
    Err(_) => "<timeout>",
  }
}
