//! End-to-end TCP accepter lifecycle: startup, accept, and reference-counted
//! shutdown.

use gensio_rs::os::Reactor;
use gensio_rs::{tcp_accepter_alloc, AddressList, TcpAccepterEvent};
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn accepter_lifecycle() {
  // A real allocator would expose the bound ephemeral port via a LADDR-style
  // control; this crate's accepter does not, so the test binds a fixed port
  // instead of relying on ":0" introspection to learn it.
  let addr: std::net::SocketAddr = "127.0.0.1:18199".parse().unwrap();
  let os = Reactor::new().unwrap();
  let (conn_tx, conn_rx) = mpsc::channel();

  let accepter = tcp_accepter_alloc(
    AddressList::new(vec![addr]),
    &[],
    os,
    Box::new(move |ev| {
      if let TcpAccepterEvent::NewConnection(endpoint) = ev {
        let _ = conn_tx.send(endpoint);
      }
    }),
  )
  .unwrap();

  accepter.startup().unwrap();
  assert!(accepter.is_enabled());

  let client = TcpStream::connect(addr).unwrap();
  let endpoint = conn_rx.recv_timeout(Duration::from_secs(2)).unwrap();
  assert!(endpoint.is_reliable());
  drop(client);
  drop(endpoint);

  let (done_tx, done_rx) = mpsc::channel();
  accepter
    .shutdown(Some(Box::new(move || {
      let _ = done_tx.send(());
    })))
    .unwrap();
  done_rx.recv_timeout(Duration::from_secs(2)).unwrap();

  // A second shutdown while not setup must not fire `done` again (§8
  // invariant 2/round-trip: `shutdown` while not `setup` is *busy*).
  assert!(accepter.shutdown(None).is_err());
}

#[test]
fn enable_disable_is_idempotent() {
  let addr: std::net::SocketAddr = "127.0.0.1:18200".parse().unwrap();
  let os = Reactor::new().unwrap();
  let accepter = tcp_accepter_alloc(
    AddressList::new(vec![addr]),
    &[],
    os,
    Box::new(|_ev| {}),
  )
  .unwrap();

  accepter.startup().unwrap();
  assert!(accepter.is_enabled());

  accepter.set_enabled(true);
  assert!(accepter.is_enabled());

  accepter.set_enabled(false);
  accepter.set_enabled(false);
  assert!(!accepter.is_enabled());

  accepter.disable();
}
