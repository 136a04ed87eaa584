//! End-to-end TCP client scenarios: happy path and address-list fallback.

use gensio_rs::endpoint::EndpointEvent;
use gensio_rs::os::Reactor;
use gensio_rs::{tcp_alloc, AddressList};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::time::Duration;

fn wait_open(rx: &mpsc::Receiver<EndpointEvent>) {
  match rx.recv_timeout(Duration::from_secs(2)) {
    Ok(EndpointEvent::Open(Ok(()))) => {}
    other => panic!("expected Open(Ok(())), got a different or missing event: {}", matches_desc(other)),
  }
}

fn matches_desc(ev: Result<EndpointEvent, mpsc::RecvTimeoutError>) -> &'static str {
  match ev {
    Ok(EndpointEvent::Open(Err(_))) => "Open(Err(_))",
    Ok(EndpointEvent::Read(_, _)) => "Read(_, _)",
    Ok(EndpointEvent::Closed) => "Closed",
    Err(_) => "<timeout>",
  }
}

#[test]
fn tcp_client_happy_path() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();

  let echoer = std::thread::spawn(move || {
    let (mut stream, _) = listener.accept().unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    stream.write_all(&buf).unwrap();
  });

  let os = Reactor::new().unwrap();
  let (tx, rx) = mpsc::channel();
  let (read_tx, read_rx) = mpsc::channel();

  let endpoint = tcp_alloc(
    AddressList::new(vec![addr]),
    &["nodelay".to_string()],
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

  wait_open(&rx);

  assert_eq!(endpoint.raddr_to_str().unwrap(), format!("{},{}", addr.ip(), addr.port()));

  endpoint.write(b"PING", None).unwrap();
  let data = read_rx.recv_timeout(Duration::from_secs(2)).unwrap();
  assert_eq!(data, b"PING");

  let nodelay = endpoint
    .control(true, "NODELAY", gensio_rs::fdll::ControlValue::None)
    .unwrap();
  match nodelay {
    gensio_rs::fdll::ControlValue::Bool(true) => {}
    other => panic!("expected NODELAY=true, got {other:?}"),
  }

  endpoint.close();
  echoer.join().unwrap();
}

#[test]
fn tcp_client_falls_back_across_address_list() {
  let listener = TcpListener::bind("127.0.0.1:0").unwrap();
  let addr = listener.local_addr().unwrap();
  let echoer = std::thread::spawn(move || {
    let (stream, _) = listener.accept().unwrap();
    drop(stream);
  });

  // 192.0.2.0/24 is TEST-NET-1 (RFC 5737): guaranteed non-routable, so a
  // connect attempt there fails fast (refused or unreachable) rather than
  // hanging, letting the cursor advance to the real listener deterministically.
  let bad: std::net::SocketAddr = "192.0.2.1:1".parse().unwrap();

  let os = Reactor::new().unwrap();
  let (tx, rx) = mpsc::channel();
  let endpoint = tcp_alloc(
    AddressList::new(vec![bad, addr]),
    &[],
    os,
    Box::new(move |ev| {
      let _ = tx.send(ev);
    }),
  )
  .unwrap();

  wait_open(&rx);
  assert_eq!(endpoint.raddr_to_str().unwrap(), format!("{},{}", addr.ip(), addr.port()));

  endpoint.close();
  echoer.join().unwrap();
}
