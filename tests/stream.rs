#![cfg(all(feature = "os-poll", feature = "net"))]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use nexio::chronology::Chronology;
use nexio::descriptor::Endpoint;
use nexio::driver::{Reactor, ReactorConfig};
use nexio::queue::SendOptions;
use nexio::socket::{ListenerSocket, SocketOptions, StreamSocket};

fn loopback() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

fn pump(reactor: &Arc<Reactor>, until: impl Fn() -> bool) {
    for _ in 0..200 {
        if until() {
            return;
        }
        reactor
            .poll(Some(Instant::now() + Duration::from_millis(20)))
            .unwrap();
    }
    panic!("condition never became true");
}

#[test]
fn echo_roundtrip_over_loopback() {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let chronology = Arc::new(Chronology::new());

    let listener = Arc::new(
        ListenerSocket::open(loopback(), Arc::clone(&reactor), Arc::clone(&chronology), SocketOptions::default())
            .unwrap(),
    );
    listener.bind(Endpoint::v4(Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.listen(None).unwrap();
    let server_addr = listener.local_addr().unwrap();

    let accepted: Arc<Mutex<Option<StreamSocket>>> = Arc::new(Mutex::new(None));
    let a = Arc::clone(&accepted);
    listener
        .accept(
            None,
            None,
            Box::new(move |res| {
                *a.lock() = Some(res.unwrap());
            }),
        )
        .unwrap();

    let client = Arc::new(
        StreamSocket::open(loopback(), Arc::clone(&reactor), Arc::clone(&chronology), SocketOptions::default())
            .unwrap(),
    );
    let connected = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&connected);
    client
        .connect(server_addr, None, move |res| {
            res.unwrap();
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    pump(&reactor, || accepted.lock().is_some() && connected.load(Ordering::SeqCst) > 0);

    let server_stream = Arc::new(accepted.lock().take().unwrap());
    client.send(b"hello".to_vec(), SendOptions::default(), None).unwrap();

    let received: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let r = Arc::clone(&received);
    server_stream
        .receive(
            64,
            None,
            None,
            Box::new(move |res| {
                let (data, _) = res.unwrap();
                *r.lock() = Some(data);
            }),
        )
        .unwrap();

    pump(&reactor, || received.lock().is_some());
    assert_eq!(received.lock().take().unwrap(), b"hello");
}

#[test]
fn connect_with_deadline_times_out_against_unroutable_peer() {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let chronology = Arc::new(Chronology::new());

    // TEST-NET-1, reserved for documentation; nothing answers on it.
    let target: SocketAddr = "192.0.2.1:9".parse().unwrap();

    let client = Arc::new(
        StreamSocket::open(loopback(), Arc::clone(&reactor), Arc::clone(&chronology), SocketOptions::default())
            .unwrap(),
    );

    let outcome: Arc<Mutex<Option<nexio::Result<()>>>> = Arc::new(Mutex::new(None));
    let o = Arc::clone(&outcome);
    client
        .connect(Endpoint::from_socket_addr(target), Some(Instant::now() + Duration::from_millis(100)), move |res| {
            *o.lock() = Some(res);
        })
        .unwrap();

    pump(&reactor, || outcome.lock().is_some());
    let result = outcome.lock().take().unwrap();
    assert!(matches!(result, Err(nexio::Error::Timeout)));
}
