#![cfg(all(feature = "os-poll", feature = "net"))]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use nexio::chronology::Chronology;
use nexio::descriptor::Endpoint;
use nexio::driver::{Reactor, ReactorConfig};
use nexio::socket::{ListenerSocket, SocketOptions};

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
fn closing_listener_fails_a_still_pending_accept() {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let chronology = Arc::new(Chronology::new());

    let listener = Arc::new(
        ListenerSocket::open(loopback(), Arc::clone(&reactor), Arc::clone(&chronology), SocketOptions::default())
            .unwrap(),
    );
    listener.bind(Endpoint::v4(Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.listen(None).unwrap();

    let outcome: Arc<Mutex<Option<nexio::Result<_>>>> = Arc::new(Mutex::new(None));
    let o = Arc::clone(&outcome);
    listener
        .accept(
            None,
            None,
            Box::new(move |res| {
                *o.lock() = Some(res);
            }),
        )
        .unwrap();

    let closed = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&closed);
    listener
        .close(Some(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

    pump(&reactor, || closed.load(Ordering::SeqCst) > 0);
    let result = outcome.lock().take().unwrap();
    assert!(result.is_err());
}

#[test]
fn double_close_is_idempotent() {
    let reactor = Reactor::new(ReactorConfig::default()).unwrap();
    let chronology = Arc::new(Chronology::new());

    let listener = Arc::new(
        ListenerSocket::open(loopback(), Arc::clone(&reactor), Arc::clone(&chronology), SocketOptions::default())
            .unwrap(),
    );
    listener.bind(Endpoint::v4(Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.listen(None).unwrap();

    listener.close(None).unwrap();
    listener.close(None).unwrap();
}
