#![cfg(feature = "os-poll")]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use nexio::chronology::{Chronology, TimerOptions};

#[test]
fn timers_fire_in_deadline_order_regardless_of_creation_order() {
    let chronology = Chronology::new();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let now = Instant::now();

    let o = Arc::clone(&order);
    let _late = chronology.create_timer(TimerOptions::once(now + Duration::from_millis(60)), move || {
        o.lock().push("late");
    });
    let o = Arc::clone(&order);
    let _early = chronology.create_timer(TimerOptions::once(now + Duration::from_millis(10)), move || {
        o.lock().push("early");
    });

    std::thread::sleep(Duration::from_millis(90));
    chronology.announce_now(true);

    assert_eq!(*order.lock(), vec!["early", "late"]);
}

#[test]
fn cancelling_a_timer_before_it_fires_suppresses_the_callback() {
    let chronology = Chronology::new();
    let fired = Arc::new(Mutex::new(false));
    let f = Arc::clone(&fired);
    let handle = chronology.create_timer(TimerOptions::once(Instant::now() + Duration::from_millis(10)), move || {
        *f.lock() = true;
    });
    chronology.cancel_timer(handle);

    std::thread::sleep(Duration::from_millis(30));
    chronology.announce_now(true);

    assert!(!*fired.lock());
}

#[test]
fn deferred_work_runs_without_reentering_the_draining_call() {
    let chronology = Arc::new(Chronology::new());
    let ran = Arc::new(Mutex::new(Vec::new()));

    let c = Arc::clone(&chronology);
    let r = Arc::clone(&ran);
    chronology.defer(move || {
        r.lock().push(1);
        let r2 = Arc::clone(&r);
        c.defer(move || {
            r2.lock().push(2);
        });
    });

    // permit_reentrant = false: the nested defer queued from inside the
    // first callback must wait for the next announce, not run in this one.
    chronology.announce_now(false);
    assert_eq!(*ran.lock(), vec![1]);
    chronology.announce_now(false);
    assert_eq!(*ran.lock(), vec![1, 2]);
}
