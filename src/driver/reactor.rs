use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::chronology::Chronology;
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::interests::{Interest, Trigger};
use crate::registry::{Registry, RegistryEntry};
use crate::sys::{Selector, SelectorEvent, Waker};

use super::{WaiterToken, WaiterTokenAllocator, WAKER_TOKEN};

/// Construction-time knobs for a [`Reactor`].
#[derive(Clone, Debug)]
pub struct ReactorConfig {
    /// Upper bound on the number of events returned by one `poll` call.
    pub max_batch: usize,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig { max_batch: 256 }
    }
}

struct WaiterState {
    running: bool,
}

/// Readiness-based [`Driver`] variant, backed by one kernel `Selector`.
///
/// Multiple threads may call [`Reactor::run`] concurrently against
/// distinct `WaiterToken`s (the dynamic load-balancing model of §5), but
/// only one thread actually blocks inside `select` at a time: the
/// `select_lock` below serializes the kernel call itself while leaving
/// dispatch (registry lookups, callbacks, chronology) unsynchronized
/// beyond what `Registry` and `Chronology` already guarantee.
///
/// [`Driver`]: crate::driver
pub struct Reactor {
    selector: Selector,
    waker: Waker,
    registry: Arc<Registry>,
    chronology: Arc<Chronology>,
    config: ReactorConfig,
    running: AtomicBool,
    spurious_wakeups: AtomicUsize,
    select_lock: Mutex<()>,
    waiters: Mutex<HashMap<WaiterToken, WaiterState>>,
    waiter_tokens: WaiterTokenAllocator,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Arc<Reactor>> {
        Reactor::with_chronology(config, Arc::new(Chronology::new()))
    }

    pub fn with_chronology(config: ReactorConfig, chronology: Arc<Chronology>) -> Result<Arc<Reactor>> {
        let selector = Selector::new().map_err(Error::Io)?;
        let waker = Waker::new(&selector, WAKER_TOKEN).map_err(Error::Io)?;
        Ok(Arc::new(Reactor {
            selector,
            waker,
            registry: Arc::new(Registry::new()),
            chronology,
            config,
            running: AtomicBool::new(true),
            spurious_wakeups: AtomicUsize::new(0),
            select_lock: Mutex::new(()),
            waiters: Mutex::new(HashMap::new()),
            waiter_tokens: WaiterTokenAllocator::new(),
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn chronology(&self) -> &Arc<Chronology> {
        &self.chronology
    }

    pub fn spurious_wakeups(&self) -> usize {
        self.spurious_wakeups.load(Ordering::Relaxed)
    }

    /// Register the descriptor with empty interest. The caller arms
    /// individual event kinds afterward via `show_readable` et al.
    pub fn attach(&self, descriptor: Descriptor) -> Result<Arc<RegistryEntry>> {
        let entry = self.registry.add(descriptor)?;
        self.selector
            .register(raw_fd(descriptor), descriptor.as_raw(), Interest::NONE, Trigger::LEVEL)
            .map_err(Error::Io)?;
        log::trace!("reactor: attached {:?}", descriptor);
        Ok(entry)
    }

    pub fn show_readable(
        &self,
        entry: &Arc<RegistryEntry>,
        trigger: Trigger,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<Interest> {
        let interest = self.registry.show_readable(entry, trigger, callback);
        self.rearm(entry, interest, trigger)?;
        Ok(interest)
    }

    pub fn show_writable(
        &self,
        entry: &Arc<RegistryEntry>,
        trigger: Trigger,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<Interest> {
        let interest = self.registry.show_writable(entry, trigger, callback);
        self.rearm(entry, interest, trigger)?;
        Ok(interest)
    }

    pub fn show_error(
        &self,
        entry: &Arc<RegistryEntry>,
        trigger: Trigger,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<Interest> {
        let interest = self.registry.show_error(entry, trigger, callback);
        self.rearm(entry, interest, trigger)?;
        Ok(interest)
    }

    pub fn hide_readable(&self, entry: &Arc<RegistryEntry>) -> Result<Interest> {
        let interest = self.registry.hide_readable(entry);
        self.rearm(entry, interest, entry.trigger())?;
        Ok(interest)
    }

    pub fn hide_writable(&self, entry: &Arc<RegistryEntry>) -> Result<Interest> {
        let interest = self.registry.hide_writable(entry);
        self.rearm(entry, interest, entry.trigger())?;
        Ok(interest)
    }

    pub fn hide_error(&self, entry: &Arc<RegistryEntry>) -> Result<Interest> {
        let interest = self.registry.hide_error(entry);
        self.rearm(entry, interest, entry.trigger())?;
        Ok(interest)
    }

    fn rearm(&self, entry: &Arc<RegistryEntry>, interest: Interest, trigger: Trigger) -> Result<()> {
        self.selector
            .reregister(raw_fd(entry.descriptor()), entry.descriptor().as_raw(), interest, trigger)
            .map_err(Error::Io)
    }

    /// Two-phase removal honoring the Registry process counter: see
    /// `Registry::remove_and_get_ready_to_detach`.
    pub fn detach(
        &self,
        descriptor: Descriptor,
        detach_callback: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let selector_fd = raw_fd(descriptor);
        let selector = &self.selector;
        self.registry.remove_and_get_ready_to_detach(descriptor, detach_callback, move || {
            let _ = selector.deregister(selector_fd);
        })?;
        log::debug!("reactor: detach requested for {:?}", descriptor);
        Ok(())
    }

    /// Block until any registered event is ready or `deadline` elapses;
    /// dispatches every event observed and returns the batch size. A
    /// batch size of 0 with no expired chronology entry counts as a
    /// spurious wakeup.
    pub fn poll(&self, deadline: Option<Instant>) -> Result<usize> {
        let now = Instant::now();
        let chronology_deadline = self.chronology.earliest();
        let effective_deadline = match (deadline, chronology_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let timeout = effective_deadline.map(|d| d.saturating_duration_since(now));

        let mut events = Vec::with_capacity(self.config.max_batch);
        {
            let _guard = self.select_lock.lock();
            self.selector.select(&mut events, timeout).map_err(Error::Io)?;
        }

        if events.is_empty() {
            self.spurious_wakeups.fetch_add(1, Ordering::Relaxed);
            std::thread::yield_now();
            return Ok(0);
        }

        let mut dispatched = 0;
        for event in &events {
            if event.token() == WAKER_TOKEN {
                self.waker.drain();
                continue;
            }
            if self.dispatch(event) {
                dispatched += 1;
            } else {
                self.spurious_wakeups.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(dispatched)
    }

    /// Common dispatch rule: error takes precedence over writable, which
    /// takes precedence over readable.
    fn dispatch(&self, event: &SelectorEvent) -> bool {
        let descriptor = Descriptor::from_raw(event.token());
        let guard = match self.registry.lookup_and_mark_processing_ongoing(descriptor) {
            Some(guard) => guard,
            None => return false,
        };

        let mut announced = false;
        if event.is_error() {
            announced |= self.registry.announce_error(&guard.entry);
        }
        if event.is_writable() {
            announced |= self.registry.announce_writable(&guard.entry);
        }
        if event.is_readable() {
            announced |= self.registry.announce_readable(&guard.entry);
        }

        self.registry.decrement_process_counter(guard);
        announced
    }

    pub fn interrupt_one(&self) -> Result<()> {
        self.waker.wake().map_err(Error::Io)
    }

    /// Interrupting all waiters relies on eventfd being level-triggered:
    /// every thread blocked in `select` observes the waker fd readable
    /// until it is drained. Since `select` is serialized by
    /// `select_lock`, at most one thread drains it per wakeup; a waiter
    /// loop re-checks `running` after every `poll` so a single wake is
    /// enough to eventually unblock all of them in turn.
    pub fn interrupt_all(&self) -> Result<()> {
        self.waker.wake().map_err(Error::Io)
    }

    pub fn register_waiter(&self) -> WaiterToken {
        let token = self.waiter_tokens.allocate();
        self.waiters.lock().insert(token, WaiterState { running: true });
        token
    }

    pub fn deregister_waiter(&self, token: WaiterToken) {
        self.waiters.lock().remove(&token);
    }

    /// `while running: poll -> dispatch -> drain chronology`, until
    /// `stop()` latches `running` false.
    pub fn run(&self, token: WaiterToken) -> Result<()> {
        while self.running.load(Ordering::Acquire) {
            let still_registered = self.waiters.lock().get(&token).map(|w| w.running).unwrap_or(false);
            if !still_registered {
                break;
            }
            self.poll(None)?;
            self.chronology.announce_now(true);
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        for waiter in self.waiters.lock().values_mut() {
            waiter.running = false;
        }
        self.interrupt_all()
    }
}

fn raw_fd(descriptor: Descriptor) -> std::os::fd::RawFd {
    descriptor.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;
    use std::sync::atomic::AtomicUsize as AU;

    fn make_pipe_descriptor() -> (Descriptor, std::fs::File, std::fs::File) {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        let read_end = unsafe { std::fs::File::from_raw_fd(fds[0]) };
        let write_end = unsafe { std::fs::File::from_raw_fd(fds[1]) };
        (Descriptor::from_raw_fd(read_end.as_raw_fd()), read_end, write_end)
    }

    #[test]
    fn attach_then_show_readable_reports_event() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let (descriptor, read_end, mut write_end) = make_pipe_descriptor();
        let entry = reactor.attach(descriptor).unwrap();

        let fired = Arc::new(AU::new(0));
        let f = Arc::clone(&fired);
        reactor
            .show_readable(&entry, Trigger::LEVEL, move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        use std::io::Write;
        write_end.write_all(b"x").unwrap();

        let n = reactor.poll(Some(Instant::now() + Duration::from_millis(200))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(read_end);
    }

    #[test]
    fn poll_with_no_events_counts_spurious_wakeup() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let before = reactor.spurious_wakeups();
        let n = reactor
            .poll(Some(Instant::now() + Duration::from_millis(5)))
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(reactor.spurious_wakeups(), before + 1);
    }

    #[test]
    fn interrupt_one_wakes_blocked_poll() {
        let reactor = Arc::new(Reactor::new(ReactorConfig::default()).unwrap());
        let r = Arc::clone(&reactor);
        let handle = std::thread::spawn(move || r.poll(None));
        std::thread::sleep(Duration::from_millis(20));
        reactor.interrupt_one().unwrap();
        handle.join().unwrap().unwrap();
    }
}
