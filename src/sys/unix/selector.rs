use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::interests::{Interest, Trigger};

/// Thin wrapper over `epoll_wait`/`epoll_ctl`.
///
/// This is the system half of the Reactor variant of [`Driver`]: it knows
/// nothing about registries, queues, or callbacks, only raw descriptors and
/// readiness bits, matching the teacher crate's split between `Poll` and
/// `sys::Selector`.
///
/// [`Driver`]: crate::driver::Driver
#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let ep = unsafe { OwnedFd::from_raw_fd(check(libc::epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub fn try_clone(&self) -> io::Result<Selector> {
        self.ep.try_clone().map(|ep| Selector { ep })
    }

    /// Block until an event is ready or `timeout` elapses; `None` blocks
    /// indefinitely. Returns the events observed, never more than
    /// `out.capacity()`.
    pub fn select(&self, out: &mut Vec<SelectorEvent>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let capacity = out.capacity().max(1);
        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(capacity);
        let n = loop {
            match check(unsafe {
                libc::epoll_wait(
                    self.ep.as_raw_fd(),
                    raw.as_mut_ptr(),
                    capacity as i32,
                    timeout_ms,
                )
            }) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        unsafe { raw.set_len(n as usize) };

        out.clear();
        out.extend(raw.into_iter().map(SelectorEvent::from_raw));
        Ok(())
    }

    pub fn register(
        &self,
        fd: RawFd,
        token: u64,
        interest: Interest,
        trigger: Trigger,
    ) -> io::Result<()> {
        let mut event = raw_event(token, interest, trigger);
        check(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) })
            .map(|_| ())
    }

    pub fn reregister(
        &self,
        fd: RawFd,
        token: u64,
        interest: Interest,
        trigger: Trigger,
    ) -> io::Result<()> {
        let mut event = raw_event(token, interest, trigger);
        check(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event) })
            .map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        check(unsafe {
            libc::epoll_ctl(
                self.ep.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        })
        .map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn raw_event(token: u64, interest: Interest, trigger: Trigger) -> libc::epoll_event {
    let mut bits = 0i32;
    if interest.is_readable() {
        bits |= EPOLLIN | EPOLLRDHUP;
    }
    if interest.is_writable() {
        bits |= EPOLLOUT;
    }
    if interest.is_error() {
        bits |= EPOLLERR;
    }
    if trigger.edge {
        bits |= EPOLLET;
    }
    if trigger.one_shot {
        bits |= libc::EPOLLONESHOT;
    }
    libc::epoll_event {
        events: bits as u32,
        u64: token,
    }
}

/// A single readiness notification, in terms of the spec's `Interest` bits
/// rather than raw epoll flags.
#[derive(Copy, Clone, Debug)]
pub struct SelectorEvent {
    token: u64,
    readable: bool,
    writable: bool,
    error: bool,
    hup: bool,
}

impl SelectorEvent {
    fn from_raw(raw: libc::epoll_event) -> SelectorEvent {
        let bits = raw.events as i32;
        SelectorEvent {
            token: raw.u64,
            readable: bits & (EPOLLIN | libc::EPOLLPRI) != 0,
            writable: bits & EPOLLOUT != 0,
            error: bits & EPOLLERR != 0,
            hup: bits & (EPOLLHUP | EPOLLRDHUP) != 0,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable || self.hup
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// `error` takes precedence over `writable`, which takes precedence
    /// over `readable`, per the common dispatch rule.
    pub fn is_error(&self) -> bool {
        self.error
    }
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_new_succeeds() {
        let selector = Selector::new().expect("epoll_create1");
        assert!(selector.as_raw_fd() > 0);
    }

    #[test]
    fn select_with_zero_timeout_returns_no_events_when_idle() {
        let selector = Selector::new().unwrap();
        let mut events = Vec::with_capacity(8);
        selector
            .select(&mut events, Some(Duration::from_millis(0)))
            .unwrap();
        assert!(events.is_empty());
    }
}
