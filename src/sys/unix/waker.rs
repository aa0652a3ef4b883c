use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use crate::interests::{Interest, Trigger};
use crate::sys::Selector;

/// Wakes a driver's waiter thread out of a blocking `select` call.
///
/// Backed by `eventfd`, an in-kernel 64-bit counter: writes add to the
/// count, reads reset it to zero. One `Waker` is registered per `Selector`
/// under a reserved token so `interruptOne`/`interruptAll` can be
/// implemented without a dedicated pipe per waiter.
#[derive(Debug)]
pub struct Waker {
    fd: File,
}

impl Waker {
    pub fn new(selector: &Selector, token: u64) -> io::Result<Waker> {
        let raw = check(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
        let fd = unsafe { File::from_raw_fd(raw) };
        selector.register(fd.as_raw_fd(), token, Interest::READABLE, Trigger::LEVEL)?;
        Ok(Waker { fd })
    }

    pub fn wake(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // The counter is about to overflow; drain it and retry.
                self.drain();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    /// Reset the counter after observing a wake event.
    pub fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = (&self.fd).read(&mut buf);
    }
}

fn check(ret: RawFd) -> io::Result<RawFd> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
