use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::chronology::Chronology;
use crate::descriptor::{Descriptor, Endpoint, Transport};
use crate::driver::Reactor;
use crate::error::{Error, Result};
use crate::registry::RegistryEntry;
use crate::strand::Strand;

use super::options::SocketOptions;
use super::shutdown::{Direction, Initiator, ShutdownState};

/// Fields and behavior shared by [`DatagramSocket`], [`ListenerSocket`],
/// and [`StreamSocket`] — the "identical shape... differing only in
/// which are supported" split of spec.md §4.E.
///
/// [`DatagramSocket`]: super::DatagramSocket
/// [`ListenerSocket`]: super::ListenerSocket
/// [`StreamSocket`]: super::StreamSocket
pub struct SocketCore {
    pub(super) transport: Transport,
    pub(super) descriptor: Descriptor,
    pub(super) raw: Mutex<Option<crate::sys::RawSocket>>,
    pub(super) entry: Arc<RegistryEntry>,
    pub(super) reactor: Arc<Reactor>,
    pub(super) chronology: Arc<Chronology>,
    pub(super) strand: Arc<Strand>,
    pub(super) options: Mutex<SocketOptions>,
    pub(super) shutdown: Mutex<ShutdownState>,
    pub(super) closed: AtomicBool,
    pub(super) next_token: AtomicU64,
    pub(super) bound_addr: Mutex<Option<Endpoint>>,
}

impl SocketCore {
    pub fn attach(
        transport: Transport,
        raw: crate::sys::RawSocket,
        reactor: Arc<Reactor>,
        chronology: Arc<Chronology>,
        options: SocketOptions,
    ) -> Result<Arc<SocketCore>> {
        options.validate()?;
        use std::os::fd::AsRawFd;
        let descriptor = Descriptor::from_raw_fd(raw.as_raw_fd());
        let entry = reactor.attach(descriptor)?;
        log::debug!("socket: opened {:?} as {:?}", descriptor, transport);
        Ok(Arc::new(SocketCore {
            transport,
            descriptor,
            raw: Mutex::new(Some(raw)),
            entry,
            reactor,
            chronology,
            strand: Arc::new(Strand::new()),
            options: Mutex::new(options),
            shutdown: Mutex::new(ShutdownState::new()),
            closed: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
            bound_addr: Mutex::new(None),
        }))
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.bound_addr.lock().clone()
    }

    pub fn set_local_endpoint(&self, endpoint: Endpoint) {
        *self.bound_addr.lock() = Some(endpoint);
    }

    pub fn can_send(&self) -> bool {
        !self.is_closed() && self.shutdown.lock().can_send()
    }

    pub fn can_receive(&self) -> bool {
        !self.is_closed() && self.shutdown.lock().can_receive()
    }

    pub fn mark_shutdown(&self, direction: Direction, initiator: Initiator) {
        self.shutdown.lock().shutdown(direction, initiator);
    }

    pub fn deadline_timer(
        self: &Arc<Self>,
        deadline: Instant,
        on_fire: impl FnMut() + Send + 'static,
    ) -> crate::chronology::TimerHandle {
        self.chronology.create_timer(
            crate::chronology::TimerOptions::once(deadline),
            on_fire,
        )
    }

    /// Run every step of the close protocol (spec.md §4.E) except the
    /// queue-specific draining, which each concrete socket kind performs
    /// before calling this with its own `fail_pending` closure.
    ///
    /// 1. latches `closed`,
    /// 2. shuts down both directions,
    /// 3. runs `fail_pending` (each kind enqueues a completion with the
    ///    latched error for every operation still outstanding in its own
    ///    queues),
    /// 4. asks the Driver to detach, with a detach callback that drops
    ///    the OS descriptor and then invokes `on_detached` (which fires
    ///    the user's close callback on the strand).
    pub fn close(
        self: &Arc<Self>,
        reason: Error,
        fail_pending: impl FnOnce(),
        on_detached: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.lock().shutdown(Direction::Both, Initiator::Local);
        fail_pending();

        let core = Arc::clone(self);
        let reason_for_log = format!("{}", reason);
        self.reactor.detach(self.descriptor, move || {
            let raw = core.raw.lock().take();
            drop(raw);
            log::debug!("socket: {:?} detached ({})", core.descriptor, reason_for_log);
            on_detached();
        })
    }

    pub fn cancel_token_not_found(&self) -> Error {
        Error::Invalid("no pending operation with that token")
    }
}
