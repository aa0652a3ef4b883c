//! Module F: the Interface — a pool of Drivers, each pinned to its own OS
//! thread, load-balanced the way spec.md §4.F / §6 describes: pin by
//! explicit handle, pin by explicit index modulo the pool size, or fall
//! back to picking the least-loaded Driver and growing the pool (up to
//! `max_threads`) when even the least-loaded one is saturated.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use slab::Slab;

use crate::chronology::Chronology;
use crate::driver::{Reactor, ReactorConfig, WaiterToken};
use crate::error::{Error, Result};
use crate::socket::LoadBalancingOptions;

/// Construction-time knobs for an [`Interface`].
#[derive(Clone, Debug)]
pub struct InterfaceOptions {
    /// Drivers started eagerly at construction time.
    pub min_threads: usize,
    /// Hard ceiling the least-loaded fallback will grow the pool to.
    pub max_threads: usize,
    /// A driver is considered saturated once it owns this many sockets;
    /// the least-loaded fallback only grows the pool once every driver
    /// has reached this count.
    pub grow_above_connections: usize,
    pub reactor_config: ReactorConfig,
}

impl Default for InterfaceOptions {
    fn default() -> InterfaceOptions {
        InterfaceOptions {
            min_threads: 1,
            max_threads: 4,
            grow_above_connections: 256,
            reactor_config: ReactorConfig::default(),
        }
    }
}

struct DriverSlot {
    reactor: Arc<Reactor>,
    waiter: WaiterToken,
    thread: Option<JoinHandle<()>>,
    connections: Arc<AtomicUsize>,
}

/// Owns a pool of reactor-driven worker threads and hands out a `Driver`
/// per new socket according to an [`InterfaceOptions`]'s load-balancing
/// policy. A single [`Chronology`] is shared across every driver in the
/// pool so interface-wide timers see one another (spec.md's hierarchical
/// linkage, exercised here at the root rather than between parent/child).
pub struct Interface {
    drivers: Mutex<Slab<DriverSlot>>,
    options: InterfaceOptions,
    chronology: Arc<Chronology>,
    connection_reservation: AtomicUsize,
    stopped: AtomicBool,
}

impl Interface {
    pub fn new(options: InterfaceOptions) -> Result<Arc<Interface>> {
        let chronology = Arc::new(Chronology::new());
        let interface = Arc::new(Interface {
            drivers: Mutex::new(Slab::with_capacity(options.max_threads.max(1))),
            options,
            chronology,
            connection_reservation: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        let min_threads = interface.options.min_threads.max(1);
        for _ in 0..min_threads {
            interface.spawn_driver()?;
        }
        Ok(interface)
    }

    pub fn chronology(&self) -> &Arc<Chronology> {
        &self.chronology
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.lock().len()
    }

    /// Total sockets this interface believes its drivers currently own.
    /// An approximation: a socket that opens and closes between two calls
    /// is counted via `reserve`/`release`, not by walking every registry.
    pub fn connection_count(&self) -> usize {
        self.connection_reservation.load(Ordering::Relaxed)
    }

    fn spawn_driver(self: &Arc<Self>) -> Result<usize> {
        let reactor = Reactor::with_chronology(self.options.reactor_config.clone(), Arc::clone(&self.chronology))?;
        let waiter = reactor.register_waiter();
        let run_reactor = Arc::clone(&reactor);
        let thread = std::thread::Builder::new()
            .name("nexio-driver".into())
            .spawn(move || {
                if let Err(err) = run_reactor.run(waiter) {
                    log::error!("interface: driver thread exited with error: {}", err);
                }
            })
            .map_err(Error::Io)?;

        let mut drivers = self.drivers.lock();
        let key = drivers.insert(DriverSlot {
            reactor,
            waiter,
            thread: Some(thread),
            connections: Arc::new(AtomicUsize::new(0)),
        });
        log::debug!("interface: spawned driver #{key}");
        Ok(key)
    }

    /// Picks a Driver per `options`, growing the pool first if the
    /// least-loaded fallback applies and every existing driver is
    /// saturated (spec.md §6's dynamic growth).
    pub fn select_driver(self: &Arc<Self>, options: LoadBalancingOptions) -> Result<Arc<Reactor>> {
        if let Some(handle) = options.thread_handle {
            let drivers = self.drivers.lock();
            return drivers
                .iter()
                .find(|(_, slot)| slot.waiter == handle)
                .map(|(_, slot)| Arc::clone(&slot.reactor))
                .ok_or(Error::Invalid("no driver registered under that thread handle"));
        }

        if let Some(index) = options.thread_index {
            let drivers = self.drivers.lock();
            if drivers.is_empty() {
                return Err(Error::Invalid("interface has no drivers"));
            }
            let keys: Vec<usize> = drivers.iter().map(|(key, _)| key).collect();
            let key = keys[index % keys.len()];
            return Ok(Arc::clone(&drivers[key].reactor));
        }

        self.least_loaded_driver()
    }

    fn least_loaded_driver(self: &Arc<Self>) -> Result<Arc<Reactor>> {
        loop {
            let candidate = {
                let drivers = self.drivers.lock();
                drivers
                    .iter()
                    .min_by_key(|(_, slot)| slot.connections.load(Ordering::Relaxed))
                    .map(|(key, slot)| (key, slot.connections.load(Ordering::Relaxed), Arc::clone(&slot.reactor)))
            };
            match candidate {
                Some((_, load, reactor)) if load < self.options.grow_above_connections => return Ok(reactor),
                Some((_, _, reactor)) if self.driver_count() >= self.options.max_threads => return Ok(reactor),
                _ => {
                    self.spawn_driver()?;
                }
            }
        }
    }

    /// Records that `select_driver`'s chosen reactor now owns one more
    /// socket; call once the socket is attached. Paired with `release`.
    pub fn reserve(&self, reactor: &Arc<Reactor>) {
        self.connection_reservation.fetch_add(1, Ordering::Relaxed);
        let drivers = self.drivers.lock();
        if let Some((_, slot)) = drivers.iter().find(|(_, slot)| Arc::ptr_eq(&slot.reactor, reactor)) {
            slot.connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn release(&self, reactor: &Arc<Reactor>) {
        self.connection_reservation.fetch_sub(1, Ordering::Relaxed);
        let drivers = self.drivers.lock();
        if let Some((_, slot)) = drivers.iter().find(|(_, slot)| Arc::ptr_eq(&slot.reactor, reactor)) {
            slot.connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Stops every driver's waiter loop and joins its thread. Idempotent;
    /// a second call after the first observes an already-empty pool.
    pub fn close_all(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut drivers = self.drivers.lock();
        for (_, slot) in drivers.iter_mut() {
            slot.reactor.stop()?;
        }
        for (_, mut slot) in drivers.drain() {
            if let Some(thread) = slot.thread.take() {
                let _ = thread.join();
            }
        }
        Ok(())
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_starts_with_min_threads_and_grows_on_demand() {
        let interface = Interface::new(InterfaceOptions {
            min_threads: 1,
            max_threads: 3,
            grow_above_connections: 1,
            reactor_config: ReactorConfig::default(),
        })
        .unwrap();
        assert_eq!(interface.driver_count(), 1);

        let first = interface.select_driver(LoadBalancingOptions::default()).unwrap();
        interface.reserve(&first);
        // Saturated at 1 connection; next pick must grow the pool.
        let _second = interface.select_driver(LoadBalancingOptions::default()).unwrap();
        assert!(interface.driver_count() >= 2);

        interface.close_all().unwrap();
    }

    #[test]
    fn explicit_index_selects_modulo_pool_size() {
        let interface = Interface::new(InterfaceOptions {
            min_threads: 2,
            max_threads: 2,
            grow_above_connections: usize::MAX,
            reactor_config: ReactorConfig::default(),
        })
        .unwrap();
        let a = interface
            .select_driver(LoadBalancingOptions {
                thread_index: Some(0),
                ..Default::default()
            })
            .unwrap();
        let b = interface
            .select_driver(LoadBalancingOptions {
                thread_index: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        interface.close_all().unwrap();
    }
}
