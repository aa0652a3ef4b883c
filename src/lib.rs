//! Asynchronous network transport core: a reactor/proactor driver, a
//! per-socket registry, flow-controlled send/receive/accept queues, and
//! one socket API built on top of them.
//!
//! The crate is organized as the stack it implements, bottom to top:
//!
//! - [`chronology`] — timers and deferred work.
//! - [`descriptor`] / [`interests`] / [`error`] — shared vocabulary types.
//! - [`registry`] — per-descriptor callback and lifecycle bookkeeping.
//! - [`driver`] — the Reactor (readiness) and Proactor (completion-style)
//!   engines built over [`registry`] and the platform [`sys`] selector.
//! - [`queue`] — the write/read/accept queues a socket drains through.
//! - [`socket`] — `DatagramSocket`/`ListenerSocket`/`StreamSocket`.
//! - [`interface`] — a load-balanced pool of Drivers.
//!
//! Only the Unix `epoll` backend is implemented; see [`sys`].

#![warn(rust_2018_idioms)]

pub mod chronology;
pub mod descriptor;
pub mod error;
pub mod interests;

#[cfg(feature = "os-poll")]
pub mod driver;
#[cfg(feature = "os-poll")]
pub mod queue;
#[cfg(feature = "os-poll")]
pub mod registry;
#[cfg(feature = "os-poll")]
mod strand;
#[cfg(feature = "os-poll")]
mod sys;

#[cfg(feature = "net")]
pub mod interface;
#[cfg(feature = "net")]
pub mod socket;

pub use error::{Error, Result};
