//! Platform selector backend.
//!
//! Only the Unix `epoll` backend is implemented; the `Driver`/`Registry`
//! layer above is written against the small `Selector`/`Waker` surface this
//! module exports, so a second backend (kqueue, IOCP) is a matter of adding
//! a sibling module with the same surface, exactly as the teacher crate
//! structures its per-OS selectors.

#[cfg(unix)]
pub use self::unix::{RawSocket, Selector, SelectorEvent, Waker};

#[cfg(unix)]
mod unix;
