mod raw_socket;
mod selector;
mod waker;

pub use self::raw_socket::RawSocket;
pub use self::selector::{Selector, SelectorEvent};
pub use self::waker::Waker;
