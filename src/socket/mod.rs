//! Module E: the three socket kinds sharing [`SocketCore`], plus the
//! shutdown and options types they're built from.

mod core;
mod datagram;
mod listener;
mod options;
mod shutdown;
mod stream;

pub use self::core::SocketCore;
pub use self::datagram::DatagramSocket;
pub use self::listener::ListenerSocket;
pub use self::options::{LoadBalancingOptions, MulticastOptions, SocketOptions, DEFAULT_HIGH_WATERMARK};
pub use self::shutdown::{Direction, Initiator, ShutdownState};
pub use self::stream::StreamSocket;
