use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::queue::Watermarks;

/// Per-queue watermark pairs (spec.md §6): `{ readLow, readHigh, writeLow,
/// writeHigh, acceptLow, acceptHigh }`. Defaults: low = 1, high = an
/// implementation maximum large enough to be a non-issue in practice.
/// `High < low` is rejected as `invalid` by [`SocketOptions::validate`].
#[derive(Copy, Clone, Debug)]
pub struct SocketOptions {
    pub read: Watermarks,
    pub write: Watermarks,
    pub accept: Watermarks,
    pub keep_alive: bool,
    pub no_delay: bool,
    pub linger: Option<Duration>,
    pub timestamps: bool,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
}

/// The crate's implementation-maximum watermark: large enough that no
/// realistic workload hits it by accident, small enough to still bound
/// memory against a stalled peer.
pub const DEFAULT_HIGH_WATERMARK: usize = 16 * 1024 * 1024;

impl Default for SocketOptions {
    fn default() -> SocketOptions {
        SocketOptions {
            read: Watermarks::new(1, DEFAULT_HIGH_WATERMARK),
            write: Watermarks::new(1, DEFAULT_HIGH_WATERMARK),
            accept: Watermarks::new(1, DEFAULT_HIGH_WATERMARK),
            keep_alive: false,
            no_delay: false,
            linger: None,
            timestamps: false,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl SocketOptions {
    pub fn validate(&self) -> crate::error::Result<()> {
        for watermarks in [self.read, self.write, self.accept] {
            if watermarks.high < watermarks.low {
                return Err(crate::error::Error::Invalid("high watermark below low watermark"));
            }
        }
        Ok(())
    }
}

/// Multicast group membership options for a [`crate::socket::DatagramSocket`].
#[derive(Copy, Clone, Debug)]
pub struct MulticastOptions {
    pub group: IpAddr,
    pub interface: Ipv4Addr,
    pub loopback: bool,
    pub ttl: u32,
}

/// How a [`crate::interface::Interface`] picks a Driver for a new socket
/// (spec.md §4.F / §6).
#[derive(Copy, Clone, Debug, Default)]
pub struct LoadBalancingOptions {
    pub thread_handle: Option<crate::driver::WaiterToken>,
    pub thread_index: Option<usize>,
    pub weight: u32,
}
