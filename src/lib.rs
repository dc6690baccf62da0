//! kernet: the network protocol core of a small real-time kernel.
//!
//! A hardware-agnostic IPv4 stack built for a driver that delivers raw
//! Ethernet frames from interrupt context. The driver side implements
//! [`NetDevice`] and calls [`NetStack::enqueue_frame`]; a worker thread
//! runs [`NetStack::rx_loop`]; a platform timer calls [`NetStack::tick`]
//! once per second. Everything else is internal plumbing:
//!
//! - a fixed-capacity [`buffer::BufferPool`] shared by both directions
//! - ARP with pending-packet queuing ([`arp`])
//! - ICMP echo ([`icmp`]), UDP with port bindings ([`udp`])
//! - a DNS resolver cache with blocking lookups ([`dns`])
//! - a client-side TCP state machine ([`tcp`])
//! - a BOOTP client for startup configuration ([`bootp`])

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arp;
pub mod bootp;
pub mod buffer;
pub mod device;
pub mod dns;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod stack;
pub mod sync;
pub mod tcp;
pub mod udp;

pub use device::{NetDevice, TransmitError};
pub use stack::{CounterSnapshot, NetConfig, NetStack};
pub use tcp::{TcpHandle, TcpState};
