//! BOOTP client - RFC 951 with RFC 1497 vendor extensions
//!
//! Acquires the interface configuration at startup: one broadcast
//! BOOTREQUEST, then a blocking wait for a matching BOOTREPLY carrying
//! our address plus the netmask, router, and DNS server options.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;
use crate::stack::{NetConfig, NetStack};
use crate::sync::SignalSlot;
use crate::udp;

/// Server listens on 67, client on 68
pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;

/// Fixed BOOTP message size: 236-byte header plus 64-byte vendor area
pub const MESSAGE_SIZE: usize = 300;

/// Vendor area offset within the message
const VEND_OFFSET: usize = 236;

/// RFC 1497 magic cookie
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// Vendor option tags
const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS_SERVER: u8 = 6;
const OPT_END: u8 = 255;

/// Configuration extracted from a BOOTREPLY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootpOffer {
    pub ip_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_server: Ipv4Addr,
}

/// In-flight request state, one at a time.
pub(crate) struct BootpState {
    xid: u32,
    pending: bool,
    ttl: u32,
    waiter: Option<Arc<SignalSlot>>,
    offer: Option<BootpOffer>,
}

impl BootpState {
    pub(crate) fn new() -> Self {
        Self {
            xid: 0,
            pending: false,
            ttl: 0,
            waiter: None,
            offer: None,
        }
    }
}

fn build_request(xid: u32, mac: [u8; 6]) -> Vec<u8> {
    let mut message = alloc::vec![0u8; MESSAGE_SIZE];
    message[0] = BOOTREQUEST;
    message[1] = 1; // htype: Ethernet
    message[2] = 6; // hlen
    message[4..8].copy_from_slice(&xid.to_be_bytes());
    message[10] = 0x80; // broadcast flag
    message[28..34].copy_from_slice(&mac);
    message[VEND_OFFSET..VEND_OFFSET + 4].copy_from_slice(&MAGIC_COOKIE);
    message[VEND_OFFSET + 4] = OPT_END;
    message
}

/// Parse a BOOTREPLY into an offer. Messages for another transaction or
/// another client are rejected.
fn parse_reply(data: &[u8], xid: u32, mac: [u8; 6]) -> Option<BootpOffer> {
    if data.len() < MESSAGE_SIZE || data[0] != BOOTREPLY {
        return None;
    }
    if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != xid {
        return None;
    }
    if data[28..34] != mac {
        return None;
    }

    let ip_addr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    if ip_addr.is_unspecified() {
        return None;
    }

    let mut netmask = Ipv4Addr::new(255, 255, 255, 0);
    let mut gateway = None;
    let mut dns_server = Ipv4Addr::UNSPECIFIED;

    if data[VEND_OFFSET..VEND_OFFSET + 4] == MAGIC_COOKIE {
        let mut pos = VEND_OFFSET + 4;
        while pos < data.len() {
            let tag = data[pos];
            if tag == OPT_END {
                break;
            }
            if tag == OPT_PAD {
                pos += 1;
                continue;
            }
            if pos + 1 >= data.len() {
                break;
            }
            let len = data[pos + 1] as usize;
            if pos + 2 + len > data.len() {
                break;
            }
            let value = &data[pos + 2..pos + 2 + len];
            if len >= 4 {
                let addr = Ipv4Addr::new(value[0], value[1], value[2], value[3]);
                match tag {
                    OPT_SUBNET_MASK => netmask = addr,
                    OPT_ROUTER => gateway = Some(addr),
                    OPT_DNS_SERVER => dns_server = addr,
                    _ => {}
                }
            }
            pos += 2 + len;
        }
    }

    Some(BootpOffer {
        ip_addr,
        netmask,
        gateway,
        dns_server,
    })
}

/// UDP handler for the client port.
pub fn handle_reply(stack: &NetStack, _src_ip: Ipv4Addr, _src_port: u16, payload: &[u8]) {
    let woken = {
        let mut state = stack.bootp.lock();
        if !state.pending {
            return;
        }
        let Some(offer) = parse_reply(payload, state.xid, stack.mac_address()) else {
            return;
        };
        state.offer = Some(offer);
        state.pending = false;
        state.waiter.take()
    };

    if let Some(waiter) = woken {
        waiter.complete(true);
    }
}

/// Broadcast a BOOTREQUEST and block for up to `timeout_secs` ticks.
/// A successful reply is applied to the stack configuration and the new
/// config returned.
pub fn configure(stack: &NetStack, timeout_secs: u32) -> Option<NetConfig> {
    let slot = Arc::new(SignalSlot::new());
    let xid = stack.next_ident() as u32 | ((stack.next_ident() as u32) << 16);
    let mac = stack.mac_address();

    {
        let mut state = stack.bootp.lock();
        if state.pending {
            return None;
        }
        state.xid = xid;
        state.pending = true;
        state.ttl = timeout_secs.max(1);
        state.waiter = Some(slot.clone());
        state.offer = None;
    }

    let request = build_request(xid, mac);
    log::debug!("bootp: broadcasting request (xid {:#x})", xid);
    if !udp::send_datagram(
        stack,
        CLIENT_PORT,
        Ipv4Addr::BROADCAST,
        SERVER_PORT,
        &request,
    ) {
        stack.bootp.lock().pending = false;
        return None;
    }

    if !slot.wait() {
        return None;
    }

    let offer = stack.bootp.lock().offer.take()?;
    let config = NetConfig {
        ip_addr: offer.ip_addr,
        netmask: offer.netmask,
        gateway: offer.gateway,
        dns_server: offer.dns_server,
    };
    stack.set_config(config);
    log::info!(
        "bootp: configured {} netmask {} dns {}",
        config.ip_addr,
        config.netmask,
        config.dns_server
    );
    Some(config)
}

/// 1 Hz aging pass driving the request timeout.
pub fn tick(stack: &NetStack) {
    let timed_out = {
        let mut state = stack.bootp.lock();
        if !state.pending {
            None
        } else {
            state.ttl = state.ttl.saturating_sub(1);
            if state.ttl == 0 {
                state.pending = false;
                state.waiter.take()
            } else {
                None
            }
        }
    };

    if let Some(waiter) = timed_out {
        log::debug!("bootp: request timed out");
        waiter.complete(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    #[test]
    fn request_layout() {
        let request = build_request(0xDEADBEEF, MAC);
        assert_eq!(request.len(), MESSAGE_SIZE);
        assert_eq!(request[0], BOOTREQUEST);
        assert_eq!(&request[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&request[28..34], &MAC);
        assert_eq!(&request[236..240], &MAGIC_COOKIE);
    }

    #[test]
    fn reply_options_parsed() {
        let mut reply = build_request(0x1111, MAC);
        reply[0] = BOOTREPLY;
        reply[16..20].copy_from_slice(&[10, 0, 0, 42]);
        let vend = &mut reply[240..];
        vend[0] = OPT_SUBNET_MASK;
        vend[1] = 4;
        vend[2..6].copy_from_slice(&[255, 255, 0, 0]);
        vend[6] = OPT_ROUTER;
        vend[7] = 4;
        vend[8..12].copy_from_slice(&[10, 0, 0, 1]);
        vend[12] = OPT_DNS_SERVER;
        vend[13] = 4;
        vend[14..18].copy_from_slice(&[10, 0, 0, 53]);
        vend[18] = OPT_END;

        let offer = parse_reply(&reply, 0x1111, MAC).unwrap();
        assert_eq!(offer.ip_addr, Ipv4Addr::new(10, 0, 0, 42));
        assert_eq!(offer.netmask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(offer.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(offer.dns_server, Ipv4Addr::new(10, 0, 0, 53));
    }

    #[test]
    fn reply_for_other_xid_ignored() {
        let mut reply = build_request(0x1111, MAC);
        reply[0] = BOOTREPLY;
        reply[16..20].copy_from_slice(&[10, 0, 0, 42]);
        assert!(parse_reply(&reply, 0x2222, MAC).is_none());
    }
}
