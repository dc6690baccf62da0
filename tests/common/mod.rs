//! Shared harness: a capturing mock device plus wire-frame builders.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use kernet::buffer::L3_OFFSET;
use kernet::ethernet::{self, ETHERTYPE_IPV4};
use kernet::ipv4::{self, Ipv4Header};
use kernet::stack::{NetConfig, NetStack};
use kernet::{NetDevice, TransmitError};

pub const OUR_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
pub const PEER_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xAB, 0xCD, 0xEF];

pub const OUR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 99);
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Mock NIC that records every transmitted frame.
pub struct TestDevice {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl TestDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.frames.lock().unwrap().last().cloned()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

impl NetDevice for TestDevice {
    fn mac_address(&self) -> [u8; 6] {
        OUR_MAC
    }

    fn transmit(&self, frame: &[u8]) -> Result<(), TransmitError> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

/// A stack configured on 10.0.0.0/24 with the usual test addresses.
pub fn test_stack(device: Arc<TestDevice>) -> Arc<NetStack> {
    let config = NetConfig {
        ip_addr: OUR_IP,
        netmask: NETMASK,
        gateway: Some(GATEWAY_IP),
        dns_server: GATEWAY_IP,
    };
    Arc::new(NetStack::new(device, config))
}

/// Deliver a frame as the driver interrupt would, then run the worker.
pub fn inject(stack: &NetStack, frame: &[u8]) {
    stack.enqueue_frame(frame);
    assert_eq!(stack.poll(), 1, "frame was not processed");
}

pub fn eth_frame(dest: [u8; 6], src: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(L3_OFFSET + payload.len());
    frame.extend_from_slice(&dest);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// An ARP reply telling us `sender_ip` is at `sender_mac`.
pub fn arp_reply_frame(sender_mac: [u8; 6], sender_ip: Ipv4Addr) -> Vec<u8> {
    let reply = kernet::arp::ArpMessage::new_reply(sender_mac, sender_ip, OUR_MAC, OUR_IP);
    let mut bytes = [0u8; kernet::arp::ARP_PACKET_SIZE];
    reply.write(&mut bytes);
    eth_frame(OUR_MAC, sender_mac, ethernet::ETHERTYPE_ARP, &bytes)
}

/// A full Ethernet+IPv4 frame carrying `l4` as the transport segment.
pub fn ipv4_frame(src_ip: Ipv4Addr, dest_ip: Ipv4Addr, protocol: u8, l4: &[u8]) -> Vec<u8> {
    let header = Ipv4Header::new(src_ip, dest_ip, protocol, l4.len() as u16);
    let mut packet = Vec::with_capacity(ipv4::HEADER_SIZE + l4.len());
    packet.extend_from_slice(&header.to_bytes());
    packet.extend_from_slice(l4);
    eth_frame(OUR_MAC, PEER_MAC, ETHERTYPE_IPV4, &packet)
}

/// A UDP datagram from the peer, with a correct transport checksum.
pub fn udp_frame(
    src_ip: Ipv4Addr,
    src_port: u16,
    dest_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let length = (kernet::udp::HEADER_SIZE + payload.len()) as u16;
    let mut segment = Vec::with_capacity(length as usize);
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dest_port.to_be_bytes());
    segment.extend_from_slice(&length.to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);

    let mut csum =
        ipv4::pseudo_header_checksum(src_ip, OUR_IP, ipv4::protocol::UDP, &segment);
    if csum == 0 {
        csum = 0xFFFF;
    }
    segment[6..8].copy_from_slice(&csum.to_be_bytes());

    ipv4_frame(src_ip, OUR_IP, ipv4::protocol::UDP, &segment)
}

/// A TCP segment from the peer, with a correct transport checksum.
pub fn tcp_frame(
    src_ip: Ipv4Addr,
    src_port: u16,
    dest_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut segment = Vec::with_capacity(kernet::tcp::TCP_HEADER_SIZE + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dest_port.to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&ack.to_be_bytes());
    segment.push(5 << 4);
    segment.push(flags);
    segment.extend_from_slice(&4096u16.to_be_bytes());
    segment.extend_from_slice(&[0, 0, 0, 0]);
    segment.extend_from_slice(payload);

    let csum = ipv4::pseudo_header_checksum(src_ip, OUR_IP, ipv4::protocol::TCP, &segment);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());

    ipv4_frame(src_ip, OUR_IP, ipv4::protocol::TCP, &segment)
}

/// Parsed view of a transmitted frame's TCP header fields.
pub struct SentTcp {
    pub src_port: u16,
    pub dest_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub payload: Vec<u8>,
}

/// Pull the TCP fields out of a captured frame, if it is TCP at all.
pub fn parse_sent_tcp(frame: &[u8]) -> Option<SentTcp> {
    if frame.len() < 54 {
        return None;
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_IPV4 || frame[23] != 6 {
        return None;
    }
    let total_length = u16::from_be_bytes([frame[16], frame[17]]) as usize;
    let tcp = &frame[34..];
    let payload_len = total_length.saturating_sub(20 + 20);
    Some(SentTcp {
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dest_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        flags: tcp[13] & 0x3F,
        payload: tcp[20..20 + payload_len].to_vec(),
    })
}

/// Destination MAC of a captured frame.
pub fn sent_dest_mac(frame: &[u8]) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&frame[0..6]);
    mac
}

/// Ethertype of a captured frame.
pub fn sent_ethertype(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[12], frame[13]])
}
