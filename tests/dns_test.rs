mod common;

use common::*;
use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use kernet::dns::{self, DNS_CLIENT_PORT, DNS_SERVER_PORT};

const RESOLVED: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// Spin until the device has captured at least `n` frames.
fn wait_for_frames(device: &TestDevice, n: usize) {
    for _ in 0..2000 {
        if device.sent_count() >= n {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("expected {} frames, saw {}", n, device.sent_count());
}

/// A positive response to the query captured in `query_frame`.
fn dns_response(query_frame: &[u8], addr: Ipv4Addr, ttl: u32) -> Vec<u8> {
    // Transaction id sits at the start of the UDP payload (offset 42).
    let qid = [query_frame[42], query_frame[43]];
    // Question section: everything after the 12-byte DNS header. The UDP
    // length field counts its own 8-byte header, so the segment ends at
    // offset 34 + udp_len.
    let udp_len = u16::from_be_bytes([query_frame[38], query_frame[39]]) as usize;
    let question = &query_frame[54..34 + udp_len];

    let mut payload = Vec::new();
    payload.extend_from_slice(&qid);
    payload.extend_from_slice(&0x8180u16.to_be_bytes()); // response, no error
    payload.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    payload.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
    payload.extend_from_slice(&[0, 0, 0, 0]);
    payload.extend_from_slice(question);
    payload.extend_from_slice(&[0xC0, 0x0C]); // name pointer to the question
    payload.extend_from_slice(&[0, 1, 0, 1]); // TYPE=A, CLASS=IN
    payload.extend_from_slice(&ttl.to_be_bytes());
    payload.extend_from_slice(&[0, 4]);
    payload.extend_from_slice(&addr.octets());

    udp_frame(GATEWAY_IP, DNS_SERVER_PORT, DNS_CLIENT_PORT, &payload)
}

/// Stack with the DNS server's MAC pre-learned so queries leave without
/// an ARP round trip.
fn dns_stack(device: std::sync::Arc<TestDevice>) -> std::sync::Arc<kernet::NetStack> {
    let stack = test_stack(device);
    kernet::arp::learn(&stack, PEER_MAC, GATEWAY_IP);
    stack
}

#[test]
fn lookup_blocks_until_response_arrives() {
    let device = TestDevice::new();
    let stack = dns_stack(device.clone());

    let worker = {
        let stack = stack.clone();
        thread::spawn(move || dns::lookup(&stack, "example.com", 5))
    };

    wait_for_frames(&device, 1);
    let query = device.last_sent().unwrap();
    // Query goes to the configured server on port 53.
    assert_eq!(u16::from_be_bytes([query[36], query[37]]), DNS_SERVER_PORT);

    inject(&stack, &dns_response(&query, RESOLVED, 300));
    assert_eq!(worker.join().unwrap(), Some(RESOLVED));

    // Now cached: no further query.
    device.clear();
    assert_eq!(dns::lookup(&stack, "example.com", 5), Some(RESOLVED));
    assert_eq!(device.sent_count(), 0);
}

#[test]
fn concurrent_lookups_share_one_query() {
    let device = TestDevice::new();
    let stack = dns_stack(device.clone());

    let first = {
        let stack = stack.clone();
        thread::spawn(move || dns::lookup(&stack, "shared.test", 5))
    };
    wait_for_frames(&device, 1);

    let second = {
        let stack = stack.clone();
        thread::spawn(move || dns::lookup(&stack, "shared.test", 5))
    };
    // Give the second lookup time to join the pending entry.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(device.sent_count(), 1);

    let query = device.last_sent().unwrap();
    inject(&stack, &dns_response(&query, RESOLVED, 300));

    assert_eq!(first.join().unwrap(), Some(RESOLVED));
    assert_eq!(second.join().unwrap(), Some(RESOLVED));
    assert_eq!(device.sent_count(), 1);
}

#[test]
fn lookup_times_out_without_answer() {
    let device = TestDevice::new();
    let stack = dns_stack(device.clone());

    let worker = {
        let stack = stack.clone();
        thread::spawn(move || dns::lookup(&stack, "noanswer.test", 2))
    };
    wait_for_frames(&device, 1);

    stack.tick();
    thread::sleep(Duration::from_millis(10));
    assert!(!worker.is_finished());

    stack.tick();
    assert_eq!(worker.join().unwrap(), None);
    assert_eq!(stack.counters().dns_timeouts, 1);
}

#[test]
fn mismatched_transaction_id_is_ignored() {
    let device = TestDevice::new();
    let stack = dns_stack(device.clone());

    let worker = {
        let stack = stack.clone();
        thread::spawn(move || dns::lookup(&stack, "strict.test", 2))
    };
    wait_for_frames(&device, 1);

    let mut bogus = dns_response(&device.last_sent().unwrap(), RESOLVED, 300);
    // Corrupt the transaction id (and fix the UDP checksum by rebuilding).
    bogus[42] ^= 0xFF;
    let payload_len = u16::from_be_bytes([bogus[38], bogus[39]]) as usize - 8;
    let payload = bogus[42..42 + payload_len].to_vec();
    let bogus = udp_frame(GATEWAY_IP, DNS_SERVER_PORT, DNS_CLIENT_PORT, &payload);
    inject(&stack, &bogus);

    thread::sleep(Duration::from_millis(10));
    assert!(!worker.is_finished());

    stack.tick();
    stack.tick();
    assert_eq!(worker.join().unwrap(), None);
}

#[test]
fn literal_address_needs_no_query() {
    let device = TestDevice::new();
    let stack = dns_stack(device.clone());

    assert_eq!(
        dns::lookup(&stack, "10.0.0.55", 5),
        Some(Ipv4Addr::new(10, 0, 0, 55))
    );
    assert_eq!(device.sent_count(), 0);
}

#[test]
fn permanent_entries_survive_aging() {
    let device = TestDevice::new();
    let stack = dns_stack(device.clone());

    stack
        .dns
        .insert_permanent("printer.local", Ipv4Addr::new(10, 0, 0, 9));
    for _ in 0..100 {
        stack.tick();
    }
    assert_eq!(
        stack.dns.cached("printer.local"),
        Some(Ipv4Addr::new(10, 0, 0, 9))
    );
}
