//! Ethernet frame layer (OSI layer 2).
//!
//! Frame structure: [Dest MAC (6)][Src MAC (6)][EtherType (2)][Payload]
//! (the FCS is owned by the device driver on both paths).


use crate::buffer::PacketBuffer;

/// EtherType constants
pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Broadcast MAC address (FF:FF:FF:FF:FF:FF)
pub const BROADCAST_MAC: [u8; 6] = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

/// Ethernet header size
pub const HEADER_SIZE: usize = 14;

/// Minimum frame length on the wire (without FCS)
pub const MIN_FRAME_SIZE: usize = 60;

/// Errors that can occur during Ethernet frame operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthernetError {
    /// Frame is too short to be valid
    FrameTooShort,
}

/// Parsed Ethernet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dest_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub ethertype: u16,
}

impl EthHeader {
    /// Parse an Ethernet header from the start of a frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EthernetError> {
        if data.len() < HEADER_SIZE {
            return Err(EthernetError::FrameTooShort);
        }

        let mut dest_mac = [0u8; 6];
        dest_mac.copy_from_slice(&data[0..6]);

        let mut src_mac = [0u8; 6];
        src_mac.copy_from_slice(&data[6..12]);

        let ethertype = u16::from_be_bytes([data[12], data[13]]);

        Ok(Self {
            dest_mac,
            src_mac,
            ethertype,
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.dest_mac == BROADCAST_MAC
    }
}

/// Write an Ethernet header into the first 14 bytes of a buffer.
pub fn write_header(buf: &mut PacketBuffer, dest: [u8; 6], src: [u8; 6], ethertype: u16) {
    let data = buf.data_mut();
    data[0..6].copy_from_slice(&dest);
    data[6..12].copy_from_slice(&src);
    data[12..14].copy_from_slice(&ethertype.to_be_bytes());
}

/// Zero-pad a frame up to the 60-byte Ethernet minimum.
pub fn pad_to_minimum(buf: &mut PacketBuffer) {
    let len = buf.len();
    if len < MIN_FRAME_SIZE {
        let data = buf.data_mut();
        for byte in &mut data[len..MIN_FRAME_SIZE] {
            *byte = 0;
        }
        buf.set_len(MIN_FRAME_SIZE);
    }
}

/// Format a MAC address for display
pub fn format_mac(mac: &[u8; 6]) -> alloc::string::String {
    use alloc::format;
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
