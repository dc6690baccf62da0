//! Network device abstraction layer.
//!
//! Drivers live outside this core; their whole contract is "expose a MAC
//! address, transmit a frame, and hand every received frame (FCS already
//! stripped) to [`NetStack::enqueue_frame`](crate::stack::NetStack::enqueue_frame)".

/// Errors that can occur during packet transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// Packet too large for the device
    PacketTooLarge,
    /// TX buffer is full, try again later
    BufferFull,
    /// Device is not ready
    NotReady,
    /// Hardware error during transmission
    HardwareError,
}

/// Network device trait that all network drivers must implement.
pub trait NetDevice: Send + Sync {
    /// Get the MAC address of this device.
    fn mac_address(&self) -> [u8; 6];

    /// Transmit a complete Ethernet frame (without FCS).
    fn transmit(&self, frame: &[u8]) -> Result<(), TransmitError>;
}
