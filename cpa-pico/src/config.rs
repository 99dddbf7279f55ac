// Device identity and hardware constants.

// =============================================================================
// USB descriptors
// =============================================================================

pub const USB_VID: u16 = 0x04B4;
pub const USB_PID: u16 = 0x8613;

// =============================================================================
// Sampling stream parameters
// =============================================================================

/// Each sampling bulk transfer is 512 bytes.
pub const BULK_BLOCK_SIZE: usize = 512;

/// USB max packet size for Full Speed bulk endpoints.
pub const USB_MAX_PACKET_SIZE: u16 = 64;

/// Index of the sample-ready handshake line, relative to the capture input
/// base. Data occupies indices 0..=7, ready sits just above.
pub const READY_PIN_INDEX: u8 = 8;

// =============================================================================
// DUT serial bridge parameters
// =============================================================================

/// Baud rate of the DUT-facing UART.
pub const DUT_BAUD: u32 = 115_200;

/// Staging buffer between the UART and the bulk IN endpoint.
pub const BRIDGE_BUF_SIZE: usize = 512;

/// Flush to USB as soon as more than this many bytes are staged.
pub const BRIDGE_FLUSH_WATERMARK: usize = 200;

/// Flush a partial buffer after this many idle drain passes.
pub const BRIDGE_IDLE_BOUND: u32 = 1000;

/// Pacing of the drain loop while bytes are staged, in microseconds.
pub const BRIDGE_POLL_TICK_US: u64 = 10;
