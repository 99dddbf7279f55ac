//! Flush policy for the DUT-serial to USB direction of the bridge.
//!
//! Received UART bytes accumulate in a staging buffer at a write offset. The
//! drain loop polls this policy once per pass: the buffer is flushed to the
//! transport either when enough bytes piled up (watermark) or when bytes have
//! been sitting there for too many idle passes. Both counters reset on flush,
//! so a quiet line still gets its partial buffer delivered promptly while a
//! busy line is packed into large transfers.

pub struct FlushPolicy {
    watermark: usize,
    idle_bound: u32,
    pending: usize,
    idle_polls: u32,
}

impl FlushPolicy {
    pub const fn new(watermark: usize, idle_bound: u32) -> Self {
        Self {
            watermark,
            idle_bound,
            pending: 0,
            idle_polls: 0,
        }
    }

    /// Account for `n` bytes appended to the staging buffer.
    pub fn on_receive(&mut self, n: usize) {
        self.pending += n;
    }

    /// One pass of the drain loop. `true` means flush now.
    ///
    /// The idle counter only advances while bytes are pending and neither
    /// condition has been met yet.
    pub fn poll(&mut self) -> bool {
        if self.pending == 0 {
            return false;
        }
        if self.pending > self.watermark || self.idle_polls > self.idle_bound {
            true
        } else {
            self.idle_polls += 1;
            false
        }
    }

    /// The staging buffer was handed to the transport.
    pub fn flushed(&mut self) {
        self.pending = 0;
        self.idle_polls = 0;
    }

    pub fn pending(&self) -> usize {
        self.pending
    }
}

// =============================================================================
// Tests
// =============================================================================
