//! Board configuration and constants
//!
//! Fixed hardware identity of the two SD card slots. Everything that
//! depends on which MMCHS instance or EDMA event a slot is wired to
//! should reference these constants rather than hardcoding values.

/// MMCHS functional clock feeding the card clock divider (Hz).
pub const MMCHS_FUNCTIONAL_CLOCK_HZ: u32 = 96_000_000;

/// Hardware identity of one MMCHS instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HostIdentity {
    /// Register block base address.
    pub base_address: usize,
    /// ARM interrupt controller line.
    pub interrupt: u32,
    /// EDMA3 event for FIFO write requests.
    pub dma_tx_event: u32,
    /// EDMA3 event for FIFO read requests.
    pub dma_rx_event: u32,
}

/// MMCHS0: rear card slot.
pub const MMCHS0: HostIdentity = HostIdentity {
    base_address: 0x4806_0000,
    interrupt: 64,
    dma_tx_event: 24,
    dma_rx_event: 25,
};

/// MMCHS1: front card slot.
pub const MMCHS1: HostIdentity = HostIdentity {
    base_address: 0x481D_8000,
    interrupt: 28,
    dma_tx_event: 2,
    dma_rx_event: 3,
};

/// Mount path of the rear slot's filesystem.
pub const REAR_MOUNT_PATH: &str = "0:";

/// Mount path of the front slot's filesystem.
pub const FRONT_MOUNT_PATH: &str = "1:";
