//! Card stack configuration
//!
//! Compile-time constants for the SD protocol plus the runtime
//! [`CardConfig`] that tests shrink (short timeouts, fewer OCR polls).

use embassy_time::Duration;
use platform::config::MMCHS_FUNCTIONAL_CLOCK_HZ;

/// Card clock during identification.
pub const IDENTIFICATION_CLOCK_HZ: u32 = 400_000;

/// Default-speed card clock (TRAN_SPEED 0x32).
pub const DEFAULT_SPEED_CLOCK_HZ: u32 = 25_000_000;

/// High-speed card clock (TRAN_SPEED 0x5A).
pub const HIGH_SPEED_CLOCK_HZ: u32 = 50_000_000;

/// TRAN_SPEED code for 25 MHz.
pub const TRAN_SPEED_25MHZ: u8 = 0x32;

/// TRAN_SPEED code for 50 MHz.
pub const TRAN_SPEED_50MHZ: u8 = 0x5A;

/// Data timeout, as a power of two of the card clock.
pub const DATA_TIMEOUT_EXPONENT: u32 = 27;

/// Bounded wait for a command or data phase.
pub const WAIT_TIMEOUT_MS: u64 = 1000;

/// Maximum CMD55 + ACMD41 rounds before giving up.
pub const OCR_POLL_LIMIT: u32 = 0xFFFF;

/// Attempts per multi-block write chunk.
pub const WRITE_ATTEMPTS: u32 = 5;

/// Largest aligned read issued as one transaction (SD_BLK.NBLK is 16 bits).
pub const MAX_ALIGNED_BLOCKS: usize = 65_535;

/// Runtime tunables for one drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardConfig {
    /// Bound on every command, data phase and DMA completion wait.
    pub wait_timeout: Duration,
    /// Maximum ACMD41 rounds during open.
    pub ocr_poll_limit: u32,
    /// Attempts per multi-block write chunk (at least one is always made).
    pub write_attempts: u32,
    /// Also retry single-block writes.
    pub retry_single_block_writes: bool,
    /// MMCHS functional clock feeding the divider.
    pub functional_clock_hz: u32,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(WAIT_TIMEOUT_MS),
            ocr_poll_limit: OCR_POLL_LIMIT,
            write_attempts: WRITE_ATTEMPTS,
            retry_single_block_writes: false,
            functional_clock_hz: MMCHS_FUNCTIONAL_CLOCK_HZ,
        }
    }
}
