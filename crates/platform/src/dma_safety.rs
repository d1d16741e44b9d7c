//! Cache-line alignment helpers and SD buffer sizing for the AM335x.
//!
//! ## DMA Accessibility on AM335x
//!
//! | Memory Region | Base Address | Size    | EDMA3 | Cached | Use case |
//! |---------------|-------------|---------|-------|--------|----------|
//! | DDR (EMIF0)   | 0x8000_0000 | 512 MB  | YES   | YES    | SD scratch buffers, sample memory |
//! | OCMC RAM      | 0x4030_0000 | 64 KB   | YES   | NO     | Small coherent DMA buffers |
//! | Internal SRAM | 0x402F_0400 | 63 KB   | NO    | YES    | Boot ROM / public RAM, CPU-only |
//!
//! The SD scratch buffers do not fit OCMC RAM, so they sit in DDR, which
//! is cached: every EDMA transfer touching them needs an
//! explicit flush (before memory → peripheral) or invalidate (after
//! peripheral → memory). Cache maintenance works on whole 64-byte lines,
//! so a DMA buffer must start on a line boundary and cover whole lines or
//! neighbouring data sharing the first/last line gets corrupted.
//!
//! ## Usage
//! ```rust
//! use platform::dma_safety::{CacheAligned, SD_SCRATCH_BYTES};
//!
//! static SCRATCH: CacheAligned<[u8; 4096]> = CacheAligned([0; 4096]);
//! assert!(platform::dma_safety::is_cache_aligned(SCRATCH.0.as_ptr() as usize));
//! # let _ = SD_SCRATCH_BYTES;
//! ```

// ── Cache geometry ───────────────────────────────────────────────────────────

/// Cortex-A8 L1/L2 data cache line size in bytes.
pub const CACHE_LINE_BYTES: usize = 64;

/// True when `address` starts a cache line.
pub const fn is_cache_aligned(address: usize) -> bool {
    address % CACHE_LINE_BYTES == 0
}

/// `len` rounded up to a whole number of cache lines.
pub const fn cache_aligned_len(len: usize) -> usize {
    len.div_ceil(CACHE_LINE_BYTES).saturating_mul(CACHE_LINE_BYTES)
}

/// Wrapper forcing cache-line alignment.
///
/// Use for any buffer handed to EDMA that lives in cached DDR.
#[repr(align(64))]
#[derive(Debug, Clone, Copy)]
pub struct CacheAligned<T>(pub T);

impl<T> core::ops::Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> core::ops::DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

// ── SD card DMA constants ────────────────────────────────────────────────────

/// SD block size in bytes.
pub const SD_BLOCK_BYTES: usize = 512;

/// Per-drive SD scratch buffer size in bytes (256 KiB).
///
/// Bounds the largest multi-block transfer issued as one command; larger
/// requests are split into chunks of this size.
pub const SD_SCRATCH_BYTES: usize = 256 * 1024;

/// Per-drive SD scratch buffer capacity in blocks.
pub const SD_SCRATCH_BLOCKS: usize = SD_SCRATCH_BYTES / SD_BLOCK_BYTES;
