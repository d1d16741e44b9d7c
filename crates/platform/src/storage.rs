//! Storage abstraction: block devices and the filesystems mounted on them

/// Size of one logical block (sector) in bytes.
pub const BLOCK_SIZE: usize = 512;

/// Block device with 512-byte sectors.
///
/// Buffers are always a whole number of blocks; `sector` is a block index
/// regardless of how the underlying card is addressed.
pub trait BlockDevice {
    /// Error type
    type Error: core::fmt::Debug;

    /// Read `buffer.len() / 512` blocks starting at `sector`.
    fn read_blocks(
        &self,
        buffer: &mut [u8],
        sector: u32,
    ) -> impl core::future::Future<Output = Result<(), Self::Error>>;

    /// Write `buffer.len() / 512` blocks starting at `sector`.
    fn write_blocks(
        &self,
        buffer: &[u8],
        sector: u32,
    ) -> impl core::future::Future<Output = Result<(), Self::Error>>;

    /// Number of blocks on the device (0 when unavailable).
    fn block_count(&self) -> u32;
}

/// A filesystem that can be mounted on a [`BlockDevice`].
///
/// The FAT driver itself lives outside this repository; this is the seam it
/// plugs into.
pub trait Volume {
    /// Error type
    type Error: core::fmt::Debug;

    /// Mount the filesystem found on `disk`.
    fn mount<D: BlockDevice>(
        &mut self,
        disk: &D,
    ) -> impl core::future::Future<Output = Result<(), Self::Error>>;

    /// Forget the mounted filesystem.
    fn unmount(&mut self);

    /// Create a fresh, empty filesystem on `disk`.
    fn format<D: BlockDevice>(
        &mut self,
        disk: &D,
    ) -> impl core::future::Future<Output = Result<(), Self::Error>>;

    /// True while mounted.
    fn is_mounted(&self) -> bool;
}
