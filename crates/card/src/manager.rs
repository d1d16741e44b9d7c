//! The two-drive registry behind the public card API.

use embedded_hal::digital::OutputPin;
use platform::mmc::{BusWidth, MmcHost, MmcIrq};
use platform::storage::Volume;

use crate::drive::{Drive, DriveIndex, ErrorStatus, Mode};
use crate::error::CardError;
use crate::transfer::BlockTransfer;

/// Rear and front SD slots.
pub struct DriveManager<'a, H, T, V, L> {
    drives: [Drive<'a, H, T, V, L>; 2],
}

impl<'a, H, T, V, L> DriveManager<'a, H, T, V, L>
where
    H: MmcHost,
    T: BlockTransfer,
    V: Volume,
    L: OutputPin,
{
    /// Register both drives, each in the slot it was built for.
    ///
    /// Fails with [`CardError::InvalidDrive`] when both claim the same slot.
    pub fn new(
        first: Drive<'a, H, T, V, L>,
        second: Drive<'a, H, T, V, L>,
    ) -> Result<Self, CardError> {
        match (first.index(), second.index()) {
            (DriveIndex::Rear, DriveIndex::Front) => Ok(Self {
                drives: [first, second],
            }),
            (DriveIndex::Front, DriveIndex::Rear) => Ok(Self {
                drives: [second, first],
            }),
            (index, _) => {
                warn!("card {}: slot registered twice", index.number());
                Err(CardError::InvalidDrive)
            }
        }
    }

    /// The drive in slot `index`.
    pub fn drive(&self, index: DriveIndex) -> &Drive<'a, H, T, V, L> {
        let [rear, front] = &self.drives;
        match index {
            DriveIndex::Rear => rear,
            DriveIndex::Front => front,
        }
    }

    /// The drive with numeric index `number`.
    pub fn by_number(&self, number: u32) -> Result<&Drive<'a, H, T, V, L>, CardError> {
        DriveIndex::try_from(number).map(|index| self.drive(index))
    }

    /// Connect for the local filesystem and mount it.
    pub async fn mount(&self, index: DriveIndex) -> Result<(), CardError> {
        self.drive(index).mount().await
    }

    /// Unmount and disconnect, if mounted.
    pub async fn unmount(&self, index: DriveIndex) {
        self.drive(index).unmount().await;
    }

    /// Local filesystem mounted.
    pub fn is_mounted(&self, index: DriveIndex) -> bool {
        self.drive(index).is_mounted()
    }

    /// Create a fresh filesystem.
    pub async fn format(&self, index: DriveIndex) -> Result<(), CardError> {
        self.drive(index).format().await
    }

    /// Blocks on the card, 0 when not open.
    pub fn size_in_blocks(&self, index: DriveIndex) -> u32 {
        self.drive(index).size_in_blocks()
    }

    /// Read whole blocks.
    pub async fn read_blocks(
        &self,
        index: DriveIndex,
        buffer: &mut [u8],
        sector: u32,
    ) -> Result<(), CardError> {
        self.drive(index).read_blocks(buffer, sector).await
    }

    /// Read whole blocks into a cache-line aligned buffer in one transaction.
    pub async fn read_aligned_blocks(
        &self,
        index: DriveIndex,
        buffer: &mut [u8],
        sector: u32,
    ) -> Result<(), CardError> {
        self.drive(index).read_aligned_blocks(buffer, sector).await
    }

    /// Write whole blocks.
    pub async fn write_blocks(
        &self,
        index: DriveIndex,
        buffer: &[u8],
        sector: u32,
    ) -> Result<(), CardError> {
        self.drive(index).write_blocks(buffer, sector).await
    }

    /// Open the controller for `mode`.
    pub async fn connect(&self, index: DriveIndex, mode: Mode) -> Result<(), CardError> {
        self.drive(index).connect(mode).await
    }

    /// Close the controller.
    pub async fn disconnect(&self, index: DriveIndex) {
        self.drive(index).disconnect().await;
    }

    /// Controller open.
    pub fn is_connected(&self, index: DriveIndex) -> bool {
        self.drive(index).is_connected()
    }

    /// Current mode.
    pub fn mode(&self, index: DriveIndex) -> Mode {
        self.drive(index).mode()
    }

    /// Card still reachable (or busy).
    pub async fn is_present(&self, index: DriveIndex) -> bool {
        self.drive(index).is_present().await
    }

    /// Card is block addressed.
    pub fn is_high_capacity(&self, index: DriveIndex) -> bool {
        self.drive(index).is_high_capacity()
    }

    /// Physical layer version.
    pub fn version(&self, index: DriveIndex) -> Option<u8> {
        self.drive(index).version()
    }

    /// Advertised bus width.
    pub fn bus_width(&self, index: DriveIndex) -> Option<BusWidth> {
        self.drive(index).bus_width()
    }

    /// Card clock in Hz.
    pub fn transfer_speed(&self, index: DriveIndex) -> Option<u32> {
        self.drive(index).transfer_speed()
    }

    /// Card accepts CMD23.
    pub fn supports_set_block_count(&self, index: DriveIndex) -> bool {
        self.drive(index).supports_set_block_count()
    }

    /// Log and return the error counters of both drives.
    pub fn print_error_status(&self) -> [ErrorStatus; 2] {
        DriveIndex::ALL.map(|index| {
            let status = self.drive(index).error_status();
            info!("card {}: timeout={}", index.number(), status.wait_timeouts);
            status
        })
    }

    /// Interrupt handler body for the MMCHS line of slot `index`.
    pub fn on_interrupt<I: MmcIrq>(&self, index: DriveIndex, irq: &mut I) {
        self.drive(index).on_interrupt(irq);
    }
}
