//! Physical drive entry points for the FAT filesystem layer.
//!
//! The filesystem addresses drives by number and only ever sees a drive
//! once it has been connected in [`Mode::FatFs`]. Everything else answers
//! "not ready".

use bitflags::bitflags;
use embedded_hal::digital::OutputPin;
use platform::mmc::MmcHost;
use platform::storage::{Volume, BLOCK_SIZE};

use crate::drive::{Drive, DriveIndex, Mode};
use crate::manager::DriveManager;
use crate::transfer::BlockTransfer;

bitflags! {
    /// Drive status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        /// Drive not connected for the filesystem.
        const NOT_INITIALIZED = 0x01;
    }
}

/// Outcome of a read, write or control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiskResult {
    /// Succeeded.
    Ok,
    /// Hard error on the card.
    Error,
    /// Drive not connected for the filesystem.
    NotReady,
    /// Bad drive number or argument.
    ParameterError,
}

/// Control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoctlCommand {
    /// Flush pending writes. Writes are never cached, so nothing to do.
    Sync,
    /// Erase block size in sectors.
    GetBlockSize,
    /// Sectors on the card.
    GetSectorCount,
    /// Bytes per sector.
    GetSectorSize,
}

/// Drive-number view of a [`DriveManager`].
pub struct DiskIo<'m, 'a, H, T, V, L> {
    drives: &'m DriveManager<'a, H, T, V, L>,
}

impl<'m, 'a, H, T, V, L> DiskIo<'m, 'a, H, T, V, L>
where
    H: MmcHost,
    T: BlockTransfer,
    V: Volume,
    L: OutputPin,
{
    /// Serve the drives of `drives`.
    pub fn new(drives: &'m DriveManager<'a, H, T, V, L>) -> Self {
        Self { drives }
    }

    fn drive(&self, pdrv: u8) -> Option<&'m Drive<'a, H, T, V, L>> {
        DriveIndex::try_from(u32::from(pdrv))
            .ok()
            .map(|index| self.drives.drive(index))
    }

    /// Drive status.
    pub fn status(&self, pdrv: u8) -> DiskStatus {
        match self.drive(pdrv) {
            Some(drive) if drive.mode() == Mode::FatFs => DiskStatus::empty(),
            _ => {
                warn!("card not initialized. drv={}", pdrv);
                DiskStatus::NOT_INITIALIZED
            }
        }
    }

    /// Connect the drive for the filesystem unless it already is. A drive
    /// held in raw mode is left alone.
    pub async fn initialize(&self, pdrv: u8) -> DiskStatus {
        let Some(drive) = self.drive(pdrv) else {
            return DiskStatus::NOT_INITIALIZED;
        };
        match drive.mode() {
            Mode::FatFs => DiskStatus::empty(),
            Mode::NotConnected if drive.connect(Mode::FatFs).await.is_ok() => {
                DiskStatus::empty()
            }
            _ => {
                warn!("card failed to initialize. drv={}", pdrv);
                DiskStatus::NOT_INITIALIZED
            }
        }
    }

    fn ready_drive(&self, pdrv: u8) -> Result<&'m Drive<'a, H, T, V, L>, DiskResult> {
        let drive = self.drive(pdrv).ok_or(DiskResult::ParameterError)?;
        if drive.mode() == Mode::FatFs {
            Ok(drive)
        } else {
            warn!("card not ready. drv={} mode={:?}", pdrv, drive.mode());
            Err(DiskResult::NotReady)
        }
    }

    /// Read `buffer.len() / 512` sectors starting at `sector`.
    pub async fn read(&self, pdrv: u8, buffer: &mut [u8], sector: u32) -> DiskResult {
        let drive = match self.ready_drive(pdrv) {
            Ok(drive) => drive,
            Err(result) => return result,
        };
        match drive.read_blocks(buffer, sector).await {
            Ok(()) => DiskResult::Ok,
            Err(err) => {
                warn!("read blocks failed. drv={}: {:?}", pdrv, err);
                DiskResult::Error
            }
        }
    }

    /// Write `buffer.len() / 512` sectors starting at `sector`.
    pub async fn write(&self, pdrv: u8, buffer: &[u8], sector: u32) -> DiskResult {
        let drive = match self.ready_drive(pdrv) {
            Ok(drive) => drive,
            Err(result) => return result,
        };
        match drive.write_blocks(buffer, sector).await {
            Ok(()) => DiskResult::Ok,
            Err(err) => {
                warn!("write blocks failed. drv={}: {:?}", pdrv, err);
                DiskResult::Error
            }
        }
    }

    /// Control request. Queries return their value alongside the result.
    pub fn ioctl(&self, pdrv: u8, command: IoctlCommand) -> (DiskResult, Option<u32>) {
        let drive = match self.ready_drive(pdrv) {
            Ok(drive) => drive,
            Err(result) => return (result, None),
        };
        match command {
            IoctlCommand::Sync => (DiskResult::Ok, None),
            IoctlCommand::GetBlockSize => (DiskResult::Ok, Some(1)),
            IoctlCommand::GetSectorCount => (DiskResult::Ok, Some(drive.size_in_blocks())),
            IoctlCommand::GetSectorSize => (DiskResult::Ok, Some(BLOCK_SIZE as u32)),
        }
    }
}
