//! One physical SD slot: controller, transfer strategy, mode and volume.
//!
//! ## Locking
//!
//! | State                       | Guard                                   |
//! |-----------------------------|-----------------------------------------|
//! | controller + scratch buffer | async `Mutex`, held for one chunk       |
//! | volume                      | async `Mutex`, held for mount / format  |
//! | mode                        | blocking `Mutex<Cell<_>>`               |
//! | published card info         | [`ControllerShared`]                    |
//!
//! Multi-chunk transfers drop the controller lock and yield between
//! chunks, so presence checks and the other task sharing the drive get a
//! turn mid-transfer.
//!
//! ## Modes
//!
//! ```text
//!            connect(Raw)                      connect(FatFs) / mount
//!   RAW  ◀──────────────── NOT_CONNECTED ────────────────▶ FATFS
//!        ───────────────▶               ◀───────────────
//!           disconnect                     disconnect / unmount
//! ```

use core::cell::{Cell, RefCell};

use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal::digital::OutputPin;
use platform::config::{HostIdentity, FRONT_MOUNT_PATH, MMCHS0, MMCHS1, REAR_MOUNT_PATH};
use platform::dma_safety::is_cache_aligned;
use platform::events::{CardEvent, CardEventChannel};
use platform::mmc::{BusWidth, MmcHost, MmcIrq};
use platform::storage::{BlockDevice, Volume, BLOCK_SIZE};

use crate::config::{CardConfig, MAX_ALIGNED_BLOCKS};
use crate::controller::CardController;
use crate::error::CardError;
use crate::protocol::CardInfo;
use crate::transfer::BlockTransfer;
use crate::transport::ControllerShared;

/// Physical drive number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DriveIndex {
    /// Rear slot, MMCHS0 (`CARD_REAR`).
    Rear = 0,
    /// Front slot, MMCHS1 (`CARD_FRONT`).
    Front = 1,
}

impl DriveIndex {
    /// Both drives, in index order.
    pub const ALL: [Self; 2] = [Self::Rear, Self::Front];

    /// Numeric drive index.
    pub const fn number(self) -> u32 {
        self as u32
    }

    /// MMCHS instance wired to this slot.
    pub const fn identity(self) -> HostIdentity {
        match self {
            Self::Rear => MMCHS0,
            Self::Front => MMCHS1,
        }
    }

    /// Slot whose MMCHS raises interrupt controller line `line`.
    pub fn from_interrupt(line: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|index| index.identity().interrupt == line)
    }

    /// Filesystem mount path.
    pub const fn mount_path(self) -> &'static str {
        match self {
            Self::Rear => REAR_MOUNT_PATH,
            Self::Front => FRONT_MOUNT_PATH,
        }
    }

    const fn raw_mount_event(self) -> CardEvent {
        match self {
            Self::Rear => CardEvent::UsbRearCardMount,
            Self::Front => CardEvent::UsbFrontCardMount,
        }
    }

    const fn raw_unmount_event(self) -> CardEvent {
        match self {
            Self::Rear => CardEvent::UsbRearCardUnmount,
            Self::Front => CardEvent::UsbFrontCardUnmount,
        }
    }
}

impl TryFrom<u32> for DriveIndex {
    type Error = CardError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Rear),
            1 => Ok(Self::Front),
            _ => Err(CardError::InvalidDrive),
        }
    }
}

/// Who the card is currently serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Controller closed.
    #[default]
    NotConnected,
    /// Exposed to the USB host as raw blocks.
    Raw,
    /// Mounted (or being formatted) by the local filesystem.
    FatFs,
}

/// Activity LED shared by both drives.
pub struct ActivityLed<L> {
    pin: BlockingMutex<CriticalSectionRawMutex, RefCell<L>>,
}

impl<L: OutputPin> ActivityLed<L> {
    /// Wrap the LED pin (usable in a `static`).
    pub const fn new(pin: L) -> Self {
        Self {
            pin: BlockingMutex::new(RefCell::new(pin)),
        }
    }

    /// Light the LED. Pin errors are ignored.
    pub fn on(&self) {
        self.pin.lock(|pin| {
            let _ = pin.borrow_mut().set_high();
        });
    }

    /// Switch the LED off. Pin errors are ignored.
    pub fn off(&self) {
        self.pin.lock(|pin| {
            let _ = pin.borrow_mut().set_low();
        });
    }
}

/// Per-drive error counters, as reported by `print_error_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorStatus {
    /// Drive the counters belong to.
    pub drive: DriveIndex,
    /// Waits that ran into the timeout.
    pub wait_timeouts: u32,
}

/// Controller and its transfer strategy, guarded together.
struct Link<'a, H, T> {
    controller: CardController<'a, H>,
    strategy: T,
}

/// One SD slot.
pub struct Drive<'a, H, T, V, L> {
    index: DriveIndex,
    shared: &'a ControllerShared,
    link: Mutex<CriticalSectionRawMutex, Link<'a, H, T>>,
    chunk_blocks: usize,
    mode: BlockingMutex<CriticalSectionRawMutex, Cell<Mode>>,
    volume: Mutex<CriticalSectionRawMutex, V>,
    led: &'a ActivityLed<L>,
    events: &'a CardEventChannel,
    config: CardConfig,
}

impl<'a, H, T, V, L> Drive<'a, H, T, V, L>
where
    H: MmcHost,
    T: BlockTransfer,
    V: Volume,
    L: OutputPin,
{
    /// Bind a host controller, transfer strategy and volume to slot `index`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: DriveIndex,
        host: H,
        strategy: T,
        volume: V,
        shared: &'a ControllerShared,
        led: &'a ActivityLed<L>,
        events: &'a CardEventChannel,
        config: CardConfig,
    ) -> Self {
        let chunk_blocks = strategy.chunk_blocks().max(1);
        Self {
            index,
            shared,
            link: Mutex::new(Link {
                controller: CardController::new(index.identity(), host, shared, &config),
                strategy,
            }),
            chunk_blocks,
            mode: BlockingMutex::new(Cell::new(Mode::NotConnected)),
            volume: Mutex::new(volume),
            led,
            events,
            config,
        }
    }

    /// Slot number.
    pub fn index(&self) -> DriveIndex {
        self.index
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.mode.lock(Cell::get)
    }

    fn set_mode(&self, mode: Mode) {
        self.mode.lock(|cell| cell.set(mode));
    }

    /// Largest chunk handed to the transfer strategy in one lock.
    pub fn chunk_blocks(&self) -> usize {
        self.chunk_blocks
    }

    /// Card info while the controller is open.
    pub fn info(&self) -> Option<CardInfo> {
        self.shared.info()
    }

    /// Controller open.
    pub fn is_connected(&self) -> bool {
        self.info().is_some()
    }

    /// Local filesystem mounted.
    pub fn is_mounted(&self) -> bool {
        self.mode() == Mode::FatFs
    }

    /// Blocks on the card, 0 when not open.
    pub fn size_in_blocks(&self) -> u32 {
        self.info().map_or(0, |info| info.block_count)
    }

    /// Card is block addressed.
    pub fn is_high_capacity(&self) -> bool {
        self.info().is_some_and(|info| info.high_capacity)
    }

    /// Physical layer version (1–4).
    pub fn version(&self) -> Option<u8> {
        self.info().map(|info| info.version)
    }

    /// Bus width the card advertises.
    pub fn bus_width(&self) -> Option<BusWidth> {
        self.info().and_then(|info| info.bus_width())
    }

    /// Card clock in Hz.
    pub fn transfer_speed(&self) -> Option<u32> {
        self.info().and_then(|info| info.transfer_speed_hz())
    }

    /// Card accepts CMD23.
    pub fn supports_set_block_count(&self) -> bool {
        self.info().is_some_and(|info| info.supports_cmd23)
    }

    /// Error counters.
    pub fn error_status(&self) -> ErrorStatus {
        ErrorStatus {
            drive: self.index,
            wait_timeouts: self.shared.wait_timeouts(),
        }
    }

    /// Interrupt handler body for this slot's MMCHS line.
    pub fn on_interrupt<I: MmcIrq>(&self, irq: &mut I) {
        self.shared.on_interrupt(irq);
    }

    /// [`BlockDevice`] view of this drive, for the filesystem.
    pub fn disk(&self) -> DriveDisk<'_, 'a, H, T, V, L> {
        DriveDisk { drive: self }
    }

    fn emit(&self, event: CardEvent) {
        if self.events.try_send(event).is_err() {
            warn!("card event queue full, dropped {:?}", event);
        }
    }

    // ── Mode transitions ─────────────────────────────────────────────────────

    /// Open the controller for `mode`.
    ///
    /// Already open in `mode` is a no-op. Otherwise the drive is
    /// disconnected first; connecting to [`Mode::NotConnected`] stops there.
    pub async fn connect(&self, mode: Mode) -> Result<(), CardError> {
        if self.is_connected() && self.mode() == mode {
            return Ok(());
        }

        self.disconnect().await;

        if mode == Mode::NotConnected {
            return Ok(());
        }

        if let Err(err) = self.link.lock().await.controller.open().await {
            debug!("drv={} failed to connect", self.index.number());
            return Err(err);
        }

        self.set_mode(mode);
        match mode {
            Mode::Raw => {
                debug!("drv={} connected in raw mode", self.index.number());
                self.emit(self.index.raw_mount_event());
            }
            Mode::FatFs => debug!("drv={} connected in fatfs mode", self.index.number()),
            Mode::NotConnected => {}
        }
        Ok(())
    }

    /// Close the controller and drop to [`Mode::NotConnected`].
    pub async fn disconnect(&self) {
        if self.is_connected() {
            self.link.lock().await.controller.close();
            debug!("drv={} disconnected", self.index.number());
        }
        if self.mode() == Mode::Raw {
            self.emit(self.index.raw_unmount_event());
        }
        self.set_mode(Mode::NotConnected);
    }

    /// Connect for the local filesystem and mount it. Only allowed while
    /// not connected.
    pub async fn mount(&self) -> Result<(), CardError> {
        if self.mode() != Mode::NotConnected {
            return Err(CardError::ModeConflict);
        }
        self.connect(Mode::FatFs).await?;

        let mounted = self.volume.lock().await.mount(&self.disk()).await;
        if mounted.is_err() {
            warn!("drv={} mount failed", self.index.number());
            self.disconnect().await;
            return Err(CardError::Filesystem);
        }
        info!("drv={} mounted at {}", self.index.number(), self.index.mount_path());
        Ok(())
    }

    /// Unmount the filesystem and disconnect, if mounted.
    pub async fn unmount(&self) {
        if self.is_mounted() {
            self.volume.lock().await.unmount();
            self.disconnect().await;
        }
    }

    /// Create a fresh filesystem, remounting afterwards if it was mounted.
    pub async fn format(&self) -> Result<(), CardError> {
        let was_mounted = self.is_mounted();
        if was_mounted {
            self.unmount().await;
        }

        let formatted = match self.connect(Mode::FatFs).await {
            Ok(()) => {
                let result = self.volume.lock().await.format(&self.disk()).await;
                self.disconnect().await;
                result.map_err(|_| CardError::Filesystem)
            }
            Err(err) => Err(err),
        };

        if was_mounted {
            let remounted = self.mount().await;
            formatted.and(remounted)
        } else {
            formatted
        }
    }

    /// Probe the card without disturbing a transfer in progress.
    ///
    /// A busy drive is reported present. An open controller that no
    /// longer reaches its card is closed and the drive drops to
    /// [`Mode::NotConnected`].
    pub async fn is_present(&self) -> bool {
        let Ok(mut link) = self.link.try_lock() else {
            return true;
        };
        let controller = &mut link.controller;

        if controller.is_open() {
            let present = controller.test_present().await;
            if !present {
                controller.close();
                drop(link);
                info!("drv={} card lost", self.index.number());
                if self.mode() == Mode::Raw {
                    self.emit(self.index.raw_unmount_event());
                }
                self.set_mode(Mode::NotConnected);
            }
            present
        } else {
            let present = controller.open().await.is_ok();
            if present {
                controller.close();
            }
            present
        }
    }

    // ── Block I/O ────────────────────────────────────────────────────────────

    /// Read `buffer.len() / 512` blocks starting at `sector`.
    pub async fn read_blocks(&self, buffer: &mut [u8], sector: u32) -> Result<(), CardError> {
        if whole_blocks(buffer.len())? == 0 {
            return Ok(());
        }
        if !self.is_connected() {
            return Err(CardError::NotConnected);
        }

        self.led.on();
        let result = self.read_chunks(buffer, sector).await;
        self.led.off();
        result
    }

    async fn read_chunks(&self, buffer: &mut [u8], mut sector: u32) -> Result<(), CardError> {
        let chunk_bytes = self.chunk_blocks.saturating_mul(BLOCK_SIZE);
        for (n, chunk) in buffer.chunks_mut(chunk_bytes).enumerate() {
            if n > 0 {
                yield_now().await;
            }
            let mut link = self.link.lock().await;
            let Link {
                controller,
                strategy,
            } = &mut *link;
            if !controller.is_open() {
                return Err(CardError::NotConnected);
            }
            if let Err(err) = strategy.read_chunk(controller, chunk, sector).await {
                debug!("drv={} read failed at {}: {:?}", self.index.number(), sector, err);
                return Err(err);
            }
            drop(link);
            sector = advance(sector, chunk.len());
        }
        Ok(())
    }

    /// Read straight into a cache-line aligned buffer as one transaction
    /// of at most 65 535 blocks.
    pub async fn read_aligned_blocks(
        &self,
        buffer: &mut [u8],
        sector: u32,
    ) -> Result<(), CardError> {
        let blocks = whole_blocks(buffer.len())?;
        if blocks == 0 {
            return Ok(());
        }
        if blocks > MAX_ALIGNED_BLOCKS {
            return Err(CardError::TooManyBlocks);
        }
        if !is_cache_aligned(buffer.as_ptr() as usize) {
            return Err(CardError::Misaligned);
        }
        if !self.is_connected() {
            return Err(CardError::NotConnected);
        }

        self.led.on();
        let result = {
            let mut link = self.link.lock().await;
            let Link {
                controller,
                strategy,
            } = &mut *link;
            if controller.is_open() {
                strategy.read_aligned(controller, buffer, sector).await
            } else {
                Err(CardError::NotConnected)
            }
        };
        self.led.off();
        result
    }

    /// Write `buffer.len() / 512` blocks starting at `sector`.
    ///
    /// Multi-block chunks get up to `write_attempts` attempts, the
    /// controller being closed and reopened after each failure.
    pub async fn write_blocks(&self, buffer: &[u8], sector: u32) -> Result<(), CardError> {
        if whole_blocks(buffer.len())? == 0 {
            return Ok(());
        }
        if !self.is_connected() {
            return Err(CardError::NotConnected);
        }

        self.led.on();
        let result = self.write_chunks(buffer, sector).await;
        self.led.off();
        result
    }

    async fn write_chunks(&self, buffer: &[u8], mut sector: u32) -> Result<(), CardError> {
        let chunk_bytes = self.chunk_blocks.saturating_mul(BLOCK_SIZE);
        for (n, chunk) in buffer.chunks(chunk_bytes).enumerate() {
            if n > 0 {
                yield_now().await;
            }
            self.write_chunk(chunk, sector).await?;
            sector = advance(sector, chunk.len());
        }
        Ok(())
    }

    async fn write_chunk(&self, chunk: &[u8], sector: u32) -> Result<(), CardError> {
        let mut link = self.link.lock().await;
        let Link {
            controller,
            strategy,
        } = &mut *link;
        if !controller.is_open() {
            return Err(CardError::NotConnected);
        }

        let retried = chunk.len() > BLOCK_SIZE || self.config.retry_single_block_writes;
        if !retried {
            return strategy.write_chunk(controller, chunk, sector).await;
        }

        for attempt in 1..=self.config.write_attempts.max(1) {
            match strategy.write_chunk(controller, chunk, sector).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        "drv={} write at {} failed (attempt {}): {:?}",
                        self.index.number(),
                        sector,
                        attempt,
                        err
                    );
                }
            }
            controller.close();
            if controller.open().await.is_err() {
                warn!("drv={} reopen after failed write failed", self.index.number());
            }
        }
        error!("drv={} write at {} gave up", self.index.number(), sector);
        Err(CardError::RetriesExhausted)
    }
}

/// Blocks in a buffer of `len` bytes.
fn whole_blocks(len: usize) -> Result<usize, CardError> {
    if len % BLOCK_SIZE == 0 {
        Ok(len / BLOCK_SIZE)
    } else {
        Err(CardError::InvalidLength)
    }
}

fn advance(sector: u32, bytes: usize) -> u32 {
    let blocks = u32::try_from(bytes / BLOCK_SIZE).unwrap_or(u32::MAX);
    sector.wrapping_add(blocks)
}

/// [`BlockDevice`] handle onto one [`Drive`].
pub struct DriveDisk<'d, 'a, H, T, V, L> {
    drive: &'d Drive<'a, H, T, V, L>,
}

impl<H, T, V, L> BlockDevice for DriveDisk<'_, '_, H, T, V, L>
where
    H: MmcHost,
    T: BlockTransfer,
    V: Volume,
    L: OutputPin,
{
    type Error = CardError;

    async fn read_blocks(&self, buffer: &mut [u8], sector: u32) -> Result<(), Self::Error> {
        self.drive.read_blocks(buffer, sector).await
    }

    async fn write_blocks(&self, buffer: &[u8], sector: u32) -> Result<(), Self::Error> {
        self.drive.write_blocks(buffer, sector).await
    }

    fn block_count(&self) -> u32 {
        self.drive.size_in_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_index_accepts_only_two_slots() {
        assert_eq!(DriveIndex::try_from(0), Ok(DriveIndex::Rear));
        assert_eq!(DriveIndex::try_from(1), Ok(DriveIndex::Front));
        assert_eq!(DriveIndex::try_from(2), Err(CardError::InvalidDrive));
        assert_eq!(DriveIndex::try_from(u32::MAX), Err(CardError::InvalidDrive));
    }

    #[test]
    fn drives_map_to_their_host_and_path() {
        assert_eq!(DriveIndex::Rear.identity(), MMCHS0);
        assert_eq!(DriveIndex::Front.identity(), MMCHS1);
        assert_eq!(DriveIndex::Rear.mount_path(), "0:");
        assert_eq!(DriveIndex::Front.mount_path(), "1:");
    }

    #[test]
    fn interrupt_lines_route_to_their_slot() {
        assert_eq!(DriveIndex::from_interrupt(MMCHS0.interrupt), Some(DriveIndex::Rear));
        assert_eq!(DriveIndex::from_interrupt(MMCHS1.interrupt), Some(DriveIndex::Front));
        assert_eq!(DriveIndex::from_interrupt(0), None);
    }

    #[test]
    fn buffer_length_must_be_whole_blocks() {
        assert_eq!(whole_blocks(0), Ok(0));
        assert_eq!(whole_blocks(1024), Ok(2));
        assert_eq!(whole_blocks(513), Err(CardError::InvalidLength));
    }
}
