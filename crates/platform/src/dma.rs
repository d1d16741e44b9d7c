//! EDMA3 channel seam for MMCHS block transfers
//!
//! Provides type-checked EDMA transfers with ownership semantics, plus the
//! cache-maintenance contract that has to bracket every transfer on the
//! Cortex-A8: the DMA engine reads and writes DDR directly and never sees
//! what is sitting in L1/L2.
//!
//! | Direction              | Before start          | After completion        |
//! |------------------------|-----------------------|-------------------------|
//! | memory → peripheral    | flush buffer range    | —                       |
//! | peripheral → memory    | —                     | invalidate buffer range |

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaDirection {
    /// FIFO into memory (card reads).
    PeripheralToMemory,
    /// Memory into FIFO (card writes).
    MemoryToPeripheral,
}

/// Parameters for one channel programming (one PaRAM set on EDMA3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DmaRequest {
    /// Direction of the transfer.
    pub direction: DmaDirection,
    /// EDMA3 event number of the MMCHS request line pacing the transfer.
    pub event: u32,
    /// Memory-side start address.
    pub address: usize,
    /// Bytes moved per peripheral request (one SD block).
    pub block_size: u32,
    /// Number of peripheral requests.
    pub block_count: u32,
}

impl DmaRequest {
    /// Total bytes covered by the request.
    pub fn len(&self) -> usize {
        let bytes = u64::from(self.block_size).saturating_mul(u64::from(self.block_count));
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }

    /// True when the request moves nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One EDMA3 channel wired to an MMCHS FIFO request line.
pub trait DmaChannel {
    /// Error type
    type Error: core::fmt::Debug;

    /// Program the channel for `request` without triggering it.
    fn configure(&mut self, request: &DmaRequest) -> Result<(), Self::Error>;

    /// Enable the channel so peripheral events start moving data.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Disable the channel and clear any pending event.
    fn stop(&mut self) -> Result<(), Self::Error>;

    /// True once the programmed byte count has moved.
    fn is_complete(&self) -> bool;

    /// Bytes moved so far.
    fn transfer_count(&self) -> usize;
}

impl<C: DmaChannel> DmaChannel for &mut C {
    type Error = C::Error;

    fn configure(&mut self, request: &DmaRequest) -> Result<(), Self::Error> {
        C::configure(self, request)
    }

    fn start(&mut self) -> Result<(), Self::Error> {
        C::start(self)
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        C::stop(self)
    }

    fn is_complete(&self) -> bool {
        C::is_complete(self)
    }

    fn transfer_count(&self) -> usize {
        C::transfer_count(self)
    }
}

/// Data-cache maintenance over an address range.
///
/// Ranges passed in by the card stack always start on a cache line and
/// cover whole lines.
pub trait CacheMaintenance {
    /// Error type
    type Error: core::fmt::Debug;

    /// Write dirty lines in the range back to memory.
    fn flush(&mut self, address: usize, len: usize) -> Result<(), Self::Error>;

    /// Discard cached lines in the range so the next read hits memory.
    fn invalidate(&mut self, address: usize, len: usize) -> Result<(), Self::Error>;
}

impl<K: CacheMaintenance> CacheMaintenance for &mut K {
    type Error = K::Error;

    fn flush(&mut self, address: usize, len: usize) -> Result<(), Self::Error> {
        K::flush(self, address, len)
    }

    fn invalidate(&mut self, address: usize, len: usize) -> Result<(), Self::Error> {
        K::invalidate(self, address, len)
    }
}

/// A programmed-but-not-started transfer holding its buffer and channel.
pub struct DmaTransfer<B, C> {
    buffer: B,
    channel: C,
}

impl<B, C> DmaTransfer<B, C>
where
    B: DmaBuffer,
    C: DmaChannel,
{
    /// Pair `buffer` with `channel`.
    ///
    /// # Safety
    ///
    /// Buffer must remain valid for the duration of the transfer.
    /// No other references to the buffer may exist, and the returned value
    /// must not be leaked with `mem::forget` once started.
    pub unsafe fn new(buffer: B, channel: C) -> Self {
        Self { buffer, channel }
    }

    /// Arm the channel to drain the peripheral FIFO into the buffer, one
    /// `block_size` burst per `event`.
    pub fn start_read(
        mut self,
        event: u32,
        block_size: u32,
    ) -> Result<DmaTransferActive<B, C>, C::Error>
    where
        B: DmaBufferMut,
    {
        let address = self.buffer.as_mut_ptr() as usize;
        self.start(DmaDirection::PeripheralToMemory, event, address, block_size)
    }

    /// Arm the channel to feed the buffer into the peripheral FIFO, one
    /// `block_size` burst per `event`.
    pub fn start_write(
        self,
        event: u32,
        block_size: u32,
    ) -> Result<DmaTransferActive<B, C>, C::Error> {
        let address = self.buffer.as_ptr() as usize;
        self.start(DmaDirection::MemoryToPeripheral, event, address, block_size)
    }

    fn start(
        mut self,
        direction: DmaDirection,
        event: u32,
        address: usize,
        block_size: u32,
    ) -> Result<DmaTransferActive<B, C>, C::Error> {
        let blocks = self
            .buffer
            .len()
            .checked_div(block_size as usize)
            .unwrap_or(0);
        let request = DmaRequest {
            direction,
            event,
            address,
            block_size,
            block_count: u32::try_from(blocks).unwrap_or(u32::MAX),
        };
        self.channel.configure(&request)?;
        self.channel.start()?;
        Ok(DmaTransferActive {
            _buffer: self.buffer,
            channel: self.channel,
            finished: false,
        })
    }
}

/// A transfer the channel is currently servicing.
///
/// Dropping an unfinished transfer stops the channel, so a cancelled
/// [`wait`](Self::wait) never leaves the engine writing into a buffer whose
/// borrow has ended.
pub struct DmaTransferActive<B, C: DmaChannel> {
    // Held until the engine is done with it.
    _buffer: B,
    channel: C,
    finished: bool,
}

impl<B, C> DmaTransferActive<B, C>
where
    B: DmaBuffer,
    C: DmaChannel,
{
    /// Wait for transfer to complete, yielding to the Embassy executor on each
    /// poll so that other tasks can run while the DMA transfer is in flight.
    pub async fn wait(&mut self) -> Result<(), C::Error> {
        while !self.channel.is_complete() {
            embassy_futures::yield_now().await;
        }
        self.finished = true;
        self.channel.stop()
    }

    /// Poll completion once.
    pub fn is_complete(&self) -> bool {
        self.channel.is_complete()
    }

    /// Bytes moved so far.
    pub fn transfer_count(&self) -> usize {
        self.channel.transfer_count()
    }
}

impl<B, C: DmaChannel> Drop for DmaTransferActive<B, C> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.channel.stop();
        }
    }
}

/// Memory the engine may read from.
pub trait DmaBuffer {
    /// Start address.
    fn as_ptr(&self) -> *const u8;

    /// Length in bytes.
    fn len(&self) -> usize;

    /// Check if buffer is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// DMA buffer trait (read-write access)
pub trait DmaBufferMut: DmaBuffer {
    /// Get mutable buffer pointer
    fn as_mut_ptr(&mut self) -> *mut u8;
}

impl DmaBuffer for &[u8] {
    fn as_ptr(&self) -> *const u8 {
        (*self).as_ptr()
    }

    fn len(&self) -> usize {
        (*self).len()
    }
}

impl DmaBuffer for &mut [u8] {
    fn as_ptr(&self) -> *const u8 {
        (**self).as_ptr()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

impl DmaBufferMut for &mut [u8] {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        (**self).as_mut_ptr()
    }
}
