//! Block transfer strategies.
//!
//! A [`BlockTransfer`] moves one chunk of whole blocks between a caller
//! buffer and the card. The façade splits requests into chunks of at most
//! [`BlockTransfer::chunk_blocks`] and holds the drive mutex for exactly one
//! chunk at a time.
//!
//! - [`Pio`]: every byte goes through the FIFO. Used where no DMA channel is
//!   wired up and by host-side tests.
//! - [`Dma`]: single blocks still go through the FIFO; multi-block chunks
//!   are staged through a cache-line aligned scratch buffer and moved by
//!   EDMA, bracketed by cache maintenance:
//!
//! ```text
//! read : CMD23? ─▶ arm DMA ─▶ CMD18 ─▶ DMA done ─▶ invalidate scratch ─▶ copy out
//! write: copy in ─▶ flush scratch ─▶ CMD23? ─▶ arm DMA ─▶ CMD25 ─▶ DMA done
//! ```

use embassy_time::with_timeout;
use platform::dma::{CacheMaintenance, DmaChannel, DmaTransfer};
use platform::dma_safety::{cache_aligned_len, CacheAligned, SD_SCRATCH_BYTES};
use platform::mmc::{DataDirection, MmcHost};
use platform::storage::BLOCK_SIZE;

use crate::controller::CardController;
use crate::error::CardError;
use crate::protocol::{cmd, Transaction};

const BLOCK_LENGTH: u32 = BLOCK_SIZE as u32;

/// Moves whole-block chunks between memory and the card.
pub trait BlockTransfer {
    /// Largest chunk, in blocks, handled by one call.
    fn chunk_blocks(&self) -> usize;

    /// Read `buffer.len() / 512` blocks starting at `sector`.
    async fn read_chunk<H: MmcHost>(
        &mut self,
        controller: &mut CardController<'_, H>,
        buffer: &mut [u8],
        sector: u32,
    ) -> Result<(), CardError>;

    /// Write `buffer.len() / 512` blocks starting at `sector`.
    async fn write_chunk<H: MmcHost>(
        &mut self,
        controller: &mut CardController<'_, H>,
        buffer: &[u8],
        sector: u32,
    ) -> Result<(), CardError>;

    /// Read straight into a cache-line aligned caller buffer, with no chunk
    /// limit beyond what one command can carry.
    async fn read_aligned<H: MmcHost>(
        &mut self,
        controller: &mut CardController<'_, H>,
        buffer: &mut [u8],
        sector: u32,
    ) -> Result<(), CardError>;
}

/// FIFO-only transfers, `BLOCKS` blocks per chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pio<const BLOCKS: usize>;

impl<const BLOCKS: usize> BlockTransfer for Pio<BLOCKS> {
    fn chunk_blocks(&self) -> usize {
        BLOCKS.max(1)
    }

    async fn read_chunk<H: MmcHost>(
        &mut self,
        controller: &mut CardController<'_, H>,
        buffer: &mut [u8],
        sector: u32,
    ) -> Result<(), CardError> {
        controller.read_pio(buffer, sector).await
    }

    async fn write_chunk<H: MmcHost>(
        &mut self,
        controller: &mut CardController<'_, H>,
        buffer: &[u8],
        sector: u32,
    ) -> Result<(), CardError> {
        controller.write_pio(buffer, sector).await
    }

    async fn read_aligned<H: MmcHost>(
        &mut self,
        controller: &mut CardController<'_, H>,
        buffer: &mut [u8],
        sector: u32,
    ) -> Result<(), CardError> {
        controller.read_pio(buffer, sector).await
    }
}

/// EDMA transfers through a `BYTES`-sized scratch buffer.
///
/// `BYTES` defaults to [`SD_SCRATCH_BYTES`]; the scratch then lives in a
/// static in cached DDR.
pub struct Dma<'s, C, K, const BYTES: usize = SD_SCRATCH_BYTES> {
    channel: C,
    cache: K,
    scratch: &'s mut CacheAligned<[u8; BYTES]>,
}

impl<'s, C, K, const BYTES: usize> Dma<'s, C, K, BYTES>
where
    C: DmaChannel,
    K: CacheMaintenance,
{
    /// Bind a DMA channel, the cache and a scratch buffer to one drive.
    pub fn new(channel: C, cache: K, scratch: &'s mut CacheAligned<[u8; BYTES]>) -> Self {
        Self {
            channel,
            cache,
            scratch,
        }
    }

    /// Run one DMA-backed command. The channel is armed before the command
    /// goes out and stopped before this returns, whatever the outcome.
    async fn dma_command<H: MmcHost>(
        controller: &mut CardController<'_, H>,
        channel: &mut C,
        memory: &mut [u8],
        direction: DataDirection,
        command: u8,
        sector: u32,
    ) -> Result<(), CardError> {
        let blocks = memory.len() / BLOCK_SIZE;
        let block_count = u16::try_from(blocks).map_err(|_| CardError::TooManyBlocks)?;
        controller.set_block_count(blocks).await?;
        let address = controller.address_of(sector);
        let timeout = controller.transport().wait_timeout();
        let shared = controller.shared();
        let identity = controller.identity();

        // SAFETY: `memory` is exclusively borrowed for the whole lifetime of
        // `active`, and dropping `active` on any early return stops the
        // channel before the borrow ends.
        let transfer = unsafe { DmaTransfer::new(memory, &mut *channel) };
        let mut active = match direction {
            DataDirection::Read => transfer.start_read(identity.dma_rx_event, BLOCK_LENGTH),
            DataDirection::Write => transfer.start_write(identity.dma_tx_event, BLOCK_LENGTH),
        }
        .map_err(|_| CardError::Dma)?;

        let mut tx = Transaction::dma(command, address, direction, BLOCK_LENGTH, block_count);
        controller.transmit(&mut tx).await?;

        let outcome = with_timeout(timeout, active.wait()).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CardError::Dma),
            Err(_) => {
                shared.record_wait_timeout();
                warn!("DMA completion timed out after {} bytes", active.transfer_count());
                Err(CardError::DmaTimeout)
            }
        }
    }
}

impl<C, K, const BYTES: usize> BlockTransfer for Dma<'_, C, K, BYTES>
where
    C: DmaChannel,
    K: CacheMaintenance,
{
    fn chunk_blocks(&self) -> usize {
        (BYTES / BLOCK_SIZE).max(1)
    }

    async fn read_chunk<H: MmcHost>(
        &mut self,
        controller: &mut CardController<'_, H>,
        buffer: &mut [u8],
        sector: u32,
    ) -> Result<(), CardError> {
        if buffer.len() <= BLOCK_SIZE {
            return controller.read_pio(buffer, sector).await;
        }
        let len = buffer.len();
        let scratch = self.scratch.0.get_mut(..len).ok_or(CardError::TooManyBlocks)?;
        Self::dma_command(
            controller,
            &mut self.channel,
            &mut *scratch,
            DataDirection::Read,
            cmd::READ_MULTIPLE_BLOCK,
            sector,
        )
        .await?;
        self.cache
            .invalidate(scratch.as_ptr() as usize, cache_aligned_len(len))
            .map_err(|_| CardError::Cache)?;
        buffer.copy_from_slice(scratch);
        Ok(())
    }

    async fn write_chunk<H: MmcHost>(
        &mut self,
        controller: &mut CardController<'_, H>,
        buffer: &[u8],
        sector: u32,
    ) -> Result<(), CardError> {
        if buffer.len() <= BLOCK_SIZE {
            return controller.write_pio(buffer, sector).await;
        }
        let len = buffer.len();
        let scratch = self.scratch.0.get_mut(..len).ok_or(CardError::TooManyBlocks)?;
        scratch.copy_from_slice(buffer);
        self.cache
            .flush(scratch.as_ptr() as usize, cache_aligned_len(len))
            .map_err(|_| CardError::Cache)?;
        Self::dma_command(
            controller,
            &mut self.channel,
            scratch,
            DataDirection::Write,
            cmd::WRITE_MULTIPLE_BLOCK,
            sector,
        )
        .await
    }

    async fn read_aligned<H: MmcHost>(
        &mut self,
        controller: &mut CardController<'_, H>,
        buffer: &mut [u8],
        sector: u32,
    ) -> Result<(), CardError> {
        let command = if buffer.len() > BLOCK_SIZE {
            cmd::READ_MULTIPLE_BLOCK
        } else {
            cmd::READ_SINGLE_BLOCK
        };
        Self::dma_command(
            controller,
            &mut self.channel,
            &mut *buffer,
            DataDirection::Read,
            command,
            sector,
        )
        .await?;
        self.cache
            .invalidate(buffer.as_ptr() as usize, cache_aligned_len(buffer.len()))
            .map_err(|_| CardError::Cache)
    }
}
