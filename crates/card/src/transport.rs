//! Command/response transport over one MMCHS instance.
//!
//! The interrupt handler for an MMCHS line calls
//! [`ControllerShared::on_interrupt`], which acknowledges SD_STAT so the
//! line drops, parks the bits it took and wakes the task. All status
//! decoding runs in task context inside [`Transport::transmit`]: each poll
//! merges the parked bits with whatever SD_STAT still holds, pumps the
//! FIFO on buffer-ready events and records completions in a [`Pending`]
//! block that is reset on every exit.
//!
//! ```text
//! transmit ─▶ program host ─▶ send_command ─┬─▶ wait: CC | CTO ──▶ wait: TC | DTO ─▶ response
//!                                           │        (ISR wakes)        (data only)
//!                                           └── with_timeout(wait_timeout) around each wait
//! ```

use core::cell::Cell;
use core::future::poll_fn;
use core::sync::atomic::{AtomicU32, Ordering};
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::waitqueue::AtomicWaker;
use embassy_time::{with_timeout, Duration};
use platform::mmc::{IrqStatus, MmcHost, MmcIrq};

use crate::config::DATA_TIMEOUT_EXPONENT;
use crate::error::TransportError;
use crate::protocol::{CardInfo, DataStage, Transaction};

/// Per-drive state shared between the interrupt handler, the controller
/// and lock-free queries.
///
/// Lives outside the drive mutex so presence and info queries never wait
/// behind a transfer.
pub struct ControllerShared {
    waker: AtomicWaker,
    status: BlockingMutex<CriticalSectionRawMutex, Cell<IrqStatus>>,
    wait_timeouts: AtomicU32,
    info: BlockingMutex<CriticalSectionRawMutex, Cell<Option<CardInfo>>>,
}

impl ControllerShared {
    /// Create the shared block (usable in a `static`).
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            status: BlockingMutex::new(Cell::new(IrqStatus::empty())),
            wait_timeouts: AtomicU32::new(0),
            info: BlockingMutex::new(Cell::new(None)),
        }
    }

    /// Interrupt handler body for this drive's MMCHS line.
    ///
    /// `irq` must address the same MMCHS instance as the drive's host.
    pub fn on_interrupt<I: MmcIrq>(&self, irq: &mut I) {
        self.status.lock(|parked| parked.set(parked.get() | irq.take_status()));
        self.waker.wake();
    }

    /// Status parked by the handler plus anything still in SD_STAT, both
    /// acknowledged. Runs in a critical section so no bit is seen twice.
    fn take_status<H: MmcHost>(&self, host: &mut H) -> IrqStatus {
        self.status.lock(|parked| {
            let polled = host.interrupt_status();
            host.clear_interrupts(polled);
            parked.replace(IrqStatus::empty()) | polled
        })
    }

    fn discard_status(&self) {
        self.status.lock(|parked| parked.set(IrqStatus::empty()));
    }

    /// Number of waits that hit the timeout since boot.
    pub fn wait_timeouts(&self) -> u32 {
        self.wait_timeouts.load(Ordering::Relaxed)
    }

    /// Card info of the currently open controller, if any.
    pub fn info(&self) -> Option<CardInfo> {
        self.info.lock(Cell::get)
    }

    pub(crate) fn publish(&self, info: Option<CardInfo>) {
        self.info.lock(|cell| cell.set(info));
    }

    pub(crate) fn record_wait_timeout(&self) {
        self.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ControllerShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Completion state of the transaction in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Pending {
    command_complete: bool,
    command_failed: bool,
    transfer_complete: bool,
    transfer_failed: bool,
    /// Bytes moved through the FIFO so far.
    cursor: usize,
}

const COMMAND_ERRORS: IrqStatus = IrqStatus::COMMAND_TIMEOUT
    .union(IrqStatus::COMMAND_CRC)
    .union(IrqStatus::COMMAND_END_BIT)
    .union(IrqStatus::COMMAND_INDEX);

const DATA_ERRORS: IrqStatus = IrqStatus::DATA_TIMEOUT
    .union(IrqStatus::DATA_CRC)
    .union(IrqStatus::DATA_END_BIT)
    .union(IrqStatus::AUTO_CMD);

const BUFFER_READY: IrqStatus = IrqStatus::BUFFER_READ_READY.union(IrqStatus::BUFFER_WRITE_READY);

/// Issues one command at a time on a host controller.
pub struct Transport<'a, H> {
    host: H,
    shared: &'a ControllerShared,
    wait_timeout: Duration,
    pending: Pending,
}

impl<'a, H: MmcHost> Transport<'a, H> {
    /// Wrap `host`; waits are bounded by `wait_timeout`.
    pub fn new(host: H, shared: &'a ControllerShared, wait_timeout: Duration) -> Self {
        Self {
            host,
            shared,
            wait_timeout,
            pending: Pending::default(),
        }
    }

    /// Direct register access, for reset and clocking.
    pub fn host(&mut self) -> &mut H {
        &mut self.host
    }

    /// Card-detect line.
    pub fn is_card_inserted(&self) -> bool {
        self.host.is_card_inserted()
    }

    /// The shared block this transport reports into.
    pub fn shared(&self) -> &'a ControllerShared {
        self.shared
    }

    /// Bound applied to every wait.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// True when no completion state is left over from a transaction.
    pub fn is_idle(&self) -> bool {
        self.pending == Pending::default()
    }

    /// Execute `tx` and, on success, capture the response into it.
    pub async fn transmit(&mut self, tx: &mut Transaction<'_>) -> Result<(), TransportError> {
        let result = self.run(tx).await;
        self.pending = Pending::default();
        self.host.clear_interrupts(IrqStatus::ALL);
        self.host.disable_interrupts(BUFFER_READY);
        self.shared.discard_status();
        if let Err(err) = result {
            trace!("CMD{} failed: {:?}", tx.command, err);
        }
        result
    }

    async fn run(&mut self, tx: &mut Transaction<'_>) -> Result<(), TransportError> {
        let frame = tx.frame();
        self.pending = Pending::default();
        self.host.clear_interrupts(IrqStatus::ALL);
        self.shared.discard_status();

        if let Some(stage) = &tx.data {
            let (wanted, unwanted) = match stage {
                DataStage::Read(_) => (IrqStatus::BUFFER_READ_READY, IrqStatus::BUFFER_WRITE_READY),
                DataStage::Write(_) => (IrqStatus::BUFFER_WRITE_READY, IrqStatus::BUFFER_READ_READY),
                DataStage::Dma(_) => (IrqStatus::empty(), BUFFER_READY),
            };
            self.host.disable_interrupts(unwanted);
            self.host.set_block_length(tx.block_size);
            self.host.set_data_timeout(DATA_TIMEOUT_EXPONENT);
            self.host
                .enable_interrupts(wanted | IrqStatus::DATA_PHASE | DATA_ERRORS);
        }
        self.host
            .enable_interrupts(IrqStatus::COMMAND_PHASE | COMMAND_ERRORS);
        self.host.send_command(&frame);

        let finished = self
            .wait(tx, |p| p.command_complete || p.command_failed)
            .await;
        if !finished || self.pending.command_failed {
            return Err(TransportError::CommandExecution);
        }

        if tx.data.is_some() {
            let finished = self
                .wait(tx, |p| p.transfer_complete || p.transfer_failed)
                .await;
            if !finished || self.pending.transfer_failed {
                return Err(TransportError::DataTransferTimeout);
            }
        }

        tx.response = self.host.response();
        Ok(())
    }

    /// Wait until `done` holds; false when the wait timed out.
    async fn wait(&mut self, tx: &mut Transaction<'_>, done: fn(&Pending) -> bool) -> bool {
        let shared = self.shared;
        let timeout = self.wait_timeout;
        let pending = poll_fn(|cx| {
            shared.waker.register(cx.waker());
            self.service(tx);
            if done(&self.pending) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        });
        match with_timeout(timeout, pending).await {
            Ok(()) => true,
            Err(_) => {
                shared.record_wait_timeout();
                warn!("wait timed out after {} ms", timeout.as_millis());
                false
            }
        }
    }

    /// Decode every status bit delivered so far.
    fn service(&mut self, tx: &mut Transaction<'_>) {
        loop {
            let status = self.shared.take_status(&mut self.host);
            if status.is_empty() {
                break;
            }

            if status.contains(IrqStatus::COMMAND_COMPLETE) {
                self.pending.command_complete = true;
            }
            if status.intersects(COMMAND_ERRORS) {
                self.pending.command_failed = true;
            }
            if status.intersects(DATA_ERRORS) {
                self.pending.transfer_failed = true;
            }
            if status.contains(IrqStatus::BUFFER_READ_READY) {
                self.pump_read(tx);
            }
            if status.contains(IrqStatus::BUFFER_WRITE_READY) {
                self.pump_write(tx);
            }
            if status.contains(IrqStatus::TRANSFER_COMPLETE) {
                self.pending.transfer_complete = true;
            }
        }
    }

    fn block_window(&self, len: usize, block_size: u32) -> (usize, usize) {
        let start = self.pending.cursor.min(len);
        let end = start.saturating_add(block_size as usize).min(len);
        (start, end)
    }

    fn pump_read(&mut self, tx: &mut Transaction<'_>) {
        let block_size = tx.block_size;
        if let Some(DataStage::Read(buffer)) = tx.data.as_mut() {
            let (start, end) = self.block_window(buffer.len(), block_size);
            if let Some(block) = buffer.get_mut(start..end) {
                self.host.read_fifo(block);
            }
            self.pending.cursor = end;
        }
    }

    fn pump_write(&mut self, tx: &mut Transaction<'_>) {
        let block_size = tx.block_size;
        if let Some(DataStage::Write(buffer)) = tx.data.as_ref() {
            let (start, end) = self.block_window(buffer.len(), block_size);
            if let Some(block) = buffer.get(start..end) {
                self.host.write_fifo(block);
            }
            self.pending.cursor = end;
        }
    }
}
