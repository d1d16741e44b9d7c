//! Mock implementations for testing
//!
//! The centrepiece is [`SimCard`]: a simulated SD card plus the MMCHS
//! register state in front of it. [`MockHost`], [`MockDma`] and
//! [`MockCache`] are thin handles onto the same shared simulation, so a
//! test can drive the card stack through all three seams and then inspect
//! one ordered [`SimEvent`] log.
//!
//! ## Fault injection
//!
//! | Knob                              | Effect                                   |
//! |-----------------------------------|------------------------------------------|
//! | [`SimCard::remove`]               | every command times out                  |
//! | [`SimCard::fail_command`]         | Nth occurrence of a command times out    |
//! | [`SimCard::hang_command`]         | command never raises any status bit      |
//! | [`SimCard::fail_multi_block_writes`] | CMD25 data phase times out N times    |
//! | [`SimCard::delay_dma_completion`] | DMA reports busy for N polls             |
//! | [`SimCard::interrupt_driven`]     | SD_STAT only readable through [`MockIrq`] |

#![cfg(any(test, feature = "std"))]
// Simulation bookkeeping: indices and offsets are bounds-checked against
// the backing store before use.
#![allow(clippy::arithmetic_side_effects)]
#![allow(clippy::cast_possible_truncation)]

use crate::dma::{CacheMaintenance, DmaChannel, DmaDirection, DmaRequest};
use crate::dma_safety::is_cache_aligned;
use crate::mmc::{BusVoltage, BusWidth, CommandFrame, DataDirection, IrqStatus, MmcHost, MmcIrq};
use crate::storage::{BlockDevice, Volume, BLOCK_SIZE};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::vec::Vec;

/// OCR busy bit (power-up complete).
const OCR_READY: u32 = 1 << 31;
/// OCR card capacity status.
const OCR_CCS: u32 = 1 << 30;
/// OCR voltage window 2.7–3.6 V.
const OCR_VOLTAGE_WINDOW: u32 = 0x00FF_8000;
/// R1 with CURRENT_STATE = tran and READY_FOR_DATA.
const R1_TRANSFER_STATE: u32 = (4 << 9) | (1 << 8);
/// R1 APP_CMD bit.
const R1_APP_CMD: u32 = 1 << 5;

const LOG_CAPACITY: usize = 1024;

// ── Card profiles ────────────────────────────────────────────────────────────

/// Static description of the simulated card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardProfile {
    /// Reports OCR.CCS (block addressing).
    pub high_capacity: bool,
    /// Raw CSD words as captured from the response registers.
    pub csd: [u32; 4],
    /// Raw CID words.
    pub cid: [u32; 4],
    /// SCR as sent on the data lines (big-endian).
    pub scr: [u8; 8],
    /// Accepts the CMD6 switch to high-speed (50 MHz).
    pub high_speed: bool,
    /// Number of ACMD41 polls answered with the busy bit clear.
    pub busy_polls: u32,
    /// RCA published by CMD3.
    pub rca: u16,
}

impl CardProfile {
    /// SDHC card (CSD structure 1) with device size field `c_size`.
    ///
    /// Capacity is `(c_size + 1) * 512 KiB`.
    pub fn sdhc(c_size: u32) -> Self {
        Self {
            high_capacity: true,
            csd: [
                0,
                (c_size & 0xFFFF) << 16,
                (9 << 16) | ((c_size >> 16) & 0x3F),
                (1 << 30) | 0x32,
            ],
            cid: [0x1234_5678, 0x9ABC_DEF0, 0x5341_4D50, 0x0353_4432],
            scr: scr_bytes(2, true, false, true),
            high_speed: true,
            busy_polls: 3,
            rca: 0xAAAA,
        }
    }

    /// SDSC card (CSD structure 0).
    ///
    /// Capacity is `(c_size + 1) * 2^(c_size_mult + 2) * 2^read_bl_len` bytes.
    pub fn sdsc(c_size: u32, c_size_mult: u32, read_bl_len: u32) -> Self {
        Self {
            high_capacity: false,
            csd: [
                0,
                ((c_size & 0x3) << 30) | ((c_size_mult & 0x7) << 15),
                ((read_bl_len & 0xF) << 16) | ((c_size >> 2) & 0x3FF),
                0x32,
            ],
            cid: [0x0BAD_F00D, 0x0000_0001, 0x5344_5343, 0x0253_4431],
            scr: scr_bytes(1, false, false, false),
            high_speed: false,
            busy_polls: 1,
            rca: 0x1234,
        }
    }

    /// Same profile with a different SCR.
    pub fn with_scr(mut self, scr: [u8; 8]) -> Self {
        self.scr = scr;
        self
    }
}

/// Build an SCR with the given SD_SPEC, SD_SPEC3, SD_SPEC4 and CMD23 support.
///
/// Bus widths advertise 1-bit and 4-bit.
pub fn scr_bytes(sd_spec: u32, spec3: bool, spec4: bool, cmd23: bool) -> [u8; 8] {
    let word = ((sd_spec & 0xF) << 24)
        | (0x5 << 16)
        | (u32::from(spec3) << 15)
        | (u32::from(spec4) << 10)
        | (u32::from(cmd23) << 1);
    let mut scr = [0u8; 8];
    for (dst, src) in scr.iter_mut().zip(word.to_be_bytes()) {
        *dst = src;
    }
    scr
}

// ── Event log ────────────────────────────────────────────────────────────────

/// Something the card stack did to the simulated hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// SD_CMD written.
    Command {
        /// Command index.
        index: u8,
        /// Argument.
        argument: u32,
        /// Preceded by CMD55.
        app: bool,
    },
    /// DMA channel enabled.
    DmaStart {
        /// Transfer direction.
        direction: DmaDirection,
        /// Memory address.
        address: usize,
        /// Bytes.
        len: usize,
    },
    /// Cache flush.
    Flush {
        /// Start address.
        address: usize,
        /// Bytes.
        len: usize,
    },
    /// Cache invalidate.
    Invalidate {
        /// Start address.
        address: usize,
        /// Bytes.
        len: usize,
    },
}

// ── Shared simulation state ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Faults {
    fail: Option<(u8, u32)>,
    hang: Option<u8>,
    failing_multi_writes: u32,
    dma_delay_polls: u32,
}

#[derive(Debug, Default)]
struct DmaState {
    request: Option<DmaRequest>,
    armed: bool,
    complete: bool,
    moved: usize,
}

#[derive(Debug)]
struct HostRegisters {
    status: IrqStatus,
    enabled: IrqStatus,
    block_length: u32,
    bus_width: BusWidth,
    bus_voltage: Option<BusVoltage>,
    clock_hz: u32,
    powered: bool,
    data_timeout_exponent: u32,
    response: [u32; 4],
    rx: Vec<u8>,
    rx_position: usize,
    tx: Vec<u8>,
    tx_expected: usize,
    tx_sector: u32,
}

impl Default for HostRegisters {
    fn default() -> Self {
        Self {
            status: IrqStatus::empty(),
            enabled: IrqStatus::empty(),
            block_length: 0,
            bus_width: BusWidth::One,
            bus_voltage: None,
            clock_hz: 0,
            powered: false,
            data_timeout_exponent: 0,
            response: [0; 4],
            rx: Vec::new(),
            rx_position: 0,
            tx: Vec::new(),
            tx_expected: 0,
            tx_sector: 0,
        }
    }
}

enum DataStage {
    None,
    Read(Vec<u8>),
    Write { sector: u32, len: usize },
    Fail,
}

struct SimState {
    profile: CardProfile,
    blocks: BTreeMap<u32, [u8; BLOCK_SIZE]>,
    inserted: bool,
    irq_only: bool,
    app_command: bool,
    busy_polls_left: u32,
    preset_block_count: Option<u32>,
    host: HostRegisters,
    dma: DmaState,
    faults: Faults,
    occurrences: BTreeMap<u8, u32>,
    log: heapless::Deque<SimEvent, LOG_CAPACITY>,
}

impl SimState {
    fn record(&mut self, event: SimEvent) {
        if self.log.is_full() {
            let _ = self.log.pop_front();
        }
        let _ = self.log.push_back(event);
    }

    fn capacity_blocks(&self) -> u64 {
        let csd = self.profile.csd;
        if (csd[3] >> 30) & 0x3 == 1 {
            let c_size = u64::from(((csd[2] & 0x3F) << 16) | (csd[1] >> 16));
            (c_size + 1) * 1024
        } else {
            let c_size = u64::from(((csd[2] & 0x3FF) << 2) | (csd[1] >> 30));
            let mult = u64::from((csd[1] >> 15) & 0x7);
            let read_bl_len = u64::from((csd[2] >> 16) & 0xF);
            ((c_size + 1) << (mult + 2)) << read_bl_len >> 9
        }
    }

    fn sector_for(&self, argument: u32) -> Option<u32> {
        if self.profile.high_capacity {
            Some(argument)
        } else if argument % BLOCK_SIZE as u32 == 0 {
            Some(argument / BLOCK_SIZE as u32)
        } else {
            None
        }
    }

    fn data_len(frame: &CommandFrame, block_length: u32) -> usize {
        frame
            .data
            .map_or(0, |d| usize::from(d.block_count) * block_length as usize)
    }

    fn read_storage(&self, sector: u32, len: usize) -> Option<Vec<u8>> {
        let blocks = len / BLOCK_SIZE;
        if u64::from(sector) + blocks as u64 > self.capacity_blocks() {
            return None;
        }
        let mut out = Vec::with_capacity(len);
        for offset in 0..blocks as u32 {
            match self.blocks.get(&(sector + offset)) {
                Some(block) => out.extend_from_slice(block),
                None => out.extend_from_slice(&[0u8; BLOCK_SIZE]),
            }
        }
        Some(out)
    }

    fn write_storage(&mut self, sector: u32, data: &[u8]) {
        for (offset, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let mut block = [0u8; BLOCK_SIZE];
            for (dst, src) in block.iter_mut().zip(chunk) {
                *dst = *src;
            }
            self.blocks.insert(sector + offset as u32, block);
        }
    }

    fn fault_matches(&mut self, index: u8) -> bool {
        let seen = self.occurrences.entry(index).or_insert(0);
        let occurrence = *seen;
        *seen += 1;
        matches!(self.faults.fail, Some((i, n)) if i == index && n == occurrence)
    }

    fn execute(&mut self, frame: &CommandFrame) {
        let app = core::mem::take(&mut self.app_command);
        self.record(SimEvent::Command {
            index: frame.index,
            argument: frame.argument,
            app,
        });

        if self.faults.hang == Some(frame.index) {
            return;
        }
        if !self.inserted || self.fault_matches(frame.index) {
            self.host.status |= IrqStatus::ERROR | IrqStatus::COMMAND_TIMEOUT;
            return;
        }

        let len = Self::data_len(frame, self.host.block_length);
        let mut response = [R1_TRANSFER_STATE, 0, 0, 0];
        let stage = match (app, frame.index) {
            (_, 0) => {
                self.busy_polls_left = self.profile.busy_polls;
                self.preset_block_count = None;
                response = [0; 4];
                DataStage::None
            }
            (false, 8) => {
                response[0] = frame.argument & 0xFFF;
                DataStage::None
            }
            (_, 55) => {
                self.app_command = true;
                response[0] = R1_TRANSFER_STATE | R1_APP_CMD;
                DataStage::None
            }
            (true, 41) => {
                if self.busy_polls_left > 0 {
                    self.busy_polls_left -= 1;
                    response[0] = OCR_VOLTAGE_WINDOW;
                } else {
                    let ccs = if self.profile.high_capacity { OCR_CCS } else { 0 };
                    response[0] = OCR_READY | ccs | OCR_VOLTAGE_WINDOW;
                }
                DataStage::None
            }
            (false, 2) => {
                response = self.profile.cid;
                DataStage::None
            }
            (false, 3) => {
                response[0] = u32::from(self.profile.rca) << 16;
                DataStage::None
            }
            (false, 9) => {
                response = self.profile.csd;
                DataStage::None
            }
            (false, 7 | 13 | 16) | (true, 6) => DataStage::None,
            (false, 23) => {
                self.preset_block_count = Some(frame.argument);
                DataStage::None
            }
            (true, 51) => DataStage::Read(self.profile.scr.to_vec()),
            (false, 6) => {
                let mut status = std::vec![0u8; 64];
                if let Some(group1) = status.get_mut(16) {
                    *group1 = u8::from(self.profile.high_speed);
                }
                DataStage::Read(status)
            }
            (false, 17 | 18) => {
                self.preset_block_count = None;
                match self
                    .sector_for(frame.argument)
                    .and_then(|sector| self.read_storage(sector, len))
                {
                    Some(data) => DataStage::Read(data),
                    None => DataStage::Fail,
                }
            }
            (false, 24 | 25) => {
                self.preset_block_count = None;
                let failing = frame.index == 25 && self.faults.failing_multi_writes > 0;
                if failing {
                    self.faults.failing_multi_writes -= 1;
                }
                match self.sector_for(frame.argument) {
                    Some(sector) if !failing => DataStage::Write { sector, len },
                    _ => DataStage::Fail,
                }
            }
            _ => {
                self.host.status |= IrqStatus::ERROR | IrqStatus::COMMAND_TIMEOUT;
                return;
            }
        };

        self.host.response = response;
        self.host.status |= IrqStatus::COMMAND_COMPLETE;

        let dma = frame.data.is_some_and(|d| d.dma);
        match stage {
            DataStage::None => {}
            DataStage::Fail => {
                self.host.status |= IrqStatus::ERROR | IrqStatus::DATA_TIMEOUT;
            }
            DataStage::Read(data) if dma => self.dma_into_memory(&data),
            DataStage::Read(data) => {
                self.host.rx = data;
                self.host.rx_position = 0;
                self.host.status |= IrqStatus::BUFFER_READ_READY;
            }
            DataStage::Write { sector, len } if dma => self.dma_from_memory(sector, len),
            DataStage::Write { sector, len } => {
                self.host.tx.clear();
                self.host.tx_expected = len;
                self.host.tx_sector = sector;
                self.host.status |= IrqStatus::BUFFER_WRITE_READY;
            }
        }
    }

    fn armed_request(&self, direction: DmaDirection, len: usize) -> Option<DmaRequest> {
        self.dma
            .request
            .filter(|r| self.dma.armed && r.direction == direction && r.len() == len)
    }

    fn dma_into_memory(&mut self, data: &[u8]) {
        let Some(request) = self.armed_request(DmaDirection::PeripheralToMemory, data.len())
        else {
            self.host.status |= IrqStatus::ERROR | IrqStatus::DATA_TIMEOUT;
            return;
        };
        // SAFETY: the channel is only armed through `DmaTransfer`, which holds
        // an exclusive borrow of `request.len()` bytes at `request.address`
        // until the channel is stopped.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), request.address as *mut u8, data.len());
        }
        self.dma.moved = data.len();
        self.dma.complete = true;
        self.host.status |= IrqStatus::TRANSFER_COMPLETE;
    }

    fn dma_from_memory(&mut self, sector: u32, len: usize) {
        let Some(request) = self.armed_request(DmaDirection::MemoryToPeripheral, len) else {
            self.host.status |= IrqStatus::ERROR | IrqStatus::DATA_TIMEOUT;
            return;
        };
        let mut data = std::vec![0u8; len];
        // SAFETY: see `dma_into_memory`; the borrow is shared for writes.
        unsafe {
            core::ptr::copy_nonoverlapping(request.address as *const u8, data.as_mut_ptr(), len);
        }
        self.write_storage(sector, &data);
        self.dma.moved = len;
        self.dma.complete = true;
        self.host.status |= IrqStatus::TRANSFER_COMPLETE;
    }
}

// ── SimCard handle ───────────────────────────────────────────────────────────

/// Handle onto one simulated card slot. Cloning shares the simulation.
#[derive(Clone)]
pub struct SimCard {
    state: Arc<Mutex<SimState>>,
}

impl SimCard {
    /// Insert a card described by `profile`.
    pub fn new(profile: CardProfile) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                profile,
                blocks: BTreeMap::new(),
                inserted: true,
                irq_only: false,
                app_command: false,
                busy_polls_left: profile.busy_polls,
                preset_block_count: None,
                host: HostRegisters::default(),
                dma: DmaState::default(),
                faults: Faults::default(),
                occurrences: BTreeMap::new(),
                log: heapless::Deque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Host controller handle.
    pub fn host(&self) -> MockHost {
        MockHost { card: self.clone() }
    }

    /// Interrupt handler handle.
    pub fn irq(&self) -> MockIrq {
        MockIrq { card: self.clone() }
    }

    /// Hide SD_STAT from [`MockHost`] so status only reaches the driver
    /// through [`MockIrq`], as it does once the ISR acknowledges it.
    pub fn interrupt_driven(&self, enabled: bool) {
        self.lock().irq_only = enabled;
    }

    /// DMA channel handle.
    pub fn dma(&self) -> MockDma {
        MockDma { card: self.clone() }
    }

    /// Cache maintenance handle.
    pub fn cache(&self) -> MockCache {
        MockCache { card: self.clone() }
    }

    /// Put the card (back) in the slot.
    pub fn insert(&self) {
        self.lock().inserted = true;
    }

    /// Pull the card out of the slot.
    pub fn remove(&self) {
        self.lock().inserted = false;
    }

    /// Make occurrence `occurrence` (0-based, counted from now) of command
    /// `index` time out.
    pub fn fail_command(&self, index: u8, occurrence: u32) {
        let mut state = self.lock();
        let seen = state.occurrences.get(&index).copied().unwrap_or(0);
        state.faults.fail = Some((index, seen + occurrence));
    }

    /// Make every occurrence of command `index` produce no status at all.
    pub fn hang_command(&self, index: u8) {
        self.lock().faults.hang = Some(index);
    }

    /// Fail the data phase of the next `count` CMD25s.
    pub fn fail_multi_block_writes(&self, count: u32) {
        self.lock().faults.failing_multi_writes = count;
    }

    /// Report the DMA channel busy for `polls` completion checks.
    pub fn delay_dma_completion(&self, polls: u32) {
        self.lock().faults.dma_delay_polls = polls;
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<SimEvent> {
        self.lock().log.iter().copied().collect()
    }

    /// Command indices in issue order.
    pub fn commands(&self) -> Vec<u8> {
        self.lock()
            .log
            .iter()
            .filter_map(|e| match e {
                SimEvent::Command { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// How many times command `index` was issued since the last clear.
    pub fn command_count(&self, index: u8) -> usize {
        self.commands().iter().filter(|&&i| i == index).count()
    }

    /// Forget the event log.
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Contents of one block.
    pub fn block(&self, sector: u32) -> [u8; BLOCK_SIZE] {
        self.lock()
            .blocks
            .get(&sector)
            .copied()
            .unwrap_or([0; BLOCK_SIZE])
    }

    /// Overwrite one block behind the driver's back.
    pub fn set_block(&self, sector: u32, data: [u8; BLOCK_SIZE]) {
        self.lock().blocks.insert(sector, data);
    }

    /// Card clock currently programmed on the host.
    pub fn bus_clock_hz(&self) -> u32 {
        self.lock().host.clock_hz
    }

    /// Bus width currently programmed on the host.
    pub fn bus_width(&self) -> BusWidth {
        self.lock().host.bus_width
    }

    /// Status bits not yet cleared by the driver.
    pub fn pending_status(&self) -> IrqStatus {
        self.lock().host.status
    }

    /// Whether bus power is on.
    pub fn is_powered(&self) -> bool {
        self.lock().host.powered
    }

    /// Bus voltage last selected.
    pub fn bus_voltage(&self) -> Option<BusVoltage> {
        self.lock().host.bus_voltage
    }

    /// Data timeout exponent last programmed.
    pub fn data_timeout_exponent(&self) -> u32 {
        self.lock().host.data_timeout_exponent
    }

    /// Last request programmed into the DMA channel.
    pub fn dma_request(&self) -> Option<DmaRequest> {
        self.lock().dma.request
    }

    /// Interrupt sources currently enabled.
    pub fn enabled_interrupts(&self) -> IrqStatus {
        self.lock().host.enabled
    }
}

// ── Host ─────────────────────────────────────────────────────────────────────

/// Simulated MMCHS instance.
pub struct MockHost {
    card: SimCard,
}

impl MmcHost for MockHost {
    type Error = core::convert::Infallible;

    fn soft_reset(&mut self) -> Result<(), Self::Error> {
        let mut state = self.card.lock();
        state.host = HostRegisters::default();
        state.dma = DmaState::default();
        Ok(())
    }

    fn reset_lines(&mut self) -> Result<(), Self::Error> {
        let mut state = self.card.lock();
        state.host.rx.clear();
        state.host.tx.clear();
        state.host.status = IrqStatus::empty();
        Ok(())
    }

    fn set_supported_voltages(&mut self, _voltages: &[BusVoltage]) {}

    fn set_bus_voltage(&mut self, voltage: BusVoltage) {
        self.card.lock().host.bus_voltage = Some(voltage);
    }

    fn power_on(&mut self) -> Result<(), Self::Error> {
        self.card.lock().host.powered = true;
        Ok(())
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        self.card.lock().host.bus_width = width;
    }

    fn set_bus_frequency(&mut self, input_hz: u32, output_hz: u32) -> Result<(), Self::Error> {
        let divisor = (input_hz / output_hz.max(1)).max(2);
        let divisor = if input_hz / divisor > output_hz {
            divisor + 1
        } else {
            divisor
        };
        self.card.lock().host.clock_hz = input_hz / divisor;
        Ok(())
    }

    fn send_init_stream(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_block_length(&mut self, bytes: u32) {
        self.card.lock().host.block_length = bytes;
    }

    fn set_data_timeout(&mut self, exponent: u32) {
        self.card.lock().host.data_timeout_exponent = exponent;
    }

    fn enable_interrupts(&mut self, mask: IrqStatus) {
        self.card.lock().host.enabled |= mask;
    }

    fn disable_interrupts(&mut self, mask: IrqStatus) {
        self.card.lock().host.enabled &= !mask;
    }

    fn interrupt_status(&self) -> IrqStatus {
        let state = self.card.lock();
        if state.irq_only {
            IrqStatus::empty()
        } else {
            state.host.status
        }
    }

    fn clear_interrupts(&mut self, mask: IrqStatus) {
        self.card.lock().host.status &= !mask;
    }

    fn send_command(&mut self, frame: &CommandFrame) {
        self.card.lock().execute(frame);
    }

    fn response(&self) -> [u32; 4] {
        self.card.lock().host.response
    }

    fn read_fifo(&mut self, buffer: &mut [u8]) {
        let mut state = self.card.lock();
        let start = state.host.rx_position;
        let end = (start + buffer.len()).min(state.host.rx.len());
        if let Some(src) = state.host.rx.get(start..end) {
            for (dst, byte) in buffer.iter_mut().zip(src) {
                *dst = *byte;
            }
        }
        state.host.rx_position = end;
        if end >= state.host.rx.len() {
            state.host.status |= IrqStatus::TRANSFER_COMPLETE;
        } else {
            state.host.status |= IrqStatus::BUFFER_READ_READY;
        }
    }

    fn write_fifo(&mut self, buffer: &[u8]) {
        let mut state = self.card.lock();
        state.host.tx.extend_from_slice(buffer);
        if state.host.tx.len() >= state.host.tx_expected {
            let sector = state.host.tx_sector;
            let data = core::mem::take(&mut state.host.tx);
            state.write_storage(sector, &data);
            state.host.status |= IrqStatus::TRANSFER_COMPLETE;
        } else {
            state.host.status |= IrqStatus::BUFFER_WRITE_READY;
        }
    }

    fn is_card_inserted(&self) -> bool {
        self.card.lock().inserted
    }
}

/// Simulated MMCHS interrupt line: takes whatever SD_STAT holds.
pub struct MockIrq {
    card: SimCard,
}

impl MmcIrq for MockIrq {
    fn take_status(&mut self) -> IrqStatus {
        core::mem::replace(&mut self.card.lock().host.status, IrqStatus::empty())
    }
}

// ── DMA + cache ──────────────────────────────────────────────────────────────

/// Simulated EDMA channel pair bound to the simulated host.
pub struct MockDma {
    card: SimCard,
}

impl DmaChannel for MockDma {
    type Error = core::convert::Infallible;

    fn configure(&mut self, request: &DmaRequest) -> Result<(), Self::Error> {
        let mut state = self.card.lock();
        state.dma = DmaState {
            request: Some(*request),
            ..DmaState::default()
        };
        Ok(())
    }

    fn start(&mut self) -> Result<(), Self::Error> {
        let mut state = self.card.lock();
        state.dma.armed = true;
        if let Some(request) = state.dma.request {
            state.record(SimEvent::DmaStart {
                direction: request.direction,
                address: request.address,
                len: request.len(),
            });
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        self.card.lock().dma.armed = false;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        let mut state = self.card.lock();
        if state.faults.dma_delay_polls > 0 {
            state.faults.dma_delay_polls -= 1;
            return false;
        }
        state.dma.complete
    }

    fn transfer_count(&self) -> usize {
        self.card.lock().dma.moved
    }
}

/// Error from [`MockCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCacheError {
    /// Range does not start on a cache line.
    Misaligned,
}

/// Records cache maintenance and rejects misaligned ranges.
pub struct MockCache {
    card: SimCard,
}

impl CacheMaintenance for MockCache {
    type Error = MockCacheError;

    fn flush(&mut self, address: usize, len: usize) -> Result<(), Self::Error> {
        if !is_cache_aligned(address) {
            return Err(MockCacheError::Misaligned);
        }
        self.card.lock().record(SimEvent::Flush { address, len });
        Ok(())
    }

    fn invalidate(&mut self, address: usize, len: usize) -> Result<(), Self::Error> {
        if !is_cache_aligned(address) {
            return Err(MockCacheError::Misaligned);
        }
        self.card.lock().record(SimEvent::Invalidate { address, len });
        Ok(())
    }
}

// ── LED ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LedState {
    lit: AtomicBool,
    switched_on: AtomicUsize,
}

/// Activity LED that remembers what happened to it. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockLed {
    state: Arc<LedState>,
}

impl MockLed {
    /// Create new mock LED (off)
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently lit.
    pub fn is_on(&self) -> bool {
        self.state.lit.load(Ordering::SeqCst)
    }

    /// Number of off → on transitions.
    pub fn times_switched_on(&self) -> usize {
        self.state.switched_on.load(Ordering::SeqCst)
    }
}

impl embedded_hal::digital::ErrorType for MockLed {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::OutputPin for MockLed {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.state.lit.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        if !self.state.lit.swap(true, Ordering::SeqCst) {
            self.state.switched_on.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ── Volume ───────────────────────────────────────────────────────────────────

/// Boot sector signature checked by [`MockVolume::mount`].
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Error from [`MockVolume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockVolumeError {
    /// Block device failed.
    Io,
    /// Sector 0 carries no boot signature.
    NoFilesystem,
}

/// Minimal filesystem: a boot sector with a signature, nothing else.
#[derive(Debug, Default)]
pub struct MockVolume {
    mounted: bool,
    mounts: usize,
    formats: usize,
}

impl MockVolume {
    /// Create new unmounted volume
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful mounts so far.
    pub fn mount_count(&self) -> usize {
        self.mounts
    }

    /// Successful formats so far.
    pub fn format_count(&self) -> usize {
        self.formats
    }

    /// Sector 0 as written by [`Volume::format`].
    pub fn boot_sector() -> [u8; BLOCK_SIZE] {
        let mut sector = [0u8; BLOCK_SIZE];
        for (dst, src) in sector.iter_mut().zip(b"\xEB\x3C\x90SAMPLER ") {
            *dst = *src;
        }
        if let Some(tail) = sector.get_mut(BLOCK_SIZE - 2..) {
            tail.copy_from_slice(&BOOT_SIGNATURE);
        }
        sector
    }
}

impl Volume for MockVolume {
    type Error = MockVolumeError;

    async fn mount<D: BlockDevice>(&mut self, disk: &D) -> Result<(), Self::Error> {
        let mut sector = [0u8; BLOCK_SIZE];
        disk.read_blocks(&mut sector, 0)
            .await
            .map_err(|_| MockVolumeError::Io)?;
        if sector.get(BLOCK_SIZE - 2..) != Some(&BOOT_SIGNATURE[..]) {
            return Err(MockVolumeError::NoFilesystem);
        }
        self.mounted = true;
        self.mounts += 1;
        Ok(())
    }

    fn unmount(&mut self) {
        self.mounted = false;
    }

    async fn format<D: BlockDevice>(&mut self, disk: &D) -> Result<(), Self::Error> {
        if disk.block_count() == 0 {
            return Err(MockVolumeError::Io);
        }
        disk.write_blocks(&Self::boot_sector(), 0)
            .await
            .map_err(|_| MockVolumeError::Io)?;
        self.formats += 1;
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.mounted
    }
}
