//! AM335x MMCHS register-level host driver.
//!
//! ## Register map (offsets from the MMCHS instance base)
//!
//! | Register  | Offset | Used for                                   |
//! |-----------|--------|--------------------------------------------|
//! | SYSCONFIG | 0x110  | soft reset, idle/wakeup configuration      |
//! | SYSSTATUS | 0x114  | RESETDONE                                  |
//! | CON       | 0x12C  | INIT stream, DW8                           |
//! | BLK       | 0x204  | BLEN, NBLK                                 |
//! | ARG       | 0x208  | command argument                           |
//! | CMD       | 0x20C  | command issue                              |
//! | RSP10..76 | 0x210  | response words                             |
//! | DATA      | 0x220  | FIFO                                       |
//! | PSTATE    | 0x224  | card inserted                              |
//! | HCTL      | 0x228  | DTW, SDBP, SDVS                            |
//! | SYSCTL    | 0x22C  | ICE, ICS, CEN, CLKD, DTO, SRC, SRD         |
//! | STAT      | 0x230  | interrupt status (W1C)                     |
//! | IE        | 0x234  | status enable                              |
//! | ISE       | 0x238  | signal enable                              |
//! | CAPA      | 0x240  | VS18/VS30/VS33                             |
//!
//! Every busy-wait is bounded by [`READY_POLL_LIMIT`] reads and reports
//! [`MmchsError`] instead of spinning forever.

// Register field packing: shifts by constant field offsets.
#![allow(clippy::arithmetic_side_effects)]

use crate::mmc::{BusVoltage, BusWidth, CommandFrame, DataDirection, IrqStatus, MmcHost, MmcIrq};
use thiserror_no_std::Error;

/// Register offsets.
pub mod reg {
    /// System configuration.
    pub const SYSCONFIG: usize = 0x110;
    /// System status.
    pub const SYSSTATUS: usize = 0x114;
    /// Configuration.
    pub const CON: usize = 0x12C;
    /// Transfer length configuration.
    pub const BLK: usize = 0x204;
    /// Command argument.
    pub const ARG: usize = 0x208;
    /// Command and transfer mode.
    pub const CMD: usize = 0x20C;
    /// Response bits 39:8 (or 31:0 of a long response).
    pub const RSP10: usize = 0x210;
    /// Response bits 63:32.
    pub const RSP32: usize = 0x214;
    /// Response bits 95:64.
    pub const RSP54: usize = 0x218;
    /// Response bits 127:96.
    pub const RSP76: usize = 0x21C;
    /// Data FIFO.
    pub const DATA: usize = 0x220;
    /// Present state.
    pub const PSTATE: usize = 0x224;
    /// Host control.
    pub const HCTL: usize = 0x228;
    /// System control.
    pub const SYSCTL: usize = 0x22C;
    /// Interrupt status.
    pub const STAT: usize = 0x230;
    /// Interrupt status enable.
    pub const IE: usize = 0x234;
    /// Interrupt signal enable.
    pub const ISE: usize = 0x238;
    /// Capabilities.
    pub const CAPA: usize = 0x240;
}

// ── Field encodings ──────────────────────────────────────────────────────────

const SYSCONFIG_SOFTRESET: u32 = 1 << 1;
const SYSSTATUS_RESETDONE: u32 = 1 << 0;

const CON_INIT: u32 = 1 << 1;
const CON_DW8: u32 = 1 << 5;

const HCTL_DTW: u32 = 1 << 1;
const HCTL_SDBP: u32 = 1 << 8;
const HCTL_SDVS_SHIFT: u32 = 9;
const HCTL_SDVS_MASK: u32 = 0x7 << HCTL_SDVS_SHIFT;

const SYSCTL_ICE: u32 = 1 << 0;
const SYSCTL_ICS: u32 = 1 << 1;
const SYSCTL_CEN: u32 = 1 << 2;
const SYSCTL_CLKD_SHIFT: u32 = 6;
const SYSCTL_CLKD_MASK: u32 = 0x3FF << SYSCTL_CLKD_SHIFT;
const SYSCTL_DTO_SHIFT: u32 = 16;
const SYSCTL_DTO_MASK: u32 = 0xF << SYSCTL_DTO_SHIFT;
const SYSCTL_SRC: u32 = 1 << 25;
const SYSCTL_SRD: u32 = 1 << 26;

const CAPA_VS33: u32 = 1 << 24;
const CAPA_VS30: u32 = 1 << 25;
const CAPA_VS18: u32 = 1 << 26;

const PSTATE_CINS: u32 = 1 << 16;

const BLK_BLEN_MASK: u32 = 0xFFF;
const BLK_NBLK_SHIFT: u32 = 16;

const CMD_DE: u32 = 1 << 0;
const CMD_BCE: u32 = 1 << 1;
const CMD_ACEN_CMD12: u32 = 1 << 2;
const CMD_DDIR_READ: u32 = 1 << 4;
const CMD_MSBS: u32 = 1 << 5;
const CMD_RSP_TYPE_SHIFT: u32 = 16;
const CMD_DP: u32 = 1 << 21;
const CMD_TYPE_SHIFT: u32 = 22;
const CMD_INDX_SHIFT: u32 = 24;

/// Largest CLKD value.
pub const MAX_CLOCK_DIVISOR: u32 = 1023;

/// Upper bound on register polls while waiting for a ready bit.
pub const READY_POLL_LIMIT: u32 = 0xFFFF;

/// Errors reported by [`Mmchs`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MmchsError {
    /// SYSSTATUS.RESETDONE never rose.
    #[error("soft reset did not complete")]
    ResetTimeout,
    /// SYSCTL.SRC/SRD never cleared.
    #[error("line reset did not complete")]
    LineResetTimeout,
    /// HCTL.SDBP did not read back set.
    #[error("bus power did not come up")]
    PowerTimeout,
    /// SYSCTL.ICS never rose.
    #[error("internal clock not stable")]
    ClockUnstable,
    /// No divisor in 2..=1023 brings the clock at or below the target.
    #[error("requested bus frequency out of range")]
    FrequencyOutOfRange,
    /// CC never rose after the init stream.
    #[error("init stream did not complete")]
    InitStreamTimeout,
}

/// SD_CMD value for `frame`.
pub fn command_register(frame: &CommandFrame) -> u32 {
    let mut value = (u32::from(frame.index & 0x3F) << CMD_INDX_SHIFT)
        | (frame.kind.bits() << CMD_TYPE_SHIFT)
        | (frame.response.bits() << CMD_RSP_TYPE_SHIFT);

    if let Some(data) = frame.data {
        value |= CMD_DP | CMD_MSBS | CMD_BCE;
        if data.direction == DataDirection::Read {
            value |= CMD_DDIR_READ;
        }
        if data.dma {
            value |= CMD_DE;
        }
    }

    if frame.auto_stop() {
        value |= CMD_ACEN_CMD12;
    }

    value
}

/// CLKD for the fastest clock at or below `output_hz`.
///
/// Returns `None` when even the largest divisor is too fast.
pub fn clock_divisor(input_hz: u32, output_hz: u32) -> Option<u32> {
    let mut divisor = input_hz.checked_div(output_hz)?.clamp(2, MAX_CLOCK_DIVISOR);
    while input_hz.checked_div(divisor)? > output_hz {
        if divisor == MAX_CLOCK_DIVISOR {
            return None;
        }
        divisor = divisor.saturating_add(1);
    }
    Some(divisor)
}

/// SYSCTL.DTO field for a timeout of 2^`exponent` card clocks.
pub fn data_timeout_field(exponent: u32) -> u32 {
    exponent.wrapping_sub(13) & 0xF
}

/// HCTL.SDVS code for `voltage`.
pub const fn sdvs_bits(voltage: BusVoltage) -> u32 {
    match voltage {
        BusVoltage::V1_8 => 0x5,
        BusVoltage::V3_0 => 0x6,
        BusVoltage::V3_3 => 0x7,
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// One MMCHS instance accessed through its memory-mapped registers.
pub struct Mmchs {
    base: usize,
}

impl Mmchs {
    /// Bind to the MMCHS instance at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the address of an MMCHS register block whose module
    /// clock is enabled, and no other owner may access those registers for
    /// the lifetime of the returned value.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Base address this driver was bound to.
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Handle for this instance's interrupt handler.
    ///
    /// It only touches SD_STAT, and only writes back bits it has just read,
    /// so it can run alongside the task that owns `self`.
    pub const fn irq(&self) -> MmchsIrq {
        MmchsIrq { base: self.base }
    }

    fn read(&self, offset: usize) -> u32 {
        // SAFETY: `new` guarantees `base` maps an MMCHS block and every
        // offset used here is a register inside it.
        unsafe { core::ptr::read_volatile(self.base.wrapping_add(offset) as *const u32) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        // SAFETY: see `read`; `&mut self` makes this the only writer.
        unsafe { core::ptr::write_volatile(self.base.wrapping_add(offset) as *mut u32, value) }
    }

    fn modify(&mut self, offset: usize, clear: u32, set: u32) {
        let value = (self.read(offset) & !clear) | set;
        self.write(offset, value);
    }

    fn poll(&self, offset: usize, mask: u32, want_set: bool) -> bool {
        (0..READY_POLL_LIMIT).any(|_| (self.read(offset) & mask != 0) == want_set)
    }

    fn enable_internal_clock(&mut self) -> Result<(), MmchsError> {
        self.modify(reg::SYSCTL, 0, SYSCTL_ICE);
        if self.poll(reg::SYSCTL, SYSCTL_ICS, true) {
            Ok(())
        } else {
            Err(MmchsError::ClockUnstable)
        }
    }
}

/// SD_STAT acknowledge for one MMCHS instance, owned by its ISR.
#[derive(Debug, Clone, Copy)]
pub struct MmchsIrq {
    base: usize,
}

impl MmcIrq for MmchsIrq {
    fn take_status(&mut self) -> IrqStatus {
        let stat = self.base.wrapping_add(reg::STAT) as *mut u32;
        // SAFETY: `base` comes from an `Mmchs`, whose constructor vouches
        // for the register block. SD_STAT is write-one-to-clear, so writing
        // back what was read cannot disturb bits raised in between.
        let bits = unsafe { core::ptr::read_volatile(stat) };
        // SAFETY: as above.
        unsafe { core::ptr::write_volatile(stat, bits) };
        IrqStatus::from_bits_truncate(bits)
    }
}

impl MmcHost for Mmchs {
    type Error = MmchsError;

    fn soft_reset(&mut self) -> Result<(), Self::Error> {
        self.modify(reg::SYSCONFIG, 0, SYSCONFIG_SOFTRESET);
        if self.poll(reg::SYSSTATUS, SYSSTATUS_RESETDONE, true) {
            Ok(())
        } else {
            Err(MmchsError::ResetTimeout)
        }
    }

    fn reset_lines(&mut self) -> Result<(), Self::Error> {
        let mask = SYSCTL_SRC | SYSCTL_SRD;
        self.modify(reg::SYSCTL, 0, mask);
        if self.poll(reg::SYSCTL, mask, false) {
            Ok(())
        } else {
            Err(MmchsError::LineResetTimeout)
        }
    }

    fn set_supported_voltages(&mut self, voltages: &[BusVoltage]) {
        let set = voltages.iter().fold(0, |acc, v| {
            acc | match v {
                BusVoltage::V1_8 => CAPA_VS18,
                BusVoltage::V3_0 => CAPA_VS30,
                BusVoltage::V3_3 => CAPA_VS33,
            }
        });
        self.modify(reg::CAPA, CAPA_VS18 | CAPA_VS30 | CAPA_VS33, set);
    }

    fn set_bus_voltage(&mut self, voltage: BusVoltage) {
        self.modify(
            reg::HCTL,
            HCTL_SDVS_MASK,
            sdvs_bits(voltage) << HCTL_SDVS_SHIFT,
        );
    }

    fn power_on(&mut self) -> Result<(), Self::Error> {
        self.modify(reg::HCTL, 0, HCTL_SDBP);
        if self.poll(reg::HCTL, HCTL_SDBP, true) {
            Ok(())
        } else {
            Err(MmchsError::PowerTimeout)
        }
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        self.modify(reg::CON, CON_DW8, 0);
        match width {
            BusWidth::One => self.modify(reg::HCTL, HCTL_DTW, 0),
            BusWidth::Four => self.modify(reg::HCTL, 0, HCTL_DTW),
        }
    }

    fn set_bus_frequency(&mut self, input_hz: u32, output_hz: u32) -> Result<(), Self::Error> {
        self.enable_internal_clock()?;
        let divisor =
            clock_divisor(input_hz, output_hz).ok_or(MmchsError::FrequencyOutOfRange)?;
        self.modify(reg::SYSCTL, SYSCTL_CLKD_MASK, divisor << SYSCTL_CLKD_SHIFT);
        if !self.poll(reg::SYSCTL, SYSCTL_ICS, true) {
            return Err(MmchsError::ClockUnstable);
        }
        self.modify(reg::SYSCTL, 0, SYSCTL_CEN);
        Ok(())
    }

    fn send_init_stream(&mut self) -> Result<(), Self::Error> {
        self.modify(reg::IE, 0, IrqStatus::COMMAND_COMPLETE.bits());
        self.modify(reg::CON, 0, CON_INIT);
        self.write(reg::CMD, 0);
        let done = self.poll(reg::STAT, IrqStatus::COMMAND_COMPLETE.bits(), true);
        self.modify(reg::CON, CON_INIT, 0);
        self.write(reg::STAT, IrqStatus::ALL.bits());
        if done {
            Ok(())
        } else {
            Err(MmchsError::InitStreamTimeout)
        }
    }

    fn set_block_length(&mut self, bytes: u32) {
        self.modify(reg::BLK, BLK_BLEN_MASK, bytes & BLK_BLEN_MASK);
    }

    fn set_data_timeout(&mut self, exponent: u32) {
        self.modify(
            reg::SYSCTL,
            SYSCTL_DTO_MASK,
            data_timeout_field(exponent) << SYSCTL_DTO_SHIFT,
        );
    }

    fn enable_interrupts(&mut self, mask: IrqStatus) {
        self.modify(reg::ISE, 0, mask.bits());
        self.modify(reg::IE, 0, mask.bits());
    }

    fn disable_interrupts(&mut self, mask: IrqStatus) {
        self.modify(reg::ISE, mask.bits(), 0);
        self.modify(reg::IE, mask.bits(), 0);
    }

    fn interrupt_status(&self) -> IrqStatus {
        IrqStatus::from_bits_truncate(self.read(reg::STAT))
    }

    fn clear_interrupts(&mut self, mask: IrqStatus) {
        self.write(reg::STAT, mask.bits());
    }

    fn send_command(&mut self, frame: &CommandFrame) {
        let blocks = frame.data.map_or(0, |d| u32::from(d.block_count));
        self.modify(reg::BLK, !BLK_BLEN_MASK, blocks << BLK_NBLK_SHIFT);
        self.write(reg::ARG, frame.argument);
        self.write(reg::CMD, command_register(frame));
    }

    fn response(&self) -> [u32; 4] {
        [
            self.read(reg::RSP10),
            self.read(reg::RSP32),
            self.read(reg::RSP54),
            self.read(reg::RSP76),
        ]
    }

    fn read_fifo(&mut self, buffer: &mut [u8]) {
        for word in buffer.chunks_mut(4) {
            let bytes = self.read(reg::DATA).to_le_bytes();
            for (dst, src) in word.iter_mut().zip(bytes) {
                *dst = src;
            }
        }
    }

    fn write_fifo(&mut self, buffer: &[u8]) {
        for word in buffer.chunks(4) {
            let mut bytes = [0u8; 4];
            for (dst, src) in bytes.iter_mut().zip(word) {
                *dst = *src;
            }
            self.write(reg::DATA, u32::from_le_bytes(bytes));
        }
    }

    fn is_card_inserted(&self) -> bool {
        self.read(reg::PSTATE) & PSTATE_CINS != 0
    }
}
