//! SD protocol vocabulary: command indices, transactions and card registers.
//!
//! ## Register layout as captured
//!
//! The field extractors below take the four words of a 136-bit response
//! in the register's own bit numbering: CSD bit `n` sits at bit `n % 32`
//! of `csd[n / 32]`, with bits 7..0 (CRC7 and the end bit) in the bottom
//! byte of `csd[0]`. [`MmcHost::response`] is expected to hand them over
//! in that order.
//!
//! | Field            | Words / bits                        |
//! |------------------|-------------------------------------|
//! | CSD_STRUCTURE    | `csd[3] >> 30`                      |
//! | TRAN_SPEED       | `csd[3] & 0xFF`                     |
//! | READ_BL_LEN      | `(csd[2] >> 16) & 0xF`              |
//! | C_SIZE (v1)      | `csd[2] & 0x3F`, `csd[1] >> 16`     |
//! | C_SIZE (v0)      | `csd[2] & 0x3FF`, `csd[1] >> 30`    |
//! | C_SIZE_MULT (v0) | `(csd[1] >> 15) & 7`                |
//!
//! The SCR arrives on the data lines most significant byte first;
//! `scr[0]` holds bits 63..32.
//!
//! [`MmcHost::response`]: platform::MmcHost::response

// Field extraction shifts and masks fixed-width register words; every
// operand is masked first.
#![allow(clippy::arithmetic_side_effects)]

use bitflags::bitflags;
use platform::mmc::{BusWidth, CommandFrame, CommandKind, DataDirection, DataPhase, ResponseKind};

use crate::config::{
    DEFAULT_SPEED_CLOCK_HZ, HIGH_SPEED_CLOCK_HZ, TRAN_SPEED_25MHZ, TRAN_SPEED_50MHZ,
};

/// Standard command indices.
pub mod cmd {
    /// Reset to idle.
    pub const GO_IDLE_STATE: u8 = 0;
    /// Broadcast CID request.
    pub const ALL_SEND_CID: u8 = 2;
    /// Publish a new RCA.
    pub const SEND_RELATIVE_ADDR: u8 = 3;
    /// Check / switch card function.
    pub const SWITCH_FUNC: u8 = 6;
    /// Select / deselect.
    pub const SELECT_CARD: u8 = 7;
    /// Interface condition.
    pub const SEND_IF_COND: u8 = 8;
    /// CSD request.
    pub const SEND_CSD: u8 = 9;
    /// Card status.
    pub const SEND_STATUS: u8 = 13;
    /// Block length for standard capacity cards.
    pub const SET_BLOCKLEN: u8 = 16;
    /// Read one block.
    pub const READ_SINGLE_BLOCK: u8 = 17;
    /// Read until stopped.
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    /// Pre-define the block count of the next multi-block command.
    pub const SET_BLOCK_COUNT: u8 = 23;
    /// Write one block.
    pub const WRITE_BLOCK: u8 = 24;
    /// Write until stopped.
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    /// Next command is application specific.
    pub const APP_CMD: u8 = 55;
}

/// Application command indices (each preceded by CMD55).
pub mod acmd {
    /// Data bus width.
    pub const SET_BUS_WIDTH: u8 = 6;
    /// Operating condition negotiation.
    pub const SD_SEND_OP_COND: u8 = 41;
    /// SCR request.
    pub const SEND_SCR: u8 = 51;
}

/// CMD8 argument: 2.7–3.6 V, check pattern 0xAA.
pub const IF_COND_ARGUMENT: u32 = 0x1AA;

/// OCR busy bit: power-up complete.
pub const OCR_POWER_UP_DONE: u32 = 1 << 31;

/// OCR HCS / CCS bit.
pub const OCR_HIGH_CAPACITY: u32 = 1 << 30;

/// OCR voltage window wildcard sent with ACMD41.
pub const OCR_VOLTAGE_WILDCARD: u32 = 0x1FF << 15;

/// CMD6 argument: switch function group 1 to high speed.
pub const SWITCH_HIGH_SPEED_ARGUMENT: u32 = 0x80FF_FFF1;

/// Length of the CMD6 switch status block.
pub const SWITCH_STATUS_BYTES: usize = 64;

/// Length of the SCR.
pub const SCR_BYTES: usize = 8;

/// ACMD6 argument for a 4-bit bus.
pub const BUS_WIDTH_4BIT_ARGUMENT: u32 = 2;

bitflags! {
    /// How a command is framed on the bus.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        /// No response expected.
        const RESPONSE_NONE = 1 << 0;
        /// Bus-suspend command type (stop transmission).
        const STOP = 1 << 1;
        /// Function-select command type.
        const FUNCTION_SELECT = 1 << 2;
        /// I/O abort command type.
        const ABORT = 1 << 3;
        /// R1b: busy signalled on DAT0.
        const BUSY = 1 << 4;
        /// 136-bit response.
        const LONG_RESPONSE = 1 << 5;
    }
}

impl CommandFlags {
    /// Short response, normal command.
    pub const NONE: Self = Self::empty();
}

/// Where the data phase of a transaction goes.
#[derive(Debug)]
pub enum DataStage<'a> {
    /// PIO into a caller buffer.
    Read(&'a mut [u8]),
    /// PIO out of a caller buffer.
    Write(&'a [u8]),
    /// Through an already armed DMA channel.
    Dma(DataDirection),
}

impl DataStage<'_> {
    /// Direction of the data phase.
    pub fn direction(&self) -> DataDirection {
        match self {
            Self::Read(_) => DataDirection::Read,
            Self::Write(_) => DataDirection::Write,
            Self::Dma(direction) => *direction,
        }
    }
}

/// One SD command with its optional data phase and captured response.
#[derive(Debug)]
pub struct Transaction<'a> {
    /// Command index.
    pub command: u8,
    /// Framing.
    pub flags: CommandFlags,
    /// Argument.
    pub argument: u32,
    /// Bytes per block of the data phase.
    pub block_size: u32,
    /// Blocks in the data phase.
    pub block_count: u16,
    /// Data phase, if any.
    pub data: Option<DataStage<'a>>,
    /// RSP10..RSP76 after a successful transmit.
    pub response: [u32; 4],
}

fn blocks_in(len: usize, block_size: u32) -> u16 {
    let blocks = len.checked_div(block_size as usize).unwrap_or(0);
    u16::try_from(blocks).unwrap_or(u16::MAX)
}

impl<'a> Transaction<'a> {
    /// Command without a data phase.
    pub const fn command(command: u8, flags: CommandFlags, argument: u32) -> Self {
        Self {
            command,
            flags,
            argument,
            block_size: 0,
            block_count: 0,
            data: None,
            response: [0; 4],
        }
    }

    /// PIO read of `buffer.len() / block_size` blocks into `buffer`.
    pub fn read(command: u8, argument: u32, buffer: &'a mut [u8], block_size: u32) -> Self {
        Self {
            block_size,
            block_count: blocks_in(buffer.len(), block_size),
            data: Some(DataStage::Read(buffer)),
            ..Self::command(command, CommandFlags::NONE, argument)
        }
    }

    /// PIO write of `buffer.len() / block_size` blocks from `buffer`.
    pub fn write(command: u8, argument: u32, buffer: &'a [u8], block_size: u32) -> Self {
        Self {
            block_size,
            block_count: blocks_in(buffer.len(), block_size),
            data: Some(DataStage::Write(buffer)),
            ..Self::command(command, CommandFlags::NONE, argument)
        }
    }

    /// Data phase carried by a DMA channel the caller has already armed.
    pub const fn dma(
        command: u8,
        argument: u32,
        direction: DataDirection,
        block_size: u32,
        block_count: u16,
    ) -> Self {
        Self {
            command,
            flags: CommandFlags::NONE,
            argument,
            block_size,
            block_count,
            data: Some(DataStage::Dma(direction)),
            response: [0; 4],
        }
    }

    /// Response class selected by the flags.
    pub fn response_kind(&self) -> ResponseKind {
        if self.flags.contains(CommandFlags::RESPONSE_NONE) {
            ResponseKind::None
        } else if self.flags.contains(CommandFlags::LONG_RESPONSE) {
            ResponseKind::Long
        } else if self.flags.contains(CommandFlags::BUSY) {
            ResponseKind::ShortBusy
        } else {
            ResponseKind::Short
        }
    }

    /// Command type selected by the flags.
    pub fn command_kind(&self) -> CommandKind {
        if self.flags.contains(CommandFlags::STOP) {
            CommandKind::Suspend
        } else if self.flags.contains(CommandFlags::FUNCTION_SELECT) {
            CommandKind::FunctionSelect
        } else if self.flags.contains(CommandFlags::ABORT) {
            CommandKind::Abort
        } else {
            CommandKind::Normal
        }
    }

    /// The frame handed to the host controller.
    pub fn frame(&self) -> CommandFrame {
        CommandFrame {
            index: self.command,
            argument: self.argument,
            response: self.response_kind(),
            kind: self.command_kind(),
            data: self.data.as_ref().map(|stage| DataPhase {
                direction: stage.direction(),
                block_count: self.block_count,
                dma: matches!(stage, DataStage::Dma(_)),
            }),
        }
    }
}

// ── Registers ────────────────────────────────────────────────────────────────

/// Geometry derived from the CSD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    /// `2^READ_BL_LEN`.
    pub block_size: u32,
    /// Blocks of `block_size` bytes.
    pub block_count: u32,
    /// Capacity in KiB.
    pub size_kib: u32,
    /// Raw TRAN_SPEED.
    pub tran_speed: u8,
}

/// CSD_STRUCTURE (0 = standard capacity, 1 = high / extended capacity).
pub const fn csd_structure(csd: &[u32; 4]) -> u32 {
    (csd[3] >> 30) & 0x3
}

/// Derive block size, count, capacity and TRAN_SPEED from a CSD.
pub fn geometry(csd: &[u32; 4]) -> Geometry {
    let [_, csd1, csd2, csd3] = *csd;
    let tran_speed = (csd3 & 0xFF) as u8;
    let block_size = 1u32 << ((csd2 >> 16) & 0xF);

    if csd_structure(csd) == 1 {
        let c_size = ((csd2 & 0x3F) << 16) | (csd1 >> 16);
        let size_kib = (c_size + 1).saturating_mul(512);
        let per_kib = 1024 / block_size;
        Geometry {
            block_size,
            block_count: size_kib.saturating_mul(per_kib),
            size_kib,
            tran_speed,
        }
    } else {
        let c_size = ((csd2 & 0x3FF) << 2) | (csd1 >> 30);
        let c_size_mult = (csd1 >> 15) & 0x7;
        let block_count = (c_size + 1) << (c_size_mult + 2);
        let bytes = u64::from(block_count) * u64::from(block_size);
        Geometry {
            block_size,
            block_count,
            size_kib: u32::try_from(bytes / 1024).unwrap_or(u32::MAX),
            tran_speed,
        }
    }
}

/// SCR words from the 8 bytes read by ACMD51.
pub fn scr_words(bytes: &[u8; SCR_BYTES]) -> [u32; 2] {
    let [a, b, c, d, e, f, g, h] = *bytes;
    [
        u32::from_be_bytes([a, b, c, d]),
        u32::from_be_bytes([e, f, g, h]),
    ]
}

/// Physical layer version (1–4) from SD_SPEC, SD_SPEC3 and SD_SPEC4.
pub const fn sd_version(scr0: u32) -> u8 {
    let sd_spec = (scr0 >> 24) & 0xF;
    let spec3 = scr0 & (1 << 15) != 0;
    let spec4 = scr0 & (1 << 10) != 0;
    match sd_spec {
        0 | 1 => 1,
        _ if !spec3 => 2,
        _ if !spec4 => 3,
        _ => 4,
    }
}

/// Raw SD_BUS_WIDTHS nibble.
pub const fn scr_bus_widths(scr0: u32) -> u8 {
    ((scr0 >> 16) & 0xF) as u8
}

/// CMD_SUPPORT bit 33: CMD23.
pub const fn scr_supports_cmd23(scr0: u32) -> bool {
    scr0 & (1 << 1) != 0
}

/// Decode an SD_BUS_WIDTHS nibble.
pub const fn decode_bus_width(bus_widths: u8) -> Option<BusWidth> {
    if bus_widths & 0xF == 1 {
        Some(BusWidth::One)
    } else if bus_widths & 0x4 != 0 {
        Some(BusWidth::Four)
    } else {
        None
    }
}

/// Card clock for a TRAN_SPEED code.
pub const fn decode_transfer_speed(tran_speed: u8) -> Option<u32> {
    match tran_speed {
        TRAN_SPEED_50MHZ => Some(HIGH_SPEED_CLOCK_HZ),
        TRAN_SPEED_25MHZ => Some(DEFAULT_SPEED_CLOCK_HZ),
        _ => None,
    }
}

/// Function group 1 result of a CMD6 switch status block.
pub fn switched_to_high_speed(status: &[u8; SWITCH_STATUS_BYTES]) -> bool {
    status.get(16).is_some_and(|group1| group1 & 0xF == 1)
}

/// Everything learned about a card during one successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CardInfo {
    /// Relative card address.
    pub rca: u16,
    /// Operating conditions register.
    pub ocr: u32,
    /// Card identification register.
    pub cid: [u32; 4],
    /// Card specific data.
    pub csd: [u32; 4],
    /// SD configuration register.
    pub scr: [u32; 2],
    /// Block addressed (SDHC / SDXC).
    pub high_capacity: bool,
    /// Bytes per block used for transfers.
    pub block_size: u32,
    /// Blocks on the card.
    pub block_count: u32,
    /// Capacity in KiB.
    pub size_kib: u32,
    /// Physical layer version (1–4).
    pub version: u8,
    /// Raw SD_BUS_WIDTHS nibble.
    pub bus_widths: u8,
    /// TRAN_SPEED code in effect.
    pub tran_speed: u8,
    /// CMD23 supported.
    pub supports_cmd23: bool,
}

impl CardInfo {
    /// Bus width the card advertises.
    pub const fn bus_width(&self) -> Option<BusWidth> {
        decode_bus_width(self.bus_widths)
    }

    /// Card clock in Hz.
    pub const fn transfer_speed_hz(&self) -> Option<u32> {
        decode_transfer_speed(self.tran_speed)
    }

    /// Card address for a block index: the index itself on block-addressed
    /// cards, the byte offset otherwise.
    pub const fn address_of(&self, sector: u32) -> u32 {
        if self.high_capacity {
            sector
        } else {
            sector.wrapping_mul(self.block_size)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use platform::mocks::{scr_bytes, CardProfile};
    use proptest::prelude::*;

    #[test]
    fn sdhc_geometry_from_csd_v1() {
        // 16 GiB class card: C_SIZE = 0x7697.
        let csd = CardProfile::sdhc(0x7697).csd;
        let g = geometry(&csd);
        assert_eq!(g.block_size, 512);
        assert_eq!(g.size_kib, (0x7697 + 1) * 512);
        assert_eq!(g.block_count, (0x7697 + 1) * 1024);
        assert_eq!(g.tran_speed, TRAN_SPEED_25MHZ);
    }

    #[test]
    fn sdsc_geometry_counts_read_bl_len_units() {
        // C_SIZE 4095, C_SIZE_MULT 7, READ_BL_LEN 10: 2 GiB card, 1 KiB blocks.
        let csd = CardProfile::sdsc(4095, 7, 10).csd;
        let g = geometry(&csd);
        assert_eq!(g.block_size, 1024);
        assert_eq!(g.block_count, 4096 << 9);
        assert_eq!(g.size_kib, 2 * 1024 * 1024);
    }

    /// Set CSD bits `lsb..lsb + width` to `value`, numbering bits as the
    /// SD register does (bit 127 = CSD_STRUCTURE MSB).
    fn place(csd: &mut [u32; 4], lsb: u32, width: u32, value: u32) {
        for bit in (0..width).filter(|bit| (value >> bit) & 1 == 1) {
            let n = lsb + bit;
            if let Some(word) = csd.get_mut((n / 32) as usize) {
                *word |= 1 << (n % 32);
            }
        }
    }

    #[test]
    fn fields_are_read_at_register_bit_positions() {
        let mut v2 = [0u32; 4];
        place(&mut v2, 126, 2, 1);
        place(&mut v2, 96, 8, 0x5A);
        place(&mut v2, 80, 4, 9);
        place(&mut v2, 48, 22, 0x1234);
        let g = geometry(&v2);
        assert_eq!(csd_structure(&v2), 1);
        assert_eq!(g.tran_speed, 0x5A);
        assert_eq!(g.block_size, 512);
        assert_eq!(g.size_kib, 0x1235 * 512);

        let mut v1 = [0u32; 4];
        place(&mut v1, 96, 8, 0x32);
        place(&mut v1, 80, 4, 9);
        place(&mut v1, 62, 12, 0x800);
        place(&mut v1, 47, 3, 3);
        let g = geometry(&v1);
        assert_eq!(csd_structure(&v1), 0);
        assert_eq!(g.block_size, 512);
        assert_eq!(g.block_count, 0x801 << 5);
    }

    #[test]
    fn version_follows_spec_bits() {
        let v = |spec, s3, s4| sd_version(scr_words(&scr_bytes(spec, s3, s4, false))[0]);
        assert_eq!(v(0, false, false), 1);
        assert_eq!(v(1, false, false), 1);
        assert_eq!(v(2, false, false), 2);
        assert_eq!(v(2, true, false), 3);
        assert_eq!(v(2, true, true), 4);
    }

    #[test]
    fn bus_width_and_speed_queries() {
        assert_eq!(decode_bus_width(0x1), Some(BusWidth::One));
        assert_eq!(decode_bus_width(0x5), Some(BusWidth::Four));
        assert_eq!(decode_bus_width(0x0), None);
        assert_eq!(decode_transfer_speed(0x5A), Some(50_000_000));
        assert_eq!(decode_transfer_speed(0x32), Some(25_000_000));
        assert_eq!(decode_transfer_speed(0x0B), None);
    }

    #[test]
    fn cmd23_support_is_scr_bit_33() {
        let words = scr_words(&scr_bytes(2, true, false, true));
        assert!(scr_supports_cmd23(words[0]));
        let words = scr_words(&scr_bytes(2, true, false, false));
        assert!(!scr_supports_cmd23(words[0]));
    }

    #[test]
    fn flags_select_frame_encoding() {
        let cmd0 = Transaction::command(cmd::GO_IDLE_STATE, CommandFlags::RESPONSE_NONE, 0);
        assert_eq!(cmd0.frame().response, ResponseKind::None);
        let cmd2 = Transaction::command(cmd::ALL_SEND_CID, CommandFlags::LONG_RESPONSE, 0);
        assert_eq!(cmd2.frame().response, ResponseKind::Long);
        let cmd7 = Transaction::command(cmd::SELECT_CARD, CommandFlags::BUSY, 0);
        assert_eq!(cmd7.frame().response, ResponseKind::ShortBusy);
        let stop = Transaction::command(12, CommandFlags::STOP | CommandFlags::BUSY, 0);
        assert_eq!(stop.frame().kind, CommandKind::Suspend);
    }

    #[test]
    fn data_transactions_carry_block_geometry() {
        let mut buffer = [0u8; 1024];
        let tx = Transaction::read(cmd::READ_MULTIPLE_BLOCK, 8, &mut buffer, 512);
        let phase = tx.frame().data.unwrap();
        assert_eq!(phase.block_count, 2);
        assert_eq!(phase.direction, DataDirection::Read);
        assert!(!phase.dma);

        let tx = Transaction::dma(cmd::WRITE_MULTIPLE_BLOCK, 0, DataDirection::Write, 512, 9);
        let phase = tx.frame().data.unwrap();
        assert!(phase.dma);
        assert_eq!(phase.block_count, 9);
    }

    #[test]
    fn standard_capacity_addresses_are_bytes() {
        let info = CardInfo {
            block_size: 512,
            ..CardInfo::default()
        };
        assert_eq!(info.address_of(3), 1536);
        let info = CardInfo {
            high_capacity: true,
            ..info
        };
        assert_eq!(info.address_of(3), 3);
    }

    proptest! {
        #[test]
        fn v1_capacity_is_half_mib_per_c_size_step(c_size in 0u32..0x20_0000) {
            let g = geometry(&CardProfile::sdhc(c_size).csd);
            prop_assert_eq!(g.size_kib, (c_size + 1) * 512);
            prop_assert_eq!(g.block_count, g.size_kib * 2);
        }

        #[test]
        fn v0_capacity_matches_formula(
            c_size in 0u32..4096,
            mult in 0u32..8,
            read_bl_len in 9u32..12,
        ) {
            let g = geometry(&CardProfile::sdsc(c_size, mult, read_bl_len).csd);
            let blocks = (c_size + 1) << (mult + 2);
            prop_assert_eq!(g.block_count, blocks);
            prop_assert_eq!(g.block_size, 1 << read_bl_len);
            prop_assert_eq!(
                u64::from(g.size_kib),
                u64::from(blocks) * (1u64 << read_bl_len) / 1024
            );
        }
    }
}
