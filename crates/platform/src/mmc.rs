//! MMC/SD host controller abstraction
//!
//! The [`MmcHost`] trait is the register-level surface of one MMCHS
//! instance as the SD protocol code sees it. Every method maps onto a
//! handful of register accesses; none of them blocks on the card.
//! Waiting for a command or data phase to finish is the caller's job
//! (see `card::transport`), driven by [`MmcHost::interrupt_status`].
//!
//! ## Command register encoding
//!
//! | Field      | Source                                   |
//! |------------|------------------------------------------|
//! | INDX       | [`CommandFrame::index`]                  |
//! | CMD_TYPE   | [`CommandFrame::kind`]                   |
//! | RSP_TYPE   | [`CommandFrame::response`]               |
//! | DP/MSBS/BCE/DDIR/DE | [`CommandFrame::data`]          |
//! | ACEN       | set for CMD18 / CMD25 (auto CMD12)       |

use bitflags::bitflags;

bitflags! {
    /// MMCHS interrupt status bits (SD_STAT / SD_IE / SD_ISE layout).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IrqStatus: u32 {
        /// CC: command complete.
        const COMMAND_COMPLETE = 1 << 0;
        /// TC: data transfer complete.
        const TRANSFER_COMPLETE = 1 << 1;
        /// BWR: FIFO ready to accept one block.
        const BUFFER_WRITE_READY = 1 << 4;
        /// BRR: FIFO holds one block ready to read.
        const BUFFER_READ_READY = 1 << 5;
        /// ERRI: summary bit, set together with any error below.
        const ERROR = 1 << 15;
        /// CTO: no response within 64 clock cycles.
        const COMMAND_TIMEOUT = 1 << 16;
        /// CCRC: response CRC mismatch.
        const COMMAND_CRC = 1 << 17;
        /// CEB: response end bit error.
        const COMMAND_END_BIT = 1 << 18;
        /// CIE: response index mismatch.
        const COMMAND_INDEX = 1 << 19;
        /// DTO: data timeout.
        const DATA_TIMEOUT = 1 << 20;
        /// DCRC: data CRC mismatch.
        const DATA_CRC = 1 << 21;
        /// DEB: data end bit error.
        const DATA_END_BIT = 1 << 22;
        /// ACE: auto CMD12 error.
        const AUTO_CMD = 1 << 24;
        /// CERR: card status error in R1.
        const CARD_ERROR = 1 << 28;
        /// BADA: bad access to the data register.
        const BAD_ACCESS = 1 << 29;
    }
}

impl IrqStatus {
    /// Sources that end the command phase.
    pub const COMMAND_PHASE: Self = Self::COMMAND_COMPLETE
        .union(Self::COMMAND_TIMEOUT)
        .union(Self::ERROR);

    /// Sources that end the data phase.
    pub const DATA_PHASE: Self = Self::TRANSFER_COMPLETE
        .union(Self::DATA_TIMEOUT)
        .union(Self::ERROR);

    /// Every source, used for blanket clears.
    pub const ALL: Self = Self::all();
}

/// Response class selected by SD_CMD.RSP_TYPE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseKind {
    /// No response.
    None,
    /// 136-bit response (R2: CID, CSD).
    Long,
    /// 48-bit response (R1, R3, R6, R7).
    Short,
    /// 48-bit response with busy signalling on DAT0 (R1b).
    ShortBusy,
}

impl ResponseKind {
    /// Two-bit RSP_TYPE encoding.
    pub const fn bits(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Long => 1,
            Self::Short => 2,
            Self::ShortBusy => 3,
        }
    }
}

/// Command type selected by SD_CMD.CMD_TYPE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandKind {
    /// Ordinary command.
    Normal,
    /// Bus suspend (CMD52 write to function 0 or CMD12 as stop).
    Suspend,
    /// Function select / resume.
    FunctionSelect,
    /// I/O abort.
    Abort,
}

impl CommandKind {
    /// Two-bit CMD_TYPE encoding.
    pub const fn bits(self) -> u32 {
        match self {
            Self::Normal => 0,
            Self::Suspend => 1,
            Self::FunctionSelect => 2,
            Self::Abort => 3,
        }
    }
}

/// Direction of a data phase, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    /// Card to host.
    Read,
    /// Host to card.
    Write,
}

/// Data phase attached to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataPhase {
    /// Transfer direction.
    pub direction: DataDirection,
    /// Number of blocks (SD_BLK.NBLK).
    pub block_count: u16,
    /// Route the FIFO through the DMA request lines instead of BRR/BWR.
    pub dma: bool,
}

/// One command as written to SD_ARG + SD_CMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandFrame {
    /// Command index (0..=63).
    pub index: u8,
    /// 32-bit argument.
    pub argument: u32,
    /// Expected response.
    pub response: ResponseKind,
    /// Command type.
    pub kind: CommandKind,
    /// Optional data phase.
    pub data: Option<DataPhase>,
}

impl CommandFrame {
    /// True for the multi-block commands the host terminates with auto CMD12.
    pub const fn auto_stop(&self) -> bool {
        matches!(self.index, 18 | 25)
    }
}

/// Data bus width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusWidth {
    /// DAT0 only.
    One,
    /// DAT0..DAT3.
    Four,
}

impl BusWidth {
    /// Number of data lines.
    pub const fn lines(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Four => 4,
        }
    }
}

/// SD bus voltage (SD_HCTL.SDVS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusVoltage {
    /// 1.8 V
    V1_8,
    /// 3.0 V
    V3_0,
    /// 3.3 V
    V3_3,
}

/// MMCHS host controller.
///
/// Implementations are expected to be thin: the protocol state machine,
/// timeouts and retry policy all live above this trait.
pub trait MmcHost {
    /// Error type for operations that poll a hardware ready bit.
    type Error: core::fmt::Debug;

    /// SYSCONFIG.SOFTRESET, waiting for SYSSTATUS.RESETDONE.
    fn soft_reset(&mut self) -> Result<(), Self::Error>;

    /// Reset the command and data line state machines (SYSCTL.SRC | SRD).
    fn reset_lines(&mut self) -> Result<(), Self::Error>;

    /// Advertise the voltages the board can supply (CAPA.VS18/VS30/VS33).
    fn set_supported_voltages(&mut self, voltages: &[BusVoltage]);

    /// Select the bus voltage (HCTL.SDVS).
    fn set_bus_voltage(&mut self, voltage: BusVoltage);

    /// Switch bus power on (HCTL.SDBP) and wait until it reads back set.
    fn power_on(&mut self) -> Result<(), Self::Error>;

    /// Data bus width (CON.DW8 / HCTL.DTW).
    fn set_bus_width(&mut self, width: BusWidth);

    /// Program the card clock divider from the functional clock and enable it.
    ///
    /// The resulting frequency never exceeds `output_hz`.
    fn set_bus_frequency(&mut self, input_hz: u32, output_hz: u32) -> Result<(), Self::Error>;

    /// Send the 80-clock initialization stream.
    fn send_init_stream(&mut self) -> Result<(), Self::Error>;

    /// Block length in bytes for the next data phase (BLK.BLEN).
    fn set_block_length(&mut self, bytes: u32);

    /// Data timeout as a power of two of the card clock (2^13 ..= 2^27).
    fn set_data_timeout(&mut self, exponent: u32);

    /// Enable status reporting and interrupt signalling for `mask`.
    fn enable_interrupts(&mut self, mask: IrqStatus);

    /// Disable status reporting and interrupt signalling for `mask`.
    fn disable_interrupts(&mut self, mask: IrqStatus);

    /// Current SD_STAT.
    fn interrupt_status(&self) -> IrqStatus;

    /// Write-one-to-clear SD_STAT bits.
    fn clear_interrupts(&mut self, mask: IrqStatus);

    /// Issue a command (writes SD_BLK.NBLK, SD_ARG and SD_CMD).
    fn send_command(&mut self, frame: &CommandFrame);

    /// RSP10, RSP32, RSP54, RSP76.
    fn response(&self) -> [u32; 4];

    /// Drain `buffer.len()` bytes from the data FIFO.
    fn read_fifo(&mut self, buffer: &mut [u8]);

    /// Fill the data FIFO with `buffer`.
    fn write_fifo(&mut self, buffer: &[u8]);

    /// Card-detect line state.
    fn is_card_inserted(&self) -> bool;
}

impl<T: MmcHost> MmcHost for &mut T {
    type Error = T::Error;

    fn soft_reset(&mut self) -> Result<(), Self::Error> {
        T::soft_reset(self)
    }

    fn reset_lines(&mut self) -> Result<(), Self::Error> {
        T::reset_lines(self)
    }

    fn set_supported_voltages(&mut self, voltages: &[BusVoltage]) {
        T::set_supported_voltages(self, voltages);
    }

    fn set_bus_voltage(&mut self, voltage: BusVoltage) {
        T::set_bus_voltage(self, voltage);
    }

    fn power_on(&mut self) -> Result<(), Self::Error> {
        T::power_on(self)
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        T::set_bus_width(self, width);
    }

    fn set_bus_frequency(&mut self, input_hz: u32, output_hz: u32) -> Result<(), Self::Error> {
        T::set_bus_frequency(self, input_hz, output_hz)
    }

    fn send_init_stream(&mut self) -> Result<(), Self::Error> {
        T::send_init_stream(self)
    }

    fn set_block_length(&mut self, bytes: u32) {
        T::set_block_length(self, bytes);
    }

    fn set_data_timeout(&mut self, exponent: u32) {
        T::set_data_timeout(self, exponent);
    }

    fn enable_interrupts(&mut self, mask: IrqStatus) {
        T::enable_interrupts(self, mask);
    }

    fn disable_interrupts(&mut self, mask: IrqStatus) {
        T::disable_interrupts(self, mask);
    }

    fn interrupt_status(&self) -> IrqStatus {
        T::interrupt_status(self)
    }

    fn clear_interrupts(&mut self, mask: IrqStatus) {
        T::clear_interrupts(self, mask);
    }

    fn send_command(&mut self, frame: &CommandFrame) {
        T::send_command(self, frame);
    }

    fn response(&self) -> [u32; 4] {
        T::response(self)
    }

    fn read_fifo(&mut self, buffer: &mut [u8]) {
        T::read_fifo(self, buffer);
    }

    fn write_fifo(&mut self, buffer: &[u8]) {
        T::write_fifo(self, buffer);
    }

    fn is_card_inserted(&self) -> bool {
        T::is_card_inserted(self)
    }
}

/// Interrupt-context view of one host's SD_STAT.
///
/// The MMCHS line stays asserted while any enabled SD_STAT bit is set, so
/// the handler has to acknowledge what it saw before returning. The bits
/// it takes are handed to the task through `card::ControllerShared`.
pub trait MmcIrq {
    /// Read SD_STAT and write the same bits back to clear them.
    fn take_status(&mut self) -> IrqStatus;
}

impl<T: MmcIrq> MmcIrq for &mut T {
    fn take_status(&mut self) -> IrqStatus {
        T::take_status(self)
    }
}
