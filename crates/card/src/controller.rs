//! Per-drive card controller: negotiation, geometry, presence.
//!
//! ## Open sequence
//!
//! ```text
//! RESET ─▶ CMD0 ─▶ CMD8 ─▶ (CMD55 + ACMD41)* ─▶ CMD2 ─▶ CMD3 ─▶ CMD9
//!   ─▶ [CMD16, standard capacity only] ─▶ CMD7 ─▶ CMD55 + ACMD51
//!   ─▶ CMD55 + ACMD6 ─▶ CMD6 ─▶ card clock ─▶ OPEN
//! ```
//!
//! Any failing step leaves the controller closed and the published
//! [`CardInfo`] withdrawn. A failure to program the final card clock is
//! logged and does not fail the open.

use platform::config::HostIdentity;
use platform::mmc::{BusVoltage, BusWidth, MmcHost};
use platform::storage::BLOCK_SIZE;

use crate::config::{
    CardConfig, DEFAULT_SPEED_CLOCK_HZ, HIGH_SPEED_CLOCK_HZ, IDENTIFICATION_CLOCK_HZ,
    TRAN_SPEED_25MHZ, TRAN_SPEED_50MHZ,
};
use crate::error::{CardError, NegotiationFailure, NegotiationStage, TransportError};
use crate::protocol::{
    acmd, cmd, geometry, scr_bus_widths, scr_supports_cmd23, scr_words, sd_version,
    switched_to_high_speed, CardInfo, CommandFlags, Transaction, BUS_WIDTH_4BIT_ARGUMENT,
    IF_COND_ARGUMENT, OCR_HIGH_CAPACITY, OCR_POWER_UP_DONE, OCR_VOLTAGE_WILDCARD, SCR_BYTES,
    SWITCH_HIGH_SPEED_ARGUMENT, SWITCH_STATUS_BYTES,
};
use crate::transport::{ControllerShared, Transport};

/// Block length programmed on standard capacity cards.
const BLOCK_LENGTH: u32 = BLOCK_SIZE as u32;

/// One SD card slot behind one MMCHS instance.
pub struct CardController<'a, H> {
    identity: HostIdentity,
    transport: Transport<'a, H>,
    functional_clock_hz: u32,
    ocr_poll_limit: u32,
    is_open: bool,
    info: CardInfo,
}

impl<'a, H: MmcHost> CardController<'a, H> {
    /// A closed controller for the slot at `identity`.
    pub fn new(
        identity: HostIdentity,
        host: H,
        shared: &'a ControllerShared,
        config: &CardConfig,
    ) -> Self {
        Self {
            identity,
            transport: Transport::new(host, shared, config.wait_timeout),
            functional_clock_hz: config.functional_clock_hz,
            ocr_poll_limit: config.ocr_poll_limit,
            is_open: false,
            info: CardInfo::default(),
        }
    }

    /// Fixed hardware identity.
    pub fn identity(&self) -> HostIdentity {
        self.identity
    }

    /// Negotiation completed and the controller has not been closed since.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Card info while open.
    pub fn info(&self) -> Option<&CardInfo> {
        self.is_open.then_some(&self.info)
    }

    /// The shared block published to lock-free readers.
    pub fn shared(&self) -> &'a ControllerShared {
        self.transport.shared()
    }

    /// The underlying transport.
    pub fn transport(&mut self) -> &mut Transport<'a, H> {
        &mut self.transport
    }

    /// No transaction state left behind.
    pub fn is_idle(&self) -> bool {
        self.transport.is_idle()
    }

    /// Execute one transaction on the bus.
    pub async fn transmit(&mut self, tx: &mut Transaction<'_>) -> Result<(), TransportError> {
        self.transport.transmit(tx).await
    }

    /// Bring the card from any state to open, 4-bit, fastest supported clock.
    pub async fn open(&mut self) -> Result<(), CardError> {
        self.close();
        match self.negotiate().await {
            Ok(info) => {
                self.info = info;
                self.is_open = true;
                self.shared().publish(Some(info));
                info!(
                    "card @ {:?}: open, {} blocks of {} bytes, v{}",
                    self.identity.base_address,
                    info.block_count,
                    info.block_size,
                    info.version
                );
                Ok(())
            }
            Err(err) => {
                debug!("card @ {:?}: open failed: {:?}", self.identity.base_address, err);
                Err(err)
            }
        }
    }

    /// Mark the controller closed. The card itself is left alone.
    pub fn close(&mut self) {
        self.is_open = false;
        self.shared().publish(None);
    }

    /// Card detect asserted and the card answers CMD13.
    pub async fn test_present(&mut self) -> bool {
        if !self.transport.is_card_inserted() {
            return false;
        }
        let argument = u32::from(self.info.rca) << 16;
        let mut tx = Transaction::command(cmd::SEND_STATUS, CommandFlags::NONE, argument);
        self.transmit(&mut tx).await.is_ok()
    }

    /// Card address of block `sector`.
    pub fn address_of(&self, sector: u32) -> u32 {
        self.info.address_of(sector)
    }

    /// CMD23 ahead of a multi-block command, when the card supports it.
    pub async fn set_block_count(&mut self, blocks: usize) -> Result<(), CardError> {
        if self.info.supports_cmd23 && blocks > 1 {
            let count = u32::try_from(blocks).map_err(|_| CardError::TooManyBlocks)?;
            let mut tx = Transaction::command(cmd::SET_BLOCK_COUNT, CommandFlags::NONE, count);
            self.transmit(&mut tx).await?;
        }
        Ok(())
    }

    /// PIO read of `buffer.len() / 512` blocks (CMD17 for one, CMD18 otherwise).
    pub async fn read_pio(&mut self, buffer: &mut [u8], sector: u32) -> Result<(), CardError> {
        let blocks = buffer.len() / BLOCK_SIZE;
        self.set_block_count(blocks).await?;
        let command = if blocks > 1 {
            cmd::READ_MULTIPLE_BLOCK
        } else {
            cmd::READ_SINGLE_BLOCK
        };
        let mut tx = Transaction::read(command, self.address_of(sector), buffer, BLOCK_LENGTH);
        self.transmit(&mut tx).await?;
        Ok(())
    }

    /// PIO write of `buffer.len() / 512` blocks (CMD24 for one, CMD25 otherwise).
    pub async fn write_pio(&mut self, buffer: &[u8], sector: u32) -> Result<(), CardError> {
        let blocks = buffer.len() / BLOCK_SIZE;
        self.set_block_count(blocks).await?;
        let command = if blocks > 1 {
            cmd::WRITE_MULTIPLE_BLOCK
        } else {
            cmd::WRITE_BLOCK
        };
        let mut tx = Transaction::write(command, self.address_of(sector), buffer, BLOCK_LENGTH);
        self.transmit(&mut tx).await?;
        Ok(())
    }

    // ── Negotiation ──────────────────────────────────────────────────────────

    async fn step(
        &mut self,
        stage: NegotiationStage,
        tx: &mut Transaction<'_>,
    ) -> Result<(), CardError> {
        self.transmit(tx)
            .await
            .map_err(|err| CardError::negotiation(stage, NegotiationFailure::Transport(err)))
    }

    async fn app_command(
        &mut self,
        stage: NegotiationStage,
        rca: u16,
        tx: &mut Transaction<'_>,
    ) -> Result<(), CardError> {
        let mut prefix =
            Transaction::command(cmd::APP_CMD, CommandFlags::NONE, u32::from(rca) << 16);
        self.step(stage, &mut prefix).await?;
        self.step(stage, tx).await
    }

    fn reset_host(&mut self) -> Result<(), H::Error> {
        let input_hz = self.functional_clock_hz;
        let host = self.transport.host();
        host.soft_reset()?;
        host.reset_lines()?;
        host.set_supported_voltages(&[BusVoltage::V1_8, BusVoltage::V3_0]);
        host.set_bus_width(BusWidth::One);
        host.set_bus_voltage(BusVoltage::V3_0);
        host.power_on()?;
        host.set_bus_frequency(input_hz, IDENTIFICATION_CLOCK_HZ)?;
        host.send_init_stream()
    }

    async fn negotiate(&mut self) -> Result<CardInfo, CardError> {
        use NegotiationStage as Stage;

        self.reset_host()
            .map_err(|_| CardError::negotiation(Stage::Reset, NegotiationFailure::Host))?;

        let mut go_idle =
            Transaction::command(cmd::GO_IDLE_STATE, CommandFlags::RESPONSE_NONE, 0);
        self.step(Stage::Reset, &mut go_idle).await?;

        let mut if_cond =
            Transaction::command(cmd::SEND_IF_COND, CommandFlags::NONE, IF_COND_ARGUMENT);
        self.step(Stage::VoltageCheck, &mut if_cond).await?;

        let ocr = self.poll_ocr().await?;
        let mut info = CardInfo {
            ocr,
            high_capacity: ocr & OCR_HIGH_CAPACITY != 0,
            ..CardInfo::default()
        };

        let mut cid = Transaction::command(cmd::ALL_SEND_CID, CommandFlags::LONG_RESPONSE, 0);
        self.step(Stage::Identify, &mut cid).await?;
        info.cid = cid.response;

        let mut rca = Transaction::command(cmd::SEND_RELATIVE_ADDR, CommandFlags::NONE, 0);
        self.step(Stage::Address, &mut rca).await?;
        info.rca = u16::try_from(rca.response[0] >> 16).unwrap_or(0);
        let rca_argument = u32::from(info.rca) << 16;

        let mut csd =
            Transaction::command(cmd::SEND_CSD, CommandFlags::LONG_RESPONSE, rca_argument);
        self.step(Stage::CsdRead, &mut csd).await?;
        info.csd = csd.response;
        let geometry = geometry(&info.csd);
        info.block_size = geometry.block_size;
        info.block_count = geometry.block_count;
        info.size_kib = geometry.size_kib;
        info.tran_speed = geometry.tran_speed;

        if !info.high_capacity {
            let mut block_length =
                Transaction::command(cmd::SET_BLOCKLEN, CommandFlags::NONE, BLOCK_LENGTH);
            self.step(Stage::BlockLength, &mut block_length).await?;
            info.block_size = BLOCK_LENGTH;
        }

        let mut select = Transaction::command(cmd::SELECT_CARD, CommandFlags::BUSY, rca_argument);
        self.step(Stage::Select, &mut select).await?;

        let mut scr = [0u8; SCR_BYTES];
        {
            let mut tx = Transaction::read(acmd::SEND_SCR, 0, &mut scr, SCR_BYTES as u32);
            self.app_command(Stage::ScrRead, info.rca, &mut tx).await?;
        }
        info.scr = scr_words(&scr);
        let [scr0, _] = info.scr;
        info.version = sd_version(scr0);
        info.bus_widths = scr_bus_widths(scr0);
        info.supports_cmd23 = scr_supports_cmd23(scr0);

        let mut bus_width = Transaction::command(
            acmd::SET_BUS_WIDTH,
            CommandFlags::NONE,
            BUS_WIDTH_4BIT_ARGUMENT,
        );
        self.app_command(Stage::BusWidth, info.rca, &mut bus_width)
            .await?;
        self.transport.host().set_bus_width(BusWidth::Four);

        let mut status = [0u8; SWITCH_STATUS_BYTES];
        {
            let mut tx = Transaction::read(
                cmd::SWITCH_FUNC,
                SWITCH_HIGH_SPEED_ARGUMENT,
                &mut status,
                SWITCH_STATUS_BYTES as u32,
            );
            self.step(Stage::SwitchFunction, &mut tx).await?;
        }
        let (tran_speed, clock_hz) = if switched_to_high_speed(&status) {
            (TRAN_SPEED_50MHZ, HIGH_SPEED_CLOCK_HZ)
        } else {
            (TRAN_SPEED_25MHZ, DEFAULT_SPEED_CLOCK_HZ)
        };
        info.tran_speed = tran_speed;

        let input_hz = self.functional_clock_hz;
        if self
            .transport
            .host()
            .set_bus_frequency(input_hz, clock_hz)
            .is_err()
        {
            warn!("card clock {} Hz not applied", clock_hz);
        }

        Ok(info)
    }

    async fn poll_ocr(&mut self) -> Result<u32, CardError> {
        for _ in 0..self.ocr_poll_limit {
            let mut prefix = Transaction::command(cmd::APP_CMD, CommandFlags::NONE, 0);
            self.step(NegotiationStage::OcrPoll, &mut prefix).await?;

            let mut op_cond = Transaction::command(
                acmd::SD_SEND_OP_COND,
                CommandFlags::NONE,
                OCR_HIGH_CAPACITY | OCR_VOLTAGE_WILDCARD,
            );
            self.step(NegotiationStage::OcrPoll, &mut op_cond).await?;
            let [ocr, ..] = op_cond.response;
            if ocr & OCR_POWER_UP_DONE != 0 {
                return Ok(ocr);
            }
        }
        Err(CardError::negotiation(
            NegotiationStage::OcrPoll,
            NegotiationFailure::NotReady,
        ))
    }
}
