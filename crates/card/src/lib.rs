//! SD card block I/O for the AM335x sampler board.
//!
//! Two SD slots (rear on MMCHS0, front on MMCHS1) are exposed as 512-byte
//! block devices, either to the USB host as raw storage or to the local FAT
//! filesystem. The stack is layered bottom-up:
//!
//! ```text
//! DriveManager / DiskIo      per-slot façade, modes, retries, diskio
//!         ↓
//! Drive                      locking, chunking, activity LED, events
//!         ↓
//! BlockTransfer (Pio | Dma)  FIFO or EDMA data phases, cache maintenance
//!         ↓
//! CardController             negotiation, card registers, addressing
//!         ↓
//! Transport                  one command at a time, interrupt-driven waits
//!         ↓
//! platform::MmcHost          MMCHS registers (or the simulated card)
//! ```
//!
//! Every wait is bounded by [`CardConfig::wait_timeout`]; expiries are
//! counted per controller and reported by
//! [`DriveManager::print_error_status`].
//!
//! # Features
//!
//! - `defmt`: log through defmt (target builds)
//! - `tracing`: log through tracing (host builds)
//!
//! # Example
//!
//! ```no_run
//! use card::{CardError, DriveIndex, DriveManager, Mode};
//! # use card::BlockTransfer;
//! # use embedded_hal::digital::OutputPin;
//! # use platform::{MmcHost, Volume};
//!
//! async fn copy_first_block<H, T, V, L>(
//!     drives: &DriveManager<'_, H, T, V, L>,
//! ) -> Result<[u8; 512], CardError>
//! where
//!     H: MmcHost,
//!     T: BlockTransfer,
//!     V: Volume,
//!     L: OutputPin,
//! {
//!     drives.connect(DriveIndex::Rear, Mode::Raw).await?;
//!     let mut block = [0u8; 512];
//!     drives.read_blocks(DriveIndex::Rear, &mut block, 0).await?;
//!     Ok(block)
//! }
//! ```

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(unused_must_use)]
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(async_fn_in_trait)] // Embassy no_std: single-threaded, Send bounds not needed

#[macro_use]
mod fmt;

pub mod config;
pub mod controller;
pub mod diskio;
pub mod drive;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod transfer;
pub mod transport;

pub use config::CardConfig;
pub use controller::CardController;
pub use diskio::{DiskIo, DiskResult, DiskStatus, IoctlCommand};
pub use drive::{ActivityLed, Drive, DriveDisk, DriveIndex, ErrorStatus, Mode};
pub use error::{CardError, NegotiationFailure, NegotiationStage, TransportError};
pub use manager::DriveManager;
pub use protocol::CardInfo;
pub use transfer::{BlockTransfer, Dma, Pio};
pub use transport::{ControllerShared, Transport};
