//! Hardware Abstraction Layer (HAL) for the AM335x sampler board
//!
//! This crate provides the trait seams the SD card block I/O stack is built
//! on, so the protocol and façade code in `card` can run against the real
//! MMCHS/EDMA hardware or against the simulated card in [`mocks`].
//!
//! # Architecture Layers
//!
//! ```text
//! USB mass storage / FAT filesystem (external)
//!         ↓
//! card crate (DriveManager façade, controller, transport)
//!         ↓
//! Platform HAL (this crate - trait abstractions + AM335x MMCHS driver)
//!         ↓
//! MMCHS0/1 registers, EDMA3 channels, Cortex-A8 L1/L2 cache
//! ```
//!
//! # Abstraction Levels
//!
//! ## Controller-Level
//! - [`MmcHost`] - MMCHS host controller: clocks, power, command issue, FIFO
//! - [`MmcIrq`] - Interrupt-side SD_STAT acknowledge
//! - [`DmaChannel`] - One EDMA3 channel bound to an MMCHS request line
//! - [`CacheMaintenance`] - Flush / invalidate a buffer range
//!
//! ## Storage-Level
//! - [`BlockDevice`] - 512-byte block read/write surface
//! - [`Volume`] - Filesystem mounted on a [`BlockDevice`]
//!
//! # Features
//!
//! - `std`: Enable the host-side simulated card and mocks (for testing)
//! - `defmt`: Enable defmt derives
//!
//! # Example
//!
//! ```no_run
//! use platform::{IrqStatus, MmcHost};
//!
//! fn drain<H: MmcHost>(host: &mut H) -> IrqStatus {
//!     let status = host.interrupt_status();
//!     host.clear_interrupts(status);
//!     status
//! }
//! ```

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(unused_must_use)] // a dropped register-write Result hides a bus fault
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::print_stdout)] // log through the fmt shim in card instead
#![allow(clippy::doc_markdown)] // MMCHS/EDMA register names in docs
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(async_fn_in_trait)] // single-executor firmware, no Send bounds

#[cfg(all(feature = "std", not(test)))]
extern crate std;

pub mod am335x;
pub mod config;
pub mod dma;
pub mod dma_safety;
pub mod events;
pub mod mmc;
pub mod storage;

pub mod mocks;

// Re-export controller-level traits
pub use dma::{CacheMaintenance, DmaChannel, DmaDirection, DmaRequest, DmaTransfer};
pub use mmc::{
    BusVoltage, BusWidth, CommandFrame, CommandKind, DataDirection, DataPhase, IrqStatus, MmcHost,
    MmcIrq, ResponseKind,
};

// Re-export storage traits
pub use storage::{BlockDevice, Volume, BLOCK_SIZE};

// Re-export event plumbing
pub use events::{CardEvent, CardEventChannel, CARD_EVENT_QUEUE_DEPTH};
