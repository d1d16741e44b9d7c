//! Card mount/unmount notifications for the USB mass-storage layer.
//!
//! The card stack only pushes; the USB task drains the channel. A full
//! queue drops the newest event.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

/// Queue depth for [`CardEventChannel`].
pub const CARD_EVENT_QUEUE_DEPTH: usize = 8;

/// A card became visible to, or disappeared from, the USB host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardEvent {
    /// Rear slot switched to raw (USB-exposed) mode.
    UsbRearCardMount,
    /// Rear slot left raw mode.
    UsbRearCardUnmount,
    /// Front slot switched to raw (USB-exposed) mode.
    UsbFrontCardMount,
    /// Front slot left raw mode.
    UsbFrontCardUnmount,
}

/// Channel carrying [`CardEvent`]s from the card stack to the USB task.
pub type CardEventChannel = Channel<CriticalSectionRawMutex, CardEvent, CARD_EVENT_QUEUE_DEPTH>;
