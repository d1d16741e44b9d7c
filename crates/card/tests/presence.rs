//! Card presence checks: probing an open or closed controller, handling a
//! pulled card, and staying out of the way of a transfer in flight.
//!
//! Run with: cargo test -p card --test presence

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

mod common;

use card::{DriveIndex, Mode};
use common::{dma_drive, pattern, pio_drive, sdhc, test_config};
use embassy_futures::join::join;
use embassy_futures::yield_now;
use platform::mocks::SimEvent;
use platform::CardEvent;

// ─── open controller ─────────────────────────────────────────────────────────

#[tokio::test]
async fn open_card_answers_status_request() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();

    assert!(drive.is_present().await);

    assert_eq!(
        rig.card.events(),
        [SimEvent::Command {
            index: 13,
            argument: 0xAAAA << 16,
            app: false
        }]
    );
    assert_eq!(drive.mode(), Mode::Raw);
}

#[tokio::test]
async fn pulled_raw_card_is_withdrawn_from_usb() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.remove();

    assert!(!drive.is_present().await);

    assert_eq!(drive.mode(), Mode::NotConnected);
    assert!(!drive.is_connected());
    assert_eq!(drive.info(), None);
    assert_eq!(
        rig.drain_events(),
        [CardEvent::UsbRearCardMount, CardEvent::UsbRearCardUnmount]
    );
}

#[tokio::test]
async fn pulled_filesystem_card_drops_to_not_connected() {
    let (drive, rig) = pio_drive(DriveIndex::Front, sdhc(), test_config());
    drive.connect(Mode::FatFs).await.unwrap();
    rig.card.remove();

    assert!(!drive.is_present().await);

    assert_eq!(drive.mode(), Mode::NotConnected);
    assert!(rig.drain_events().is_empty());
}

#[tokio::test]
async fn unresponsive_card_counts_as_gone() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.hang_command(13);

    assert!(!drive.is_present().await);

    assert_eq!(drive.error_status().wait_timeouts, 1);
    assert_eq!(drive.mode(), Mode::NotConnected);
}

// ─── closed controller ───────────────────────────────────────────────────────

#[tokio::test]
async fn closed_drive_probes_by_opening_and_closing() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());

    assert!(drive.is_present().await);

    assert_eq!(rig.card.command_count(0), 1);
    assert!(!drive.is_connected(), "probe must not leave the card open");
    assert_eq!(drive.mode(), Mode::NotConnected);
}

#[tokio::test]
async fn closed_drive_without_card_is_absent() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    rig.card.remove();

    assert!(!drive.is_present().await);
    assert!(!drive.is_connected());
}

#[tokio::test]
async fn reinserted_card_can_be_connected_again() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.remove();
    assert!(!drive.is_present().await);

    rig.card.insert();
    assert!(drive.is_present().await);
    drive.connect(Mode::Raw).await.unwrap();

    assert!(drive.is_connected());
}

// ─── concurrency with transfers ──────────────────────────────────────────────

#[tokio::test]
async fn busy_drive_is_reported_present_without_probing() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();
    rig.card.delay_dma_completion(50);

    let mut buffer = vec![0u8; 4 * 512];
    let transfer = drive.read_blocks(&mut buffer, 0);
    let probe = async {
        while rig.card.command_count(18) == 0 {
            yield_now().await;
        }
        drive.is_present().await
    };
    let (transferred, present) = join(transfer, probe).await;

    transferred.unwrap();
    assert!(present);
    assert_eq!(rig.card.command_count(13), 0);
}

#[tokio::test]
async fn presence_check_slots_in_between_chunks() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();
    let data = pattern(16, 0);

    let transfer = drive.write_blocks(&data, 0);
    let probe = async {
        while rig.card.command_count(25) == 0 {
            yield_now().await;
        }
        drive.is_present().await
    };
    let (transferred, present) = join(transfer, probe).await;

    transferred.unwrap();
    assert!(present);
    assert_eq!(rig.card.commands(), [23, 25, 13, 23, 25]);
}
