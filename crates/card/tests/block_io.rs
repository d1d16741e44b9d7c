//! Block reads and writes through the FIFO strategy: chunking, addressing,
//! argument checks and the activity LED.
//!
//! Run with: cargo test -p card --test block_io

#![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::arithmetic_side_effects)]

mod common;

use card::{CardError, DriveIndex, Mode, TransportError};
use common::{pattern, pio_drive, sdhc, test_config, CHUNK_BLOCKS};
use platform::mocks::CardProfile;

// ─── happy path ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn written_blocks_read_back() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    let data = pattern(3, 0x40);

    drive.write_blocks(&data, 100).await.unwrap();
    let mut back = vec![0u8; data.len()];
    drive.read_blocks(&mut back, 100).await.unwrap();

    assert_eq!(back, data);
    assert_eq!(rig.card.block(102), [0x42; 512]);
}

#[tokio::test]
async fn single_block_uses_single_block_commands() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();

    drive.write_blocks(&[7u8; 512], 5).await.unwrap();
    let mut block = [0u8; 512];
    drive.read_blocks(&mut block, 5).await.unwrap();

    assert_eq!(rig.card.commands(), [24, 17]);
    assert_eq!(block, [7u8; 512]);
}

#[tokio::test]
async fn multi_block_chunks_are_preceded_by_block_count() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();

    let mut buffer = vec![0u8; 4 * 512];
    drive.read_blocks(&mut buffer, 0).await.unwrap();

    assert_eq!(rig.card.commands(), [23, 18]);
}

#[tokio::test]
async fn large_requests_are_split_into_chunks() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();
    let blocks = 2 * CHUNK_BLOCKS + 1;
    let data = pattern(blocks, 1);

    drive.write_blocks(&data, 1000).await.unwrap();

    // Two full chunks, then a single block.
    assert_eq!(rig.card.commands(), [23, 25, 23, 25, 24]);
    for block in 0..blocks {
        let expected = [(block as u8).wrapping_add(1); 512];
        assert_eq!(rig.card.block(1000 + block as u32), expected, "block {block}");
    }
}

#[tokio::test]
async fn cards_without_cmd23_skip_block_count() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, CardProfile::sdsc(7, 0, 9), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    assert!(!drive.supports_set_block_count());
    rig.card.clear_log();

    let mut buffer = vec![0u8; 2 * 512];
    drive.read_blocks(&mut buffer, 0).await.unwrap();

    assert_eq!(rig.card.commands(), [18]);
}

#[tokio::test]
async fn byte_addressed_cards_get_byte_offsets() {
    // (7 + 1) * 2^2 * 512 bytes = 32 blocks.
    let (drive, rig) = pio_drive(DriveIndex::Rear, CardProfile::sdsc(7, 0, 9), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    assert!(!drive.is_high_capacity());
    assert_eq!(drive.size_in_blocks(), 32);
    rig.card.clear_log();

    drive.write_blocks(&[0x5Au8; 512], 3).await.unwrap();

    let argument = rig.card.events().iter().find_map(|event| match event {
        platform::mocks::SimEvent::Command {
            index: 24,
            argument,
            ..
        } => Some(*argument),
        _ => None,
    });
    assert_eq!(argument, Some(3 * 512));
    assert_eq!(rig.card.block(3), [0x5A; 512]);
}

// ─── argument checks ─────────────────────────────────────────────────────────

#[tokio::test]
async fn transfers_need_a_connected_drive() {
    let (drive, _rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    let mut buffer = [0u8; 512];

    assert_eq!(drive.read_blocks(&mut buffer, 0).await, Err(CardError::NotConnected));
    assert_eq!(drive.write_blocks(&buffer, 0).await, Err(CardError::NotConnected));
}

#[tokio::test]
async fn partial_blocks_are_rejected() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();
    let mut buffer = [0u8; 700];

    assert_eq!(drive.read_blocks(&mut buffer, 0).await, Err(CardError::InvalidLength));
    assert_eq!(drive.write_blocks(&buffer, 0).await, Err(CardError::InvalidLength));
    assert!(rig.card.commands().is_empty());
}

#[tokio::test]
async fn empty_transfers_succeed_without_touching_the_card() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());

    assert_eq!(drive.read_blocks(&mut [], 0).await, Ok(()));
    assert_eq!(drive.write_blocks(&[], 0).await, Ok(()));
    assert!(rig.card.commands().is_empty());
    assert_eq!(rig.led.times_switched_on(), 0);
}

#[tokio::test]
async fn reads_past_the_end_fail() {
    let (drive, _rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    let last = drive.size_in_blocks() - 1;
    let mut buffer = vec![0u8; 2 * 512];

    assert_eq!(
        drive.read_blocks(&mut buffer, last).await,
        Err(CardError::Transport(TransportError::DataTransferTimeout))
    );
    // The controller stays usable.
    drive.read_blocks(&mut buffer[..512], last).await.unwrap();
}

#[tokio::test]
async fn closed_controller_mid_request_reports_not_connected() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.remove();
    // Presence check closes the controller behind the caller's back.
    assert!(!drive.is_present().await);

    let mut buffer = [0u8; 512];
    assert_eq!(drive.read_blocks(&mut buffer, 0).await, Err(CardError::NotConnected));
}

// ─── activity LED ────────────────────────────────────────────────────────────

#[tokio::test]
async fn led_is_lit_once_per_request_and_left_off() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();

    drive.write_blocks(&pattern(3 * CHUNK_BLOCKS, 0), 0).await.unwrap();
    let mut block = [0u8; 512];
    drive.read_blocks(&mut block, 0).await.unwrap();

    assert_eq!(rig.led.times_switched_on(), 2);
    assert!(!rig.led.is_on());
}

#[tokio::test]
async fn led_is_switched_off_after_a_failure() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    let mut buffer = [0u8; 512];

    assert!(drive.read_blocks(&mut buffer, u32::MAX).await.is_err());
    assert_eq!(rig.led.times_switched_on(), 1);
    assert!(!rig.led.is_on());
}
