//! EDMA transfer path: scratch staging, cache maintenance ordering, aligned
//! reads into caller memory and bounded completion waits.
//!
//! Run with: cargo test -p card --test dma_path

#![allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::large_stack_arrays
)]

mod common;

use card::{CardError, DriveIndex, Mode};
use common::{dma_drive, pattern, pio_drive, sdhc, test_config, SCRATCH_BYTES};
use platform::dma::DmaDirection;
use platform::config::{MMCHS0, MMCHS1};
use platform::dma_safety::CacheAligned;
use platform::mocks::SimEvent;

/// Event log with the argument and address noise stripped.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Cmd(u8),
    DmaIn(usize),
    DmaOut(usize),
    Flush(usize),
    Invalidate(usize),
}

fn steps(events: &[SimEvent]) -> Vec<Step> {
    events
        .iter()
        .map(|event| match *event {
            SimEvent::Command { index, .. } => Step::Cmd(index),
            SimEvent::DmaStart {
                direction: DmaDirection::PeripheralToMemory,
                len,
                ..
            } => Step::DmaIn(len),
            SimEvent::DmaStart { len, .. } => Step::DmaOut(len),
            SimEvent::Flush { len, .. } => Step::Flush(len),
            SimEvent::Invalidate { len, .. } => Step::Invalidate(len),
        })
        .collect()
}

// ─── ordering ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn multi_block_read_invalidates_after_completion() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    let data = pattern(4, 9);
    for (n, block) in data.chunks(512).enumerate() {
        rig.card.set_block(n as u32, block.try_into().unwrap());
    }
    rig.card.clear_log();

    let mut buffer = vec![0u8; 4 * 512];
    drive.read_blocks(&mut buffer, 0).await.unwrap();

    assert_eq!(buffer, data);
    assert_eq!(
        steps(&rig.card.events()),
        [Step::Cmd(23), Step::DmaIn(2048), Step::Cmd(18), Step::Invalidate(2048)]
    );
}

#[tokio::test]
async fn multi_block_write_flushes_before_dma_starts() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();
    let data = pattern(2, 0x10);

    drive.write_blocks(&data, 40).await.unwrap();

    assert_eq!(
        steps(&rig.card.events()),
        [Step::Flush(1024), Step::Cmd(23), Step::DmaOut(1024), Step::Cmd(25)]
    );
    assert_eq!(rig.card.block(40), [0x10; 512]);
    assert_eq!(rig.card.block(41), [0x11; 512]);
}

#[tokio::test]
async fn dma_and_cache_maintenance_cover_the_same_scratch_range() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();

    let mut buffer = vec![0u8; 3 * 512];
    drive.read_blocks(&mut buffer, 0).await.unwrap();

    let events = rig.card.events();
    let dma_address = events.iter().find_map(|event| match event {
        SimEvent::DmaStart { address, .. } => Some(*address),
        _ => None,
    });
    let invalidated = events.iter().find_map(|event| match event {
        SimEvent::Invalidate { address, .. } => Some(*address),
        _ => None,
    });
    assert!(dma_address.is_some());
    assert_eq!(dma_address, invalidated);
    assert_eq!(dma_address.unwrap() % 64, 0);
}

#[tokio::test]
async fn single_blocks_bypass_dma() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();

    drive.write_blocks(&[3u8; 512], 8).await.unwrap();
    let mut block = [0u8; 512];
    drive.read_blocks(&mut block, 8).await.unwrap();

    assert_eq!(steps(&rig.card.events()), [Step::Cmd(24), Step::Cmd(17)]);
    assert_eq!(block, [3u8; 512]);
}

#[tokio::test]
async fn transfers_larger_than_scratch_are_chunked() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();
    let data = pattern(20, 0);

    drive.write_blocks(&data, 0).await.unwrap();
    let mut back = vec![0u8; data.len()];
    drive.read_blocks(&mut back, 0).await.unwrap();

    assert_eq!(back, data);
    let starts: Vec<Step> = steps(&rig.card.events())
        .into_iter()
        .filter(|step| matches!(step, Step::DmaIn(_) | Step::DmaOut(_)))
        .collect();
    assert_eq!(
        starts,
        [
            Step::DmaOut(SCRATCH_BYTES),
            Step::DmaOut(SCRATCH_BYTES),
            Step::DmaOut(2048),
            Step::DmaIn(SCRATCH_BYTES),
            Step::DmaIn(SCRATCH_BYTES),
            Step::DmaIn(2048),
        ]
    );
}

#[tokio::test]
async fn channel_is_paced_by_the_slot_request_lines() {
    for (index, identity) in [(DriveIndex::Rear, MMCHS0), (DriveIndex::Front, MMCHS1)] {
        let (drive, rig) = dma_drive(index, sdhc(), test_config());
        drive.connect(Mode::Raw).await.unwrap();

        drive.write_blocks(&pattern(2, 0), 0).await.unwrap();
        let request = rig.card.dma_request().unwrap();
        assert_eq!(request.direction, DmaDirection::MemoryToPeripheral);
        assert_eq!(request.event, identity.dma_tx_event);

        let mut buffer = vec![0u8; 2 * 512];
        drive.read_blocks(&mut buffer, 0).await.unwrap();
        let request = rig.card.dma_request().unwrap();
        assert_eq!(request.direction, DmaDirection::PeripheralToMemory);
        assert_eq!(request.event, identity.dma_rx_event);
    }
}

// ─── aligned reads ───────────────────────────────────────────────────────────

#[tokio::test]
async fn aligned_read_lands_directly_in_caller_memory() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    drive.write_blocks(&pattern(4, 0x20), 64).await.unwrap();
    rig.card.clear_log();

    let mut buffer = Box::new(CacheAligned([0u8; 4 * 512]));
    let address = buffer.0.as_ptr() as usize;
    drive.read_aligned_blocks(&mut buffer.0, 64).await.unwrap();

    assert_eq!(&buffer.0[..], &pattern(4, 0x20)[..]);
    let events = rig.card.events();
    assert!(events.contains(&SimEvent::DmaStart {
        direction: DmaDirection::PeripheralToMemory,
        address,
        len: 2048,
    }));
    assert_eq!(
        events.last(),
        Some(&SimEvent::Invalidate {
            address,
            len: 2048
        })
    );
}

#[tokio::test]
async fn aligned_single_block_uses_dma_too() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();

    let mut buffer = Box::new(CacheAligned([0u8; 512]));
    drive.read_aligned_blocks(&mut buffer.0, 0).await.unwrap();

    assert_eq!(
        steps(&rig.card.events()),
        [Step::DmaIn(512), Step::Cmd(17), Step::Invalidate(512)]
    );
}

#[tokio::test]
async fn aligned_read_rejects_misaligned_buffers() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();

    let mut buffer = Box::new(CacheAligned([0u8; 1024]));
    assert_eq!(
        drive.read_aligned_blocks(&mut buffer.0[1..513], 0).await,
        Err(CardError::Misaligned)
    );
    assert!(rig.card.events().is_empty());
}

#[tokio::test]
async fn fifo_strategy_serves_aligned_reads() {
    let (drive, rig) = pio_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.set_block(9, [0xEE; 512]);

    let mut buffer = Box::new(CacheAligned([0u8; 512]));
    drive.read_aligned_blocks(&mut buffer.0, 9).await.unwrap();

    assert_eq!(buffer.0, [0xEE; 512]);
}

// ─── completion timeout ──────────────────────────────────────────────────────

#[tokio::test]
async fn stuck_dma_times_out_and_is_counted() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.delay_dma_completion(u32::MAX);

    let mut buffer = vec![0u8; 2 * 512];
    assert_eq!(drive.read_blocks(&mut buffer, 0).await, Err(CardError::DmaTimeout));
    assert_eq!(drive.error_status().wait_timeouts, 1);

    rig.card.clear_faults();
    drive.read_blocks(&mut buffer, 0).await.unwrap();
}

#[tokio::test]
async fn one_block_over_capacity_takes_two_transactions() {
    let (drive, rig) = dma_drive(DriveIndex::Rear, sdhc(), test_config());
    drive.connect(Mode::Raw).await.unwrap();
    rig.card.clear_log();

    let blocks = SCRATCH_BYTES / 512 + 1;
    let mut buffer = vec![0u8; blocks * 512];
    drive.read_blocks(&mut buffer, 0).await.unwrap();

    assert_eq!(rig.card.commands(), [23, 18, 17]);
}
