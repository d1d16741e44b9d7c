//! Filesystem-facing drive-number entry points.
//!
//! Run with: cargo test -p card --test diskio

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

mod common;

use card::{DiskIo, DiskResult, DiskStatus, DriveIndex, IoctlCommand, Mode};
use common::{pattern, pio_manager, sdhc};

#[tokio::test]
async fn status_reflects_filesystem_mode_only() {
    let (drives, _rear, _front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);

    assert_eq!(disk.status(0), DiskStatus::NOT_INITIALIZED);
    drives.connect(DriveIndex::Rear, Mode::Raw).await.unwrap();
    assert_eq!(disk.status(0), DiskStatus::NOT_INITIALIZED);
    drives.connect(DriveIndex::Rear, Mode::FatFs).await.unwrap();
    assert_eq!(disk.status(0), DiskStatus::empty());
    assert_eq!(disk.status(1), DiskStatus::NOT_INITIALIZED);
}

#[tokio::test]
async fn pulled_card_reports_only_not_initialized() {
    let (drives, rear, _front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);
    rear.card.remove();

    assert_eq!(DiskStatus::all(), DiskStatus::NOT_INITIALIZED);
    assert_eq!(disk.status(0), DiskStatus::NOT_INITIALIZED);
    assert_eq!(disk.initialize(0).await, DiskStatus::NOT_INITIALIZED);
}

#[tokio::test]
async fn initialize_connects_an_idle_drive() {
    let (drives, _rear, _front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);

    assert_eq!(disk.initialize(1).await, DiskStatus::empty());
    assert_eq!(drives.mode(DriveIndex::Front), Mode::FatFs);
    // Already initialized.
    assert_eq!(disk.initialize(1).await, DiskStatus::empty());
}

#[tokio::test]
async fn initialize_leaves_raw_drive_with_usb() {
    let (drives, _rear, _front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);
    drives.connect(DriveIndex::Rear, Mode::Raw).await.unwrap();

    assert_eq!(disk.initialize(0).await, DiskStatus::NOT_INITIALIZED);
    assert_eq!(drives.mode(DriveIndex::Rear), Mode::Raw);
}

#[tokio::test]
async fn initialize_without_card_fails() {
    let (drives, rear, _front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);
    rear.card.remove();

    assert_eq!(disk.initialize(0).await, DiskStatus::NOT_INITIALIZED);
    assert_eq!(drives.mode(DriveIndex::Rear), Mode::NotConnected);
}

#[tokio::test]
async fn read_and_write_need_an_initialized_drive() {
    let (drives, _rear, _front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);
    let mut buffer = [0u8; 512];

    assert_eq!(disk.read(0, &mut buffer, 0).await, DiskResult::NotReady);
    assert_eq!(disk.write(0, &buffer, 0).await, DiskResult::NotReady);

    drives.connect(DriveIndex::Rear, Mode::Raw).await.unwrap();
    assert_eq!(disk.read(0, &mut buffer, 0).await, DiskResult::NotReady);
}

#[tokio::test]
async fn read_and_write_go_to_the_addressed_drive() {
    let (drives, rear, front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);
    disk.initialize(0).await;
    disk.initialize(1).await;
    let data = pattern(2, 0x60);

    assert_eq!(disk.write(1, &data, 10).await, DiskResult::Ok);
    let mut back = vec![0u8; data.len()];
    assert_eq!(disk.read(1, &mut back, 10).await, DiskResult::Ok);

    assert_eq!(back, data);
    assert_eq!(front.card.block(11), [0x61; 512]);
    assert_eq!(rear.card.block(11), [0; 512]);
}

#[tokio::test]
async fn card_failures_surface_as_errors() {
    let (drives, _rear, _front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);
    disk.initialize(0).await;
    let mut buffer = [0u8; 512];

    assert_eq!(disk.read(0, &mut buffer, u32::MAX).await, DiskResult::Error);
    assert_eq!(disk.read(0, &mut buffer[..100], 0).await, DiskResult::Error);
}

#[tokio::test]
async fn ioctl_reports_geometry() {
    let (drives, _rear, _front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);

    assert_eq!(disk.ioctl(0, IoctlCommand::Sync), (DiskResult::NotReady, None));

    disk.initialize(0).await;
    assert_eq!(disk.ioctl(0, IoctlCommand::Sync), (DiskResult::Ok, None));
    assert_eq!(disk.ioctl(0, IoctlCommand::GetBlockSize), (DiskResult::Ok, Some(1)));
    assert_eq!(disk.ioctl(0, IoctlCommand::GetSectorSize), (DiskResult::Ok, Some(512)));
    assert_eq!(
        disk.ioctl(0, IoctlCommand::GetSectorCount),
        (DiskResult::Ok, Some(16 * 1024))
    );
}

#[tokio::test]
async fn unknown_drive_numbers_are_rejected() {
    let (drives, _rear, _front) = pio_manager(sdhc(), sdhc());
    let disk = DiskIo::new(&drives);
    let mut buffer = [0u8; 512];

    assert_eq!(disk.status(2), DiskStatus::NOT_INITIALIZED);
    assert_eq!(disk.initialize(7).await, DiskStatus::NOT_INITIALIZED);
    assert_eq!(disk.read(2, &mut buffer, 0).await, DiskResult::ParameterError);
    assert_eq!(disk.write(2, &buffer, 0).await, DiskResult::ParameterError);
    assert_eq!(
        disk.ioctl(2, IoctlCommand::Sync),
        (DiskResult::ParameterError, None)
    );
}
