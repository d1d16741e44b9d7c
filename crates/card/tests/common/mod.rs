//! Shared rig for the card integration tests: one simulated card per slot,
//! wired into a [`Drive`] with either the FIFO or the DMA strategy.

#![allow(dead_code, clippy::cast_possible_truncation, clippy::large_stack_arrays)]

use card::{ActivityLed, CardConfig, ControllerShared, Dma, Drive, DriveIndex, DriveManager, Pio};
use embassy_time::Duration;
use platform::dma_safety::CacheAligned;
use platform::mocks::{CardProfile, MockCache, MockDma, MockHost, MockLed, MockVolume, SimCard};
use platform::{CardEvent, CardEventChannel};

/// Scratch size used by the DMA rigs: 8 blocks per chunk.
pub const SCRATCH_BYTES: usize = 4096;

/// Blocks per chunk for both strategies.
pub const CHUNK_BLOCKS: usize = SCRATCH_BYTES / 512;

pub type PioDrive = Drive<'static, MockHost, Pio<CHUNK_BLOCKS>, MockVolume, MockLed>;
pub type DmaStrategy = Dma<'static, MockDma, MockCache, SCRATCH_BYTES>;
pub type DmaDrive = Drive<'static, MockHost, DmaStrategy, MockVolume, MockLed>;

/// Everything a test inspects next to the drive itself.
pub struct Rig {
    pub card: SimCard,
    pub led: MockLed,
    pub shared: &'static ControllerShared,
    pub events: &'static CardEventChannel,
}

impl Rig {
    fn new(profile: CardProfile) -> (Self, &'static ActivityLed<MockLed>) {
        let led = MockLed::new();
        let activity: &'static ActivityLed<MockLed> =
            Box::leak(Box::new(ActivityLed::new(led.clone())));
        let rig = Self {
            card: SimCard::new(profile),
            led,
            shared: Box::leak(Box::new(ControllerShared::new())),
            events: Box::leak(Box::new(CardEventChannel::new())),
        };
        (rig, activity)
    }

    /// Every event queued so far, oldest first.
    pub fn drain_events(&self) -> Vec<CardEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_receive() {
            events.push(event);
        }
        events
    }
}

/// Short waits so failure paths finish quickly.
pub fn test_config() -> CardConfig {
    CardConfig {
        wait_timeout: Duration::from_millis(20),
        ocr_poll_limit: 16,
        ..CardConfig::default()
    }
}

/// A 1 GiB-ish SDHC card (16 Ki blocks keeps the sim small).
pub fn sdhc() -> CardProfile {
    CardProfile::sdhc(15)
}

/// Drive on `index` moving data through the FIFO.
pub fn pio_drive(index: DriveIndex, profile: CardProfile, config: CardConfig) -> (PioDrive, Rig) {
    let (rig, activity) = Rig::new(profile);
    let drive = Drive::new(
        index,
        rig.card.host(),
        Pio::<CHUNK_BLOCKS>,
        MockVolume::new(),
        rig.shared,
        activity,
        rig.events,
        config,
    );
    (drive, rig)
}

/// Drive on `index` moving multi-block chunks by DMA.
pub fn dma_drive(index: DriveIndex, profile: CardProfile, config: CardConfig) -> (DmaDrive, Rig) {
    let (rig, activity) = Rig::new(profile);
    let scratch: &'static mut CacheAligned<[u8; SCRATCH_BYTES]> =
        Box::leak(Box::new(CacheAligned([0u8; SCRATCH_BYTES])));
    let strategy = Dma::new(rig.card.dma(), rig.card.cache(), scratch);
    let drive = Drive::new(
        index,
        rig.card.host(),
        strategy,
        MockVolume::new(),
        rig.shared,
        activity,
        rig.events,
        config,
    );
    (drive, rig)
}

/// Both slots on the FIFO strategy.
pub fn pio_manager(
    rear: CardProfile,
    front: CardProfile,
) -> (
    DriveManager<'static, MockHost, Pio<CHUNK_BLOCKS>, MockVolume, MockLed>,
    Rig,
    Rig,
) {
    let (rear_drive, rear_rig) = pio_drive(DriveIndex::Rear, rear, test_config());
    let (front_drive, front_rig) = pio_drive(DriveIndex::Front, front, test_config());
    (
        DriveManager::new(rear_drive, front_drive).unwrap(),
        rear_rig,
        front_rig,
    )
}

/// `blocks` blocks, each filled with its own sector number plus `seed`.
pub fn pattern(blocks: usize, seed: u8) -> Vec<u8> {
    (0..blocks)
        .flat_map(|block| {
            let fill = (block as u8).wrapping_add(seed);
            std::iter::repeat(fill).take(512)
        })
        .collect()
}
