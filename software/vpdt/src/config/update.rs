//! In-field firmware update, layered on the config protocol's
//! request/reply primitive.
//!
//! The sequence is strictly serial: unlock, hash verification, erase,
//! program, checkout. Any phase reporting a non-zero status halts the
//! whole update; no rollback is attempted, so a failed update leaves
//! the device in whatever state the last successful step produced.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use vpdt_shared::control::{
    ByteStruct, ByteStructLen, CHECKOUT_TOKEN, HASH_KIND_CRC32, PAGE_LEN, PageSubHeader,
    UNLOCK_TOKEN, UPDATE_CHECKOUT, UPDATE_HASH, UPDATE_UNLOCK, UpdateHashCommand,
};
use vpdt_shared::frame::{ConfigKind, Mac};

use crate::error::{Error, Result};

use super::{ConfigHub, DetectorConfig, page_predicate};

/// Round-trip window for short update commands.
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Hash verification may scan existing flash on the device.
const HASH_TIMEOUT: Duration = Duration::from_secs(60);

const ERASE_TIMEOUT: Duration = Duration::from_millis(1500);
const PROGRAM_TIMEOUT: Duration = Duration::from_millis(500);

/// Erase granularities, largest first: (block-select bit, block bytes).
const ERASE_BLOCKS: [(u16, usize); 2] = [(1, 64 * 1024), (0, 4 * 1024)];

/// Phases of one update session, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdatePhase {
    Unlock,
    Hash,
    Erase,
    Program,
    Checkout,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePhase::Unlock => "unlock",
            UpdatePhase::Hash => "hash",
            UpdatePhase::Erase => "erase",
            UpdatePhase::Program => "program",
            UpdatePhase::Checkout => "checkout",
        };
        f.write_str(name)
    }
}

/// An update session halted, naming the phase that failed.
#[derive(Debug, thiserror::Error)]
#[error("firmware update failed during {phase}: {source}")]
pub struct UpdateError {
    pub phase: UpdatePhase,
    pub source: Error,
}

/// One firmware update session, bound to a device's config identity.
/// Holds no state besides that identity; the outcome of each phase is
/// its return value.
pub struct FirmwareUpdater {
    mac: Mac,
}

impl FirmwareUpdater {
    pub fn new(config: &DetectorConfig) -> Self {
        Self { mac: config.mac() }
    }

    pub fn for_mac(mac: Mac) -> Self {
        Self { mac }
    }

    fn name(&self) -> String {
        self.mac.to_string()
    }

    /// Run the whole sequence, halting on the first failed phase.
    pub fn run(&self, hub: &ConfigHub, image: &[u8]) -> std::result::Result<(), UpdateError> {
        let phase = |phase: UpdatePhase| move |source| UpdateError { phase, source };
        self.unlock(hub).map_err(phase(UpdatePhase::Unlock))?;
        self.verify_hash(hub, image)
            .map_err(phase(UpdatePhase::Hash))?;
        self.erase(hub, image.len())
            .map_err(phase(UpdatePhase::Erase))?;
        self.program(hub, image)
            .map_err(phase(UpdatePhase::Program))?;
        self.checkout(hub).map_err(phase(UpdatePhase::Checkout))?;
        info!("device({}) firmware update complete", self.name());
        Ok(())
    }

    /// Unlock the device flash for modification.
    pub fn unlock(&self, hub: &ConfigHub) -> Result<()> {
        self.command(hub, UPDATE_UNLOCK, UNLOCK_TOKEN, "flash unlock", COMMAND_TIMEOUT)
    }

    /// Send image length and CRC32 for device-side verification.
    pub fn verify_hash(&self, hub: &ConfigHub, image: &[u8]) -> Result<()> {
        let crc = crc32fast::hash(image);
        debug!("device({}) image crc32 {crc:08x}", self.name());
        let mut command = UpdateHashCommand {
            flag: 0,
            command: UPDATE_HASH,
            image_len: image.len() as u32,
            hash_kind: HASH_KIND_CRC32,
            hash: [0_u8; 20],
        };
        command.hash[..4].copy_from_slice(&crc.to_le_bytes());
        let mut payload = vec![0_u8; UpdateHashCommand::BYTE_LEN];
        command.write_bytes(&mut payload);
        self.exchange(
            hub,
            ConfigKind::UpdateCommand,
            payload,
            UPDATE_HASH,
            "hash verification",
            HASH_TIMEOUT,
        )
    }

    /// Erase the image's address span, 64 KiB blocks first, then 4 KiB
    /// blocks for the remaining tail.
    pub fn erase(&self, hub: &ConfigHub, image_len: usize) -> Result<()> {
        info!("device({}) erasing flash", self.name());
        let schedule = erase_schedule(image_len);
        let mut next_progress = 0;
        for (done, &(ctr, page)) in schedule.iter().enumerate() {
            let progress = done * 100 / schedule.len();
            if progress >= next_progress {
                info!("device({}) erased: {progress}%", self.name());
                next_progress = progress + 10;
            }
            self.exchange(
                hub,
                ConfigKind::UpdateData,
                PageSubHeader::new(ctr, page).to_bytes().to_vec(),
                page,
                &format!("erase at page {page}"),
                ERASE_TIMEOUT,
            )?;
        }
        info!("device({}) flash erased", self.name());
        Ok(())
    }

    /// Program the image in individually acknowledged 256-byte pages;
    /// the final partial page is padded with 0xFF.
    pub fn program(&self, hub: &ConfigHub, image: &[u8]) -> Result<()> {
        info!("device({}) programming flash", self.name());
        let mut next_progress = 0;
        for (page, chunk) in image.chunks(PAGE_LEN).enumerate() {
            let progress = page * PAGE_LEN * 100 / image.len();
            if progress >= next_progress {
                info!("device({}) programmed: {progress}%", self.name());
                next_progress = progress + 10;
            }
            let page = page as u16;
            let mut payload = PageSubHeader::new(0, page).to_bytes().to_vec();
            payload.extend_from_slice(chunk);
            payload.resize(PageSubHeader::BYTE_LEN + PAGE_LEN, 0xFF);
            self.exchange(
                hub,
                ConfigKind::UpdateData,
                payload,
                page,
                &format!("program of page {page}"),
                PROGRAM_TIMEOUT,
            )?;
        }
        info!("device({}) flash programmed", self.name());
        Ok(())
    }

    /// Switch the active image to the freshly programmed one.
    pub fn checkout(&self, hub: &ConfigHub) -> Result<()> {
        self.command(
            hub,
            UPDATE_CHECKOUT,
            CHECKOUT_TOKEN,
            "image checkout",
            COMMAND_TIMEOUT,
        )
    }

    fn command(
        &self,
        hub: &ConfigHub,
        command: u16,
        token: &[u8],
        what: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut payload = PageSubHeader::new(0, command).to_bytes().to_vec();
        payload.extend_from_slice(token);
        self.exchange(hub, ConfigKind::UpdateCommand, payload, command, what, timeout)
    }

    /// One acknowledged exchange: the reply must echo the request's
    /// page/command slot, and a non-zero status halts the session.
    fn exchange(
        &self,
        hub: &ConfigHub,
        kind: ConfigKind,
        payload: Vec<u8>,
        echo: u16,
        what: &str,
        timeout: Duration,
    ) -> Result<()> {
        debug!("device({}) sending {what}", self.name());
        let entry = hub.transact(
            self.mac,
            u32::from(kind),
            payload,
            page_predicate(echo),
            timeout,
        )?;
        let sub = PageSubHeader::read_bytes(&entry.payload[..PageSubHeader::BYTE_LEN]);
        if sub.flag != 0 {
            warn!(
                "device({}) {what} failed with status {}",
                self.name(),
                sub.flag
            );
            return Err(Error::action(what, sub.flag));
        }
        debug!("device({}) {what} acknowledged", self.name());
        Ok(())
    }
}

/// Expand an image length into the (block-select, page-index) erase
/// exchanges covering it, top-down across the two block granularities.
fn erase_schedule(image_len: usize) -> Vec<(u16, u16)> {
    let smallest = ERASE_BLOCKS[ERASE_BLOCKS.len() - 1].1;
    let mut remaining = image_len + smallest - 1;
    let mut page: u16 = 0;
    let mut schedule = Vec::new();
    for (bit, size) in ERASE_BLOCKS {
        while remaining >= size {
            schedule.push((1 << bit, page));
            remaining -= size;
            page += (size / PAGE_LEN) as u16;
        }
    }
    schedule
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::testutil::{ConfigOp, FakeConfigDetector, config_hub_for};

    const MAC: Mac = Mac([0x10, 0x20, 0x30, 0, 0, 7]);

    #[test]
    fn erase_schedule_covers_the_image() {
        // A 10,000-byte image needs no 64 KiB blocks and three 4 KiB
        // blocks; pages advance by 16 per 4 KiB block.
        assert_eq!(erase_schedule(10_000), vec![(1, 0), (1, 16), (1, 32)]);

        // 200,000 bytes: three 64 KiB blocks then one 4 KiB for the tail.
        assert_eq!(
            erase_schedule(200_000),
            vec![(2, 0), (2, 256), (2, 512), (1, 768)]
        );

        assert!(erase_schedule(0).is_empty());
    }

    #[test]
    fn full_update_runs_all_phases() {
        crate::testutil::init_test_logging();
        let device = FakeConfigDetector::spawn(MAC, BTreeMap::new());
        let hub = config_hub_for(&device);
        hub.listen().unwrap();

        let image: Vec<u8> = (0..10_000_u32).map(|i| i as u8).collect();
        let updater = FirmwareUpdater::for_mac(MAC);
        updater.run(&hub, &image).unwrap();

        let ops = device.ops();
        assert_eq!(ops[0], ConfigOp::Command { kind: UPDATE_UNLOCK });
        assert_eq!(ops[1], ConfigOp::Command { kind: UPDATE_HASH });
        let erases: Vec<_> = ops
            .iter()
            .filter(|op| matches!(op, ConfigOp::Erase { .. }))
            .collect();
        assert_eq!(erases.len(), 3);
        let programs: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                ConfigOp::Program { page } => Some(*page),
                _ => None,
            })
            .collect();
        // 10,000 bytes in 40 acknowledged 256-byte pages
        assert_eq!(programs, (0..40).collect::<Vec<u16>>());
        assert_eq!(
            ops.last(),
            Some(&ConfigOp::Command {
                kind: UPDATE_CHECKOUT
            })
        );
    }

    #[test]
    fn rejected_page_halts_the_session() {
        let device = FakeConfigDetector::spawn(MAC, BTreeMap::new());
        device.fail_program_at(3);
        let hub = config_hub_for(&device);
        hub.listen().unwrap();

        let image = vec![0x5A_u8; 2048];
        let err = FirmwareUpdater::for_mac(MAC)
            .run(&hub, &image)
            .unwrap_err();
        assert_eq!(err.phase, UpdatePhase::Program);
        assert!(matches!(err.source, Error::Action { flag: 1, .. }));
        assert!(err.source.to_string().contains("page 3"));

        // Nothing past the rejected page was attempted.
        let programs: Vec<_> = device
            .ops()
            .iter()
            .filter_map(|op| match op {
                ConfigOp::Program { page } => Some(*page),
                _ => None,
            })
            .collect();
        assert_eq!(programs, vec![0, 1, 2, 3]);
    }
}
