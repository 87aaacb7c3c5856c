//! Ping-pong wear-leveled flash storage for weight shards.
//!
//! Each shard id owns two consecutive slots; every write lands in the slot
//! the previous write did not, so a power cut at any instant leaves at least
//! one readable copy. A 12-byte sector header carries a magic constant, a
//! monotonic write count, the shard id, and valid/active flags. The write
//! count of a new record is one past the pair's maximum, so wear strictly
//! increases and the both-valid tie-break is always decidable.
//!
//! A slot spans two 4 KiB erase sectors: a full record is 12 header bytes
//! plus the 4096-byte shard image, which does not fit a single erase unit.

use core::fmt;

use crate::config::{TOTAL_MODEL_SHARDS, WEIGHT_SHARD_SIZE};
use crate::hal::{FlashError, SectorFlash};
use crate::shard::{self, WeightShard};

/// Flash erase unit.
pub const FLASH_SECTOR_SIZE: u32 = 4096;

/// One ping-pong copy: sector header + shard image, rounded up to the next
/// erase boundary.
pub const SLOT_SIZE: u32 = 2 * FLASH_SECTOR_SIZE;

/// Base of the weight region, after the firmware image.
pub const FLASH_WEIGHT_BASE: u32 = 0x40000;

/// Whole weight region: 64 shards, two slots each.
pub const FLASH_REGION_SIZE: usize = TOTAL_MODEL_SHARDS * 2 * SLOT_SIZE as usize;

/// "PLN\x01"; identifies a formatted sector.
pub const SECTOR_MAGIC: u32 = 0x504C_4E01;

/// Sector header size on flash.
pub const SECTOR_HEADER_SIZE: usize = 12;

/// Flash page granularity used for shard image transfers.
const PAGE: usize = 256;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectorFlags: u8 {
        const VALID  = 0b01;
        const ACTIVE = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    pub magic: u32,
    pub write_count: u32,
    pub shard_id: u16,
    pub flags: SectorFlags,
}

impl SectorHeader {
    pub fn pack(&self) -> [u8; SECTOR_HEADER_SIZE] {
        let mut out = [0u8; SECTOR_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.write_count.to_le_bytes());
        out[8..10].copy_from_slice(&self.shard_id.to_le_bytes());
        out[10] = self.flags.bits();
        // out[11] reserved
        out
    }

    pub fn unpack(bytes: &[u8; SECTOR_HEADER_SIZE]) -> Self {
        SectorHeader {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            write_count: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            shard_id: u16::from_le_bytes([bytes[8], bytes[9]]),
            flags: SectorFlags::from_bits_truncate(bytes[10]),
        }
    }

    fn is_valid(&self) -> bool {
        self.magic == SECTOR_MAGIC && self.flags.contains(SectorFlags::VALID)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// Neither slot of the pair holds a valid record.
    NoValidSector,
    /// The stored record does not belong to the requested shard id.
    WrongShard,
    /// The stored shard failed its CRC.
    Corrupt,
    Flash(FlashError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NoValidSector => f.write_str("no valid sector"),
            StoreError::WrongShard => f.write_str("record belongs to another shard"),
            StoreError::Corrupt => f.write_str("stored shard failed CRC"),
            StoreError::Flash(e) => write!(f, "flash driver: {e}"),
        }
    }
}

impl From<FlashError> for StoreError {
    fn from(e: FlashError) -> Self {
        StoreError::Flash(e)
    }
}

/// Shard persistence over a [`SectorFlash`] region.
#[derive(Debug, Clone, Copy)]
pub struct ShardStore {
    base: u32,
}

impl Default for ShardStore {
    fn default() -> Self {
        ShardStore {
            base: FLASH_WEIGHT_BASE,
        }
    }
}

impl ShardStore {
    pub fn with_base(base: u32) -> Self {
        ShardStore { base }
    }

    fn pair_base(&self, shard_id: u8) -> u32 {
        self.base + shard_id as u32 * 2 * SLOT_SIZE
    }

    fn read_header<F: SectorFlash>(
        &self,
        flash: &mut F,
        addr: u32,
    ) -> Result<SectorHeader, FlashError> {
        let mut buf = [0u8; SECTOR_HEADER_SIZE];
        flash.read(addr, &mut buf)?;
        Ok(SectorHeader::unpack(&buf))
    }

    /// Locate the active slot for a shard id.
    ///
    /// Selection: neither valid -> none; exactly one valid -> it; both valid
    /// with exactly one active -> it; otherwise the higher write count.
    pub fn find_active<F: SectorFlash>(&self, flash: &mut F, shard_id: u8) -> Option<u32> {
        let base = self.pair_base(shard_id);
        let hdr0 = self.read_header(flash, base).ok()?;
        let hdr1 = self.read_header(flash, base + SLOT_SIZE).ok()?;

        match (hdr0.is_valid(), hdr1.is_valid()) {
            (false, false) => None,
            (true, false) => Some(base),
            (false, true) => Some(base + SLOT_SIZE),
            (true, true) => {
                let active0 = hdr0.flags.contains(SectorFlags::ACTIVE);
                let active1 = hdr1.flags.contains(SectorFlags::ACTIVE);
                if active0 != active1 {
                    Some(if active0 { base } else { base + SLOT_SIZE })
                } else if hdr0.write_count >= hdr1.write_count {
                    Some(base)
                } else {
                    Some(base + SLOT_SIZE)
                }
            }
        }
    }

    /// Write a shard into the slot opposite the currently active one, then
    /// clear the old slot's active bit in place (no erase).
    pub fn write<F: SectorFlash>(
        &self,
        flash: &mut F,
        shard: &WeightShard,
    ) -> Result<(), StoreError> {
        let shard_id = shard.header.shard_id;
        let base = self.pair_base(shard_id);
        let active = self.find_active(flash, shard_id);

        let target = match active {
            Some(addr) if addr == base => base + SLOT_SIZE,
            Some(_) => base,
            None => base,
        };

        // Wear count: one past the pair-wide maximum so it strictly
        // increases no matter which slot took the last write.
        let count_of = |hdr: Result<SectorHeader, FlashError>| match hdr {
            Ok(h) if h.magic == SECTOR_MAGIC => h.write_count,
            _ => 0,
        };
        let c0 = count_of(self.read_header(flash, base));
        let c1 = count_of(self.read_header(flash, base + SLOT_SIZE));
        let write_count = c0.max(c1) + 1;

        flash.erase_sector(target)?;
        flash.erase_sector(target + FLASH_SECTOR_SIZE)?;

        let header = SectorHeader {
            magic: SECTOR_MAGIC,
            write_count,
            shard_id: shard_id as u16,
            flags: SectorFlags::VALID | SectorFlags::ACTIVE,
        };
        flash.write(target, &header.pack())?;

        // Shard image in page-sized chunks; no 4 KiB scratch buffer.
        let mut page = [0u8; PAGE];
        let data_base = target + SECTOR_HEADER_SIZE as u32;
        for chunk in 0..WEIGHT_SHARD_SIZE / PAGE {
            shard.pack_range(chunk * PAGE, &mut page);
            flash.write(data_base + (chunk * PAGE) as u32, &page)?;
        }

        // Deactivate the previous record. NOR write-in-place can only clear
        // bits, which is all this needs.
        if let Some(old) = active {
            if old != target {
                if let Ok(mut old_hdr) = self.read_header(flash, old) {
                    old_hdr.flags.remove(SectorFlags::ACTIVE);
                    flash.write(old, &old_hdr.pack())?;
                }
            }
        }

        log::trace!("persisted shard {shard_id} (write #{write_count})");
        Ok(())
    }

    /// Read the active record for a shard id. Fails unless the stored id
    /// matches and the shard CRC verifies.
    pub fn read<F: SectorFlash>(
        &self,
        flash: &mut F,
        shard_id: u8,
    ) -> Result<WeightShard, StoreError> {
        let slot = self
            .find_active(flash, shard_id)
            .ok_or(StoreError::NoValidSector)?;
        let data_base = slot + SECTOR_HEADER_SIZE as u32;

        let mut head = [0u8; shard::HEADER_SIZE];
        flash.read(data_base, &mut head)?;

        let mut shard = WeightShard::zeroed();
        shard.header.shard_id = head[0];
        shard.header.version = head[1];
        shard.header.checksum = u16::from_le_bytes([head[2], head[3]]);
        shard.header.global_epoch = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        shard.header.contributors = head[8];

        if shard.header.shard_id != shard_id {
            return Err(StoreError::WrongShard);
        }

        let mut page = [0u8; PAGE];
        let weights_base = data_base + shard::HEADER_SIZE as u32;
        let mut filled = 0usize;
        while filled < shard::WEIGHT_COUNT {
            let len = PAGE.min(shard::WEIGHT_COUNT - filled);
            flash.read(weights_base + filled as u32, &mut page[..len])?;
            for (w, &b) in shard.weights[filled..filled + len].iter_mut().zip(&page[..len]) {
                *w = b as i8;
            }
            filled += len;
        }

        if !shard.verify() {
            return Err(StoreError::Corrupt);
        }
        Ok(shard)
    }

    /// Write count of the active record, for wear monitoring. 0 when the
    /// pair holds nothing.
    pub fn wear_count<F: SectorFlash>(&self, flash: &mut F, shard_id: u8) -> u32 {
        match self.find_active(flash, shard_id) {
            Some(addr) => self
                .read_header(flash, addr)
                .map(|h| h.write_count)
                .unwrap_or(0),
            None => 0,
        }
    }
}
