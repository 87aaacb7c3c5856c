//! Mesh gossip: the vendor protocol for weight exchange.
//!
//! Shards travel as sixteen 256-byte fragments; heartbeats announce load
//! and capacity; backpressure tells overloaded neighborhoods to quiet down.
//! All state is fixed-capacity: a 16-entry neighbor table, four reassembly
//! slots, a 16-deep dedup ring. Capacity exhaustion rejects the newcomer
//! silently; the mesh retransmits, the node does not grow.

pub mod wire;

use heapless::Vec;

use crate::config::{ms_to_ticks, MESH_MSG_MAX_SIZE, NEIGHBOR_TIMEOUT_MS, WEIGHT_SHARD_SIZE};
use crate::hal::MeshTx;
use crate::shard::WeightShard;
use wire::{
    FragmentInfo, GossipHeader, HeartbeatPayload, Opcode, FRAGMENTS_PER_SHARD, FRAGMENT_INFO_SIZE,
    FRAGMENT_SIZE, HEADER_SIZE,
};

pub const MAX_NEIGHBORS: usize = 16;
pub const MAX_PENDING_FRAGMENTS: usize = 4;
const DEDUP_RING: usize = 16;
const SLOT_FREE: u8 = 0xFF;

/// What a received message means to the layer above. Heartbeats and
/// backpressure are absorbed into the neighbor table and produce nothing.
#[derive(Debug)]
pub enum RxEvent {
    /// A complete, CRC-verified shard arrived (direct or reassembled).
    Shard(WeightShard),
    /// A neighbor asked for this shard id.
    ShardRequest(u8),
}

/// One known peer, refreshed on any reception, collected after a timeout.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub addr: u16,
    /// Smoothed RSSI stored as raw + 128.
    pub rssi: u8,
    /// Load percent from the peer's last heartbeat (100 = backpressure).
    pub load: u8,
    pub last_seen_tick: u32,
    /// Bitmap of shard ids the peer has been seen carrying.
    pub held_shards: u64,
}

struct ReassemblySlot {
    shard_id: u8,
    received_mask: u16,
    last_update_tick: u32,
    buf: [u8; WEIGHT_SHARD_SIZE],
}

impl ReassemblySlot {
    const fn empty() -> Self {
        ReassemblySlot {
            shard_id: SLOT_FREE,
            received_mask: 0,
            last_update_tick: 0,
            buf: [0; WEIGHT_SHARD_SIZE],
        }
    }

    fn release(&mut self) {
        self.shard_id = SLOT_FREE;
        self.received_mask = 0;
    }
}

pub struct Gossip {
    my_addr: u16,
    seq_num: u8,
    neighbors: Vec<Neighbor, MAX_NEIGHBORS>,
    slots: [ReassemblySlot; MAX_PENDING_FRAGMENTS],
    seen: [(u16, u8); DEDUP_RING],
    seen_idx: usize,
}

impl Gossip {
    pub fn new(my_addr: u16) -> Self {
        Gossip {
            my_addr,
            seq_num: 0,
            neighbors: Vec::new(),
            slots: [
                ReassemblySlot::empty(),
                ReassemblySlot::empty(),
                ReassemblySlot::empty(),
                ReassemblySlot::empty(),
            ],
            seen: [(0, 0); DEDUP_RING],
            seen_idx: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Receive path
    // -------------------------------------------------------------------------

    /// Handle one vendor-model message.
    ///
    /// Order matters: duplicates drop silently; malformed payloads drop
    /// WITHOUT entering the dedup ring (noise must not shadow a later valid
    /// message with the same sequence number); only then is the neighbor
    /// refreshed and the opcode dispatched.
    pub fn on_receive(&mut self, data: &[u8], src: u16, rssi: i8, now: u32) -> Option<RxEvent> {
        let hdr = GossipHeader::parse(data)?;

        if self.is_duplicate(hdr.src_addr, hdr.seq_num) {
            return None;
        }

        let payload = &data[HEADER_SIZE..];
        if payload.len() < hdr.opcode.min_payload_len() {
            log::trace!("malformed {:?} from {:04x}", hdr.opcode, src);
            return None;
        }

        self.record_seen(hdr.src_addr, hdr.seq_num);
        self.touch_neighbor(src, rssi, now);

        match hdr.opcode {
            Opcode::WeightUpdate => {
                let bytes: &[u8; WEIGHT_SHARD_SIZE] =
                    payload[..WEIGHT_SHARD_SIZE].try_into().ok()?;
                let shard = WeightShard::unpack(bytes);
                if !shard.verify() {
                    log::debug!("dropping corrupt shard {} from {:04x}", shard.header.shard_id, src);
                    return None;
                }
                self.mark_held(src, shard.header.shard_id);
                Some(RxEvent::Shard(shard))
            }
            Opcode::WeightRequest => Some(RxEvent::ShardRequest(payload[0])),
            Opcode::Heartbeat => {
                let hb = HeartbeatPayload::parse(payload)?;
                self.set_neighbor_load(src, hb.load_percent);
                None
            }
            Opcode::Backpressure => {
                self.set_neighbor_load(src, 100);
                None
            }
            Opcode::ShardFragment => {
                self.mark_held(src, payload[0]);
                self.handle_fragment(payload, now).map(RxEvent::Shard)
            }
            Opcode::Ack => None,
        }
    }

    fn handle_fragment(&mut self, payload: &[u8], now: u32) -> Option<WeightShard> {
        let info = FragmentInfo::parse(payload)?;
        let data = &payload[FRAGMENT_INFO_SIZE..];

        if info.index as usize >= FRAGMENTS_PER_SHARD
            || info.total as usize > FRAGMENTS_PER_SHARD
            || info.total == 0
        {
            return None;
        }
        let offset = info.index as usize * FRAGMENT_SIZE;
        let data_len = data.len().min(FRAGMENT_SIZE);
        if offset + data_len > WEIGHT_SHARD_SIZE {
            return None;
        }

        let slot_idx = self.locate_slot(info.shard_id, now)?;
        let slot = &mut self.slots[slot_idx];
        slot.shard_id = info.shard_id;
        slot.buf[offset..offset + data_len].copy_from_slice(&data[..data_len]);
        slot.received_mask |= 1 << info.index;
        slot.last_update_tick = now;

        let complete_mask = (1u32 << info.total) - 1;
        if slot.received_mask as u32 != complete_mask {
            return None;
        }

        let shard = WeightShard::unpack(&slot.buf);
        slot.release();
        if !shard.verify() {
            log::debug!("reassembled shard {} failed CRC", shard.header.shard_id);
            return None;
        }
        Some(shard)
    }

    /// Slot for this shard id: an in-progress match, else a free slot, else
    /// the least-recently-touched slot is reclaimed. Its partial contents
    /// are discarded, never delivered.
    fn locate_slot(&mut self, shard_id: u8, now: u32) -> Option<usize> {
        if let Some(i) = self.slots.iter().position(|s| s.shard_id == shard_id) {
            return Some(i);
        }
        if let Some(i) = self.slots.iter().position(|s| s.shard_id == SLOT_FREE) {
            return Some(i);
        }
        let lru = self
            .slots
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| now.wrapping_sub(s.last_update_tick))?
            .0;
        log::trace!(
            "evicting partial reassembly of shard {} for {}",
            self.slots[lru].shard_id,
            shard_id
        );
        self.slots[lru].release();
        Some(lru)
    }

    // -------------------------------------------------------------------------
    // Neighbor table
    // -------------------------------------------------------------------------

    fn touch_neighbor(&mut self, addr: u16, rssi: i8, now: u32) {
        let unsigned = (rssi as i16 + 128) as u8;
        if let Some(n) = self.neighbors.iter_mut().find(|n| n.addr == addr) {
            // EMA keeps one noisy packet from swinging the estimate.
            n.rssi = ((n.rssi as u16 * 3 + unsigned as u16) / 4) as u8;
            n.last_seen_tick = now;
            return;
        }
        let fresh = Neighbor {
            addr,
            rssi: unsigned,
            load: 0,
            last_seen_tick: now,
            held_shards: 0,
        };
        if self.neighbors.push(fresh).is_err() {
            log::trace!("neighbor table full, ignoring {addr:04x}");
        }
    }

    fn set_neighbor_load(&mut self, addr: u16, load: u8) {
        if let Some(n) = self.neighbors.iter_mut().find(|n| n.addr == addr) {
            n.load = load;
        }
    }

    fn mark_held(&mut self, addr: u16, shard_id: u8) {
        if shard_id as usize >= crate::config::TOTAL_MODEL_SHARDS {
            return;
        }
        if let Some(n) = self.neighbors.iter_mut().find(|n| n.addr == addr) {
            n.held_shards |= 1u64 << shard_id;
        }
    }

    /// Drop neighbors unheard for the timeout window.
    pub fn gc_neighbors(&mut self, now: u32) {
        let timeout = ms_to_ticks(NEIGHBOR_TIMEOUT_MS);
        let before = self.neighbors.len();
        self.neighbors
            .retain(|n| now.wrapping_sub(n.last_seen_tick) <= timeout);
        if self.neighbors.len() != before {
            log::debug!("gc: {} stale neighbors dropped", before - self.neighbors.len());
        }
    }

    pub fn neighbor_count(&self) -> u8 {
        self.neighbors.len() as u8
    }

    pub fn neighbors(&self) -> &[Neighbor] {
        &self.neighbors
    }

    /// True when strictly more than half of tracked neighbors report load
    /// above 80.
    pub fn should_throttle(&self) -> bool {
        let overloaded = self.neighbors.iter().filter(|n| n.load > 80).count();
        2 * overloaded > self.neighbors.len()
    }

    /// Unique shards known in the neighborhood, our own included.
    pub fn shard_diversity(&self, local_ids: &[u8]) -> i8 {
        let mut map = self
            .neighbors
            .iter()
            .fold(0u64, |acc, n| acc | n.held_shards);
        for &id in local_ids {
            if (id as usize) < crate::config::TOTAL_MODEL_SHARDS {
                map |= 1u64 << id;
            }
        }
        map.count_ones().min(127) as i8
    }

    // -------------------------------------------------------------------------
    // Broadcast API
    // -------------------------------------------------------------------------

    /// Split a shard into fragments and transmit them in index order, one
    /// sequence number each.
    pub fn broadcast_shard<T: MeshTx>(&mut self, tx: &mut T, shard: &WeightShard) {
        let mut frame = [0u8; MESH_MSG_MAX_SIZE];
        for idx in 0..FRAGMENTS_PER_SHARD {
            let hdr = self.next_header(Opcode::ShardFragment, 3);
            let info = FragmentInfo {
                shard_id: shard.header.shard_id,
                index: idx as u8,
                total: FRAGMENTS_PER_SHARD as u8,
            };
            frame[..HEADER_SIZE].copy_from_slice(&hdr.pack());
            frame[HEADER_SIZE..HEADER_SIZE + FRAGMENT_INFO_SIZE].copy_from_slice(&info.pack());
            let body = HEADER_SIZE + FRAGMENT_INFO_SIZE;
            shard.pack_range(idx * FRAGMENT_SIZE, &mut frame[body..body + FRAGMENT_SIZE]);
            tx.send(&frame[..body + FRAGMENT_SIZE]);
        }
    }

    pub fn send_heartbeat<T: MeshTx>(
        &mut self,
        tx: &mut T,
        load_percent: u8,
        shards_held: u8,
        epoch: u16,
    ) {
        let payload = HeartbeatPayload {
            load_percent,
            shards_held,
            epoch,
            neighbors: self.neighbor_count(),
        };
        let hdr = self.next_header(Opcode::Heartbeat, 1);
        let mut frame = [0u8; HEADER_SIZE + wire::HEARTBEAT_SIZE];
        frame[..HEADER_SIZE].copy_from_slice(&hdr.pack());
        frame[HEADER_SIZE..].copy_from_slice(&payload.pack());
        tx.send(&frame);
    }

    pub fn request_shard<T: MeshTx>(&mut self, tx: &mut T, shard_id: u8) {
        let hdr = self.next_header(Opcode::WeightRequest, 2);
        let mut frame = [0u8; HEADER_SIZE + 1];
        frame[..HEADER_SIZE].copy_from_slice(&hdr.pack());
        frame[HEADER_SIZE] = shard_id;
        tx.send(&frame);
    }

    /// Tell the neighborhood we are overloaded.
    pub fn send_backpressure<T: MeshTx>(&mut self, tx: &mut T) {
        let hdr = self.next_header(Opcode::Backpressure, 1);
        tx.send(&hdr.pack());
    }

    fn next_header(&mut self, opcode: Opcode, ttl: u8) -> GossipHeader {
        let seq = self.seq_num;
        self.seq_num = self.seq_num.wrapping_add(1);
        GossipHeader {
            opcode,
            ttl,
            src_addr: self.my_addr,
            seq_num: seq,
            flags: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Dedup ring
    // -------------------------------------------------------------------------

    fn is_duplicate(&self, src: u16, seq: u8) -> bool {
        self.seen.iter().any(|&(s, q)| s == src && q == seq)
    }

    fn record_seen(&mut self, src: u16, seq: u8) {
        self.seen[self.seen_idx] = (src, seq);
        self.seen_idx = (self.seen_idx + 1) % DEDUP_RING;
    }
}
