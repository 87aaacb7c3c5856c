//! Wire framing for the mesh vendor protocol.
//!
//! Every message starts with a 6-byte header; fragments carry a further
//! 4-byte descriptor. All multibyte integers are little-endian and packing
//! is explicit; nothing here relies on struct layout.

/// Message header size on the wire.
pub const HEADER_SIZE: usize = 6;

/// Fragment descriptor size on the wire.
pub const FRAGMENT_INFO_SIZE: usize = 4;

/// Heartbeat payload size on the wire.
pub const HEARTBEAT_SIZE: usize = 8;

/// Bytes of shard image per fragment.
pub const FRAGMENT_SIZE: usize = 256;

/// Fragments per 4 KiB shard.
pub const FRAGMENTS_PER_SHARD: usize = crate::config::WEIGHT_SHARD_SIZE / FRAGMENT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Full shard in one message (small deployments only).
    WeightUpdate = 0xC0,
    /// Ask neighbors for a shard; payload is one shard id byte.
    WeightRequest = 0xC1,
    /// Presence and capacity announcement.
    Heartbeat = 0xC2,
    /// Sender is overloaded; mark it load 100.
    Backpressure = 0xC3,
    /// One 256-byte slice of a shard.
    ShardFragment = 0xC4,
    Ack = 0xC5,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0xC0 => Some(Opcode::WeightUpdate),
            0xC1 => Some(Opcode::WeightRequest),
            0xC2 => Some(Opcode::Heartbeat),
            0xC3 => Some(Opcode::Backpressure),
            0xC4 => Some(Opcode::ShardFragment),
            0xC5 => Some(Opcode::Ack),
            _ => None,
        }
    }

    /// Minimum payload length for this opcode; shorter is malformed noise.
    pub fn min_payload_len(self) -> usize {
        match self {
            Opcode::WeightUpdate => crate::config::WEIGHT_SHARD_SIZE,
            Opcode::WeightRequest => 1,
            Opcode::Heartbeat => HEARTBEAT_SIZE,
            Opcode::Backpressure => 0,
            Opcode::ShardFragment => FRAGMENT_INFO_SIZE,
            Opcode::Ack => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipHeader {
    pub opcode: Opcode,
    /// Mesh hops remaining; relaying is the mesh stack's business.
    pub ttl: u8,
    pub src_addr: u16,
    /// Per-sender sequence number, the dedup key.
    pub seq_num: u8,
    pub flags: u8,
}

impl GossipHeader {
    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.opcode as u8;
        out[1] = self.ttl;
        out[2..4].copy_from_slice(&self.src_addr.to_le_bytes());
        out[4] = self.seq_num;
        out[5] = self.flags;
        out
    }

    /// Parse the leading header. `None` for short buffers or unknown
    /// opcodes; both are treated as channel noise upstream.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(GossipHeader {
            opcode: Opcode::from_u8(data[0])?,
            ttl: data[1],
            src_addr: u16::from_le_bytes([data[2], data[3]]),
            seq_num: data[4],
            flags: data[5],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub shard_id: u8,
    pub index: u8,
    pub total: u8,
}

impl FragmentInfo {
    pub fn pack(&self) -> [u8; FRAGMENT_INFO_SIZE] {
        [self.shard_id, self.index, self.total, 0]
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < FRAGMENT_INFO_SIZE {
            return None;
        }
        Some(FragmentInfo {
            shard_id: data[0],
            index: data[1],
            total: data[2],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub load_percent: u8,
    pub shards_held: u8,
    pub epoch: u16,
    pub neighbors: u8,
}

impl HeartbeatPayload {
    pub fn pack(&self) -> [u8; HEARTBEAT_SIZE] {
        let mut out = [0u8; HEARTBEAT_SIZE];
        out[0] = self.load_percent;
        out[1] = self.shards_held;
        out[2..4].copy_from_slice(&self.epoch.to_le_bytes());
        out[4] = self.neighbors;
        // out[5..8] reserved
        out
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEARTBEAT_SIZE {
            return None;
        }
        Some(HeartbeatPayload {
            load_percent: data[0],
            shards_held: data[1],
            epoch: u16::from_le_bytes([data[2], data[3]]),
            neighbors: data[4],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_and_endianness() {
        let hdr = GossipHeader {
            opcode: Opcode::Heartbeat,
            ttl: 1,
            src_addr: 0x1234,
            seq_num: 99,
            flags: 0,
        };
        let bytes = hdr.pack();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(bytes[2], 0x34);
        assert_eq!(bytes[3], 0x12);
        assert_eq!(GossipHeader::parse(&bytes), Some(hdr));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = 0x42;
        assert_eq!(GossipHeader::parse(&bytes), None);
    }

    #[test]
    fn short_header_is_rejected() {
        assert_eq!(GossipHeader::parse(&[0xC2, 1, 0]), None);
    }

    #[test]
    fn fragment_info_roundtrip() {
        let info = FragmentInfo {
            shard_id: 7,
            index: 15,
            total: 16,
        };
        assert_eq!(FragmentInfo::parse(&info.pack()), Some(info));
    }

    #[test]
    fn heartbeat_roundtrip() {
        let hb = HeartbeatPayload {
            load_percent: 80,
            shards_held: 4,
            epoch: 0xBEEF,
            neighbors: 12,
        };
        let bytes = hb.pack();
        assert_eq!(bytes[2..4], [0xEF, 0xBE]);
        assert_eq!(HeartbeatPayload::parse(&bytes), Some(hb));
    }

    #[test]
    fn shard_splits_into_sixteen_fragments() {
        assert_eq!(FRAGMENTS_PER_SHARD, 16);
    }
}
