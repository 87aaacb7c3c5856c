//! Virtual mesh: N lume nodes on sim platforms, frames carried by the
//! harness.
//!
//! Time is lockstep: every node's clock advances together, every
//! transmitted frame reaches every other node within the same round (the
//! real mesh relays at single-digit-millisecond latency, far inside one
//! gossip interval). Good enough to watch federated averaging converge and
//! flash wear stay level; not a radio propagation model.

use lume_core::hal::sim::SimPlatform;
use lume_core::LightNode;

pub struct VirtualMesh {
    nodes: Vec<(u16, LightNode<SimPlatform>)>,
}

impl VirtualMesh {
    /// Spin up `count` nodes with consecutive mesh addresses from 0x0001.
    pub fn new(count: usize) -> Self {
        let nodes = (0..count)
            .map(|i| {
                let addr = 0x0001 + i as u16;
                (addr, LightNode::new(SimPlatform::new(), addr))
            })
            .collect();
        VirtualMesh { nodes }
    }

    pub fn node(&self, idx: usize) -> &LightNode<SimPlatform> {
        &self.nodes[idx].1
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut LightNode<SimPlatform> {
        &mut self.nodes[idx].1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// One simulation round: advance every clock by `ms`, give every node a
    /// pair of idle windows, run the 50 Hz light poll, then flood every
    /// transmitted frame to every other node.
    pub fn round(&mut self, ms: u32) {
        for (_, node) in self.nodes.iter_mut() {
            node.platform_mut().advance_ms(ms);
            node.poll_light();
            node.platform_mut().radio_event_in_us(10_000);
            node.on_radio_idle();
            node.on_radio_idle();
        }
        self.flood();
    }

    /// Deliver all pending frames, every sender to every other node.
    pub fn flood(&mut self) {
        let mut pending: Vec<(u16, Vec<Vec<u8>>)> = Vec::new();
        for (addr, node) in self.nodes.iter_mut() {
            let frames: Vec<Vec<u8>> = node.platform_mut().sent_frames.drain(..).collect();
            if !frames.is_empty() {
                pending.push((*addr, frames));
            }
        }
        for (src, frames) in pending {
            log::trace!("flooding {} frames from {src:04x}", frames.len());
            for (addr, node) in self.nodes.iter_mut() {
                if *addr == src {
                    continue;
                }
                for frame in &frames {
                    node.on_vendor_message(frame, src, -58);
                }
            }
        }
    }

    /// Run `rounds` rounds of `ms` each.
    pub fn run(&mut self, rounds: usize, ms: u32) {
        for _ in 0..rounds {
            self.round(ms);
        }
    }
}
